//! # Host lifecycle signals
//!
//! The concrete source of these signals (a GUI event loop, a mobile OS
//! callback, a service manager) is out of scope for this crate — only the
//! capability interface lives here, so the core tiers stay testable
//! without a real host. The host still calls each tier's own
//! `on_memory_warning`/`on_entered_background`/`on_will_terminate`; a
//! `HostSignals` registered via `set_host_signals` is the application's
//! hook, invoked by the tier alongside its own built-in reaction.

/// User-provided hook invoked by a tier when it receives the matching
/// host lifecycle signal.
///
/// Absence of a registered hook only means the application isn't notified;
/// nothing in the core requires one to be set.
pub trait HostSignals: Send + Sync {
    /// Invoked when the host reports low-memory pressure.
    fn memory_warning(&self) {}

    /// Invoked when the host process is about to leave the foreground.
    fn entered_background(&self) {}

    /// Invoked when the host process is about to terminate.
    fn will_terminate(&self) {}
}

/// A `HostSignals` implementation that does nothing; the default when an
/// application does not wire up lifecycle notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHostSignals;

impl HostSignals for NoHostSignals {}
