//! # Release-off-the-critical-path
//!
//! Dropping a large value can be expensive (deallocation, destructors).
//! The memory tier wants that cost out of the lock, so removed nodes are
//! handed to a deferred-release buffer and shipped to a worker whose only
//! job is to drop them, per `release_asynchronously` /
//! `release_on_main_thread`.

use std::sync::mpsc;
use std::thread::JoinHandle;

/// A single dedicated background worker that exists only to drop whatever
/// closures it is handed. Mirrors the blob store's dedicated trash-drain
/// worker: one thread, one channel, no shared state to race on.
pub(crate) struct ReleaseWorker {
    sender: mpsc::Sender<Box<dyn FnOnce() + Send>>,
    _handle: JoinHandle<()>,
}

impl ReleaseWorker {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Box<dyn FnOnce() + Send>>();
        let handle = std::thread::Builder::new()
            .name("kvcache-mem-release".into())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .expect("spawn release worker");

        ReleaseWorker {
            sender,
            _handle: handle,
        }
    }

    pub fn dispatch(&self, job: Box<dyn FnOnce() + Send>) {
        // The worker thread only stops when this sender (and the tier
        // holding it) is dropped, so send failures are not a normal path.
        let _ = self.sender.send(job);
    }
}

/// Where to run a release job: a caller-supplied "main thread" dispatcher,
/// a background worker, or inline (synchronously, in the caller's lock-free
/// critical section).
pub(crate) enum ReleaseTarget {
    Inline,
    Background,
    MainThread,
}

pub(crate) fn pick_target(release_asynchronously: bool, release_on_main_thread: bool) -> ReleaseTarget {
    if !release_asynchronously {
        ReleaseTarget::Inline
    } else if release_on_main_thread {
        ReleaseTarget::MainThread
    } else {
        ReleaseTarget::Background
    }
}
