//! Concurrent worker pool backing the disk tier's completion-callback
//! API. Unlike the memory tier's single-threaded release worker, several
//! blocking disk operations can legitimately run at once, so this pool
//! runs a small fixed number of threads pulling from one shared queue.

use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send>;

const WORKER_COUNT: usize = 4;

pub(crate) struct WorkerPool {
    sender: mpsc::Sender<Job>,
    _handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..WORKER_COUNT)
            .map(|i| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("kvcache-disk-worker-{i}"))
                    .spawn(move || loop {
                        let job = {
                            let guard = receiver.lock().expect("worker queue poisoned");
                            guard.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    })
                    .expect("failed to spawn kvcache-disk worker thread")
            })
            .collect();
        WorkerPool {
            sender,
            _handles: handles,
        }
    }

    pub fn execute(&self, job: Job) {
        let _ = self.sender.send(job);
    }
}
