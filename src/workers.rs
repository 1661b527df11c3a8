//! Fixed-size worker thread pool for application callbacks.
//!
//! `submit` never blocks the event loop: jobs go onto an unbounded channel
//! and run on the next free worker. Dropping the pool closes the channel
//! and joins the workers after they drain it.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> std::io::Result<WorkerPool> {
        let size = size.max(1);
        let (tx, rx) = channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(size);
        for id in 0..size {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker_loop(id, rx))?;
            handles.push(handle);
        }

        debug!(workers = size, "worker pool started");
        Ok(WorkerPool {
            tx: Some(tx),
            handles,
        })
    }

    /// Queue a job; safe to call from the event loop.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(tx) = &self.tx {
            if tx.send(Box::new(job)).is_err() {
                error!("worker pool channel closed, dropping job");
            }
        }
    }
}

fn worker_loop(id: usize, rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => {
                debug!(worker = id, "worker shutting down");
                break;
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx.take();
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            // The pool can be dropped from one of its own workers when
            // that worker holds the last reference to the runtime; a
            // thread cannot join itself.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}
