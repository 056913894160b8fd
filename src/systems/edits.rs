use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;

/// Serializes edit submissions onto one worker thread that owns the world
/// state `W` (typically the node and color pools). One job runs to
/// completion before the next starts, so root transitions observed by the
/// submitter are sequential and GC never overlaps an edit. Parallelism
/// happens inside a job, on the worker pool the job borrows.
pub struct EditQueue<W> {
    handle: Option<JoinHandle<W>>,
    queue: Arc<SegQueue<Job<W>>>,
    is_running: Arc<AtomicBool>,
}

type Job<W> = Box<dyn FnOnce(&mut W) + Send>;

/// Pending result of a submitted job.
pub struct Ticket<R> {
    receiver: Receiver<thread::Result<R>>,
}

impl<R> Ticket<R> {
    /// Blocks until the job ran. Re-raises a panic from the job on the
    /// caller's side.
    pub fn wait(self) -> R {
        match self.receiver.recv().expect("edit worker dropped the result") {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

impl<W: Send + 'static> EditQueue<W> {
    pub fn new(world: W) -> EditQueue<W> {
        let queue: Arc<SegQueue<Job<W>>> = Arc::new(SegQueue::new());
        let is_running = Arc::new(AtomicBool::new(true));

        let handle = {
            let queue = queue.clone();
            let is_running = is_running.clone();
            thread::spawn(move || {
                let mut world = world;
                loop {
                    match queue.pop() {
                        Some(job) => job(&mut world),
                        None if is_running.load(Ordering::Relaxed) => thread::park(),
                        None => break,
                    }
                }
                world
            })
        };

        EditQueue {
            handle: Some(handle),
            queue,
            is_running,
        }
    }

    /// Enqueues a job and returns a ticket for its result. Jobs run in
    /// submission order; a panicking job is isolated to its ticket.
    pub fn submit<R, F>(&self, job: F) -> Ticket<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut W) -> R + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        self.queue.push(Box::new(move |world: &mut W| {
            let result = panic::catch_unwind(AssertUnwindSafe(|| job(world)));
            _ = sender.send(result);
        }));
        if let Some(handle) = &self.handle {
            handle.thread().unpark();
        }
        Ticket { receiver }
    }

    /// Drains remaining jobs, stops the worker and hands the world back.
    pub fn stop(mut self) -> W {
        self.is_running.store(false, Ordering::Relaxed);
        let handle = self.handle.take().expect("queue already stopped");
        handle.thread().unpark();
        handle.join().expect("edit worker panicked outside a job")
    }
}

impl<W> Drop for EditQueue<W> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.is_running.store(false, Ordering::Relaxed);
            handle.thread().unpark();
            _ = handle.join();
        }
    }
}
