//! Task execution: a fixed pool of long-lived workers fed through a bounded
//! queue, or inline execution on the caller's thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Result, anyhow};
use crossbeam_channel::{Sender, bounded};
use tracing::{debug, error};

/// One unit of work.
pub type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Failures caught at the task boundary.
struct Failures {
    propagate: bool,
    count: AtomicUsize,
    first: Mutex<Option<anyhow::Error>>,
}

impl Failures {
    fn new(propagate: bool) -> Self {
        Self {
            propagate,
            count: AtomicUsize::new(0),
            first: Mutex::new(None),
        }
    }

    fn run(&self, task: Task) {
        let failure = match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(payload) => anyhow!("task panicked: {}", panic_message(payload.as_ref())),
        };

        error!("{:#}", failure);
        self.count.fetch_add(1, Ordering::Relaxed);

        if self.propagate {
            let mut first = self.first.lock().unwrap_or_else(PoisonError::into_inner);
            first.get_or_insert(failure);
        }
    }

    fn take_first(&self) -> Result<()> {
        let first = self
            .first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[derive(Default)]
struct Progress {
    pushed: usize,
    completed: usize,
}

struct Shared {
    progress: Mutex<Progress>,
    drained: Condvar,
    failures: Failures,
}

impl Shared {
    fn complete(&self) {
        let mut progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner);
        progress.completed += 1;
        if progress.completed == progress.pushed {
            self.drained.notify_all();
        }
    }
}

/// Fixed pool of workers consuming a bounded queue.
///
/// [`push`](Self::push) blocks while the queue is full. Workers stay alive
/// across [`wait`](Self::wait) calls and are joined on drop.
pub struct MultiThreadManager {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    capacity: usize,
}

impl MultiThreadManager {
    /// `capacity_per_thread × threads` tasks may wait in the queue.
    pub fn new(capacity_per_thread: usize, threads: usize, propagate_errors: bool) -> Result<Self> {
        let threads = threads.max(1);
        let capacity = capacity_per_thread.max(1) * threads;
        let (sender, receiver) = bounded::<Task>(capacity);

        let shared = Arc::new(Shared {
            progress: Mutex::new(Progress::default()),
            drained: Condvar::new(),
            failures: Failures::new(propagate_errors),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver = receiver.clone();
            let shared = shared.clone();

            let worker = thread::Builder::new()
                .name(format!("batch_worker_{}", i))
                .spawn(move || {
                    for task in receiver.iter() {
                        shared.failures.run(task);
                        shared.complete();
                    }
                })?;
            workers.push(worker);
        }

        debug!("Started {} workers, queue capacity {}", threads, capacity);

        Ok(Self {
            sender: Some(sender),
            workers,
            shared,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task, blocking while the queue is full.
    pub fn push(&self, task: Task) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("worker pool is shut down"))?;

        self.shared
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pushed += 1;

        if sender.send(task).is_err() {
            // Nobody will run it; keep the counters balanced for wait()
            self.shared.complete();
            return Err(anyhow!("all workers have exited"));
        }

        Ok(())
    }

    /// Block until every pushed task has completed.
    ///
    /// With error propagation enabled, returns the first task failure since
    /// the previous `wait`.
    pub fn wait(&self) -> Result<()> {
        let progress = self
            .shared
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        drop(
            self.shared
                .drained
                .wait_while(progress, |p| p.completed < p.pushed)
                .unwrap_or_else(PoisonError::into_inner),
        );

        self.shared.failures.take_first()
    }

    /// Tasks that failed or panicked so far.
    pub fn num_failures(&self) -> usize {
        self.shared.failures.count.load(Ordering::Relaxed)
    }
}

impl Drop for MultiThreadManager {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Batch worker terminated abnormally");
            }
        }
    }
}

/// Runs every task on the caller's thread as it is pushed.
pub struct InlineManager {
    failures: Failures,
}

impl InlineManager {
    pub fn new(propagate_errors: bool) -> Self {
        Self {
            failures: Failures::new(propagate_errors),
        }
    }

    pub fn push(&self, task: Task) -> Result<()> {
        self.failures.run(task);
        Ok(())
    }

    pub fn wait(&self) -> Result<()> {
        self.failures.take_first()
    }

    pub fn num_failures(&self) -> usize {
        self.failures.count.load(Ordering::Relaxed)
    }
}

/// Either execution strategy, chosen from the queue capacity.
pub enum WorkerManager {
    Threaded(MultiThreadManager),
    Inline(InlineManager),
}

impl WorkerManager {
    /// A capacity of 0 runs tasks inline.
    pub fn new(capacity_per_thread: usize, threads: usize, propagate_errors: bool) -> Result<Self> {
        if capacity_per_thread == 0 {
            return Ok(Self::Inline(InlineManager::new(propagate_errors)));
        }

        Ok(Self::Threaded(MultiThreadManager::new(
            capacity_per_thread,
            threads,
            propagate_errors,
        )?))
    }

    pub fn is_threaded(&self) -> bool {
        matches!(self, Self::Threaded(_))
    }

    pub fn push(&self, task: Task) -> Result<()> {
        match self {
            Self::Threaded(manager) => manager.push(task),
            Self::Inline(manager) => manager.push(task),
        }
    }

    pub fn wait(&self) -> Result<()> {
        match self {
            Self::Threaded(manager) => manager.wait(),
            Self::Inline(manager) => manager.wait(),
        }
    }

    pub fn num_failures(&self) -> usize {
        match self {
            Self::Threaded(manager) => manager.num_failures(),
            Self::Inline(manager) => manager.num_failures(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn test_wait_counts_every_task() {
        let manager = MultiThreadManager::new(2, 4, true).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let done = done.clone();
            manager
                .push(Box::new(move || {
                    thread::sleep(Duration::from_micros(50));
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .unwrap();
        }

        manager.wait().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 100);

        // Workers survive a wait
        let done2 = done.clone();
        manager
            .push(Box::new(move || {
                done2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        manager.wait().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 101);
    }

    #[test]
    fn test_push_blocks_while_full() {
        let manager = MultiThreadManager::new(1, 1, true).unwrap();
        assert_eq!(manager.capacity(), 1);

        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);

        // Occupies the only worker
        manager
            .push(Box::new(move || {
                started_tx.send(())?;
                gate_rx.recv()?;
                Ok(())
            }))
            .unwrap();
        started_rx.recv().unwrap();

        // Fills the queue
        manager.push(Box::new(|| Ok(()))).unwrap();

        let third_pushed = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                manager.push(Box::new(|| Ok(()))).unwrap();
                third_pushed.store(true, Ordering::SeqCst);
            });

            thread::sleep(Duration::from_millis(100));
            assert!(!third_pushed.load(Ordering::SeqCst));

            gate_tx.send(()).unwrap();
        });

        assert!(third_pushed.load(Ordering::SeqCst));
        manager.wait().unwrap();
    }

    #[test]
    fn test_failures_are_caught() {
        let manager = MultiThreadManager::new(1, 2, true).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        manager.push(Box::new(|| bail!("broken input"))).unwrap();
        manager.push(Box::new(|| panic!("bad state"))).unwrap();
        for _ in 0..5 {
            let done = done.clone();
            manager
                .push(Box::new(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }))
                .unwrap();
        }

        assert!(manager.wait().is_err());
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(manager.num_failures(), 2);

        // Reported once
        assert!(manager.wait().is_ok());
    }

    #[test]
    fn test_inline_manager() {
        let manager = WorkerManager::new(0, 8, false).unwrap();
        assert!(!manager.is_threaded());

        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let slot = ran_on.clone();
        manager
            .push(Box::new(move || {
                *slot.lock().unwrap() = Some(thread::current().id());
                Ok(())
            }))
            .unwrap();
        assert_eq!(*ran_on.lock().unwrap(), Some(caller));

        manager.push(Box::new(|| bail!("ignored"))).unwrap();
        assert!(manager.wait().is_ok());
        assert_eq!(manager.num_failures(), 1);
    }
}
