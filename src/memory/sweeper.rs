//! Background sweeper workers
//!
//! A fixed pool of threads takes sweep jobs from a channel. A job is
//! a space's sweep queues; every worker that receives it claims and
//! sweeps regions until the queue is empty, posting results back for
//! the owning space to merge.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use log::{debug, trace, warn};

use super::space::sparse::SweepQueues;

pub struct SweeperPool {
    sender: Option<Sender<Arc<SweepQueues>>>,
    workers: Vec<JoinHandle<()>>,
}

impl SweeperPool {
    /// Start `threads` workers. With none, posting is refused and
    /// callers sweep on their own thread.
    pub fn new(threads: usize) -> Self {
        if threads == 0 {
            return SweeperPool {
                sender: None,
                workers: Vec::new(),
            };
        }

        let (sender, receiver) = channel::unbounded::<Arc<SweepQueues>>();
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("heap-sweeper-{}", index))
                .spawn(move || {
                    for queues in receiver.iter() {
                        let swept = queues.sweep_all();
                        trace!("{}: {} regions swept in background", queues.kind(), swept);
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!("could not start sweeper thread {}: {}", index, e),
            }
        }
        debug!("{} sweeper threads started", workers.len());

        SweeperPool {
            sender: if workers.is_empty() { None } else { Some(sender) },
            workers,
        }
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Hand sweep work to every worker. False if there are no workers
    /// and the caller must sweep itself.
    pub fn post(&self, queues: &Arc<SweepQueues>) -> bool {
        let sender = match &self.sender {
            Some(sender) => sender,
            None => return false,
        };
        for _ in 0..self.workers.len() {
            if sender.send(queues.clone()).is_err() {
                return false;
            }
        }
        true
    }
}

impl Drop for SweeperPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("sweeper thread panicked");
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::memory::space::sparse::tests::{keep, object, space};
    use crate::memory::space::sparse::SweepState;
    use crate::memory::space::{Space, SpaceKind};

    #[test]
    pub fn test_background_workers_sweep_every_region() {
        let pool = SweeperPool::new(2);
        assert_eq!(pool.threads(), 2);

        let mut s = space(SpaceKind::Old, 16 * 0x1_0000);
        let mut kept = Vec::new();
        for _ in 0..6 {
            s.expand();
            let addr = object(&mut s, 64);
            keep(&s, addr, 64);
            kept.push(addr);
        }
        s.prepare_sweeping();
        assert!(pool.post(s.sweep_queues()));

        s.finish_sweeping();
        assert_eq!(s.sweep_state(), SweepState::Swept);
        assert!(s.regions().iter().all(|r| r.is_swept()));
        assert_eq!(s.live_size(), 6 * 64);
        assert_eq!(s.available(), 6 * (0x1_0000 - 64));
    }

    #[test]
    pub fn test_without_workers_posting_is_refused() {
        let pool = SweeperPool::new(0);
        let s = space(SpaceKind::Old, 0x1_0000);
        assert!(!pool.post(s.sweep_queues()));
    }
}
