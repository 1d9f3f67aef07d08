//! The shared collector daemon
//!
//! Shared collections run on a dedicated thread so that the context
//! requesting one can park like every other context while the heap is
//! suspended. Requests are queued over a channel and numbered; a
//! requester may wait for its ticket to be finished.

use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam::channel::{self, Sender};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use super::trigger::{GcReason, TriggerGCType};

/// Whatever the daemon collects on behalf of
pub trait Collector: Send + Sync + 'static {
    fn collect(&self, kind: TriggerGCType, reason: GcReason);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonTask {
    Collect(TriggerGCType, GcReason),
    Terminate,
}

#[derive(Debug, Default)]
struct Tickets {
    requested: u64,
    finished: u64,
}

#[derive(Default)]
struct DaemonState {
    tickets: Mutex<Tickets>,
    done: Condvar,
}

impl DaemonState {
    fn finish(&self, ticket: u64) {
        let mut tickets = self.tickets.lock();
        tickets.finished = tickets.finished.max(ticket);
        self.done.notify_all();
    }
}

pub struct Daemon {
    sender: Sender<(u64, DaemonTask)>,
    state: Arc<DaemonState>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl Daemon {
    /// Spawn the daemon thread. It holds only a weak reference to the
    /// collector and exits once that is gone.
    pub fn start<C: Collector>(collector: Weak<C>) -> io::Result<Daemon> {
        let (sender, receiver) = channel::unbounded::<(u64, DaemonTask)>();
        let state = Arc::new(DaemonState::default());
        let thread_state = state.clone();
        let handle = thread::Builder::new()
            .name("shared-gc-daemon".to_string())
            .spawn(move || {
                for (ticket, task) in receiver.iter() {
                    match task {
                        DaemonTask::Collect(kind, reason) => {
                            match collector.upgrade() {
                                Some(collector) => {
                                    trace!("daemon running {} collection ({})", kind, reason);
                                    collector.collect(kind, reason);
                                }
                                None => {
                                    thread_state.finish(ticket);
                                    break;
                                }
                            }
                            thread_state.finish(ticket);
                        }
                        DaemonTask::Terminate => break,
                    }
                }
                debug!("shared gc daemon exiting");
            })?;
        let thread_id = handle.thread().id();
        Ok(Daemon {
            sender,
            state,
            thread: Some(handle),
            thread_id,
        })
    }

    /// Queue a collection, returning the ticket to wait on
    pub fn post_collect(&self, kind: TriggerGCType, reason: GcReason) -> u64 {
        let ticket = {
            let mut tickets = self.state.tickets.lock();
            tickets.requested += 1;
            tickets.requested
        };
        if self
            .sender
            .send((ticket, DaemonTask::Collect(kind, reason)))
            .is_err()
        {
            warn!("shared gc daemon gone, dropping {} collection", kind);
            self.state.finish(ticket);
        }
        ticket
    }

    /// Block until the collection for `ticket` (and every earlier one)
    /// has finished
    pub fn wait_gc_finished(&self, ticket: u64) {
        let mut tickets = self.state.tickets.lock();
        while tickets.finished < ticket {
            self.state.done.wait(&mut tickets);
        }
    }

    /// A collection is queued or running
    pub fn is_busy(&self) -> bool {
        let tickets = self.state.tickets.lock();
        tickets.requested > tickets.finished
    }

    pub fn is_daemon_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.sender.send((0, DaemonTask::Terminate));
        if self.is_daemon_thread() {
            // the last owner went away mid-collection; the loop exits
            // on its own
            return;
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("shared gc daemon panicked");
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        runs: AtomicUsize,
        last: Mutex<Option<TriggerGCType>>,
    }

    impl Collector for Counting {
        fn collect(&self, kind: TriggerGCType, _reason: GcReason) {
            self.runs.fetch_add(1, Ordering::AcqRel);
            *self.last.lock() = Some(kind);
        }
    }

    #[test]
    pub fn test_posted_collections_run_in_order() {
        let collector = Arc::new(Counting::default());
        let daemon = Daemon::start(Arc::downgrade(&collector)).unwrap();
        assert!(!daemon.is_daemon_thread());

        daemon.post_collect(TriggerGCType::SharedGc, GcReason::AllocationLimit);
        let ticket = daemon.post_collect(TriggerGCType::SharedFullGc, GcReason::External);
        daemon.wait_gc_finished(ticket);
        assert_eq!(collector.runs.load(Ordering::Acquire), 2);
        assert_eq!(*collector.last.lock(), Some(TriggerGCType::SharedFullGc));
        assert!(!daemon.is_busy());
    }

    #[test]
    pub fn test_daemon_outlived_by_nothing() {
        let collector = Arc::new(Counting::default());
        let daemon = Daemon::start(Arc::downgrade(&collector)).unwrap();
        drop(collector);
        let ticket = daemon.post_collect(TriggerGCType::SharedGc, GcReason::Other);
        daemon.wait_gc_finished(ticket);
        drop(daemon);
    }
}
