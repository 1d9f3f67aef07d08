//! Execution contexts and the suspend barrier
//!
//! Every context attached to a shared heap is registered here. A
//! context is *parked* unless it is inside a running scope; parked
//! contexts never touch the heap, so they count as already suspended.
//! [`ContextRegistry::suspend_all`] raises the poll flag and waits
//! until every other context has parked, either by leaving its running
//! scopes or by reaching a safepoint. Until the matching
//! [`ContextRegistry::resume_all`], no context can enter a running
//! scope again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::mark::Tracer;
use super::tlab::ThreadLocalAllocationBuffer;

pub type ContextId = u64;

struct ContextEntry {
    /// Depth of nested running scopes; zero when parked
    running: usize,
    tracer: Option<Arc<dyn Tracer>>,
    tlab: Arc<Mutex<ThreadLocalAllocationBuffer>>,
}

struct Contexts {
    entries: BTreeMap<ContextId, ContextEntry>,
    next_id: ContextId,
    /// Outstanding suspension requests
    suspend_count: usize,
}

pub struct ContextRegistry {
    contexts: Mutex<Contexts>,
    changed: Condvar,
    /// Cheap poll flag for safepoints
    suspend_requested: AtomicBool,
}

impl Default for ContextRegistry {
    fn default() -> Self {
        ContextRegistry {
            contexts: Mutex::new(Contexts {
                entries: BTreeMap::new(),
                next_id: 1,
                suspend_count: 0,
            }),
            changed: Condvar::new(),
            suspend_requested: AtomicBool::new(false),
        }
    }
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new, parked context with its allocation buffer
    pub fn register(&self, tlab_size: usize) -> (ContextId, Arc<Mutex<ThreadLocalAllocationBuffer>>) {
        let tlab = Arc::new(Mutex::new(ThreadLocalAllocationBuffer::new(tlab_size)));
        let mut contexts = self.contexts.lock();
        let id = contexts.next_id;
        contexts.next_id += 1;
        contexts.entries.insert(
            id,
            ContextEntry {
                running: 0,
                tracer: None,
                tlab: tlab.clone(),
            },
        );
        debug!("context {} registered, {} attached", id, contexts.entries.len());
        (id, tlab)
    }

    /// Remove a context, returning its allocation buffer
    pub fn unregister(&self, id: ContextId) -> Option<Arc<Mutex<ThreadLocalAllocationBuffer>>> {
        let mut contexts = self.contexts.lock();
        let entry = contexts.entries.remove(&id)?;
        debug!("context {} unregistered, {} attached", id, contexts.entries.len());
        self.changed.notify_all();
        Some(entry.tlab)
    }

    pub fn set_tracer(&self, id: ContextId, tracer: Option<Arc<dyn Tracer>>) {
        if let Some(entry) = self.contexts.lock().entries.get_mut(&id) {
            entry.tracer = tracer;
        }
    }

    /// Root sources of every context
    pub fn tracers(&self) -> Vec<Arc<dyn Tracer>> {
        self.contexts
            .lock()
            .entries
            .values()
            .filter_map(|e| e.tracer.clone())
            .collect()
    }

    /// Allocation buffers of every context
    pub fn tlabs(&self) -> Vec<Arc<Mutex<ThreadLocalAllocationBuffer>>> {
        self.contexts
            .lock()
            .entries
            .values()
            .map(|e| e.tlab.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contexts currently inside a running scope
    pub fn running(&self) -> usize {
        self.contexts
            .lock()
            .entries
            .values()
            .filter(|e| e.running > 0)
            .count()
    }

    pub fn is_suspend_requested(&self) -> bool {
        self.suspend_requested.load(Ordering::Acquire)
    }

    fn wait_while_suspended(&self, contexts: &mut MutexGuard<'_, Contexts>) {
        while contexts.suspend_count > 0 {
            self.changed.wait(contexts);
        }
    }

    /// Park `id`, run `f` and restore its previous running depth once
    /// no suspension is in progress
    fn park_during<R>(
        &self,
        contexts: &mut MutexGuard<'_, Contexts>,
        id: ContextId,
        f: impl FnOnce(&mut MutexGuard<'_, Contexts>) -> R,
    ) -> R {
        let saved = match contexts.entries.get_mut(&id) {
            Some(entry) => std::mem::replace(&mut entry.running, 0),
            None => 0,
        };
        self.changed.notify_all();
        let result = f(contexts);
        if saved > 0 {
            self.wait_while_suspended(contexts);
        }
        if let Some(entry) = contexts.entries.get_mut(&id) {
            entry.running = saved;
        }
        result
    }

    /// Mark the context running, first waiting out any suspension
    pub fn enter_running(&self, id: ContextId) {
        let mut contexts = self.contexts.lock();
        let depth = contexts.entries.get(&id).map(|e| e.running).unwrap_or(0);
        if depth == 0 {
            self.wait_while_suspended(&mut contexts);
        }
        if let Some(entry) = contexts.entries.get_mut(&id) {
            entry.running += 1;
        }
    }

    pub fn leave_running(&self, id: ContextId) {
        let mut contexts = self.contexts.lock();
        if let Some(entry) = contexts.entries.get_mut(&id) {
            debug_assert!(entry.running > 0, "context {} not running", id);
            entry.running = entry.running.saturating_sub(1);
            if entry.running == 0 {
                self.changed.notify_all();
            }
        }
    }

    /// Poll point: park until resumed if a suspension was requested
    pub fn safepoint(&self, id: ContextId) {
        if !self.is_suspend_requested() {
            return;
        }
        let mut contexts = self.contexts.lock();
        trace!("context {} parking at safepoint", id);
        self.park_during(&mut contexts, id, |_| ());
    }

    /// Run `f` with the context parked, e.g. while it waits on another
    /// thread that may need to suspend it
    pub fn parked<R>(&self, id: ContextId, f: impl FnOnce() -> R) -> R {
        let saved = {
            let mut contexts = self.contexts.lock();
            let saved = match contexts.entries.get_mut(&id) {
                Some(entry) => std::mem::replace(&mut entry.running, 0),
                None => 0,
            };
            self.changed.notify_all();
            saved
        };
        let result = f();
        let mut contexts = self.contexts.lock();
        if saved > 0 {
            self.wait_while_suspended(&mut contexts);
        }
        if let Some(entry) = contexts.entries.get_mut(&id) {
            entry.running = saved;
        }
        result
    }

    /// Stop every context other than `initiator` at its next safepoint
    /// and wait until all have parked
    pub fn suspend_all(&self, initiator: Option<ContextId>) {
        let mut contexts = self.contexts.lock();
        if let Some(id) = initiator {
            if contexts.suspend_count > 0 {
                self.park_during(&mut contexts, id, |contexts| self.wait_while_suspended(contexts));
            }
        }
        contexts.suspend_count += 1;
        self.suspend_requested.store(true, Ordering::Release);
        loop {
            let busy = contexts
                .entries
                .iter()
                .filter(|(id, e)| Some(**id) != initiator && e.running > 0)
                .count();
            if busy == 0 {
                break;
            }
            trace!("waiting for {} running contexts to park", busy);
            self.changed.wait(&mut contexts);
        }
        debug!("all contexts suspended");
    }

    pub fn resume_all(&self) {
        let mut contexts = self.contexts.lock();
        debug_assert!(contexts.suspend_count > 0, "resume without suspend");
        contexts.suspend_count = contexts.suspend_count.saturating_sub(1);
        if contexts.suspend_count == 0 {
            self.suspend_requested.store(false, Ordering::Release);
            debug!("contexts resumed");
        }
        self.changed.notify_all();
    }
}

/// A context inside a running scope, parked again on drop
///
/// A detached scope (for a heap with no shared heap) does nothing.
pub struct RunningScope {
    link: Option<(Arc<ContextRegistry>, ContextId)>,
}

impl RunningScope {
    pub fn enter(registry: Arc<ContextRegistry>, id: ContextId) -> Self {
        registry.enter_running(id);
        RunningScope {
            link: Some((registry, id)),
        }
    }

    pub fn detached() -> Self {
        RunningScope { link: None }
    }

    /// Poll for suspension from within the scope
    pub fn safepoint(&self) {
        if let Some((registry, id)) = &self.link {
            registry.safepoint(*id);
        }
    }
}

impl Drop for RunningScope {
    fn drop(&mut self) {
        if let Some((registry, id)) = &self.link {
            registry.leave_running(*id);
        }
    }
}
