//! Lifecycle hooks.
//!
//! Listeners are plain synchronous closures registered per event kind and
//! called in registration order. A listener returning `Err` stops the chain
//! and the error is handed back to whoever fired the event. Only
//! `BeforeEnqueue` ([`JobError::EnqueueCancelled`]) and `BeforePerform`
//! ([`JobError::DoNotPerform`]) treat such an error as a veto.

use crate::error::{JobError, JobResult};
use crate::handler::JobHandler;
use crate::payload::JobArgs;
use parking_lot::RwLock;
use resque_core::JobId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Event kinds listeners can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Before a job is pushed. May cancel the enqueue.
    BeforeEnqueue,
    /// After a job was pushed.
    AfterEnqueue,
    /// In the worker, before the job is handed to its isolated unit.
    BeforeFork,
    /// Inside the isolated unit, before the job runs.
    AfterFork,
    /// Before `perform`. May skip the job.
    BeforePerform,
    /// After a successful `perform`.
    AfterPerform,
    /// When a job fails.
    OnFailure,
}

/// A fired event with its data.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    /// See [`EventKind::BeforeEnqueue`].
    BeforeEnqueue {
        /// Target queue.
        queue: &'a str,
        /// Job class.
        class: &'a str,
        /// Argument mapping.
        args: &'a JobArgs,
        /// Id the job will get.
        id: &'a JobId,
    },
    /// See [`EventKind::AfterEnqueue`].
    AfterEnqueue {
        /// Target queue.
        queue: &'a str,
        /// Job class.
        class: &'a str,
        /// Argument mapping.
        args: &'a JobArgs,
        /// Id of the pushed job.
        id: &'a JobId,
    },
    /// See [`EventKind::BeforeFork`].
    BeforeFork(&'a JobHandler),
    /// See [`EventKind::AfterFork`].
    AfterFork(&'a JobHandler),
    /// See [`EventKind::BeforePerform`].
    BeforePerform(&'a JobHandler),
    /// See [`EventKind::AfterPerform`].
    AfterPerform(&'a JobHandler),
    /// See [`EventKind::OnFailure`].
    OnFailure {
        /// The fault that failed the job.
        fault: &'a JobError,
        /// The failed job.
        handler: &'a JobHandler,
    },
}

impl Event<'_> {
    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::BeforeEnqueue { .. } => EventKind::BeforeEnqueue,
            Event::AfterEnqueue { .. } => EventKind::AfterEnqueue,
            Event::BeforeFork(_) => EventKind::BeforeFork,
            Event::AfterFork(_) => EventKind::AfterFork,
            Event::BeforePerform(_) => EventKind::BeforePerform,
            Event::AfterPerform(_) => EventKind::AfterPerform,
            Event::OnFailure { .. } => EventKind::OnFailure,
        }
    }

    /// The job handler the event is about, if any.
    pub fn handler(&self) -> Option<&JobHandler> {
        match self {
            Event::BeforeFork(h) | Event::AfterFork(h) | Event::BeforePerform(h) | Event::AfterPerform(h) => Some(h),
            Event::OnFailure { handler, .. } => Some(handler),
            Event::BeforeEnqueue { .. } | Event::AfterEnqueue { .. } => None,
        }
    }
}

/// Listener callback.
pub type Listener = Arc<dyn Fn(&Event<'_>) -> JobResult<()> + Send + Sync>;

/// Handle returned by [`EventBus::listen`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered listener lists per event kind.
///
/// Clones share the same listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<HashMap<EventKind, Vec<(ListenerId, Listener)>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a listener for `kind`.
    pub fn listen<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event<'_>) -> JobResult<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn stop_listening(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        for list in listeners.values_mut() {
            if let Some(pos) = list.iter().position(|(lid, _)| *lid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Removes every listener.
    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Number of listeners for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    /// Calls the listeners of the event's kind in order.
    pub fn trigger(&self, event: &Event<'_>) -> JobResult<()> {
        // Snapshot so listeners may register or remove listeners themselves.
        let listeners: Vec<Listener> = match self.listeners.read().get(&event.kind()) {
            Some(list) => list.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return Ok(()),
        };

        for listener in listeners {
            listener(event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::Map;

    fn enqueue_event<'a>(args: &'a JobArgs, id: &'a JobId) -> Event<'a> {
        Event::BeforeEnqueue {
            queue: "jobs",
            class: "Test_Job",
            args,
            id,
        }
    }

    #[test]
    fn test_listeners_run_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 1..=3 {
            let seen = seen.clone();
            bus.listen(EventKind::BeforeEnqueue, move |_| {
                seen.lock().push(n);
                Ok(())
            });
        }

        let (args, id) = (Map::new(), JobId::new());
        bus.trigger(&enqueue_event(&args, &id)).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_error_stops_chain() {
        let bus = EventBus::new();
        let reached = Arc::new(Mutex::new(false));
        bus.listen(EventKind::BeforeEnqueue, |_| Err(JobError::EnqueueCancelled));
        let flag = reached.clone();
        bus.listen(EventKind::BeforeEnqueue, move |_| {
            *flag.lock() = true;
            Ok(())
        });

        let (args, id) = (Map::new(), JobId::new());
        assert!(matches!(
            bus.trigger(&enqueue_event(&args, &id)),
            Err(JobError::EnqueueCancelled)
        ));
        assert!(!*reached.lock());
    }

    #[test]
    fn test_other_kinds_not_called() {
        let bus = EventBus::new();
        bus.listen(EventKind::AfterEnqueue, |_| Err(JobError::Internal("wrong kind".into())));
        let (args, id) = (Map::new(), JobId::new());
        assert!(bus.trigger(&enqueue_event(&args, &id)).is_ok());
    }

    #[test]
    fn test_stop_listening() {
        let bus = EventBus::new();
        let id = bus.listen(EventKind::AfterPerform, |_| Ok(()));
        assert_eq!(bus.listener_count(EventKind::AfterPerform), 1);
        assert!(bus.stop_listening(id));
        assert!(!bus.stop_listening(id));
        assert_eq!(bus.listener_count(EventKind::AfterPerform), 0);
    }
}
