//! Named-event bus used to sequence UI flows (tutorial slides, dialogs).
//!
//! Besides plain [`EventBus::emit`], an event can be emitted *postponed*: if
//! nobody listens yet, the event is remembered and delivered to the first
//! handler registered for it. This covers the case where a component emits an
//! event before the component that reacts to it has finished mounting.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

/// Handle returned by registrations, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    once: bool,
    handler: Box<dyn FnMut() + Send>,
}

#[derive(Default)]
struct BusState {
    listeners: HashMap<String, Vec<Listener>>,
    /// Postponed events nobody has picked up yet
    requested: HashSet<String>,
    /// Listeners taken out by an emit in progress
    running: HashSet<ListenerId>,
    /// Running listeners unregistered before their emit finished
    cancelled: HashSet<ListenerId>,
    next_id: u64,
}

#[derive(Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `handler` on every emission of `event`
    pub fn on(&self, event: &str, handler: impl FnMut() + Send + 'static) -> ListenerId {
        self.register(event, false, Box::new(handler))
    }

    /// Call `handler` on the next emission of `event` only
    pub fn once(&self, event: &str, handler: impl FnOnce() + Send + 'static) -> ListenerId {
        let mut handler = Some(handler);

        self.register(
            event,
            true,
            Box::new(move || {
                if let Some(handler) = handler.take() {
                    handler();
                }
            }),
        )
    }

    /// Resolves on the next emission of `event`
    pub fn wait_for(&self, event: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();

        self.once(event, move || {
            let _ = tx.send(());
        });

        rx
    }

    pub fn off(&self, id: ListenerId) {
        let mut state = self.state.lock();

        for listeners in state.listeners.values_mut() {
            listeners.retain(|l| l.id != id);
        }

        if state.running.contains(&id) {
            state.cancelled.insert(id);
        }
    }

    /// Run every handler registered for `event`; returns how many ran
    pub fn emit(&self, event: &str) -> usize {
        trace!("[ctrl] emit {}", event);

        // Handlers run without the lock held, so they may use the bus
        let mut running = {
            let mut state = self.state.lock();
            let Some(listeners) = state.listeners.remove(event) else {
                return 0;
            };
            state.running.extend(listeners.iter().map(|l| l.id));
            listeners
        };

        let mut count = 0;
        for listener in running.iter_mut() {
            if self.state.lock().cancelled.contains(&listener.id) {
                continue;
            }
            (listener.handler)();
            count += 1;
        }

        let mut state = self.state.lock();
        running.retain(|l| {
            state.running.remove(&l.id);
            let cancelled = state.cancelled.remove(&l.id);
            !l.once && !cancelled
        });

        let entry = state.listeners.entry(event.to_string()).or_default();

        // Keep registration order: survivors first, then whatever handlers
        // registered while we were running
        running.append(entry);
        *entry = running;

        if entry.is_empty() {
            state.listeners.remove(event);
        }

        count
    }

    /// Like [`EventBus::emit`], but if no handler is registered the event is
    /// kept and handed to the first handler that registers for it.
    ///
    /// Postponing the same event repeatedly before anyone listens delivers it
    /// once.
    pub fn emit_postponed(&self, event: &str) {
        if self.emit(event) == 0 {
            trace!("[ctrl] postponing {}", event);
            self.state.lock().requested.insert(event.to_string());
        }
    }

    pub fn is_requested(&self, event: &str) -> bool {
        self.state.lock().requested.contains(event)
    }

    fn register(&self, event: &str, once: bool, mut handler: Box<dyn FnMut() + Send>) -> ListenerId {
        let (id, requested) = {
            let mut state = self.state.lock();
            state.next_id += 1;
            (ListenerId(state.next_id), state.requested.remove(event))
        };

        trace!("[ctrl] on {} (once: {}, requested: {})", event, once, requested);

        if requested {
            handler();

            if once {
                return id;
            }
        }

        self.state
            .lock()
            .listeners
            .entry(event.to_string())
            .or_default()
            .push(Listener { id, once, handler });

        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_on_and_once() {
        let bus = EventBus::new();
        let (always, on_handler) = counter();
        let (just_once, mut once_handler) = counter();

        bus.on("tick", on_handler);
        bus.once("tick", move || once_handler());

        assert_eq!(bus.emit("tick"), 2);
        assert_eq!(bus.emit("tick"), 1);

        assert_eq!(always.load(Ordering::SeqCst), 2);
        assert_eq!(just_once.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emit_without_listeners_is_lost() {
        let bus = EventBus::new();
        assert_eq!(bus.emit("tick"), 0);

        let (count, handler) = counter();
        bus.on("tick", handler);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_postponed_delivered_to_late_listener_once() {
        let bus = EventBus::new();

        bus.emit_postponed("tutorial.before-slide");
        bus.emit_postponed("tutorial.before-slide");
        assert!(bus.is_requested("tutorial.before-slide"));

        let (first, handler) = counter();
        bus.on("tutorial.before-slide", handler);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert!(!bus.is_requested("tutorial.before-slide"));

        // The request was consumed by the first registration
        let (second, handler) = counter();
        bus.on("tutorial.before-slide", handler);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        // `on` handlers stay registered after the immediate delivery
        bus.emit("tutorial.before-slide");
        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_postponed_with_listener_emits_now() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        bus.on("ready", handler);

        bus.emit_postponed("ready");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!bus.is_requested("ready"));
    }

    #[test]
    fn test_postponed_is_per_event() {
        let bus = EventBus::new();
        bus.emit_postponed("a");

        let (count, handler) = counter();
        bus.on("b", handler);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(bus.is_requested("a"));
    }

    #[test]
    fn test_off() {
        let bus = EventBus::new();
        let (count, handler) = counter();

        let id = bus.on("tick", handler);
        bus.off(id);

        assert_eq!(bus.emit("tick"), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_may_register_during_emit() {
        let bus = Arc::new(EventBus::new());
        let (count, handler) = counter();
        let mut handler = Some(handler);

        let inner = bus.clone();
        bus.once("outer", move || {
            if let Some(handler) = handler.take() {
                inner.on("outer", handler);
            }
        });

        assert_eq!(bus.emit("outer"), 1);
        assert_eq!(bus.emit("outer"), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_unregister_itself() {
        let bus = Arc::new(EventBus::new());
        let (count, mut handler) = counter();
        let own_id = Arc::new(Mutex::new(None));

        let inner = bus.clone();
        let slot = own_id.clone();
        let id = bus.on("tick", move || {
            handler();
            if let Some(id) = *slot.lock() {
                inner.off(id);
            }
        });
        *own_id.lock() = Some(id);

        assert_eq!(bus.emit("tick"), 1);
        assert_eq!(bus.emit("tick"), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_unregister_a_later_sibling() {
        let bus = Arc::new(EventBus::new());
        let (count, handler) = counter();
        let victim = Arc::new(Mutex::new(None));

        let inner = bus.clone();
        let slot = victim.clone();
        bus.on("tick", move || {
            if let Some(id) = slot.lock().take() {
                inner.off(id);
            }
        });
        *victim.lock() = Some(bus.on("tick", handler));

        assert_eq!(bus.emit("tick"), 1);
        assert_eq!(bus.emit("tick"), 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_for() {
        let bus = EventBus::new();
        let mut waiter = tokio_test::task::spawn(bus.wait_for("done"));
        tokio_test::assert_pending!(waiter.poll());

        bus.emit("done");
        assert!(waiter.is_woken());
        tokio_test::assert_ready_ok!(waiter.poll());

        // Already-postponed events resolve immediately
        bus.emit_postponed("later");
        let mut later = tokio_test::task::spawn(bus.wait_for("later"));
        tokio_test::assert_ready_ok!(later.poll());
    }
}
