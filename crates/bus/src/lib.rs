#![deny(unsafe_code)]

//! Process-local publish/subscribe bus.
//!
//! Handlers run synchronously on the emitting thread, in subscription order.
//! The handler registry is copy-on-write: every `emit` dispatches over the
//! snapshot that was current when it started, so handlers may subscribe or
//! unsubscribe from inside a dispatch without another handler being skipped
//! or invoked twice.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;

/// Routing key of a bus event, e.g. `log:append`.
pub trait Topic {
    fn topic(&self) -> &str;
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<E> {
    id: u64,
    handler: Handler<E>,
}

impl<E> Clone for Entry<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: Arc::clone(&self.handler),
        }
    }
}

type Registry<E> = HashMap<String, Vec<Entry<E>>>;

struct BusInner<E> {
    registry: ArcSwap<Registry<E>>,
    next_id: AtomicU64,
}

impl<E> BusInner<E> {
    fn remove(&self, topic: &str, id: u64) -> bool {
        let present = self
            .registry
            .load()
            .get(topic)
            .is_some_and(|entries| entries.iter().any(|entry| entry.id == id));
        if !present {
            return false;
        }

        self.registry.rcu(|current| {
            let mut next = Registry::clone(current);
            if let Some(entries) = next.get_mut(topic) {
                entries.retain(|entry| entry.id != id);
                if entries.is_empty() {
                    next.remove(topic);
                }
            }
            next
        });
        true
    }
}

/// Cheaply cloneable handle to one shared bus.
pub struct Bus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for Bus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Topic + 'static> Default for Bus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Bus<E> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry.load();
        let mut topics = registry
            .iter()
            .map(|(topic, entries)| (topic.as_str(), entries.len()))
            .collect::<Vec<_>>();
        topics.sort_unstable();
        formatter.debug_struct("Bus").field("topics", &topics).finish()
    }
}

impl<E: Topic + 'static> Bus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: ArcSwap::from_pointee(Registry::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers `handler` for `topic`.
    ///
    /// The returned [`Subscription`] removes exactly this registration; the
    /// same closure registered twice is two independent registrations.
    pub fn on<F>(&self, topic: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            id,
            handler: Arc::new(handler) as Handler<E>,
        };

        self.inner.registry.rcu(|current| {
            let mut next = Registry::clone(current);
            next.entry(topic.clone()).or_default().push(entry.clone());
            next
        });

        let weak: Weak<BusInner<E>> = Arc::downgrade(&self.inner);
        let remove_topic = topic.clone();
        Subscription {
            topic,
            id,
            remover: Box::new(move || {
                weak.upgrade()
                    .is_some_and(|inner| inner.remove(&remove_topic, id))
            }),
        }
    }

    /// Delivers `event` to every handler registered for its topic.
    pub fn emit(&self, event: E) {
        let registry = self.inner.registry.load_full();
        let Some(entries) = registry.get(event.topic()) else {
            tracing::trace!(topic = event.topic(), "no handlers registered for bus event");
            return;
        };

        tracing::trace!(
            topic = event.topic(),
            handler_count = entries.len(),
            "dispatching bus event"
        );
        for entry in entries {
            (entry.handler)(&event);
        }
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.inner
            .registry
            .load()
            .get(topic)
            .map_or(0, |entries| entries.len())
    }
}

/// Handle returned by [`Bus::on`].
///
/// Dropping it leaves the handler registered.
pub struct Subscription {
    topic: String,
    id: u64,
    remover: Box<dyn Fn() -> bool + Send + Sync>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Removes the handler. Returns `false` when it was already removed or the
    /// bus is gone, so calling this more than once is harmless.
    pub fn unsubscribe(&self) -> bool {
        (self.remover)()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TestEvent {
        Ping(u32),
        Pong,
    }

    impl Topic for TestEvent {
        fn topic(&self) -> &str {
            match self {
                Self::Ping(_) => "ping",
                Self::Pong => "pong",
            }
        }
    }

    type Recording = Box<dyn Fn(&TestEvent) + Send + Sync>;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Recording) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&log);
        let make = move |label: &str| {
            let log = Arc::clone(&shared);
            let label = label.to_string();
            Box::new(move |event: &TestEvent| {
                log.lock().unwrap().push(format!("{label}:{event:?}"));
            }) as Recording
        };
        (log, make)
    }

    #[test]
    fn emit_invokes_handlers_in_subscription_order() {
        let bus = Bus::<TestEvent>::new();
        let (log, make) = recorder();
        let _a = bus.on("ping", make("a"));
        let _b = bus.on("ping", make("b"));
        let _c = bus.on("pong", make("c"));

        bus.emit(TestEvent::Ping(7));

        assert_eq!(*log.lock().unwrap(), vec!["a:Ping(7)", "b:Ping(7)"]);
    }

    #[test]
    fn emit_without_handlers_is_a_no_op() {
        let bus = Bus::<TestEvent>::new();
        bus.emit(TestEvent::Pong);
        assert_eq!(bus.handler_count("pong"), 0);
    }

    #[test]
    fn unsubscribe_removes_only_that_registration_and_is_idempotent() {
        let bus = Bus::<TestEvent>::new();
        let counter = Arc::new(AtomicU64::new(0));
        let handler = {
            let counter = Arc::clone(&counter);
            move |_: &TestEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        };
        let first = bus.on("ping", handler.clone());
        let _second = bus.on("ping", handler);

        assert!(first.unsubscribe());
        assert!(!first.unsubscribe());
        assert_eq!(bus.handler_count("ping"), 1);

        bus.emit(TestEvent::Ping(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribing_during_dispatch_takes_effect_on_next_emit() {
        let bus = Bus::<TestEvent>::new();
        let (log, make) = recorder();
        let make = Arc::new(make);
        let late = Arc::new(Mutex::new(Vec::new()));

        let _outer = {
            let bus = bus.clone();
            let make = Arc::clone(&make);
            let late = Arc::clone(&late);
            bus.clone().on("ping", move |_| {
                let mut late = late.lock().unwrap();
                if late.is_empty() {
                    late.push(bus.on("ping", (*make)("late")));
                }
            })
        };
        let _tail = bus.on("ping", (*make)("tail"));

        bus.emit(TestEvent::Ping(1));
        assert_eq!(*log.lock().unwrap(), vec!["tail:Ping(1)"]);

        bus.emit(TestEvent::Ping(2));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["tail:Ping(1)", "tail:Ping(2)", "late:Ping(2)"]
        );
    }

    #[test]
    fn unsubscribing_a_peer_during_dispatch_does_not_skip_or_repeat() {
        let bus = Bus::<TestEvent>::new();
        let (log, make) = recorder();
        let victim_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let _first = {
            let victim_slot = Arc::clone(&victim_slot);
            let log = Arc::clone(&log);
            bus.on("ping", move |_| {
                log.lock().unwrap().push("first".to_string());
                if let Some(victim) = victim_slot.lock().unwrap().as_ref() {
                    victim.unsubscribe();
                }
            })
        };
        *victim_slot.lock().unwrap() = Some(bus.on("ping", make("victim")));
        let _last = bus.on("ping", make("last"));

        bus.emit(TestEvent::Ping(1));
        bus.emit(TestEvent::Ping(2));

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "first",
                "victim:Ping(1)",
                "last:Ping(1)",
                "first",
                "last:Ping(2)",
            ]
        );
    }

    #[test]
    fn self_unsubscribe_during_dispatch_fires_once() {
        let bus = Bus::<TestEvent>::new();
        let count = Arc::new(AtomicU64::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let subscription = {
            let count = Arc::clone(&count);
            let slot = Arc::clone(&slot);
            bus.on("pong", move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(own) = slot.lock().unwrap().as_ref() {
                    own.unsubscribe();
                }
            })
        };
        *slot.lock().unwrap() = Some(subscription);

        bus.emit(TestEvent::Pong);
        bus.emit(TestEvent::Pong);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count("pong"), 0);
    }

    #[test]
    fn subscription_outliving_bus_unsubscribes_quietly() {
        let bus = Bus::<TestEvent>::new();
        let subscription = bus.on("ping", |_| {});
        drop(bus);
        assert!(!subscription.unsubscribe());
        assert_eq!(subscription.topic(), "ping");
    }
}
