//! [`EventBus`]: ordered, failure-isolated dispatch of lifecycle events.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{error, warn};

use super::context::{LifecycleEvent, RequestContext, ResponseContext};

/// A handler for lifecycle events.
///
/// Errors and panics raised here are caught by the bus and logged; they never
/// reach the request path or other subscribers.
pub trait Subscriber: Send + Sync + 'static {
    fn on_event(&self, event: &LifecycleEvent<'_>) -> anyhow::Result<()>;

    /// Label used in diagnostics when this subscriber fails.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F> Subscriber for F
where
    F: Fn(&LifecycleEvent<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_event(&self, event: &LifecycleEvent<'_>) -> anyhow::Result<()> {
        self(event)
    }
}

type SubscriberTable = HashMap<String, Vec<Arc<dyn Subscriber>>>;

/// Outcome of one [`EventBus::emit`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub delivered: usize,
    pub failed: usize,
}

/// Per-server table of subscribers keyed by event name.
///
/// Registration swaps in a new copy of the table, so an `emit` running
/// concurrently always iterates one consistent snapshot and never holds a
/// lock while subscribers run.
#[derive(Clone, Default)]
pub struct EventBus {
    table: Arc<ArcSwap<SubscriberTable>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` for `event`. Subscribers of one event run in
    /// registration order.
    pub fn on(&self, event: impl Into<String>, subscriber: impl Subscriber) {
        self.on_shared(event, Arc::new(subscriber));
    }

    /// Like [`EventBus::on`], for a subscriber the caller keeps a handle to.
    pub fn on_shared(&self, event: impl Into<String>, subscriber: Arc<dyn Subscriber>) {
        let event = event.into();
        self.table.rcu(|current| {
            let mut next = SubscriberTable::clone(current);
            next.entry(event.clone())
                .or_default()
                .push(Arc::clone(&subscriber));
            next
        });
    }

    /// Number of subscribers currently registered for `event`.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.table.load().get(event).map_or(0, Vec::len)
    }

    /// Dispatch `event` synchronously to every subscriber registered for it.
    pub fn emit(
        &self,
        event: &str,
        request: &RequestContext,
        response: &ResponseContext,
    ) -> Dispatch {
        let snapshot = self.table.load_full();
        let Some(subscribers) = snapshot.get(event) else {
            return Dispatch::default();
        };

        let lifecycle_event = LifecycleEvent {
            name: event,
            request,
            response,
        };
        let mut dispatch = Dispatch::default();
        for subscriber in subscribers {
            match catch_unwind(AssertUnwindSafe(|| subscriber.on_event(&lifecycle_event))) {
                Ok(Ok(())) => dispatch.delivered += 1,
                Ok(Err(e)) => {
                    dispatch.failed += 1;
                    warn!(
                        target: "diagnostic",
                        event,
                        subscriber = subscriber.name(),
                        request_id = %request.request_id,
                        error = %e,
                        "lifecycle subscriber failed"
                    );
                }
                Err(panic) => {
                    dispatch.failed += 1;
                    error!(
                        target: "diagnostic",
                        event,
                        subscriber = subscriber.name(),
                        request_id = %request.request_id,
                        panic = panic_message(panic.as_ref()),
                        "lifecycle subscriber panicked"
                    );
                }
            }
        }
        dispatch
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.load();
        let mut map = f.debug_map();
        for (event, subscribers) in table.iter() {
            map.entry(event, &subscribers.len());
        }
        map.finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::http::{Method, StatusCode};

    use super::*;
    use crate::lifecycle::context::{fixtures, AFTER};

    fn contexts() -> (RequestContext, ResponseContext) {
        (
            fixtures::request(Method::GET, "/", None),
            fixtures::response(StatusCode::OK, None),
        )
    }

    #[test]
    fn emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        let (req, resp) = contexts();
        assert_eq!(bus.emit(AFTER, &req, &resp), Dispatch::default());
    }

    #[test]
    fn subscribers_fire_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            bus.on(AFTER, move |_: &LifecycleEvent<'_>| -> anyhow::Result<()> {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }
        let (req, resp) = contexts();
        let dispatch = bus.emit(AFTER, &req, &resp);
        assert_eq!(dispatch.delivered, 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn only_matching_event_is_dispatched() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        bus.on("pre", move |_: &LifecycleEvent<'_>| -> anyhow::Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        let (req, resp) = contexts();
        bus.emit(AFTER, &req, &resp);
        assert_eq!(*hits.lock().unwrap(), 0);
        assert_eq!(bus.subscriber_count("pre"), 1);
        assert_eq!(bus.subscriber_count(AFTER), 0);
    }

    #[test]
    fn failing_subscriber_does_not_stop_others() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.on(AFTER, |_: &LifecycleEvent<'_>| -> anyhow::Result<()> {
            anyhow::bail!("boom")
        });
        bus.on(AFTER, |_: &LifecycleEvent<'_>| -> anyhow::Result<()> {
            panic!("subscriber panic")
        });
        let sink = Arc::clone(&seen);
        bus.on(AFTER, move |e: &LifecycleEvent<'_>| -> anyhow::Result<()> {
            sink.lock().unwrap().push(e.request.path.clone());
            Ok(())
        });

        let (req, resp) = contexts();
        for _ in 0..5 {
            let dispatch = bus.emit(AFTER, &req, &resp);
            assert_eq!(dispatch, Dispatch { delivered: 1, failed: 2 });
        }
        assert_eq!(seen.lock().unwrap().len(), 5);
    }

    #[test]
    fn registration_during_dispatch_uses_snapshot() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        bus.on(AFTER, move |_: &LifecycleEvent<'_>| -> anyhow::Result<()> {
            inner_bus.on(AFTER, |_: &LifecycleEvent<'_>| -> anyhow::Result<()> { Ok(()) });
            Ok(())
        });
        let (req, resp) = contexts();
        assert_eq!(bus.emit(AFTER, &req, &resp).delivered, 1);
        assert_eq!(bus.subscriber_count(AFTER), 2);
    }

    #[test]
    fn panic_message_extracts_strings() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
    }
}
