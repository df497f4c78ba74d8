//! Ordered, decoupled delivery of events to handlers.
//!
//! Producers push into a bounded queue and return immediately. A single dispatcher thread per
//! executor drains the queue, so handlers observe events in emission order. Handlers run outside
//! of the handler registry lock: registering or removing handlers never waits for dispatch.
//!
//! Every broadcast carries a sequence number taken when it is emitted, and every registration
//! remembers the sequence at which it was made. A handler only receives broadcasts emitted after
//! it was registered, even when they are dispatched later.
use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{Receiver, SyncSender, TrySendError},
        Arc, RwLock,
    },
};

use tokio::sync::broadcast::error::RecvError;

use crate::{
    background,
    events::{same_callback, EventDetails, ProviderEvent},
    provider_registry::{ProviderEntry, ProviderRegistry},
    EventCallback, EventType, FeatureApiConfig,
};

/// Who a handler is registered for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandlerScope {
    /// Receives events of every domain.
    Api,
    /// Receives events of one domain, plus events of the default provider while the domain has
    /// no provider of its own.
    Domain(String),
}

struct Registration {
    callback: EventCallback,
    /// Broadcasts with a lower sequence number were emitted before the registration.
    since: u64,
}

#[derive(Default)]
struct Handlers {
    api: HashMap<EventType, Vec<Registration>>,
    // BTreeMap keeps fan-out across domains deterministic.
    domains: BTreeMap<String, HashMap<EventType, Vec<Registration>>>,
}

impl Handlers {
    fn slot(&mut self, scope: &HandlerScope, event_type: EventType) -> &mut Vec<Registration> {
        let by_type = match scope {
            HandlerScope::Api => &mut self.api,
            HandlerScope::Domain(domain) => self.domains.entry(domain.clone()).or_default(),
        };
        by_type.entry(event_type).or_default()
    }

    /// Callbacks that should receive broadcast `sequence`, in delivery order.
    fn route(
        &self,
        sequence: u64,
        details: &EventDetails,
        registry: &ProviderRegistry,
    ) -> Vec<EventCallback> {
        let registered = |registrations: &Vec<Registration>| {
            registrations
                .iter()
                .filter(|it| it.since <= sequence)
                .map(|it| it.callback.clone())
                .collect::<Vec<_>>()
        };

        let mut callbacks = self
            .api
            .get(&details.event_type)
            .map(registered)
            .unwrap_or_default();

        for (domain, by_type) in &self.domains {
            let Some(scoped) = by_type.get(&details.event_type) else {
                continue;
            };
            let receives = if *domain == details.domain {
                true
            } else {
                // Evaluation errors are specific to the client that evaluated.
                details.event_type != EventType::EvaluationError
                    && details.domain.is_empty()
                    && !registry.contains(domain)
            };
            if receives {
                callbacks.extend(registered(scoped));
            }
        }

        callbacks
    }
}

enum Delivery {
    /// Deliver to every handler the event is routed to and that was registered before the
    /// sequence number.
    Broadcast(u64, EventDetails),
    /// Deliver to a single handler.
    Single(EventCallback, EventDetails),
    /// Wake up the dispatcher so it notices the executor is closed.
    Stop,
}

/// Event executor instance. Replaced wholesale when the API shuts down.
pub(crate) struct EventExecutor {
    sender: SyncSender<Delivery>,
    handlers: Arc<RwLock<Handlers>>,
    sequence: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl EventExecutor {
    /// Create an executor and start its dispatcher thread.
    pub(crate) fn new(config: &FeatureApiConfig, registry: Arc<ProviderRegistry>) -> EventExecutor {
        // `sync_channel` gives us a bounded queue; producers use `try_send()` so they never block
        // on a slow handler.
        let (sender, receiver) = std::sync::mpsc::sync_channel(config.event_queue_capacity);
        let handlers = Arc::new(RwLock::new(Handlers::default()));
        let closed = Arc::new(AtomicBool::new(false));

        let result = {
            let handlers = Arc::clone(&handlers);
            let closed = Arc::clone(&closed);
            std::thread::Builder::new()
                .name(config.dispatcher_thread_name.clone())
                .spawn(move || dispatch_loop(receiver, handlers, closed, registry))
        };
        if let Err(err) = result {
            log::error!(target: "flagbridge", "failed to start event dispatcher thread: {err}");
        }

        EventExecutor {
            sender,
            handlers,
            sequence: AtomicU64::new(0),
            closed,
        }
    }

    /// Register `callback`. If `current` is the entry serving the handler's scope and its status
    /// already matches `event_type`, the handler is also notified right away.
    ///
    /// The status read and the registration are one step with respect to status updates of
    /// `current`: the handler either sees the status through the immediate notification or
    /// through the broadcast announcing it, never both.
    pub(crate) fn add_handler(
        &self,
        scope: HandlerScope,
        event_type: EventType,
        callback: EventCallback,
        current: Option<&ProviderEntry>,
    ) {
        let immediate = {
            let mut handlers = self
                .handlers
                .write()
                .expect("thread holding handlers lock should not panic");
            let (since, status) = match current {
                // Status updates publish under the entry's status lock, so a broadcast for the
                // status read here has a lower sequence number than `since`.
                Some(entry) => entry.observe(|status, retired| {
                    (self.sequence.load(Ordering::SeqCst), (!retired).then_some(status))
                }),
                None => (self.sequence.load(Ordering::SeqCst), None),
            };
            handlers.slot(&scope, event_type).push(Registration {
                callback: callback.clone(),
                since,
            });
            status
        };

        let (Some(entry), Some(status)) = (current, immediate) else {
            return;
        };
        if EventType::for_status(status) == Some(event_type) {
            let event = ProviderEvent::new(event_type, format!("provider is {status:?}"));
            self.notify(
                callback,
                EventDetails::new(entry.domain(), &entry.provider_name(), event),
            );
        }
    }

    /// Remove the first registration of `callback`. Returns whether one was found.
    pub(crate) fn remove_handler(
        &self,
        scope: HandlerScope,
        event_type: EventType,
        callback: &EventCallback,
    ) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .expect("thread holding handlers lock should not panic");
        let slot = handlers.slot(&scope, event_type);
        match slot.iter().position(|it| same_callback(&it.callback, callback)) {
            Some(index) => {
                slot.remove(index);
                true
            }
            None => false,
        }
    }

    /// Queue `event` for every handler it routes to.
    pub(crate) fn emit(&self, domain: &str, provider_name: &str, event: ProviderEvent) {
        let details = EventDetails::new(domain, provider_name, event);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.enqueue(Delivery::Broadcast(sequence, details));
    }

    /// Queue `details` for `callback` alone.
    pub(crate) fn notify(&self, callback: EventCallback, details: EventDetails) {
        self.enqueue(Delivery::Single(callback, details));
    }

    /// Forward events published by the provider of `entry` until the entry is retired.
    pub(crate) fn bridge(self: &Arc<Self>, entry: &Arc<ProviderEntry>) {
        let Some(emitter) = entry.provider().as_event_emitter() else {
            return;
        };
        // Subscribe before returning, so events published during initialization are not missed.
        let mut events = emitter.subscribe();
        let executor = Arc::clone(self);
        let entry = Arc::clone(entry);

        background::spawn("flagbridge-provider-events", async move {
            loop {
                let received = tokio::select! {
                    _ = entry.retired().cancelled() => break,
                    received = events.recv() => received,
                };
                match received {
                    Ok(event) => executor.forward(&entry, event),
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!(target: "flagbridge",
                                   domain = entry.domain(),
                                   skipped;
                                   "provider events lagged behind, some were skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            log::debug!(target: "flagbridge", domain = entry.domain(); "stopped listening to provider events");
        });
    }

    fn forward(&self, entry: &ProviderEntry, event: ProviderEvent) {
        let status = event.event_type.status(event.error_code);
        let provider_name = entry.provider_name();
        entry.update(status, || self.emit(entry.domain(), &provider_name, event));
    }

    /// Stop dispatching. Handlers are dropped and queued events are discarded.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        *self
            .handlers
            .write()
            .expect("thread holding handlers lock should not panic") = Handlers::default();
        // Error means the queue is full or the dispatcher is gone. Either way it will observe
        // the closed flag.
        let _ = self.sender.try_send(Delivery::Stop);
    }

    fn enqueue(&self, delivery: Delivery) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match self.sender.try_send(delivery) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!(target: "flagbridge", "event queue is full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!(target: "flagbridge", "event dispatcher is not running, dropping event");
            }
        }
    }
}

fn dispatch_loop(
    receiver: Receiver<Delivery>,
    handlers: Arc<RwLock<Handlers>>,
    closed: Arc<AtomicBool>,
    registry: Arc<ProviderRegistry>,
) {
    // recv() returns Err once every sender is dropped.
    while let Ok(delivery) = receiver.recv() {
        if closed.load(Ordering::Acquire) {
            break;
        }
        match delivery {
            Delivery::Broadcast(sequence, details) => {
                // Collect callbacks first so the lock is not held while handlers run.
                let callbacks = handlers
                    .read()
                    .expect("thread holding handlers lock should not panic")
                    .route(sequence, &details, &registry);
                for callback in callbacks {
                    invoke(&callback, &details);
                }
            }
            Delivery::Single(callback, details) => invoke(&callback, &details),
            Delivery::Stop => {}
        }
    }
    log::debug!(target: "flagbridge", "event dispatcher stopped");
}

/// Run a handler, containing any panic so later handlers still receive the event.
fn invoke(callback: &EventCallback, details: &EventDetails) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(details))) {
        log::error!(target: "flagbridge",
                    domain = details.domain.as_str(),
                    provider = details.provider_name.as_str();
                    "event handler for {:?} panicked: {}", details.event_type, panic_message(&*panic));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
