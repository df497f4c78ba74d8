//! Thread-safe mapping from domain to bound provider, plus the provider lifecycle state machine.
//!
//! [`ProviderRegistry`] provides concurrent access for readers (flag evaluation) and writers
//! (provider binding). An entry is never mutated in place except for its status: binding a new
//! provider installs a new [`ProviderEntry`] and readers holding the old one keep a consistent
//! snapshot.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ProviderInitError,
    event_executor::EventExecutor,
    events::{EventType, ProviderEvent},
    provider::same_instance,
    Error, ErrorCode, EvaluationContext, FeatureProvider, ProviderStatus, Result,
};

/// One provider bound to one domain.
pub(crate) struct ProviderEntry {
    domain: String,
    provider: Arc<dyn FeatureProvider>,
    generation: u64,
    status: watch::Sender<ProviderStatus>,
    /// Cancelled once the entry is no longer installed in the registry.
    retired: CancellationToken,
}

impl ProviderEntry {
    pub(crate) fn domain(&self) -> &str {
        &self.domain
    }

    pub(crate) fn provider(&self) -> &Arc<dyn FeatureProvider> {
        &self.provider
    }

    pub(crate) fn provider_name(&self) -> String {
        self.provider.metadata().name
    }

    pub(crate) fn status(&self) -> ProviderStatus {
        *self.status.borrow()
    }

    #[cfg(test)]
    pub(crate) fn is_retired(&self) -> bool {
        self.retired.is_cancelled()
    }

    pub(crate) fn retired(&self) -> &CancellationToken {
        &self.retired
    }

    /// Apply a status transition unless the entry has been replaced or is `Fatal`.
    #[cfg(test)]
    pub(crate) fn transition(&self, status: ProviderStatus) -> bool {
        self.update(Some(status), || {})
    }

    /// Apply `status` (if any) and run `publish`, atomically with respect to retirement.
    ///
    /// Nothing happens once the entry is retired, and a `Fatal` entry never changes status again.
    /// `publish` runs under the status lock, so an entry retired concurrently either sees the
    /// whole update before its retirement or none of it.
    pub(crate) fn update(&self, status: Option<ProviderStatus>, publish: impl FnOnce()) -> bool {
        let mut outcome = Err("replaced");
        self.status.send_if_modified(|current| {
            if self.retired.is_cancelled() {
                return false;
            }
            let Some(status) = status else {
                outcome = Ok(*current);
                publish();
                return false;
            };
            if *current == ProviderStatus::Fatal && status != ProviderStatus::Fatal {
                outcome = Err("fatal");
                return false;
            }
            let previous = std::mem::replace(current, status);
            outcome = Ok(previous);
            publish();
            previous != status
        });

        match (outcome, status) {
            (Ok(previous), Some(status)) if previous != status => {
                log::debug!(target: "flagbridge",
                            domain = self.domain.as_str(),
                            generation = self.generation;
                            "provider status {previous:?} -> {status:?}");
                true
            }
            (Ok(_), _) => true,
            (Err(reason), _) => {
                log::debug!(target: "flagbridge",
                            domain = self.domain.as_str(),
                            generation = self.generation;
                            "dropping update for {reason} provider");
                false
            }
        }
    }

    /// Run `f` with the current status and retirement flag, excluding concurrent updates.
    pub(crate) fn observe<R>(&self, f: impl FnOnce(ProviderStatus, bool) -> R) -> R {
        let status = self.status.borrow();
        f(*status, self.retired.is_cancelled())
    }

    /// Mark the entry as replaced. Serialized with [`ProviderEntry::update`].
    fn retire(&self) {
        self.status.send_if_modified(|_| {
            self.retired.cancel();
            false
        });
    }

    /// Wait until initialization has an outcome. Returns `None` if the entry is retired first.
    async fn settled(&self) -> Option<ProviderStatus> {
        let mut receiver = self.status.subscribe();
        let wait = async move {
            receiver
                .wait_for(|status| status.is_settled())
                .await
                .map(|status| *status)
                .ok()
        };
        tokio::select! {
            status = wait => status,
            _ = self.retired.cancelled() => None,
        }
    }
}

/// `ProviderRegistry` provides thread-safe (`Sync`) storage of provider bindings.
#[derive(Default)]
pub(crate) struct ProviderRegistry {
    entries: RwLock<HashMap<String, Arc<ProviderEntry>>>,
    next_generation: AtomicU64,
}

impl ProviderRegistry {
    pub(crate) fn new() -> ProviderRegistry {
        ProviderRegistry::default()
    }

    /// Entry bound to exactly `domain`.
    pub(crate) fn get(&self, domain: &str) -> Option<Arc<ProviderEntry>> {
        // Err() is possible only if the lock is poisoned (writer panicked while holding the
        // lock), which should never happen.
        let entries = self
            .entries
            .read()
            .expect("thread holding registry lock should not panic");
        entries.get(domain).cloned()
    }

    /// Entry used to evaluate flags for `domain`: the named entry, falling back to the default
    /// domain.
    pub(crate) fn resolve(&self, domain: &str) -> Option<Arc<ProviderEntry>> {
        let entries = self
            .entries
            .read()
            .expect("thread holding registry lock should not panic");
        entries
            .get(domain)
            .or_else(|| entries.get(""))
            .cloned()
    }

    pub(crate) fn contains(&self, domain: &str) -> bool {
        self.get(domain).is_some()
    }

    /// Bind `provider` to `domain`, returning the new entry and the one it replaced. The replaced
    /// entry is retired.
    pub(crate) fn install(
        &self,
        domain: &str,
        provider: Arc<dyn FeatureProvider>,
    ) -> (Arc<ProviderEntry>, Option<Arc<ProviderEntry>>) {
        // Constructing new value before requesting the lock to minimize lock span.
        let entry = Arc::new(ProviderEntry {
            domain: domain.to_owned(),
            provider,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            status: watch::channel(ProviderStatus::NotReady).0,
            retired: CancellationToken::new(),
        });

        let previous = {
            let mut entries = self
                .entries
                .write()
                .expect("thread holding registry lock should not panic");
            let previous = entries.insert(domain.to_owned(), entry.clone());
            // Retired under the registry lock: no reader can observe both entries as live.
            if let Some(previous) = &previous {
                previous.retire();
            }
            previous
        };

        (entry, previous)
    }

    /// An older installed entry holding the same provider instance.
    fn other_binding(&self, entry: &ProviderEntry) -> Option<Arc<ProviderEntry>> {
        let entries = self
            .entries
            .read()
            .expect("thread holding registry lock should not panic");
        entries
            .values()
            .find(|other| {
                other.generation < entry.generation
                    && same_instance(&other.provider, &entry.provider)
            })
            .cloned()
    }

    /// Whether `provider` is bound to any domain.
    pub(crate) fn is_bound(&self, provider: &Arc<dyn FeatureProvider>) -> bool {
        let entries = self
            .entries
            .read()
            .expect("thread holding registry lock should not panic");
        entries
            .values()
            .any(|entry| same_instance(&entry.provider, provider))
    }

    /// Remove and retire every entry.
    pub(crate) fn drain(&self) -> Vec<Arc<ProviderEntry>> {
        let mut entries = self
            .entries
            .write()
            .expect("thread holding registry lock should not panic");
        let drained: Vec<_> = entries.drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.retire();
        }
        drained
    }
}

/// Drive a freshly installed `entry` to a settled status and report the outcome.
///
/// - a cancelled token fails fast without calling the provider;
/// - a provider instance already bound elsewhere is not initialized twice, the entry mirrors
///   the status of the existing binding;
/// - providers without the lifecycle capability are ready immediately.
///
/// The status transition and the lifecycle event are dropped if `entry` has been replaced in the
/// meantime.
pub(crate) async fn initialize(
    registry: &ProviderRegistry,
    executor: &EventExecutor,
    entry: &Arc<ProviderEntry>,
    cancel: CancellationToken,
    context: EvaluationContext,
) -> Result<()> {
    let result = if cancel.is_cancelled() {
        Err(ProviderInitError::cancelled())
    } else {
        match mirrored_status(registry, entry, &cancel).await {
            Some(outcome) => outcome,
            None => match entry.provider.as_state_handler() {
                Some(handler) => handler.init(cancel, &context).await,
                None => Ok(()),
            },
        }
    };

    let status = match &result {
        Ok(()) => ProviderStatus::Ready,
        Err(err) if err.code == ErrorCode::ProviderFatal => ProviderStatus::Fatal,
        Err(_) => ProviderStatus::Error,
    };

    let event = match &result {
        Ok(()) => ProviderEvent::new(EventType::ProviderReady, "provider initialized"),
        Err(err) => {
            ProviderEvent::new(EventType::ProviderError, err.message.clone()).with_error_code(err.code)
        }
    };
    let provider_name = entry.provider_name();
    entry.update(Some(status), || {
        executor.emit(entry.domain(), &provider_name, event)
    });

    match &result {
        Ok(()) => {
            log::debug!(target: "flagbridge", domain = entry.domain(); "provider initialized")
        }
        Err(err) => {
            log::warn!(target: "flagbridge", domain = entry.domain(); "provider initialization failed: {err}")
        }
    }

    result.map_err(Error::from)
}

/// When the provider instance of `entry` is already bound to another domain, wait for that
/// binding to settle and reuse its outcome.
async fn mirrored_status(
    registry: &ProviderRegistry,
    entry: &ProviderEntry,
    cancel: &CancellationToken,
) -> Option<std::result::Result<(), ProviderInitError>> {
    let other = registry.other_binding(entry)?;

    let settled = tokio::select! {
        status = other.settled() => status,
        _ = cancel.cancelled() => return Some(Err(ProviderInitError::cancelled())),
    };
    // The other binding was replaced before settling; initialize this one directly.
    let status = settled?;

    Some(match status {
        ProviderStatus::Ready | ProviderStatus::Stale => Ok(()),
        ProviderStatus::Fatal => Err(ProviderInitError::fatal(
            "provider is fatal in another domain",
        )),
        ProviderStatus::Error | ProviderStatus::NotReady => Err(ProviderInitError::new(
            "provider failed to initialize in another domain",
        )),
    })
}

/// Invoke the provider's shutdown capability, if any.
pub(crate) async fn shutdown_provider(
    provider: &Arc<dyn FeatureProvider>,
    cancel: CancellationToken,
) -> Result<()> {
    let Some(handler) = provider.as_state_handler() else {
        return Ok(());
    };

    let name = provider.metadata().name;
    log::debug!(target: "flagbridge", provider = name.as_str(); "shutting down provider");

    handler.shutdown(cancel).await.map_err(|err| match err {
        err @ Error::ProviderShutdown(_) => err,
        err => Error::ProviderShutdown(format!("{name}: {err}")),
    })
}

/// Shut down the provider of a replaced `entry` unless it is still bound to another domain.
/// `cancel` is handed to the provider's shutdown.
pub(crate) async fn retire_provider(
    registry: &ProviderRegistry,
    entry: &ProviderEntry,
    cancel: CancellationToken,
) {
    if registry.is_bound(&entry.provider) {
        return;
    }
    if let Err(err) = shutdown_provider(&entry.provider, cancel).await {
        log::warn!(target: "flagbridge",
                   domain = entry.domain();
                   "error shutting down replaced provider: {err}");
    }
}
