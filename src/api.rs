use std::sync::{Arc, RwLock};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    background,
    event_executor::{EventExecutor, HandlerScope},
    provider_registry::{self, ProviderEntry, ProviderRegistry},
    Client, Error, EvaluationContext, EventCallback, EventType, FeatureApiConfig, FeatureProvider,
    Hook, IntoProvider, NoopProvider, ProviderMetadata, ProviderStatus, Result,
};

/// Evaluation API: binds providers to domains, holds global context and hooks, and dispatches
/// events.
///
/// `FeatureApi` is a cheap handle; clones share the same state. Most applications use the
/// process-wide instance through the crate-level functions ([`set_provider`](crate::set_provider),
/// [`client`](crate::client), ...). Tests can create isolated instances.
///
/// Binding operations spawn provider initialization onto the ambient tokio runtime when there is
/// one, and onto a dedicated background thread otherwise.
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use flagbridge::{CancellationToken, FeatureApi, NoopProvider};
/// # async fn test() -> flagbridge::Result<()> {
/// let api = FeatureApi::new();
/// api.set_provider_and_wait(CancellationToken::new(), "", Arc::new(NoopProvider)).await?;
/// let client = api.client("checkout");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct FeatureApi {
    inner: Arc<ApiInner>,
}

struct ApiInner {
    config: FeatureApiConfig,
    registry: Arc<ProviderRegistry>,
    executor: RwLock<Arc<EventExecutor>>,
    evaluation_context: RwLock<EvaluationContext>,
    hooks: RwLock<Vec<Arc<dyn Hook>>>,
    /// Handed to shutdowns of replaced providers. Cancelled by [`FeatureApi::shutdown`].
    retirements: RwLock<CancellationToken>,
}

impl FeatureApi {
    /// Create an isolated API instance with default configuration.
    pub fn new() -> FeatureApi {
        FeatureApi::with_config(FeatureApiConfig::default())
    }

    /// Create an isolated API instance.
    pub fn with_config(config: FeatureApiConfig) -> FeatureApi {
        let registry = Arc::new(ProviderRegistry::new());
        let executor = Arc::new(EventExecutor::new(&config, registry.clone()));
        FeatureApi {
            inner: Arc::new(ApiInner {
                config,
                registry,
                executor: RwLock::new(executor),
                evaluation_context: RwLock::new(EvaluationContext::default()),
                hooks: RwLock::new(Vec::new()),
                retirements: RwLock::new(CancellationToken::new()),
            }),
        }
    }

    /// Bind `provider` to `domain` (empty for the default domain) and initialize it in the
    /// background.
    ///
    /// Returns as soon as the provider is registered. Initialization outcome is observable
    /// through [`FeatureApi::provider_status`] and [`EventType::ProviderReady`] /
    /// [`EventType::ProviderError`] events. `cancel` is handed to the provider's `init`; if it
    /// is already cancelled, initialization fails fast and the provider lands in
    /// [`ProviderStatus::Error`].
    ///
    /// The provider previously bound to `domain` is shut down once the new one has settled,
    /// unless it is still bound to another domain. That shutdown runs in the background and is
    /// cancelled by [`FeatureApi::shutdown`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidProvider`] if `provider` is `None`.
    pub fn set_provider(
        &self,
        cancel: CancellationToken,
        domain: &str,
        provider: impl IntoProvider,
    ) -> Result<()> {
        self.bind(cancel, domain, provider).map(drop)
    }

    /// Bind `provider` to `domain` and wait for its initialization.
    ///
    /// If `cancel` fires first, returns [`Error::ContextCancelled`]; initialization keeps running
    /// in the background and the provider status reflects its eventual outcome.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidProvider`] if `provider` is `None`.
    /// - [`Error::ProviderInit`] if initialization failed.
    /// - [`Error::ContextCancelled`] if `cancel` fired before initialization finished.
    pub async fn set_provider_and_wait(
        &self,
        cancel: CancellationToken,
        domain: &str,
        provider: impl IntoProvider,
    ) -> Result<()> {
        let outcome = self.bind(cancel.clone(), domain, provider)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::ContextCancelled),
            result = outcome => match result {
                Ok(result) => result,
                // The initialization task was dropped without reporting, e.g. its runtime shut
                // down.
                Err(_) => Err(Error::ContextCancelled),
            },
        }
    }

    fn bind(
        &self,
        cancel: CancellationToken,
        domain: &str,
        provider: impl IntoProvider,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let provider = provider.into_provider().ok_or(Error::InvalidProvider)?;

        let (entry, previous) = self.inner.registry.install(domain, provider);
        log::debug!(target: "flagbridge",
                    domain,
                    provider = entry.provider_name().as_str();
                    "bound provider");

        let executor = self.executor();
        executor.bridge(&entry);

        let (sender, receiver) = oneshot::channel();
        let registry = self.inner.registry.clone();
        let context = self.evaluation_context();
        let retirements = self.retirements();
        background::spawn("flagbridge-provider-init", async move {
            let result =
                provider_registry::initialize(&registry, &executor, &entry, cancel, context).await;
            // Report before retiring: waiting callers must not depend on the old provider's
            // shutdown. Error means nobody is waiting, which is the case for `set_provider`.
            let _ = sender.send(result);
            if let Some(previous) = previous {
                provider_registry::retire_provider(&registry, &previous, retirements).await;
            }
        });

        Ok(receiver)
    }

    /// Metadata of the provider bound to `domain`, or of the [`NoopProvider`] if none is bound.
    pub fn provider_metadata(&self, domain: &str) -> ProviderMetadata {
        match self.inner.registry.get(domain) {
            Some(entry) => entry.provider().metadata(),
            None => NoopProvider.metadata(),
        }
    }

    /// Status of the provider evaluating flags for `domain`. Domains without their own provider
    /// report the default provider's status. [`ProviderStatus::NotReady`] if nothing is bound.
    pub fn provider_status(&self, domain: &str) -> ProviderStatus {
        self.inner
            .registry
            .resolve(domain)
            .map_or(ProviderStatus::NotReady, |entry| entry.status())
    }

    /// Replace the global evaluation context.
    pub fn set_evaluation_context(&self, evaluation_context: EvaluationContext) {
        *self
            .inner
            .evaluation_context
            .write()
            .expect("thread holding context lock should not panic") = evaluation_context;
    }

    /// The global evaluation context.
    pub fn evaluation_context(&self) -> EvaluationContext {
        self.inner
            .evaluation_context
            .read()
            .expect("thread holding context lock should not panic")
            .clone()
    }

    /// Append global hooks. They run for every evaluation of every client.
    pub fn add_hooks(&self, hooks: impl IntoIterator<Item = Arc<dyn Hook>>) {
        self.inner
            .hooks
            .write()
            .expect("thread holding hooks lock should not panic")
            .extend(hooks);
    }

    /// Global hooks, in registration order.
    pub fn hooks(&self) -> Vec<Arc<dyn Hook>> {
        self.inner
            .hooks
            .read()
            .expect("thread holding hooks lock should not panic")
            .clone()
    }

    /// Register an API-level handler receiving events of every domain.
    ///
    /// If the default provider already is in the status `event_type` reports, the handler is
    /// invoked once right away.
    pub fn add_handler(&self, event_type: EventType, callback: EventCallback) {
        self.add_scoped_handler(HandlerScope::Api, event_type, callback);
    }

    /// Remove the first registration of `callback` for `event_type`.
    pub fn remove_handler(&self, event_type: EventType, callback: &EventCallback) {
        self.executor()
            .remove_handler(HandlerScope::Api, event_type, callback);
    }

    pub(crate) fn add_scoped_handler(
        &self,
        scope: HandlerScope,
        event_type: EventType,
        callback: EventCallback,
    ) {
        let domain = match &scope {
            HandlerScope::Api => "",
            HandlerScope::Domain(domain) => domain.as_str(),
        };
        let entry = self.inner.registry.resolve(domain);
        self.executor()
            .add_handler(scope, event_type, callback, entry.as_deref());
    }

    pub(crate) fn remove_scoped_handler(
        &self,
        scope: HandlerScope,
        event_type: EventType,
        callback: &EventCallback,
    ) {
        self.executor().remove_handler(scope, event_type, callback);
    }

    /// Create a client bound to `domain`. Use `""` for the default domain.
    pub fn client(&self, domain: impl Into<String>) -> Client {
        Client::new(self.clone(), domain.into())
    }

    /// Create a client bound to the default domain.
    pub fn default_client(&self) -> Client {
        self.client("")
    }

    /// Shut down every bound provider and reset the API to its initial state.
    ///
    /// Providers are shut down concurrently; each instance once even if bound to several
    /// domains. Hooks, handlers, the global context, and all bindings are cleared whether or not
    /// shutdown succeeds, and a fresh event executor replaces the current one (pending events are
    /// discarded).
    ///
    /// # Errors
    ///
    /// - [`Error::ProviderShutdown`] with the first provider error. Other errors are logged.
    /// - [`Error::ContextCancelled`] if `cancel` fires before every provider has shut down.
    pub async fn shutdown(&self, cancel: CancellationToken) -> Result<()> {
        let entries = self.inner.registry.drain();
        self.reset();
        // Replaced providers still shutting down in the background are abandoned.
        std::mem::replace(
            &mut *self
                .inner
                .retirements
                .write()
                .expect("thread holding retirements lock should not panic"),
            CancellationToken::new(),
        )
        .cancel();

        let mut providers: Vec<Arc<dyn FeatureProvider>> = Vec::with_capacity(entries.len());
        for entry in &entries {
            if !providers
                .iter()
                .any(|p| crate::provider::same_instance(p, entry.provider()))
            {
                providers.push(entry.provider().clone());
            }
        }
        if providers.is_empty() {
            return Ok(());
        }

        let (sender, mut results) = tokio::sync::mpsc::unbounded_channel();
        let count = providers.len();
        for provider in providers {
            let sender = sender.clone();
            let cancel = cancel.clone();
            background::spawn("flagbridge-provider-shutdown", async move {
                let result = provider_registry::shutdown_provider(&provider, cancel).await;
                let _ = sender.send(result);
            });
        }
        drop(sender);

        let mut first_error = None;
        for _ in 0..count {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::ContextCancelled),
                result = results.recv() => result,
            };
            match result {
                Some(Ok(())) => {}
                Some(Err(err)) if first_error.is_none() => first_error = Some(err),
                Some(Err(err)) => {
                    log::warn!(target: "flagbridge", "additional provider shutdown error: {err}");
                }
                // A shutdown task was dropped without reporting.
                None => break,
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn reset(&self) {
        let fresh = Arc::new(EventExecutor::new(
            &self.inner.config,
            self.inner.registry.clone(),
        ));
        let previous = std::mem::replace(
            &mut *self
                .inner
                .executor
                .write()
                .expect("thread holding executor lock should not panic"),
            fresh,
        );
        previous.close();

        self.inner
            .hooks
            .write()
            .expect("thread holding hooks lock should not panic")
            .clear();
        self.set_evaluation_context(EvaluationContext::default());
        log::debug!(target: "flagbridge", "API reset");
    }

    fn retirements(&self) -> CancellationToken {
        self.inner
            .retirements
            .read()
            .expect("thread holding retirements lock should not panic")
            .clone()
    }

    pub(crate) fn executor(&self) -> Arc<EventExecutor> {
        self.inner
            .executor
            .read()
            .expect("thread holding executor lock should not panic")
            .clone()
    }

    pub(crate) fn resolve_entry(&self, domain: &str) -> Option<Arc<ProviderEntry>> {
        self.inner.registry.resolve(domain)
    }
}

impl Default for FeatureApi {
    fn default() -> FeatureApi {
        FeatureApi::new()
    }
}

impl Drop for ApiInner {
    fn drop(&mut self) {
        // Stop the dispatcher thread of the last executor.
        if let Ok(executor) = self.executor.get_mut() {
            executor.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio_util::sync::CancellationToken;

    use super::FeatureApi;
    use crate::{
        event_callback, CallContext, Error, ErrorCode, EvaluationContext, EventCallback,
        EventDetails, EventType, FeatureProvider, FlattenedContext, InMemoryFlag,
        InMemoryProvider, ProviderEvent, ProviderInitError, ProviderMetadata, ProviderStatus,
        ResolutionDetails, StateHandler,
    };

    struct TestProvider {
        name: &'static str,
        init_delay: Duration,
        init_error: Option<ProviderInitError>,
        shutdown_error: Option<&'static str>,
        shutdown_delay: Duration,
        resolve_gate: Option<Arc<ResolveGate>>,
        inits: AtomicUsize,
        shutdowns: AtomicUsize,
        shutdowns_finished: AtomicUsize,
        resolves: AtomicUsize,
    }

    /// Holds resolutions inside the provider: each one waits on `entered`, then on `release`.
    struct ResolveGate {
        entered: Barrier,
        release: Barrier,
    }

    impl ResolveGate {
        fn new(resolutions: usize) -> ResolveGate {
            ResolveGate {
                entered: Barrier::new(resolutions + 1),
                release: Barrier::new(resolutions + 1),
            }
        }
    }

    impl TestProvider {
        fn new(name: &'static str) -> TestProvider {
            TestProvider {
                name,
                init_delay: Duration::ZERO,
                init_error: None,
                shutdown_error: None,
                shutdown_delay: Duration::ZERO,
                resolve_gate: None,
                inits: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
                shutdowns_finished: AtomicUsize::new(0),
                resolves: AtomicUsize::new(0),
            }
        }

        fn with_init_delay(mut self, delay: Duration) -> TestProvider {
            self.init_delay = delay;
            self
        }

        fn with_init_error(mut self, error: ProviderInitError) -> TestProvider {
            self.init_error = Some(error);
            self
        }

        fn with_shutdown_error(mut self, message: &'static str) -> TestProvider {
            self.shutdown_error = Some(message);
            self
        }

        /// Shutdown takes `delay` unless its token fires first.
        fn with_shutdown_delay(mut self, delay: Duration) -> TestProvider {
            self.shutdown_delay = delay;
            self
        }

        fn with_resolve_gate(mut self, gate: Arc<ResolveGate>) -> TestProvider {
            self.resolve_gate = Some(gate);
            self
        }

        fn inits(&self) -> usize {
            self.inits.load(Ordering::SeqCst)
        }

        fn shutdowns(&self) -> usize {
            self.shutdowns.load(Ordering::SeqCst)
        }

        fn shutdowns_finished(&self) -> usize {
            self.shutdowns_finished.load(Ordering::SeqCst)
        }
    }

    impl FeatureProvider for TestProvider {
        fn metadata(&self) -> ProviderMetadata {
            ProviderMetadata::new(self.name)
        }

        fn resolve_bool_value(
            &self,
            _flag_key: &str,
            _default_value: bool,
            _context: &FlattenedContext,
        ) -> ResolutionDetails<bool> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.resolve_gate {
                gate.entered.wait();
                gate.release.wait();
            }
            ResolutionDetails::new(true).with_variant(self.name)
        }

        fn resolve_string_value(
            &self,
            _flag_key: &str,
            default_value: String,
            _context: &FlattenedContext,
        ) -> ResolutionDetails<String> {
            ResolutionDetails::new(default_value)
        }

        fn resolve_int_value(
            &self,
            _flag_key: &str,
            default_value: i64,
            _context: &FlattenedContext,
        ) -> ResolutionDetails<i64> {
            ResolutionDetails::new(default_value)
        }

        fn resolve_float_value(
            &self,
            _flag_key: &str,
            default_value: f64,
            _context: &FlattenedContext,
        ) -> ResolutionDetails<f64> {
            ResolutionDetails::new(default_value)
        }

        fn resolve_object_value(
            &self,
            _flag_key: &str,
            default_value: serde_json::Value,
            _context: &FlattenedContext,
        ) -> ResolutionDetails<serde_json::Value> {
            ResolutionDetails::new(default_value)
        }

        fn as_state_handler(&self) -> Option<&dyn StateHandler> {
            Some(self)
        }
    }

    #[async_trait]
    impl StateHandler for TestProvider {
        async fn init(
            &self,
            cancel: CancellationToken,
            _context: &EvaluationContext,
        ) -> Result<(), ProviderInitError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(self.init_delay) => {}
                _ = cancel.cancelled() => return Err(ProviderInitError::new("init cancelled")),
            }
            match &self.init_error {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }

        async fn shutdown(&self, cancel: CancellationToken) -> crate::Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(self.shutdown_delay) => false,
                _ = cancel.cancelled() => true,
            };
            self.shutdowns_finished.fetch_add(1, Ordering::SeqCst);
            if cancelled {
                return Err(Error::ContextCancelled);
            }
            match self.shutdown_error {
                Some(message) => Err(Error::ProviderShutdown(message.to_owned())),
                None => Ok(()),
            }
        }
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    fn recorder() -> (EventCallback, UnboundedReceiver<EventDetails>) {
        let (tx, rx) = unbounded_channel();
        let callback = event_callback(move |details| {
            let _ = tx.send(details.clone());
        });
        (callback, rx)
    }

    async fn next_event(rx: &mut UnboundedReceiver<EventDetails>) -> EventDetails {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event within timeout")
            .expect("event channel closed")
    }

    async fn assert_no_event(rx: &mut UnboundedReceiver<EventDetails>) {
        let received = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(received.is_err(), "unexpected event: {received:?}");
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met within timeout");
    }

    #[tokio::test]
    async fn rejects_missing_provider() {
        let api = FeatureApi::new();

        let result = api.set_provider(token(), "", None::<Arc<TestProvider>>);

        assert_eq!(result, Err(Error::InvalidProvider));
        assert_eq!(api.provider_status(""), ProviderStatus::NotReady);
    }

    #[tokio::test]
    async fn metadata_is_available_before_init_completes() {
        let _ = env_logger::builder().is_test(true).try_init();
        let api = FeatureApi::new();
        let provider = Arc::new(TestProvider::new("slow").with_init_delay(Duration::from_secs(1)));

        api.set_provider(token(), "d", provider).unwrap();

        assert_eq!(api.provider_metadata("d").name, "slow");
        assert_eq!(api.provider_status("d"), ProviderStatus::NotReady);
        assert_eq!(api.provider_metadata("other").name, crate::NoopProvider::NAME);
    }

    #[tokio::test]
    async fn set_provider_without_runtime_initializes_in_background() {
        let api = FeatureApi::new();
        let provider = Arc::new(TestProvider::new("p"));

        std::thread::scope(|scope| {
            scope.spawn(|| api.set_provider(token(), "", provider.clone()).unwrap());
        });

        wait_until(|| api.provider_status("") == ProviderStatus::Ready).await;
        assert_eq!(provider.inits(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_fails_fast() {
        let api = FeatureApi::new();
        let provider = Arc::new(TestProvider::new("p"));
        let cancel = token();
        cancel.cancel();

        let result = api.set_provider_and_wait(cancel, "", provider.clone()).await;

        assert_eq!(result, Err(Error::ContextCancelled));
        // Registration still happened, initialization failed without calling the provider.
        assert_eq!(api.provider_metadata("").name, "p");
        wait_until(|| api.provider_status("") == ProviderStatus::Error).await;
        assert_eq!(provider.inits(), 0);
    }

    #[tokio::test]
    async fn cancellation_while_waiting_returns_cancelled() {
        let api = FeatureApi::new();
        let provider = Arc::new(TestProvider::new("p").with_init_delay(Duration::from_secs(10)));
        let cancel = token();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            });
        }

        let result = api.set_provider_and_wait(cancel, "", provider).await;

        assert_eq!(result, Err(Error::ContextCancelled));
        wait_until(|| api.provider_status("") == ProviderStatus::Error).await;
    }

    #[tokio::test]
    async fn init_failure_is_reported() {
        let api = FeatureApi::new();
        let (callback, mut events) = recorder();
        api.add_handler(EventType::ProviderError, callback);
        let provider = Arc::new(TestProvider::new("p").with_init_error(ProviderInitError::new("boom")));

        let result = api.set_provider_and_wait(token(), "d", provider).await;

        assert!(matches!(result, Err(Error::ProviderInit(ref err)) if err.message == "boom"));
        assert_eq!(api.provider_status("d"), ProviderStatus::Error);
        let event = next_event(&mut events).await;
        assert_eq!(event.domain, "d");
        assert_eq!(event.provider_name, "p");
        assert_eq!(event.error_code, Some(ErrorCode::General));
    }

    #[tokio::test]
    async fn ready_handler_fires_exactly_once() {
        let api = FeatureApi::new();
        let (callback, mut events) = recorder();
        api.add_handler(EventType::ProviderReady, callback);

        api.set_provider_and_wait(token(), "", Arc::new(TestProvider::new("p")))
            .await
            .unwrap();

        let event = next_event(&mut events).await;
        assert_eq!(event.event_type, EventType::ProviderReady);
        assert_eq!(event.provider_name, "p");
        assert_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn handler_added_after_ready_is_notified_immediately() {
        let api = FeatureApi::new();
        api.set_provider_and_wait(token(), "", Arc::new(TestProvider::new("p")))
            .await
            .unwrap();

        let (ready, mut ready_events) = recorder();
        let (error, mut error_events) = recorder();
        api.add_handler(EventType::ProviderReady, ready);
        api.client("d").add_handler(EventType::ProviderError, error);

        assert_eq!(next_event(&mut ready_events).await.provider_name, "p");
        assert_no_event(&mut ready_events).await;
        assert_no_event(&mut error_events).await;
    }

    #[tokio::test]
    async fn removed_handler_is_not_invoked() {
        let api = FeatureApi::new();
        let (callback, mut events) = recorder();
        api.add_handler(EventType::ProviderReady, callback.clone());
        api.remove_handler(EventType::ProviderReady, &callback);

        api.set_provider_and_wait(token(), "", Arc::new(TestProvider::new("p")))
            .await
            .unwrap();

        assert_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn late_init_of_replaced_provider_is_dropped() {
        let api = FeatureApi::new();
        let slow = Arc::new(TestProvider::new("slow").with_init_delay(Duration::from_millis(200)));
        let failing =
            Arc::new(TestProvider::new("failing").with_init_error(ProviderInitError::new("boom")));
        let (callback, mut events) = recorder();
        api.add_handler(EventType::ProviderReady, callback);

        api.set_provider(token(), "d", slow.clone()).unwrap();
        let result = api.set_provider_and_wait(token(), "d", failing).await;
        assert!(result.is_err());
        assert_eq!(api.provider_status("d"), ProviderStatus::Error);

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(slow.inits(), 1);
        assert_eq!(api.provider_status("d"), ProviderStatus::Error);
        assert_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn replaced_provider_is_shut_down_after_swap() {
        let api = FeatureApi::new();
        let first = Arc::new(TestProvider::new("first"));
        let second = Arc::new(TestProvider::new("second"));

        api.set_provider_and_wait(token(), "d", first.clone())
            .await
            .unwrap();
        api.set_provider_and_wait(token(), "d", second.clone())
            .await
            .unwrap();

        assert_eq!(api.provider_metadata("d").name, "second");
        wait_until(|| first.shutdowns() == 1).await;
        assert_eq!(second.shutdowns(), 0);
    }

    #[tokio::test]
    async fn replaced_provider_stays_up_until_successor_settles() {
        let api = FeatureApi::new();
        let first = Arc::new(TestProvider::new("first"));
        let second =
            Arc::new(TestProvider::new("second").with_init_delay(Duration::from_millis(300)));
        api.set_provider_and_wait(token(), "d", first.clone())
            .await
            .unwrap();

        api.set_provider(token(), "d", second).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(api.provider_status("d"), ProviderStatus::NotReady);
        assert_eq!(first.shutdowns(), 0);

        wait_until(|| api.provider_status("d") == ProviderStatus::Ready).await;
        wait_until(|| first.shutdowns() == 1).await;
    }

    #[tokio::test]
    async fn slow_shutdown_of_replaced_provider_does_not_block_wait() {
        let api = FeatureApi::new();
        let first = Arc::new(TestProvider::new("first").with_shutdown_delay(Duration::from_secs(60)));
        api.set_provider_and_wait(token(), "d", first.clone())
            .await
            .unwrap();

        let swapped = tokio::time::timeout(
            Duration::from_secs(2),
            api.set_provider_and_wait(token(), "d", Arc::new(TestProvider::new("second"))),
        )
        .await;

        assert_eq!(swapped, Ok(Ok(())));
        wait_until(|| first.shutdowns() == 1).await;
        assert_eq!(first.shutdowns_finished(), 0);

        // API shutdown cancels the lingering retirement.
        api.shutdown(token()).await.unwrap();
        wait_until(|| first.shutdowns_finished() == 1).await;
    }

    #[tokio::test]
    async fn shared_provider_is_initialized_and_shut_down_once() {
        let api = FeatureApi::new();
        let shared = Arc::new(TestProvider::new("shared"));

        api.set_provider_and_wait(token(), "a", shared.clone())
            .await
            .unwrap();
        api.set_provider_and_wait(token(), "b", shared.clone())
            .await
            .unwrap();
        assert_eq!(shared.inits(), 1);
        assert_eq!(api.provider_status("b"), ProviderStatus::Ready);

        // Still bound to "b".
        api.set_provider_and_wait(token(), "a", Arc::new(TestProvider::new("other")))
            .await
            .unwrap();
        assert_eq!(shared.shutdowns(), 0);

        api.shutdown(token()).await.unwrap();
        assert_eq!(shared.shutdowns(), 1);
    }

    #[tokio::test]
    async fn fatal_provider_fails_fast() {
        let api = FeatureApi::new();
        let provider =
            Arc::new(TestProvider::new("p").with_init_error(ProviderInitError::fatal("gone")));

        let result = api.set_provider_and_wait(token(), "", provider.clone()).await;
        assert!(matches!(result, Err(Error::ProviderInit(ref err)) if err.code == ErrorCode::ProviderFatal));
        assert_eq!(api.provider_status(""), ProviderStatus::Fatal);

        let details = api
            .default_client()
            .boolean_details(&CallContext::new(), "flag", false, None, None);

        assert!(!details.value);
        assert_eq!(details.error_code, Some(ErrorCode::ProviderFatal));
        assert_eq!(provider.resolves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fatal_status_is_final() {
        let api = FeatureApi::new();
        let provider = Arc::new(InMemoryProvider::new(HashMap::new()));
        api.set_provider_and_wait(token(), "", provider.clone())
            .await
            .unwrap();
        let (callback, mut events) = recorder();
        api.add_handler(EventType::ProviderConfigurationChanged, callback);
        let (ready_callback, mut ready_events) = recorder();
        api.add_handler(EventType::ProviderReady, ready_callback);
        // Drain the immediate notification.
        next_event(&mut ready_events).await;

        provider.emit(
            ProviderEvent::new(EventType::ProviderError, "credentials revoked")
                .with_error_code(ErrorCode::ProviderFatal),
        );
        provider.emit(ProviderEvent::new(EventType::ProviderReady, "recovered"));
        // Provider events are forwarded in order, so once this arrives the ready event was seen.
        provider.emit(ProviderEvent::new(
            EventType::ProviderConfigurationChanged,
            "marker",
        ));
        assert_eq!(next_event(&mut events).await.message, "marker");

        assert_eq!(api.provider_status(""), ProviderStatus::Fatal);
        assert_no_event(&mut ready_events).await;
        let details = api
            .default_client()
            .boolean_details(&CallContext::new(), "flag", false, None, None);
        assert_eq!(details.error_code, Some(ErrorCode::ProviderFatal));
    }

    #[tokio::test]
    async fn evaluation_errors_are_published_to_domain_handlers() {
        let api = FeatureApi::new();
        api.set_provider_and_wait(token(), "d", Arc::new(InMemoryProvider::new(HashMap::new())))
            .await
            .unwrap();
        let client = api.client("d");
        let (callback, mut events) = recorder();
        client.add_handler(EventType::EvaluationError, callback);

        let result = client.boolean_value(&CallContext::new(), "missing", false, None, None);

        assert_eq!(result.unwrap_err().code(), ErrorCode::FlagNotFound);
        let event = next_event(&mut events).await;
        assert_eq!(event.domain, "d");
        assert_eq!(event.error_code, Some(ErrorCode::FlagNotFound));
    }

    #[tokio::test]
    async fn provider_events_are_bridged_to_handlers() {
        let api = FeatureApi::new();
        let provider = Arc::new(InMemoryProvider::new(HashMap::new()));
        api.set_provider_and_wait(token(), "", provider.clone())
            .await
            .unwrap();
        // "d" has no provider of its own and observes the default provider.
        let (callback, mut events) = recorder();
        api.client("d")
            .add_handler(EventType::ProviderConfigurationChanged, callback);

        provider.update_flags(HashMap::from([(
            "flag".to_owned(),
            InMemoryFlag::new("on", [("on", true.into())]),
        )]));

        let event = next_event(&mut events).await;
        assert_eq!(event.flags_changed, ["flag"]);
        assert_eq!(event.provider_name, InMemoryProvider::NAME);

        provider.emit(ProviderEvent::new(EventType::ProviderStale, "cache expired"));
        wait_until(|| api.provider_status("") == ProviderStatus::Stale).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn evaluations_complete_while_swapping() {
        const EVALUATIONS: usize = 50;
        let api = FeatureApi::new();
        let gate = Arc::new(ResolveGate::new(EVALUATIONS));
        let first = Arc::new(TestProvider::new("first").with_resolve_gate(gate.clone()));
        api.set_provider_and_wait(token(), "d", first.clone())
            .await
            .unwrap();

        let evaluations: Vec<_> = (0..EVALUATIONS)
            .map(|_| {
                let client = api.client("d");
                tokio::task::spawn_blocking(move || {
                    client
                        .boolean_details(&CallContext::new(), "flag", false, None, None)
                        .variant
                })
            })
            .collect();

        // Every evaluation is now inside the first provider.
        let entered = gate.clone();
        tokio::task::spawn_blocking(move || entered.entered.wait())
            .await
            .unwrap();
        api.set_provider_and_wait(token(), "d", Arc::new(TestProvider::new("second")))
            .await
            .unwrap();
        let after_swap = api
            .client("d")
            .boolean_details(&CallContext::new(), "flag", false, None, None);
        tokio::task::spawn_blocking(move || gate.release.wait())
            .await
            .unwrap();

        for evaluation in evaluations {
            assert_eq!(evaluation.await.unwrap().as_deref(), Some("first"));
        }
        assert_eq!(after_swap.variant.as_deref(), Some("second"));
        assert_eq!(first.resolves.load(Ordering::SeqCst), EVALUATIONS);
    }

    #[tokio::test]
    async fn shutdown_resets_api() {
        let api = FeatureApi::new();
        let a = Arc::new(TestProvider::new("a"));
        let b = Arc::new(TestProvider::new("b"));
        api.set_provider_and_wait(token(), "", a.clone()).await.unwrap();
        api.set_provider_and_wait(token(), "b", b.clone()).await.unwrap();
        api.set_evaluation_context(EvaluationContext::new("user", Default::default()));
        let (callback, mut events) = recorder();
        api.add_handler(EventType::ProviderReady, callback);
        // Drain the immediate notification.
        next_event(&mut events).await;

        api.shutdown(token()).await.unwrap();

        assert_eq!((a.shutdowns(), b.shutdowns()), (1, 1));
        assert_eq!(api.provider_status(""), ProviderStatus::NotReady);
        assert_eq!(api.provider_metadata("b").name, crate::NoopProvider::NAME);
        assert!(api.evaluation_context().is_empty());
        assert!(api.hooks().is_empty());

        // Handlers were dropped with the previous executor.
        api.set_provider_and_wait(token(), "", Arc::new(TestProvider::new("c")))
            .await
            .unwrap();
        assert_no_event(&mut events).await;
    }

    #[tokio::test]
    async fn shutdown_twice_is_ok() {
        let api = FeatureApi::new();
        api.set_provider_and_wait(token(), "", Arc::new(TestProvider::new("p")))
            .await
            .unwrap();

        assert_eq!(api.shutdown(token()).await, Ok(()));
        assert_eq!(api.shutdown(token()).await, Ok(()));
    }

    #[tokio::test]
    async fn shutdown_returns_cancelled_when_token_fires() {
        let api = FeatureApi::new();
        let provider =
            Arc::new(TestProvider::new("p").with_shutdown_delay(Duration::from_secs(60)));
        api.set_provider_and_wait(token(), "", provider.clone())
            .await
            .unwrap();
        let cancel = token();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), api.shutdown(cancel)).await;

        assert_eq!(result, Ok(Err(Error::ContextCancelled)));
        assert_eq!(provider.shutdowns(), 1);
        // The API is reset regardless.
        assert_eq!(api.provider_status(""), ProviderStatus::NotReady);
    }

    #[tokio::test]
    async fn shutdown_reports_provider_error() {
        let api = FeatureApi::new();
        let provider = Arc::new(TestProvider::new("p").with_shutdown_error("disk full"));
        api.set_provider_and_wait(token(), "", provider).await.unwrap();

        let result = api.shutdown(token()).await;

        assert_eq!(result, Err(Error::ProviderShutdown("disk full".to_owned())));
        assert_eq!(api.provider_status(""), ProviderStatus::NotReady);
    }
}
