//! Provider capabilities consumed by the API.
//!
//! [`FeatureProvider`] is the required contract. Lifecycle ([`StateHandler`]) and event emission
//! ([`EventEmitter`]) are optional capabilities a provider advertises by overriding
//! [`FeatureProvider::as_state_handler`] and [`FeatureProvider::as_event_emitter`].
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ProviderInitError, events::ProviderEvent, EvaluationContext, FlattenedContext, Hook,
    Reason, ResolutionDetails, Result,
};

/// Static provider metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Provider name, used in events and logs.
    pub name: String,
}

impl ProviderMetadata {
    /// Metadata with `name`.
    pub fn new(name: impl Into<String>) -> ProviderMetadata {
        ProviderMetadata { name: name.into() }
    }
}

/// Lifecycle status of a provider bound to a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderStatus {
    /// Initial state of a newly bound provider.
    NotReady,
    /// Initialization succeeded, or the provider has no initialization step.
    Ready,
    /// Initialization or a later signal failed. Retry or replacement is possible.
    Error,
    /// Data is possibly out of date but the provider is usable.
    Stale,
    /// The provider must not be evaluated against again. Final: later signals are ignored.
    Fatal,
}

impl ProviderStatus {
    /// Whether initialization has reached an outcome.
    pub fn is_settled(self) -> bool {
        self != ProviderStatus::NotReady
    }
}

/// A feature flag provider resolves flag values.
///
/// Resolution methods are synchronous and must not block for long: they are called on the
/// evaluation path of the application. Failures are reported through
/// [`ResolutionDetails::error`], with `value` holding the default.
///
/// # Examples
///
/// ```
/// # use flagbridge::{FeatureProvider, FlattenedContext, ProviderMetadata, ResolutionDetails};
/// struct AlwaysOn;
///
/// impl FeatureProvider for AlwaysOn {
///     fn metadata(&self) -> ProviderMetadata {
///         ProviderMetadata::new("always-on")
///     }
///
///     fn resolve_bool_value(&self, _: &str, _: bool, _: &FlattenedContext) -> ResolutionDetails<bool> {
///         ResolutionDetails::new(true)
///     }
///
///     fn resolve_string_value(&self, _: &str, default: String, _: &FlattenedContext) -> ResolutionDetails<String> {
///         ResolutionDetails::new(default)
///     }
///
///     fn resolve_int_value(&self, _: &str, default: i64, _: &FlattenedContext) -> ResolutionDetails<i64> {
///         ResolutionDetails::new(default)
///     }
///
///     fn resolve_float_value(&self, _: &str, default: f64, _: &FlattenedContext) -> ResolutionDetails<f64> {
///         ResolutionDetails::new(default)
///     }
///
///     fn resolve_object_value(
///         &self,
///         _: &str,
///         default: serde_json::Value,
///         _: &FlattenedContext,
///     ) -> ResolutionDetails<serde_json::Value> {
///         ResolutionDetails::new(default)
///     }
/// }
/// ```
pub trait FeatureProvider: Send + Sync + 'static {
    /// Static metadata. Available before initialization completes.
    fn metadata(&self) -> ProviderMetadata;

    /// Resolve a boolean flag.
    fn resolve_bool_value(
        &self,
        flag_key: &str,
        default_value: bool,
        context: &FlattenedContext,
    ) -> ResolutionDetails<bool>;

    /// Resolve a string flag.
    fn resolve_string_value(
        &self,
        flag_key: &str,
        default_value: String,
        context: &FlattenedContext,
    ) -> ResolutionDetails<String>;

    /// Resolve an integer flag.
    fn resolve_int_value(
        &self,
        flag_key: &str,
        default_value: i64,
        context: &FlattenedContext,
    ) -> ResolutionDetails<i64>;

    /// Resolve a float flag.
    fn resolve_float_value(
        &self,
        flag_key: &str,
        default_value: f64,
        context: &FlattenedContext,
    ) -> ResolutionDetails<f64>;

    /// Resolve a structured flag.
    fn resolve_object_value(
        &self,
        flag_key: &str,
        default_value: serde_json::Value,
        context: &FlattenedContext,
    ) -> ResolutionDetails<serde_json::Value>;

    /// Hooks contributed by the provider. They run after API, client, and invocation hooks in the
    /// `before` stage.
    fn hooks(&self) -> Vec<Arc<dyn Hook>> {
        Vec::new()
    }

    /// Lifecycle capability. Providers without one are `Ready` as soon as they are bound.
    fn as_state_handler(&self) -> Option<&dyn StateHandler> {
        None
    }

    /// Event emission capability.
    fn as_event_emitter(&self) -> Option<&dyn EventEmitter> {
        None
    }
}

/// Optional provider lifecycle capability.
#[async_trait]
pub trait StateHandler: Send + Sync {
    /// Prepare the provider for evaluation. `cancel` fires when the caller gives up waiting;
    /// implementations should abort promptly when it does.
    ///
    /// Returning an error with [`ErrorCode::ProviderFatal`](crate::ErrorCode::ProviderFatal)
    /// moves the provider to [`ProviderStatus::Fatal`].
    async fn init(
        &self,
        cancel: CancellationToken,
        context: &EvaluationContext,
    ) -> std::result::Result<(), ProviderInitError>;

    /// Release provider resources.
    async fn shutdown(&self, cancel: CancellationToken) -> Result<()>;
}

/// Optional capability for providers that push their own lifecycle signals.
///
/// Every binding of the provider subscribes once. Events are dispatched to handlers for the
/// domains the provider is bound to, and update the binding's status.
pub trait EventEmitter: Send + Sync {
    /// A new receiver for events published from now on.
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;
}

/// Conversion into an optional provider handle.
///
/// Lets the binding operations accept a concrete `Arc<P>`, an `Arc<dyn FeatureProvider>`, or an
/// `Option` of either. `None` is rejected with [`Error::InvalidProvider`](crate::Error).
pub trait IntoProvider {
    /// The provider handle, or `None` if there is none.
    fn into_provider(self) -> Option<Arc<dyn FeatureProvider>>;
}

impl<P: FeatureProvider> IntoProvider for Arc<P> {
    fn into_provider(self) -> Option<Arc<dyn FeatureProvider>> {
        Some(self)
    }
}

impl IntoProvider for Arc<dyn FeatureProvider> {
    fn into_provider(self) -> Option<Arc<dyn FeatureProvider>> {
        Some(self)
    }
}

impl<P: FeatureProvider> IntoProvider for Option<Arc<P>> {
    fn into_provider(self) -> Option<Arc<dyn FeatureProvider>> {
        self.map(|p| p as Arc<dyn FeatureProvider>)
    }
}

impl IntoProvider for Option<Arc<dyn FeatureProvider>> {
    fn into_provider(self) -> Option<Arc<dyn FeatureProvider>> {
        self
    }
}

/// Provider used when nothing is bound. Always returns the default value.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProvider;

impl NoopProvider {
    /// Name reported in the provider metadata.
    pub const NAME: &'static str = "NoopProvider";

    fn resolve<T>(default_value: T) -> ResolutionDetails<T> {
        ResolutionDetails::new(default_value)
            .with_reason(Reason::Default)
            .with_variant("default-variant")
    }
}

impl FeatureProvider for NoopProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata::new(NoopProvider::NAME)
    }

    fn resolve_bool_value(
        &self,
        _flag_key: &str,
        default_value: bool,
        _context: &FlattenedContext,
    ) -> ResolutionDetails<bool> {
        NoopProvider::resolve(default_value)
    }

    fn resolve_string_value(
        &self,
        _flag_key: &str,
        default_value: String,
        _context: &FlattenedContext,
    ) -> ResolutionDetails<String> {
        NoopProvider::resolve(default_value)
    }

    fn resolve_int_value(
        &self,
        _flag_key: &str,
        default_value: i64,
        _context: &FlattenedContext,
    ) -> ResolutionDetails<i64> {
        NoopProvider::resolve(default_value)
    }

    fn resolve_float_value(
        &self,
        _flag_key: &str,
        default_value: f64,
        _context: &FlattenedContext,
    ) -> ResolutionDetails<f64> {
        NoopProvider::resolve(default_value)
    }

    fn resolve_object_value(
        &self,
        _flag_key: &str,
        default_value: serde_json::Value,
        _context: &FlattenedContext,
    ) -> ResolutionDetails<serde_json::Value> {
        NoopProvider::resolve(default_value)
    }
}

/// Compare provider handles by instance identity.
pub(crate) fn same_instance(a: &Arc<dyn FeatureProvider>, b: &Arc<dyn FeatureProvider>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
