//! Lifecycle and evaluation events delivered to handlers.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ErrorCode, FlagMetadata, ProviderStatus};

/// Kinds of events handlers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// The provider is ready to evaluate flags.
    ProviderReady,
    /// The provider failed to initialize or signalled an error.
    ProviderError,
    /// The provider's cached state is no longer valid.
    ProviderStale,
    /// Flag configuration of the provider has changed.
    ProviderConfigurationChanged,
    /// A flag evaluation returned an error to the caller.
    EvaluationError,
}

impl EventType {
    /// Status a provider moves to when it emits this event, if any.
    pub(crate) fn status(self, error_code: Option<ErrorCode>) -> Option<ProviderStatus> {
        match self {
            EventType::ProviderReady => Some(ProviderStatus::Ready),
            EventType::ProviderError if error_code == Some(ErrorCode::ProviderFatal) => {
                Some(ProviderStatus::Fatal)
            }
            EventType::ProviderError => Some(ProviderStatus::Error),
            EventType::ProviderStale => Some(ProviderStatus::Stale),
            EventType::ProviderConfigurationChanged | EventType::EvaluationError => None,
        }
    }

    /// Event that reports a provider being in `status`. Used to notify handlers registered
    /// after the fact.
    pub(crate) fn for_status(status: ProviderStatus) -> Option<EventType> {
        match status {
            ProviderStatus::Ready => Some(EventType::ProviderReady),
            ProviderStatus::Error | ProviderStatus::Fatal => Some(EventType::ProviderError),
            ProviderStatus::Stale => Some(EventType::ProviderStale),
            ProviderStatus::NotReady => None,
        }
    }
}

/// Event published by a provider through the [`EventEmitter`](crate::EventEmitter) capability.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEvent {
    /// Kind of event. Lifecycle kinds also update the provider status.
    pub event_type: EventType,
    /// Human-readable description.
    pub message: String,
    /// For [`EventType::ProviderError`], [`ErrorCode::ProviderFatal`] moves the provider to
    /// [`ProviderStatus::Fatal`].
    pub error_code: Option<ErrorCode>,
    /// Keys of flags that changed. Only meaningful for
    /// [`EventType::ProviderConfigurationChanged`].
    pub flags_changed: Vec<String>,
    /// Provider-supplied metadata.
    pub metadata: FlagMetadata,
}

impl ProviderEvent {
    /// Event of `event_type` with `message` and nothing else set.
    pub fn new(event_type: EventType, message: impl Into<String>) -> ProviderEvent {
        ProviderEvent {
            event_type,
            message: message.into(),
            error_code: None,
            flags_changed: Vec::new(),
            metadata: FlagMetadata::new(),
        }
    }

    /// Set the error code.
    pub fn with_error_code(mut self, error_code: ErrorCode) -> Self {
        self.error_code = Some(error_code);
        self
    }

    /// Set the keys of changed flags.
    pub fn with_flags_changed(mut self, flags_changed: Vec<String>) -> Self {
        self.flags_changed = flags_changed;
        self
    }
}

/// Payload handed to [`EventCallback`]s.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetails {
    /// Domain the provider is bound to. Empty for the default domain.
    pub domain: String,
    /// Name from the provider's metadata.
    pub provider_name: String,
    /// See [`ProviderEvent::event_type`].
    pub event_type: EventType,
    /// See [`ProviderEvent::message`].
    pub message: String,
    /// See [`ProviderEvent::error_code`].
    pub error_code: Option<ErrorCode>,
    /// See [`ProviderEvent::flags_changed`].
    pub flags_changed: Vec<String>,
    /// See [`ProviderEvent::metadata`].
    pub metadata: FlagMetadata,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

impl EventDetails {
    pub(crate) fn new(domain: &str, provider_name: &str, event: ProviderEvent) -> EventDetails {
        EventDetails {
            domain: domain.to_owned(),
            provider_name: provider_name.to_owned(),
            event_type: event.event_type,
            message: event.message,
            error_code: event.error_code,
            flags_changed: event.flags_changed,
            metadata: event.metadata,
            timestamp: Utc::now(),
        }
    }
}

/// Event handler. Handlers are compared by `Arc` identity on removal, so keep a clone of the
/// `Arc` you registered.
pub type EventCallback = Arc<dyn Fn(&EventDetails) + Send + Sync>;

/// Wrap a closure into an [`EventCallback`].
///
/// ```
/// # use flagbridge::{event_callback, EventType};
/// let callback = event_callback(|details| {
///     println!("{:?} from {}", details.event_type, details.provider_name);
/// });
/// flagbridge::add_handler(EventType::ProviderReady, callback.clone());
/// flagbridge::remove_handler(EventType::ProviderReady, &callback);
/// ```
pub fn event_callback(f: impl Fn(&EventDetails) + Send + Sync + 'static) -> EventCallback {
    Arc::new(f)
}

pub(crate) fn same_callback(a: &EventCallback, b: &EventCallback) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
