//! A provider serving flags defined in memory. Useful for tests and local development.
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ProviderInitError, ResolutionError},
    events::ProviderEvent,
    provider::{EventEmitter, StateHandler},
    ErrorCode, EvaluationContext, EventType, FeatureProvider, FlagValue, FlattenedContext,
    ProviderMetadata, Reason, ResolutionDetails, Result,
};

/// Chooses a variant for the evaluated context. Returning `None` selects the default variant.
pub type ContextEvaluator = Arc<dyn Fn(&FlattenedContext) -> Option<String> + Send + Sync>;

/// Whether an [`InMemoryFlag`] is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlagState {
    /// Variants are selected normally.
    #[default]
    Enabled,
    /// The default variant is served with [`Reason::Disabled`].
    Disabled,
}

/// A flag definition for [`InMemoryProvider`].
#[derive(Clone)]
pub struct InMemoryFlag {
    /// Whether the flag is served.
    pub state: FlagState,
    /// Variant served when the flag is disabled or no other variant is selected.
    pub default_variant: String,
    /// Values by variant name.
    pub variants: HashMap<String, FlagValue>,
    /// Optional variant selection by context.
    pub context_evaluator: Option<ContextEvaluator>,
}

impl InMemoryFlag {
    /// Enabled flag serving `default_variant` out of `variants`.
    pub fn new<K: Into<String>>(
        default_variant: impl Into<String>,
        variants: impl IntoIterator<Item = (K, FlagValue)>,
    ) -> InMemoryFlag {
        InMemoryFlag {
            state: FlagState::Enabled,
            default_variant: default_variant.into(),
            variants: variants
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
            context_evaluator: None,
        }
    }

    /// Set the flag state.
    pub fn with_state(mut self, state: FlagState) -> Self {
        self.state = state;
        self
    }

    /// Select the variant with `evaluator`.
    pub fn with_context_evaluator(
        mut self,
        evaluator: impl Fn(&FlattenedContext) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.context_evaluator = Some(Arc::new(evaluator));
        self
    }

    fn evaluate(&self, context: &FlattenedContext) -> (&str, Reason) {
        let default_variant = self.default_variant.as_str();
        if self.state == FlagState::Disabled {
            return (default_variant, Reason::Disabled);
        }
        let Some(evaluator) = &self.context_evaluator else {
            return (default_variant, Reason::Static);
        };
        // Unknown variants fall back to the default one.
        match evaluator(context).and_then(|variant| self.variants.get_key_value(&variant)) {
            Some((name, _)) => (name.as_str(), Reason::TargetingMatch),
            None => (default_variant, Reason::Default),
        }
    }
}

impl std::fmt::Debug for InMemoryFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryFlag")
            .field("state", &self.state)
            .field("default_variant", &self.default_variant)
            .field("variants", &self.variants)
            .field("context_evaluator", &self.context_evaluator.is_some())
            .finish()
    }
}

/// Provider resolving flags from an in-memory table.
///
/// Flags can be replaced at runtime with [`InMemoryProvider::update_flags`], which publishes a
/// [`EventType::ProviderConfigurationChanged`] event naming the changed keys.
///
/// # Examples
/// ```
/// # use std::collections::HashMap;
/// # use flagbridge::{InMemoryFlag, InMemoryProvider};
/// let provider = InMemoryProvider::new(HashMap::from([(
///     "new-checkout".to_owned(),
///     InMemoryFlag::new("on", [("on", true.into()), ("off", false.into())]),
/// )]));
/// ```
pub struct InMemoryProvider {
    flags: RwLock<Arc<HashMap<String, InMemoryFlag>>>,
    events: broadcast::Sender<ProviderEvent>,
}

impl InMemoryProvider {
    /// Name reported in the provider metadata.
    pub const NAME: &'static str = "InMemoryProvider";

    const EVENT_CAPACITY: usize = 64;

    /// Provider serving `flags`.
    pub fn new(flags: HashMap<String, InMemoryFlag>) -> InMemoryProvider {
        InMemoryProvider {
            flags: RwLock::new(Arc::new(flags)),
            events: broadcast::channel(InMemoryProvider::EVENT_CAPACITY).0,
        }
    }

    /// Insert or replace `flags`. Flags not mentioned are kept.
    pub fn update_flags(&self, flags: HashMap<String, InMemoryFlag>) {
        let changed: BTreeSet<String> = flags.keys().cloned().collect();
        {
            let mut guard = self
                .flags
                .write()
                .expect("thread holding flags lock should not panic");
            let mut updated = (**guard).clone();
            updated.extend(flags);
            *guard = Arc::new(updated);
        }

        log::debug!(target: "flagbridge", changed:serde = &changed; "in-memory flags updated");
        // Error means nobody is subscribed.
        let _ = self.events.send(
            ProviderEvent::new(EventType::ProviderConfigurationChanged, "flags updated")
                .with_flags_changed(changed.into_iter().collect()),
        );
    }

    /// Publish a lifecycle event on behalf of the flag source, e.g. to signal staleness.
    pub fn emit(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }

    fn flags(&self) -> Arc<HashMap<String, InMemoryFlag>> {
        self.flags
            .read()
            .expect("thread holding flags lock should not panic")
            .clone()
    }

    fn resolve<T>(
        &self,
        flag_key: &str,
        default_value: T,
        context: &FlattenedContext,
        convert: impl FnOnce(&FlagValue) -> Option<T>,
    ) -> ResolutionDetails<T> {
        let flags = self.flags();
        let Some(flag) = flags.get(flag_key) else {
            return ResolutionDetails::error(
                default_value,
                ResolutionError::new(ErrorCode::FlagNotFound, format!("flag {flag_key} not found")),
            );
        };

        let (variant, reason) = flag.evaluate(context);
        let Some(value) = flag.variants.get(variant) else {
            return ResolutionDetails::error(
                default_value,
                ResolutionError::new(
                    ErrorCode::ParseError,
                    format!("variant {variant} of flag {flag_key} is not defined"),
                ),
            );
        };

        match convert(value) {
            Some(value) => ResolutionDetails::new(value)
                .with_variant(variant)
                .with_reason(reason),
            None => ResolutionDetails::error(
                default_value,
                ResolutionError::new(
                    ErrorCode::TypeMismatch,
                    format!("flag {flag_key} is of type {:?}", value.flag_type()),
                ),
            ),
        }
    }
}

impl FeatureProvider for InMemoryProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata::new(InMemoryProvider::NAME)
    }

    fn resolve_bool_value(
        &self,
        flag_key: &str,
        default_value: bool,
        context: &FlattenedContext,
    ) -> ResolutionDetails<bool> {
        self.resolve(flag_key, default_value, context, |value| match value {
            FlagValue::Boolean(b) => Some(*b),
            _ => None,
        })
    }

    fn resolve_string_value(
        &self,
        flag_key: &str,
        default_value: String,
        context: &FlattenedContext,
    ) -> ResolutionDetails<String> {
        self.resolve(flag_key, default_value, context, |value| match value {
            FlagValue::String(s) => Some(s.clone()),
            _ => None,
        })
    }

    fn resolve_int_value(
        &self,
        flag_key: &str,
        default_value: i64,
        context: &FlattenedContext,
    ) -> ResolutionDetails<i64> {
        self.resolve(flag_key, default_value, context, |value| match value {
            FlagValue::Integer(i) => Some(*i),
            _ => None,
        })
    }

    fn resolve_float_value(
        &self,
        flag_key: &str,
        default_value: f64,
        context: &FlattenedContext,
    ) -> ResolutionDetails<f64> {
        self.resolve(flag_key, default_value, context, |value| match value {
            FlagValue::Float(f) => Some(*f),
            FlagValue::Integer(i) => Some(*i as f64),
            _ => None,
        })
    }

    fn resolve_object_value(
        &self,
        flag_key: &str,
        default_value: serde_json::Value,
        context: &FlattenedContext,
    ) -> ResolutionDetails<serde_json::Value> {
        self.resolve(flag_key, default_value, context, |value| match value {
            FlagValue::Object(v) => Some(v.clone()),
            _ => None,
        })
    }

    fn as_state_handler(&self) -> Option<&dyn StateHandler> {
        Some(self)
    }

    fn as_event_emitter(&self) -> Option<&dyn EventEmitter> {
        Some(self)
    }
}

#[async_trait]
impl StateHandler for InMemoryProvider {
    async fn init(
        &self,
        _cancel: CancellationToken,
        _context: &EvaluationContext,
    ) -> std::result::Result<(), ProviderInitError> {
        Ok(())
    }

    async fn shutdown(&self, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }
}

impl EventEmitter for InMemoryProvider {
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{FlagState, InMemoryFlag, InMemoryProvider};
    use crate::{
        EventEmitter, ErrorCode, EventType, FeatureProvider, FlattenedContext, Reason,
    };

    fn provider() -> InMemoryProvider {
        InMemoryProvider::new(HashMap::from([
            (
                "boolean".to_owned(),
                InMemoryFlag::new("on", [("on", true.into()), ("off", false.into())]),
            ),
            (
                "targeted".to_owned(),
                InMemoryFlag::new("small", [("small", 1i64.into()), ("large", 100i64.into())])
                    .with_context_evaluator(|context| {
                        context
                            .get("plan")
                            .and_then(|plan| plan.as_str())
                            .filter(|plan| *plan == "enterprise")
                            .map(|_| "large".to_owned())
                    }),
            ),
        ]))
    }

    #[test]
    fn resolves_default_variant() {
        let details = provider().resolve_bool_value("boolean", false, &FlattenedContext::new());

        assert!(details.value);
        assert_eq!(details.variant.as_deref(), Some("on"));
        assert_eq!(details.reason, Some(Reason::Static));
    }

    #[test]
    fn context_evaluator_selects_variant() {
        let provider = provider();
        let context = FlattenedContext::from([("plan".to_owned(), "enterprise".into())]);

        let details = provider.resolve_int_value("targeted", 0, &context);
        assert_eq!(details.value, 100);
        assert_eq!(details.reason, Some(Reason::TargetingMatch));

        let details = provider.resolve_int_value("targeted", 0, &FlattenedContext::new());
        assert_eq!(details.value, 1);
        assert_eq!(details.reason, Some(Reason::Default));
    }

    #[test]
    fn missing_flag_and_type_mismatch_return_default() {
        let provider = provider();

        let details = provider.resolve_string_value("missing", "d".to_owned(), &FlattenedContext::new());
        assert_eq!(details.value, "d");
        assert_eq!(details.error.unwrap().code, ErrorCode::FlagNotFound);

        let details = provider.resolve_string_value("boolean", "d".to_owned(), &FlattenedContext::new());
        assert_eq!(details.value, "d");
        assert_eq!(details.error.unwrap().code, ErrorCode::TypeMismatch);
    }

    #[test]
    fn disabled_flag_serves_default_variant() {
        let provider = InMemoryProvider::new(HashMap::from([(
            "boolean".to_owned(),
            InMemoryFlag::new("off", [("on", true.into()), ("off", false.into())])
                .with_state(FlagState::Disabled),
        )]));

        let details = provider.resolve_bool_value("boolean", true, &FlattenedContext::new());

        assert!(!details.value);
        assert_eq!(details.reason, Some(Reason::Disabled));
    }

    #[test]
    fn update_flags_publishes_configuration_change() {
        let provider = provider();
        let mut events = provider.subscribe();

        provider.update_flags(HashMap::from([(
            "boolean".to_owned(),
            InMemoryFlag::new("off", [("on", true.into()), ("off", false.into())]),
        )]));

        let event = events.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::ProviderConfigurationChanged);
        assert_eq!(event.flags_changed, ["boolean"]);
        assert!(!provider.resolve_bool_value("boolean", true, &FlattenedContext::new()).value);
        // Untouched flags are kept.
        assert_eq!(
            provider
                .resolve_int_value("targeted", 0, &FlattenedContext::new())
                .value,
            1
        );
    }
}
