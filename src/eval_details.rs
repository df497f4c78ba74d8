use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{error::ResolutionError, ErrorCode, FeatureProvider, FlattenedContext};

/// Arbitrary provider-supplied metadata attached to a resolved flag.
pub type FlagMetadata = HashMap<String, serde_json::Value>;

/// Type of a flag value requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagType {
    /// `bool`.
    Boolean,
    /// `String`.
    String,
    /// `i64`.
    Integer,
    /// `f64`.
    Float,
    /// Structured JSON value.
    Object,
}

/// A type-erased flag value. Used where hooks observe evaluations of any type.
#[derive(Debug, Clone, PartialEq, From, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    /// A boolean value.
    Boolean(bool),
    /// An integer value.
    Integer(i64),
    /// A float value.
    Float(f64),
    /// A string value.
    String(String),
    /// A structured JSON value.
    Object(serde_json::Value),
}

impl FlagValue {
    /// The [`FlagType`] of this value.
    pub fn flag_type(&self) -> FlagType {
        match self {
            FlagValue::Boolean(_) => FlagType::Boolean,
            FlagValue::Integer(_) => FlagType::Integer,
            FlagValue::Float(_) => FlagType::Float,
            FlagValue::String(_) => FlagType::String,
            FlagValue::Object(_) => FlagType::Object,
        }
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::String(value.to_owned())
    }
}

/// Reason a provider resolved a flag to a particular value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum Reason {
    /// The resolved value is static (no dynamic evaluation).
    Static,
    /// The resolved value fell back to a pre-configured value.
    Default,
    /// The resolved value was the result of a dynamic evaluation, such as a rule or specific
    /// user-targeting.
    TargetingMatch,
    /// The resolved value was the result of pseudorandom assignment.
    Split,
    /// The resolved value was retrieved from cache.
    Cached,
    /// The resolved value was the result of the flag being disabled.
    Disabled,
    /// The reason for the resolved value could not be determined.
    Unknown,
    /// The resolved value is non-authoritative or possibly out of date.
    Stale,
    /// The resolved value was the result of an error.
    Error,
}

/// Provider answer to a resolution request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionDetails<T> {
    /// Resolved value.
    pub value: T,
    /// Provider-specific identifier of the resolved variant.
    pub variant: Option<String>,
    /// Why the provider resolved to `value`.
    pub reason: Option<Reason>,
    /// Set when resolution failed. `value` then holds the default value.
    pub error: Option<ResolutionError>,
    /// Provider-supplied metadata.
    pub flag_metadata: FlagMetadata,
}

impl<T> ResolutionDetails<T> {
    /// Successful resolution with no variant or reason.
    pub fn new(value: T) -> ResolutionDetails<T> {
        ResolutionDetails {
            value,
            variant: None,
            reason: None,
            error: None,
            flag_metadata: FlagMetadata::new(),
        }
    }

    /// Failed resolution returning `default_value`.
    pub fn error(default_value: T, error: impl Into<ResolutionError>) -> ResolutionDetails<T> {
        ResolutionDetails {
            value: default_value,
            variant: None,
            reason: Some(Reason::Error),
            error: Some(error.into()),
            flag_metadata: FlagMetadata::new(),
        }
    }

    /// Set the reason.
    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Set the variant.
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }
}

/// Result of a flag evaluation as returned to the caller.
///
/// On failure `value` holds the caller-supplied default, `reason` is [`Reason::Error`], and
/// `error_code`/`error_message` describe what went wrong.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetails<T> {
    /// Key of the evaluated flag.
    pub flag_key: String,
    /// Type the caller requested.
    pub flag_type: FlagType,
    /// Resolved value, or the caller's default on error.
    pub value: T,
    /// Variant reported by the provider.
    pub variant: Option<String>,
    /// Reason reported by the provider. [`Reason::Error`] on failure.
    pub reason: Option<Reason>,
    /// Set if and only if the evaluation failed.
    pub error_code: Option<ErrorCode>,
    /// Explanation of the failure, including failures of `error` hooks.
    pub error_message: Option<String>,
    /// Provider-supplied metadata.
    pub flag_metadata: FlagMetadata,
}

impl<T> EvaluationDetails<T> {
    /// Map `EvaluationDetails.value` using the `f` function.
    pub fn map<T2, F: FnOnce(T) -> T2>(self, f: F) -> EvaluationDetails<T2> {
        EvaluationDetails {
            flag_key: self.flag_key,
            flag_type: self.flag_type,
            value: f(self.value),
            variant: self.variant,
            reason: self.reason,
            error_code: self.error_code,
            error_message: self.error_message,
            flag_metadata: self.flag_metadata,
        }
    }

    /// Whether the evaluation failed.
    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }
}

mod private {
    pub trait Sealed {}
    impl Sealed for bool {}
    impl Sealed for String {}
    impl Sealed for i64 {}
    impl Sealed for f64 {}
    impl Sealed for serde_json::Value {}
}

/// Flag value types the client can evaluate. Sealed.
pub trait FlagValueType: private::Sealed + Clone + Into<FlagValue> + Send + 'static {
    /// Type reported in [`EvaluationDetails::flag_type`].
    const FLAG_TYPE: FlagType;

    #[doc(hidden)]
    fn resolve(
        provider: &dyn FeatureProvider,
        flag_key: &str,
        default_value: Self,
        context: &FlattenedContext,
    ) -> ResolutionDetails<Self>;
}

impl FlagValueType for bool {
    const FLAG_TYPE: FlagType = FlagType::Boolean;

    fn resolve(
        provider: &dyn FeatureProvider,
        flag_key: &str,
        default_value: Self,
        context: &FlattenedContext,
    ) -> ResolutionDetails<Self> {
        provider.resolve_bool_value(flag_key, default_value, context)
    }
}

impl FlagValueType for String {
    const FLAG_TYPE: FlagType = FlagType::String;

    fn resolve(
        provider: &dyn FeatureProvider,
        flag_key: &str,
        default_value: Self,
        context: &FlattenedContext,
    ) -> ResolutionDetails<Self> {
        provider.resolve_string_value(flag_key, default_value, context)
    }
}

impl FlagValueType for i64 {
    const FLAG_TYPE: FlagType = FlagType::Integer;

    fn resolve(
        provider: &dyn FeatureProvider,
        flag_key: &str,
        default_value: Self,
        context: &FlattenedContext,
    ) -> ResolutionDetails<Self> {
        provider.resolve_int_value(flag_key, default_value, context)
    }
}

impl FlagValueType for f64 {
    const FLAG_TYPE: FlagType = FlagType::Float;

    fn resolve(
        provider: &dyn FeatureProvider,
        flag_key: &str,
        default_value: Self,
        context: &FlattenedContext,
    ) -> ResolutionDetails<Self> {
        provider.resolve_float_value(flag_key, default_value, context)
    }
}

impl FlagValueType for serde_json::Value {
    const FLAG_TYPE: FlagType = FlagType::Object;

    fn resolve(
        provider: &dyn FeatureProvider,
        flag_key: &str,
        default_value: Self,
        context: &FlattenedContext,
    ) -> ResolutionDetails<Self> {
        provider.resolve_object_value(flag_key, default_value, context)
    }
}
