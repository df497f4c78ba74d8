use serde::{Deserialize, Serialize};

/// Represents a result type for operations in this crate.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors returned by the API, clients, and the provider lifecycle.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// No provider was supplied when binding a domain.
    #[error("provider cannot be empty")]
    InvalidProvider,

    /// Provider initialization failed.
    #[error(transparent)]
    ProviderInit(ProviderInitError),

    /// Evaluation was attempted against a provider in [`Fatal`](crate::ProviderStatus::Fatal)
    /// status.
    #[error("provider is in an irrecoverable error state")]
    ProviderFatal,

    /// The caller's cancellation token fired (or a timeout elapsed) during a waiting call.
    #[error("operation cancelled")]
    ContextCancelled,

    /// First error reported while shutting providers down. Further errors are only logged.
    #[error("provider shutdown failed: {0}")]
    ProviderShutdown(String),

    /// Provider reported a resolution failure.
    #[error(transparent)]
    FlagEvaluation(ResolutionError),

    /// A hook failed during the `before`, `after`, or `error` stage.
    #[error(transparent)]
    Hook(HookError),
}

impl Error {
    /// Resolution error code this error is reported with in
    /// [`EvaluationDetails`](crate::EvaluationDetails) and events.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ProviderFatal => ErrorCode::ProviderFatal,
            Error::ProviderInit(err) => err.code,
            Error::FlagEvaluation(err) => err.code,
            Error::InvalidProvider
            | Error::ContextCancelled
            | Error::ProviderShutdown(_)
            | Error::Hook(_) => ErrorCode::General,
        }
    }
}

impl From<ResolutionError> for Error {
    fn from(value: ResolutionError) -> Self {
        Error::FlagEvaluation(value)
    }
}

impl From<ProviderInitError> for Error {
    fn from(value: ProviderInitError) -> Self {
        Error::ProviderInit(value)
    }
}

impl From<HookError> for Error {
    fn from(value: HookError) -> Self {
        Error::Hook(value)
    }
}

/// Resolution error codes shared by providers, clients, and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    /// The provider has not yet been initialized.
    ProviderNotReady,
    /// The provider is in an irrecoverable error state.
    ProviderFatal,
    /// The requested flag could not be found.
    FlagNotFound,
    /// An error was encountered parsing data, such as a flag configuration.
    ParseError,
    /// The type of the flag value does not match the expected type.
    TypeMismatch,
    /// The provider requires a targeting key and one was not provided.
    TargetingKeyMissing,
    /// The evaluation context does not meet provider requirements.
    InvalidContext,
    /// Any other error.
    General,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::ProviderNotReady => "PROVIDER_NOT_READY",
            ErrorCode::ProviderFatal => "PROVIDER_FATAL",
            ErrorCode::FlagNotFound => "FLAG_NOT_FOUND",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::TypeMismatch => "TYPE_MISMATCH",
            ErrorCode::TargetingKeyMissing => "TARGETING_KEY_MISSING",
            ErrorCode::InvalidContext => "INVALID_CONTEXT",
            ErrorCode::General => "GENERAL",
        };
        f.write_str(s)
    }
}

/// Error reported by a provider while resolving a flag.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{code}: {}", message.as_deref().unwrap_or("flag evaluation failed"))]
pub struct ResolutionError {
    /// Code reported to the caller.
    pub code: ErrorCode,
    /// Optional human-readable explanation.
    pub message: Option<String>,
}

impl ResolutionError {
    /// Resolution error with a message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> ResolutionError {
        ResolutionError {
            code,
            message: Some(message.into()),
        }
    }
}

impl From<ErrorCode> for ResolutionError {
    fn from(code: ErrorCode) -> Self {
        ResolutionError {
            code,
            message: None,
        }
    }
}

/// Error returned from a provider's `init`.
///
/// Initialization errors carrying [`ErrorCode::ProviderFatal`] move the provider to
/// [`Fatal`](crate::ProviderStatus::Fatal) status; every other code moves it to
/// [`Error`](crate::ProviderStatus::Error).
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("provider initialization failed ({code}): {message}")]
pub struct ProviderInitError {
    /// [`ErrorCode::ProviderFatal`] for unrecoverable failures, [`ErrorCode::General`] otherwise.
    pub code: ErrorCode,
    /// Human-readable explanation, forwarded in the `ProviderError` event.
    pub message: String,
}

impl ProviderInitError {
    /// A recoverable initialization failure.
    pub fn new(message: impl Into<String>) -> ProviderInitError {
        ProviderInitError {
            code: ErrorCode::General,
            message: message.into(),
        }
    }

    /// An unrecoverable initialization failure.
    pub fn fatal(message: impl Into<String>) -> ProviderInitError {
        ProviderInitError {
            code: ErrorCode::ProviderFatal,
            message: message.into(),
        }
    }

    pub(crate) fn cancelled() -> ProviderInitError {
        ProviderInitError::new(Error::ContextCancelled.to_string())
    }
}

/// Error returned from a [`Hook`](crate::Hook) stage.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("hook failed: {0}")]
pub struct HookError(pub String);

impl HookError {
    /// Hook error with `message`.
    pub fn new(message: impl Into<String>) -> HookError {
        HookError(message.into())
    }
}
