//! Hooks run around every flag evaluation.
use std::{collections::HashMap, sync::Arc};

use crate::{
    error::HookError, EvaluationContext, EvaluationDetails, Error, FlagType, FlagValue,
    ProviderMetadata,
};

/// Arbitrary data passed by the caller to every hook of an evaluation.
pub type HookHints = HashMap<String, serde_json::Value>;

/// Metadata describing the client that performs an evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMetadata {
    /// Domain of the client. Empty for the default domain.
    pub domain: String,
}

/// Evaluation facts shared by all hook stages.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Key of the flag being evaluated.
    pub flag_key: String,
    /// Type the caller requested.
    pub flag_type: FlagType,
    /// The caller's default value.
    pub default_value: FlagValue,
    /// Merged context. Updated with contexts returned from [`Hook::before`].
    pub evaluation_context: EvaluationContext,
    /// Client performing the evaluation.
    pub client_metadata: ClientMetadata,
    /// Provider the evaluation runs against.
    pub provider_metadata: ProviderMetadata,
}

/// A hook observes (and may enrich) flag evaluations.
///
/// All stages have no-op defaults. Hooks run in the `before` stage in the order API, client,
/// invocation, provider; the `after`, `error`, and `finally` stages run in reverse.
///
/// A failing `before` hook aborts the remaining `before` hooks and the provider call; a failing
/// `after` hook turns the evaluation into an error. `finally` always runs.
pub trait Hook: Send + Sync {
    /// Runs before the provider is called. A returned context is merged over the current one,
    /// winning on conflicts.
    fn before(
        &self,
        _ctx: &HookContext,
        _hints: &HookHints,
    ) -> Result<Option<EvaluationContext>, HookError> {
        Ok(None)
    }

    /// Runs after a successful resolution.
    fn after(
        &self,
        _ctx: &HookContext,
        _details: &EvaluationDetails<FlagValue>,
        _hints: &HookHints,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs when the evaluation fails, including failures of other hooks. A failure here is
    /// appended to the `error_message` of the returned details.
    fn error(&self, _ctx: &HookContext, _error: &Error, _hints: &HookHints) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs last, unconditionally.
    fn finally(&self, _ctx: &HookContext, _details: &EvaluationDetails<FlagValue>, _hints: &HookHints) {
    }
}

/// Per-invocation evaluation options.
#[derive(Clone, Default)]
pub struct EvaluationOptions {
    /// Invocation hooks. They run after API and client hooks in the `before` stage.
    pub hooks: Vec<Arc<dyn Hook>>,
    /// Hints passed to every hook stage.
    pub hook_hints: HookHints,
}

impl EvaluationOptions {
    /// Options with no hooks and no hints.
    pub fn new() -> EvaluationOptions {
        EvaluationOptions::default()
    }

    /// Append an invocation hook.
    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Add a hook hint.
    pub fn with_hint(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.hook_hints.insert(key.into(), value);
        self
    }
}

impl std::fmt::Debug for EvaluationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationOptions")
            .field("hooks", &self.hooks.len())
            .field("hook_hints", &self.hook_hints)
            .finish()
    }
}
