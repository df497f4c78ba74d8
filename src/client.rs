use std::sync::Arc;

use crate::{
    evaluation_context::merge_layers,
    event_executor::HandlerScope,
    events::ProviderEvent,
    hooks::{ClientMetadata, HookContext, HookHints},
    CallContext, Error, EvaluationContext, EvaluationDetails, EvaluationOptions, EventCallback,
    EventType, FeatureApi, FeatureProvider, FlagValue, FlagValueType, Hook, HookError,
    NoopProvider, ProviderStatus, Reason, Result,
};

/// A client evaluates flags against the provider bound to its domain.
///
/// Clients are obtained from [`FeatureApi::client`] (or [`crate::client`] for the process-wide
/// API). They are cheap to create and always evaluate against the provider currently bound to
/// their domain, falling back to the default provider when the domain has none.
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use flagbridge::{CallContext, CancellationToken, FeatureApi, NoopProvider};
/// # async fn test() -> flagbridge::Result<()> {
/// let api = FeatureApi::new();
/// api.set_provider_and_wait(CancellationToken::new(), "", Arc::new(NoopProvider)).await?;
///
/// let client = api.client("checkout");
/// let enabled = client.boolean_value(&CallContext::new(), "new-checkout", false, None, None)?;
/// assert!(!enabled);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    api: FeatureApi,
    domain: String,
    evaluation_context: EvaluationContext,
    hooks: Vec<Arc<dyn Hook>>,
}

impl Client {
    pub(crate) fn new(api: FeatureApi, domain: String) -> Client {
        Client {
            api,
            domain,
            evaluation_context: EvaluationContext::default(),
            hooks: Vec::new(),
        }
    }

    /// Metadata handed to hooks.
    pub fn metadata(&self) -> ClientMetadata {
        ClientMetadata {
            domain: self.domain.clone(),
        }
    }

    /// Domain the client evaluates in. Empty for the default domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Replace the client-level evaluation context.
    pub fn set_evaluation_context(&mut self, evaluation_context: EvaluationContext) {
        self.evaluation_context = evaluation_context;
    }

    /// The client-level evaluation context.
    pub fn evaluation_context(&self) -> &EvaluationContext {
        &self.evaluation_context
    }

    /// Append client-level hooks.
    pub fn add_hooks(&mut self, hooks: impl IntoIterator<Item = Arc<dyn Hook>>) {
        self.hooks.extend(hooks);
    }

    /// Register a handler for events of this client's domain.
    ///
    /// While the domain has no provider of its own, the handler also receives events of the
    /// default provider. If the provider already is in the status `event_type` reports, the
    /// handler is invoked once right away.
    pub fn add_handler(&self, event_type: EventType, callback: EventCallback) {
        self.api.add_scoped_handler(
            HandlerScope::Domain(self.domain.clone()),
            event_type,
            callback,
        );
    }

    /// Remove the first registration of `callback` for `event_type` made through this domain.
    pub fn remove_handler(&self, event_type: EventType, callback: &EventCallback) {
        self.api.remove_scoped_handler(
            HandlerScope::Domain(self.domain.clone()),
            event_type,
            callback,
        );
    }

    /// Status of the provider this client evaluates against.
    pub fn provider_status(&self) -> ProviderStatus {
        self.api.provider_status(&self.domain)
    }

    /// Evaluate a boolean flag.
    ///
    /// # Errors
    ///
    /// Returns the evaluation error, if any. See [`Client::evaluate_with_options`] for the
    /// variant that always returns details.
    ///
    /// # Examples
    /// ```
    /// # fn test(client: &flagbridge::Client) {
    /// use flagbridge::CallContext;
    ///
    /// let enabled = client
    ///     .boolean_value(&CallContext::new(), "new-checkout", false, None, None)
    ///     .unwrap_or(false);
    /// # }
    /// ```
    pub fn boolean_value(
        &self,
        ctx: &CallContext,
        flag_key: &str,
        default_value: bool,
        context: Option<&EvaluationContext>,
        options: Option<&EvaluationOptions>,
    ) -> Result<bool> {
        self.value(ctx, flag_key, default_value, context, options)
    }

    /// Evaluate a boolean flag, returning full details. On error the details hold
    /// `default_value`.
    pub fn boolean_details(
        &self,
        ctx: &CallContext,
        flag_key: &str,
        default_value: bool,
        context: Option<&EvaluationContext>,
        options: Option<&EvaluationOptions>,
    ) -> EvaluationDetails<bool> {
        self.evaluate_with_options(ctx, flag_key, default_value, context, options)
    }

    /// Evaluate a string flag.
    ///
    /// # Errors
    ///
    /// Returns the evaluation error, if any.
    pub fn string_value(
        &self,
        ctx: &CallContext,
        flag_key: &str,
        default_value: impl Into<String>,
        context: Option<&EvaluationContext>,
        options: Option<&EvaluationOptions>,
    ) -> Result<String> {
        self.value(ctx, flag_key, default_value.into(), context, options)
    }

    /// Evaluate a string flag, returning full details.
    pub fn string_details(
        &self,
        ctx: &CallContext,
        flag_key: &str,
        default_value: impl Into<String>,
        context: Option<&EvaluationContext>,
        options: Option<&EvaluationOptions>,
    ) -> EvaluationDetails<String> {
        self.evaluate_with_options(ctx, flag_key, default_value.into(), context, options)
    }

    /// Evaluate an integer flag.
    ///
    /// # Errors
    ///
    /// Returns the evaluation error, if any.
    pub fn int_value(
        &self,
        ctx: &CallContext,
        flag_key: &str,
        default_value: i64,
        context: Option<&EvaluationContext>,
        options: Option<&EvaluationOptions>,
    ) -> Result<i64> {
        self.value(ctx, flag_key, default_value, context, options)
    }

    /// Evaluate an integer flag, returning full details.
    pub fn int_details(
        &self,
        ctx: &CallContext,
        flag_key: &str,
        default_value: i64,
        context: Option<&EvaluationContext>,
        options: Option<&EvaluationOptions>,
    ) -> EvaluationDetails<i64> {
        self.evaluate_with_options(ctx, flag_key, default_value, context, options)
    }

    /// Evaluate a float flag.
    ///
    /// # Errors
    ///
    /// Returns the evaluation error, if any.
    pub fn float_value(
        &self,
        ctx: &CallContext,
        flag_key: &str,
        default_value: f64,
        context: Option<&EvaluationContext>,
        options: Option<&EvaluationOptions>,
    ) -> Result<f64> {
        self.value(ctx, flag_key, default_value, context, options)
    }

    /// Evaluate a float flag, returning full details.
    pub fn float_details(
        &self,
        ctx: &CallContext,
        flag_key: &str,
        default_value: f64,
        context: Option<&EvaluationContext>,
        options: Option<&EvaluationOptions>,
    ) -> EvaluationDetails<f64> {
        self.evaluate_with_options(ctx, flag_key, default_value, context, options)
    }

    /// Evaluate a structured (JSON) flag.
    ///
    /// # Errors
    ///
    /// Returns the evaluation error, if any.
    pub fn object_value(
        &self,
        ctx: &CallContext,
        flag_key: &str,
        default_value: serde_json::Value,
        context: Option<&EvaluationContext>,
        options: Option<&EvaluationOptions>,
    ) -> Result<serde_json::Value> {
        self.value(ctx, flag_key, default_value, context, options)
    }

    /// Evaluate a structured (JSON) flag, returning full details.
    pub fn object_details(
        &self,
        ctx: &CallContext,
        flag_key: &str,
        default_value: serde_json::Value,
        context: Option<&EvaluationContext>,
        options: Option<&EvaluationOptions>,
    ) -> EvaluationDetails<serde_json::Value> {
        self.evaluate_with_options(ctx, flag_key, default_value, context, options)
    }

    /// Evaluate a flag of any supported type.
    ///
    /// Never fails: on error the returned details hold `default_value`, [`Reason::Error`], and
    /// the error code and message.
    ///
    /// The evaluation context is merged from, lowest to highest precedence: the API-level
    /// context, the transaction context attached to `ctx`, the client context, and `context`.
    pub fn evaluate_with_options<T: FlagValueType>(
        &self,
        ctx: &CallContext,
        flag_key: &str,
        default_value: T,
        context: Option<&EvaluationContext>,
        options: Option<&EvaluationOptions>,
    ) -> EvaluationDetails<T> {
        self.evaluate(ctx, flag_key, default_value, context, options)
            .0
    }

    fn value<T: FlagValueType>(
        &self,
        ctx: &CallContext,
        flag_key: &str,
        default_value: T,
        context: Option<&EvaluationContext>,
        options: Option<&EvaluationOptions>,
    ) -> Result<T> {
        match self.evaluate(ctx, flag_key, default_value, context, options) {
            (details, None) => Ok(details.value),
            (_, Some(err)) => Err(err),
        }
    }

    fn evaluate<T: FlagValueType>(
        &self,
        ctx: &CallContext,
        flag_key: &str,
        default_value: T,
        context: Option<&EvaluationContext>,
        options: Option<&EvaluationOptions>,
    ) -> (EvaluationDetails<T>, Option<Error>) {
        // Snapshot the binding. A concurrent swap does not affect this evaluation.
        let (provider, status): (Arc<dyn FeatureProvider>, ProviderStatus) =
            match self.api.resolve_entry(&self.domain) {
                Some(entry) => (entry.provider().clone(), entry.status()),
                None => (Arc::new(NoopProvider), ProviderStatus::NotReady),
            };

        let api_context = self.api.evaluation_context();
        let transaction_context = ctx.transaction_context();
        let invocation_context = context.cloned().unwrap_or_default();
        let merged = merge_layers([
            &api_context,
            &transaction_context,
            &self.evaluation_context,
            &invocation_context,
        ]);

        let options = options.cloned().unwrap_or_default();
        let hooks: Vec<Arc<dyn Hook>> = self
            .api
            .hooks()
            .into_iter()
            .chain(self.hooks.iter().cloned())
            .chain(options.hooks.iter().cloned())
            .chain(provider.hooks())
            .collect();
        let hints = &options.hook_hints;

        let mut hook_ctx = HookContext {
            flag_key: flag_key.to_owned(),
            flag_type: T::FLAG_TYPE,
            default_value: default_value.clone().into(),
            evaluation_context: merged,
            client_metadata: self.metadata(),
            provider_metadata: provider.metadata(),
        };

        let outcome = if status == ProviderStatus::Fatal {
            Err(Error::ProviderFatal)
        } else {
            run_before_hooks(&hooks, &mut hook_ctx, hints)
                .and_then(|()| resolve(&*provider, &hook_ctx, default_value.clone()))
                .and_then(|details| {
                    run_after_hooks(&hooks, &hook_ctx, &details.clone().map(Into::into), hints)?;
                    Ok(details)
                })
        };

        let (details, error) = match outcome {
            Ok(details) => (details, None),
            Err(err) => {
                let mut hook_failures = Vec::new();
                for hook in hooks.iter().rev() {
                    if let Err(hook_err) = hook.error(&hook_ctx, &err, hints) {
                        log::warn!(target: "flagbridge", flag_key; "error hook failed: {hook_err}");
                        hook_failures.push(hook_err);
                    }
                }
                (
                    error_details(flag_key, default_value, &err, &hook_failures),
                    Some(err),
                )
            }
        };

        let erased: EvaluationDetails<FlagValue> = details.clone().map(Into::into);
        for hook in hooks.iter().rev() {
            hook.finally(&hook_ctx, &erased, hints);
        }

        log::trace!(target: "flagbridge",
                    flag_key,
                    domain = self.domain.as_str(),
                    provider = hook_ctx.provider_metadata.name.as_str(),
                    value:serde = &erased.value,
                    error_code:serde = details.error_code;
                    "evaluated a flag");

        if let Some(err) = &error {
            log::debug!(target: "flagbridge", flag_key, domain = self.domain.as_str(); "flag evaluation failed: {err}");
            self.api.executor().emit(
                &self.domain,
                &hook_ctx.provider_metadata.name,
                ProviderEvent::new(EventType::EvaluationError, format!("{flag_key}: {err}"))
                    .with_error_code(err.code()),
            );
        }

        (details, error)
    }
}

fn run_before_hooks(
    hooks: &[Arc<dyn Hook>],
    hook_ctx: &mut HookContext,
    hints: &HookHints,
) -> Result<()> {
    for hook in hooks {
        if let Some(context) = hook.before(hook_ctx, hints)? {
            hook_ctx.evaluation_context = hook_ctx.evaluation_context.merge(&context);
        }
    }
    Ok(())
}

fn run_after_hooks(
    hooks: &[Arc<dyn Hook>],
    hook_ctx: &HookContext,
    details: &EvaluationDetails<FlagValue>,
    hints: &HookHints,
) -> Result<()> {
    for hook in hooks.iter().rev() {
        hook.after(hook_ctx, details, hints)?;
    }
    Ok(())
}

fn resolve<T: FlagValueType>(
    provider: &dyn FeatureProvider,
    hook_ctx: &HookContext,
    default_value: T,
) -> Result<EvaluationDetails<T>> {
    let flattened = hook_ctx.evaluation_context.flattened();
    let resolution = T::resolve(provider, &hook_ctx.flag_key, default_value, &flattened);

    if let Some(err) = resolution.error {
        return Err(Error::FlagEvaluation(err));
    }

    Ok(EvaluationDetails {
        flag_key: hook_ctx.flag_key.clone(),
        flag_type: T::FLAG_TYPE,
        value: resolution.value,
        variant: resolution.variant,
        reason: resolution.reason,
        error_code: None,
        error_message: None,
        flag_metadata: resolution.flag_metadata,
    })
}

/// Details for a failed evaluation. Failures of `error` hooks are appended to the message.
fn error_details<T: FlagValueType>(
    flag_key: &str,
    default_value: T,
    error: &Error,
    hook_failures: &[HookError],
) -> EvaluationDetails<T> {
    let mut error_message = match error {
        Error::FlagEvaluation(err) => err.message.clone(),
        err => Some(err.to_string()),
    };
    if !hook_failures.is_empty() {
        let mut message = error_message.unwrap_or_else(|| error.to_string());
        for failure in hook_failures {
            message.push_str("; error ");
            message.push_str(&failure.to_string());
        }
        error_message = Some(message);
    }
    EvaluationDetails {
        flag_key: flag_key.to_owned(),
        flag_type: T::FLAG_TYPE,
        value: default_value,
        variant: None,
        reason: Some(Reason::Error),
        error_code: Some(error.code()),
        error_message,
        flag_metadata: Default::default(),
    }
}
