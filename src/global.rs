//! Process-wide API instance.
//!
//! Every function here delegates to one lazily created [`FeatureApi`]. Applications that prefer
//! explicit wiring can create their own instances instead.
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::{
    Client, EvaluationContext, EventCallback, EventType, FeatureApi, Hook, IntoProvider,
    ProviderMetadata, ProviderStatus, Result,
};

static API: OnceLock<FeatureApi> = OnceLock::new();

/// The process-wide API instance.
pub fn api() -> &'static FeatureApi {
    API.get_or_init(FeatureApi::new)
}

/// Bind the default provider. See [`FeatureApi::set_provider`].
pub fn set_provider(cancel: CancellationToken, provider: impl IntoProvider) -> Result<()> {
    api().set_provider(cancel, "", provider)
}

/// Bind the default provider and wait for its initialization. See
/// [`FeatureApi::set_provider_and_wait`].
pub async fn set_provider_and_wait(
    cancel: CancellationToken,
    provider: impl IntoProvider,
) -> Result<()> {
    api().set_provider_and_wait(cancel, "", provider).await
}

/// Bind a provider to `domain`.
pub fn set_named_provider(
    cancel: CancellationToken,
    domain: &str,
    provider: impl IntoProvider,
) -> Result<()> {
    api().set_provider(cancel, domain, provider)
}

/// Bind a provider to `domain` and wait for its initialization.
pub async fn set_named_provider_and_wait(
    cancel: CancellationToken,
    domain: &str,
    provider: impl IntoProvider,
) -> Result<()> {
    api().set_provider_and_wait(cancel, domain, provider).await
}

/// Metadata of the default provider.
pub fn provider_metadata() -> ProviderMetadata {
    api().provider_metadata("")
}

/// Metadata of the provider bound to `domain`.
pub fn named_provider_metadata(domain: &str) -> ProviderMetadata {
    api().provider_metadata(domain)
}

/// See [`FeatureApi::provider_status`].
pub fn provider_status(domain: &str) -> ProviderStatus {
    api().provider_status(domain)
}

/// Replace the global evaluation context.
pub fn set_evaluation_context(evaluation_context: EvaluationContext) {
    api().set_evaluation_context(evaluation_context);
}

/// Append global hooks.
pub fn add_hooks(hooks: impl IntoIterator<Item = Arc<dyn Hook>>) {
    api().add_hooks(hooks);
}

/// See [`FeatureApi::add_handler`].
pub fn add_handler(event_type: EventType, callback: EventCallback) {
    api().add_handler(event_type, callback);
}

/// See [`FeatureApi::remove_handler`].
pub fn remove_handler(event_type: EventType, callback: &EventCallback) {
    api().remove_handler(event_type, callback);
}

/// Shut down every provider and reset the process-wide API. See [`FeatureApi::shutdown`].
pub async fn shutdown(cancel: CancellationToken) -> Result<()> {
    api().shutdown(cancel).await
}

/// Client of the default domain.
pub fn default_client() -> Client {
    api().default_client()
}

/// Client bound to `domain`.
pub fn client(domain: impl Into<String>) -> Client {
    api().client(domain)
}
