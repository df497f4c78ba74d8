//! Vendor-neutral feature flag evaluation API.
//!
//! # Overview
//!
//! Applications evaluate flags through a [`Client`]. Each client belongs to a *domain* and
//! evaluates against the [`FeatureProvider`] bound to that domain, or against the default
//! provider when the domain has none. Providers are pluggable backends; binding and swapping
//! them happens at runtime without disturbing evaluations in flight.
//!
//! Evaluations take an [`EvaluationContext`] merged from four layers (API, transaction, client,
//! invocation) and run [`Hook`]s around the provider call. Provider lifecycle transitions and
//! evaluation failures are published as events to handlers registered with
//! [`add_handler`] or [`Client::add_handler`].
//!
//! The crate-level functions ([`set_provider`], [`client`], [`shutdown`], ...) operate on a
//! process-wide [`FeatureApi`]. Tests and embedders can create isolated instances with
//! [`FeatureApi::new`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Flag evaluation never fails hard: the `*_details` methods always return the caller's default
//! value on error, and the `*_value` methods return the error alongside. Feature flag evaluation
//! should not be critical enough to cause system crashes, but the returned errors are valuable
//! for debugging.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with target `flagbridge`
//! for logging messages. Consider integrating a `log`-compatible logger implementation for better
//! visibility into provider lifecycle and event dispatch.
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use flagbridge::{CallContext, CancellationToken, NoopProvider};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> flagbridge::Result<()> {
//! flagbridge::set_provider_and_wait(CancellationToken::new(), Arc::new(NoopProvider)).await?;
//!
//! let client = flagbridge::client("checkout");
//! let enabled = client.boolean_value(&CallContext::new(), "new-checkout", false, None, None)?;
//! # let _ = enabled;
//! flagbridge::shutdown(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! A runnable demo lives in `demos/basic.rs`.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod api;
mod attributes;
mod background;
mod call_context;
mod client;
mod config;
mod error;
mod eval_details;
mod evaluation_context;
mod event_executor;
mod events;
mod global;
mod hooks;
mod memprovider;
mod provider;
mod provider_registry;

pub use api::FeatureApi;
pub use attributes::{AttributeValue, Attributes};
pub use call_context::{
    merge_transaction_context, transaction_context, with_transaction_context, CallContext,
};
pub use client::Client;
pub use config::FeatureApiConfig;
pub use error::{Error, ErrorCode, HookError, ProviderInitError, ResolutionError, Result};
pub use eval_details::{
    EvaluationDetails, FlagMetadata, FlagType, FlagValue, FlagValueType, Reason,
    ResolutionDetails,
};
pub use evaluation_context::{EvaluationContext, FlattenedContext, TARGETING_KEY};
pub use events::{event_callback, EventCallback, EventDetails, EventType, ProviderEvent};
pub use global::{
    add_handler, add_hooks, api, client, default_client, named_provider_metadata,
    provider_metadata, provider_status, remove_handler, set_evaluation_context,
    set_named_provider, set_named_provider_and_wait, set_provider, set_provider_and_wait,
    shutdown,
};
pub use hooks::{ClientMetadata, EvaluationOptions, Hook, HookContext, HookHints};
pub use memprovider::{ContextEvaluator, FlagState, InMemoryFlag, InMemoryProvider};
pub use provider::{
    EventEmitter, FeatureProvider, IntoProvider, NoopProvider, ProviderMetadata, ProviderStatus,
    StateHandler,
};
pub use tokio_util::sync::CancellationToken;
