//! Request-scoped carrier for cancellation and transaction evaluation context.
use tokio_util::sync::CancellationToken;

use crate::EvaluationContext;

/// `CallContext` travels with a request through the application call chain.
///
/// It carries a cancellation token and, optionally, a *transaction context*: an
/// [`EvaluationContext`] that is set once (e.g., by request middleware) and picked up by every
/// evaluation made further down the call chain. A `CallContext` is a value; the `with_*` and
/// `merge_*` methods return a new carrier and leave the original untouched.
///
/// ```
/// # use flagbridge::{CallContext, EvaluationContext};
/// let ctx = CallContext::new()
///     .merge_transaction_context(EvaluationContext::new("user-1", Default::default()));
/// assert_eq!(ctx.transaction_context().targeting_key(), "user-1");
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancellation: CancellationToken,
    transaction: Option<EvaluationContext>,
}

impl CallContext {
    /// Create a carrier with a fresh, uncancelled token and no transaction context.
    pub fn new() -> CallContext {
        CallContext::default()
    }

    /// Create a carrier bound to an existing cancellation token.
    pub fn with_cancellation(cancellation: CancellationToken) -> CallContext {
        CallContext {
            cancellation,
            transaction: None,
        }
    }

    /// The token waiting operations observe.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Returns a carrier with the transaction context replaced by `ec`.
    pub fn with_transaction_context(&self, ec: EvaluationContext) -> CallContext {
        CallContext {
            cancellation: self.cancellation.clone(),
            transaction: Some(ec),
        }
    }

    /// Returns a carrier with `ec` merged over the current transaction context. Attributes of
    /// `ec` win on conflict; attributes only present in the current context are kept.
    pub fn merge_transaction_context(&self, ec: EvaluationContext) -> CallContext {
        let merged = match &self.transaction {
            Some(current) => current.merge(&ec),
            None => ec,
        };
        self.with_transaction_context(merged)
    }

    /// The attached transaction context, or an empty context if none is attached.
    pub fn transaction_context(&self) -> EvaluationContext {
        self.transaction.clone().unwrap_or_default()
    }
}

/// Attach `ec` as the transaction context of `ctx`, replacing any existing one.
pub fn with_transaction_context(ctx: &CallContext, ec: EvaluationContext) -> CallContext {
    ctx.with_transaction_context(ec)
}

/// Merge `ec` over the transaction context attached to `ctx` and re-attach the result.
pub fn merge_transaction_context(ctx: &CallContext, ec: EvaluationContext) -> CallContext {
    ctx.merge_transaction_context(ec)
}

/// Extract the transaction context from `ctx`. Empty if none is attached.
pub fn transaction_context(ctx: &CallContext) -> EvaluationContext {
    ctx.transaction_context()
}
