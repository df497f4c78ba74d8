//! Evaluation context: ambient information about the subject of a flag evaluation.
use std::sync::Arc;

use serde::Serialize;

use crate::{AttributeValue, Attributes};

/// Reserved attribute key the targeting key is stored under in a [`FlattenedContext`].
pub const TARGETING_KEY: &str = "targetingKey";

/// Single mapping of attributes with the targeting key injected under [`TARGETING_KEY`]. This is
/// the shape of evaluation context handed to providers.
pub type FlattenedContext = Attributes;

/// `EvaluationContext` provides ambient information for the purposes of flag evaluation.
///
/// Contexts are immutable: attributes are copied in on construction, and every accessor that
/// exposes the attribute mapping returns a copy. Cloning is cheap.
///
/// ```
/// # use flagbridge::EvaluationContext;
/// let context = EvaluationContext::new(
///     "user-1",
///     [("plan".to_owned(), "pro".into())].into_iter().collect(),
/// );
/// assert_eq!(context.targeting_key(), "user-1");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    /// Uniquely identifies the subject (end-user, or client service) of a flag evaluation.
    targeting_key: String,
    attributes: Arc<Attributes>,
}

impl EvaluationContext {
    /// Create a new context with `targeting_key` and `attributes`.
    pub fn new(targeting_key: impl Into<String>, attributes: Attributes) -> EvaluationContext {
        EvaluationContext {
            targeting_key: targeting_key.into(),
            attributes: Arc::new(attributes),
        }
    }

    /// Create a new context with an empty targeting key.
    pub fn targetless(attributes: Attributes) -> EvaluationContext {
        EvaluationContext::new("", attributes)
    }

    /// Key uniquely identifying the subject of a flag evaluation. May be empty.
    pub fn targeting_key(&self) -> &str {
        &self.targeting_key
    }

    /// Retrieve a single attribute.
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Returns a copy of the context attributes.
    pub fn attributes(&self) -> Attributes {
        Attributes::clone(&self.attributes)
    }

    /// `true` if there is neither a targeting key nor any attribute.
    pub fn is_empty(&self) -> bool {
        self.targeting_key.is_empty() && self.attributes.is_empty()
    }

    /// Convert into a [`FlattenedContext`]. The targeting key is only injected when non-empty.
    pub fn flattened(&self) -> FlattenedContext {
        let mut flat = self.attributes();
        if !self.targeting_key.is_empty() {
            flat.insert(
                TARGETING_KEY.to_owned(),
                AttributeValue::String(self.targeting_key.clone()),
            );
        }
        flat
    }

    /// Merge `higher` over `self`.
    ///
    /// Attributes of `higher` overwrite attributes of `self` with the same key. The targeting key
    /// of `higher` wins unless it is empty.
    pub fn merge(&self, higher: &EvaluationContext) -> EvaluationContext {
        if higher.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return higher.clone();
        }

        let mut attributes = self.attributes();
        attributes.extend(
            higher
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let targeting_key = if higher.targeting_key.is_empty() {
            self.targeting_key.clone()
        } else {
            higher.targeting_key.clone()
        };

        EvaluationContext {
            targeting_key,
            attributes: Arc::new(attributes),
        }
    }
}

/// Merge context layers given from lowest to highest precedence.
pub(crate) fn merge_layers<'a>(
    layers: impl IntoIterator<Item = &'a EvaluationContext>,
) -> EvaluationContext {
    layers
        .into_iter()
        .fold(EvaluationContext::default(), |acc, layer| acc.merge(layer))
}
