//! Order events as received from the inbound queue.
//!
//! Wire format: `{"sku": string, "quantity": integer, "orderId"?: string, "source"?: string}`.
//!
//! Malformed payloads are rejected, never patched: a missing or blank `sku` is always an
//! error. A missing `quantity` defaults to [`DEFAULT_QUANTITY`] only when
//! [`PayloadPolicy::allow_default_quantity`] is set.

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use stockflow_core::{DomainError, DomainResult, Sku};

/// Quantity assumed for a payload without `quantity` under the lenient policy.
pub const DEFAULT_QUANTITY: u32 = 1;

/// How strictly inbound payloads are validated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct PayloadPolicy {
    /// Accept payloads without `quantity` as an order for [`DEFAULT_QUANTITY`] unit.
    pub allow_default_quantity: bool,
}

impl PayloadPolicy {
    pub fn strict() -> Self {
        Self::default()
    }

    pub fn lenient() -> Self {
        Self {
            allow_default_quantity: true,
        }
    }
}

/// Why a payload could not become an [`OrderEvent`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid sku: {0}")]
    InvalidSku(String),

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
}

/// Optional provenance carried with an order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrderMetadata {
    pub order_id: Option<String>,
    pub source: Option<String>,
    /// W3C `traceparent` propagated by the producer, if any.
    pub trace_parent: Option<String>,
}

/// A validated request to reserve `quantity` units of `sku`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderEvent {
    sku: Sku,
    quantity: u32,
    metadata: OrderMetadata,
}

impl OrderEvent {
    pub fn new(sku: Sku, quantity: u32) -> DomainResult<Self> {
        if quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        Ok(Self {
            sku,
            quantity,
            metadata: OrderMetadata::default(),
        })
    }

    pub fn with_metadata(mut self, metadata: OrderMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_trace_parent(mut self, trace_parent: Option<String>) -> Self {
        self.metadata.trace_parent = trace_parent;
        self
    }

    pub fn sku(&self) -> &Sku {
        &self.sku
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn metadata(&self) -> &OrderMetadata {
        &self.metadata
    }

    /// Parse and validate a raw queue payload.
    pub fn parse(body: &str, policy: PayloadPolicy) -> Result<Self, PayloadError> {
        let value: JsonValue =
            serde_json::from_str(body).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;
        let object = value.as_object().ok_or(PayloadError::NotAnObject)?;

        let sku = parse_sku(object)?;
        let quantity = parse_quantity(object, policy)?;

        Ok(Self {
            sku,
            quantity,
            metadata: OrderMetadata {
                order_id: optional_text(object, "orderId"),
                source: optional_text(object, "source"),
                trace_parent: None,
            },
        })
    }
}

fn field<'a>(object: &'a Map<String, JsonValue>, name: &str) -> Option<&'a JsonValue> {
    object.get(name).filter(|v| !v.is_null())
}

fn parse_sku(object: &Map<String, JsonValue>) -> Result<Sku, PayloadError> {
    let raw = field(object, "sku").ok_or(PayloadError::MissingField("sku"))?;
    let text = raw
        .as_str()
        .ok_or_else(|| PayloadError::InvalidSku(format!("expected a string, got {raw}")))?;
    Sku::parse(text).map_err(|e| PayloadError::InvalidSku(e.to_string()))
}

fn parse_quantity(
    object: &Map<String, JsonValue>,
    policy: PayloadPolicy,
) -> Result<u32, PayloadError> {
    let Some(raw) = field(object, "quantity") else {
        return if policy.allow_default_quantity {
            Ok(DEFAULT_QUANTITY)
        } else {
            Err(PayloadError::MissingField("quantity"))
        };
    };

    let n = raw.as_u64().ok_or_else(|| {
        PayloadError::InvalidQuantity(format!("expected a positive integer, got {raw}"))
    })?;
    if n == 0 {
        return Err(PayloadError::InvalidQuantity("must be positive".to_string()));
    }
    u32::try_from(n).map_err(|_| PayloadError::InvalidQuantity(format!("{n} is too large")))
}

fn optional_text(object: &Map<String, JsonValue>, name: &str) -> Option<String> {
    match field(object, name)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
