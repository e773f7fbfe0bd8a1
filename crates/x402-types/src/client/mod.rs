//! Client-side payment construction.
//!
//! Signing backends plug in through the [`Signer`] contract; different chains and custody
//! models are independent implementations of the same trait. The [`select`] and
//! [`select_and_sign`] functions pick one `(requirement, signer)` pair out of a 402 response.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::facilitator::BoxError;
use crate::proto::{PaymentPayload, PaymentRequirements};

mod selector;

pub use selector::*;

/// One asset a [`Signer`] is willing to pay with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenConfig {
    /// Token contract or mint address.
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
    /// Lower is preferred.
    #[serde(default)]
    pub priority: i32,
}

/// A pluggable component able to sign a [`PaymentPayload`] for a [`PaymentRequirements`].
///
/// Implementations must not mutate shared state during [`Signer::can_sign`]; any
/// nonce bookkeeping or rate limiting happens inside [`Signer::sign`] and is the
/// implementation's own concern.
#[async_trait::async_trait]
pub trait Signer: Send + Sync {
    /// Network this signer pays on (e.g., "base-sepolia").
    fn network(&self) -> &str;

    /// Payment scheme this signer produces (e.g., "exact").
    fn scheme(&self) -> &str;

    /// Whether this signer is able to pay `requirements` at all.
    fn can_sign(&self, requirements: &PaymentRequirements) -> bool;

    /// Produces a signed, single-use payload for `requirements`.
    async fn sign(&self, requirements: &PaymentRequirements) -> Result<PaymentPayload, BoxError>;

    /// Selection order among signers: lower is tried first.
    fn priority(&self) -> i32 {
        0
    }

    /// Assets this signer can pay with.
    fn tokens(&self) -> &[TokenConfig] {
        &[]
    }

    /// Largest amount, in token base units, this signer will authorize. `None` is unlimited.
    fn max_amount(&self) -> Option<U256> {
        None
    }
}

/// Stable, machine-readable code for an [`X402Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum X402ErrorCode {
    NoValidSigner,
    SigningFailed,
    InvalidRequirements,
}

impl X402ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            X402ErrorCode::NoValidSigner => "NO_VALID_SIGNER",
            X402ErrorCode::SigningFailed => "SIGNING_FAILED",
            X402ErrorCode::InvalidRequirements => "INVALID_REQUIREMENTS",
        }
    }
}

impl fmt::Display for X402ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-side payment failures. None of these are retryable.
#[derive(Debug, thiserror::Error)]
pub enum X402Error {
    #[error("No registered signer can pay any of the accepted requirements")]
    NoValidSigner,
    #[error("Failed to sign payment for {scheme} on {network}: {source}")]
    SigningFailed {
        scheme: String,
        network: String,
        #[source]
        source: BoxError,
    },
    #[error("Invalid payment requirements: {0}")]
    InvalidRequirements(String),
}

impl X402Error {
    pub fn code(&self) -> X402ErrorCode {
        match self {
            X402Error::NoValidSigner => X402ErrorCode::NoValidSigner,
            X402Error::SigningFailed { .. } => X402ErrorCode::SigningFailed,
            X402Error::InvalidRequirements(_) => X402ErrorCode::InvalidRequirements,
        }
    }
}

/// Registered signers, kept in registration order.
#[derive(Clone, Default)]
pub struct Signers(Vec<Arc<dyn Signer>>);

impl Signers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<S: Signer + 'static>(&mut self, signer: S) {
        self.0.push(Arc::new(signer));
    }

    pub fn push_arc(&mut self, signer: Arc<dyn Signer>) {
        self.0.push(signer);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[Arc<dyn Signer>] {
        &self.0
    }
}

impl fmt::Debug for Signers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|s| (s.scheme(), s.network(), s.priority())))
            .finish()
    }
}
