//! Protocol types for x402 payment messages.
//!
//! This module defines the wire format used between buyers, sellers, and facilitators.
//! Only protocol version 1 is spoken; see [`v1`].
//!
//! # Key Types
//!
//! - [`SupportedPaymentKind`] - Describes a payment method supported by a facilitator
//! - [`SupportedResponse`] - Response from facilitator's `/supported` endpoint
//! - [`header`] - Base64(JSON) codec for the `X-PAYMENT` and `X-PAYMENT-RESPONSE` headers
//!
//! # Wire Format
//!
//! All types serialize to JSON using camelCase field names.

use serde::{Deserialize, Serialize};
use serde_with::{VecSkipError, serde_as};
use std::collections::HashMap;

pub mod header;
pub mod v1;

pub use header::*;
pub use v1::*;

/// Describes a payment method supported by a facilitator.
///
/// ```json
/// {
///   "x402Version": 1,
///   "scheme": "exact",
///   "network": "solana-devnet",
///   "extra": { "feePayer": "2wKupLR9q6wXYppw8Gr2NvWxKBUqm4PPJKkQfoxHDBg4" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedPaymentKind {
    /// The x402 protocol version.
    pub x402_version: u8,
    /// The payment scheme identifier (e.g., "exact").
    pub scheme: String,
    /// The network name.
    pub network: String,
    /// Optional scheme-specific extra data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Response from a facilitator's `/supported` endpoint.
///
/// Kinds that fail to parse are skipped rather than failing the whole response.
#[serde_as]
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    /// List of supported payment kinds.
    #[serde_as(as = "VecSkipError<_>")]
    pub kinds: Vec<SupportedPaymentKind>,
    /// List of supported protocol extensions.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Map of network to signer addresses for that network.
    #[serde(default)]
    pub signers: HashMap<String, Vec<String>>,
}

impl SupportedResponse {
    /// Returns the extra data of the kind supporting `(network, scheme)`, if it is a JSON object.
    pub fn extra_for(&self, network: &str, scheme: &str) -> Option<&Extra> {
        self.kinds
            .iter()
            .filter(|kind| kind.network == network && kind.scheme == scheme)
            .find_map(|kind| kind.extra.as_ref().and_then(|extra| extra.as_object()))
    }

    /// Merges facilitator-supplied extra data into each matching requirement.
    ///
    /// Keys already present on a requirement are never overwritten.
    pub fn enrich(&self, requirements: &[PaymentRequirements]) -> Vec<PaymentRequirements> {
        requirements
            .iter()
            .map(|requirement| {
                let mut enriched = requirement.clone();
                if let Some(extra) = self.extra_for(&requirement.network, &requirement.scheme) {
                    enriched.merge_extra(extra);
                }
                enriched
            })
            .collect()
    }
}
