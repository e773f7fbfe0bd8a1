//! Protocol version 1 (V1) types for x402.
//!
//! V1 identifies networks by name (e.g., "base-sepolia") and carries the
//! payment requirements of a 402 response in its JSON body.
//!
//! # Key Types
//!
//! - [`X402Version1`] - Version marker that serializes as `1`
//! - [`PaymentPayload`] - Signed payment authorization from the buyer
//! - [`PaymentRequirements`] - Payment terms set by the seller
//! - [`PaymentRequired`] - HTTP 402 response body
//! - [`VerifyRequest`] / [`VerifyResponse`] - Verification messages
//! - [`SettleResponse`] - Settlement result

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;

/// Version marker for x402 protocol version 1.
///
/// This type serializes as the integer `1` and refuses to deserialize anything else.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct X402Version1;

impl X402Version1 {
    pub const VALUE: u8 = 1;
}

impl PartialEq<u8> for X402Version1 {
    fn eq(&self, other: &u8) -> bool {
        *other == Self::VALUE
    }
}

impl From<X402Version1> for u8 {
    fn from(_: X402Version1) -> Self {
        X402Version1::VALUE
    }
}

impl Serialize for X402Version1 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for X402Version1 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let num = u8::deserialize(deserializer)?;
        if num == Self::VALUE {
            Ok(X402Version1)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected version {}, got {}",
                Self::VALUE,
                num
            )))
        }
    }
}

impl Display for X402Version1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::VALUE)
    }
}

/// Open-ended, scheme- or chain-specific metadata attached to [`PaymentRequirements`].
///
/// Facilitators may introduce new keys at any time, so this stays a dynamic map.
pub type Extra = serde_json::Map<String, serde_json::Value>;

/// A signed payment authorization from the buyer.
///
/// Produced by a [`crate::client::Signer`] for one request and never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Protocol version (always 1).
    pub x402_version: X402Version1,
    /// The payment scheme (e.g., "exact").
    pub scheme: String,
    /// The network name (e.g., "base-sepolia").
    pub network: String,
    /// The scheme-specific signed payload, opaque to this crate.
    pub payload: serde_json::Value,
}

/// Payment requirements set by the seller.
///
/// Identity for matching is `(scheme, network)`, see [`PaymentRequirements::matches`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// The payment scheme (e.g., "exact").
    pub scheme: String,
    /// The network name (e.g., "base-sepolia").
    pub network: String,
    /// The maximum amount required, as a decimal integer string in token base units.
    pub max_amount_required: String,
    /// The resource URL being paid for.
    #[serde(default)]
    pub resource: String,
    /// Human-readable description of the resource.
    #[serde(default)]
    pub description: String,
    /// MIME type of the resource.
    #[serde(default)]
    pub mime_type: String,
    /// Optional JSON schema for the resource output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    /// The recipient address for payment.
    pub pay_to: String,
    /// Maximum time in seconds for payment validity.
    #[serde(default)]
    pub max_timeout_seconds: u64,
    /// The token asset address.
    pub asset: String,
    /// Scheme-specific extra data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Extra>,
}

impl PaymentRequirements {
    /// True if these requirements are for the given `(scheme, network)` pair.
    pub fn matches(&self, scheme: &str, network: &str) -> bool {
        self.scheme == scheme && self.network == network
    }

    /// Copies any key of `extra` that these requirements do not define yet.
    ///
    /// Existing keys always win.
    pub fn merge_extra(&mut self, extra: &Extra) {
        if extra.is_empty() {
            return;
        }
        let own = self.extra.get_or_insert_with(Extra::new);
        for (key, value) in extra {
            if !own.contains_key(key) {
                own.insert(key.clone(), value.clone());
            }
        }
    }
}

/// HTTP 402 Payment Required response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    /// Protocol version (always 1).
    pub x402_version: X402Version1,
    /// Why payment is (still) required.
    #[serde(default)]
    pub error: String,
    /// List of acceptable payment methods, in the server's order of preference.
    pub accepts: Vec<PaymentRequirements>,
}

/// Request body for the facilitator's `/verify` and `/settle` endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    /// Protocol version (always 1).
    pub x402_version: X402Version1,
    /// The signed payment authorization.
    pub payment_payload: PaymentPayload,
    /// The payment requirements to verify against.
    pub payment_requirements: PaymentRequirements,
}

/// Settlement carries the same body as verification.
pub type SettleRequest = VerifyRequest;

impl VerifyRequest {
    pub fn new(payment_payload: PaymentPayload, payment_requirements: PaymentRequirements) -> Self {
        Self {
            x402_version: X402Version1,
            payment_payload,
            payment_requirements,
        }
    }
}

/// Result returned by a facilitator after verifying a [`PaymentPayload`].
///
/// If invalid, `invalid_reason` says why (e.g., insufficient funds, expired authorization).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

impl VerifyResponse {
    pub fn valid(payer: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            invalid_reason: None,
            payer: Some(payer.into()),
        }
    }

    pub fn invalid(payer: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            invalid_reason: Some(reason.into()),
            payer,
        }
    }
}

/// Response from a payment settlement request.
///
/// Travels back to the client base64-encoded in the `X-PAYMENT-RESPONSE` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    /// Transaction hash, empty if settlement did not happen.
    #[serde(default)]
    pub transaction: String,
    #[serde(default)]
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn requirements() -> PaymentRequirements {
        serde_json::from_value(json!({
            "scheme": "exact",
            "network": "base-sepolia",
            "maxAmountRequired": "10000",
            "resource": "https://api.example.com/premium",
            "description": "Premium",
            "mimeType": "application/json",
            "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
            "maxTimeoutSeconds": 60,
            "asset": "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
            "extra": { "name": "USDC", "version": "2" }
        }))
        .unwrap()
    }

    #[test]
    fn test_version_marker_rejects_other_versions() {
        assert!(serde_json::from_value::<X402Version1>(json!(1)).is_ok());
        assert!(serde_json::from_value::<X402Version1>(json!(2)).is_err());
        assert_eq!(serde_json::to_value(X402Version1).unwrap(), json!(1));
    }

    #[test]
    fn test_requirements_wire_names() {
        let value = serde_json::to_value(requirements()).unwrap();
        assert_eq!(value["maxAmountRequired"], "10000");
        assert_eq!(value["payTo"], "0x209693Bc6afc0C5328bA36FaF03C514EF312287C");
        assert_eq!(value["maxTimeoutSeconds"], 60);
        assert!(value.get("outputSchema").is_none());
    }

    #[test]
    fn test_matches_by_scheme_and_network_only() {
        let requirements = requirements();
        assert!(requirements.matches("exact", "base-sepolia"));
        assert!(!requirements.matches("exact", "base"));
        assert!(!requirements.matches("upto", "base-sepolia"));
    }

    #[test]
    fn test_merge_extra_never_overwrites() {
        let mut requirements = requirements();
        let supplied = json!({ "name": "Other", "feePayer": "FeePayer111" });
        requirements.merge_extra(supplied.as_object().unwrap());
        let extra = requirements.extra.unwrap();
        assert_eq!(extra["name"], "USDC");
        assert_eq!(extra["version"], "2");
        assert_eq!(extra["feePayer"], "FeePayer111");
    }

    #[test]
    fn test_merge_extra_into_empty() {
        let mut requirements = requirements();
        requirements.extra = None;
        requirements.merge_extra(json!({ "feePayer": "F" }).as_object().unwrap());
        assert_eq!(requirements.extra.unwrap()["feePayer"], "F");
    }

    #[test]
    fn test_verify_response_wire() {
        let valid: VerifyResponse =
            serde_json::from_value(json!({ "isValid": true, "payer": "0xabc" })).unwrap();
        assert_eq!(valid, VerifyResponse::valid("0xabc"));
        let invalid: VerifyResponse = serde_json::from_value(
            json!({ "isValid": false, "invalidReason": "insufficient_funds" }),
        )
        .unwrap();
        assert_eq!(invalid.invalid_reason.as_deref(), Some("insufficient_funds"));
        assert_eq!(invalid.payer, None);
    }

    #[test]
    fn test_payment_required_wire() {
        let body = PaymentRequired {
            x402_version: X402Version1,
            error: "X-PAYMENT header is required".to_string(),
            accepts: vec![requirements()],
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["x402Version"], 1);
        assert_eq!(value["error"], "X-PAYMENT header is required");
        assert_eq!(value["accepts"][0]["scheme"], "exact");
    }

    #[test]
    fn test_verify_request_wire() {
        let payload = PaymentPayload {
            x402_version: X402Version1,
            scheme: "exact".to_string(),
            network: "base-sepolia".to_string(),
            payload: json!({ "signature": "0x00" }),
        };
        let value = serde_json::to_value(VerifyRequest::new(payload, requirements())).unwrap();
        assert_eq!(value["x402Version"], 1);
        assert_eq!(value["paymentPayload"]["payload"]["signature"], "0x00");
        assert_eq!(value["paymentRequirements"]["network"], "base-sepolia");
    }
}
