//! Base64(JSON) codec for x402 HTTP headers.
//!
//! - `X-PAYMENT` carries a [`PaymentPayload`] from client to server. Decoding is strict:
//!   a missing or undecodable header is a [`PaymentHeaderError`].
//! - `X-PAYMENT-RESPONSE` carries a [`SettleResponse`] from server to client. Decoding is
//!   lenient: anything unusable simply means "no settlement information".

use serde::Serialize;

use crate::proto::{PaymentPayload, SettleResponse, X402Version1};
use crate::util::Base64Bytes;

/// Request header carrying the signed payment.
pub const PAYMENT_HEADER: &str = "X-PAYMENT";
/// Response header carrying the settlement result.
pub const PAYMENT_RESPONSE_HEADER: &str = "X-PAYMENT-RESPONSE";

/// Why an `X-PAYMENT` header could not be turned into a [`PaymentPayload`].
#[derive(Debug, thiserror::Error)]
pub enum PaymentHeaderError {
    #[error("Malformed payment header: {0}")]
    Malformed(#[from] MalformedHeader),
    #[error("Unsupported x402 version {0}")]
    UnsupportedVersion(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum MalformedHeader {
    #[error("X-PAYMENT header is required")]
    Missing,
    #[error("invalid base64: {0}")]
    Base64(#[source] base64::DecodeError),
    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),
}

/// Serializes `value` to JSON and base64-encodes it.
pub fn encode_header<T: Serialize>(value: &T) -> Result<Base64Bytes<'static>, serde_json::Error> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64Bytes::encode(json))
}

/// Encodes a [`PaymentPayload`] for the `X-PAYMENT` header.
pub fn encode_payment_header(
    payload: &PaymentPayload,
) -> Result<Base64Bytes<'static>, serde_json::Error> {
    encode_header(payload)
}

/// Decodes an `X-PAYMENT` header value.
///
/// Only version 1 payloads are accepted; any other `x402Version` is reported as
/// [`PaymentHeaderError::UnsupportedVersion`] rather than as malformed JSON.
pub fn decode_payment_header(header: Option<&[u8]>) -> Result<PaymentPayload, PaymentHeaderError> {
    let header = header.ok_or(MalformedHeader::Missing)?;
    let json = Base64Bytes::from(header)
        .decode()
        .map_err(MalformedHeader::Base64)?;
    let value: serde_json::Value = serde_json::from_slice(&json).map_err(MalformedHeader::Json)?;
    if let Some(version) = value.get("x402Version").and_then(serde_json::Value::as_u64)
        && version != u64::from(X402Version1::VALUE)
    {
        return Err(PaymentHeaderError::UnsupportedVersion(version));
    }
    let payload = serde_json::from_value(value).map_err(MalformedHeader::Json)?;
    Ok(payload)
}

/// Encodes a [`SettleResponse`] for the `X-PAYMENT-RESPONSE` header.
pub fn encode_settlement_header(
    settlement: &SettleResponse,
) -> Result<Base64Bytes<'static>, serde_json::Error> {
    encode_header(settlement)
}

/// Decodes an `X-PAYMENT-RESPONSE` header value. Absent or malformed yields `None`.
pub fn decode_settlement_header(header: Option<&[u8]>) -> Option<SettleResponse> {
    let json = Base64Bytes::from(header?).decode().ok()?;
    serde_json::from_slice(&json).ok()
}
