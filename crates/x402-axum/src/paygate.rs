//! Payment gate for a single protected request.
//!
//! ## Overview
//!
//! The paygate handles:
//! - Extracting the `X-PAYMENT` header from requests
//! - Matching it against the accepted [`PaymentRequirements`]
//! - Verifying payments with the facilitator, falling back to a secondary one on transport errors
//! - Handing the response to the [`SettlementInterceptor`], which settles only successful responses
//! - Returning appropriate 400/402/503 responses when the payment cannot be accepted
//!
//! The four building blocks any router adapter needs are exposed as free functions:
//! [`parse_payment_header`], [`find_matching_requirement`], [`payment_required_response`]
//! and [`add_settlement_response_header`]. The verified payment is stored in request
//! extensions as a [`VerifiedPayment`].
//!
//! ## Example
//!
//! ```ignore
//! use x402_axum::paygate::Paygate;
//!
//! let paygate = Paygate {
//!     facilitator,
//!     verify_only: false,
//!     accepts: requirements,
//! };
//!
//! // Handle a request
//! let response = paygate.handle_request(inner, request).await;
//! ```

use axum_core::body::Body;
use axum_core::extract::FromRequestParts;
use axum_core::response::{IntoResponse, Response};
use http::header::{ACCESS_CONTROL_EXPOSE_HEADERS, CONTENT_TYPE, HOST};
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use tower::Service;
use url::Url;
use x402_types::facilitator::{Facilitator, FacilitatorError};
use x402_types::proto::{
    PAYMENT_RESPONSE_HEADER, PaymentHeaderError, PaymentPayload, PaymentRequired,
    PaymentRequirements, SettleRequest, SettleResponse, SupportedResponse, VerifyRequest,
    VerifyResponse, X402Version1, decode_payment_header, encode_settlement_header,
};
use x402_types::util::CallContext;

use crate::interceptor::SettlementInterceptor;

#[cfg(feature = "telemetry")]
use tracing::{Instrument, instrument};

/// `X-PAYMENT`, as a typed header name.
pub const X_PAYMENT: HeaderName = HeaderName::from_static("x-payment");
/// `X-PAYMENT-RESPONSE`, as a typed header name.
pub const X_PAYMENT_RESPONSE: HeaderName = HeaderName::from_static("x-payment-response");

const DEFAULT_MIME_TYPE: &str = "application/json";

// ============================================================================
// Resource Information
// ============================================================================

/// Per-route resource metadata stamped into every requirement of a request.
#[derive(Debug, Clone, Default)]
pub struct ResourceInfoBuilder {
    /// Description of the protected resource
    pub description: Option<String>,
    /// MIME type of the protected resource
    pub mime_type: Option<String>,
    /// Optional explicit URL of the protected resource
    pub url: Option<Url>,
}

impl ResourceInfoBuilder {
    /// Determines the absolute resource URL for a request.
    ///
    /// An explicit `url` wins. Otherwise `base_url` supplies scheme and host. Without one, the
    /// scheme comes from the request URI or `X-Forwarded-Proto` and the host from the URI
    /// authority or `Host`, defaulting to `http` and `localhost`.
    pub fn resource_url<B>(&self, base_url: Option<&Url>, req: &http::Request<B>) -> String {
        if let Some(url) = &self.url {
            return url.to_string();
        }
        let uri = req.uri();
        if let Some(base_url) = base_url {
            let mut url = base_url.clone();
            url.set_path(uri.path());
            url.set_query(uri.query());
            return url.to_string();
        }
        let scheme = uri
            .scheme_str()
            .or_else(|| {
                header_str(req.headers(), "x-forwarded-proto")
                    .and_then(|value| value.split(',').next())
                    .map(str::trim)
            })
            .unwrap_or("http");
        let host = uri
            .authority()
            .map(|authority| authority.as_str())
            .or_else(|| header_str(req.headers(), HOST.as_str()))
            .unwrap_or("localhost");
        let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
        format!("{scheme}://{host}{path_and_query}")
    }

    /// Clones `accepts` with the request's resource URL, description and MIME type filled in.
    ///
    /// Builder values win over values already on a requirement. An empty description falls
    /// back to `Payment required for <path>`.
    pub fn stamp<B>(
        &self,
        accepts: &[PaymentRequirements],
        base_url: Option<&Url>,
        req: &http::Request<B>,
    ) -> Vec<PaymentRequirements> {
        let resource = self.resource_url(base_url, req);
        accepts
            .iter()
            .map(|requirement| {
                let mut requirement = requirement.clone();
                requirement.resource = resource.clone();
                if let Some(description) = &self.description {
                    requirement.description = description.clone();
                } else if requirement.description.is_empty() {
                    requirement.description = format!("Payment required for {}", req.uri().path());
                }
                if let Some(mime_type) = &self.mime_type {
                    requirement.mime_type = mime_type.clone();
                } else if requirement.mime_type.is_empty() {
                    requirement.mime_type = DEFAULT_MIME_TYPE.to_string();
                }
                requirement
            })
            .collect()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

// ============================================================================
// Error Types
// ============================================================================

/// Why a paid request did not reach, or did not keep, the protected handler's response.
#[derive(Debug, thiserror::Error)]
pub enum PaygateError {
    #[error("X-PAYMENT header is required")]
    PaymentHeaderRequired,
    /// Undecodable header or unsupported version. Answered with 400.
    #[error(transparent)]
    InvalidPaymentHeader(PaymentHeaderError),
    #[error("Unable to find matching payment requirements")]
    NoPaymentMatching,
    #[error("Verification failed: {0}")]
    VerificationFailed(String),
    #[error("Settlement failed: {0}")]
    Settlement(String),
    /// The facilitator could not be used at all. Answered with 503.
    #[error("Facilitator unavailable: {0}")]
    Unavailable(#[source] FacilitatorError),
}

impl PaygateError {
    /// Classifies a verify failure: a facilitator rejection is a 402, anything else a 503.
    pub fn from_verify(err: FacilitatorError) -> Self {
        match err {
            FacilitatorError::VerificationFailed { reason } => Self::VerificationFailed(reason),
            FacilitatorError::SettlementFailed { reason } => Self::VerificationFailed(reason),
            other => Self::Unavailable(other),
        }
    }

    /// Classifies a settle failure: a facilitator rejection is a 402, anything else a 503.
    pub fn from_settle(err: FacilitatorError) -> Self {
        match err {
            FacilitatorError::SettlementFailed { reason } => Self::Settlement(reason),
            FacilitatorError::VerificationFailed { reason } => Self::Settlement(reason),
            other => Self::Unavailable(other),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PaygateError::InvalidPaymentHeader(_) => StatusCode::BAD_REQUEST,
            PaygateError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PaygateError::PaymentHeaderRequired
            | PaygateError::NoPaymentMatching
            | PaygateError::VerificationFailed(_)
            | PaygateError::Settlement(_) => StatusCode::PAYMENT_REQUIRED,
        }
    }

    /// Renders the error. Every 402 carries the current requirement list.
    pub fn into_response(self, accepts: &[PaymentRequirements]) -> Response {
        match self.status() {
            StatusCode::PAYMENT_REQUIRED => payment_required_response(self.to_string(), accepts),
            StatusCode::BAD_REQUEST => json_response(
                StatusCode::BAD_REQUEST,
                &json!({ "error": "Invalid payment header", "details": self.to_string() }),
            ),
            status => json_response(
                status,
                &json!({ "error": "Facilitator unavailable", "details": self.to_string() }),
            ),
        }
    }
}

// ============================================================================
// Router Adapter Helpers
// ============================================================================

/// Decodes the `X-PAYMENT` header of a request.
pub fn parse_payment_header(headers: &HeaderMap) -> Result<PaymentPayload, PaymentHeaderError> {
    decode_payment_header(headers.get(X_PAYMENT).map(HeaderValue::as_bytes))
}

/// First requirement with the payload's `(scheme, network)`. Asset and amount are left to
/// the facilitator.
pub fn find_matching_requirement<'a>(
    accepts: &'a [PaymentRequirements],
    payload: &PaymentPayload,
) -> Option<&'a PaymentRequirements> {
    accepts
        .iter()
        .find(|requirement| requirement.matches(&payload.scheme, &payload.network))
}

/// A `402 Payment Required` response with a JSON [`PaymentRequired`] body.
pub fn payment_required_response(
    error: impl Into<String>,
    accepts: &[PaymentRequirements],
) -> Response {
    let body = PaymentRequired {
        x402_version: X402Version1,
        error: error.into(),
        accepts: accepts.to_vec(),
    };
    json_response(StatusCode::PAYMENT_REQUIRED, &body)
}

/// Sets `X-PAYMENT-RESPONSE` and exposes it to browser clients.
pub fn add_settlement_response_header<B>(
    response: &mut http::Response<B>,
    settlement: &SettleResponse,
) -> Result<(), PaygateError> {
    let encoded = encode_settlement_header(settlement)
        .map_err(|err| PaygateError::Settlement(err.to_string()))?;
    let value = HeaderValue::from_bytes(encoded.as_ref())
        .map_err(|err| PaygateError::Settlement(err.to_string()))?;
    let headers = response.headers_mut();
    headers.insert(X_PAYMENT_RESPONSE, value);
    headers.append(
        ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(PAYMENT_RESPONSE_HEADER),
    );
    Ok(())
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response {
    let Ok(bytes) = serde_json::to_vec(body) else {
        return status.into_response();
    };
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, DEFAULT_MIME_TYPE)
        .body(Body::from(bytes))
        .unwrap_or_else(|_| status.into_response())
}

// ============================================================================
// Request-Scoped Verification
// ============================================================================

/// The facilitator's verdict for the current request, stored in request extensions.
///
/// Only the paygate can create one, so a handler can trust its presence.
#[derive(Debug, Clone)]
pub struct VerifiedPayment {
    response: VerifyResponse,
    requirements: PaymentRequirements,
}

impl VerifiedPayment {
    pub fn response(&self) -> &VerifyResponse {
        &self.response
    }

    /// Payer address reported by the facilitator.
    pub fn payer(&self) -> Option<&str> {
        self.response.payer.as_deref()
    }

    /// The requirement the payment was matched against.
    pub fn requirements(&self) -> &PaymentRequirements {
        &self.requirements
    }
}

/// Reads the [`VerifiedPayment`] of a request behind the paygate.
pub fn verified_payment<B>(req: &http::Request<B>) -> Option<&VerifiedPayment> {
    req.extensions().get::<VerifiedPayment>()
}

impl<S> FromRequestParts<S> for VerifiedPayment
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<VerifiedPayment>()
            .cloned()
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

// ============================================================================
// Fallback
// ============================================================================

/// A primary facilitator with an optional fallback used only on transport-level errors.
///
/// A facilitator that answers, even with a rejection, is never second-guessed.
#[derive(Clone, Debug)]
pub struct FallbackFacilitator<F> {
    primary: F,
    fallback: Option<F>,
}

impl<F> FallbackFacilitator<F> {
    pub fn new(primary: F, fallback: Option<F>) -> Self {
        Self { primary, fallback }
    }

    pub fn primary(&self) -> &F {
        &self.primary
    }

    pub fn fallback(&self) -> Option<&F> {
        self.fallback.as_ref()
    }

    fn fallback_for(&self, err: &FacilitatorError, _operation: &'static str) -> Option<&F> {
        if !err.is_transport() {
            return None;
        }
        let fallback = self.fallback.as_ref()?;
        #[cfg(feature = "telemetry")]
        tracing::warn!(error = %err, operation = _operation, "Primary facilitator unavailable, using fallback");
        Some(fallback)
    }
}

impl<F: Facilitator + Sync> Facilitator for FallbackFacilitator<F> {
    async fn verify(
        &self,
        ctx: &CallContext,
        request: &VerifyRequest,
    ) -> Result<VerifyResponse, FacilitatorError> {
        match self.primary.verify(ctx, request).await {
            Err(err) => match self.fallback_for(&err, "verify") {
                Some(fallback) => fallback.verify(ctx, request).await,
                None => Err(err),
            },
            ok => ok,
        }
    }

    async fn settle(
        &self,
        ctx: &CallContext,
        request: &SettleRequest,
    ) -> Result<SettleResponse, FacilitatorError> {
        match self.primary.settle(ctx, request).await {
            Err(err) => match self.fallback_for(&err, "settle") {
                Some(fallback) => fallback.settle(ctx, request).await,
                None => Err(err),
            },
            ok => ok,
        }
    }

    async fn supported(&self, ctx: &CallContext) -> Result<SupportedResponse, FacilitatorError> {
        match self.primary.supported(ctx).await {
            Err(err) => match self.fallback_for(&err, "supported") {
                Some(fallback) => fallback.supported(ctx).await,
                None => Err(err),
            },
            ok => ok,
        }
    }
}

// ============================================================================
// Paygate Implementation
// ============================================================================

/// Payment gate for one request.
pub struct Paygate<F> {
    /// The facilitator for verifying and settling payments
    pub facilitator: F,
    /// Verify only, never settle
    pub verify_only: bool,
    /// Accepted payment requirements, already stamped for this request
    pub accepts: Vec<PaymentRequirements>,
}

impl<F> Paygate<F> {
    /// Calls the inner service with proper telemetry instrumentation.
    async fn call_inner<ReqBody, S>(
        mut inner: S,
        req: http::Request<ReqBody>,
    ) -> Result<S::Response, S::Error>
    where
        S: Service<http::Request<ReqBody>>,
    {
        #[cfg(feature = "telemetry")]
        {
            inner
                .call(req)
                .instrument(tracing::info_span!("inner"))
                .await
        }
        #[cfg(not(feature = "telemetry"))]
        {
            inner.call(req).await
        }
    }
}

impl<F> Paygate<F>
where
    F: Facilitator + Sync,
{
    /// Handles an incoming request, processing payment if required.
    ///
    /// Returns a 400, 402 or 503 response if the payment cannot be accepted.
    /// Otherwise, returns the response from the inner service, with `X-PAYMENT-RESPONSE`
    /// set once settlement succeeded.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "x402.handle_request", skip_all)
    )]
    pub async fn handle_request<ReqBody, S>(
        self,
        inner: S,
        mut req: http::Request<ReqBody>,
    ) -> Result<Response, Infallible>
    where
        S: Service<http::Request<ReqBody>, Response = Response>,
        S::Error: IntoResponse,
    {
        let ctx = req
            .extensions()
            .get::<CallContext>()
            .map(CallContext::child)
            .unwrap_or_default();

        let settle_request = match self.verify_request(&ctx, &mut req).await {
            Ok(settle_request) => settle_request,
            Err(err) => {
                #[cfg(feature = "telemetry")]
                tracing::debug!(error = %err, "Payment not accepted");
                return Ok(err.into_response(&self.accepts));
            }
        };

        let mut interceptor = SettlementInterceptor::new(
            &self.facilitator,
            &ctx,
            &settle_request,
            &self.accepts,
            self.verify_only,
        );
        let response = match Self::call_inner(inner, req).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        };
        Ok(interceptor.commit(response).await)
    }

    /// Decodes, matches and verifies the payment. On success the [`VerifiedPayment`] is
    /// stored in `req` and the request to settle with is returned.
    pub async fn verify_request<ReqBody>(
        &self,
        ctx: &CallContext,
        req: &mut http::Request<ReqBody>,
    ) -> Result<SettleRequest, PaygateError> {
        if !req.headers().contains_key(X_PAYMENT) {
            return Err(PaygateError::PaymentHeaderRequired);
        }
        let payload = parse_payment_header(req.headers()).map_err(PaygateError::InvalidPaymentHeader)?;
        let requirements = find_matching_requirement(&self.accepts, &payload)
            .ok_or(PaygateError::NoPaymentMatching)?
            .clone();
        let request = VerifyRequest::new(payload, requirements);

        let response = self
            .facilitator
            .verify(ctx, &request)
            .await
            .map_err(PaygateError::from_verify)?;
        if !response.is_valid {
            let reason = response
                .invalid_reason
                .unwrap_or_else(|| "payment is not valid".to_string());
            return Err(PaygateError::VerificationFailed(reason));
        }

        req.extensions_mut().insert(VerifiedPayment {
            response,
            requirements: request.payment_requirements.clone(),
        });
        Ok(request)
    }
}
