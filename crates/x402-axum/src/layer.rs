//! Axum middleware for enforcing [x402](https://www.x402.org) payments on protected routes.
//!
//! This middleware validates incoming `X-PAYMENT` headers using a configured x402 facilitator,
//! and settles valid payments once the protected handler has produced a successful response.
//!
//! Returns a `402 Payment Required` JSON response if the request lacks a valid payment.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use axum::{Router, routing::get};
//! use axum::response::IntoResponse;
//! use http::StatusCode;
//! use x402_axum::X402Middleware;
//! use x402_types::proto::PaymentRequirements;
//!
//! # async fn app(requirement: PaymentRequirements) -> Router {
//! let x402 = X402Middleware::try_from("https://facilitator.x402.rs").unwrap();
//!
//! let layer = x402
//!     .with_requirement(requirement)
//!     .with_description("VIP content")
//!     .build()
//!     .await;
//!
//! Router::new().route("/protected", get(my_handler).layer(layer))
//! # }
//!
//! async fn my_handler() -> impl IntoResponse {
//!     (StatusCode::OK, "This is VIP content!")
//! }
//! ```
//!
//! ## Settlement
//!
//! Settlement happens after the handler ran, and only if it answered with a status below 400.
//! [`X402Middleware::verify_only`] turns settlement off entirely: payments are verified, never
//! executed, and no `X-PAYMENT-RESPONSE` header is sent.
//!
//! ## Configuration Notes
//!
//! - **[`X402Middleware::with_requirement`]** sets the payments accepted for a route.
//! - **[`X402Middleware::with_fallback`]** adds a second facilitator, used only when the primary
//!   cannot be reached.
//! - **[`X402Middleware::with_base_url`]** sets the base URL for computing full resource URLs.
//!   If not set, scheme and host come from the request, defaulting to `http://localhost`.
//! - **[`X402LayerBuilder::with_description`]** is optional but helps the payer understand what is being paid for.
//! - **[`X402LayerBuilder::with_mime_type`]** sets the MIME type of the protected resource (default: `application/json`).
//! - **[`X402LayerBuilder::with_resource`]** explicitly sets the full URI of the protected resource.
//! - **[`X402LayerBuilder::build`]** asks the facilitator for its supported kinds once and merges
//!   their extra data into the requirements. A failure here is logged and ignored.

use axum_core::extract::Request;
use axum_core::response::Response;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};
use url::Url;
use x402_types::config::FacilitatorConfig;
use x402_types::facilitator::{Facilitator, FacilitatorError};
use x402_types::proto::PaymentRequirements;
use x402_types::util::CallContext;

use crate::facilitator_client::FacilitatorClient;
use crate::paygate::{FallbackFacilitator, Paygate, ResourceInfoBuilder};

/// The main X402 middleware instance for enforcing x402 payments on routes.
///
/// Create a single instance per application and use it to build payment layers
/// for protected routes.
#[derive(Clone, Debug)]
pub struct X402Middleware<F> {
    facilitator: FallbackFacilitator<F>,
    base_url: Option<Url>,
    verify_only: bool,
}

impl<F> X402Middleware<F> {
    /// Creates a middleware around any [`Facilitator`], local or remote.
    pub fn new(facilitator: F) -> Self {
        Self {
            facilitator: FallbackFacilitator::new(facilitator, None),
            base_url: None,
            verify_only: false,
        }
    }

    pub fn facilitator(&self) -> &F {
        self.facilitator.primary()
    }

    pub fn fallback(&self) -> Option<&F> {
        self.facilitator.fallback()
    }
}

impl X402Middleware<Arc<FacilitatorClient>> {
    /// Creates a new middleware instance with a facilitator URL.
    pub fn try_new(url: &str) -> Result<Self, FacilitatorError> {
        let facilitator = FacilitatorClient::try_from(url)?;
        Ok(Self::new(Arc::new(facilitator)))
    }

    /// Builds the primary and, optionally, the fallback facilitator client from configuration.
    pub fn from_config(
        primary: &FacilitatorConfig,
        fallback: Option<&FacilitatorConfig>,
    ) -> Result<Self, FacilitatorError> {
        let primary = Arc::new(FacilitatorClient::try_from_config(primary)?);
        let fallback = fallback
            .map(FacilitatorClient::try_from_config)
            .transpose()?
            .map(Arc::new);
        Ok(Self {
            facilitator: FallbackFacilitator::new(primary, fallback),
            base_url: None,
            verify_only: false,
        })
    }

    /// Returns the configured facilitator URL.
    pub fn facilitator_url(&self) -> &Url {
        self.facilitator.primary().base_url()
    }
}

impl TryFrom<&str> for X402Middleware<Arc<FacilitatorClient>> {
    type Error = FacilitatorError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl TryFrom<String> for X402Middleware<Arc<FacilitatorClient>> {
    type Error = FacilitatorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(&value)
    }
}

impl<F> X402Middleware<F>
where
    F: Clone,
{
    /// Adds a facilitator tried when the primary one fails at the transport level.
    pub fn with_fallback(&self, fallback: F) -> Self {
        let mut this = self.clone();
        this.facilitator = FallbackFacilitator::new(self.facilitator.primary().clone(), Some(fallback));
        this
    }

    /// Sets the base URL used to construct resource URLs dynamically.
    ///
    /// If [`X402LayerBuilder::with_resource`] is not called, this base URL is combined with
    /// each request's path/query to compute the resource.
    pub fn with_base_url(&self, base_url: Url) -> Self {
        let mut this = self.clone();
        this.base_url = Some(base_url);
        this
    }

    /// Verifies payments but never settles them.
    pub fn verify_only(&self) -> Self {
        let mut this = self.clone();
        this.verify_only = true;
        this
    }

    /// Settles payments after successful handler execution (default behavior).
    pub fn settle_after_execution(&self) -> Self {
        let mut this = self.clone();
        this.verify_only = false;
        this
    }

    /// Sets the payment requirement for the protected route.
    ///
    /// Creates a layer builder that can be further configured with additional
    /// requirements and resource information.
    pub fn with_requirement(&self, requirement: PaymentRequirements) -> X402LayerBuilder<F> {
        self.with_requirements([requirement])
    }

    /// Sets several payment requirements at once, in order of preference.
    pub fn with_requirements<I>(&self, requirements: I) -> X402LayerBuilder<F>
    where
        I: IntoIterator<Item = PaymentRequirements>,
    {
        X402LayerBuilder {
            facilitator: self.facilitator.clone(),
            accepts: requirements.into_iter().collect(),
            base_url: self.base_url.clone(),
            resource: ResourceInfoBuilder::default(),
            verify_only: self.verify_only,
        }
    }
}

/// Builder for configuring the X402 middleware layer.
#[derive(Clone, Debug)]
pub struct X402LayerBuilder<F> {
    facilitator: FallbackFacilitator<F>,
    verify_only: bool,
    base_url: Option<Url>,
    accepts: Vec<PaymentRequirements>,
    resource: ResourceInfoBuilder,
}

impl<F> X402LayerBuilder<F> {
    /// Adds another payment option.
    ///
    /// Allows specifying multiple accepted payment methods (e.g., different networks).
    pub fn with_requirement(mut self, requirement: PaymentRequirements) -> Self {
        self.accepts.push(requirement);
        self
    }

    /// Sets a description of what the payment grants access to.
    ///
    /// This is included in 402 responses to inform clients what they're paying for.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.resource.description = Some(description.into());
        self
    }

    /// Sets the MIME type of the protected resource.
    ///
    /// Defaults to `application/json` if not specified.
    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.resource.mime_type = Some(mime.into());
        self
    }

    /// Sets the full URL of the protected resource.
    ///
    /// When set, this URL is used directly instead of constructing it from the base URL
    /// and request URI. This is the preferred approach in production.
    pub fn with_resource(mut self, resource: Url) -> Self {
        self.resource.url = Some(resource);
        self
    }
}

impl<F> X402LayerBuilder<F>
where
    F: Facilitator + Sync,
{
    /// Enriches the requirements with the facilitator's supported kinds, once, and
    /// freezes the configuration into a [`X402Layer`].
    pub async fn build(self) -> X402Layer<F> {
        let ctx = CallContext::new();
        let accepts = match self.facilitator.enrich_requirements(&ctx, &self.accepts).await {
            Ok(enriched) => enriched,
            Err(_err) => {
                #[cfg(feature = "telemetry")]
                tracing::warn!(error = %_err, "Failed to enrich payment requirements, using them as configured");
                self.accepts
            }
        };
        X402Layer {
            facilitator: Arc::new(self.facilitator),
            verify_only: self.verify_only,
            base_url: self.base_url.map(Arc::new),
            accepts: Arc::new(accepts),
            resource: Arc::new(self.resource),
        }
    }
}

/// A built, immutable payment layer. Cheap to clone.
#[derive(Clone, Debug)]
pub struct X402Layer<F> {
    facilitator: Arc<FallbackFacilitator<F>>,
    verify_only: bool,
    base_url: Option<Arc<Url>>,
    accepts: Arc<Vec<PaymentRequirements>>,
    resource: Arc<ResourceInfoBuilder>,
}

impl<F> X402Layer<F> {
    /// The requirements as enriched at build time, before per-request stamping.
    pub fn accepts(&self) -> &[PaymentRequirements] {
        &self.accepts
    }
}

impl<S, F> Layer<S> for X402Layer<F>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = X402MiddlewareService<F>;

    fn layer(&self, inner: S) -> Self::Service {
        X402MiddlewareService {
            facilitator: self.facilitator.clone(),
            verify_only: self.verify_only,
            base_url: self.base_url.clone(),
            accepts: self.accepts.clone(),
            resource: self.resource.clone(),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// Axum service that enforces x402 payments on incoming requests.
#[derive(Clone, Debug)]
pub struct X402MiddlewareService<F> {
    /// Payment facilitator (local or remote), with its optional fallback
    facilitator: Arc<FallbackFacilitator<F>>,
    /// Base URL for constructing resource URLs
    base_url: Option<Arc<Url>>,
    /// Whether to skip settlement
    verify_only: bool,
    /// Accepted payment requirements, enriched once
    accepts: Arc<Vec<PaymentRequirements>>,
    /// Resource information
    resource: Arc<ResourceInfoBuilder>,
    /// The inner Axum service being wrapped
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl<F> Service<Request> for X402MiddlewareService<F>
where
    F: Facilitator + Send + Sync + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    /// Delegates readiness polling to the wrapped inner service.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    /// Intercepts the request, injects payment enforcement logic, and forwards to the wrapped service.
    fn call(&mut self, req: Request) -> Self::Future {
        let gate = Paygate {
            facilitator: self.facilitator.clone(),
            verify_only: self.verify_only,
            accepts: self
                .resource
                .stamp(&self.accepts, self.base_url.as_deref(), &req),
        };
        Box::pin(gate.handle_request(self.inner.clone(), req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::routing::get;
    use http::StatusCode;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use x402_types::proto::{
        PaymentPayload, X402Version1, decode_settlement_header, encode_payment_header,
    };
    use x402_types::util::RetryPolicy;

    use crate::facilitator_client::FacilitatorTimeouts;
    use crate::paygate::{VerifiedPayment, X_PAYMENT, X_PAYMENT_RESPONSE};

    fn requirement() -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".to_string(),
            network: "base-sepolia".to_string(),
            max_amount_required: "10000".to_string(),
            resource: String::new(),
            description: String::new(),
            mime_type: String::new(),
            output_schema: None,
            pay_to: "0x209693Bc6afc0C5328bA36FaF03C514EF312287C".to_string(),
            max_timeout_seconds: 300,
            asset: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".to_string(),
            extra: None,
        }
    }

    fn payment_header(scheme: &str, network: &str) -> String {
        let payload = PaymentPayload {
            x402_version: X402Version1,
            scheme: scheme.to_string(),
            network: network.to_string(),
            payload: json!({
                "signature": "0xsig",
                "authorization": { "from": "0xpayer", "to": "0xpayee", "value": "10000" }
            }),
        };
        let encoded = encode_payment_header(&payload).unwrap();
        String::from_utf8(encoded.as_ref().to_vec()).unwrap()
    }

    fn settlement() -> Value {
        json!({
            "success": true,
            "transaction": "0xtxhash",
            "network": "base-sepolia",
            "payer": "0xpayer"
        })
    }

    async fn mount_supported(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/supported"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "kinds": [] })))
            .mount(server)
            .await;
    }

    async fn mount_verify(server: &MockServer, response: Value, expected: u64) {
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(response))
            .expect(expected)
            .mount(server)
            .await;
    }

    async fn mount_settle(server: &MockServer, response: Value, expected: u64) {
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(200).set_body_json(response))
            .expect(expected)
            .mount(server)
            .await;
    }

    fn client(server: &MockServer) -> Arc<FacilitatorClient> {
        Arc::new(FacilitatorClient::try_new(server.uri().parse().unwrap()).unwrap())
    }

    fn refused_client() -> Arc<FacilitatorClient> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Arc::new(FacilitatorClient::try_from(format!("http://{addr}/")).unwrap())
    }

    async fn paid(payment: VerifiedPayment) -> String {
        format!("paid by {}", payment.payer().unwrap_or("unknown"))
    }

    async fn missing() -> (StatusCode, &'static str) {
        (StatusCode::NOT_FOUND, "nothing here")
    }

    async fn app(x402: X402Middleware<Arc<FacilitatorClient>>) -> Router {
        let layer = x402.with_requirement(requirement()).build().await;
        Router::new()
            .route("/premium", get(paid).layer(layer.clone()))
            .route("/missing", get(missing).layer(layer))
    }

    async fn send(app: Router, uri: &str, header: Option<String>) -> (StatusCode, http::HeaderMap, Vec<u8>) {
        let mut request = Request::builder().uri(uri);
        if let Some(header) = header {
            request = request.header(X_PAYMENT, header);
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        (status, headers, body)
    }

    #[tokio::test]
    async fn test_no_payment_header_returns_402_with_requirements() {
        let server = MockServer::start().await;
        mount_supported(&server).await;
        mount_verify(&server, json!({ "isValid": true }), 0).await;
        mount_settle(&server, settlement(), 0).await;

        let app = app(X402Middleware::new(client(&server))).await;
        let (status, headers, body) = send(app, "/premium", None).await;

        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert!(headers.get(X_PAYMENT_RESPONSE).is_none());
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["x402Version"], 1);
        assert_eq!(body["accepts"][0]["scheme"], "exact");
        assert_eq!(body["accepts"][0]["network"], "base-sepolia");
        assert_eq!(body["accepts"][0]["resource"], "http://localhost/premium");
        assert_eq!(body["accepts"][0]["description"], "Payment required for /premium");
        assert_eq!(body["accepts"][0]["mimeType"], "application/json");
    }

    #[tokio::test]
    async fn test_valid_payment_is_settled_and_reported() {
        let server = MockServer::start().await;
        mount_supported(&server).await;
        mount_verify(&server, json!({ "isValid": true, "payer": "0xpayer" }), 1).await;
        mount_settle(&server, settlement(), 1).await;

        let app = app(X402Middleware::new(client(&server))).await;
        let (status, headers, body) =
            send(app, "/premium", Some(payment_header("exact", "base-sepolia"))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"paid by 0xpayer");
        let settlement = decode_settlement_header(headers.get(X_PAYMENT_RESPONSE).map(|v| v.as_bytes()))
            .unwrap();
        assert!(settlement.success);
        assert_eq!(settlement.transaction, "0xtxhash");
        assert_eq!(settlement.payer.as_deref(), Some("0xpayer"));
        assert_eq!(headers["access-control-expose-headers"], "X-PAYMENT-RESPONSE");
    }

    #[tokio::test]
    async fn test_verify_only_never_settles() {
        let server = MockServer::start().await;
        mount_supported(&server).await;
        mount_verify(&server, json!({ "isValid": true, "payer": "0xpayer" }), 1).await;
        mount_settle(&server, settlement(), 0).await;

        let app = app(X402Middleware::new(client(&server)).verify_only()).await;
        let (status, headers, _) =
            send(app, "/premium", Some(payment_header("exact", "base-sepolia"))).await;

        assert_eq!(status, StatusCode::OK);
        assert!(headers.get(X_PAYMENT_RESPONSE).is_none());
    }

    #[tokio::test]
    async fn test_invalid_payment_returns_402_not_500() {
        let server = MockServer::start().await;
        mount_supported(&server).await;
        mount_verify(
            &server,
            json!({ "isValid": false, "invalidReason": "insufficient_funds", "payer": "0xpayer" }),
            1,
        )
        .await;
        mount_settle(&server, settlement(), 0).await;

        let app = app(X402Middleware::new(client(&server))).await;
        let (status, headers, body) =
            send(app, "/premium", Some(payment_header("exact", "base-sepolia"))).await;

        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert!(headers.get(X_PAYMENT_RESPONSE).is_none());
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert!(body["error"].as_str().unwrap().contains("insufficient_funds"));
        assert_eq!(body["accepts"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_passes_through_without_settlement() {
        let server = MockServer::start().await;
        mount_supported(&server).await;
        mount_verify(&server, json!({ "isValid": true }), 1).await;
        mount_settle(&server, settlement(), 0).await;

        let app = app(X402Middleware::new(client(&server))).await;
        let (status, headers, body) =
            send(app, "/missing", Some(payment_header("exact", "base-sepolia"))).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, b"nothing here");
        assert!(headers.get(X_PAYMENT_RESPONSE).is_none());
    }

    #[tokio::test]
    async fn test_fallback_decides_when_primary_is_unreachable() {
        let fallback = MockServer::start().await;
        mount_supported(&fallback).await;
        mount_verify(&fallback, json!({ "isValid": true, "payer": "0xpayer" }), 1).await;
        mount_settle(&fallback, settlement(), 1).await;

        let x402 = X402Middleware::new(refused_client()).with_fallback(client(&fallback));
        let app = app(x402).await;
        let (status, headers, _) =
            send(app, "/premium", Some(payment_header("exact", "base-sepolia"))).await;

        assert_eq!(status, StatusCode::OK);
        assert!(headers.get(X_PAYMENT_RESPONSE).is_some());
    }

    #[tokio::test]
    async fn test_fallback_rejection_is_final() {
        let fallback = MockServer::start().await;
        mount_supported(&fallback).await;
        mount_verify(&fallback, json!({ "isValid": false, "invalidReason": "expired" }), 1).await;
        mount_settle(&fallback, settlement(), 0).await;

        let x402 = X402Middleware::new(refused_client()).with_fallback(client(&fallback));
        let (status, _, _) = send(
            app(x402).await,
            "/premium",
            Some(payment_header("exact", "base-sepolia")),
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn test_primary_rejection_does_not_use_fallback() {
        let primary = MockServer::start().await;
        mount_supported(&primary).await;
        mount_verify(&primary, json!({ "isValid": false, "invalidReason": "bad" }), 1).await;
        let fallback = MockServer::start().await;
        mount_verify(&fallback, json!({ "isValid": true }), 0).await;

        let x402 = X402Middleware::new(client(&primary)).with_fallback(client(&fallback));
        let (status, _, _) = send(
            app(x402).await,
            "/premium",
            Some(payment_header("exact", "base-sepolia")),
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn test_unreachable_facilitator_without_fallback_is_503() {
        let app = app(X402Middleware::new(refused_client())).await;
        let (status, _, body) =
            send(app, "/premium", Some(payment_header("exact", "base-sepolia"))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Facilitator unavailable");
    }

    #[tokio::test]
    async fn test_malformed_header_is_400() {
        let server = MockServer::start().await;
        mount_supported(&server).await;
        mount_verify(&server, json!({ "isValid": true }), 0).await;

        let app = app(X402Middleware::new(client(&server))).await;
        let (status, _, _) = send(app.clone(), "/premium", Some("not-base64!".to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let v2 = x402_types::util::Base64Bytes::encode(
            json!({ "x402Version": 2, "scheme": "exact", "network": "base-sepolia", "payload": {} })
                .to_string(),
        );
        let v2 = String::from_utf8(v2.as_ref().to_vec()).unwrap();
        let (status, _, _) = send(app, "/premium", Some(v2)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unmatched_payment_is_402() {
        let server = MockServer::start().await;
        mount_supported(&server).await;
        mount_verify(&server, json!({ "isValid": true }), 0).await;

        let app = app(X402Middleware::new(client(&server))).await;
        let (status, _, body) = send(app, "/premium", Some(payment_header("exact", "solana"))).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Unable to find matching payment requirements");
    }

    #[tokio::test]
    async fn test_settlement_failure_replaces_handler_response() {
        let server = MockServer::start().await;
        mount_supported(&server).await;
        mount_verify(&server, json!({ "isValid": true }), 1).await;
        mount_settle(
            &server,
            json!({ "success": false, "errorReason": "nonce_used", "transaction": "", "network": "base-sepolia" }),
            1,
        )
        .await;

        let app = app(X402Middleware::new(client(&server))).await;
        let (status, headers, body) =
            send(app, "/premium", Some(payment_header("exact", "base-sepolia"))).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert!(headers.get(X_PAYMENT_RESPONSE).is_none());
        let body = String::from_utf8(body).unwrap();
        assert!(!body.contains("paid by"));
        assert!(body.contains("nonce_used"));
    }

    #[tokio::test]
    async fn test_settlement_timeout_is_503() {
        let server = MockServer::start().await;
        mount_supported(&server).await;
        mount_verify(&server, json!({ "isValid": true }), 1).await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(settlement())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let facilitator = FacilitatorClient::try_new(server.uri().parse().unwrap())
            .unwrap()
            .with_timeouts(FacilitatorTimeouts {
                settle: Duration::from_millis(50),
                ..FacilitatorTimeouts::default()
            });
        let app = app(X402Middleware::new(Arc::new(facilitator))).await;
        let (status, headers, _) =
            send(app, "/premium", Some(payment_header("exact", "base-sepolia"))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(headers.get(X_PAYMENT_RESPONSE).is_none());
    }

    #[tokio::test]
    async fn test_enrichment_happens_once_at_build() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/supported"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "kinds": [{
                    "x402Version": 1,
                    "scheme": "exact",
                    "network": "base-sepolia",
                    "extra": { "feePayer": "0xfeepayer" }
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let app = app(X402Middleware::new(client(&server))).await;
        for _ in 0..3 {
            let (status, _, body) = send(app.clone(), "/premium", None).await;
            assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
            let body: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(body["accepts"][0]["extra"]["feePayer"], "0xfeepayer");
        }
    }

    #[tokio::test]
    async fn test_enrichment_failure_is_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/supported"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let layer = X402Middleware::new(client(&server))
            .with_requirement(requirement())
            .build()
            .await;
        assert_eq!(layer.accepts(), &[requirement()]);
    }

    #[tokio::test]
    async fn test_resource_and_description_overrides() {
        let server = MockServer::start().await;
        mount_supported(&server).await;

        let layer = X402Middleware::new(client(&server))
            .with_base_url(Url::parse("https://api.example.com/").unwrap())
            .with_requirement(requirement())
            .with_description("Weather data")
            .with_mime_type("text/plain")
            .build()
            .await;
        let app = Router::new().route("/weather", get(paid).layer(layer));
        let (_, _, body) = send(app, "/weather?city=berlin", None).await;
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["accepts"][0]["resource"], "https://api.example.com/weather?city=berlin");
        assert_eq!(body["accepts"][0]["description"], "Weather data");
        assert_eq!(body["accepts"][0]["mimeType"], "text/plain");
    }

    #[tokio::test]
    async fn test_from_config_with_retrying_fallback() {
        let fallback = MockServer::start().await;
        mount_supported(&fallback).await;
        mount_verify(&fallback, json!({ "isValid": true }), 1).await;
        mount_settle(&fallback, settlement(), 1).await;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let refused = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let mut primary = FacilitatorConfig::new(Url::parse(&refused).unwrap());
        primary.retry = RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        };
        let secondary = FacilitatorConfig::new(Url::parse(&fallback.uri()).unwrap());
        let x402 = X402Middleware::from_config(&primary, Some(&secondary)).unwrap();
        assert!(x402.fallback().is_some());

        let (status, _, _) = send(
            app(x402).await,
            "/premium",
            Some(payment_header("exact", "base-sepolia")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}
