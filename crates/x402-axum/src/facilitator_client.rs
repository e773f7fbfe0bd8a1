//! A [`x402_types::facilitator::Facilitator`] implementation that interacts with a _remote_ x402 Facilitator over HTTP.
//!
//! This [`FacilitatorClient`] handles the `/verify`, `/settle`, and `/supported` endpoints of a remote facilitator,
//! and implements the [`x402_types::facilitator::Facilitator`] trait for compatibility
//! with x402-based middleware and logic.
//!
//! ## Example
//!
//! ```rust
//! use x402_axum::facilitator_client::FacilitatorClient;
//!
//! let facilitator = FacilitatorClient::try_from("https://facilitator.x402.rs").unwrap();
//! ```
//!
//! ## Features
//!
//! - Per-operation timeouts, applied only when the caller's [`CallContext`] has no deadline
//! - Static `Authorization` header, or a provider invoked once per attempt for rotating tokens
//! - Retry of transport-level failures with exponential backoff (off by default)
//! - Before/after hooks around verify and settle for external instrumentation
//! - Integrates with `tracing` if the `telemetry` feature is enabled
//!
//! ## Error Handling
//!
//! Every call returns a [`FacilitatorError`]. Only [`FacilitatorError::Unavailable`] is retried.
//! A non-2xx answer becomes [`FacilitatorError::VerificationFailed`] or
//! [`FacilitatorError::SettlementFailed`], carrying the facilitator's reason when it gave one.

use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue, StatusCode};
use reqwest::{Client, RequestBuilder};
use std::fmt;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use x402_types::config::{
    DEFAULT_SETTLE_TIMEOUT, DEFAULT_SUPPORTED_TIMEOUT, DEFAULT_VERIFY_TIMEOUT, FacilitatorConfig,
};
use x402_types::facilitator::{BoxError, Facilitator, FacilitatorError};
use x402_types::proto::{
    SettleRequest, SettleResponse, SupportedResponse, VerifyRequest, VerifyResponse,
};
use x402_types::util::{CallContext, RetryPolicy, with_retry};

#[cfg(feature = "telemetry")]
use tracing::{Span, instrument};

/// Upper bound on how much of an unparseable error body ends up in an error message.
const MAX_ERROR_BODY_BYTES: usize = 500;

/// Produces an `Authorization` header value. Called once per request attempt.
pub type AuthorizationProvider = Arc<dyn Fn() -> Result<String, BoxError> + Send + Sync>;

type BeforeHook = Arc<dyn Fn(&VerifyRequest) + Send + Sync>;
type AfterVerifyHook =
    Arc<dyn Fn(&VerifyRequest, Result<&VerifyResponse, &FacilitatorError>) + Send + Sync>;
type AfterSettleHook =
    Arc<dyn Fn(&SettleRequest, Result<&SettleResponse, &FacilitatorError>) + Send + Sync>;

/// Observers around verify and settle. They see requests and outcomes but cannot change them.
///
/// Each hook fires once per operation, not once per retry attempt.
#[derive(Clone, Default)]
pub struct FacilitatorHooks {
    before_verify: Option<BeforeHook>,
    after_verify: Option<AfterVerifyHook>,
    before_settle: Option<BeforeHook>,
    after_settle: Option<AfterSettleHook>,
}

impl FacilitatorHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_verify<H>(mut self, hook: H) -> Self
    where
        H: Fn(&VerifyRequest) + Send + Sync + 'static,
    {
        self.before_verify = Some(Arc::new(hook));
        self
    }

    pub fn after_verify<H>(mut self, hook: H) -> Self
    where
        H: Fn(&VerifyRequest, Result<&VerifyResponse, &FacilitatorError>) + Send + Sync + 'static,
    {
        self.after_verify = Some(Arc::new(hook));
        self
    }

    pub fn before_settle<H>(mut self, hook: H) -> Self
    where
        H: Fn(&SettleRequest) + Send + Sync + 'static,
    {
        self.before_settle = Some(Arc::new(hook));
        self
    }

    pub fn after_settle<H>(mut self, hook: H) -> Self
    where
        H: Fn(&SettleRequest, Result<&SettleResponse, &FacilitatorError>) + Send + Sync + 'static,
    {
        self.after_settle = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for FacilitatorHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FacilitatorHooks")
            .field("before_verify", &self.before_verify.is_some())
            .field("after_verify", &self.after_verify.is_some())
            .field("before_settle", &self.before_settle.is_some())
            .field("after_settle", &self.after_settle.is_some())
            .finish()
    }
}

/// Per-operation timeouts. Used only when the caller's context carries no deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FacilitatorTimeouts {
    pub verify: Duration,
    pub settle: Duration,
    pub supported: Duration,
}

impl Default for FacilitatorTimeouts {
    fn default() -> Self {
        Self {
            verify: DEFAULT_VERIFY_TIMEOUT,
            settle: DEFAULT_SETTLE_TIMEOUT,
            supported: DEFAULT_SUPPORTED_TIMEOUT,
        }
    }
}

#[derive(Clone, Default)]
struct Authorization {
    value: Option<HeaderValue>,
    provider: Option<AuthorizationProvider>,
}

impl Authorization {
    /// The header for one attempt. The provider, when set, wins over the static value.
    fn header(&self) -> Result<Option<HeaderValue>, FacilitatorError> {
        match &self.provider {
            Some(provider) => {
                let token = provider().map_err(|source| FacilitatorError::InvalidConfig {
                    context: "Authorization provider failed",
                    source,
                })?;
                let mut value = HeaderValue::from_str(&token).map_err(|e| {
                    FacilitatorError::InvalidConfig {
                        context: "Authorization provider returned an invalid header value",
                        source: e.into(),
                    }
                })?;
                value.set_sensitive(true);
                Ok(Some(value))
            }
            None => Ok(self.value.clone()),
        }
    }
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorization")
            .field("value", &self.value.as_ref().map(|_| "<redacted>"))
            .field("provider", &self.provider.is_some())
            .finish()
    }
}

/// What a call is for. Decides the error variant and the reason field of a non-2xx body.
#[derive(Clone, Copy, Debug)]
enum Operation {
    Verify,
    Settle,
    Supported,
}

impl Operation {
    fn context(self) -> &'static str {
        match self {
            Operation::Verify => "POST /verify",
            Operation::Settle => "POST /settle",
            Operation::Supported => "GET /supported",
        }
    }

    fn reason_field(self) -> &'static str {
        match self {
            Operation::Verify => "invalidReason",
            Operation::Settle => "errorReason",
            Operation::Supported => "error",
        }
    }

    fn rejected(self, reason: String) -> FacilitatorError {
        match self {
            Operation::Verify => FacilitatorError::VerificationFailed { reason },
            Operation::Settle => FacilitatorError::SettlementFailed { reason },
            Operation::Supported => FacilitatorError::unavailable(self.context(), reason),
        }
    }
}

/// A client for communicating with a remote x402 facilitator.
///
/// Handles `/verify`, `/settle`, and `/supported` endpoints via JSON HTTP.
#[derive(Clone, Debug)]
pub struct FacilitatorClient {
    /// Base URL of the facilitator (e.g. `https://facilitator.example/`)
    base_url: Url,
    /// Full URL to `POST /verify` requests
    verify_url: Url,
    /// Full URL to `POST /settle` requests
    settle_url: Url,
    /// Full URL to `GET /supported` requests
    supported_url: Url,
    /// Shared Reqwest HTTP client
    client: Client,
    /// Optional custom headers sent with each request
    headers: HeaderMap,
    authorization: Authorization,
    timeouts: FacilitatorTimeouts,
    retry: RetryPolicy,
    hooks: FacilitatorHooks,
}

impl Facilitator for FacilitatorClient {
    async fn verify(
        &self,
        ctx: &CallContext,
        request: &VerifyRequest,
    ) -> Result<VerifyResponse, FacilitatorError> {
        FacilitatorClient::verify(self, ctx, request).await
    }

    async fn settle(
        &self,
        ctx: &CallContext,
        request: &SettleRequest,
    ) -> Result<SettleResponse, FacilitatorError> {
        FacilitatorClient::settle(self, ctx, request).await
    }

    async fn supported(&self, ctx: &CallContext) -> Result<SupportedResponse, FacilitatorError> {
        FacilitatorClient::supported(self, ctx).await
    }
}

impl FacilitatorClient {
    /// Returns the base URL used by this client.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Returns the computed `./verify` URL relative to [`FacilitatorClient::base_url`].
    pub fn verify_url(&self) -> &Url {
        &self.verify_url
    }

    /// Returns the computed `./settle` URL relative to [`FacilitatorClient::base_url`].
    pub fn settle_url(&self) -> &Url {
        &self.settle_url
    }

    /// Returns the computed `./supported` URL relative to [`FacilitatorClient::base_url`].
    pub fn supported_url(&self) -> &Url {
        &self.supported_url
    }

    /// Returns any custom headers configured on the client.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn timeouts(&self) -> &FacilitatorTimeouts {
        &self.timeouts
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Constructs a new [`FacilitatorClient`] from a base URL.
    ///
    /// This sets up `./verify`, `./settle`, and `./supported` endpoint URLs relative to the base.
    /// A base URL whose path lacks a trailing slash is treated as a directory.
    pub fn try_new(base_url: Url) -> Result<Self, FacilitatorError> {
        let base_url = normalize_base_url(base_url);
        let join = |path: &str, context: &'static str| {
            base_url
                .join(path)
                .map_err(|source| FacilitatorError::UrlParse { context, source })
        };
        let verify_url = join("./verify", "Failed to construct ./verify URL")?;
        let settle_url = join("./settle", "Failed to construct ./settle URL")?;
        let supported_url = join("./supported", "Failed to construct ./supported URL")?;
        Ok(Self {
            client: Client::new(),
            base_url,
            verify_url,
            settle_url,
            supported_url,
            headers: HeaderMap::new(),
            authorization: Authorization::default(),
            timeouts: FacilitatorTimeouts::default(),
            retry: RetryPolicy::default(),
            hooks: FacilitatorHooks::default(),
        })
    }

    /// Builds a client from a [`FacilitatorConfig`].
    pub fn try_from_config(config: &FacilitatorConfig) -> Result<Self, FacilitatorError> {
        let mut client = Self::try_new(config.url.clone())?
            .with_timeouts(FacilitatorTimeouts {
                verify: config.verify_timeout,
                settle: config.settle_timeout,
                supported: config.supported_timeout,
            })
            .with_retry(config.retry.clone());
        if let Some(authorization) = &config.authorization {
            let value = HeaderValue::from_str(authorization).map_err(|e| {
                FacilitatorError::InvalidConfig {
                    context: "Invalid authorization header value",
                    source: e.into(),
                }
            })?;
            client = client.with_authorization(value);
        }
        Ok(client)
    }

    /// Uses a preconfigured [`reqwest::Client`], e.g. one with custom TLS or proxies.
    pub fn with_http_client(&self, client: Client) -> Self {
        let mut this = self.clone();
        this.client = client;
        this
    }

    /// Attaches custom headers to all future requests.
    pub fn with_headers(&self, headers: HeaderMap) -> Self {
        let mut this = self.clone();
        this.headers = headers;
        this
    }

    /// Sets a static `Authorization` header value.
    pub fn with_authorization(&self, mut value: HeaderValue) -> Self {
        value.set_sensitive(true);
        let mut this = self.clone();
        this.authorization.value = Some(value);
        this
    }

    /// Sets a provider called once per attempt for the `Authorization` header.
    ///
    /// Takes precedence over [`FacilitatorClient::with_authorization`].
    pub fn with_authorization_provider<P>(&self, provider: P) -> Self
    where
        P: Fn() -> Result<String, BoxError> + Send + Sync + 'static,
    {
        let mut this = self.clone();
        this.authorization.provider = Some(Arc::new(provider));
        this
    }

    pub fn with_timeouts(&self, timeouts: FacilitatorTimeouts) -> Self {
        let mut this = self.clone();
        this.timeouts = timeouts;
        this
    }

    /// Sets the retry budget for transport-level failures.
    pub fn with_retry(&self, retry: RetryPolicy) -> Self {
        let mut this = self.clone();
        this.retry = retry;
        this
    }

    pub fn with_hooks(&self, hooks: FacilitatorHooks) -> Self {
        let mut this = self.clone();
        this.hooks = hooks;
        this
    }

    /// Sends a `POST /verify` request to the facilitator.
    #[cfg_attr(
        feature = "telemetry",
        instrument(
            name = "x402.facilitator_client.verify",
            skip_all,
            fields(timeout = ?self.timeouts.verify, otel.status_code = tracing::field::Empty, error.message = tracing::field::Empty)
        )
    )]
    pub async fn verify(
        &self,
        ctx: &CallContext,
        request: &VerifyRequest,
    ) -> Result<VerifyResponse, FacilitatorError> {
        if let Some(hook) = &self.hooks.before_verify {
            hook(request);
        }
        let ctx = ctx.or_timeout(self.timeouts.verify);
        let result = self
            .post_json(&ctx, &self.verify_url, Operation::Verify, request)
            .await;
        if let Some(hook) = &self.hooks.after_verify {
            hook(request, result.as_ref());
        }
        result
    }

    /// Sends a `POST /settle` request to the facilitator.
    #[cfg_attr(
        feature = "telemetry",
        instrument(
            name = "x402.facilitator_client.settle",
            skip_all,
            fields(timeout = ?self.timeouts.settle, otel.status_code = tracing::field::Empty, error.message = tracing::field::Empty)
        )
    )]
    pub async fn settle(
        &self,
        ctx: &CallContext,
        request: &SettleRequest,
    ) -> Result<SettleResponse, FacilitatorError> {
        if let Some(hook) = &self.hooks.before_settle {
            hook(request);
        }
        let ctx = ctx.or_timeout(self.timeouts.settle);
        let result = self
            .post_json(&ctx, &self.settle_url, Operation::Settle, request)
            .await;
        if let Some(hook) = &self.hooks.after_settle {
            hook(request, result.as_ref());
        }
        result
    }

    /// Sends a `GET /supported` request to the facilitator.
    #[cfg_attr(
        feature = "telemetry",
        instrument(
            name = "x402.facilitator_client.supported",
            skip_all,
            fields(otel.status_code = tracing::field::Empty, error.message = tracing::field::Empty)
        )
    )]
    pub async fn supported(&self, ctx: &CallContext) -> Result<SupportedResponse, FacilitatorError> {
        let ctx = ctx.or_timeout(self.timeouts.supported);
        let result = with_retry(&ctx, &self.retry, FacilitatorError::is_transport, || {
            let request = self.client.get(self.supported_url.clone());
            self.send_once(&ctx, request, Operation::Supported)
        })
        .await;
        record_result_on_span(&result);
        result
    }

    /// Generic POST helper that handles JSON serialization, retries, error mapping
    /// and telemetry integration.
    async fn post_json<T, R>(
        &self,
        ctx: &CallContext,
        url: &Url,
        operation: Operation,
        payload: &T,
    ) -> Result<R, FacilitatorError>
    where
        T: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let result = with_retry(ctx, &self.retry, FacilitatorError::is_transport, || {
            let request = self.client.post(url.clone()).json(payload);
            self.send_once(ctx, request, operation)
        })
        .await;
        record_result_on_span(&result);
        result
    }

    /// One attempt: decorate, send under the context, map the answer.
    async fn send_once<R>(
        &self,
        ctx: &CallContext,
        request: RequestBuilder,
        operation: Operation,
    ) -> Result<R, FacilitatorError>
    where
        R: serde::de::DeserializeOwned,
    {
        let context = operation.context();
        let mut request = request.headers(self.headers.clone());
        if let Some(authorization) = self.authorization.header()? {
            request = request.header(AUTHORIZATION, authorization);
        }

        let response = ctx
            .run(request.send())
            .await
            .map_err(|done| FacilitatorError::unavailable(context, done))?
            .map_err(|e| FacilitatorError::unavailable(context, e))?;
        let status = response.status();
        let body = ctx
            .run(response.bytes())
            .await
            .map_err(|done| FacilitatorError::unavailable(context, done))?
            .map_err(|e| FacilitatorError::unavailable(context, e))?;

        if status.is_success() {
            serde_json::from_slice(&body).map_err(|e| {
                operation.rejected(format!("Failed to deserialize response from {context}: {e}"))
            })
        } else {
            Err(operation.rejected(failure_reason(status, &body, operation.reason_field())))
        }
    }
}

/// Adds a trailing slash so relative joins stay under the base path.
fn normalize_base_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Best available explanation for a non-2xx answer: the facilitator's own reason field,
/// else the start of the raw body, else the status.
fn failure_reason(status: StatusCode, body: &[u8], field: &str) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(reason) = json.get(field).and_then(serde_json::Value::as_str)
        && !reason.is_empty()
    {
        return reason.to_string();
    }
    if body.is_empty() {
        return format!("HTTP {status}");
    }
    let end = body.len().min(MAX_ERROR_BODY_BYTES);
    format!("HTTP {status}: {}", String::from_utf8_lossy(&body[..end]))
}

/// Converts a string URL into a `FacilitatorClient`, parsing the URL and calling `try_new`.
impl TryFrom<&str> for FacilitatorClient {
    type Error = FacilitatorError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let url = Url::parse(value).map_err(|e| FacilitatorError::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        FacilitatorClient::try_new(url)
    }
}

/// Converts a String URL into a `FacilitatorClient`.
impl TryFrom<String> for FacilitatorClient {
    type Error = FacilitatorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FacilitatorClient::try_from(value.as_str())
    }
}

/// Records the outcome of a request on a tracing span, including status and errors.
#[cfg(feature = "telemetry")]
fn record_result_on_span<R, E: Display>(result: &Result<R, E>) {
    let span = Span::current();
    match result {
        Ok(_) => {
            span.record("otel.status_code", "OK");
        }
        Err(err) => {
            span.record("otel.status_code", "ERROR");
            span.record("error.message", tracing::field::display(err));
            tracing::event!(tracing::Level::ERROR, error = %err, "Request to facilitator failed");
        }
    }
}

/// Records the outcome of a request on a tracing span, including status and errors.
/// Noop if telemetry feature is off.
#[cfg(not(feature = "telemetry"))]
fn record_result_on_span<R, E: Display>(_result: &Result<R, E>) {}
