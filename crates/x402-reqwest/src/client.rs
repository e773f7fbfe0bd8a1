//! Client-side x402 payment handling for reqwest.
//!
//! This module provides the [`X402Client`] which holds the registered [`Signer`]s and
//! pays `402 Payment Required` responses automatically.

use http::{Extensions, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::{Request, Response, Url};
use reqwest_middleware as rqm;
use std::fmt;
use std::sync::Arc;
use x402_types::client::{Signer, Signers, X402Error, select};
use x402_types::facilitator::BoxError;
use x402_types::proto::{
    PaymentRequired, PaymentRequirements, SettleResponse, decode_settlement_header,
    encode_payment_header,
};

#[cfg(feature = "telemetry")]
use tracing::{debug, info, instrument, trace};

/// `X-PAYMENT`, set on the paid retry.
pub const X_PAYMENT: HeaderName = HeaderName::from_static("x-payment");
/// `X-PAYMENT-RESPONSE`, read from the paid retry's response.
pub const X_PAYMENT_RESPONSE: HeaderName = HeaderName::from_static("x-payment-response");

/// The request cannot be replayed with a payment attached.
#[derive(Debug, thiserror::Error)]
#[error("Request object is not cloneable. Are you passing a streaming body?")]
pub struct RequestNotCloneable;

/// What is about to be paid, reported before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentAttempt {
    pub method: Method,
    pub url: Url,
    pub network: String,
    pub scheme: String,
    /// `maxAmountRequired` of the selected requirement, in token base units.
    pub amount: String,
    pub asset: String,
    pub recipient: String,
}

impl PaymentAttempt {
    fn new(method: &Method, url: &Url, requirements: &PaymentRequirements) -> Self {
        Self {
            method: method.clone(),
            url: url.clone(),
            network: requirements.network.clone(),
            scheme: requirements.scheme.clone(),
            amount: requirements.max_amount_required.clone(),
            asset: requirements.asset.clone(),
            recipient: requirements.pay_to.clone(),
        }
    }
}

/// Why a paid retry did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentFailure {
    /// The paid retry never produced a response.
    Transport(String),
    /// The server answered the paid retry with another 402.
    Rejected,
    /// The server reported an unsuccessful settlement.
    Settlement(SettleResponse),
}

type AttemptCallback = Arc<dyn Fn(&PaymentAttempt) + Send + Sync>;
type SuccessCallback = Arc<dyn Fn(&PaymentAttempt, Option<&SettleResponse>) + Send + Sync>;
type FailureCallback = Arc<dyn Fn(&PaymentAttempt, &PaymentFailure) + Send + Sync>;

/// The x402 client: registered signers plus optional payment event callbacks.
///
/// The [`X402Client`] acts as middleware for reqwest, automatically handling
/// 402 Payment Required responses by extracting payment requirements, signing
/// a payment, and retrying the request.
///
/// ## Registering Signers
///
/// ```rust,ignore
/// use x402_reqwest::X402Client;
///
/// let client = X402Client::new()
///     .register(MyBaseSigner::new(key))
///     .on_success(|attempt, settlement| println!("paid {} on {}", attempt.amount, attempt.network));
/// ```
///
/// ## Using with Reqwest
///
/// See the [`ReqwestWithPayments`](crate::ReqwestWithPayments) trait for integrating with reqwest.
#[derive(Clone, Default)]
pub struct X402Client {
    signers: Signers,
    on_attempt: Option<AttemptCallback>,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
}

impl X402Client {
    /// Creates a new [`X402Client`] without signers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a signer.
    ///
    /// Signers are tried in ascending [`Signer::priority`]; ties keep registration order.
    pub fn register<S>(mut self, signer: S) -> Self
    where
        S: Signer + 'static,
    {
        self.signers.push(signer);
        self
    }

    /// Registers a signer shared with other clients.
    pub fn register_arc(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signers.push_arc(signer);
        self
    }

    pub fn signers(&self) -> &Signers {
        &self.signers
    }

    /// Called after selection, before the signer is asked to sign.
    pub fn on_attempt<C>(mut self, callback: C) -> Self
    where
        C: Fn(&PaymentAttempt) + Send + Sync + 'static,
    {
        self.on_attempt = Some(Arc::new(callback));
        self
    }

    /// Called when the paid retry succeeded, with the settlement if the server sent one.
    pub fn on_success<C>(mut self, callback: C) -> Self
    where
        C: Fn(&PaymentAttempt, Option<&SettleResponse>) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    /// Called when the paid retry failed.
    pub fn on_failure<C>(mut self, callback: C) -> Self
    where
        C: Fn(&PaymentAttempt, &PaymentFailure) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    /// Selects a requirement and a signer, signs, and encodes the `X-PAYMENT` value.
    ///
    /// # Errors
    ///
    /// [`X402Error::NoValidSigner`] or [`X402Error::InvalidRequirements`] when nothing can
    /// be paid, [`X402Error::SigningFailed`] when the selected signer fails.
    pub async fn make_payment_header(
        &self,
        method: &Method,
        url: &Url,
        accepts: &[PaymentRequirements],
    ) -> Result<(HeaderValue, PaymentAttempt), X402Error> {
        let selection = select(accepts, self.signers.as_slice())?;
        let attempt = PaymentAttempt::new(method, url, selection.requirements);

        #[cfg(feature = "telemetry")]
        debug!(
            scheme = %attempt.scheme,
            network = %attempt.network,
            amount = %attempt.amount,
            "Selected payment requirement"
        );

        if let Some(callback) = &self.on_attempt {
            callback(&attempt);
        }
        let payload = selection.sign().await?;
        let signing_failed = |source: BoxError| X402Error::SigningFailed {
            scheme: payload.scheme.clone(),
            network: payload.network.clone(),
            source,
        };
        let encoded = encode_payment_header(&payload).map_err(|e| signing_failed(e.into()))?;
        let header = HeaderValue::from_bytes(encoded.as_ref()).map_err(|e| signing_failed(e.into()))?;
        Ok((header, attempt))
    }

    fn report(&self, attempt: &PaymentAttempt, result: &rqm::Result<Response>) {
        let outcome = match result {
            Err(err) => Err(PaymentFailure::Transport(err.to_string())),
            Ok(res) if res.status() == StatusCode::PAYMENT_REQUIRED => Err(PaymentFailure::Rejected),
            Ok(res) => match settlement_response(res) {
                Some(settlement) if !settlement.success => Err(PaymentFailure::Settlement(settlement)),
                settlement => Ok(settlement),
            },
        };
        match outcome {
            Ok(settlement) => {
                if let Some(callback) = &self.on_success {
                    callback(attempt, settlement.as_ref());
                }
            }
            Err(failure) => {
                #[cfg(feature = "telemetry")]
                info!(?failure, url = %attempt.url, "Paid request did not go through");
                if let Some(callback) = &self.on_failure {
                    callback(attempt, &failure);
                }
            }
        }
    }
}

impl fmt::Debug for X402Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X402Client")
            .field("signers", &self.signers)
            .field("on_attempt", &self.on_attempt.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

fn middleware_error<E>(error: E) -> rqm::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rqm::Error::Middleware(error.into())
}

#[async_trait::async_trait]
impl rqm::Middleware for X402Client {
    /// Handles a request, automatically handling 402 responses.
    ///
    /// When a 402 response is received, this middleware:
    /// 1. Extracts payment requirements from the response body
    /// 2. Selects a signer and signs a payment
    /// 3. Retries a copy of the original request with the `X-PAYMENT` header
    #[cfg_attr(feature = "telemetry", instrument(name = "x402.reqwest.handle", skip_all, err))]
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: rqm::Next<'_>,
    ) -> rqm::Result<Response> {
        let retry_req = req.try_clone();
        let res = next.clone().run(req, extensions).await?;

        if res.status() != StatusCode::PAYMENT_REQUIRED {
            #[cfg(feature = "telemetry")]
            trace!(status = ?res.status(), "No payment required, returning response");
            return Ok(res);
        }

        #[cfg(feature = "telemetry")]
        info!(url = %res.url(), "Received 402 Payment Required, processing payment");

        let mut retry = retry_req.ok_or_else(|| middleware_error(RequestNotCloneable))?;
        let payment_required = parse_payment_required(res).await.map_err(middleware_error)?;
        let (header, attempt) = self
            .make_payment_header(retry.method(), retry.url(), &payment_required.accepts)
            .await
            .map_err(middleware_error)?;
        retry.headers_mut().insert(X_PAYMENT, header);

        #[cfg(feature = "telemetry")]
        trace!(url = %retry.url(), "Retrying request with payment header");

        let result = next.run(retry, extensions).await;
        self.report(&attempt, &result);
        result
    }
}

/// Reads a 402 body as a [`PaymentRequired`], consuming the response.
///
/// An empty body, invalid JSON, or a missing, null or empty `accepts` list is
/// [`X402Error::InvalidRequirements`].
#[cfg_attr(feature = "telemetry", instrument(name = "x402.reqwest.parse_payment_required", skip_all, err))]
pub async fn parse_payment_required(response: Response) -> Result<PaymentRequired, X402Error> {
    let body = response
        .bytes()
        .await
        .map_err(|e| X402Error::InvalidRequirements(format!("failed to read 402 body: {e}")))?;
    if body.is_empty() {
        return Err(X402Error::InvalidRequirements("empty 402 body".to_string()));
    }
    let payment_required: PaymentRequired = serde_json::from_slice(&body)
        .map_err(|e| X402Error::InvalidRequirements(format!("malformed 402 body: {e}")))?;
    if payment_required.accepts.is_empty() {
        return Err(X402Error::InvalidRequirements("402 body accepts nothing".to_string()));
    }
    Ok(payment_required)
}

/// Decodes the `X-PAYMENT-RESPONSE` header of a response. Absent or malformed yields `None`.
pub fn settlement_response(response: &Response) -> Option<SettleResponse> {
    decode_settlement_header(response.headers().get(X_PAYMENT_RESPONSE).map(HeaderValue::as_bytes))
}
