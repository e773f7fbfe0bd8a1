//! Core trait defining the verification and settlement interface for x402 facilitators.
//!
//! A facilitator validates incoming payment payloads against requirements
//! ([`Facilitator::verify`]) and executes them ([`Facilitator::settle`]). This crate never
//! touches a chain itself; implementors either talk to a remote facilitator over HTTP
//! or wrap one in-process.

use std::error::Error;
use std::future::Future;
use std::sync::Arc;

use crate::proto::{
    PaymentRequirements, SettleRequest, SettleResponse, SupportedResponse, VerifyRequest,
    VerifyResponse,
};
use crate::util::CallContext;

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Errors that can occur while talking to a facilitator.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorError {
    /// The facilitator could not be reached: connection refused, DNS, timeout, cancellation.
    ///
    /// The only retryable class.
    #[error("Facilitator unavailable: {context}: {source}")]
    Unavailable {
        context: &'static str,
        #[source]
        source: BoxError,
    },
    /// The facilitator answered, but rejected or failed the verification.
    #[error("Verification failed: {reason}")]
    VerificationFailed { reason: String },
    /// The facilitator answered, but rejected or failed the settlement.
    #[error("Settlement failed: {reason}")]
    SettlementFailed { reason: String },
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    /// A client could not be built from its configuration.
    #[error("Invalid facilitator configuration: {context}: {source}")]
    InvalidConfig {
        context: &'static str,
        #[source]
        source: BoxError,
    },
}

impl FacilitatorError {
    pub fn unavailable<E: Into<BoxError>>(context: &'static str, source: E) -> Self {
        Self::Unavailable {
            context,
            source: source.into(),
        }
    }

    /// True for transport-level failures, the retry predicate for facilitator calls.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Trait defining the asynchronous interface for x402 payment facilitators.
pub trait Facilitator {
    /// Verifies a payment payload against the requirements in `request`.
    ///
    /// A well-formed rejection comes back as `Ok` with `is_valid == false`.
    fn verify(
        &self,
        ctx: &CallContext,
        request: &VerifyRequest,
    ) -> impl Future<Output = Result<VerifyResponse, FacilitatorError>> + Send;

    /// Executes a previously verified payment.
    fn settle(
        &self,
        ctx: &CallContext,
        request: &SettleRequest,
    ) -> impl Future<Output = Result<SettleResponse, FacilitatorError>> + Send;

    /// Lists the payment kinds this facilitator handles.
    fn supported(
        &self,
        ctx: &CallContext,
    ) -> impl Future<Output = Result<SupportedResponse, FacilitatorError>> + Send;

    /// Fetches [`Facilitator::supported`] once and merges the facilitator's extra data
    /// into every matching requirement. Caller-specified keys are never overwritten.
    fn enrich_requirements(
        &self,
        ctx: &CallContext,
        requirements: &[PaymentRequirements],
    ) -> impl Future<Output = Result<Vec<PaymentRequirements>, FacilitatorError>> + Send
    where
        Self: Sync,
    {
        async move {
            let supported = self.supported(ctx).await?;
            Ok(supported.enrich(requirements))
        }
    }
}

impl<T: Facilitator + Send + Sync> Facilitator for Arc<T> {
    fn verify(
        &self,
        ctx: &CallContext,
        request: &VerifyRequest,
    ) -> impl Future<Output = Result<VerifyResponse, FacilitatorError>> + Send {
        self.as_ref().verify(ctx, request)
    }

    fn settle(
        &self,
        ctx: &CallContext,
        request: &SettleRequest,
    ) -> impl Future<Output = Result<SettleResponse, FacilitatorError>> + Send {
        self.as_ref().settle(ctx, request)
    }

    fn supported(
        &self,
        ctx: &CallContext,
    ) -> impl Future<Output = Result<SupportedResponse, FacilitatorError>> + Send {
        self.as_ref().supported(ctx)
    }
}
