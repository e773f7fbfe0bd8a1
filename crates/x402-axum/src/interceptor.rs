//! Commit-deferred settlement.
//!
//! The protected handler runs after verification but before settlement. When it commits
//! to a response (its status and headers are known, its body not yet sent), the
//! [`SettlementInterceptor`] decides:
//!
//! - status `>= 400`: the response passes through and settlement is never attempted;
//! - status `< 400`: the payment is settled first. On success `X-PAYMENT-RESPONSE` is added
//!   and the handler's status, headers and (possibly streaming) body pass through untouched.
//!   On failure the handler's response is dropped unsent and a 402 or 503 replaces it.
//!
//! A caller is therefore charged if and only if the handler produced a non-error response.

use axum_core::response::Response;
use http::StatusCode;
use x402_types::facilitator::Facilitator;
use x402_types::proto::{PaymentRequirements, SettleRequest, SettleResponse};
use x402_types::util::CallContext;

use crate::paygate::{PaygateError, add_settlement_response_header};

/// Where the interceptor is in its single transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorState {
    /// The handler has not produced a response yet.
    Idle,
    /// The response status is fixed.
    ///
    /// `hijacked` means settlement failed and the handler's response was replaced.
    Committed { status: StatusCode, hijacked: bool },
}

/// Wraps the handler's response for one verified request.
pub struct SettlementInterceptor<'a, F> {
    facilitator: &'a F,
    ctx: &'a CallContext,
    request: &'a SettleRequest,
    accepts: &'a [PaymentRequirements],
    verify_only: bool,
    state: InterceptorState,
}

impl<'a, F> SettlementInterceptor<'a, F>
where
    F: Facilitator + Sync,
{
    pub fn new(
        facilitator: &'a F,
        ctx: &'a CallContext,
        request: &'a SettleRequest,
        accepts: &'a [PaymentRequirements],
        verify_only: bool,
    ) -> Self {
        Self {
            facilitator,
            ctx,
            request,
            accepts,
            verify_only,
            state: InterceptorState::Idle,
        }
    }

    pub fn state(&self) -> InterceptorState {
        self.state
    }

    /// Commits the handler's response, settling if it is a success.
    ///
    /// Only the first call settles; later calls return their response unchanged.
    pub async fn commit(&mut self, response: Response) -> Response {
        if let InterceptorState::Committed { .. } = self.state {
            return response;
        }
        let status = response.status();
        if status.as_u16() >= 400 || self.verify_only {
            self.state = InterceptorState::Committed {
                status,
                hijacked: false,
            };
            return response;
        }

        match self.settle().await {
            Ok(settlement) => {
                let mut response = response;
                if let Err(_err) = add_settlement_response_header(&mut response, &settlement) {
                    #[cfg(feature = "telemetry")]
                    tracing::error!(error = %_err, "Settled, but failed to attach X-PAYMENT-RESPONSE");
                }
                self.state = InterceptorState::Committed {
                    status,
                    hijacked: false,
                };
                response
            }
            Err(err) => {
                #[cfg(feature = "telemetry")]
                tracing::warn!(error = %err, "Settlement failed, discarding handler response");
                drop(response);
                self.state = InterceptorState::Committed {
                    status: err.status(),
                    hijacked: true,
                };
                err.into_response(self.accepts)
            }
        }
    }

    async fn settle(&self) -> Result<SettleResponse, PaygateError> {
        let settlement = self
            .facilitator
            .settle(self.ctx, self.request)
            .await
            .map_err(PaygateError::from_settle)?;
        if !settlement.success {
            let reason = settlement
                .error_reason
                .unwrap_or_else(|| "settlement was not successful".to_string());
            return Err(PaygateError::Settlement(reason));
        }
        Ok(settlement)
    }
}
