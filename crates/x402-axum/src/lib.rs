//! Axum middleware and helpers for enforcing [x402](https://www.x402.org) payments.
//!
//! This crate provides an [`X402Middleware`] Axum layer for protecting routes with payment enforcement,
//! as well as a [`FacilitatorClient`] for communicating with remote x402 facilitators.
//!
//! ## Quickstart
//!
//! ```rust,no_run
//! use axum::{Router, routing::get, Json};
//! use axum::response::IntoResponse;
//! use http::StatusCode;
//! use serde_json::json;
//! use x402_axum::X402Middleware;
//! use x402_types::proto::PaymentRequirements;
//!
//! # async fn app() -> Router {
//! let x402 = X402Middleware::try_from("https://facilitator.example.com/").unwrap();
//! let requirement: PaymentRequirements = serde_json::from_value(json!({
//!     "scheme": "exact",
//!     "network": "base-sepolia",
//!     "maxAmountRequired": "25000",
//!     "payTo": "0xADDRESS",
//!     "maxTimeoutSeconds": 300,
//!     "asset": "0x036CbD53842c5426634e7929541eC2318f3dCF7e"
//! }))
//! .unwrap();
//!
//! let layer = x402
//!     .with_requirement(requirement)
//!     .with_description("Premium Content")
//!     .build()
//!     .await;
//!
//! Router::new().route("/paywall", get(my_handler).layer(layer))
//! # }
//!
//! async fn my_handler() -> impl IntoResponse {
//!     (StatusCode::OK, Json(json!({ "hello": "world" })))
//! }
//! ```
//! See [`X402Middleware`] for full configuration options.
//! For low-level interaction with the facilitator, see [`facilitator_client::FacilitatorClient`].
//!
//! ## Other routers
//!
//! The [`paygate`] module exposes the pieces the layer is built from
//! ([`parse_payment_header`], [`find_matching_requirement`], [`payment_required_response`],
//! [`add_settlement_response_header`]) so other `http`-based routers can enforce payments
//! the same way.

pub mod facilitator_client;
pub mod interceptor;
pub mod layer;
pub mod paygate;

pub use facilitator_client::{FacilitatorClient, FacilitatorHooks, FacilitatorTimeouts};
pub use interceptor::{InterceptorState, SettlementInterceptor};
pub use layer::{X402Layer, X402LayerBuilder, X402Middleware, X402MiddlewareService};
pub use paygate::{
    FallbackFacilitator, PaygateError, VerifiedPayment, X_PAYMENT, X_PAYMENT_RESPONSE,
    add_settlement_response_header, find_matching_requirement, parse_payment_header,
    payment_required_response, verified_payment,
};
