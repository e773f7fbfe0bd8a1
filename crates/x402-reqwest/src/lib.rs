#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Reqwest middleware for automatic [x402](https://www.x402.org) payment handling.
//!
//! This crate provides a [`X402Client`] that can be used as a `reqwest` middleware
//! to automatically handle `402 Payment Required` responses. When a request receives
//! a 402 response, the middleware reads the payment requirements from its body, signs a
//! payment with one of the registered signers, and retries a copy of the request with the
//! `X-PAYMENT` header. Responses other than 402 are returned untouched.
//!
//! ## Quickstart
//!
//! ```rust,ignore
//! use x402_reqwest::{ReqwestWithPayments, ReqwestWithPaymentsBuild, X402Client};
//! use reqwest::Client;
//!
//! // Create an X402 client and register signers
//! let x402_client = X402Client::new()
//!     .register(MyEvmSigner::new(key));
//!
//! // Build a reqwest client with x402 middleware
//! let http_client = Client::new()
//!     .with_payments(x402_client)
//!     .build();
//!
//! // Use the client - payments are handled automatically
//! let response = http_client
//!     .get("https://api.example.com/protected")
//!     .send()
//!     .await?;
//! let settlement = x402_reqwest::settlement_response(&response);
//! ```
//!
//! ## Signers
//!
//! Signing backends implement [`x402_types::client::Signer`]. When several requirements and
//! signers are available, requirements are tried in the server's order and, for each one,
//! signers in ascending priority. A signer's `max_amount` caps what it will pay.
//!
//! ## Errors
//!
//! Payment failures surface as [`reqwest_middleware::Error::Middleware`] wrapping an
//! [`X402Error`](x402_types::client::X402Error) with a stable
//! [`code`](x402_types::client::X402Error::code). Transport errors pass through unchanged.

mod builder;
mod client;

pub use builder::*;
pub use client::*;
