#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for the x402 payment protocol.
//!
//! This crate provides the foundational types used by both faces of an
//! HTTP 402 Payment Required flow: the paying client and the payment-gated server.
//! It is blockchain-agnostic. Chain-specific signing lives behind the
//! [`client::Signer`] contract, and on-chain execution is the facilitator's job.
//!
//! # Overview
//!
//! When a client requests a paid resource, the server responds with `402` and a list of
//! [`proto::PaymentRequirements`]. The client picks one it can pay (see [`client::select`]),
//! signs a [`proto::PaymentPayload`], and retries with an `X-PAYMENT` header.
//! The server asks a facilitator to verify and then settle the payment, and returns
//! the [`proto::SettleResponse`] in the `X-PAYMENT-RESPONSE` header.
//!
//! # Modules
//!
//! - [`client`] - Signer contract, token configuration and the payment selector
//! - [`config`] - Facilitator and retry configuration, environment variable resolution
//! - [`facilitator`] - Core trait for payment verification and settlement, and its error taxonomy
//! - [`proto`] - Wire format types and the base64/JSON header codec
//! - [`util`] - Base64 helper, call context (deadline and cancellation), retry engine
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables tracing instrumentation for debugging and monitoring

pub mod client;
pub mod config;
pub mod facilitator;
pub mod proto;
pub mod util;
