//! Utility types and functions for x402.
//!
//! - [`b64`] - Base64 encoding/decoding utilities
//! - [`context`] - Deadline and cancellation carried through facilitator calls
//! - [`retry`] - Exponential backoff with jitter, parameterized by a retry predicate

pub mod b64;
pub mod context;
pub mod retry;

pub use b64::*;
pub use context::*;
pub use retry::*;
