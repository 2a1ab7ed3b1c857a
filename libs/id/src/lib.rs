//! # vmfleet-id
//!
//! Typed identifiers for the vmfleet orchestrator.
//!
//! ## ID Format
//!
//! Every ID uses a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `task_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `ntf_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! Task ids are handed to API callers as opaque tokens. The ULID portion
//! carries 80 bits of randomness, so ids cannot be guessed from one another,
//! and sorts by creation time, which the task registry uses for eviction order.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

#[doc(hidden)]
pub use serde as __serde;
