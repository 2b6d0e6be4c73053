//! Protocol translation between the caller-facing API and the backend router.
//!
//! - [`request`]: incoming chat requests, validation, outgoing payloads
//! - [`response`]: buffered chat responses
//! - [`catalog`]: model listing

pub mod catalog;
pub mod request;
pub mod response;

/// Placeholder `created` timestamp for objects the backend did not date.
pub const PLACEHOLDER_CREATED: i64 = 0;
