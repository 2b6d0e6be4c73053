//! lm-shim: LM Studio compatible front for an OpenAI-compatible model router.
//!
//! Accepts chat-completion and model-listing requests in the shape local
//! inference clients expect, re-issues them against a backend router and
//! relays the answers back, including token-streamed responses.

pub mod backend;
pub mod config;
pub mod error;
pub mod server;
pub mod translate;
