//! HTTP server exposing the LM Studio compatible API.
//!
//! - [`openai_api`]: router, shared state and route handlers
//! - [`streaming`]: SSE relay for token-by-token responses

pub mod openai_api;
pub mod streaming;
