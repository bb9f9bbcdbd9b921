//! ERSIM model access
//!
//! - [`ChatModel`]: one outbound chat-completion call returning the raw body
//! - [`OpenAiClient`]: HTTP implementation for OpenAI-compatible endpoints
//! - [`envelope`]: two-stage unwrapping of the response envelope
//!
//! With the `mock` feature, `MockChatModel` is generated for downstream tests.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod client;
pub mod envelope;
pub mod error;
pub mod openai;

pub use client::{ChatModel, CompletionRequest};
pub use envelope::{message_content, unwrap};
pub use error::{excerpt, EnvelopeError, LlmError};
pub use openai::OpenAiClient;

#[cfg(feature = "mock")]
pub use client::MockChatModel;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
