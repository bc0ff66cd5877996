//! Concrete [`ClientWrapper`](crate::concord::client_wrapper::ClientWrapper)
//! implementations.
//!
//! The engine only depends on the trait; anything speaking an
//! OpenAI-compatible `chat/completions` surface can be plugged in through
//! [`openai::OpenAiCompatClient`], and bespoke providers implement the trait
//! directly.

pub mod openai;
