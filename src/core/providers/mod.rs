//! Concrete vendor backends implementing [`crate::core::provider::Provider`].
//!
//! One backend per wire format, not per vendor brand name: most hosted chat-completion
//! APIs speak the same OpenAI-compatible JSON shape, so [`openai_compatible`] covers
//! OpenAI itself plus any self-hosted or third-party endpoint exposing the same
//! `/v1/chat/completions` contract. [`http_pool`] is the shared pooled client every
//! backend in this module is built on.

pub mod http_pool;
pub mod openai_compatible;
