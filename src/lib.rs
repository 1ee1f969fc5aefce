//! # llm-gateway
//!
//! A multi-tenant API gateway fronting several third-party LLM backends
//! (CodeWhisperer-hosted Claude, Gemini via Antigravity and Vertex, Anthropic
//! direct, Bedrock, Warp, Orchids, and Vertex-Claude). Exposes a Claude-style
//! `/v1/messages` surface and an OpenAI-style `/v1/chat/completions` surface,
//! authenticates clients with opaque API keys, and routes each request to a
//! healthy upstream credential drawn from provider-scoped pools.
//!
//! ## Modules
//! - `store`: persistent KV/row storage (C1)
//! - `credentials`: per-provider credential pools (C2)
//! - `token`: token lifecycle / refresh (C3)
//! - `health`: health scores, token buckets, quota freshness (C4)
//! - `selection`: credential selection strategies (C5)
//! - `providers`: upstream request shaping (C6)
//! - `stream`: upstream stream translation (C7)
//! - `retry`: retry policy and context compression (C8)
//! - `api`: inbound HTTP gateway server (C9)
//! - `balancer`: consistent-hash fronting load balancer (C10)
//! - `config` / `settings`: runtime configuration (C11)
//! - `background`: sweeper loops (C12)

pub mod api;
pub mod background;
pub mod balancer;
pub mod config;
pub mod credentials;
pub mod error;
pub mod health;
pub mod providers;
pub mod retry;
pub mod selection;
pub mod settings;
pub mod store;
pub mod stream;
pub mod token;

pub use config::Config;
pub use error::{ErrorKind, GatewayError};
