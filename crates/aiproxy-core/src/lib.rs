//! Shared domain types for aiproxy: the multi-tenant LLM reverse proxy.
//!
//! This crate has no opinion about transport, storage, or provider wire
//! formats. It defines the entities every other `aiproxy-*` crate shares
//! (tenants, tokens, channels, model configs, request metadata, usage), the
//! proxy-wide error taxonomy, and a small event system used for
//! observability without hard-coupling to `tracing`.

pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod store;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use events::{EventListener, EventListeners, ProxyEvent};
pub use model::{
    Channel, ChannelType, ConsumeRecord, IpBlockEntry, ModelConfig, ModelMode, RequestMeta,
    Tenant, Token, Usage,
};
pub use store::{SharedCache, TenantStore};
