//! Entities from the data model (tenants, tokens, channels, usage, billing).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A billable customer. Called "Group" in some upstream providers' APIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    /// Model-set tags this tenant's tokens may draw from.
    pub model_tags: Vec<String>,
    pub balance: f64,
}

impl Tenant {
    pub fn has_balance(&self) -> bool {
        self.balance > 0.0
    }
}

/// API credential issued to a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub name: String,
    pub tenant_id: i64,
    pub enabled: bool,
    /// Empty means "all models the tenant can see".
    pub allowed_models: Vec<String>,
    pub rpm_quota: Option<u32>,
    pub tpm_quota: Option<u32>,
    /// Requests-per-day quota; `None` means unlimited.
    pub rpd_quota: Option<u32>,
}

impl Token {
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }
}

/// Stable integer tag identifying a provider family (OpenAI, Anthropic, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelType(pub u32);

impl ChannelType {
    pub const OPENAI: ChannelType = ChannelType(1);
    pub const ANTHROPIC: ChannelType = ChannelType(2);
}

/// One configured upstream provider endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub channel_type: ChannelType,
    pub name: String,
    pub base_url: Option<String>,
    pub credential: String,
    pub weight: u32,
    pub priority: i32,
    pub enabled: bool,
    pub auto_balance_check: bool,
    pub balance_threshold: f64,
    pub balance: f64,
    pub model_tag: String,
    /// Logical model -> provider-specific model name overrides.
    pub model_mapping: HashMap<String, String>,
}

impl Channel {
    /// Resolves the provider-specific ("actual") model name for a logical
    /// ("origin") model, falling back to the origin name unchanged.
    pub fn actual_model<'a>(&'a self, origin_model: &'a str) -> &'a str {
        self.model_mapping
            .get(origin_model)
            .map(String::as_str)
            .unwrap_or(origin_model)
    }
}

/// What kind of operation a logical model performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMode {
    Chat,
    Completion,
    Embedding,
    ImageGeneration,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Moderation,
    Rerank,
    ParsePdf,
}

impl ModelMode {
    /// The inbound path this mode is served under.
    pub fn endpoint_path(self) -> &'static str {
        match self {
            ModelMode::Chat => "/v1/chat/completions",
            ModelMode::Completion => "/v1/completions",
            ModelMode::Embedding => "/v1/embeddings",
            ModelMode::ImageGeneration => "/v1/images/generations",
            ModelMode::AudioSpeech => "/v1/audio/speech",
            ModelMode::AudioTranscription => "/v1/audio/transcription",
            ModelMode::AudioTranslation => "/v1/audio/translation",
            ModelMode::Moderation => "/v1/moderations",
            ModelMode::Rerank => "/v1/rerank",
            ModelMode::ParsePdf => "/v1/parse-pdf",
        }
    }
}

/// Per-PriceUnit-token prices for a logical model. Conventionally
/// `PriceUnit` is 1_000_000 so prices can be expressed as micro-dollars per
/// token, but the value is configurable per model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrices {
    pub input_price: f64,
    pub output_price: f64,
    pub cached_price: Option<f64>,
    pub cache_creation_price: Option<f64>,
    pub image_price: Option<f64>,
    pub price_unit: f64,
}

impl Default for ModelPrices {
    fn default() -> Self {
        Self {
            input_price: 0.0,
            output_price: 0.0,
            cached_price: None,
            cache_creation_price: None,
            image_price: None,
            price_unit: 1_000_000.0,
        }
    }
}

/// A logical (client-facing) model definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub mode: ModelMode,
    pub owner: String,
    pub prices: ModelPrices,
    pub rpm_cap: Option<u32>,
    pub tpm_cap: Option<u32>,
}

/// Per-request control block threaded through the relay pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMeta {
    pub request_id: String,
    pub request_time: chrono::DateTime<chrono::Utc>,
    pub tenant_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub channel_id: i64,
    pub origin_model: String,
    pub actual_model: String,
    pub mode: ModelMode,
    pub endpoint: String,
    pub input_tokens: u32,
    pub client_ip: String,
    pub pinned_channel: Option<i64>,
    #[serde(default)]
    pub attempted_channels: Vec<i64>,
    #[serde(default)]
    pub kv: HashMap<String, String>,
}

impl RequestMeta {
    pub fn new(
        request_id: impl Into<String>,
        tenant_id: i64,
        token: &Token,
        origin_model: impl Into<String>,
        mode: ModelMode,
        client_ip: impl Into<String>,
    ) -> Self {
        let origin_model = origin_model.into();
        Self {
            request_id: request_id.into(),
            request_time: chrono::Utc::now(),
            tenant_id,
            token_id: token.id,
            token_name: token.name.clone(),
            channel_id: 0,
            actual_model: origin_model.clone(),
            origin_model,
            mode,
            endpoint: mode.endpoint_path().to_string(),
            input_tokens: 0,
            client_ip: client_ip.into(),
            pinned_channel: None,
            attempted_channels: Vec::new(),
            kv: HashMap::new(),
        }
    }

    pub fn mark_attempted(&mut self, channel_id: i64) {
        self.attempted_channels.push(channel_id);
    }

    pub fn has_attempted(&self, channel_id: i64) -> bool {
        self.attempted_channels.contains(&channel_id)
    }
}

/// Normalised token accounting for a single response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cached_tokens: u32,
    pub cache_creation_tokens: u32,
}

impl Usage {
    /// True when every field is zero, i.e. the upstream never reported
    /// usage and nothing has been synthesised yet.
    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }

    /// Fixes up `total_tokens` and `completion_tokens` when the upstream
    /// supplied only one of the two.
    pub fn reconcile(mut self, meta_input_tokens: u32) -> Self {
        if self.total_tokens > 0 && self.prompt_tokens == 0 && self.completion_tokens == 0 {
            self.prompt_tokens = meta_input_tokens;
            self.completion_tokens = self.total_tokens.saturating_sub(self.prompt_tokens);
        }
        if self.total_tokens == 0 {
            self.total_tokens = self.prompt_tokens + self.completion_tokens;
        }
        self
    }
}

/// One recorded upstream failure, used by the monitor's sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorSample {
    pub channel_id: i64,
    pub timestamp_ms: i64,
    pub http_bucket: u16,
}

/// A billing row, written by the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeRecord {
    pub request_id: String,
    pub tenant_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub model: String,
    pub usage: Usage,
    pub amount: f64,
    pub ip: String,
    pub retry_times: u32,
    pub downstream_ok: bool,
    pub debit_error: Option<String>,
}

/// An IP address banned until `expires_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpBlockEntry {
    pub expires_at_ms: i64,
}
