//! The adaptor framework: one capability bundle per provider
//! family, registered by [`aiproxy_core::model::ChannelType`] at process
//! start. Most commercial providers are near-OpenAI in shape, so adaptors
//! compose by embedding [`openai::OpenAiAdaptor`] and overriding only the
//! parts that differ, the same embed-and-override idiom used elsewhere in
//! this workspace to let a decorator wrap an arbitrary inner service.

pub mod anthropic;
pub mod openai;
pub mod registry;
pub mod streaming;
pub mod think_splitter;
pub mod types;
mod writer;

pub use registry::AdaptorRegistry;
pub use writer::{ClientWriter, FirstByteGuard, RecordingWriter};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, RequestBuilder};

use aiproxy_core::model::{RequestMeta, Usage};
use aiproxy_core::ProxyError;

/// A provider-specific request/response translator.
///
/// Every method receives a `&RequestMeta` carrying the request id, tenant,
/// token, channel, and origin model, so adaptors can make transport
/// decisions (URL, headers) without any global state.
#[async_trait]
pub trait Adaptor: Send + Sync {
    /// Default upstream origin for this provider family.
    fn base_url(&self) -> &str;

    /// Absolute URL for this attempt. Mode-dependent: chat completions and
    /// embeddings typically hit different paths on the same origin.
    fn request_url(&self, meta: &RequestMeta) -> String;

    /// Installs credentials and provider-specific headers on the outbound
    /// request builder.
    fn setup_headers(&self, meta: &RequestMeta, builder: RequestBuilder) -> RequestBuilder;

    /// Rewrites the OpenAI-shaped inbound body into the provider's native
    /// schema, setting `actual_model` on the outgoing body. Returns the
    /// HTTP method and the serialized body.
    fn convert_request(
        &self,
        meta: &RequestMeta,
        inbound: &serde_json::Value,
    ) -> Result<(Method, Bytes), ProxyError>;

    /// Executes the converted request. HTTP by default; a provider that
    /// needs a different transport (e.g. a websocket for streaming TTS)
    /// overrides this instead of `convert_request`.
    async fn do_request(
        &self,
        meta: &RequestMeta,
        method: Method,
        body: Bytes,
        client: &reqwest::Client,
    ) -> Result<reqwest::Response, ProxyError> {
        let url = self.request_url(meta);
        let builder = client.request(method, url).body(body);
        let builder = self.setup_headers(meta, builder);
        builder.send().await.map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                // Transient transport failure, worth a retry on another channel.
                ProxyError::UpstreamRetryable(err.to_string())
            } else {
                // A request-building or decoding failure in the HTTP client
                // itself; retrying the same malformed request won't help.
                ProxyError::UpstreamFatal {
                    status: 502,
                    message: err.to_string(),
                }
            }
        })
    }

    /// Normalises the provider's response onto `writer`, streaming when
    /// applicable, and returns the usage accounting for billing.
    async fn do_response(
        &self,
        meta: &RequestMeta,
        writer: &mut dyn ClientWriter,
        response: reqwest::Response,
    ) -> Result<Usage, ProxyError>;

    /// Lists the models this channel serves, if the provider exposes a
    /// model-list endpoint.
    async fn model_list(&self, _meta_channel_id: i64) -> Result<Vec<String>, ProxyError> {
        Err(ProxyError::Internal("model_list not implemented".into()))
    }

    fn channel_name(&self) -> &'static str;

    /// Queries the channel's upstream balance, if the provider exposes one.
    /// Absence is a sentinel error the balance control loop treats as
    /// "silently skip", not a failure.
    async fn balance(&self, _channel_id: i64) -> Result<f64, ProxyError> {
        Err(ProxyError::Internal("balance not implemented".into()))
    }
}
