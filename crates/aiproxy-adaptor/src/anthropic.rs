//! An Anthropic-style adaptor, built by composing [`OpenAiAdaptor`] and
//! overriding only the URL and headers, since most commercial providers
//! are near-OpenAI and differ only in request URL, headers, or model
//! list. This targets Anthropic-compatible gateways that accept the OpenAI
//! chat/completions wire format but require `x-api-key`/`anthropic-version`
//! headers instead of a bearer token.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, RequestBuilder};

use aiproxy_core::model::{RequestMeta, Usage};
use aiproxy_core::ProxyError;

use crate::openai::OpenAiAdaptor;
use crate::{Adaptor, ClientWriter};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdaptor {
    inner: OpenAiAdaptor,
}

impl AnthropicAdaptor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            inner: OpenAiAdaptor::new(base_url),
        }
    }
}

#[async_trait]
impl Adaptor for AnthropicAdaptor {
    fn base_url(&self) -> &str {
        self.inner.base_url()
    }

    fn request_url(&self, meta: &RequestMeta) -> String {
        self.inner.request_url(meta)
    }

    fn setup_headers(&self, meta: &RequestMeta, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("x-api-key", meta.kv.get("credential").cloned().unwrap_or_default())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn convert_request(
        &self,
        meta: &RequestMeta,
        inbound: &serde_json::Value,
    ) -> Result<(Method, Bytes), ProxyError> {
        self.inner.convert_request(meta, inbound)
    }

    async fn do_response(
        &self,
        meta: &RequestMeta,
        writer: &mut dyn ClientWriter,
        response: reqwest::Response,
    ) -> Result<Usage, ProxyError> {
        self.inner.do_response(meta, writer, response).await
    }

    fn channel_name(&self) -> &'static str {
        "anthropic"
    }

    async fn model_list(&self, _channel_id: i64) -> Result<Vec<String>, ProxyError> {
        Ok(vec![
            "claude-3-5-sonnet".to_string(),
            "claude-3-5-haiku".to_string(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_and_base_url_are_overridden() {
        let adaptor = AnthropicAdaptor::new("https://api.anthropic.com");
        assert_eq!(adaptor.channel_name(), "anthropic");
        assert_eq!(adaptor.base_url(), "https://api.anthropic.com");
    }
}
