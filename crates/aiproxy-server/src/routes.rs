//! HTTP surface: ten OpenAI-compatible relay endpoints sharing one
//! pipeline, plus the ambient health/metrics/models surface. Every relay
//! endpoint does the same thing — parse the body, resolve the model, admit
//! under rate limits, hand off to the relay controller, stream the result
//! back — so they're thin wrappers around [`relay_request`], named
//! per-route rather than collapsed into one generic dispatcher.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Extension, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use aiproxy_adaptor::streaming::{ApproxTokenizer, Tokenizer};
use aiproxy_adaptor::ClientWriter;
use aiproxy_consumer::{BillingJob, Consumer};
use aiproxy_core::model::{ModelMode, ModelPrices, RequestMeta, Usage};
use aiproxy_core::ProxyError;
use aiproxy_ratelimiter::{RateKey, RateLimiter};
use aiproxy_relay::RelayOutcome;

use crate::errors::error_response;
use crate::middleware::{edge_middleware, AuthContext};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let relay_routes = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/images/generations", post(image_generations))
        .route("/v1/audio/speech", post(audio_speech))
        .route("/v1/audio/transcription", post(audio_transcription))
        .route("/v1/audio/translation", post(audio_translation))
        .route("/v1/moderations", post(moderations))
        .route("/v1/rerank", post(rerank))
        .route("/v1/parse-pdf", post(parse_pdf))
        .route("/v1/models", get(list_models))
        .layer(axum::middleware::from_fn_with_state(state.clone(), edge_middleware));

    Router::new()
        .merge(relay_routes)
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics_snapshot))
        .with_state(state)
}

macro_rules! relay_handler {
    ($name:ident, $mode:expr) => {
        async fn $name(
            state: State<AppState>,
            auth: Extension<AuthContext>,
            headers: HeaderMap,
            body: Bytes,
        ) -> Response {
            relay_request($mode, state, auth, headers, body).await
        }
    };
}

relay_handler!(chat_completions, ModelMode::Chat);
relay_handler!(completions, ModelMode::Completion);
relay_handler!(embeddings, ModelMode::Embedding);
relay_handler!(image_generations, ModelMode::ImageGeneration);
relay_handler!(audio_speech, ModelMode::AudioSpeech);
relay_handler!(audio_transcription, ModelMode::AudioTranscription);
relay_handler!(audio_translation, ModelMode::AudioTranslation);
relay_handler!(moderations, ModelMode::Moderation);
relay_handler!(rerank, ModelMode::Rerank);
relay_handler!(parse_pdf, ModelMode::ParsePdf);

struct ChannelWriter {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ClientWriter for ChannelWriter {
    fn write(&mut self, chunk: Bytes) -> Result<(), ProxyError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx.send(chunk).map_err(|_| ProxyError::ClientCancelled)
    }
}

struct RateLimitHeaders {
    limit_requests: u32,
    remaining_requests: u32,
    reset_requests: u64,
    limit_tokens: u32,
    remaining_tokens: u32,
}

impl RateLimitHeaders {
    fn apply(&self, headers: &mut HeaderMap) {
        let entries: [(&'static str, String); 5] = [
            ("x-ratelimit-limit-requests", self.limit_requests.to_string()),
            ("x-ratelimit-remaining-requests", self.remaining_requests.to_string()),
            ("x-ratelimit-reset-requests", self.reset_requests.to_string()),
            ("x-ratelimit-limit-tokens", self.limit_tokens.to_string()),
            ("x-ratelimit-remaining-tokens", self.remaining_tokens.to_string()),
        ];
        for (name, value) in entries {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }
    }
}

/// Pulls the text an upstream would actually be billed for out of an
/// inbound request body, so `meta.input_tokens` can be estimated before
/// the relay ever dispatches. Chat-style bodies carry a `messages` array
/// of `{role, content}`; everything else (embeddings, audio, rerank) falls
/// back to a flat `input`/`prompt` string.
fn prompt_text(inbound: &serde_json::Value) -> String {
    if let Some(messages) = inbound.get("messages").and_then(serde_json::Value::as_array) {
        return messages
            .iter()
            .filter_map(|m| m.get("content").and_then(serde_json::Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
    }
    if let Some(input) = inbound.get("input").and_then(serde_json::Value::as_str) {
        return input.to_string();
    }
    if let Some(prompt) = inbound.get("prompt").and_then(serde_json::Value::as_str) {
        return prompt.to_string();
    }
    String::new()
}

/// The shared pipeline every relay endpoint runs: resolve the model,
/// admit under RPM/TPM, dispatch through the relay controller, and stream
/// the outcome back to the client while billing happens off to the side.
async fn relay_request(
    mode: ModelMode,
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let inbound: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            return error_response(&ProxyError::MalformedResponse(
                "request body is not valid JSON".into(),
            ))
        }
    };

    let origin_model = match inbound.get("model").and_then(serde_json::Value::as_str) {
        Some(model) => model.to_string(),
        None => {
            return error_response(&ProxyError::ModelNotAllowed(
                "request is missing a model field".into(),
            ))
        }
    };

    if !auth.token.allows_model(&origin_model) {
        return error_response(&ProxyError::ModelNotAllowed(origin_model));
    }

    let model_config = match state.store.model_config(&origin_model).await {
        Ok(Some(cfg)) => cfg,
        Ok(None) => return error_response(&ProxyError::NoChannel(origin_model)),
        Err(err) => return error_response(&err),
    };

    let rate_key = RateKey::new(auth.tenant.id.to_string(), origin_model.clone());
    let rpm_limit = auth.token.rpm_quota.unwrap_or(state.config.rpm_default);
    let tpm_limit = auth.token.tpm_quota.unwrap_or(state.config.tpm_default);

    let admit = state
        .rate_limiter
        .push_request_if_under_limit(&rate_key, rpm_limit)
        .await;
    let tpm_over = state.rate_limiter.tpm_exceeded(&rate_key, tpm_limit).await;
    let rate_headers = RateLimitHeaders {
        limit_requests: admit.limit,
        remaining_requests: admit.remaining,
        reset_requests: admit.reset_after.as_secs(),
        limit_tokens: tpm_limit,
        remaining_tokens: tpm_limit.saturating_sub(state.rate_limiter.current_tpm(&rate_key)),
    };

    if !admit.admitted || tpm_over {
        let mut response = error_response(&ProxyError::RateLimit {
            retry_after: admit.reset_after,
        });
        rate_headers.apply(response.headers_mut());
        return response;
    }

    let channels = match state.store.channels_for_model(&origin_model).await {
        Ok(channels) if !channels.is_empty() => channels,
        Ok(_) => return error_response(&ProxyError::NoChannel(origin_model)),
        Err(err) => return error_response(&err),
    };

    let pinned_channel = headers
        .get("aiproxy-channel")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());

    let mut meta = RequestMeta::new(
        Uuid::new_v4().to_string(),
        auth.tenant.id,
        &auth.token,
        origin_model.clone(),
        mode,
        auth.client_ip.clone(),
    );
    meta.pinned_channel = pinned_channel;
    meta.input_tokens = ApproxTokenizer.count_tokens(&origin_model, &prompt_text(&inbound));

    let is_stream = inbound
        .get("stream")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    let content_type = if is_stream { "text/event-stream" } else { "application/json" };

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let relay = Arc::clone(&state.relay);
    let monitor = Arc::clone(&state.monitor);
    let tenant = auth.tenant.clone();
    let prices = model_config.prices;

    let relay_task = tokio::spawn(async move {
        let mut writer = ChannelWriter { tx };
        let result = relay
            .relay(
                &mut meta,
                &tenant,
                &model_config,
                &channels,
                monitor.as_ref(),
                &inbound,
                &mut writer,
            )
            .await;
        (meta, result)
    });

    match rx.recv().await {
        Some(first_chunk) => {
            let tail = UnboundedReceiverStream::new(rx).map(Ok::<_, std::io::Error>);
            let stream = futures::stream::once(async move { Ok::<_, std::io::Error>(first_chunk) }).chain(tail);
            let body = Body::from_stream(stream);

            let consumer = Arc::clone(&state.consumer);
            let rate_limiter = Arc::clone(&state.rate_limiter);
            let billing_key = rate_key.clone();
            let billing_enabled = state.config.billing_enabled;
            tokio::spawn(async move {
                if let Ok((meta, result)) = relay_task.await {
                    finalize_billing(meta, result, prices, billing_enabled, consumer, rate_limiter, billing_key).await;
                }
            });

            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .body(body)
                .expect("a streaming response body never fails to build");
            rate_headers.apply(response.headers_mut());
            response
        }
        None => {
            let consumer = Arc::clone(&state.consumer);
            let rate_limiter = Arc::clone(&state.rate_limiter);
            let billing_enabled = state.config.billing_enabled;
            let mut response = match relay_task.await {
                Ok((meta, result)) => {
                    let response = match &result {
                        Ok(_outcome) => (StatusCode::OK, Json(serde_json::json!({}))).into_response(),
                        Err(err) => error_response(err),
                    };
                    finalize_billing(meta, result, prices, billing_enabled, consumer, rate_limiter, rate_key.clone())
                        .await;
                    response
                }
                Err(_join_err) => error_response(&ProxyError::Internal("relay task panicked".into())),
            };
            rate_headers.apply(response.headers_mut());
            response
        }
    }
}

/// Submits exactly one [`BillingJob`] per accepted request, win or lose —
/// a successful relay bills its real usage, a finally-failed one still
/// produces an audit row with zero usage and `downstream_ok: false`, the
/// same way `Consumer::process_job` keeps writing a `ConsumeRecord` when
/// the debit itself errors. When billing is disabled the job still goes
/// through so the audit trail stays complete, just at zero price.
async fn finalize_billing(
    meta: RequestMeta,
    result: Result<RelayOutcome, ProxyError>,
    prices: ModelPrices,
    billing_enabled: bool,
    consumer: Arc<Consumer>,
    rate_limiter: Arc<RateLimiter>,
    rate_key: RateKey,
) {
    let prices = if billing_enabled { prices } else { ModelPrices::default() };

    let (channel_id, usage, retries, downstream_ok) = match result {
        Ok(outcome) => {
            let usage = outcome.usage.reconcile(meta.input_tokens);
            rate_limiter.observe_tokens(&rate_key, usage.total_tokens).await;
            (outcome.channel_id, usage, outcome.retries, true)
        }
        Err(_err) => (meta.channel_id, Usage::default(), meta.attempted_channels.len() as u32, false),
    };

    let job = BillingJob {
        request_id: meta.request_id,
        tenant_id: meta.tenant_id,
        token_id: meta.token_id,
        token_name: meta.token_name,
        channel_id,
        model: meta.origin_model,
        usage,
        prices,
        ip: meta.client_ip,
        retry_times: retries,
        downstream_ok,
    };
    let _ = consumer.submit(job).await;
}

async fn list_models(State(state): State<AppState>) -> Response {
    match state.store.all_models().await {
        Ok(models) => Json(serde_json::json!({
            "object": "list",
            "data": models.into_iter().map(|m| serde_json::json!({
                "id": m.name,
                "object": "model",
                "owned_by": m.owner,
            })).collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn health_live() -> Response {
    Json(serde_json::json!({ "status": "alive" })).into_response()
}

async fn health_ready(State(state): State<AppState>) -> Response {
    match state.store.all_channels().await {
        Ok(channels) if channels.iter().any(|c| c.enabled) => {
            Json(serde_json::json!({ "status": "ready" })).into_response()
        }
        Ok(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "no enabled channels" })),
        )
            .into_response(),
        Err(_err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "store unreachable" })),
        )
            .into_response(),
    }
}

async fn metrics_snapshot(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "billing_enabled": state.config.billing_enabled,
        "redis_enabled": state.config.redis_enabled,
        "max_retries": state.config.max_retries,
        "consumer_workers": state.config.consumer_workers,
        "balance_loop_concurrency": state.config.balance_loop_concurrency,
    }))
    .into_response()
}
