//! A small event system so embedders can observe proxy internals without
//! coupling to `tracing`, in the same `ResilienceEvent`/`EventListener` shape
//! used elsewhere in this workspace.

use std::fmt;
use std::sync::Arc;

/// A domain event fired by one of the relay pipeline stages.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    ChannelBanned {
        channel_id: i64,
        model: String,
        error_rate: f64,
    },
    ChannelRecovered {
        channel_id: i64,
        model: String,
    },
    RetryAttempt {
        request_id: String,
        channel_id: i64,
        attempt: u32,
    },
    RetryExhausted {
        request_id: String,
        attempts: u32,
    },
    RequestCommitted {
        request_id: String,
        channel_id: i64,
        amount: f64,
    },
    ConsumeFailed {
        request_id: String,
        reason: String,
    },
    ChannelBalanceLow {
        channel_id: i64,
        balance: f64,
        threshold: f64,
    },
    RateLimited {
        tenant_id: i64,
        model: String,
    },
}

impl fmt::Display for ProxyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyEvent::ChannelBanned {
                channel_id,
                model,
                error_rate,
            } => write!(
                f,
                "channel {channel_id} banned for model {model} (error rate {error_rate:.2})"
            ),
            ProxyEvent::ChannelRecovered { channel_id, model } => {
                write!(f, "channel {channel_id} recovered for model {model}")
            }
            ProxyEvent::RetryAttempt {
                request_id,
                channel_id,
                attempt,
            } => write!(
                f,
                "request {request_id} attempt {attempt} on channel {channel_id}"
            ),
            ProxyEvent::RetryExhausted {
                request_id,
                attempts,
            } => write!(f, "request {request_id} exhausted retries after {attempts}"),
            ProxyEvent::RequestCommitted {
                request_id,
                channel_id,
                amount,
            } => write!(
                f,
                "request {request_id} committed on channel {channel_id}, amount {amount}"
            ),
            ProxyEvent::ConsumeFailed { request_id, reason } => {
                write!(f, "consume failed for {request_id}: {reason}")
            }
            ProxyEvent::ChannelBalanceLow {
                channel_id,
                balance,
                threshold,
            } => write!(
                f,
                "channel {channel_id} balance {balance} below threshold {threshold}"
            ),
            ProxyEvent::RateLimited { tenant_id, model } => {
                write!(f, "tenant {tenant_id} rate limited on model {model}")
            }
        }
    }
}

/// Receives [`ProxyEvent`]s emitted by the pipeline.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ProxyEvent);
}

/// A function-based listener, for quick wiring in tests and small binaries.
impl<F> EventListener for F
where
    F: Fn(&ProxyEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProxyEvent) {
        self(event)
    }
}

/// A collection of listeners, fanned out to on every emit. A panicking
/// listener is caught and logged (when the `tracing` feature is enabled)
/// rather than taking down the emitting task.
#[derive(Clone, Default)]
pub struct EventListeners {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<L: EventListener + 'static>(&mut self, listener: L) {
        self.listeners.push(Arc::new(listener));
    }

    pub fn emit(&self, event: &ProxyEvent) {
        for listener in &self.listeners {
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener.on_event(event)));
            if result.is_err() {
                #[cfg(feature = "tracing")]
                tracing::warn!(%event, "event listener panicked");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListeners")
            .field("count", &self.listeners.len())
            .finish()
    }
}
