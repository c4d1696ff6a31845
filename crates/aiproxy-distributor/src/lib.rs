//! Logical-model-to-channel dispatch.
//!
//! Given a tenant and an origin model, resolves the eligible channel set,
//! excludes channels the monitor has banned for that model, and picks one
//! by weighted random sampling biased by priority tier — higher-priority
//! channels are drawn from exhaustively before the distributor falls back
//! to a lower tier.

use std::collections::HashSet;

use aiproxy_core::model::{Channel, ModelConfig, Tenant};
use aiproxy_core::ProxyError;
use aiproxy_monitor::Monitor;

/// The outcome of a successful dispatch: the chosen channel and its
/// provider-specific model name for this request.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub channel: Channel,
    pub actual_model: String,
}

pub struct Distributor<'a> {
    monitor: &'a Monitor,
}

impl<'a> Distributor<'a> {
    pub fn new(monitor: &'a Monitor) -> Self {
        Self { monitor }
    }

    /// Resolves `origin_model` against the tenant's visible model set,
    /// then dispatches to one of the channels serving it. A channel is only
    /// eligible when the tenant has no model-tag restriction or when one of
    /// its tags matches the channel's `model_tag`; a tenant scoped to
    /// `["enterprise"]` can never land on a `"default"`-tagged channel.
    ///
    /// `already_tried` excludes channels the relay controller has already
    /// attempted in this request, so the same channel is never picked
    /// twice within one request.
    pub fn dispatch(
        &self,
        tenant: &Tenant,
        _model: &ModelConfig,
        channels: &[Channel],
        origin_model: &str,
        already_tried: &HashSet<i64>,
        pinned_channel: Option<i64>,
    ) -> Result<Dispatch, ProxyError> {
        let tag_ok = |channel: &Channel| {
            tenant.model_tags.is_empty() || tenant.model_tags.iter().any(|t| t == &channel.model_tag)
        };

        if let Some(pinned) = pinned_channel {
            let channel = channels
                .iter()
                .find(|c| c.id == pinned && c.enabled && tag_ok(c))
                .ok_or_else(|| ProxyError::NoChannel(origin_model.to_string()))?;
            if already_tried.contains(&channel.id) {
                return Err(ProxyError::NoChannel(origin_model.to_string()));
            }
            return Ok(Dispatch {
                actual_model: channel.actual_model(origin_model).to_string(),
                channel: channel.clone(),
            });
        }

        let eligible: Vec<&Channel> = channels
            .iter()
            .filter(|c| c.enabled)
            .filter(|c| !already_tried.contains(&c.id))
            .filter(|c| !self.monitor.is_banned(c.id, origin_model))
            .filter(|c| tag_ok(c))
            .collect();

        if eligible.is_empty() {
            return Err(ProxyError::NoChannel(origin_model.to_string()));
        }

        let channel = pick_weighted_by_priority(&eligible);
        Ok(Dispatch {
            actual_model: channel.actual_model(origin_model).to_string(),
            channel: channel.clone(),
        })
    }
}

/// Groups channels by priority (descending) and draws a weighted pick from
/// the highest non-empty tier, falling back to lower tiers only if the
/// top tier is exhausted — "higher-priority tier is selected
/// exhaustively before falling back to lower". Ties within a tier are
/// broken deterministically by lowest id when every candidate has zero
/// weight, matching the test-determinism requirement.
fn pick_weighted_by_priority<'c>(channels: &[&'c Channel]) -> &'c Channel {
    let mut by_priority = channels.to_vec();
    by_priority.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    let top_priority = by_priority[0].priority;
    let tier: Vec<&Channel> = by_priority
        .iter()
        .copied()
        .take_while(|c| c.priority == top_priority)
        .collect();

    weighted_pick(&tier)
}

fn weighted_pick<'c>(tier: &[&'c Channel]) -> &'c Channel {
    let total_weight: u64 = tier.iter().map(|c| c.weight as u64).sum();
    if total_weight == 0 {
        return tier.iter().min_by_key(|c| c.id).copied().unwrap();
    }
    let mut pick = rand::random::<u64>() % total_weight;
    for channel in tier {
        if (channel.weight as u64) > pick {
            return channel;
        }
        pick -= channel.weight as u64;
    }
    tier.iter().min_by_key(|c| c.id).copied().unwrap()
}
