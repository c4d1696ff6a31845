//! Static adaptor registration by [`ChannelType`]: registration happens once
//! at process start, not per request.

use std::collections::HashMap;
use std::sync::Arc;

use aiproxy_core::model::ChannelType;

use crate::anthropic::AnthropicAdaptor;
use crate::openai::OpenAiAdaptor;
use crate::Adaptor;

/// Maps a [`ChannelType`] to the adaptor that serves it, constructed once
/// at process start and shared read-only thereafter.
pub struct AdaptorRegistry {
    adaptors: HashMap<ChannelType, Arc<dyn Adaptor>>,
}

impl AdaptorRegistry {
    /// Builds the registry with the two reference adaptors this crate
    /// ships. Embedders extending the proxy with more provider families
    /// add entries the same way before the registry is handed to the
    /// relay controller.
    pub fn with_defaults() -> Self {
        let mut adaptors: HashMap<ChannelType, Arc<dyn Adaptor>> = HashMap::new();
        adaptors.insert(
            ChannelType::OPENAI,
            Arc::new(OpenAiAdaptor::new("https://api.openai.com")),
        );
        adaptors.insert(
            ChannelType::ANTHROPIC,
            Arc::new(AnthropicAdaptor::new("https://api.anthropic.com")),
        );
        Self { adaptors }
    }

    pub fn register(&mut self, channel_type: ChannelType, adaptor: Arc<dyn Adaptor>) {
        self.adaptors.insert(channel_type, adaptor);
    }

    pub fn get(&self, channel_type: ChannelType) -> Option<Arc<dyn Adaptor>> {
        self.adaptors.get(&channel_type).cloned()
    }
}

impl Default for AdaptorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ships_openai_and_anthropic_by_default() {
        let registry = AdaptorRegistry::with_defaults();
        assert!(registry.get(ChannelType::OPENAI).is_some());
        assert!(registry.get(ChannelType::ANTHROPIC).is_some());
        assert!(registry.get(ChannelType(999)).is_none());
    }
}
