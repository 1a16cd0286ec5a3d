//! Providers keyed by platform name.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::VideoProvider;
use crate::{Error, Result};

#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn VideoProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under its platform id, replacing any previous one.
    pub fn register(&self, provider: Arc<dyn VideoProvider>) {
        let platform = provider.platform_id().to_string();
        info!(platform = %platform, "Registered video provider");
        self.providers.write().insert(platform, provider);
    }

    pub fn with(self, provider: Arc<dyn VideoProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, platform: &str) -> Result<Arc<dyn VideoProvider>> {
        self.providers
            .read()
            .get(platform)
            .cloned()
            .ok_or_else(|| Error::not_found("Provider", platform))
    }

    pub fn platforms(&self) -> Vec<String> {
        let mut platforms: Vec<String> = self.providers.read().keys().cloned().collect();
        platforms.sort();
        platforms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Account;
    use crate::provider::{
        CreditsInfo, GenerationRequest, GenerationTicket, PollStatus, ProviderError,
    };
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl VideoProvider for Named {
        fn platform_id(&self) -> &str {
            self.0
        }

        async fn login(&self, _account: &Account) -> std::result::Result<(), ProviderError> {
            Ok(())
        }

        async fn generate_video(
            &self,
            _account: &Account,
            _request: &GenerationRequest,
        ) -> std::result::Result<GenerationTicket, ProviderError> {
            Ok(GenerationTicket {
                task_id: format!("{}-task", self.0),
            })
        }

        async fn poll_status(
            &self,
            _account: &Account,
            _task_id: &str,
        ) -> std::result::Result<PollStatus, ProviderError> {
            Ok(PollStatus::NotReady { progress_pct: None })
        }

        async fn get_credits(
            &self,
            _account: &Account,
        ) -> std::result::Result<CreditsInfo, ProviderError> {
            Err(ProviderError::permanent("unsupported"))
        }
    }

    #[test]
    fn test_lookup_by_platform() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(Named("sora")))
            .with(Arc::new(Named("runway")));

        assert_eq!(registry.get("sora").unwrap().platform_id(), "sora");
        assert_eq!(registry.platforms(), vec!["runway", "sora"]);
        assert!(registry.get("pika").err().unwrap().is_not_found());
    }
}
