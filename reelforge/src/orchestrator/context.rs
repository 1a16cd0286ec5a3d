//! Shared handles for the orchestrator, stage workers and stale monitor.

use std::sync::Arc;

use super::PauseControl;
use crate::accounts::AccountPool;
use crate::config::OrchestratorConfig;
use crate::provider::ProviderRegistry;
use crate::queue::TaskQueueSet;
use crate::store::JobStore;

pub struct OrchestratorContext {
    pub config: OrchestratorConfig,
    pub store: Arc<dyn JobStore>,
    pub accounts: AccountPool,
    pub providers: ProviderRegistry,
    pub queues: Arc<TaskQueueSet>,
    pub control: PauseControl,
}

impl OrchestratorContext {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
        providers: ProviderRegistry,
    ) -> Self {
        let accounts = AccountPool::new(store.clone(), config.account_lease_ttl_chrono());
        let queues = Arc::new(TaskQueueSet::new(
            config.queue_capacity,
            config.enqueue_timeout,
        ));
        Self {
            config,
            store,
            accounts,
            providers,
            queues,
            control: PauseControl::new(),
        }
    }
}
