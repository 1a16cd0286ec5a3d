//! Shared fixtures: a scripted provider and an orchestrator harness.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

use reelforge::config::{ConcurrencyConfig, OrchestratorConfig};
use reelforge::domain::{
    Account, AccountId, AspectRatio, Job, JobId, JobSpec, JobStatus, NewAccount, NewJob,
};
use reelforge::orchestrator::{Orchestrator, OrchestratorContext};
use reelforge::provider::{
    CreditsInfo, DownloadedArtifact, GenerationRequest, GenerationTicket, PollStatus,
    ProviderError, ProviderRegistry, VideoProvider,
};
use reelforge::store::{JobStore, MemoryJobStore};

pub const PLATFORM: &str = "sora";

/// What a scripted download writes.
#[derive(Debug, Clone, Copy)]
pub enum DownloadScript {
    /// 20 kB with an `ftyp` box.
    Valid,
    /// Too small to pass verification.
    Truncated,
    Fail(bool),
}

/// Provider whose answers are queued up front. Empty scripts succeed.
#[derive(Default)]
pub struct ScriptedProvider {
    logins: Mutex<VecDeque<Result<(), ProviderError>>>,
    generates: Mutex<VecDeque<Result<(), ProviderError>>>,
    polls: Mutex<VecDeque<Result<PollStatus, ProviderError>>>,
    downloads: Mutex<VecDeque<DownloadScript>>,
    credits: Mutex<Option<CreditsInfo>>,
    /// When set, generate waits for a permit before answering.
    generate_gate: Mutex<Option<Arc<Semaphore>>>,
    pub generate_entered: Notify,
    /// Taken by the next download, which then waits for a permit.
    download_gate: Mutex<Option<Arc<Semaphore>>>,
    pub download_entered: Notify,
    /// Store consulted by `get_credits` to record the caller's lease.
    lease_store: Mutex<Option<Arc<dyn JobStore>>>,
    pub credits_lease_held: Mutex<Vec<bool>>,
    pub login_calls: AtomicUsize,
    pub generate_calls: AtomicUsize,
    pub poll_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
    pub generate_accounts: Mutex<Vec<AccountId>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logins(self, script: impl IntoIterator<Item = Result<(), ProviderError>>) -> Self {
        self.logins.lock().extend(script);
        self
    }

    pub fn with_generates(
        self,
        script: impl IntoIterator<Item = Result<(), ProviderError>>,
    ) -> Self {
        self.generates.lock().extend(script);
        self
    }

    pub fn with_polls(
        self,
        script: impl IntoIterator<Item = Result<PollStatus, ProviderError>>,
    ) -> Self {
        self.polls.lock().extend(script);
        self
    }

    pub fn with_downloads(self, script: impl IntoIterator<Item = DownloadScript>) -> Self {
        self.downloads.lock().extend(script);
        self
    }

    pub fn with_credits(self, credits: CreditsInfo) -> Self {
        *self.credits.lock() = Some(credits);
        self
    }

    /// Make generate block until the returned semaphore gets a permit.
    pub fn gate_generate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.generate_gate.lock() = Some(gate.clone());
        gate
    }

    /// Make only the next download block until the returned semaphore gets a permit.
    pub fn gate_next_download(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.download_gate.lock() = Some(gate.clone());
        gate
    }

    /// Record whether the account is leased each time credits are read.
    pub fn observe_leases(&self, store: Arc<dyn JobStore>) {
        *self.lease_store.lock() = Some(store);
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }
}

pub fn not_ready(progress_pct: Option<u8>) -> Result<PollStatus, ProviderError> {
    Ok(PollStatus::NotReady { progress_pct })
}

pub fn mp4_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    bytes[4..8].copy_from_slice(b"ftyp");
    bytes
}

#[async_trait]
impl VideoProvider for ScriptedProvider {
    fn platform_id(&self) -> &str {
        PLATFORM
    }

    async fn login(&self, _account: &Account) -> Result<(), ProviderError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        self.logins.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn generate_video(
        &self,
        account: &Account,
        _request: &GenerationRequest,
    ) -> Result<GenerationTicket, ProviderError> {
        let call = self.generate_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.generate_accounts.lock().push(account.id);
        self.generate_entered.notify_one();

        let gate = self.generate_gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.map_err(|_| ProviderError::transient("gate closed"))?;
        }

        let scripted = self.generates.lock().pop_front().unwrap_or(Ok(()));
        scripted.map(|()| GenerationTicket {
            task_id: format!("prov-task-{call}"),
        })
    }

    async fn poll_status(
        &self,
        _account: &Account,
        task_id: &str,
    ) -> Result<PollStatus, ProviderError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        self.polls.lock().pop_front().unwrap_or_else(|| {
            Ok(PollStatus::Ready {
                video_id: format!("video-{task_id}"),
                download_url: format!("https://cdn.invalid/{task_id}.mp4"),
            })
        })
    }

    async fn download_video(
        &self,
        _account: &Account,
        _url: &str,
        dest: &Path,
    ) -> Result<DownloadedArtifact, ProviderError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        self.download_entered.notify_one();
        let gate = self.download_gate.lock().take();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.map_err(|_| ProviderError::transient("gate closed"))?;
        }
        let script = self
            .downloads
            .lock()
            .pop_front()
            .unwrap_or(DownloadScript::Valid);
        let bytes = match script {
            DownloadScript::Valid => mp4_bytes(20_000),
            DownloadScript::Truncated => mp4_bytes(100),
            DownloadScript::Fail(true) => return Err(ProviderError::transient("connection reset")),
            DownloadScript::Fail(false) => return Err(ProviderError::permanent("video removed")),
        };
        tokio::fs::write(dest, &bytes).await?;
        Ok(DownloadedArtifact {
            path: dest.to_path_buf(),
            bytes: bytes.len() as u64,
        })
    }

    async fn get_credits(&self, account: &Account) -> Result<CreditsInfo, ProviderError> {
        let store = self.lease_store.lock().clone();
        if let Some(store) = store {
            let current = store
                .load_account(account.id)
                .await
                .map_err(|e| ProviderError::transient(e.to_string()))?;
            self.credits_lease_held.lock().push(current.lease.is_some());
        }
        (*self.credits.lock()).ok_or_else(|| ProviderError::transient("credits unavailable"))
    }
}

/// Durations shrunk so scenarios finish in milliseconds.
pub fn fast_config(download_dir: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        max_concurrent: ConcurrencyConfig {
            generate: 4,
            poll: 4,
            download: 2,
        },
        stale_cutoff: Duration::from_secs(15 * 60),
        stale_check_interval: Duration::from_secs(3600),
        default_max_retries: 3,
        poll_delay: Duration::from_millis(10),
        generate_retry_delay: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        account_lease_ttl: Duration::from_secs(600),
        queue_capacity: 100,
        enqueue_timeout: Duration::from_millis(200),
        worker_pull_timeout: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(2),
        download_dir: download_dir.to_path_buf(),
        min_artifact_bytes: 10_000,
        require_mp4_signature: true,
    }
}

pub fn spec() -> JobSpec {
    JobSpec::new(PLATFORM, "a lighthouse in a storm", 10, AspectRatio::Landscape)
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<dyn JobStore>,
    pub provider: Arc<ScriptedProvider>,
    pub download_dir: TempDir,
}

impl Harness {
    /// In-memory harness with `accounts` accounts on [`PLATFORM`].
    pub async fn new(provider: ScriptedProvider, accounts: usize) -> Self {
        Self::with_store(provider, accounts, Arc::new(MemoryJobStore::new())).await
    }

    pub async fn with_store(
        provider: ScriptedProvider,
        accounts: usize,
        store: Arc<dyn JobStore>,
    ) -> Self {
        let download_dir = tempfile::tempdir().unwrap();
        for i in 0..accounts {
            store
                .insert_account(NewAccount::new(PLATFORM, format!("acct-{i}"), format!("ref-{i}")))
                .await
                .unwrap();
        }

        let provider = Arc::new(provider);
        let registry = ProviderRegistry::new().with(provider.clone());
        let ctx = OrchestratorContext::new(fast_config(download_dir.path()), store.clone(), registry);
        Self {
            orchestrator: Orchestrator::new(ctx),
            store,
            provider,
            download_dir,
        }
    }

    pub async fn create(&self) -> Job {
        self.orchestrator.create_job(NewJob::new(spec())).await.unwrap()
    }

    pub async fn create_with_retries(&self, max_retries: u32) -> Job {
        self.orchestrator
            .create_job(NewJob::new(spec()).with_max_retries(max_retries))
            .await
            .unwrap()
    }

    pub async fn job(&self, id: JobId) -> Job {
        self.store.load_job(id).await.unwrap()
    }

    /// Poll the store until the job reaches `status`.
    pub async fn wait_for_status(&self, id: JobId, status: JobStatus) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = self.job(id).await;
            if job.status == status {
                return job;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("job {id} never reached {status}; last state: {job:#?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until the queue set no longer tracks any job.
    pub async fn wait_until_idle(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.orchestrator.queue_status().active_jobs > 0 {
            if tokio::time::Instant::now() > deadline {
                panic!("jobs still active: {:?}", self.orchestrator.queue_status());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
