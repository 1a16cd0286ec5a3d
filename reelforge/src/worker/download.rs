//! Download stage: fetch the artifact, verify it and finish the job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::{StageHandler, commit, fail_job, finish, retry_or_fail};
use crate::Result;
use crate::domain::{ErrorKind, JobId, JobStatus, Stage, Task, TaskKind, TaskPayload};
use crate::orchestrator::OrchestratorContext;
use crate::utils::filename::sanitize_filename;
use crate::utils::fs::{ensure_dir_all, remove_file_if_exists};

/// MP4 box type expected at bytes 4..8.
const MP4_SIGNATURE: &[u8; 4] = b"ftyp";

pub struct DownloadHandler;

/// `<dir>/<platform>_<job id>_<video id>.mp4`, with provider-supplied parts
/// reduced to a single path component.
pub fn artifact_path(dir: &Path, platform: &str, job_id: JobId, video_id: &str) -> PathBuf {
    let name = format!(
        "{}_{job_id}_{}.mp4",
        sanitize_filename(platform),
        sanitize_filename(video_id)
    );
    dir.join(name)
}

/// Where one task writes before the artifact is published under `dest`.
///
/// Unique per claim epoch and attempt, so a superseded task never touches
/// the file a newer task is writing or has published.
pub fn staging_path(dest: &Path, epoch: u64, attempt: u32) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(format!(".{epoch}-{attempt}.tmp"));
    PathBuf::from(name)
}

/// Check a downloaded file. Returns its size, or why it was rejected.
pub async fn verify_artifact(
    path: &Path,
    min_bytes: u64,
    require_signature: bool,
) -> std::result::Result<u64, String> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("artifact missing at {}: {e}", path.display()))?;
    if !meta.is_file() {
        return Err(format!("artifact at {} is not a file", path.display()));
    }

    let size = meta.len();
    if size < min_bytes {
        return Err(format!(
            "artifact too small: {size} bytes, expected at least {min_bytes}"
        ));
    }

    if require_signature {
        let mut header = [0u8; 8];
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| format!("cannot open artifact: {e}"))?;
        file.read_exact(&mut header)
            .await
            .map_err(|_| "artifact too short for an MP4 header".to_string())?;
        if &header[4..8] != MP4_SIGNATURE {
            return Err("artifact is not an MP4 file (missing ftyp box)".to_string());
        }
    }
    Ok(size)
}

async fn discard(path: &Path) {
    if let Err(e) = remove_file_if_exists(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove rejected artifact");
    }
}

#[async_trait]
impl StageHandler for DownloadHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Download
    }

    async fn handle(&self, ctx: &Arc<OrchestratorContext>, task: Task) -> Result<()> {
        let (account_id, video_id, download_url) = match &task.payload {
            TaskPayload::Download {
                account_id,
                video_id,
                download_url,
            } => (*account_id, video_id.clone(), download_url.clone()),
            _ => {
                return Err(crate::Error::validation(
                    "download queue received a non-download task",
                ));
            }
        };

        let started = commit(ctx, &task, |job| {
            job.resume_into(JobStatus::Download)?;
            job.task_state.download.record.begin(Utc::now());
            job.set_progress(super::poll::PROGRESS_READY.max(job.progress));
            Ok(())
        })
        .await?;
        let Some(job) = started else {
            return Ok(());
        };

        let provider = match ctx.providers.get(&job.spec.platform) {
            Ok(provider) => provider,
            Err(_) => {
                let msg = format!("no provider registered for platform '{}'", job.spec.platform);
                return fail_job(ctx, &task, ErrorKind::ProviderPermanent, msg).await;
            }
        };
        let account = ctx.store.load_account(account_id).await?;

        let dir = &ctx.config.download_dir;
        ensure_dir_all("creating download directory", dir).await?;
        let video_key = video_id.clone().unwrap_or_else(|| "video".to_string());
        let dest = artifact_path(dir, &job.spec.platform, job.id, &video_key);

        let staging = staging_path(&dest, task.epoch, task.attempt);

        info!(job_id = %job.id, path = %dest.display(), "Downloading artifact");
        let artifact = match provider.download_video(&account, &download_url, &staging).await {
            Ok(artifact) => artifact,
            Err(e) => {
                discard(&staging).await;
                return if e.is_transient() {
                    let next = task.clone().next_attempt();
                    retry_or_fail(ctx, &task, next, ErrorKind::ProviderTransient, e.to_string())
                        .await
                } else {
                    fail_job(ctx, &task, ErrorKind::ProviderPermanent, e.to_string()).await
                };
            }
        };

        let size = match verify_artifact(
            &artifact.path,
            ctx.config.min_artifact_bytes,
            ctx.config.require_mp4_signature,
        )
        .await
        {
            Ok(size) => size,
            Err(reason) => {
                warn!(job_id = %job.id, reason = %reason, "Artifact rejected");
                discard(&artifact.path).await;
                let next = task.clone().next_attempt();
                return retry_or_fail(ctx, &task, next, ErrorKind::VerificationFailure, reason)
                    .await;
            }
        };

        // Only the task that owns the claim may publish under `dest`.
        if !ctx.queues.is_current(&task) {
            info!(job_id = %task.job_id, "Download superseded, dropping staged file");
            discard(&artifact.path).await;
            return Ok(());
        }
        if let Err(e) = tokio::fs::rename(&artifact.path, &dest).await {
            discard(&artifact.path).await;
            return Err(crate::Error::io_path("publishing artifact to", &dest, e));
        }

        let local_path = dest.to_string_lossy().into_owned();
        let committed = commit(ctx, &task, |job| {
            job.result.local_path = Some(local_path.clone());
            job.task_state.download.file_size = Some(size);
            job.task_state.advance(Stage::Download, Utc::now());
            job.transition(JobStatus::Done)?;
            job.set_progress(100);
            Ok(())
        })
        .await?;

        match committed {
            Some(job) => {
                info!(job_id = %job.id, bytes = size, path = %local_path, "Video downloaded");
                finish(ctx, &task, &job);
            }
            None => {
                // A newer task may own `dest` now; only clean up when nothing does.
                let recorded = ctx
                    .store
                    .load_job(task.job_id)
                    .await
                    .is_ok_and(|job| job.result.local_path.as_deref() == Some(local_path.as_str()));
                if recorded || ctx.queues.is_claimed(task.job_id) {
                    debug!(job_id = %task.job_id, "Download superseded after publishing");
                } else {
                    info!(job_id = %task.job_id, "Job left the pipeline during download, removing file");
                    discard(&dest).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp4_bytes(len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        bytes[4..8].copy_from_slice(b"ftyp");
        bytes
    }

    #[test]
    fn test_artifact_path() {
        let path = artifact_path(Path::new("data/downloads"), "sora", JobId(12), "v-9");
        assert_eq!(path, PathBuf::from("data/downloads/sora_12_v-9.mp4"));
    }

    #[test]
    fn test_artifact_path_stays_inside_download_dir() {
        let dir = Path::new("data/downloads");
        for video_id in ["../../x", "/etc/passwd", "a/../../b", "..", "c:\\evil"] {
            let path = artifact_path(dir, "../sora", JobId(1), video_id);
            assert_eq!(path.parent(), Some(dir), "{video_id} escaped: {}", path.display());
            assert!(
                path.components()
                    .all(|c| !matches!(c, std::path::Component::ParentDir)),
                "{}",
                path.display()
            );
        }
        assert_eq!(
            artifact_path(dir, "sora", JobId(1), "../../x"),
            PathBuf::from("data/downloads/sora_1__.._x.mp4")
        );
    }

    #[test]
    fn test_staging_path_is_unique_per_task() {
        let dest = Path::new("data/downloads/sora_1_v.mp4");
        let first = staging_path(dest, 3, 0);
        assert_eq!(first, PathBuf::from("data/downloads/sora_1_v.mp4.3-0.tmp"));
        assert_ne!(first, staging_path(dest, 4, 0));
        assert_ne!(first, staging_path(dest, 3, 1));
        assert_eq!(first.parent(), dest.parent());
    }

    #[tokio::test]
    async fn test_verify_accepts_valid_mp4() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.mp4");
        tokio::fs::write(&path, mp4_bytes(20_000)).await.unwrap();

        assert_eq!(verify_artifact(&path, 10_000, true).await, Ok(20_000));
    }

    #[tokio::test]
    async fn test_verify_rejects_small_missing_and_unsigned() {
        let dir = tempfile::tempdir().unwrap();

        let small = dir.path().join("small.mp4");
        tokio::fs::write(&small, mp4_bytes(100)).await.unwrap();
        assert!(verify_artifact(&small, 10_000, true).await.is_err());

        let missing = dir.path().join("missing.mp4");
        assert!(verify_artifact(&missing, 0, false).await.is_err());

        let html = dir.path().join("error.mp4");
        tokio::fs::write(&html, vec![b'<'; 20_000]).await.unwrap();
        assert!(verify_artifact(&html, 10_000, true).await.is_err());
        assert_eq!(verify_artifact(&html, 10_000, false).await, Ok(20_000));
    }
}
