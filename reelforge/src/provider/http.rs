//! Plain HTTP artifact download.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{DownloadedArtifact, ProviderError};
use crate::utils::http_client::build_download_client;

fn shared_client() -> Result<&'static reqwest::Client, ProviderError> {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    if let Some(client) = CLIENT.get() {
        return Ok(client);
    }
    let client = build_download_client(Duration::ZERO)
        .map_err(|e| ProviderError::transient(e.to_string()))?;
    Ok(CLIENT.get_or_init(|| client))
}

/// Stream `url` into `dest`, writing through `<dest>.part`.
pub async fn download_to_file(url: &str, dest: &Path) -> Result<DownloadedArtifact, ProviderError> {
    let client = shared_client()?;
    let response = client.get(url).send().await?.error_for_status()?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut partial = dest.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);
    let mut file = tokio::fs::File::create(&partial).await?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e.into());
            }
        };
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&partial, dest).await?;
    debug!(url, path = %dest.display(), bytes = written, "artifact downloaded");

    Ok(DownloadedArtifact {
        path: dest.to_path_buf(),
        bytes: written,
    })
}
