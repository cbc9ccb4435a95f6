//! Streaming download to a temp file with atomic rename.
//!
//! Readers of the sync root never observe partial files: bytes land in a
//! `.iphoto-part` sibling which is renamed over the final name only after
//! the stream completed and the byte count checked out. Any failure
//! removes the temp file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::icloud::{DownloadError, PhotoByteStream};

/// Suffix for in-flight downloads.
pub const TEMP_SUFFIX: &str = ".iphoto-part";

fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(TEMP_SUFFIX);
    final_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(name)
}

/// Stream `stream` into `final_path`, enforcing `timeout` over the whole
/// transfer. `expected_size == 0` means the size is unknown and the byte
/// count is not checked. Returns the number of bytes written.
pub async fn download_to_file(
    stream: PhotoByteStream,
    final_path: &Path,
    expected_size: u64,
    timeout: Duration,
) -> Result<u64, DownloadError> {
    let temp_path = temp_path_for(final_path);

    let written = match tokio::time::timeout(
        timeout,
        write_stream(stream, &temp_path, expected_size),
    )
    .await
    {
        Ok(Ok(written)) => written,
        Ok(Err(e)) => {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        Err(_) => {
            let _ = fs::remove_file(&temp_path).await;
            return Err(DownloadError::ServiceUnavailable(format!(
                "download exceeded {} s",
                timeout.as_secs()
            )));
        }
    };

    fs::rename(&temp_path, final_path).await?;
    Ok(written)
}

async fn write_stream(
    mut stream: PhotoByteStream,
    temp_path: &Path,
    expected_size: u64,
) -> Result<u64, DownloadError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(temp_path)
        .await?;

    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_data().await?;
    drop(file);

    if expected_size > 0 && written != expected_size {
        return Err(DownloadError::Truncated {
            expected: expected_size,
            received: written,
        });
    }

    Ok(written)
}
