//! HTTP transfer with manual redirect following and streaming to a part file.

use crate::error::DownloadError;
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::LOCATION;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use url::Url;

/// Result of a completed body transfer
#[derive(Debug)]
pub(super) struct Transferred {
    /// Bytes written to the part file
    pub(super) bytes: u64,
    /// URL the body was served from
    pub(super) final_url: String,
}

/// Sibling path the body is streamed into before the final rename
pub(super) fn part_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// Fetch `url` into `part`, following at most `max_redirects` hops
///
/// Redirects are 3xx responses carrying a `Location` header; relative
/// locations resolve against the current URL. A 3xx without `Location` and
/// any other non-2xx status is an [`DownloadError::HttpStatus`].
pub(super) async fn fetch_to_file(
    client: &Client,
    url: &str,
    part: &Path,
    max_redirects: u32,
) -> Result<Transferred, DownloadError> {
    let mut current = Url::parse(url)
        .map_err(|e| DownloadError::Transport(format!("invalid URL '{url}': {e}")))?;
    let mut hops = 0u32;

    let response = loop {
        let response = client.get(current.clone()).send().await?;
        let status = response.status();

        if status.is_redirection() {
            if let Some(location) = response.headers().get(LOCATION) {
                if hops >= max_redirects {
                    return Err(DownloadError::TooManyRedirects {
                        limit: max_redirects,
                    });
                }
                let location = location.to_str().map_err(|e| {
                    DownloadError::Transport(format!("unreadable Location header: {e}"))
                })?;
                let next = current.join(location).map_err(|e| {
                    DownloadError::Transport(format!("invalid redirect target '{location}': {e}"))
                })?;
                tracing::debug!(from = %current, to = %next, hop = hops + 1, "Following redirect");
                current = next;
                hops += 1;
                continue;
            }
        }

        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                status: status.as_u16(),
                url: current.to_string(),
            });
        }
        break response;
    };

    if let Some(parent) = part.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(part).await?;
    let mut body = response.bytes_stream();
    let mut bytes = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        bytes += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(Transferred {
        bytes,
        final_url: current.to_string(),
    })
}

/// Remove a leftover part file; a missing file is not an error
pub(super) async fn remove_partial(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Ok(()) => tracing::debug!(path = %part.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %part.display(), error = %e, "Failed to remove partial file")
        }
    }
}
