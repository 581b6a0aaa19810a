use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Duration,
};

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use sha1::Digest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::OperationError;

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent(concat!("hearth-agent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(15 * 60))
            .build()
            .unwrap_or_default()
    })
}

fn http_err(url: &str) -> impl FnOnce(reqwest::Error) -> OperationError + '_ {
    move |source| OperationError::Http {
        url: url.to_string(),
        source,
    }
}

/// GETs `url` and decodes the body as JSON. Transport and status failures
/// are `Http`; an undecodable body is `Malformed`.
pub(crate) async fn get_json<T: DeserializeOwned>(url: &str) -> Result<T, OperationError> {
    let body = http_client()
        .get(url)
        .send()
        .await
        .map_err(http_err(url))?
        .error_for_status()
        .map_err(http_err(url))?
        .bytes()
        .await
        .map_err(http_err(url))?;

    serde_json::from_slice(&body).map_err(|e| OperationError::Malformed {
        url: url.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Expected {
    pub size: Option<u64>,
    pub sha1: Option<String>,
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

/// Streams `url` into `target`. Bytes land in `<target>.part` first and are
/// only renamed into place after the size and SHA-1 checks pass.
pub(crate) async fn download_to(
    url: &str,
    target: &Path,
    expected: &Expected,
) -> Result<u64, OperationError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let resp = http_client()
        .get(url)
        .send()
        .await
        .map_err(http_err(url))?
        .error_for_status()
        .map_err(http_err(url))?;

    let tmp = part_path(target);
    let mut file = tokio::fs::File::create(&tmp).await?;
    let mut hasher = sha1::Sha1::new();
    let mut written = 0u64;
    let mut stream = resp.bytes_stream();

    let result: Result<(), OperationError> = async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(http_err(url))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            written = written.saturating_add(chunk.len() as u64);
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    if let Some(size) = expected.size
        && size != written
    {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(OperationError::Integrity {
            path: target.to_path_buf(),
            message: format!("size mismatch: expected {size} bytes, got {written} bytes (url={url})"),
        });
    }

    if let Some(want) = &expected.sha1 {
        let got = hex::encode(hasher.finalize());
        if !got.eq_ignore_ascii_case(want) {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(OperationError::Integrity {
                path: target.to_path_buf(),
                message: format!("sha1 mismatch: expected {want}, got {got} (url={url})"),
            });
        }
    }

    tokio::fs::rename(&tmp, target).await?;
    tracing::debug!(%url, path = %target.display(), bytes = written, "download complete");
    Ok(written)
}

/// Hex SHA-1 of a file, or `None` if it does not exist.
pub(crate) async fn file_sha1(path: &Path) -> Result<Option<String>, OperationError> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut hasher = sha1::Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Some(hex::encode(hasher.finalize())))
}

/// Last path segment of a URL, used when no explicit file name is given.
pub(crate) fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()
        .map(|s| s.to_string())
}
