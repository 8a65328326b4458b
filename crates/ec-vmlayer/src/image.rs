//! Cloudlet base image: download once, verify, register with the provider.

use std::path::{Path, PathBuf};

use ec_infra::VmProvider;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::PlatformConfig;
use crate::{Error, Result};

/// Hex SHA-256 of a file.
pub async fn file_sha256(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Download `url` to `path` unless a file with the expected checksum is
/// already there. A mismatching download is deleted.
pub async fn download_verified(
    http: &reqwest::Client,
    url: &str,
    path: &Path,
    expected_sha256: &str,
) -> Result<()> {
    if fs::try_exists(path).await? {
        let actual = file_sha256(path).await?;
        if actual.eq_ignore_ascii_case(expected_sha256) {
            debug!(path = %path.display(), "cached image matches checksum");
            return Ok(());
        }
        warn!(path = %path.display(), "cached image has wrong checksum, downloading again");
        fs::remove_file(path).await?;
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }

    let partial = path.with_extension("part");
    let resp = http.get(url).send().await?.error_for_status()?;
    let mut stream = resp.bytes_stream();
    let mut file = fs::File::create(&partial).await?;
    let mut hasher = Sha256::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    let actual = format!("{:x}", hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected_sha256) {
        fs::remove_file(&partial).await?;
        return Err(Error::Checksum {
            path: path.display().to_string(),
            expected: expected_sha256.to_string(),
            actual,
        });
    }
    fs::rename(&partial, path).await?;
    info!(url, path = %path.display(), "image downloaded");
    Ok(())
}

pub fn cached_image_path(config: &PlatformConfig) -> PathBuf {
    config
        .image_cache_dir
        .join(format!("{}.qcow2", config.base_image_name))
}

/// Make sure the cloudlet base image is registered with the provider.
pub async fn ensure_base_image(
    provider: &dyn VmProvider,
    http: &reqwest::Client,
    config: &PlatformConfig,
) -> Result<()> {
    let name = &config.base_image_name;
    if provider.image_exists(name).await? {
        debug!(image = %name, "base image present");
        return Ok(());
    }
    if config.base_image_url.is_empty() {
        return Err(Error::Config(format!(
            "base image {name} is missing and no download URL is configured"
        )));
    }
    if config.base_image_checksum.is_empty() {
        return Err(Error::Config(format!(
            "base image {name} has no checksum configured"
        )));
    }
    let path = cached_image_path(config);
    download_verified(http, &config.base_image_url, &path, &config.base_image_checksum).await?;
    provider.add_image_from_file(name, &path).await?;
    info!(image = %name, "base image registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ec_infra::fake::FakeProvider;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const BODY: &[u8] = b"qcow2 image bytes";

    fn sha(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    /// Serve `BODY` to every connection.
    async fn serve_body() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut req = vec![0u8; 1024];
                let _ = sock.read(&mut req).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    BODY.len()
                );
                let _ = sock.write_all(head.as_bytes()).await;
                let _ = sock.write_all(BODY).await;
            }
        });
        format!("http://{addr}/base.qcow2")
    }

    #[tokio::test]
    async fn download_is_verified_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images/base.qcow2");
        let url = serve_body().await;
        let http = reqwest::Client::new();

        download_verified(&http, &url, &path, &sha(BODY)).await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), BODY);

        // second call is satisfied by the cached file
        download_verified(&http, "http://127.0.0.1:9/unreachable", &path, &sha(BODY))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.qcow2");
        let url = serve_body().await;
        let err = download_verified(&reqwest::Client::new(), &url, &path, &sha(b"other"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Checksum { .. }));
        assert!(!path.exists());
        assert!(!path.with_extension("part").exists());
    }

    #[tokio::test]
    async fn ensure_registers_missing_image_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PlatformConfig::for_cloudlet("hamburg");
        config.image_cache_dir = dir.path().to_path_buf();
        config.base_image_url = serve_body().await;
        config.base_image_checksum = sha(BODY);
        let provider = FakeProvider::new();
        let http = reqwest::Client::new();

        ensure_base_image(&provider, &http, &config).await.unwrap();
        ensure_base_image(&provider, &http, &config).await.unwrap();
        let adds = provider
            .calls()
            .await
            .iter()
            .filter(|c| c.starts_with("add_image_from_file"))
            .count();
        assert_eq!(adds, 1);
    }

    #[tokio::test]
    async fn missing_image_without_url_is_a_configuration_error() {
        let config = PlatformConfig::for_cloudlet("hamburg");
        let err = ensure_base_image(&FakeProvider::new(), &reqwest::Client::new(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
