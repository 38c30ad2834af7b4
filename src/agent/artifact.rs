//! Fetches a job's input artifact into its workspace.

use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::config::ArtifactConfig;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Unsupported artifact URL: {0}")]
    UnsupportedUrl(String),

    #[error("file:// artifacts are disabled on this agent")]
    FileUrlDisabled,

    #[error("Artifact download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("Artifact download returned HTTP {0}")]
    HttpStatus(u16),

    #[error("Artifact exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("Invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Archive entry escapes the workspace: {0}")]
    UnsafePath(String),

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("Artifact I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    http: reqwest::Client,
    config: ArtifactConfig,
}

impl ArtifactFetcher {
    pub fn new(request_timeout: Duration, config: ArtifactConfig) -> Result<Self, ArtifactError> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http, config })
    }

    /// Place the artifact at `url` into `workspace`.
    ///
    /// Zip payloads are unpacked; anything else is written as `filename`
    /// (or the last URL path segment when `filename` is empty). Returns the
    /// number of files written.
    pub async fn fetch(
        &self,
        url: &str,
        filename: &str,
        workspace: &Path,
    ) -> Result<usize, ArtifactError> {
        let payload = self.download(url).await?;

        if is_zip_payload(&payload) {
            let dir = workspace.to_path_buf();
            let limit = self.config.max_extracted_bytes;
            return tokio::task::spawn_blocking(move || extract_zip_to_dir(payload, &dir, limit))
                .await
                .map_err(|e| ArtifactError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        }

        let name = if filename.is_empty() {
            url_file_name(url).unwrap_or("artifact")
        } else {
            filename
        };
        let target = safe_join(workspace, Path::new(name))
            .map_err(|_| ArtifactError::InvalidFilename(name.to_string()))?;
        tokio::fs::write(&target, &payload).await?;
        Ok(1)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ArtifactError> {
        let limit = self.config.max_download_bytes;
        if let Some(path) = url.strip_prefix("file://") {
            if !self.config.allow_file_urls {
                return Err(ArtifactError::FileUrlDisabled);
            }
            let mut payload = Vec::new();
            tokio::fs::File::open(path)
                .await?
                .take(limit.saturating_add(1))
                .read_to_end(&mut payload)
                .await?;
            if payload.len() as u64 > limit {
                return Err(ArtifactError::TooLarge { limit });
            }
            return Ok(payload);
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ArtifactError::UnsupportedUrl(url.to_string()));
        }

        let mut response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArtifactError::HttpStatus(status.as_u16()));
        }
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(ArtifactError::TooLarge { limit });
        }
        // Content-Length may be absent or wrong; count what actually arrives.
        let mut payload = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if (payload.len() + chunk.len()) as u64 > limit {
                return Err(ArtifactError::TooLarge { limit });
            }
            payload.extend_from_slice(&chunk);
        }
        Ok(payload)
    }
}

fn url_file_name(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    path.rsplit('/').next().filter(|s| !s.is_empty())
}

fn is_zip_payload(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04")
        || bytes.starts_with(b"PK\x05\x06")
        || bytes.starts_with(b"PK\x07\x08")
}

fn extract_zip_to_dir(bytes: Vec<u8>, dest: &Path, limit: u64) -> Result<usize, ArtifactError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut written = 0;
    let mut remaining = limit;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let Some(relative) = file.enclosed_name() else {
            return Err(ArtifactError::UnsafePath(file.name().to_string()));
        };
        let out_path = safe_join(dest, &relative)?;
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&out_path)?;
        // Declared sizes can lie, so bound the copy itself.
        let copied = io::copy(&mut (&mut file).take(remaining.saturating_add(1)), &mut out)?;
        if copied > remaining {
            return Err(ArtifactError::TooLarge { limit });
        }
        remaining -= copied;
        written += 1;
    }
    Ok(written)
}

fn safe_join(base: &Path, relative: &Path) -> Result<PathBuf, ArtifactError> {
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(ArtifactError::UnsafePath(relative.display().to_string()));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(ArtifactError::UnsafePath(String::new()));
    }
    Ok(base.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    fn fetcher_with(config: ArtifactConfig) -> ArtifactFetcher {
        ArtifactFetcher::new(Duration::from_secs(5), config).unwrap()
    }

    fn local_fetcher() -> ArtifactFetcher {
        fetcher_with(ArtifactConfig {
            allow_file_urls: true,
            ..ArtifactConfig::default()
        })
    }

    #[test]
    fn detects_zip_magic() {
        assert!(is_zip_payload(b"PK\x03\x04rest"));
        assert!(!is_zip_payload(b"#!/bin/sh\n"));
    }

    #[test]
    fn rejects_traversal() {
        let base = Path::new("/ws");
        assert!(safe_join(base, Path::new("a/b.txt")).is_ok());
        assert!(safe_join(base, Path::new("../etc/passwd")).is_err());
        assert!(safe_join(base, Path::new("/etc/passwd")).is_err());
        assert!(safe_join(base, Path::new("")).is_err());
    }

    #[test]
    fn file_name_from_url() {
        assert_eq!(url_file_name("https://h/a/input.csv?sig=1"), Some("input.csv"));
        assert_eq!(url_file_name("https://h/a/"), None);
    }

    #[tokio::test]
    async fn file_url_zip_is_extracted() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let archive = src.path().join("bundle.zip");
        std::fs::write(
            &archive,
            zip_bytes(&[("run.sh", b"echo hi"), ("data/in.txt", b"42")]),
        )
        .unwrap();

        let url = format!("file://{}", archive.display());
        let written = local_fetcher()
            .fetch(&url, "bundle.zip", ws.path())
            .await
            .unwrap();

        assert_eq!(written, 2);
        assert_eq!(std::fs::read(ws.path().join("data/in.txt")).unwrap(), b"42");
        assert!(!ws.path().join("bundle.zip").exists());
    }

    #[tokio::test]
    async fn plain_payload_is_written_as_filename() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let input = src.path().join("input.bin");
        std::fs::write(&input, b"raw").unwrap();

        let url = format!("file://{}", input.display());
        local_fetcher()
            .fetch(&url, "payload.dat", ws.path())
            .await
            .unwrap();

        assert_eq!(std::fs::read(ws.path().join("payload.dat")).unwrap(), b"raw");
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let ws = tempfile::tempdir().unwrap();
        let err = local_fetcher()
            .fetch("ftp://host/file", "file", ws.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::UnsupportedUrl(_)));
    }

    #[tokio::test]
    async fn file_urls_are_refused_by_default() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let secret = src.path().join("id_rsa");
        std::fs::write(&secret, b"private").unwrap();

        let url = format!("file://{}", secret.display());
        let err = fetcher_with(ArtifactConfig::default())
            .fetch(&url, "key", ws.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::FileUrlDisabled));
        assert!(!ws.path().join("key").exists());
    }

    #[tokio::test]
    async fn oversized_download_is_refused() {
        let src = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let input = src.path().join("big.bin");
        std::fs::write(&input, vec![b'x'; 2048]).unwrap();

        let fetcher = fetcher_with(ArtifactConfig {
            allow_file_urls: true,
            max_download_bytes: 1024,
            ..ArtifactConfig::default()
        });
        let url = format!("file://{}", input.display());
        let err = fetcher.fetch(&url, "big.bin", ws.path()).await.unwrap_err();
        assert!(matches!(err, ArtifactError::TooLarge { limit: 1024 }));
        assert!(!ws.path().join("big.bin").exists());
    }

    #[test]
    fn extraction_stops_at_the_byte_cap() {
        let ws = tempfile::tempdir().unwrap();
        // Highly compressible, so the archive itself stays small.
        let zeros = vec![0u8; 64 * 1024];
        let archive = zip_bytes(&[("a.bin", zeros.as_slice()), ("b.bin", zeros.as_slice())]);
        assert!(archive.len() < 4096);

        let err = extract_zip_to_dir(archive.clone(), ws.path(), 100 * 1024).unwrap_err();
        assert!(matches!(err, ArtifactError::TooLarge { .. }));

        let ws = tempfile::tempdir().unwrap();
        assert_eq!(extract_zip_to_dir(archive, ws.path(), 128 * 1024).unwrap(), 2);
    }
}
