use crate::config::BotConfig;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use reqwest::header::{HeaderMap, CONTENT_TYPE, SET_COOKIE};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, RwLockReadGuard};

const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("APK_URL environment variable not set!")]
    MissingUrl,
    #[error("Failed to download file: HTTP {status}: {url}")]
    Http { status: StatusCode, url: String },
    #[error("Failed to download file: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Host kept returning a confirmation page after the bypass request")]
    StillInterstitial,
    #[error("Failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Downloaded base package is invalid: {0}")]
    Invalid(#[source] InvalidArchive),
}

/// Why a file is not a usable base package.
#[derive(Debug, thiserror::Error)]
pub enum InvalidArchive {
    #[error("file not found")]
    Missing,
    #[error("only {size} bytes, expected at least {min}")]
    TooSmall { size: u64, min: u64 },
    #[error("not a ZIP container: {0}")]
    NotZip(String),
    #[error("archive has no AndroidManifest.xml")]
    NoManifest,
    #[error("cannot read file: {0}")]
    Unreadable(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    AlreadyPresent,
    Downloaded { bytes: u64 },
    Replaced { bytes: u64 },
}

/// Checks that `path` is a ZIP container holding an Android manifest and is
/// at least `min_size` bytes long. Returns the file size.
pub fn validate_archive(path: &Path, min_size: u64) -> Result<u64, InvalidArchive> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(InvalidArchive::Missing),
        Err(e) => return Err(InvalidArchive::Unreadable(e)),
    };
    let size = file.metadata().map_err(InvalidArchive::Unreadable)?.len();
    if size < min_size {
        return Err(InvalidArchive::TooSmall {
            size,
            min: min_size,
        });
    }

    let archive =
        zip::ZipArchive::new(file).map_err(|e| InvalidArchive::NotZip(e.to_string()))?;
    if !archive.file_names().any(|name| name == MANIFEST_ENTRY) {
        return Err(InvalidArchive::NoManifest);
    }

    Ok(size)
}

pub struct Downloader {
    client: Client,
}

impl Downloader {
    pub fn new() -> Self {
        // The confirmation cookie has to travel with the bypass request.
        let client = Client::builder()
            .cookie_store(true)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Streams `url` into `path`. Large-file hosts answer the first request
    /// with an HTML confirmation page; that page is detected and the request
    /// is reissued once with the confirmation parameters.
    pub async fn download_to_file(&self, url: &str, path: &Path) -> Result<u64, FetchError> {
        info!("→ Downloading: {url}");

        let mut params: Vec<(String, String)> = Vec::new();
        let mut bypassed = false;

        loop {
            let response = self.client.get(url).query(&params).send().await?;
            if !response.status().is_success() {
                return Err(FetchError::Http {
                    status: response.status(),
                    url: url.to_string(),
                });
            }

            let warning_cookie = confirm_cookie(response.headers());
            let html = is_html(response.headers());
            let total_size = response.content_length().unwrap_or(0);
            let mut stream = Box::pin(response.bytes_stream());

            let first = match stream.next().await {
                Some(chunk) => chunk?.to_vec(),
                None => Vec::new(),
            };

            if html || looks_like_markup(&first) {
                if bypassed {
                    return Err(FetchError::StillInterstitial);
                }
                let mut page = first;
                while let Some(chunk) = stream.next().await {
                    page.extend_from_slice(&chunk?);
                }
                params = bypass_params(warning_cookie.as_deref(), &String::from_utf8_lossy(&page));
                info!("→ Confirmation page received, retrying with bypass parameters");
                bypassed = true;
                continue;
            }

            let io_err = |source| FetchError::Io {
                path: path.to_path_buf(),
                source,
            };

            let pb = ProgressBar::new(total_size);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );

            let mut file = File::create(path).await.map_err(io_err)?;
            file.write_all(&first).await.map_err(io_err)?;
            let mut downloaded = first.len() as u64;
            pb.set_position(downloaded);

            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await.map_err(io_err)?;
                downloaded += chunk.len() as u64;
                pb.set_position(downloaded);
            }

            file.flush().await.map_err(io_err)?;
            pb.finish_with_message("Download complete!");
            info!("✓ Saved {downloaded} bytes to: {}", path.display());

            return Ok(downloaded);
        }
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().starts_with("text/html"))
}

fn looks_like_markup(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(&head[..head.len().min(256)]).to_ascii_lowercase();
    let text = text.trim_start();
    text.starts_with("<!doctype html") || text.starts_with("<html")
}

fn confirm_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next()?.split_once('='))
        .find(|(name, _)| name.trim().starts_with("download_warning"))
        .map(|(_, value)| value.trim().to_string())
}

/// Builds the query that skips a confirmation page.
fn bypass_params(cookie: Option<&str>, page: &str) -> Vec<(String, String)> {
    let token = cookie
        .map(str::to_string)
        .or_else(|| token_after(page, "confirm="))
        .or_else(|| hidden_field(page, "confirm"))
        .unwrap_or_else(|| "t".to_string());

    let mut params = vec![("confirm".to_string(), token)];
    if let Some(uuid) = hidden_field(page, "uuid") {
        params.push(("uuid".to_string(), uuid));
    }
    params
}

fn token_after(page: &str, marker: &str) -> Option<String> {
    let start = page.find(marker)? + marker.len();
    let token: String = page[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    (!token.is_empty()).then_some(token)
}

fn hidden_field(page: &str, name: &str) -> Option<String> {
    let marker = format!("name=\"{name}\"");
    let rest = &page[page.find(&marker)? + marker.len()..];
    let rest = &rest[rest.find("value=\"")? + "value=\"".len()..];
    let value = &rest[..rest.find('"')?];
    (!value.is_empty()).then(|| value.to_string())
}

/// The shared, read-mostly base package at its well-known path.
///
/// Readers hold a read guard while they consume the file. A (re-)fetch takes
/// the write guard, downloads next to the target and renames into place, so
/// nobody observes a half-written package.
pub struct BasePackage {
    path: PathBuf,
    url: Option<String>,
    min_size: u64,
    downloader: Downloader,
    lock: RwLock<()>,
}

impl BasePackage {
    pub fn new(config: &BotConfig) -> Self {
        Self::with_downloader(config, Downloader::new())
    }

    pub fn with_downloader(config: &BotConfig, downloader: Downloader) -> Self {
        Self {
            path: config.base_package.clone(),
            url: config.apk_url.clone(),
            min_size: config.min_base_size,
            downloader,
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read-only validity check, no locking or network access.
    pub async fn inspect(&self) -> Result<u64, InvalidArchive> {
        validate_off_runtime(self.path.clone(), self.min_size).await
    }

    pub async fn ensure(&self) -> Result<FetchOutcome, FetchError> {
        let (_guard, outcome) = self.acquire().await?;
        Ok(outcome)
    }

    /// Makes sure a valid package is in place and returns a read guard that
    /// keeps it there until dropped.
    pub async fn acquire(&self) -> Result<(RwLockReadGuard<'_, ()>, FetchOutcome), FetchError> {
        {
            let guard = self.lock.read().await;
            if self.inspect().await.is_ok() {
                info!("Base package already exists");
                return Ok((guard, FetchOutcome::AlreadyPresent));
            }
        }

        let guard = self.lock.write().await;
        let outcome = match self.inspect().await {
            Ok(_) => FetchOutcome::AlreadyPresent,
            Err(InvalidArchive::Missing) => FetchOutcome::Downloaded {
                bytes: self.fetch().await?,
            },
            Err(problem) => {
                warn!(
                    "Base package {} is invalid ({problem}), downloading it again",
                    self.path.display()
                );
                if let Err(e) = tokio::fs::remove_file(&self.path).await {
                    warn!("Failed to remove invalid base package: {e}");
                }
                FetchOutcome::Replaced {
                    bytes: self.fetch().await?,
                }
            }
        };

        Ok((guard.downgrade(), outcome))
    }

    async fn fetch(&self) -> Result<u64, FetchError> {
        let url = self.url.as_deref().ok_or(FetchError::MissingUrl)?;
        let partial = partial_path(&self.path);

        let result: Result<u64, FetchError> = async {
            let bytes = self.downloader.download_to_file(url, &partial).await?;
            validate_off_runtime(partial.clone(), self.min_size)
                .await
                .map_err(FetchError::Invalid)?;
            tokio::fs::rename(&partial, &self.path)
                .await
                .map_err(|source| FetchError::Io {
                    path: self.path.clone(),
                    source,
                })?;
            Ok(bytes)
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&partial).await;
        }
        result
    }
}

async fn validate_off_runtime(path: PathBuf, min_size: u64) -> Result<u64, InvalidArchive> {
    tokio::task::spawn_blocking(move || validate_archive(&path, min_size))
        .await
        .map_err(|e| InvalidArchive::Unreadable(std::io::Error::other(e)))?
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

#[cfg(test)]
pub(crate) fn sample_archive(padding: usize) -> Vec<u8> {
    use std::io::Write;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let stored = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    writer.start_file(MANIFEST_ENTRY, stored).unwrap();
    writer.write_all(b"<manifest/>").unwrap();
    writer.start_file("classes.dex", stored).unwrap();
    writer.write_all(&vec![0u8; padding]).unwrap();
    writer.finish().unwrap().into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    struct Canned {
        status: &'static str,
        content_type: &'static str,
        headers: Vec<String>,
        body: Vec<u8>,
    }

    impl Canned {
        fn ok(content_type: &'static str, body: Vec<u8>) -> Self {
            Self {
                status: "200 OK",
                content_type,
                headers: Vec::new(),
                body,
            }
        }
    }

    /// Answers one connection per canned response and records request heads.
    async fn serve(responses: Vec<Canned>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();

        tokio::spawn(async move {
            for canned in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                loop {
                    let n = socket.read(&mut buf[read..]).await.unwrap();
                    read += n;
                    if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let head = String::from_utf8_lossy(&buf[..read]).to_string();
                log.lock().unwrap().push(head);

                let mut response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
                    canned.status,
                    canned.content_type,
                    canned.body.len()
                );
                for header in &canned.headers {
                    response.push_str(header);
                    response.push_str("\r\n");
                }
                response.push_str("\r\n");
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.write_all(&canned.body).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });

        (format!("http://{addr}/uc?export=download&id=abc"), requests)
    }

    fn package(dir: &Path, url: Option<String>) -> BasePackage {
        let config = BotConfig {
            base_package: dir.join("magnet.apk"),
            apk_url: url,
            min_base_size: 512,
            ..BotConfig::default()
        };
        let client = Client::builder()
            .no_proxy()
            .cookie_store(true)
            .build()
            .unwrap();
        BasePackage::with_downloader(&config, Downloader::with_client(client))
    }

    #[test]
    fn validation_reports_each_problem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.apk");

        assert!(matches!(validate_archive(&path, 0), Err(InvalidArchive::Missing)));

        std::fs::write(&path, b"tiny").unwrap();
        assert!(matches!(
            validate_archive(&path, 100),
            Err(InvalidArchive::TooSmall { size: 4, min: 100 })
        ));
        assert!(matches!(validate_archive(&path, 0), Err(InvalidArchive::NotZip(_))));

        std::fs::write(&path, sample_archive(1024)).unwrap();
        assert!(validate_archive(&path, 512).is_ok());
    }

    #[test]
    fn bypass_prefers_cookie_then_markup_token() {
        assert_eq!(
            bypass_params(Some("COOKIE"), "confirm=FROMPAGE"),
            vec![("confirm".to_string(), "COOKIE".to_string())]
        );
        assert_eq!(
            bypass_params(None, r#"<a href="/uc?export=download&amp;confirm=Ab_9-x&amp;id=1">"#),
            vec![("confirm".to_string(), "Ab_9-x".to_string())]
        );
        assert_eq!(
            bypass_params(
                None,
                r#"<input type="hidden" name="confirm" value="t"><input type="hidden" name="uuid" value="u-1">"#
            ),
            vec![
                ("confirm".to_string(), "t".to_string()),
                ("uuid".to_string(), "u-1".to_string())
            ]
        );
        assert_eq!(
            bypass_params(None, "<html>nothing here</html>"),
            vec![("confirm".to_string(), "t".to_string())]
        );
    }

    #[tokio::test]
    async fn valid_package_is_not_downloaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = sample_archive(2048);
        std::fs::write(dir.path().join("magnet.apk"), &bytes).unwrap();

        // Nothing listens here, so any network access would fail the call.
        let base = package(dir.path(), Some("http://127.0.0.1:9/none".to_string()));

        assert_eq!(base.ensure().await.unwrap(), FetchOutcome::AlreadyPresent);
        assert_eq!(base.ensure().await.unwrap(), FetchOutcome::AlreadyPresent);
        assert_eq!(std::fs::read(base.path()).unwrap(), bytes);
    }

    #[tokio::test]
    async fn missing_package_is_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = sample_archive(2048);
        let (url, requests) = serve(vec![Canned::ok("application/octet-stream", bytes.clone())]).await;
        let base = package(dir.path(), Some(url));

        let outcome = base.ensure().await.unwrap();

        assert_eq!(outcome, FetchOutcome::Downloaded { bytes: bytes.len() as u64 });
        assert_eq!(std::fs::read(base.path()).unwrap(), bytes);
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_package_is_replaced_with_one_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("magnet.apk"), vec![7u8; 4096]).unwrap();
        let bytes = sample_archive(2048);
        let (url, requests) = serve(vec![Canned::ok("application/vnd.android.package-archive", bytes.clone())]).await;
        let base = package(dir.path(), Some(url));

        let outcome = base.ensure().await.unwrap();

        assert_eq!(outcome, FetchOutcome::Replaced { bytes: bytes.len() as u64 });
        assert!(base.inspect().await.is_ok());
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn confirmation_page_is_bypassed_with_cookie_token() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = sample_archive(2048);
        let interstitial = Canned {
            status: "200 OK",
            content_type: "text/html; charset=utf-8",
            headers: vec!["Set-Cookie: download_warning_123=XyZ9; Path=/".to_string()],
            body: b"<html><body>Google Drive can't scan this file</body></html>".to_vec(),
        };
        let (url, requests) = serve(vec![
            interstitial,
            Canned::ok("application/octet-stream", bytes.clone()),
        ])
        .await;
        let base = package(dir.path(), Some(url));

        base.ensure().await.unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].contains("confirm="));
        assert!(requests[1].contains("confirm=XyZ9"), "{}", requests[1]);
        assert!(
            requests[1]
                .to_ascii_lowercase()
                .contains("cookie: download_warning_123=xyz9"),
            "{}",
            requests[1]
        );
        assert_eq!(std::fs::read(base.path()).unwrap(), bytes);
    }

    #[tokio::test]
    async fn markup_without_html_content_type_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = sample_archive(2048);
        let (url, requests) = serve(vec![
            Canned::ok(
                "application/octet-stream",
                b"  <!DOCTYPE html><a href=\"?confirm=abc\">".to_vec(),
            ),
            Canned::ok("application/octet-stream", bytes),
        ])
        .await;
        let base = package(dir.path(), Some(url));

        base.ensure().await.unwrap();

        assert!(requests.lock().unwrap()[1].contains("confirm=abc"));
    }

    #[tokio::test]
    async fn invalid_download_leaves_no_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let (url, _) = serve(vec![Canned::ok("application/octet-stream", vec![1u8; 4096])]).await;
        let base = package(dir.path(), Some(url));

        let err = base.ensure().await.unwrap_err();

        assert!(matches!(err, FetchError::Invalid(InvalidArchive::NotZip(_))));
        assert!(!base.path().exists());
        assert!(!partial_path(base.path()).exists());
    }

    #[tokio::test]
    async fn http_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (url, _) = serve(vec![Canned {
            status: "404 Not Found",
            content_type: "text/plain",
            headers: Vec::new(),
            body: b"gone".to_vec(),
        }])
        .await;
        let base = package(dir.path(), Some(url));

        let err = base.ensure().await.unwrap_err();
        assert!(matches!(err, FetchError::Http { status, .. } if status == StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn missing_link_is_a_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let base = package(dir.path(), None);

        assert!(matches!(base.ensure().await, Err(FetchError::MissingUrl)));
    }
}
