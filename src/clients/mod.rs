/// Remote image stores and the archive render step
use crate::domain::SatellitePattern;
use crate::errors::{ApiError, ApiResult};
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Contract every remote store fulfils; the reconciler treats all stores alike
#[async_trait]
pub trait Store: Send + Sync {
    /// Short label used in logs and progress messages
    fn name(&self) -> &str;

    /// Whether downloads yield raw data that must be rendered before display
    fn needs_render(&self) -> bool {
        false
    }

    async fn exists(&self, timestamp: DateTime<Utc>, satellite: SatellitePattern) -> ApiResult<bool>;

    async fn download(
        &self,
        timestamp: DateTime<Utc>,
        satellite: SatellitePattern,
        dest: &Path,
    ) -> ApiResult<PathBuf>;
}

/// Converts a raw archive file into a displayable image
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, raw: &Path) -> ApiResult<PathBuf>;
}

/// HTTP client wrapper with common configuration
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("goes-reconcile/0.1")
            .build()?;
        Ok(Self { client })
    }

    pub fn get_client(&self) -> &Client {
        &self.client
    }

    /// GET `url` and write the body to `dest`, creating parent directories
    async fn fetch_to_file(&self, url: &str, dest: &Path) -> ApiResult<PathBuf> {
        let resp = self.client.get(url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(url.to_string()));
        }
        let bytes = resp.error_for_status()?.bytes().await?;

        write_file(dest, &bytes).await?;
        debug!(url, dest = %dest.display(), bytes = bytes.len(), "Downloaded file");
        Ok(dest.to_path_buf())
    }
}

/// NESDIS STAR CDN serving recent full-disk band 13 JPEGs
pub struct CdnStore {
    http_client: HttpClient,
    base_url: String,
}

impl CdnStore {
    pub fn new(base_url: String, timeout: Duration) -> ApiResult<Self> {
        Ok(Self {
            http_client: HttpClient::new(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Where a download for `dest` lands; the CDN serves JPEG, so the extension follows
    pub fn local_path(dest: &Path) -> PathBuf {
        dest.with_extension("jpg")
    }

    /// Image URL for a timestamp, or `None` when the satellite has no CDN feed
    pub fn image_url(&self, timestamp: DateTime<Utc>, satellite: SatellitePattern) -> Option<String> {
        let code = satellite.cdn_code()?;
        Some(format!(
            "{}/{}/ABI/FD/13/{}_{}-ABI-FD-13-5424x5424.jpg",
            self.base_url,
            code,
            timestamp.format("%Y%j%H%M"),
            code
        ))
    }
}

#[async_trait]
impl Store for CdnStore {
    fn name(&self) -> &str {
        "CDN"
    }

    async fn exists(&self, timestamp: DateTime<Utc>, satellite: SatellitePattern) -> ApiResult<bool> {
        let Some(url) = self.image_url(timestamp, satellite) else {
            return Ok(false);
        };

        let resp = self.http_client.get_client().head(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.error_for_status()?;
        Ok(true)
    }

    async fn download(
        &self,
        timestamp: DateTime<Utc>,
        satellite: SatellitePattern,
        dest: &Path,
    ) -> ApiResult<PathBuf> {
        let url = self
            .image_url(timestamp, satellite)
            .ok_or_else(|| ApiError::NotFound(format!("no CDN feed for {}", satellite)))?;
        self.http_client.fetch_to_file(&url, &Self::local_path(dest)).await
    }
}

/// NOAA open-data S3 buckets holding archival ABI L1b NetCDF files
///
/// The buckets are public, so requests go out unsigned.
pub struct ArchiveStore {
    client: aws_sdk_s3::Client,
}

const ARCHIVE_REGION: &str = "us-east-1";

impl ArchiveStore {
    /// Anonymous S3 client; `endpoint_url` points at an S3-compatible mirror instead of AWS
    pub async fn new(endpoint_url: Option<String>, timeout: Duration) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(ARCHIVE_REGION))
            .no_credentials()
            .timeout_config(TimeoutConfig::builder().operation_timeout(timeout).build())
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(url) = endpoint_url {
            builder = builder.endpoint_url(url).force_path_style(true);
        }
        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
        }
    }

    /// Object key prefix for the band 13 full-disk scan starting in this minute
    pub fn key_prefix(timestamp: DateTime<Utc>, satellite: SatellitePattern) -> Option<String> {
        Some(format!(
            "ABI-L1b-RadF/{}/OR_ABI-L1b-RadF-M6C13_{}_s{}",
            timestamp.format("%Y/%j/%H"),
            satellite.platform_id()?,
            timestamp.format("%Y%j%H%M")
        ))
    }

    /// Bucket and first object key matching the timestamp, if any
    async fn find_key(
        &self,
        timestamp: DateTime<Utc>,
        satellite: SatellitePattern,
    ) -> ApiResult<Option<(&'static str, String)>> {
        let (Some(bucket), Some(prefix)) = (satellite.s3_bucket(), Self::key_prefix(timestamp, satellite)) else {
            return Ok(None);
        };

        let resp = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(&prefix)
            .send()
            .await
            .map_err(|e| ApiError::ObjectStore(format!("list_objects_v2 {}: {}", prefix, DisplayErrorContext(e))))?;

        let key = resp
            .contents
            .unwrap_or_default()
            .into_iter()
            .filter_map(|obj| obj.key)
            .min();
        Ok(key.map(|key| (bucket, key)))
    }
}

#[async_trait]
impl Store for ArchiveStore {
    fn name(&self) -> &str {
        "S3"
    }

    fn needs_render(&self) -> bool {
        true
    }

    async fn exists(&self, timestamp: DateTime<Utc>, satellite: SatellitePattern) -> ApiResult<bool> {
        Ok(self.find_key(timestamp, satellite).await?.is_some())
    }

    async fn download(
        &self,
        timestamp: DateTime<Utc>,
        satellite: SatellitePattern,
        dest: &Path,
    ) -> ApiResult<PathBuf> {
        let (bucket, key) = self
            .find_key(timestamp, satellite)
            .await?
            .ok_or_else(|| ApiError::NotFound(timestamp.to_rfc3339()))?;

        let obj = match self.client.get_object().bucket(bucket).key(&key).send().await {
            Ok(obj) => obj,
            Err(e) => {
                let err = e.into_service_error();
                if err.is_no_such_key() {
                    return Err(ApiError::NotFound(key));
                }
                return Err(ApiError::ObjectStore(format!("get_object {}: {}", key, DisplayErrorContext(err))));
            }
        };
        let bytes = obj
            .body
            .collect()
            .await
            .map_err(|e| ApiError::ObjectStore(format!("reading {}: {}", key, e)))?
            .into_bytes();

        let raw = dest.with_extension("nc");
        write_file(&raw, &bytes).await?;
        debug!(bucket, key = %key, dest = %raw.display(), bytes = bytes.len(), "Downloaded archive object");
        Ok(raw)
    }
}

async fn write_file(dest: &Path, bytes: &[u8]) -> ApiResult<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(dest, bytes).await?;
    Ok(())
}

/// Runs an external command as `<program> [args..] <input> <output.png>`
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
}

impl CommandRenderer {
    /// Build from a whitespace separated command line
    pub fn from_command_line(command: &str) -> ApiResult<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ApiError::Config("render command is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render(&self, raw: &Path) -> ApiResult<PathBuf> {
        let output = raw.with_extension("png");
        let result = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(raw)
            .arg(&output)
            .output()
            .await
            .map_err(|e| ApiError::Render(format!("failed to run {}: {}", self.program, e)))?;

        if !result.status.success() {
            return Err(ApiError::Render(format!(
                "{} exited with {}: {}",
                self.program,
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        Ok(output)
    }
}

/// Raw-only mode used when no render command is configured.
///
/// Archive downloads stay as NetCDF (`.nc`) next to the rendered images and are
/// cached as found under that path; nothing is converted.
pub struct PassthroughRenderer;

#[async_trait]
impl Renderer for PassthroughRenderer {
    async fn render(&self, raw: &Path) -> ApiResult<PathBuf> {
        Ok(raw.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 15, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_cdn_image_url() {
        let store = CdnStore::new("https://cdn.example.org/".into(), Duration::from_secs(5)).unwrap();
        assert_eq!(
            store.image_url(ts(), SatellitePattern::Goes18).as_deref(),
            Some("https://cdn.example.org/GOES18/ABI/FD/13/20231661230_GOES18-ABI-FD-13-5424x5424.jpg")
        );
        assert_eq!(store.image_url(ts(), SatellitePattern::Generic), None);
    }

    #[test]
    fn test_cdn_download_keeps_jpeg_extension() {
        let dest = Path::new("/data/goes16_20230615_123000_band13.png");
        let local = CdnStore::local_path(dest);
        assert_eq!(local, Path::new("/data/goes16_20230615_123000_band13.jpg"));
        // The saved file is still recognised by the directory scan
        let name = local.file_name().unwrap().to_str().unwrap();
        assert!(crate::utils::is_image_file(&local));
        assert_eq!(
            crate::utils::timestamp_from_filename(name, SatellitePattern::Goes16),
            Some(Utc.with_ymd_and_hms(2023, 6, 15, 12, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_archive_key_prefix() {
        assert_eq!(
            ArchiveStore::key_prefix(ts(), SatellitePattern::Goes16).as_deref(),
            Some("ABI-L1b-RadF/2023/166/12/OR_ABI-L1b-RadF-M6C13_G16_s20231661230")
        );
    }

    #[test]
    fn test_empty_render_command_is_config_error() {
        assert!(matches!(
            CommandRenderer::from_command_line("   "),
            Err(ApiError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_passthrough_renderer() {
        let path = Path::new("/tmp/raw.nc");
        assert_eq!(PassthroughRenderer.render(path).await.unwrap(), path);
    }

    #[tokio::test]
    async fn test_generic_satellite_never_exists_remotely() {
        let cdn = CdnStore::new("http://127.0.0.1:9".into(), Duration::from_secs(1)).unwrap();
        let archive = ArchiveStore::new(Some("http://127.0.0.1:9".into()), Duration::from_secs(1)).await;
        assert!(!cdn.exists(ts(), SatellitePattern::Generic).await.unwrap());
        assert!(!archive.exists(ts(), SatellitePattern::Generic).await.unwrap());
    }
}
