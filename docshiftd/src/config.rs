use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;

use crate::migrate::planner::{DEFAULT_MAX_BATCH_SIZE, LARGE_FILE_THRESHOLD};
use crate::migrate::retry::DEFAULT_MAX_ATTEMPTS;
use crate::migrate::throttle::DEFAULT_MAX_THROTTLE_RETRIES;
use crate::migrate::transfer::TransferConfig;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_PUBLIC_URL: &str = "http://localhost:8080";
const DEFAULT_PAGE_SIZE: u64 = 5000;
const DEFAULT_WORKERS: u64 = 2;
const DEFAULT_QUEUE_VISIBILITY_SECS: u64 = 300;
const DEFAULT_QUEUE_MAX_DELIVERIES: u64 = 5;
const DEFAULT_POLL_MS: u64 = 500;
const DEFAULT_BULK_POLL_MS: u64 = 1000;
const DEFAULT_BULK_MAX_POLLS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthConfig {
    StaticToken(String),
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub public_url: String,
    /// `None` uses the default database under the user data dir.
    pub database_url: Option<String>,
    pub spool_dir: PathBuf,
    pub tenant_url: String,
    pub auth: AuthConfig,
    pub max_batch_size: usize,
    /// `None` disables provider-side bulk copy.
    pub large_file_threshold: Option<u64>,
    pub max_item_attempts: u32,
    pub max_throttle_retries: u32,
    pub page_size: u32,
    pub workers: usize,
    pub queue_visibility: Duration,
    pub queue_max_deliveries: i64,
    pub poll_interval: Duration,
    pub bulk_poll_interval: Duration,
    pub bulk_max_polls: u32,
    pub transfer: TransferConfig,
}

impl ServiceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let read_u64 = |name: &str, default: u64| {
            read(name)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(default)
        };
        let read_bool = |name: &str, default: bool| {
            read(name)
                .map(|value| {
                    matches!(
                        value.trim().to_ascii_lowercase().as_str(),
                        "1" | "true" | "yes" | "on"
                    )
                })
                .unwrap_or(default)
        };

        let bind_addr = read("DOCSHIFT_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .context("DOCSHIFT_BIND_ADDR is not a socket address")?;
        let public_url = read("DOCSHIFT_PUBLIC_URL")
            .unwrap_or_else(|| DEFAULT_PUBLIC_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let tenant_url = read("DOCSHIFT_TENANT_URL").context("DOCSHIFT_TENANT_URL is required")?;
        url::Url::parse(&tenant_url).context("DOCSHIFT_TENANT_URL is not a valid url")?;
        let spool_dir = read("DOCSHIFT_SPOOL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("docshift-spool"));

        let auth = match read("DOCSHIFT_ACCESS_TOKEN") {
            Some(token) => AuthConfig::StaticToken(token),
            None => AuthConfig::ClientCredentials {
                token_url: read("DOCSHIFT_TOKEN_URL").context(
                    "set DOCSHIFT_ACCESS_TOKEN or DOCSHIFT_TOKEN_URL/CLIENT_ID/CLIENT_SECRET",
                )?,
                client_id: read("DOCSHIFT_CLIENT_ID").context("DOCSHIFT_CLIENT_ID is required")?,
                client_secret: read("DOCSHIFT_CLIENT_SECRET")
                    .context("DOCSHIFT_CLIENT_SECRET is required")?,
                scope: read("DOCSHIFT_SCOPE"),
            },
        };

        let large_file_threshold = read_bool("DOCSHIFT_BULK_COPY", true)
            .then(|| read_u64("DOCSHIFT_LARGE_FILE_BYTES", LARGE_FILE_THRESHOLD));
        let transfer = TransferConfig {
            download_concurrency: read_u64("DOCSHIFT_DOWNLOAD_CONCURRENCY", 4) as usize,
            upload_concurrency: read_u64("DOCSHIFT_UPLOAD_CONCURRENCY", 2) as usize,
        };

        Ok(Self {
            bind_addr,
            public_url,
            database_url: read("DOCSHIFT_DATABASE_URL"),
            spool_dir,
            tenant_url,
            auth,
            max_batch_size: read_u64("DOCSHIFT_MAX_BATCH_SIZE", DEFAULT_MAX_BATCH_SIZE as u64)
                as usize,
            large_file_threshold,
            max_item_attempts: read_u64("DOCSHIFT_MAX_ITEM_ATTEMPTS", DEFAULT_MAX_ATTEMPTS.into())
                as u32,
            max_throttle_retries: read_u64(
                "DOCSHIFT_MAX_THROTTLE_RETRIES",
                DEFAULT_MAX_THROTTLE_RETRIES.into(),
            ) as u32,
            page_size: read_u64("DOCSHIFT_PAGE_SIZE", DEFAULT_PAGE_SIZE) as u32,
            workers: read_u64("DOCSHIFT_WORKERS", DEFAULT_WORKERS) as usize,
            queue_visibility: Duration::from_secs(read_u64(
                "DOCSHIFT_QUEUE_VISIBILITY_SECS",
                DEFAULT_QUEUE_VISIBILITY_SECS,
            )),
            queue_max_deliveries: read_u64(
                "DOCSHIFT_QUEUE_MAX_DELIVERIES",
                DEFAULT_QUEUE_MAX_DELIVERIES,
            ) as i64,
            poll_interval: Duration::from_millis(read_u64("DOCSHIFT_POLL_MS", DEFAULT_POLL_MS)),
            bulk_poll_interval: Duration::from_millis(read_u64(
                "DOCSHIFT_BULK_POLL_MS",
                DEFAULT_BULK_POLL_MS,
            )),
            bulk_max_polls: read_u64("DOCSHIFT_BULK_MAX_POLLS", DEFAULT_BULK_MAX_POLLS) as u32,
            transfer,
        })
    }
}
