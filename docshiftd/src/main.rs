use std::sync::Arc;

use anyhow::Context;
use docshift_core::TokenClient;
use docshiftd::api::{self, ApiState};
use docshiftd::config::{AuthConfig, ServiceConfig};
use docshiftd::migrate::MigrationEngine;
use docshiftd::migrate::executor::CopyExecutor;
use docshiftd::migrate::planner::BatchPolicy;
use docshiftd::migrate::throttle::Throttler;
use docshiftd::migrate::transfer::TransferClient;
use docshiftd::remote::{BulkCopier, SiteConnector};
use docshiftd::storage::StateStore;
use docshiftd::token_provider::TokenCache;
use docshiftd::worker::{Worker, WorkerSettings};
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    ApiOnly,
    WorkerOnly,
    Help,
}

impl CliMode {
    fn serves_api(self) -> bool {
        matches!(self, CliMode::Run | CliMode::ApiOnly)
    }

    fn runs_workers(self) -> bool {
        matches!(self, CliMode::Run | CliMode::WorkerOnly)
    }
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--api-only" => mode = CliMode::ApiOnly,
            "--worker-only" => mode = CliMode::WorkerOnly,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn token_cache(auth: &AuthConfig) -> anyhow::Result<TokenCache> {
    Ok(match auth {
        AuthConfig::StaticToken(token) => TokenCache::with_static_token(token.clone()),
        AuthConfig::ClientCredentials {
            token_url,
            client_id,
            client_secret,
            scope,
        } => {
            let client = TokenClient::new(token_url, client_id.clone(), client_secret.clone())
                .context("invalid token endpoint")?;
            TokenCache::with_client_credentials(client, scope.clone())
        }
    })
}

async fn open_store(config: &ServiceConfig) -> anyhow::Result<StateStore> {
    let store = match &config.database_url {
        Some(url) => StateStore::new(url).await,
        None => StateStore::new_default().await,
    };
    store.context("failed to open state store")
}

fn spawn_workers(
    config: &ServiceConfig,
    store: &StateStore,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let tokens = Arc::new(token_cache(&config.auth)?);
    let connector = SiteConnector::new(tokens, Throttler::new(config.max_throttle_retries));
    let engine = MigrationEngine::new(
        BatchPolicy {
            max_batch_size: config.max_batch_size,
            large_file_threshold: config.large_file_threshold,
        },
        CopyExecutor::new(config.max_item_attempts),
    );
    let transfer = TransferClient::with_config(config.transfer);
    let bulk = Arc::new(BulkCopier::new(
        connector.clone(),
        config.bulk_poll_interval,
        config.bulk_max_polls,
    ));
    let worker = Worker::new(
        store.clone(),
        connector,
        engine,
        transfer,
        bulk,
        WorkerSettings {
            tenant_url: config.tenant_url.clone(),
            spool_dir: config.spool_dir.clone(),
            page_size: config.page_size,
            visibility: config.queue_visibility,
            max_deliveries: config.queue_max_deliveries,
            poll_interval: config.poll_interval,
        },
    );

    info!(workers = config.workers, "starting queue workers");
    Ok((0..config.workers)
        .map(|_| tokio::spawn(worker.clone().run()))
        .collect())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("docshiftd=info,docshift_core=info")),
        )
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: docshiftd [--api-only | --worker-only]");
        println!("  --api-only      Serve the HTTP API without queue workers");
        println!("  --worker-only   Run queue workers without the HTTP API");
        return Ok(());
    }

    let config = ServiceConfig::from_env()?;
    let store = open_store(&config).await?;

    let workers = if mode.runs_workers() {
        spawn_workers(&config, &store)?
    } else {
        Vec::new()
    };

    let server = if mode.serves_api() {
        let state = Arc::new(ApiState {
            store: store.clone(),
            public_url: config.public_url.clone(),
            tenant_url: config.tenant_url.clone(),
        });
        let listener = tokio::net::TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.bind_addr))?;
        info!(addr = %config.bind_addr, "serving HTTP API");
        Some(tokio::spawn(async move {
            axum::serve(listener, api::router(state)).await
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed waiting for shutdown signal")?;
    info!("shutting down");

    for handle in workers {
        handle.abort();
    }
    if let Some(handle) = server {
        handle.abort();
    }
    Ok(())
}
