//! SyncKit hub server binary.
//!
//! Usage:
//!   synckit-server --port 9090 --storage-provider memory
//!
//! Every flag can also come from the environment (SYNCKIT_*). Exit
//! code 0 on a clean drain, 1 when connections had to be forced closed.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use synckit::auth::HmacIdentityProvider;
use synckit::config::{parse_duration, AwarenessProvider, Config, StorageProvider};
use synckit::health;
use synckit::pubsub::{NoopPubSub, PubSubBus, RedisPubSub};
use synckit::server::SyncServer;
use synckit::storage::{MemoryStorage, RelationalStorage, StorageAdapter};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "synckit-server")]
#[command(about = "Real-time collaborative document sync hub")]
struct Args {
    /// Address to bind the WebSocket listener to
    #[arg(long, env = "SYNCKIT_HOST", default_value = "127.0.0.1")]
    host: String,

    /// WebSocket port
    #[arg(short, long, env = "SYNCKIT_PORT", default_value = "9090")]
    port: u16,

    /// HTTP port for health endpoints
    #[arg(long, env = "SYNCKIT_HTTP_PORT", default_value = "9091")]
    http_port: u16,

    /// HS256 signing secret (>= 32 chars)
    #[arg(long, env = "SYNCKIT_JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Required token issuer
    #[arg(long, env = "SYNCKIT_JWT_ISSUER")]
    jwt_issuer: Option<String>,

    /// Required token audience
    #[arg(long, env = "SYNCKIT_JWT_AUDIENCE")]
    jwt_audience: Option<String>,

    /// Access token lifetime (e.g. 24h)
    #[arg(long, env = "SYNCKIT_JWT_ACCESS_EXPIRES_IN", default_value = "24h")]
    jwt_access_expires_in: String,

    /// Refresh token lifetime (e.g. 7d)
    #[arg(long, env = "SYNCKIT_JWT_REFRESH_EXPIRES_IN", default_value = "7d")]
    jwt_refresh_expires_in: String,

    /// Comma-separated API key allow-list
    #[arg(long, env = "SYNCKIT_API_KEYS", value_delimiter = ',')]
    api_keys: Vec<String>,

    /// Disable authentication (every connection becomes an admin)
    #[arg(long, env = "SYNCKIT_AUTH_DISABLED")]
    no_auth: bool,

    /// Heartbeat interval in milliseconds
    #[arg(long, env = "SYNCKIT_WS_HEARTBEAT_INTERVAL_MS", default_value = "30000")]
    ws_heartbeat_interval_ms: u64,

    /// Heartbeat timeout in milliseconds
    #[arg(long, env = "SYNCKIT_WS_HEARTBEAT_TIMEOUT_MS", default_value = "60000")]
    ws_heartbeat_timeout_ms: u64,

    /// Maximum concurrent connections
    #[arg(long, env = "SYNCKIT_WS_MAX_CONNECTIONS", default_value = "1024")]
    ws_max_connections: usize,

    /// Storage backend: memory | relational
    #[arg(long, env = "SYNCKIT_STORAGE_PROVIDER", default_value = "memory")]
    storage_provider: String,

    /// Postgres connection string for relational storage
    #[arg(long, env = "SYNCKIT_STORAGE_URL")]
    storage_url: Option<String>,

    /// Enable the cross-node pub/sub bus
    #[arg(long, env = "SYNCKIT_PUBSUB_ENABLED")]
    pubsub: bool,

    /// Redis connection string for the pub/sub bus
    #[arg(long, env = "SYNCKIT_PUBSUB_URL")]
    pubsub_url: Option<String>,

    /// Channel prefix on the bus
    #[arg(long, env = "SYNCKIT_PUBSUB_PREFIX", default_value = "synckit:")]
    pubsub_prefix: String,

    /// Awareness backend: memory | external
    #[arg(long, env = "SYNCKIT_AWARENESS_PROVIDER", default_value = "memory")]
    awareness_provider: String,

    /// Shutdown drain deadline in milliseconds
    #[arg(long, env = "SYNCKIT_DRAIN_DEADLINE_MS", default_value = "10000")]
    drain_deadline_ms: u64,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        let mut config = Config::default();
        config.host = self.host;
        config.port = self.port;
        config.http_port = self.http_port;
        config.jwt_secret = self.jwt_secret;
        config.jwt_issuer = self.jwt_issuer;
        config.jwt_audience = self.jwt_audience;
        config.jwt_access_expires_in =
            parse_duration(&self.jwt_access_expires_in).context("jwtAccessExpiresIn")?;
        config.jwt_refresh_expires_in =
            parse_duration(&self.jwt_refresh_expires_in).context("jwtRefreshExpiresIn")?;
        config.api_keys = self.api_keys;
        config.auth_required = !self.no_auth;
        config.ws_heartbeat_interval =
            std::time::Duration::from_millis(self.ws_heartbeat_interval_ms);
        config.ws_heartbeat_timeout =
            std::time::Duration::from_millis(self.ws_heartbeat_timeout_ms);
        config.ws_max_connections = self.ws_max_connections;
        config.storage.provider = self.storage_provider.parse()?;
        config.storage.connection_string = self.storage_url;
        config.pubsub.enabled = self.pubsub;
        config.pubsub.connection_string = self.pubsub_url;
        config.pubsub.channel_prefix = self.pubsub_prefix;
        config.awareness.provider = self.awareness_provider.parse()?;
        config.drain_deadline = std::time::Duration::from_millis(self.drain_deadline_ms);
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let config = args.into_config()?;

    let storage: Arc<dyn StorageAdapter> = match config.storage.provider {
        StorageProvider::Memory => Arc::new(MemoryStorage::new()),
        StorageProvider::Relational => {
            let url = config
                .storage
                .connection_string
                .as_deref()
                .expect("validated");
            Arc::new(
                RelationalStorage::connect(url)
                    .await
                    .context("connecting relational storage")?,
            )
        }
    };

    if config.awareness.provider == AwarenessProvider::External {
        log::warn!("awareness.provider=external is not backed yet; presence stays node-local");
    }

    let identity = Arc::new(HmacIdentityProvider::new(
        config
            .jwt_secret
            .clone()
            .unwrap_or_default()
            .into_bytes(),
        config.jwt_issuer.clone(),
        config.jwt_audience.clone(),
        config.api_keys.clone(),
    ));

    let node_id = uuid::Uuid::new_v4();
    let pubsub: Arc<dyn PubSubBus> = if config.pubsub.enabled {
        let url = config
            .pubsub
            .connection_string
            .as_deref()
            .expect("validated");
        Arc::new(
            RedisPubSub::connect(url, config.pubsub.channel_prefix.clone(), node_id)
                .await
                .context("connecting pub/sub")?,
        )
    } else {
        Arc::new(NoopPubSub::new())
    };

    let http_port = config.http_port;
    let server = Arc::new(SyncServer::new(config, storage, identity, pubsub, node_id));

    tokio::spawn(health::serve(server.clone(), http_port));

    let run_handle = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                log::error!("server loop failed: {e}");
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    log::info!("shutdown signal received");

    let clean = server.shutdown().await;
    run_handle.abort();

    if clean {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
