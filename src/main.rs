use clap::Parser;
use oxgate::{
    config::{Config, Overrides},
    server,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env first so clap's env fallbacks see variables
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Attempt to load config before initializing logs to pick up log_level from file
    let cfg_file_res = Config::load_from_file(cli.config.as_deref());
    let cfg_file = match &cfg_file_res {
        Ok(c) => c.clone(),
        Err(_) => Config::default(),
    };

    // Determine log filter precedence: CLI (--log-level / OXGATE_LOG_LEVEL)
    // > RUST_LOG (env) > config.toml log_level > default("info")
    let filter_spec = if let Some(ref lvl) = cli.log_level {
        lvl.clone()
    } else if let Ok(env_spec) = std::env::var("RUST_LOG") {
        env_spec
    } else if let Some(ref lvl) = cfg_file.log_level {
        lvl.clone()
    } else {
        "info".to_string()
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter_spec))
        .compact()
        .init();

    if let Err(e) = cfg_file_res.as_ref() {
        tracing::warn!(error = %format!("{e:?}"), "invalid config; using defaults");
    }

    // Load from config file (if present), then override with CLI/env.
    let cfg = cfg_file.with_overrides(Overrides {
        listen_addr: cli.listen_addr,
        listen_tls: cli.listen_tls,
        listen_unix: cli.listen_unix,
        postgres_url: cli.postgres_url,
        state_dir: cli.state_dir,
        log_level: cli.log_level,
        auth: cli.auth,
        tls_cert_file: cli.tls_cert_file,
        tls_key_file: cli.tls_key_file,
        tls_ca_file: cli.tls_ca_file,
    });
    tracing::info!(listen_addr = %cfg.listen_addr, "starting oxgate");

    if let Err(e) = server::run(cfg).await {
        tracing::error!(error = %format!("{e:?}"), "server terminated with error");
    }

    Ok(())
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "oxgate",
    version,
    about = "MongoDB wire-protocol gateway for document-enabled Postgres"
)]
struct Cli {
    /// Path to config TOML file
    #[arg(short = 'c', long = "config", env = "OXGATE_CONFIG")]
    config: Option<String>,

    /// Listen address for the server (e.g., 127.0.0.1:27017)
    #[arg(long = "listen-addr", env = "OXGATE_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// TLS listen address (e.g., 127.0.0.1:27018)
    #[arg(long = "listen-tls", env = "OXGATE_LISTEN_TLS")]
    listen_tls: Option<String>,

    /// Unix domain socket path
    #[arg(long = "listen-unix", env = "OXGATE_LISTEN_UNIX")]
    listen_unix: Option<String>,

    /// PostgreSQL connection URL for the document backend
    #[arg(long = "postgres-url", env = "OXGATE_POSTGRESQL_URL")]
    postgres_url: Option<String>,

    /// Directory for the persisted state file
    #[arg(long = "state-dir", env = "OXGATE_STATE_DIR")]
    state_dir: Option<String>,

    /// Log level or filter spec (e.g., info or info,oxgate=debug)
    #[arg(long = "log-level", env = "OXGATE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Require SASL authentication before serving commands
    #[arg(long = "auth", env = "OXGATE_AUTH")]
    auth: Option<bool>,

    /// TLS server certificate (PEM)
    #[arg(long = "tls-cert-file", env = "OXGATE_LISTEN_TLS_CERT_FILE")]
    tls_cert_file: Option<String>,

    /// TLS server key (PEM, PKCS#8)
    #[arg(long = "tls-key-file", env = "OXGATE_LISTEN_TLS_KEY_FILE")]
    tls_key_file: Option<String>,

    /// Client CA bundle; enables mutual TLS
    #[arg(long = "tls-ca-file", env = "OXGATE_LISTEN_TLS_CA_FILE")]
    tls_ca_file: Option<String>,
}
