//! Listener set and process-wide context. Accepts TCP, TLS, and Unix
//! sockets, hands each to a connection task, and drains gracefully on
//! shutdown.

use crate::config::Config;
use crate::conn;
use crate::cursor::{self, CursorRegistry};
use crate::error::{Error, Result};
use crate::pool::PoolRegistry;
use crate::state::{PersistedState, StateFile};
use crate::tls::build_tls_acceptor;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

pub struct AppContext {
    pub config: Config,
    pub cursors: Arc<CursorRegistry>,
    pub pools: PoolRegistry,
    pub persisted: Option<Mutex<(StateFile, PersistedState)>>,
    pub started_at: Instant,
    next_request_id: AtomicI32,
    next_conn_id: AtomicU64,
    open_conns: AtomicI64,
    total_conns: AtomicU64,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let cursors = Arc::new(CursorRegistry::new(Duration::from_secs(
            config.cursor_timeout_secs.unwrap_or(600),
        )));
        let pools = PoolRegistry::new(
            config.postgres_url.clone(),
            config.pool_max_size.unwrap_or(50),
            Duration::from_secs(config.pool_acquire_timeout_secs.unwrap_or(30)),
        );
        let persisted = match &config.state_dir {
            Some(dir) => {
                let (file, state) = StateFile::open(Path::new(dir))?;
                tracing::info!(instance_id = %state.instance_id, "state loaded");
                Some(Mutex::new((file, state)))
            }
            None => None,
        };
        Ok(Arc::new(Self {
            config,
            cursors,
            pools,
            persisted,
            started_at: Instant::now(),
            next_request_id: AtomicI32::new(1),
            next_conn_id: AtomicU64::new(1),
            open_conns: AtomicI64::new(0),
            total_conns: AtomicU64::new(0),
        }))
    }

    pub fn next_request_id(&self) -> i32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn open_connections(&self) -> i64 {
        self.open_conns.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_conns.load(Ordering::Relaxed)
    }

    fn conn_opened(&self) {
        self.open_conns.fetch_add(1, Ordering::Relaxed);
        self.total_conns.fetch_add(1, Ordering::Relaxed);
    }

    fn conn_closed(&self) {
        self.open_conns.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Run until a termination signal arrives, then drain.
pub async fn run(cfg: Config) -> Result<()> {
    let (_app, addr, shutdown, handle) = spawn_with_shutdown(cfg).await?;
    tracing::info!(listen_addr = %addr, "oxgate listening");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Msg(format!("signal handler: {e}")))?;
    tracing::info!("shutdown signal received");
    let _ = shutdown.send(true);

    handle
        .await
        .map_err(|e| Error::Msg(format!("server task: {e}")))?
}

/// Bind all configured listeners and return a handle the caller can stop.
/// Tests lean on the ephemeral-port form of this.
pub async fn spawn_with_shutdown(
    cfg: Config,
) -> Result<(
    Arc<AppContext>,
    SocketAddr,
    watch::Sender<bool>,
    JoinHandle<Result<()>>,
)> {
    cfg.validate()?;
    let app = AppContext::new(cfg)?;

    let tcp = TcpListener::bind(&app.config.listen_addr).await?;
    let addr = tcp.local_addr()?;

    let tls = match &app.config.listen_tls {
        Some(tls_addr) => {
            let acceptor = build_tls_acceptor(&app.config)?;
            let listener = TcpListener::bind(tls_addr).await?;
            tracing::info!(listen_tls = %tls_addr, "TLS listener bound");
            Some((acceptor, listener))
        }
        None => None,
    };

    let unix = match &app.config.listen_unix {
        Some(path) => {
            // A stale socket file from a previous run blocks bind.
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)
                .map_err(|e| Error::Msg(format!("unix bind {path}: {e}")))?;
            tracing::info!(listen_unix = %path, "unix listener bound");
            Some(listener)
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    cursor::spawn_reaper(
        app.cursors.clone(),
        Duration::from_secs(app.config.cursor_sweep_interval_secs.unwrap_or(60)),
        shutdown_rx.clone(),
    );

    if app.config.postgres_url.is_some() {
        record_backend_version(app.clone());
    }

    let handle = tokio::spawn(supervise(app.clone(), tcp, tls, unix, shutdown_rx));
    Ok((app, addr, shutdown_tx, handle))
}

async fn supervise(
    app: Arc<AppContext>,
    tcp: TcpListener,
    tls: Option<(TlsAcceptor, TcpListener)>,
    unix: Option<UnixListener>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut accept_tasks = Vec::new();
    accept_tasks.push(tokio::spawn(accept_tcp(
        app.clone(),
        tcp,
        shutdown.clone(),
    )));
    if let Some((acceptor, listener)) = tls {
        accept_tasks.push(tokio::spawn(accept_tls(
            app.clone(),
            acceptor,
            listener,
            shutdown.clone(),
        )));
    }
    if let Some(listener) = unix {
        accept_tasks.push(tokio::spawn(accept_unix(
            app.clone(),
            listener,
            shutdown.clone(),
        )));
    }

    // Park until shutdown (a dropped sender counts).
    loop {
        if shutdown.changed().await.is_err() || *shutdown.borrow() {
            break;
        }
    }

    // Stop accepting, then let in-flight requests finish up to the deadline.
    for task in &accept_tasks {
        task.abort();
    }
    for task in accept_tasks {
        let _ = task.await;
    }
    let deadline =
        Instant::now() + Duration::from_secs(app.config.drain_timeout_secs.unwrap_or(30));
    while app.open_connections() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let remaining = app.open_connections();
    if remaining > 0 {
        tracing::warn!(remaining, "drain deadline reached; forcing connection closure");
    } else {
        tracing::info!("all connections drained");
    }
    Ok(())
}

async fn accept_tcp(app: Arc<AppContext>, listener: TcpListener, shutdown: watch::Receiver<bool>) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let _ = socket.set_nodelay(true);
                let app = app.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_conn(app, socket, addr.to_string(), shutdown).await;
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn accept_tls(
    app: Arc<AppContext>,
    acceptor: TlsAcceptor,
    listener: TcpListener,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let _ = socket.set_nodelay(true);
                let acceptor = acceptor.clone();
                let app = app.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    match acceptor.accept(socket).await {
                        Ok(stream) => run_conn(app, stream, addr.to_string(), shutdown).await,
                        Err(e) => {
                            tracing::debug!(remote = %addr, error = %e, "TLS handshake failed");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "TLS accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn accept_unix(
    app: Arc<AppContext>,
    listener: UnixListener,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        match listener.accept().await {
            Ok((socket, _addr)) => {
                let app = app.clone();
                let shutdown = shutdown.clone();
                let remote = app
                    .config
                    .listen_unix
                    .clone()
                    .unwrap_or_else(|| "unix".to_string());
                tokio::spawn(async move {
                    run_conn(app, socket, format!("unix:{remote}"), shutdown).await;
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "unix accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn run_conn<S>(
    app: Arc<AppContext>,
    stream: S,
    remote: String,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let conn_id = app.next_conn_id();
    app.conn_opened();
    tracing::debug!(conn_id, remote = %remote, "accepted connection");

    if let Err(e) = conn::serve(stream, app.clone(), conn_id, remote, shutdown).await {
        tracing::error!(conn_id, error = %e, "connection closed with error");
    } else {
        tracing::debug!(conn_id, "connection closed");
    }

    app.cursors.close_for_conn(conn_id).await;
    app.conn_closed();
}

/// Record the backend extension version in the state file, best-effort.
fn record_backend_version(app: Arc<AppContext>) {
    tokio::spawn(async move {
        let client = match app.pools.service_acquire().await {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!(error = %e, "backend version probe skipped");
                return;
            }
        };
        match crate::backend::extension_version(&client).await {
            Ok(version) => {
                tracing::info!(backend_version = %version, "backend reachable");
                if let Some(persisted) = &app.persisted {
                    let mut guard = persisted.lock().await;
                    if guard.1.backend_version.as_deref() != Some(version.as_str()) {
                        guard.1.backend_version = Some(version);
                        let (file, state) = &*guard;
                        if let Err(e) = file.save(state) {
                            tracing::warn!(error = %e, "state save failed");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e.message, "backend version probe failed");
            }
        }
    });
}
