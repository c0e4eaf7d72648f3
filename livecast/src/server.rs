use anyhow::{Context, Result};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use livecast_api::{create_router, AppState};
use livecast_core::Config;
use livecast_sfu::{
    LoopbackEngine, MemoryMessageStore, RoomRegistry, SfuConfig, WorkerPool, WorkerSettings,
};

use crate::tls;

const STATS_INTERVAL: Duration = Duration::from_secs(60);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct LivecastServer {
    config: Config,
    pool: Arc<WorkerPool>,
    registry: Arc<RoomRegistry>,
}

impl LivecastServer {
    /// Start the media workers and build the room registry
    pub async fn start(config: Config) -> Result<Self> {
        let engine = LoopbackEngine::new();
        let settings = WorkerSettings {
            rtc_min_port: config.media.rtc_min_port,
            rtc_max_port: config.media.rtc_max_port,
        };
        let worker_count = config.worker_count();
        let pool = Arc::new(
            WorkerPool::start(&engine, worker_count, &settings)
                .await
                .context("Failed to start media workers")?,
        );
        info!(workers = pool.len(), "Media worker pool started");

        let sfu_config = SfuConfig {
            max_peers_per_room: config.signaling.max_peers_per_room,
            listen_ip: config.media.listen_ip.clone(),
            announced_ip: config.media.announced_ip.clone(),
            ..SfuConfig::default()
        };
        let registry = RoomRegistry::new(
            sfu_config,
            Arc::clone(&pool),
            Arc::new(MemoryMessageStore::new()),
        );

        Ok(Self {
            config,
            pool,
            registry,
        })
    }

    /// Serve HTTP/WebSocket until a shutdown signal or a media worker death
    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let stats_task = self
            .registry
            .spawn_stats_task(STATS_INTERVAL, shutdown.clone());

        let mut http_handle = self.spawn_http(shutdown.clone()).await?;
        info!("Server started successfully");

        let outcome = tokio::select! {
            death = self.pool.wait_for_worker_death() => {
                let grace = Duration::from_millis(self.config.media.worker_death_grace_ms);
                error!(
                    worker_id = %death.worker_id,
                    reason = %death.reason,
                    grace_ms = grace.as_millis(),
                    "Media worker died, exiting"
                );
                tokio::time::sleep(grace).await;
                Err(anyhow::anyhow!("media worker {} died: {}", death.worker_id, death.reason))
            }
            result = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
                match result {
                    Ok(Ok(())) => Err(anyhow::anyhow!("HTTP server stopped")),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {e}")),
                }
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                Ok(())
            }
        };

        shutdown.cancel();
        self.shutdown(http_handle, stats_task).await;
        outcome
    }

    async fn shutdown(&self, http_handle: JoinHandle<Result<()>>, stats_task: JoinHandle<()>) {
        info!(rooms = self.registry.room_count(), "Shutting down Livecast server...");

        self.registry.close_all().await;
        if !http_handle.is_finished()
            && tokio::time::timeout(DRAIN_TIMEOUT, http_handle).await.is_err()
        {
            warn!("HTTP server did not drain within {:?}", DRAIN_TIMEOUT);
        }
        let _ = stats_task.await;
        self.pool.close().await;

        info!("Livecast server shut down");
    }

    async fn spawn_http(&self, shutdown: CancellationToken) -> Result<JoinHandle<Result<()>>> {
        let address = self.config.listen_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind {address}"))?;

        let mut state = AppState::new(Arc::clone(&self.registry));
        state.peer_queue_capacity = self.config.signaling.peer_queue_capacity;
        state.max_message_size = self.config.server.max_message_size;
        let app = create_router(state);

        let handle = if let Some((cert, key)) = self.config.tls_paths() {
            let acceptor = tls::acceptor(cert, key)?;
            info!("HTTPS/WSS server listening on {}", address);
            tokio::spawn(serve_tls(listener, acceptor, app, shutdown))
        } else {
            info!("HTTP/WS server listening on {}", address);
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
                    .context("HTTP server error")
            })
        };
        Ok(handle)
    }
}

/// Accept loop for the TLS listener
async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, remote) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%remote, error = %e, "TLS handshake failed");
                    return;
                }
            };
            if let Err(e) = ConnectionBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                debug!(%remote, error = %e, "TLS connection closed with error");
            }
        });
    }
    info!("HTTPS server stopped accepting connections");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
