use anyhow::Context;
use livecast_core::StreamConfig;
use livecast_stream::{
    hls::{HlsServer, HlsState, SegmentStore},
    media::mpegts::{TsSink, TsSource},
    rtsp::RtspServer,
    stats::{spawn_stats_logger, Stats},
    storage::FileStorage,
    IngestPipeline, RunOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Wires storage, listeners, the stats logger and the ingest task together
pub struct LivecastServer {
    config: Arc<StreamConfig>,
    ffmpeg_path: String,
}

impl LivecastServer {
    pub fn new(config: StreamConfig, ffmpeg_path: String) -> Self {
        Self {
            config: Arc::new(config),
            ffmpeg_path,
        }
    }

    /// Start everything and block until ingest ends or a shutdown signal
    ///
    /// A fatal ingest error is returned after the listeners have been
    /// stopped, so the process exits non-zero.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = self.config;

        // 1. Segment directory, cleared of segments from a previous run
        let storage = Arc::new(FileStorage::new(config.hls.output_path.clone()));
        storage.ensure_root().await.with_context(|| {
            format!(
                "Failed to create output directory {}",
                config.hls.output_path.display()
            )
        })?;
        let removed = storage.remove_segments().await?;
        if removed > 0 {
            info!("Removed {} stale segment(s)", removed);
        }

        let store = Arc::new(SegmentStore::new(config.hls.retained_segments(), storage));
        let stats = Arc::new(Stats::new());
        let cancel = CancellationToken::new();
        let mut listeners: Vec<(CancellationToken, JoinHandle<()>)> = Vec::new();

        // 2. HLS delivery
        if config.features.enable_hls {
            let state = HlsState::new(&config, store.clone(), stats.clone())
                .context("Failed to load player template")?;
            let listener = TcpListener::bind(config.hls_address())
                .await
                .with_context(|| format!("Failed to bind HLS address {}", config.hls_address()))?;
            let server = HlsServer::new(config.hls_address(), state);
            let token = server.shutdown_token();
            let handle = tokio::spawn(async move {
                if let Err(e) = server.serve(listener).await {
                    error!("HLS server error: {}", e);
                }
            });
            listeners.push((token, handle));
        }

        // 3. RTSP control endpoint
        if config.features.enable_rtsp {
            let listener = TcpListener::bind(config.rtsp_address())
                .await
                .with_context(|| format!("Failed to bind RTSP address {}", config.rtsp_address()))?;
            let server = RtspServer::new(config.rtsp_address(), config.server.max_connections);
            let token = server.shutdown_token();
            let handle = tokio::spawn(async move {
                if let Err(e) = server.serve(listener).await {
                    error!("RTSP server error: {}", e);
                }
            });
            listeners.push((token, handle));
        }

        // 4. Periodic stats line
        let stats_logger = config.features.enable_stats.then(|| {
            spawn_stats_logger(stats.clone(), STATS_LOG_INTERVAL, cancel.child_token())
        });

        // 5. Ingest
        let pipeline = IngestPipeline::new(config.clone(), stats, store);
        let source = TsSource::new().with_ffmpeg_path(self.ffmpeg_path);
        let ingest_cancel = cancel.child_token();
        let mut ingest = tokio::spawn(async move {
            pipeline
                .run(&source, Arc::new(TsSink), ingest_cancel)
                .await
        });

        info!("All components started");

        let joined = tokio::select! {
            joined = &mut ingest => joined,
            () = shutdown_signal() => {
                info!("Shutdown signal received, finishing the open segment...");
                cancel.cancel();
                ingest.await
            }
        };

        // Stop listeners; in-flight HTTP requests are drained
        cancel.cancel();
        for (token, _) in &listeners {
            token.cancel();
        }
        for (_, handle) in listeners {
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("Listener did not stop within {}s", DRAIN_TIMEOUT.as_secs());
            }
        }
        if let Some(handle) = stats_logger {
            let _ = handle.await;
        }

        match joined {
            Ok(Ok(RunOutcome::EndOfStream)) => {
                info!("Source ended, shut down");
                Ok(())
            }
            Ok(Ok(RunOutcome::Cancelled)) => {
                info!("Shut down gracefully");
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("Ingest failed")),
            Err(e) => Err(anyhow::anyhow!("Ingest task aborted: {e}")),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
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
