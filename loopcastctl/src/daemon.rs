//! Wiring for `loopcastctl run`.

use std::sync::Arc;

use loopcast_core::{
    Broadcaster, CatalogCache, CatalogFetcher, CatalogRefresher, LiveProbe, LoopcastConfig,
    SettingsStore, StreamlinkProbe, YtDlpFetcher,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::Result;

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // A second init (e.g. from tests) is harmless.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Runs the catalog refresher and the arbitration loop until Ctrl-C.
pub fn run_daemon(config: LoopcastConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: LoopcastConfig) -> Result<()> {
    let catalog = Arc::new(CatalogCache::new());
    let probe: Arc<dyn LiveProbe> = Arc::new(StreamlinkProbe::new(
        &config.tools.streamlink,
        config.live.clone(),
        None,
    ));
    let cookies = config.cookies_path().filter(|path| path.exists());
    let fetcher: Arc<dyn CatalogFetcher> = Arc::new(YtDlpFetcher::new(
        &config.tools.yt_dlp,
        config.cache_dir(),
        config.catalog.clone(),
        cookies,
        None,
    ));
    let refresher = CatalogRefresher::new(
        Arc::clone(&catalog),
        fetcher,
        SettingsStore::new(config.settings_path()),
        config.cache_dir(),
        config.catalog.refresh_interval(),
    );
    let broadcaster = Broadcaster::new(&config, Arc::clone(&catalog), probe, None);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let refresher_task = tokio::spawn(refresher.run(shutdown_rx.clone()));
    let outcome = broadcaster.run(shutdown_rx).await;
    if outcome.is_err() {
        refresher_task.abort();
    }
    match refresher_task.await {
        Err(error) if !error.is_cancelled() => warn!(%error, "catalog refresher task failed"),
        _ => {}
    }
    outcome?;
    Ok(())
}
