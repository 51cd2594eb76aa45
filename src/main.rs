use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use flvrec::config::Config;
use flvrec::convert;
use flvrec::live::HttpLiveClient;
use flvrec::recorder;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cfg = Arc::new(Config::from_env()?);
    let root = CancellationToken::new();

    let live = Arc::new(HttpLiveClient::new(cfg.upstream_api_base.clone())?);
    let convert = Arc::new(convert::Service::new(&cfg, root.child_token())?);
    let recorder = Arc::new(recorder::Service::new(
        Arc::clone(&cfg),
        live,
        Arc::clone(&convert),
        root.clone(),
    ));

    // The local encoder only runs while no recording is writing to disk.
    let active_source = Arc::clone(&recorder);
    convert
        .register_local_encoder(Arc::new(move || active_source.active_count()))
        .await;
    convert.start().await?;

    log::info!(
        "flvrec ready: output={} database={} max_concurrent={}",
        cfg.output_dir.display(),
        cfg.database_dir.display(),
        cfg.max_concurrent_recordings
    );

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");

    // Stop every active room, then cancel the root scope so schedulers and
    // workers unwind; the queue database closes last.
    for room_id in recorder.list_recording() {
        recorder.stop(room_id);
    }
    root.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    convert.shutdown();

    Ok(())
}
