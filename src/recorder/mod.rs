//! Per-room recording supervisor.
//!
//! Owns the `recording` and `pipes` maps, enforces the concurrency cap,
//! wires the stream reader into the capture pipeline, watches recording
//! duration, recovers dropped streams with bounded retries, and hands
//! finished files to the finalization pipeline.

mod pipe;
mod stats;

pub use stats::Stats;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use pipeline::Pipe;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::convert;
use crate::live::{LiveClient, LiveError};
use crate::stream::{StreamChunk, StreamService};

const PIPELINE_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const RECOVERY_RETRY_DELAY: Duration = Duration::from_secs(15);
const WATCHDOG_TICK: Duration = Duration::from_secs(60);
const PROGRESS_LOG_EVERY_MINUTES: i64 = 30;
const MAINTENANCE_TICK: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Idle,
    Recording,
    Recovering,
}

const STATUS_RECORDING: u8 = 0;
const STATUS_RECOVERING: u8 = 1;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recording already started")]
    AlreadyRecording,
    #[error("maximum concurrent recordings reached")]
    ConcurrencyLimitReached,
    #[error("room {0} not found")]
    RoomNotFound(u64),
    #[error("the room is not live streaming")]
    StreamNotLive,
    #[error("no stream urls available")]
    NoPlayableUrls,
    #[error("all stream urls are unreachable")]
    AllUrlsUnreachable,
    #[error("maximum recording hours reached")]
    MaxRecordingHoursReached,
    #[error("service is shutting down")]
    ServiceStopping,
    #[error("live client error: {0}")]
    Live(LiveError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] pipeline::PipeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runtime state for one active recording session.
pub struct Recorder {
    status: AtomicU8,
    bytes_read: AtomicU64,
    start_time: DateTime<Utc>,
    cancel: CancellationToken,
    output_path: PathBuf,
}

impl Recorder {
    fn new(
        start_time: DateTime<Utc>,
        cancel: CancellationToken,
        output_path: PathBuf,
        carried_bytes: u64,
    ) -> Self {
        Self {
            status: AtomicU8::new(STATUS_RECORDING),
            bytes_read: AtomicU64::new(carried_bytes),
            start_time,
            cancel,
            output_path,
        }
    }

    pub fn status(&self) -> RecordStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_RECOVERING => RecordStatus::Recovering,
            _ => RecordStatus::Recording,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn output_path(&self) -> &PathBuf {
        &self.output_path
    }

    /// Recording -> Recovering, exactly once per outage.
    fn try_begin_recovery(&self) -> bool {
        self.status
            .compare_exchange(
                STATUS_RECORDING,
                STATUS_RECOVERING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

pub(crate) struct Inner {
    pub(crate) cfg: Arc<Config>,
    pub(crate) live: Arc<dyn LiveClient>,
    pub(crate) stream: StreamService,
    pub(crate) convert: Arc<convert::Service>,
    pub(crate) recording: DashMap<u64, Arc<Recorder>>,
    pub(crate) pipes: DashMap<u64, Arc<Pipe<StreamChunk>>>,
    pub(crate) token: CancellationToken,
}

/// The recorder supervisor service.
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    pub fn new(
        cfg: Arc<Config>,
        live: Arc<dyn LiveClient>,
        convert: Arc<convert::Service>,
        token: CancellationToken,
    ) -> Self {
        let inner = Arc::new(Inner {
            cfg,
            live,
            stream: StreamService::new(),
            convert,
            recording: DashMap::new(),
            pipes: DashMap::new(),
            token,
        });
        tokio::spawn(maintenance(Arc::clone(&inner)));
        Self { inner }
    }

    /// Begin recording a room. See [`RecorderError`] for every precondition.
    pub async fn start(&self, room_id: u64) -> Result<(), RecorderError> {
        start_room(&self.inner, room_id).await
    }

    /// Remove and cancel a room's recording. True iff one was present.
    /// Orphaned pipes (present without a recorder) are closed here.
    pub fn stop(&self, room_id: u64) -> bool {
        stop_room(&self.inner, room_id)
    }

    /// How many recordings are currently active. The convert service uses
    /// this to keep the local encoder off the disk while capturing.
    pub fn active_count(&self) -> usize {
        self.inner.recording.len()
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}

async fn start_room(inner: &Arc<Inner>, room_id: u64) -> Result<(), RecorderError> {
    if inner.token.is_cancelled() {
        return Err(RecorderError::ServiceStopping);
    }
    if let Some(recorder) = inner.recording.get(&room_id) {
        if recorder.status() == RecordStatus::Recording {
            return Err(RecorderError::AlreadyRecording);
        }
    }
    if inner.recording.len() >= inner.cfg.max_concurrent_recordings {
        return Err(RecorderError::ConcurrencyLimitReached);
    }

    let info = inner.live.room_info(room_id).await.map_err(|e| match e {
        LiveError::RoomNotFound(id) => RecorderError::RoomNotFound(id),
        other => RecorderError::Live(other),
    })?;
    if !info.is_live {
        return Err(RecorderError::StreamNotLive);
    }

    let urls = inner.live.stream_urls(room_id).await.map_err(|e| match e {
        LiveError::RoomNotFound(id) => RecorderError::RoomNotFound(id),
        other => RecorderError::Live(other),
    })?;
    if urls.is_empty() {
        return Err(RecorderError::NoPlayableUrls);
    }

    let session_token = inner.token.child_token();
    for url in &urls {
        let resp = match inner.live.open_stream(url).await {
            Ok(resp) => resp,
            Err(e) => {
                log::error!("room {room_id}: cannot fetch url: {e}, will try next url");
                continue;
            }
        };
        let rx = inner.stream.read_stream(resp, session_token.clone());
        return prepare(inner, room_id, info.title.as_deref(), rx, session_token).await;
    }

    session_token.cancel();
    log::warn!("room {room_id}: no more url left");
    Err(RecorderError::AllUrlsUnreachable)
}

async fn prepare(
    inner: &Arc<Inner>,
    room_id: u64,
    title: Option<&str>,
    rx: mpsc::Receiver<pool::Lease>,
    session_token: CancellationToken,
) -> Result<(), RecorderError> {
    let start_time = Utc::now();
    let (pipe, output_path) = pipe::new_stream_pipeline(inner, room_id, title, start_time).await?;
    let pipe = Arc::new(pipe);

    let opened = match tokio::time::timeout(PIPELINE_OPEN_TIMEOUT, pipe.open()).await {
        Err(_) => Err(RecorderError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "pipeline open timed out",
        ))),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(())) => Ok(()),
    };
    if let Err(e) = opened {
        pipe.close().await;
        session_token.cancel();
        return Err(e);
    }

    // On recovery the byte counter carries over so stats stay monotonic.
    let carried = inner
        .recording
        .get(&room_id)
        .map(|prior| {
            prior.cancel.cancel();
            prior.bytes_read()
        })
        .unwrap_or(0);

    let recorder = Arc::new(Recorder::new(
        start_time,
        session_token,
        output_path,
        carried,
    ));
    inner.recording.insert(room_id, Arc::clone(&recorder));
    inner.pipes.insert(room_id, Arc::clone(&pipe));

    tokio::spawn(ingest(Arc::clone(inner), room_id, rx, Arc::clone(&recorder), pipe));
    tokio::spawn(watchdog(Arc::clone(inner), room_id, recorder));
    Ok(())
}

fn stop_room(inner: &Arc<Inner>, room_id: u64) -> bool {
    let recorder = inner.recording.remove(&room_id);
    let pipe = inner.pipes.remove(&room_id);

    match recorder {
        Some((_, recorder)) => {
            recorder.cancel.cancel();
            true
        }
        None => {
            log::warn!("recording for room {room_id} not found");
            if let Some((_, pipe)) = pipe {
                log::warn!("found orphaned pipe from room {room_id}, closing it");
                tokio::spawn(async move { pipe.close().await });
            }
            false
        }
    }
}

/// Drains the stream channel into the capture pipeline. On exit the pipeline
/// is closed, finalization is scheduled, and recovery is attempted.
async fn ingest(
    inner: Arc<Inner>,
    room_id: u64,
    mut rx: mpsc::Receiver<pool::Lease>,
    recorder: Arc<Recorder>,
    pipe: Arc<Pipe<StreamChunk>>,
) {
    while let Some(lease) = rx.recv().await {
        recorder
            .bytes_read
            .fetch_add(lease.len() as u64, Ordering::Relaxed);
        if let Err(e) = pipe
            .process(&inner.token, StreamChunk::Raw(lease))
            .await
        {
            log::error!("room {room_id}: error writing data to file: {e}");
            break;
        }
    }

    pipe.close().await;
    tokio::spawn(finalize(Arc::clone(&inner), room_id, Arc::clone(&recorder)));
    recover(inner, room_id).await;
}

/// Stops the recording once the duration cap is hit; logs progress along
/// the way.
async fn watchdog(inner: Arc<Inner>, room_id: u64, recorder: Arc<Recorder>) {
    let max_duration = chrono::Duration::hours(inner.cfg.max_recording_hours as i64);
    let mut tick = tokio::time::interval(WATCHDOG_TICK);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = recorder.cancel.cancelled() => return,
            _ = tick.tick() => {}
        }

        // A replaced or removed recorder means this watchdog's session ended.
        let current = match inner.recording.get(&room_id) {
            Some(entry) if Arc::ptr_eq(entry.value(), &recorder) => Arc::clone(entry.value()),
            _ => return,
        };

        let elapsed = Utc::now() - current.start_time;
        if elapsed >= max_duration {
            log::info!(
                "room {room_id}: maximum recording hours reached ({}m), stopping",
                elapsed.num_minutes()
            );
            stop_room(&inner, room_id);
            return;
        }

        if elapsed.num_minutes() > 0 && elapsed.num_minutes() % PROGRESS_LOG_EVERY_MINUTES == 0 {
            let remaining = max_duration - elapsed;
            log::info!(
                "room {room_id}: recording {}m elapsed, {}m remaining, {} MB",
                elapsed.num_minutes(),
                remaining.num_minutes(),
                current.bytes_read() / 1024 / 1024
            );
        }
    }
}

/// Bounded-retry recovery after the capture loop exits.
///
/// Boxed so the ingest -> recover -> start -> ingest cycle has a finite
/// future type.
fn recover(inner: Arc<Inner>, room_id: u64) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        log::info!("room {room_id}: trying to recover stream capture");
        let Some(recorder) = inner.recording.get(&room_id).map(|r| Arc::clone(r.value())) else {
            log::info!("room {room_id}: recording stopped manually, skipped");
            return;
        };
        if !recorder.try_begin_recovery() {
            log::info!("room {room_id}: stream is recovering, skipped");
            return;
        }

        let max_attempts = inner.cfg.max_recovery_attempts;
        for attempt in 1..=max_attempts {
            match start_room(&inner, room_id).await {
                Ok(()) => {
                    log::info!("room {room_id}: stream recovery succeeded");
                    return;
                }
                Err(e) => {
                    log::error!("room {room_id}: recovery attempt #{attempt} failed: {e}");
                    match e {
                        RecorderError::ConcurrencyLimitReached
                        | RecorderError::MaxRecordingHoursReached => {
                            log::info!("room {room_id}: stop recovery due to: {e}");
                            stop_room(&inner, room_id);
                            return;
                        }
                        RecorderError::StreamNotLive => {
                            log::info!("room {room_id}: stream is offline, will not recover");
                            stop_room(&inner, room_id);
                            return;
                        }
                        _ => {
                            if !inner.recording.contains_key(&room_id) {
                                log::info!(
                                    "room {room_id}: recording removed during retry, will not recover"
                                );
                                return;
                            }
                            if attempt < max_attempts {
                                log::info!("room {room_id}: will retry stream recovery in 15 seconds");
                                tokio::select! {
                                    _ = tokio::time::sleep(RECOVERY_RETRY_DELAY) => {}
                                    _ = inner.token.cancelled() => {
                                        log::info!("room {room_id}: service is stopping, aborting recovery");
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        log::info!(
            "room {room_id}: maximum recovery attempts reached ({max_attempts}), stopping recording"
        );
        stop_room(&inner, room_id);
    })
}

/// Run the finalization pipeline over the finished FLV path.
async fn finalize(inner: Arc<Inner>, room_id: u64, recorder: Arc<Recorder>) {
    let Some(pipe) = pipe::new_final_pipeline(&inner) else {
        log::debug!("room {room_id}: no finalization configured");
        return;
    };
    if let Err(e) = pipe.open().await {
        log::error!("room {room_id}: cannot open final pipeline: {e}");
        return;
    }

    let path = recorder.output_path.to_string_lossy().into_owned();
    match pipe.process(&inner.token, path).await {
        Ok(output) => log::info!("room {room_id}: finalized recording: {output}"),
        Err(e) => log::error!("room {room_id}: cannot process final pipeline: {e}"),
    }
    pipe.close().await;
}

/// Periodic idle/active logging; notices the transition to idle.
async fn maintenance(inner: Arc<Inner>) {
    let mut tick = tokio::time::interval(MAINTENANCE_TICK);
    tick.tick().await;
    let mut last_active = 0usize;
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => return,
            _ = tick.tick() => {}
        }
        let active = inner.recording.len();
        if active == 0 && last_active > 0 {
            log::info!("no ongoing recordings, recorder is idle");
        } else if active > 0 {
            log::debug!("active recordings: {active}");
        }
        last_active = active;
    }
}
