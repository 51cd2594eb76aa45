//! Generic staged processing pipeline.
//!
//! A [`Pipe<T>`] runs an item through an ordered list of processors. Each
//! stage is bounded by a timeout and carries its own error strategy: stop the
//! pipeline, log and continue with the stage's input, or retry a bounded
//! number of times. Items must be cheap to clone; the clone is only taken on
//! the continue/retry paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stage wall time above which a warning is logged.
const SLOW_STAGE_THRESHOLD: Duration = Duration::from_millis(500);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// One node in the chain: a transform or a pass-through side effect.
#[async_trait]
pub trait Processor<T: Send>: Send {
    async fn open(&mut self) -> Result<(), BoxError>;
    async fn process(&mut self, item: T) -> Result<T, BoxError>;
    async fn close(&mut self) -> Result<(), BoxError>;
}

/// What to do when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStrategy {
    /// Propagate the error, aborting the pipeline call.
    Stop,
    /// Log and hand the stage's input unchanged to the next stage.
    Continue,
    /// Sleep `interval` and retry up to `max_retries` times, then propagate.
    Retry {
        max_retries: u32,
        interval: Duration,
    },
}

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("pipeline is closed")]
    Closed,
    #[error("pipeline cancelled")]
    Cancelled,
    #[error("processor {0} timed out")]
    Timeout(String),
    #[error("processor {name} failed: {source}")]
    Stage {
        name: String,
        #[source]
        source: BoxError,
    },
}

/// A processor plus its execution policy.
pub struct ProcessorInfo<T: Send> {
    name: String,
    processor: Mutex<Box<dyn Processor<T>>>,
    strategy: ErrorStrategy,
    timeout: Duration,
    closed: AtomicBool,
}

impl<T: Send> ProcessorInfo<T> {
    pub fn new(name: impl Into<String>, processor: Box<dyn Processor<T>>) -> Self {
        Self {
            name: name.into(),
            processor: Mutex::new(processor),
            strategy: ErrorStrategy::Stop,
            timeout: DEFAULT_TIMEOUT,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if timeout > Duration::ZERO {
            self.timeout = timeout;
        } else {
            log::warn!("invalid timeout for processor {}, using default", self.name);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// One bounded invocation: closed check, cancellation, timeout.
    async fn invoke(&self, token: &CancellationToken, item: T) -> Result<T, PipeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipeError::Closed);
        }
        let mut processor = self.processor.lock().await;
        tokio::select! {
            _ = token.cancelled() => Err(PipeError::Cancelled),
            result = tokio::time::timeout(self.timeout, processor.process(item)) => {
                match result {
                    Err(_) => Err(PipeError::Timeout(self.name.clone())),
                    Ok(Ok(next)) => Ok(next),
                    Ok(Err(source)) => Err(PipeError::Stage {
                        name: self.name.clone(),
                        source,
                    }),
                }
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.processor.lock().await.close().await {
            log::error!("error closing processor {}: {e}", self.name);
        }
    }
}

/// Fixed ordered sequence of processors for items of type `T`.
pub struct Pipe<T: Send> {
    processors: Vec<ProcessorInfo<T>>,
}

impl<T: Clone + Send> Pipe<T> {
    pub fn new(processors: Vec<ProcessorInfo<T>>) -> Self {
        Self { processors }
    }

    /// Stage names in declaration order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.name.as_str()).collect()
    }

    /// Open every processor in declaration order, aborting on first failure.
    pub async fn open(&self) -> Result<(), PipeError> {
        for info in &self.processors {
            if let Err(source) = info.processor.lock().await.open().await {
                return Err(PipeError::Stage {
                    name: info.name.clone(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Run `item` through every stage in order.
    pub async fn process(&self, token: &CancellationToken, item: T) -> Result<T, PipeError> {
        let mut current = item;
        for info in &self.processors {
            if token.is_cancelled() {
                return Err(PipeError::Cancelled);
            }
            current = self.run_stage(info, token, current).await?;
        }
        Ok(current)
    }

    /// Close every processor in declaration order. Idempotent.
    pub async fn close(&self) {
        for info in &self.processors {
            info.close().await;
        }
    }

    async fn run_stage(
        &self,
        info: &ProcessorInfo<T>,
        token: &CancellationToken,
        item: T,
    ) -> Result<T, PipeError> {
        // Stop needs no backup: the error propagates and the item dies with
        // the failing stage.
        let backup = match info.strategy {
            ErrorStrategy::Stop => None,
            _ => Some(item.clone()),
        };

        let started = Instant::now();
        let result = info.invoke(token, item).await;
        let elapsed = started.elapsed();
        if elapsed > SLOW_STAGE_THRESHOLD {
            log::warn!(
                "processor {} took too long to execute: {}ms",
                info.name,
                elapsed.as_millis()
            );
        } else {
            log::debug!("processor {} executed: {}us", info.name, elapsed.as_micros());
        }

        let err = match result {
            Ok(next) => return Ok(next),
            // Closed pipes and external cancellation bypass the strategy.
            Err(e @ (PipeError::Closed | PipeError::Cancelled)) => return Err(e),
            Err(e) => e,
        };

        match info.strategy {
            ErrorStrategy::Stop => Err(err),
            ErrorStrategy::Continue => {
                log::warn!("continuing despite error in processor {}: {err}", info.name);
                Ok(backup.expect("continue strategy keeps a backup"))
            }
            ErrorStrategy::Retry {
                max_retries,
                interval,
            } => {
                let input = backup.expect("retry strategy keeps a backup");
                let mut last = err;
                for _ in 0..max_retries {
                    log::warn!("retrying processor {} due to error: {last}", info.name);
                    tokio::select! {
                        _ = token.cancelled() => return Err(PipeError::Cancelled),
                        _ = tokio::time::sleep(interval) => {}
                    }
                    match info.invoke(token, input.clone()).await {
                        Ok(next) => {
                            log::info!("processor {} succeeded on retry", info.name);
                            return Ok(next);
                        }
                        Err(e @ (PipeError::Closed | PipeError::Cancelled)) => return Err(e),
                        Err(e) => last = e,
                    }
                }
                log::error!(
                    "processor {} failed after {} retries",
                    info.name,
                    max_retries
                );
                Err(last)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    struct Doubler;

    #[async_trait]
    impl Processor<u64> for Doubler {
        async fn open(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
        async fn process(&mut self, item: u64) -> Result<u64, BoxError> {
            Ok(item * 2)
        }
        async fn close(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Processor<u64> for Flaky {
        async fn open(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
        async fn process(&mut self, item: u64) -> Result<u64, BoxError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err("transient failure".into())
            } else {
                Ok(item + 1)
            }
        }
        async fn close(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
    }

    struct FailOpen;

    #[async_trait]
    impl Processor<u64> for FailOpen {
        async fn open(&mut self) -> Result<(), BoxError> {
            Err("no disk".into())
        }
        async fn process(&mut self, item: u64) -> Result<u64, BoxError> {
            Ok(item)
        }
        async fn close(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
    }

    struct Slow;

    #[async_trait]
    impl Processor<u64> for Slow {
        async fn open(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
        async fn process(&mut self, item: u64) -> Result<u64, BoxError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(item)
        }
        async fn close(&mut self) -> Result<(), BoxError> {
            Ok(())
        }
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn stages_run_in_order() {
        let pipe = Pipe::new(vec![
            ProcessorInfo::new("double", Box::new(Doubler)),
            ProcessorInfo::new("flaky-none", Box::new(Flaky {
                failures: 0,
                calls: Arc::new(AtomicU32::new(0)),
            })),
        ]);
        pipe.open().await.unwrap();
        let out = pipe.process(&token(), 10).await.unwrap();
        assert_eq!(out, 21);
        pipe.close().await;
    }

    #[tokio::test]
    async fn stop_strategy_propagates_error() {
        let pipe = Pipe::new(vec![ProcessorInfo::new(
            "always-fails",
            Box::new(Flaky {
                failures: u32::MAX,
                calls: Arc::new(AtomicU32::new(0)),
            }),
        )]);
        pipe.open().await.unwrap();
        let err = pipe.process(&token(), 1).await.unwrap_err();
        assert!(matches!(err, PipeError::Stage { .. }));
    }

    #[tokio::test]
    async fn continue_strategy_passes_input_through() {
        let pipe = Pipe::new(vec![
            ProcessorInfo::new(
                "always-fails",
                Box::new(Flaky {
                    failures: u32::MAX,
                    calls: Arc::new(AtomicU32::new(0)),
                }),
            )
            .with_strategy(ErrorStrategy::Continue),
            ProcessorInfo::new("double", Box::new(Doubler)),
        ]);
        pipe.open().await.unwrap();
        // The failing stage is skipped; its input reaches the doubler.
        assert_eq!(pipe.process(&token(), 5).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn retry_strategy_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let pipe = Pipe::new(vec![ProcessorInfo::new(
            "flaky",
            Box::new(Flaky {
                failures: 2,
                calls: Arc::clone(&calls),
            }),
        )
        .with_strategy(ErrorStrategy::Retry {
            max_retries: 3,
            interval: Duration::from_millis(1),
        })]);
        pipe.open().await.unwrap();
        assert_eq!(pipe.process(&token(), 7).await.unwrap(), 8);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_strategy_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let pipe = Pipe::new(vec![ProcessorInfo::new(
            "hopeless",
            Box::new(Flaky {
                failures: u32::MAX,
                calls: Arc::clone(&calls),
            }),
        )
        .with_strategy(ErrorStrategy::Retry {
            max_retries: 2,
            interval: Duration::from_millis(1),
        })]);
        pipe.open().await.unwrap();
        assert!(pipe.process(&token(), 7).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn open_failure_aborts() {
        let pipe = Pipe::new(vec![
            ProcessorInfo::new("bad", Box::new(FailOpen)),
            ProcessorInfo::new("double", Box::new(Doubler)),
        ]);
        assert!(pipe.open().await.is_err());
    }

    #[tokio::test]
    async fn closed_pipe_rejects_process() {
        let pipe = Pipe::new(vec![ProcessorInfo::new("double", Box::new(Doubler))]);
        pipe.open().await.unwrap();
        pipe.close().await;
        // Double close is a no-op.
        pipe.close().await;
        let err = pipe.process(&token(), 1).await.unwrap_err();
        assert!(matches!(err, PipeError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn stage_timeout_fires() {
        let pipe = Pipe::new(vec![ProcessorInfo::new("slow", Box::new(Slow))
            .with_timeout(Duration::from_millis(50))]);
        pipe.open().await.unwrap();
        let err = pipe.process(&token(), 1).await.unwrap_err();
        assert!(matches!(err, PipeError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_processing() {
        let cancel = token();
        cancel.cancel();
        let pipe = Pipe::new(vec![ProcessorInfo::new("double", Box::new(Doubler))]);
        pipe.open().await.unwrap();
        let err = pipe.process(&cancel, 1).await.unwrap_err();
        assert!(matches!(err, PipeError::Cancelled));
    }
}
