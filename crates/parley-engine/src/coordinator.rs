//! Owns every per-thread registry and the background loops that connect
//! them: the batch consumer and the idle sweeper.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::events::RawEvent;
use parley_core::ids::ThreadId;
use parley_core::transport::Transport;
use parley_llm::GatewayStats;

use crate::buffer::{IngestBuffer, IngestConfig};
use crate::cancel::CancelRegistry;
use crate::error::EngineError;
use crate::pipeline::Pipeline;

pub struct Coordinator {
    buffer: Arc<IngestBuffer>,
    cancel: Arc<CancelRegistry>,
    pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build the ingest buffer and start the background loops.
    pub fn start(
        pipeline: Arc<Pipeline>,
        cancel: Arc<CancelRegistry>,
        transport: Arc<dyn Transport>,
        ingest: IngestConfig,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        let (buffer, mut batches) = IngestBuffer::new(cancel.clone(), transport, ingest);
        let shutdown = CancellationToken::new();

        let consumer = {
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let batch = tokio::select! {
                        biased;
                        () = shutdown.cancelled() => break,
                        batch = batches.recv() => match batch {
                            Some(batch) => batch,
                            None => break,
                        },
                    };
                    // Register before spawning so tasks start in batch order.
                    let task = cancel.start_task(&batch.thread_id);
                    let pipeline = pipeline.clone();
                    tokio::spawn(async move {
                        let _ = pipeline.run_started(batch, task).await;
                    });
                }
                debug!("batch consumer stopped");
            })
        };

        let sweeper = {
            let buffer = buffer.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(sweep_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // the first tick completes immediately
                interval.tick().await;
                loop {
                    tokio::select! {
                        biased;
                        () = shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            buffer.evict_idle(Instant::now());
                        }
                    }
                }
                debug!("idle sweeper stopped");
            })
        };

        info!(sweep_interval_ms = sweep_interval.as_millis() as u64, "coordinator started");
        Arc::new(Self {
            buffer,
            cancel,
            pipeline,
            shutdown,
            loops: Mutex::new(vec![consumer, sweeper]),
        })
    }

    /// Accept an inbound event. Pre-empts the thread's running generation.
    pub fn push(&self, raw: RawEvent) {
        self.buffer.push(raw);
    }

    /// Cancel the thread's generation, if any. Idempotent.
    pub fn abort(&self, thread_id: &ThreadId) -> bool {
        self.cancel.abort(thread_id)
    }

    pub fn clear_history(&self, thread_id: &ThreadId) -> Result<usize, EngineError> {
        self.cancel.abort(thread_id);
        self.cancel.take_pending(thread_id);
        Ok(self.pipeline.history().clear(thread_id)?)
    }

    pub fn thread_count(&self) -> usize {
        self.buffer.thread_count()
    }

    pub fn active_generations(&self) -> usize {
        self.cancel.active_count()
    }

    pub fn gateway_stats(&self) -> GatewayStats {
        self.pipeline.gateway().stats()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop accepting batches, cancel running generations, and wait for the
    /// background loops to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.buffer.close();
        let aborted = self.cancel.abort_all();
        let loops: Vec<_> = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }
        info!(aborted, "coordinator stopped");
    }
}
