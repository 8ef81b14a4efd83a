//! Pipeline: wires the Sniffer, FlowBuilder, inference pool and
//! DecisionEngine into one running system, and gives `bin/nds.rs` and the
//! `/analyze` route a single `start`/`stop`/`status`/`analyze` surface.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info, warn};

use crate::capture::buffer::PacketBuffer;
use crate::capture::Sniffer;
use crate::config::Config;
use crate::decision::{DecisionEngine, FusionWeights, InferenceOutcome};
use crate::error::{NdsError, Result};
use crate::features::FeatureExtractor;
use crate::flow::FlowBuilder;
use crate::models::{self, ModelBundle};
use crate::persistence::Datastore;
use crate::pubsub::{InProcessPubSub, PubSub};
use crate::reputation::{LocalReputationProvider, ReputationProvider};
use crate::types::{CaptureStatus, Flow, Timestamp};

const FLOW_TASK_POLL_INTERVAL: Duration = Duration::from_millis(200);
const REPUTATION_WINDOW_SECS: u64 = 60;
const REPUTATION_THRESHOLD: usize = 200;

/// A completed flow queued between FlowBuilder and the inference workers.
/// Dropped silently (counted) when the queue is full, per the backpressure
/// design: a slow model must never stall capture.
struct QueuedFlow {
    flow: Flow,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineStatus {
    pub capture: CaptureStatus,
    pub active_flows: usize,
    pub inference_queue_depth: usize,
    pub models_loaded: bool,
    pub threat_score: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelsStatus {
    pub loaded: bool,
    pub missing_artifacts: Vec<String>,
}

pub struct Pipeline {
    config: Config,
    buffer: Arc<PacketBuffer>,
    sniffer: Arc<Sniffer>,
    metrics: Arc<crate::metrics::Metrics>,
    datastore: Arc<Datastore>,
    pubsub: Arc<InProcessPubSub>,
    reputation: Arc<LocalReputationProvider>,
    models: Arc<Option<ModelBundle>>,
    decision_engine: Arc<DecisionEngine>,

    inference_channel: Mutex<Option<(Sender<QueuedFlow>, Receiver<QueuedFlow>)>>,
    inference_queue_capacity: usize,
    workers: ThreadPoolHandle,

    running: Arc<AtomicBool>,
    flow_task: Mutex<Option<JoinHandle<()>>>,
}

/// Thin wrapper so `threadpool::ThreadPool` doesn't leak into the public
/// field list verbatim; also tracks queue depth via the channel length.
struct ThreadPoolHandle(threadpool::ThreadPool);

impl Pipeline {
    pub fn new(config: Config, metrics: Arc<crate::metrics::Metrics>) -> Result<Self> {
        let buffer = Arc::new(PacketBuffer::new(config.capture_buffer_size, metrics.clone()));
        let sniffer = Arc::new(Sniffer::new(config.capture_interface.clone(), buffer.clone(), metrics.clone()));

        let datastore = Arc::new(Datastore::open(&config.data_dir)?);
        let pubsub = Arc::new(InProcessPubSub::new(1024, metrics.clone()));
        let reputation = Arc::new(LocalReputationProvider::new(REPUTATION_WINDOW_SECS, REPUTATION_THRESHOLD));

        let models = Self::load_models(&config.model_dir, config.anomaly_threshold_k, config.min_classification_confidence, &metrics);

        let decision_engine = Arc::new(DecisionEngine::new(
            FusionWeights {
                supervised: config.weight_supervised,
                unsupervised: config.weight_unsupervised,
                reputation: config.weight_reputation,
            },
            config.threshold_attack,
            config.confirmed_attack_confidence,
            config.persist_raw_features,
        ));

        let inference_queue_capacity = config.inference_queue_capacity;
        let workers = ThreadPoolHandle(threadpool::ThreadPool::new(config.inference_workers()));

        Ok(Self {
            config,
            buffer,
            sniffer,
            metrics,
            datastore,
            pubsub,
            reputation,
            models: Arc::new(models),
            decision_engine,
            inference_channel: Mutex::new(Some(bounded(inference_queue_capacity))),
            inference_queue_capacity,
            workers,
            running: Arc::new(AtomicBool::new(false)),
            flow_task: Mutex::new(None),
        })
    }

    fn load_models(dir: &PathBuf, k: f64, min_confidence: f64, metrics: &Arc<crate::metrics::Metrics>) -> Option<ModelBundle> {
        if !models::artifacts_present(dir) {
            warn!("model artifacts missing from {:?}, starting in degraded mode", dir);
            metrics.models_healthy.store(false, Ordering::Relaxed);
            return None;
        }
        match ModelBundle::load(dir, k, min_confidence) {
            Ok(bundle) => {
                metrics.models_healthy.store(true, Ordering::Relaxed);
                Some(bundle)
            }
            Err(e) => {
                error!("failed to load model artifacts, starting in degraded mode: {}", e);
                metrics.models_healthy.store(false, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn pubsub(&self) -> Arc<InProcessPubSub> {
        self.pubsub.clone()
    }

    pub fn metrics(&self) -> Arc<crate::metrics::Metrics> {
        self.metrics.clone()
    }

    /// Starts the capture thread, then the flow-reconstruction task. The
    /// inference workers are already idle in the pool and begin picking up
    /// work the moment anything lands on `inference_tx`.
    pub fn start(&self) -> Result<()> {
        self.sniffer.start()?;
        self.metrics.capture_healthy.store(true, Ordering::Relaxed);
        self.running.store(true, Ordering::SeqCst);

        // A prior stop() closed the previous channel; rebuild a fresh one so
        // restart is safe rather than leaving the pool blocked on a dead rx.
        let (inference_tx, inference_rx) = {
            let mut slot = self.inference_channel.lock().unwrap();
            if slot.is_none() {
                *slot = Some(bounded(self.inference_queue_capacity));
            }
            slot.clone().expect("just populated above")
        };

        let buffer = self.buffer.clone();
        let running = self.running.clone();
        let metrics = self.metrics.clone();
        let idle_timeout = self.config.capture_flow_timeout;
        let hard_cap = self.config.capture_flow_hard_cap;
        let models = self.models.clone();
        let decision_engine = self.decision_engine.clone();
        let datastore = self.datastore.clone();
        let pubsub: Arc<dyn PubSub> = self.pubsub.clone();
        let reputation = self.reputation.clone();
        let workers = self.workers.0.clone();

        let flow_reputation = reputation.clone();
        let handle = std::thread::Builder::new()
            .name("nds-flow".into())
            .spawn(move || {
                let mut builder = FlowBuilder::new(idle_timeout, hard_cap);
                while running.load(Ordering::SeqCst) {
                    let batch = buffer.drain_batch(buffer.capacity());
                    let mut completed = builder.ingest(batch);
                    completed.extend(builder.poll_timeouts(Timestamp::now()));

                    for flow in completed {
                        metrics.flows_completed_total.fetch_add(1, Ordering::Relaxed);
                        flow_reputation.record(flow.initiator.ip);
                        let queued = QueuedFlow { flow };
                        if inference_tx.try_send(queued).is_err() {
                            metrics.inference_queue_drops_total.fetch_add(1, Ordering::Relaxed);
                            warn!("inference queue full, dropping completed flow");
                        }
                    }

                    std::thread::sleep(FLOW_TASK_POLL_INTERVAL);
                }

                // Best-effort: drain whatever is left in the buffer into closed
                // flows so a graceful stop doesn't silently lose in-flight data.
                let remaining = buffer.drain_batch(buffer.capacity());
                let mut leftover = builder.ingest(remaining);
                leftover.extend(builder.poll_timeouts(Timestamp::now()));
                for flow in leftover {
                    let queued = QueuedFlow { flow };
                    let _ = inference_tx.try_send(queued);
                }
            })
            .map_err(|e| NdsError::Flow(e.to_string()))?;

        *self.flow_task.lock().unwrap() = Some(handle);

        // One consumer job per worker: each blocks on the same bounded
        // channel, so `workers.max_count()` flows are fused concurrently and
        // the channel itself (not the pool) is the backpressure point.
        for _ in 0..self.config.inference_workers() {
            let inference_rx = inference_rx.clone();
            let models = models.clone();
            let decision_engine = decision_engine.clone();
            let datastore = datastore.clone();
            let pubsub = pubsub.clone();
            let reputation = reputation.clone();
            workers.execute(move || {
                while let Ok(queued) = inference_rx.recv() {
                    process_one(&queued, &models, &decision_engine, &datastore, pubsub.as_ref(), reputation.as_ref());
                }
            });
        }

        info!("pipeline started");
        Ok(())
    }

    /// Cancellation order: stop capture first so no new packets arrive,
    /// then let the flow task drain the buffer and flush in-flight flows,
    /// then join it. Queued-but-unprocessed flows are left for the worker
    /// pool to finish; the pool itself is never force-killed.
    pub fn stop(&self) {
        self.sniffer.stop();
        self.metrics.capture_healthy.store(false, Ordering::Relaxed);
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.flow_task.lock().unwrap().take() {
            if let Err(e) = handle.join() {
                error!("flow task panicked during shutdown: {:?}", e);
            }
        }

        // Drop both channel handles so the channel closes and the worker
        // loops below return from `recv()` instead of blocking forever;
        // `start()` rebuilds a fresh channel if the pipeline runs again.
        self.inference_channel.lock().unwrap().take();
        self.workers.0.join();
        info!("pipeline stopped");
    }

    pub fn status(&self) -> PipelineStatus {
        let queue_depth = self
            .inference_channel
            .lock()
            .unwrap()
            .as_ref()
            .map(|(_, rx)| rx.len())
            .unwrap_or(0);
        PipelineStatus {
            capture: self.sniffer.status(),
            active_flows: 0,
            inference_queue_depth: queue_depth,
            models_loaded: self.models.is_some(),
            threat_score: self.pubsub.threat_score(),
        }
    }

    pub fn models_status(&self) -> ModelsStatus {
        ModelsStatus {
            loaded: self.models.is_some(),
            missing_artifacts: models::missing_artifacts(&self.config.model_dir),
        }
    }

    pub fn list_interfaces(&self) -> Vec<String> {
        Sniffer::list_interfaces()
    }

    pub fn set_interface(&self, name_or_auto: String) -> Result<()> {
        self.sniffer.set_interface(name_or_auto)
    }

    /// Synchronous, deterministic single-flow inference entry point for the
    /// `/analyze` route: runs the same feature extraction and fusion logic
    /// as the background workers but returns the result instead of
    /// publishing it, so repeated calls on the same flow replay identically.
    pub fn analyze(&self, flow: &Flow) -> Result<InferenceOutcome> {
        let models = self.models.as_ref().as_ref().ok_or_else(|| NdsError::Model("no models loaded, cannot analyze".into()))?;
        build_outcome(flow, models, self.reputation.as_ref())
    }
}

fn build_outcome(flow: &Flow, models: &ModelBundle, reputation: &LocalReputationProvider) -> Result<InferenceOutcome> {
    let raw = FeatureExtractor::extract(flow);
    let prepared = models.preprocessing.transform(&raw);

    let (supervised, unsupervised) = rayon::join(
        || models.supervised.predict(&prepared),
        || models.unsupervised.predict(&prepared),
    );

    Ok(InferenceOutcome {
        flow: flow.clone(),
        supervised: supervised?,
        unsupervised: unsupervised?,
        ip_reputation: reputation.reputation(flow.initiator.ip),
        raw_features: raw.as_slice().to_vec(),
    })
}

fn process_one(
    queued: &QueuedFlow,
    models: &Arc<Option<ModelBundle>>,
    decision_engine: &DecisionEngine,
    datastore: &Datastore,
    pubsub: &dyn PubSub,
    reputation: &LocalReputationProvider,
) {
    let models = match models.as_ref() {
        Some(m) => m,
        None => {
            warn!("no models loaded, skipping inference for flow {}", queued.flow.flow_id);
            return;
        }
    };

    let outcome = match build_outcome(&queued.flow, models, reputation) {
        Ok(o) => o,
        Err(e) => {
            error!("inference failed for flow {}: {}", queued.flow.flow_id, e);
            return;
        }
    };

    if let Err(e) = decision_engine.process(outcome, datastore, pubsub) {
        error!("failed to persist outcome for flow {}: {}", queued.flow.flow_id, e);
    }
}
