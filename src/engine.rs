//! The embeddable engine handle.
//!
//! An [`Engine`] wires the transport, stream registry, concurrency limiter,
//! batch queue, multiplexer, model manager, lifecycle manager, and feature
//! flags together from one [`KilnConfig`]. Embedders drive generations
//! through it and shut the whole stack down with one call.

use std::{sync::Arc, time::Duration};

use serde_json::{Value, json};
use snafu::{ResultExt, Snafu};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    batch::{BatchError, BatchQueue, OpsMultiplexer, Priority},
    config::{ConfigError, KilnConfig},
    flags::FeatureFlags,
    limiter::ConcurrencyLimiter,
    models::{DraftReport, LifecycleManager, LifecycleMetrics, ModelError, ModelManager, UsageGuard},
    rpc::{RequestOptions, RpcTransport, StreamChunk, StreamStats, TransportError},
    streams::{PoolStats, RegisterError, RegisteredStream, StreamError, StreamOptions, StreamRegistry},
};

#[derive(Debug, Snafu)]
pub enum EngineError {
    #[snafu(display("invalid configuration: {source}"))]
    Config { source: ConfigError },
    #[snafu(display("transport failure: {source}"))]
    Transport { source: TransportError },
    #[snafu(display("model operation failed: {source}"))]
    Model { source: ModelError },
    #[snafu(display("stream registration failed: {source}"))]
    Register { source: RegisterError },
    #[snafu(display("batched call failed: {source}"))]
    Batch { source: BatchError },
}

/// Parameters for one generation.
#[derive(Debug)]
pub struct GenerateRequest {
    /// Stream id; generated when absent.
    pub stream_id: Option<String>,
    pub model_id: String,
    pub prompt: String,
    /// Extra generation parameters forwarded verbatim (temperature, seed,
    /// max tokens, and whatever else the runtime understands).
    pub params: Value,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    pub tenant: Option<String>,
}

impl GenerateRequest {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            stream_id: None,
            model_id: model_id.into(),
            prompt: prompt.into(),
            params: Value::Null,
            timeout: None,
            cancel: None,
            tenant: None,
        }
    }
}

/// A running generation. Holds the model's usage guard, so dropping this
/// handle releases the model for draining.
#[derive(Debug)]
pub struct ActiveGeneration {
    stream: RegisteredStream,
    _usage: UsageGuard,
}

impl ActiveGeneration {
    pub fn stream_id(&self) -> &str {
        self.stream.stream_id()
    }

    pub fn chunks_mut(&mut self) -> &mut mpsc::UnboundedReceiver<StreamChunk> {
        self.stream.chunks_mut()
    }

    /// Waits for the terminal outcome, discarding any unread chunks.
    pub async fn await_completion(self) -> Result<StreamStats, StreamError> {
        self.stream.await_completion().await
    }
}

/// Summary health view of the engine.
#[derive(Clone, Debug)]
pub struct HealthReport {
    pub runtime_reachable: bool,
    pub active_streams: usize,
    pub effective_stream_limit: usize,
    pub loaded_models: usize,
    pub chunk_pool: PoolStats,
}

pub struct Engine {
    config: KilnConfig,
    transport: Arc<RpcTransport>,
    registry: StreamRegistry,
    batch: BatchQueue,
    multiplexer: OpsMultiplexer,
    models: ModelManager,
    lifecycle: LifecycleManager,
    flags: FeatureFlags,
    background: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Builds the full stack over a connected transport. Must run inside a
    /// runtime; warmup loads start in the background.
    pub fn new(config: KilnConfig, transport: Arc<RpcTransport>) -> Result<Self, EngineError> {
        config.validate().context(ConfigSnafu)?;

        let limiter = ConcurrencyLimiter::new(&config.model_concurrency_limiter);
        let registry = StreamRegistry::new(config.stream_registry.clone(), limiter);
        registry.start();
        registry.attach(&transport);

        let dispatcher: Arc<dyn crate::batch::BatchDispatcher> =
            Arc::clone(&transport) as Arc<dyn crate::batch::BatchDispatcher>;
        let batch = BatchQueue::new(config.batch_queue.clone(), Arc::clone(&dispatcher));
        let multiplexer = OpsMultiplexer::new(config.ops_multiplexer.clone(), dispatcher);

        let (models, model_events) = ModelManager::new(Arc::clone(&transport), config.model.clone());
        let lifecycle = LifecycleManager::new(models.clone(), &config.model);
        let lifecycle_task = lifecycle.run(model_events);

        let warmup_task = {
            let models = models.clone();
            tokio::spawn(async move { models.warmup().await })
        };

        let flags = FeatureFlags::new(config.feature_flags.clone()).context(ConfigSnafu)?;

        Ok(Self {
            config,
            transport,
            registry,
            batch,
            multiplexer,
            models,
            lifecycle,
            flags,
            background: vec![lifecycle_task, warmup_task],
        })
    }

    /// Starts a generation: ensures the model is loaded, registers the
    /// stream (acquiring its concurrency slot), and issues `generate`.
    pub async fn generate(
        &self,
        request: GenerateRequest,
    ) -> Result<ActiveGeneration, EngineError> {
        self.models
            .load_model(&request.model_id)
            .await
            .context(ModelSnafu)?;
        let usage = self.models.mark_used(&request.model_id).context(ModelSnafu)?;

        let stream_id = request
            .stream_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let timeout = request
            .timeout
            .unwrap_or_else(|| self.config.stream_registry.default_timeout());

        let stream = self
            .registry
            .register(
                &stream_id,
                StreamOptions {
                    model_id: Some(request.model_id.clone()),
                    tenant: request.tenant.clone(),
                    timeout: Some(timeout),
                    cancel: request.cancel.clone(),
                },
            )
            .await
            .context(RegisterSnafu)?;

        let mut params = json!({
            "stream_id": stream_id,
            "model_id": request.model_id,
            "prompt": request.prompt,
        });
        if let (Some(target), Some(extra)) = (params.as_object_mut(), request.params.as_object()) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }

        // The generate response may not arrive until the stream ends; the
        // stream's own timeout bounds the wait. A rejected request fails
        // the stream instead of leaving it to time out.
        let transport = Arc::clone(&self.transport);
        let registry = self.registry.clone();
        let cancel = request.cancel;
        let rpc_stream_id = stream_id.clone();
        tokio::spawn(async move {
            let options = RequestOptions {
                timeout: Some(timeout),
                cancel,
            };
            if let Err(error) = transport.request("generate", params, options).await {
                match error {
                    // Cancellation already has its own terminal path.
                    TransportError::Cancelled { .. } => {}
                    error => registry.fail(&rpc_stream_id, &error.to_string()),
                }
            }
        });

        Ok(ActiveGeneration {
            stream,
            _usage: usage,
        })
    }

    /// Tokenizes through the multiplexer or batch queue when enabled,
    /// falling back to a direct call.
    pub async fn tokenize(&self, model_id: &str, text: &str) -> Result<Value, EngineError> {
        let params = json!({ "model_id": model_id, "text": text });

        if let Some(rx) = self.multiplexer.try_request(
            "tokenize",
            model_id,
            params.clone(),
            &RequestOptions::default(),
        ) {
            return rx
                .await
                .unwrap_or(Err(BatchError::Shutdown))
                .context(BatchSnafu);
        }
        if self.config.batch_queue.enabled {
            return self
                .batch
                .submit("tokenize", model_id, params, Priority::Normal)
                .await
                .context(BatchSnafu);
        }
        self.transport
            .request("tokenize", params, RequestOptions::default())
            .await
            .context(TransportSnafu)
    }

    pub async fn load_model(&self, model_id: &str) -> Result<(), EngineError> {
        self.models.load_model(model_id).await.context(ModelSnafu)
    }

    pub async fn unload_model(&self, model_id: &str) -> Result<(), EngineError> {
        self.models.unload_model(model_id).await.context(ModelSnafu)
    }

    pub async fn check_draft(
        &self,
        primary: &str,
        draft: &str,
    ) -> Result<DraftReport, EngineError> {
        self.models
            .check_draft(primary, draft)
            .await
            .context(ModelSnafu)
    }

    pub async fn health_check(&self) -> HealthReport {
        let runtime_reachable = if self.transport.is_closed() {
            false
        } else {
            self.transport
                .request(
                    "runtime/state",
                    Value::Null,
                    RequestOptions {
                        timeout: Some(Duration::from_secs(2)),
                        cancel: None,
                    },
                )
                .await
                .is_ok()
        };

        HealthReport {
            runtime_reachable,
            active_streams: self.registry.active_count(),
            effective_stream_limit: self.registry.effective_limit(),
            loaded_models: self.models.loaded_models().len(),
            chunk_pool: self.registry.pool_stats(),
        }
    }

    /// Drains the stack: open streams reject, background tasks stop, and
    /// the runtime gets its grace period before being killed.
    pub async fn shutdown(&self) {
        info!(message = "Engine shutting down.");
        self.registry.shutdown();
        for task in &self.background {
            task.abort();
        }
        self.transport.shutdown().await;
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn models(&self) -> &ModelManager {
        &self.models
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    pub fn lifecycle_metrics(&self) -> LifecycleMetrics {
        self.lifecycle.metrics()
    }
}
