//! The controller's dispatch path.
//!
//! One request flows: balancer selection, breaker gate, bus forward, relay
//! back. Breaker counters move only on RPC-level outcomes; admission and
//! selection failures never count against a worker. Retries go to the
//! next-best worker and only for failure classes on the configured
//! allowlist.

use std::{collections::HashSet, sync::Arc};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    balancer::{LoadBalancer, RouteError},
    breaker::{CircuitBreakerRegistry, PeerKey},
    bus::{BusError, MessageBus},
};
use crate::config::RequestRoutingConfig;

/// One inference to place on a worker.
#[derive(Clone, Debug)]
pub struct InferenceRequest {
    pub request_id: String,
    pub model_id: String,
    pub prompt: String,
    pub stream: bool,
    pub params: Value,
}

impl InferenceRequest {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            model_id: model_id.into(),
            prompt: prompt.into(),
            stream: true,
            params: Value::Null,
        }
    }

    fn payload(&self) -> Value {
        json!({
            "requestId": self.request_id,
            "modelId": self.model_id,
            "prompt": self.prompt,
            "stream": self.stream,
            "params": self.params,
        })
    }
}

#[derive(Debug)]
pub struct InferenceReply {
    pub worker_id: String,
    pub body: InferenceBody,
}

#[derive(Debug)]
pub enum InferenceBody {
    /// Non-streaming: the worker's single reply.
    Complete(Value),
    /// Streaming: chunk frames until the worker drops the stream.
    Stream(mpsc::UnboundedReceiver<Value>),
}

pub struct Controller {
    balancer: Arc<LoadBalancer>,
    breakers: Arc<CircuitBreakerRegistry>,
    bus: Arc<dyn MessageBus>,
    config: RequestRoutingConfig,
}

impl Controller {
    pub fn new(
        balancer: Arc<LoadBalancer>,
        breakers: Arc<CircuitBreakerRegistry>,
        bus: Arc<dyn MessageBus>,
        config: RequestRoutingConfig,
    ) -> Self {
        Self {
            balancer,
            breakers,
            bus,
            config,
        }
    }

    /// Places the request on a worker and relays the reply.
    pub async fn dispatch(
        &self,
        request: &InferenceRequest,
    ) -> Result<InferenceReply, RouteError> {
        let mut excluded: HashSet<String> = HashSet::new();
        let attempts = self.config.retry.max_attempts.max(1);
        let mut last_failure: Option<String> = None;

        for _ in 0..attempts {
            let worker = match self
                .balancer
                .select_excluding(&request.model_id, &excluded)
            {
                Ok(worker) => worker,
                // Selection failures surface directly unless a worker
                // already failed this request.
                Err(error) => {
                    return Err(match last_failure {
                        Some(message) => RouteError::Exhausted { message },
                        None => error,
                    });
                }
            };

            let key = PeerKey::peer(worker.worker_id.clone());
            if !self.breakers.try_acquire(&key) {
                debug!(
                    message = "Skipping worker with open circuit.",
                    worker_id = %worker.worker_id,
                );
                excluded.insert(worker.worker_id.clone());
                last_failure
                    .get_or_insert_with(|| format!("circuit open for `{}`", worker.worker_id));
                continue;
            }

            let subject = worker.inference_subject();
            let outcome = if request.stream {
                self.bus
                    .request_stream(&subject, request.payload())
                    .await
                    .map(InferenceBody::Stream)
            } else {
                self.bus
                    .request(&subject, request.payload(), self.config.timeout())
                    .await
                    .map(InferenceBody::Complete)
            };

            match outcome {
                Ok(body) => {
                    self.breakers.record_success(&key);
                    return Ok(InferenceReply {
                        worker_id: worker.worker_id,
                        body,
                    });
                }
                Err(error) => {
                    self.breakers.record_failure(&key);
                    warn!(
                        message = "Worker dispatch failed.",
                        worker_id = %worker.worker_id,
                        request_id = %request.request_id,
                        %error,
                    );
                    if !self.is_retryable(&error) {
                        return Err(RouteError::Exhausted {
                            message: error.to_string(),
                        });
                    }
                    excluded.insert(worker.worker_id);
                    last_failure = Some(error.to_string());
                }
            }
        }

        Err(RouteError::Exhausted {
            message: last_failure.unwrap_or_else(|| "no dispatch attempts possible".to_owned()),
        })
    }

    fn is_retryable(&self, error: &BusError) -> bool {
        let class = match error {
            BusError::NoResponders { .. } => "no_responders",
            BusError::Timeout { .. } => "timeout",
            BusError::Closed => "closed",
        };
        self.config
            .retry
            .retryable
            .iter()
            .any(|allowed| allowed == class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::{
            CircuitState,
            bus::InMemoryBus,
            registry::{WorkerRegistry, test_heartbeat, test_registration},
        },
        config::CircuitBreakerConfig,
    };

    struct Fixture {
        registry: Arc<WorkerRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        bus: Arc<InMemoryBus>,
        controller: Controller,
    }

    fn fixture() -> Fixture {
        let config = RequestRoutingConfig::default();
        let registry = WorkerRegistry::new(config.clone());
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let bus = InMemoryBus::new();
        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&registry),
            Arc::clone(&breakers),
            config.hardware_safety_factor,
        ));
        let controller = Controller::new(
            balancer,
            Arc::clone(&breakers),
            bus.clone(),
            config,
        );
        Fixture {
            registry,
            breakers,
            bus,
            controller,
        }
    }

    /// A worker task that answers one streaming request with `tokens`.
    async fn serve_stream_once(bus: &Arc<InMemoryBus>, worker_id: &str, tokens: Vec<&'static str>) {
        let mut inbox = bus.subscribe(&format!("{worker_id}.inference")).await.unwrap();
        tokio::spawn(async move {
            let message = inbox.recv().await.unwrap();
            let stream = message.stream_reply.unwrap();
            for token in tokens {
                let _ = stream.send(json!({"token": token}));
            }
        });
    }

    #[tokio::test]
    async fn streaming_dispatch_relays_chunks() {
        let fixture = fixture();
        fixture
            .registry
            .register(test_registration("w1", &["mistral-7b"]));
        fixture.registry.heartbeat(test_heartbeat("w1", 0));
        serve_stream_once(&fixture.bus, "w1", vec!["a", "b"]).await;

        let request = InferenceRequest::new("mistral-7b", "hello");
        let reply = fixture.controller.dispatch(&request).await.unwrap();
        assert_eq!(reply.worker_id, "w1");

        let InferenceBody::Stream(mut frames) = reply.body else {
            panic!("expected a stream");
        };
        let mut tokens = Vec::new();
        while let Some(frame) = frames.recv().await {
            tokens.push(frame["token"].as_str().unwrap().to_owned());
        }
        assert_eq!(tokens, ["a", "b"]);

        let snapshot = fixture.breakers.snapshot(&PeerKey::peer("w1"));
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.successes, 1);
    }

    #[tokio::test]
    async fn non_streaming_dispatch_returns_the_reply() {
        let fixture = fixture();
        fixture
            .registry
            .register(test_registration("w1", &["mistral-7b"]));

        let mut inbox = fixture.bus.subscribe("w1.inference").await.unwrap();
        tokio::spawn(async move {
            let message = inbox.recv().await.unwrap();
            assert_eq!(message.payload["modelId"], "mistral-7b");
            let _ = message.reply.unwrap().send(json!({"text": "done"}));
        });

        let mut request = InferenceRequest::new("mistral-7b", "hello");
        request.stream = false;
        let reply = fixture.controller.dispatch(&request).await.unwrap();

        let InferenceBody::Complete(value) = reply.body else {
            panic!("expected a complete reply");
        };
        assert_eq!(value["text"], "done");
    }

    #[tokio::test]
    async fn dead_worker_fails_over_to_the_next() {
        let fixture = fixture();
        fixture
            .registry
            .register(test_registration("w1", &["mistral-7b"]));
        fixture
            .registry
            .register(test_registration("w2", &["mistral-7b"]));
        // Only w2 actually listens; w1 yields NoResponders, which is on
        // the retry allowlist.
        serve_stream_once(&fixture.bus, "w2", vec!["ok"]).await;

        let request = InferenceRequest::new("mistral-7b", "hello");
        let reply = fixture.controller.dispatch(&request).await.unwrap();
        assert_eq!(reply.worker_id, "w2");

        // The dead worker took the breaker failure; the live one took the
        // success.
        assert_eq!(fixture.breakers.snapshot(&PeerKey::peer("w1")).failures, 1);
        assert_eq!(fixture.breakers.snapshot(&PeerKey::peer("w2")).successes, 1);
    }

    #[tokio::test]
    async fn open_circuit_workers_are_skipped() {
        let fixture = fixture();
        fixture
            .registry
            .register(test_registration("w1", &["mistral-7b"]));
        fixture
            .registry
            .register(test_registration("w2", &["mistral-7b"]));
        for _ in 0..5 {
            fixture.breakers.record_failure(&PeerKey::peer("w1"));
        }
        serve_stream_once(&fixture.bus, "w2", vec!["ok"]).await;

        let request = InferenceRequest::new("mistral-7b", "hello");
        let reply = fixture.controller.dispatch(&request).await.unwrap();
        assert_eq!(reply.worker_id, "w2");
    }

    #[tokio::test]
    async fn exhausted_retries_report_the_last_failure() {
        let fixture = fixture();
        fixture
            .registry
            .register(test_registration("w1", &["mistral-7b"]));
        fixture
            .registry
            .register(test_registration("w2", &["mistral-7b"]));
        // Nobody listens anywhere.

        let request = InferenceRequest::new("mistral-7b", "hello");
        let error = fixture.controller.dispatch(&request).await.unwrap_err();
        assert!(matches!(error, RouteError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn selection_failures_surface_directly() {
        let fixture = fixture();
        let request = InferenceRequest::new("mistral-7b", "hello");
        let error = fixture.controller.dispatch(&request).await.unwrap_err();
        assert!(matches!(error, RouteError::NoOnlineWorkers));
    }
}
