//! Completion gateway.
//!
//! Routes a single [`CompletionRequest`] across every configured backend with
//! health-aware ordering, bounded per-backend retries, a per-call timeout and
//! failover.  A background loop (see [`CompletionGateway::start`]) probes each
//! backend periodically so recovered backends are promoted again without
//! waiting for live traffic.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures::future::join_all;
use lisa_kernel::{Event, EventBus};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::{AgentError, Result};
use crate::llm::adapter::CompletionBackend;
use crate::llm::health::{DEFAULT_FAILURE_THRESHOLD, HealthRouter};
use crate::llm::types::{BackendConfig, BackendId, CompletionRequest, CompletionResponse};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for retry, timeout and health checking.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Attempts per backend within one `complete()` call.
    pub max_retries: u32,
    /// Fixed pause between attempts on the same backend.
    pub retry_delay: Duration,
    /// Deadline for a single backend call.
    pub request_timeout: Duration,
    /// Period of the background probe loop.
    pub health_check_interval: Duration,
    /// Consecutive failures before a backend is marked unhealthy.
    pub failure_threshold: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Outcome of probing one backend.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub backend_id: BackendId,
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Health-aware completion router.  Cheap to clone; clones share backends,
/// health records and the probe loop.
#[derive(Clone)]
pub struct CompletionGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    backends: Vec<Arc<dyn CompletionBackend>>,
    configs: Vec<BackendConfig>,
    router: HealthRouter,
    config: GatewayConfig,
    bus: EventBus,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for GatewayInner {
    fn drop(&mut self) {
        if let Some(handle) = take_handle(&self.health_task) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for CompletionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionGateway")
            .field("backends", &self.inner.configs.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl CompletionGateway {
    /// Create a gateway over `backends`.  The probe loop is not started;
    /// call [`CompletionGateway::start`] for that.
    pub fn new(
        backends: Vec<Arc<dyn CompletionBackend>>,
        config: GatewayConfig,
        bus: EventBus,
    ) -> Self {
        let configs = backends.iter().map(|b| b.config().clone()).collect();
        let router = HealthRouter::new(config.failure_threshold);
        Self {
            inner: Arc::new(GatewayInner {
                backends,
                configs,
                router,
                config,
                bus,
                health_task: Mutex::new(None),
            }),
        }
    }

    /// The health router backing this gateway.
    pub fn router(&self) -> &HealthRouter {
        &self.inner.router
    }

    /// Configured backends, in configuration order.
    pub fn backends(&self) -> &[BackendConfig] {
        &self.inner.configs
    }

    /// The gateway's tunables.
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Complete `request` on the first backend that answers.
    ///
    /// Backends are tried in the router's order (a healthy preferred backend
    /// is moved to the front), each up to `max_retries` times with a fixed
    /// delay between attempts.  When every combination fails the collected
    /// errors are returned in [`AgentError::AllBackendsFailed`].
    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let inner = &self.inner;
        if inner.backends.is_empty() {
            return Err(AgentError::NoBackendsConfigured);
        }

        let order = self.attempt_order(request.preferred_backend.as_ref());
        let max_retries = inner.config.max_retries.max(1);
        let mut errors = Vec::new();
        let mut attempts: u32 = 0;

        for backend in order {
            let id = backend.id();
            for attempt in 1..=max_retries {
                attempts += 1;
                let started = Instant::now();
                let outcome =
                    match tokio::time::timeout(inner.config.request_timeout, backend.complete(request))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(AgentError::BackendTimeout {
                            backend_id: id.to_string(),
                            timeout: inner.config.request_timeout,
                        }),
                    };

                match outcome {
                    Ok(reply) => {
                        let latency_ms = elapsed_ms(started);
                        inner.router.record_success(&id, latency_ms);
                        tracing::debug!(backend = %id, attempt, latency_ms, "completion succeeded");
                        inner.bus.publish(Event::CompletionSucceeded {
                            backend_id: id.to_string(),
                            attempt,
                            latency_ms,
                        });
                        return Ok(CompletionResponse {
                            content: reply.content,
                            backend_id: id,
                            usage: reply.usage,
                            latency_ms,
                            attempts,
                        });
                    }
                    Err(e) => {
                        let message = e.to_string();
                        inner.router.record_failure(&id, &message);
                        tracing::warn!(backend = %id, attempt, error = %message, "completion attempt failed");
                        inner.bus.publish(Event::CompletionFailed {
                            backend_id: id.to_string(),
                            attempt,
                            error: message.clone(),
                        });
                        errors.push(format!("{id}: {message}"));

                        if attempt < max_retries {
                            tokio::time::sleep(inner.config.retry_delay).await;
                        }
                    }
                }
            }
        }

        tracing::error!(attempts, "all completion backends failed");
        inner.bus.publish(Event::AllBackendsFailed {
            errors: errors.clone(),
        });
        Err(AgentError::AllBackendsFailed { errors })
    }

    /// Probe every backend once, concurrently, and update health records.
    ///
    /// Probes touch only `is_healthy`, latency, `last_checked` and (on
    /// failure) `last_error`; the retry-path counters are left alone.
    pub async fn check_health(&self) -> Vec<ProbeOutcome> {
        let timeout = self.inner.config.request_timeout;
        let probes = self.inner.backends.iter().map(|backend| async move {
            let id = backend.id();
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, backend.probe()).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::BackendTimeout {
                    backend_id: id.to_string(),
                    timeout,
                }),
            };
            match result {
                Ok(()) => ProbeOutcome {
                    backend_id: id,
                    healthy: true,
                    latency_ms: Some(elapsed_ms(started)),
                    error: None,
                },
                Err(e) => ProbeOutcome {
                    backend_id: id,
                    healthy: false,
                    latency_ms: None,
                    error: Some(e.to_string()),
                },
            }
        });

        let outcomes = join_all(probes).await;
        for outcome in &outcomes {
            self.inner.router.record_probe(
                &outcome.backend_id,
                outcome.healthy,
                outcome.latency_ms,
                outcome.error.clone(),
            );
            tracing::debug!(
                backend = %outcome.backend_id,
                healthy = outcome.healthy,
                latency_ms = ?outcome.latency_ms,
                "health probe finished"
            );
            self.inner.bus.publish(Event::HealthChecked {
                backend_id: outcome.backend_id.to_string(),
                healthy: outcome.healthy,
                latency_ms: outcome.latency_ms,
                error: outcome.error.clone(),
            });
        }
        outcomes
    }

    /// Spawn the periodic health-check loop.  Calling `start` on a running
    /// gateway is a no-op.
    pub fn start(&self) {
        let mut slot = lock_handle(&self.inner.health_task);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let weak: Weak<GatewayInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.health_check_interval;
        *slot = Some(tokio::spawn(async move {
            tracing::info!(interval_secs = period.as_secs(), "health-check loop started");
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                CompletionGateway { inner }.check_health().await;
            }
            tracing::info!("health-check loop stopped");
        }));
        drop(slot);
        self.inner.bus.publish(Event::SystemEvent {
            category: "gateway".into(),
            message: format!("health-check loop started ({}s interval)", period.as_secs()),
        });
    }

    /// Stop the health-check loop if it is running.
    pub fn stop(&self) {
        if let Some(handle) = take_handle(&self.inner.health_task) {
            handle.abort();
            tracing::info!("health-check loop stopped");
            self.inner.bus.publish(Event::SystemEvent {
                category: "gateway".into(),
                message: "health-check loop stopped".into(),
            });
        }
    }

    /// Whether the health-check loop is running.
    pub fn is_running(&self) -> bool {
        lock_handle(&self.inner.health_task)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn attempt_order(&self, preferred: Option<&BackendId>) -> Vec<Arc<dyn CompletionBackend>> {
        let inner = &self.inner;
        let mut ordered: Vec<Arc<dyn CompletionBackend>> = inner
            .router
            .order(&inner.configs)
            .into_iter()
            .filter_map(|cfg| {
                let id = cfg.id();
                inner.backends.iter().find(|b| b.id() == id).cloned()
            })
            .collect();

        if let Some(preferred) = preferred.filter(|p| inner.router.is_healthy(p)) {
            if let Some(pos) = ordered.iter().position(|b| &b.id() == preferred) {
                let backend = ordered.remove(pos);
                ordered.insert(0, backend);
            }
        }
        ordered
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn lock_handle(
    slot: &Mutex<Option<JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn take_handle(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    lock_handle(slot).take()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::llm::types::{BackendReply, Message};

    struct StubBackend {
        config: BackendConfig,
        failing: AtomicBool,
        calls: AtomicU32,
        probes: AtomicU32,
        delay: Option<Duration>,
    }

    impl StubBackend {
        fn new(model: &str, priority: u32, failing: bool) -> Arc<Self> {
            Arc::new(Self {
                config: BackendConfig::new("stub", model, priority),
                failing: AtomicBool::new(failing),
                calls: AtomicU32::new(0),
                probes: AtomicU32::new(0),
                delay: None,
            })
        }

        fn slow(model: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                config: BackendConfig::new("stub", model, 1),
                failing: AtomicBool::new(false),
                calls: AtomicU32::new(0),
                probes: AtomicU32::new(0),
                delay: Some(delay),
            })
        }
    }

    #[async_trait]
    impl CompletionBackend for StubBackend {
        fn config(&self) -> &BackendConfig {
            &self.config
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<BackendReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                Err(AgentError::BackendFailure {
                    backend_id: self.config.id().to_string(),
                    reason: "stub failure".into(),
                })
            } else {
                Ok(BackendReply::text(format!("reply from {}", self.config.model)))
            }
        }

        async fn probe(&self) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(AgentError::BackendFailure {
                    backend_id: self.config.id().to_string(),
                    reason: "probe failure".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn fast_config(max_retries: u32) -> GatewayConfig {
        GatewayConfig {
            max_retries,
            retry_delay: Duration::from_millis(1),
            request_timeout: Duration::from_millis(200),
            ..GatewayConfig::default()
        }
    }

    fn gateway(backends: Vec<Arc<StubBackend>>, config: GatewayConfig) -> CompletionGateway {
        let backends = backends
            .into_iter()
            .map(|b| b as Arc<dyn CompletionBackend>)
            .collect();
        CompletionGateway::new(backends, config, EventBus::new(64))
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![Message::user("hi")])
    }

    #[tokio::test]
    async fn no_backends_fails_immediately() {
        let gw = CompletionGateway::new(Vec::new(), fast_config(3), EventBus::default());
        assert!(matches!(
            gw.complete(&request()).await,
            Err(AgentError::NoBackendsConfigured)
        ));
    }

    #[tokio::test]
    async fn lowest_priority_healthy_backend_answers() {
        let p1 = StubBackend::new("p1", 1, false);
        let p2 = StubBackend::new("p2", 2, false);
        let gw = gateway(vec![p2.clone(), p1.clone()], fast_config(3));

        let resp = gw.complete(&request()).await.unwrap();
        assert_eq!(resp.backend_id.as_str(), "stub/p1");
        assert_eq!(resp.content, "reply from p1");
        assert_eq!(resp.attempts, 1);
        assert_eq!(p2.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failover_respects_max_retries() {
        let p1 = StubBackend::new("p1", 1, true);
        let p2 = StubBackend::new("p2", 2, false);
        let gw = gateway(vec![p1.clone(), p2.clone()], fast_config(3));

        let resp = gw.complete(&request()).await.unwrap();
        assert_eq!(resp.backend_id.as_str(), "stub/p2");
        assert_eq!(resp.attempts, 4);
        assert_eq!(p1.calls.load(Ordering::SeqCst), 3);
        assert_eq!(p2.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_backends_failed_collects_every_error() {
        let p1 = StubBackend::new("p1", 1, true);
        let p2 = StubBackend::new("p2", 2, true);
        let gw = gateway(vec![p1.clone(), p2.clone()], fast_config(2));
        let mut sub = gw.inner.bus.subscribe();

        match gw.complete(&request()).await {
            Err(AgentError::AllBackendsFailed { errors }) => assert_eq!(errors.len(), 4),
            other => panic!("expected AllBackendsFailed, got {other:?}"),
        }
        assert_eq!(p1.calls.load(Ordering::SeqCst), 2);
        assert_eq!(p2.calls.load(Ordering::SeqCst), 2);

        let kinds: Vec<_> = sub.drain().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds.iter().filter(|k| **k == "gateway.completion_error").count(),
            4
        );
        assert_eq!(kinds.last(), Some(&"gateway.all_backends_failed"));
    }

    #[tokio::test]
    async fn repeated_failures_demote_primary() {
        let p1 = StubBackend::new("p1", 1, true);
        let p2 = StubBackend::new("p2", 2, false);
        let gw = gateway(vec![p1.clone(), p2.clone()], fast_config(1));

        for _ in 0..3 {
            let resp = gw.complete(&request()).await.unwrap();
            assert_eq!(resp.backend_id.as_str(), "stub/p2");
        }
        assert_eq!(p1.calls.load(Ordering::SeqCst), 3);
        assert!(!gw.router().is_healthy(&BackendId::from("stub/p1")));

        let resp = gw.complete(&request()).await.unwrap();
        assert_eq!(resp.backend_id.as_str(), "stub/p2");
        assert_eq!(resp.attempts, 1);
        assert_eq!(p1.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_backend_times_out_and_fails_over() {
        let slow = StubBackend::slow("slow", Duration::from_secs(5));
        let backup = StubBackend::new("backup", 2, false);
        let gw = gateway(vec![slow.clone(), backup.clone()], fast_config(1));

        let resp = gw.complete(&request()).await.unwrap();
        assert_eq!(resp.backend_id.as_str(), "stub/backup");
        let record = gw.router().record(&BackendId::from("stub/slow")).unwrap();
        assert!(record.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn healthy_preferred_backend_goes_first() {
        let p1 = StubBackend::new("p1", 1, false);
        let p2 = StubBackend::new("p2", 2, false);
        let gw = gateway(vec![p1.clone(), p2.clone()], fast_config(1));

        let mut req = request();
        req.preferred_backend = Some(BackendId::from("stub/p2"));
        let resp = gw.complete(&req).await.unwrap();
        assert_eq!(resp.backend_id.as_str(), "stub/p2");
    }

    #[tokio::test]
    async fn unhealthy_preferred_backend_is_not_promoted() {
        let p1 = StubBackend::new("p1", 1, false);
        let p2 = StubBackend::new("p2", 2, false);
        let gw = gateway(vec![p1.clone(), p2.clone()], fast_config(1));
        for _ in 0..3 {
            gw.router().record_failure(&BackendId::from("stub/p2"), "down");
        }

        let mut req = request();
        req.preferred_backend = Some(BackendId::from("stub/p2"));
        let resp = gw.complete(&req).await.unwrap();
        assert_eq!(resp.backend_id.as_str(), "stub/p1");
    }

    #[tokio::test]
    async fn probes_update_health_without_counters() {
        let p1 = StubBackend::new("p1", 1, true);
        let gw = gateway(vec![p1.clone()], fast_config(1));

        let outcomes = gw.check_health().await;
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].healthy);
        let record = gw.router().record(&BackendId::from("stub/p1")).unwrap();
        assert!(!record.is_healthy);
        assert_eq!(record.error_count, 0);
        assert_eq!(p1.calls.load(Ordering::SeqCst), 0);

        p1.failing.store(false, Ordering::SeqCst);
        gw.check_health().await;
        let record = gw.router().record(&BackendId::from("stub/p1")).unwrap();
        assert!(record.is_healthy);
        assert_eq!(record.success_count, 0);
        assert_eq!(p1.probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn start_and_stop_health_loop() {
        let p1 = StubBackend::new("p1", 1, false);
        let config = GatewayConfig {
            health_check_interval: Duration::from_millis(10),
            ..fast_config(1)
        };
        let gw = gateway(vec![p1.clone()], config);
        let mut sub = gw.inner.bus.subscribe();

        gw.start();
        gw.start();
        assert!(gw.is_running());
        tokio::time::sleep(Duration::from_millis(80)).await;
        gw.stop();
        gw.stop();
        assert!(!gw.is_running());
        assert!(p1.probes.load(Ordering::SeqCst) >= 1);

        // One started and one stopped notice, however often each is called.
        let notices: Vec<String> = sub
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                Event::SystemEvent { category, message } if category == "gateway" => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(notices.len(), 2);
        assert!(notices[0].starts_with("health-check loop started"));
        assert_eq!(notices[1], "health-check loop stopped");
    }
}
