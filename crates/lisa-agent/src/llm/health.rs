//! Provider health router.
//!
//! Tracks one [`HealthRecord`] per backend and orders candidate backends for
//! each completion attempt: healthy backends first, then unhealthy ones, each
//! group by ascending priority.  Unhealthy backends are demoted, never
//! excluded.
//!
//! Records are updated from two paths: the gateway's retry path
//! ([`HealthRouter::record_success`] / [`HealthRouter::record_failure`]) and
//! the periodic probe loop ([`HealthRouter::record_probe`]).  Each update is a
//! read-modify-write under the record's shard lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::llm::types::{BackendConfig, BackendId};

/// Consecutive failures after which a backend is marked unhealthy.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

// ---------------------------------------------------------------------------
// Health record
// ---------------------------------------------------------------------------

/// Observed health of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthRecord {
    pub is_healthy: bool,
    /// Failures since the last success on the retry path.
    pub error_count: u32,
    pub success_count: u64,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            is_healthy: true,
            error_count: 0,
            success_count: 0,
            last_latency_ms: None,
            last_error: None,
            last_checked: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Health-aware backend ordering.  Cheap to clone; clones share records.
#[derive(Debug, Clone)]
pub struct HealthRouter {
    records: Arc<DashMap<BackendId, HealthRecord>>,
    failure_threshold: u32,
}

impl Default for HealthRouter {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

impl HealthRouter {
    /// Create a router that marks a backend unhealthy after
    /// `failure_threshold` consecutive failures.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// The configured failure threshold.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Order `backends` for the next attempt.  Backends with no record yet
    /// count as healthy.
    pub fn order<'a>(&self, backends: &'a [BackendConfig]) -> Vec<&'a BackendConfig> {
        order_backends(backends, |id| self.is_healthy(id))
    }

    /// Whether the backend is currently considered healthy.
    pub fn is_healthy(&self, id: &BackendId) -> bool {
        self.records.get(id).is_none_or(|r| r.is_healthy)
    }

    /// Record a successful call on the retry path.
    pub fn record_success(&self, id: &BackendId, latency_ms: u64) {
        let mut record = self.records.entry(id.clone()).or_default();
        record.is_healthy = true;
        record.error_count = 0;
        record.success_count += 1;
        record.last_latency_ms = Some(latency_ms);
        record.last_checked = Some(Utc::now());
    }

    /// Record a failed call on the retry path.  Returns `true` if this
    /// failure flipped the backend to unhealthy.
    pub fn record_failure(&self, id: &BackendId, error: &str) -> bool {
        let mut record = self.records.entry(id.clone()).or_default();
        record.error_count += 1;
        record.last_error = Some(error.to_owned());
        record.last_checked = Some(Utc::now());

        let was_healthy = record.is_healthy;
        if record.error_count >= self.failure_threshold {
            record.is_healthy = false;
        }
        let flipped = was_healthy && !record.is_healthy;
        if flipped {
            tracing::warn!(
                backend = %id,
                error_count = record.error_count,
                "backend marked unhealthy"
            );
        }
        flipped
    }

    /// Record the outcome of a health probe.  Probes set health, latency and
    /// timestamp directly and leave the retry-path counters alone.
    pub fn record_probe(
        &self,
        id: &BackendId,
        healthy: bool,
        latency_ms: Option<u64>,
        error: Option<String>,
    ) {
        let mut record = self.records.entry(id.clone()).or_default();
        record.is_healthy = healthy;
        if latency_ms.is_some() {
            record.last_latency_ms = latency_ms;
        }
        if error.is_some() {
            record.last_error = error;
        }
        record.last_checked = Some(Utc::now());
    }

    /// Current record for one backend, if any.
    pub fn record(&self, id: &BackendId) -> Option<HealthRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// All records, sorted by backend id.
    pub fn snapshot(&self) -> Vec<(BackendId, HealthRecord)> {
        let mut all: Vec<_> = self
            .records
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

/// Order backends healthy-first, then by ascending priority.  The sort is
/// stable, so equal keys keep configuration order.
pub fn order_backends<'a, F>(backends: &'a [BackendConfig], is_healthy: F) -> Vec<&'a BackendConfig>
where
    F: Fn(&BackendId) -> bool,
{
    let mut keyed: Vec<(bool, u32, &BackendConfig)> = backends
        .iter()
        .map(|b| (!is_healthy(&b.id()), b.priority, b))
        .collect();
    keyed.sort_by_key(|(unhealthy, priority, _)| (*unhealthy, *priority));
    keyed.into_iter().map(|(_, _, b)| b).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
