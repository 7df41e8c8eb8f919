//! Cache of compiled transforms.
//!
//! Compiled transforms are keyed by their [`TransformSpec`]. The shared map
//! is only locked to find a key's slot; compilation is serialized per slot,
//! so at most one compilation per spec is ever in flight and evaluation never
//! holds a cache lock.

use crate::evaluator::{CompiledTransform, Evaluator, ScriptFingerprint};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tp_error::EvalError;
use tp_types::TransformSpec;
use tracing::{debug, trace, warn};

/// Default delay before retrying a spec that failed to compile.
pub const DEFAULT_RETRY_BACKOFF_BASE_MS: u64 = 100;

/// Default upper bound on the retry delay.
pub const DEFAULT_RETRY_BACKOFF_MAX_SECS: u64 = 30;

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Minimum time between checks of a script file's modification marker.
    ///
    /// Zero checks on every lookup.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Delay before the first retry of a spec that failed to compile
    #[serde(with = "humantime_serde")]
    pub retry_backoff_base: Duration,

    /// Upper bound on the doubling retry delay
    #[serde(with = "humantime_serde")]
    pub retry_backoff_max: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::ZERO,
            retry_backoff_base: Duration::from_millis(DEFAULT_RETRY_BACKOFF_BASE_MS),
            retry_backoff_max: Duration::from_secs(DEFAULT_RETRY_BACKOFF_MAX_SECS),
        }
    }
}

impl CacheConfig {
    /// Sets how often script files are checked for changes.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Sets the compile-failure retry backoff.
    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff_base = base;
        self.retry_backoff_max = max;
        self
    }

    /// Delay before retry number `attempts` (1-based).
    fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempts.saturating_sub(1));
        self.retry_backoff_base
            .saturating_mul(factor)
            .min(self.retry_backoff_max)
    }
}

/// Remembered compile failure.
#[derive(Debug, Clone)]
struct Failure {
    error: EvalError,
    attempts: u32,
    /// `None` when the backoff is too large to schedule; only a file change
    /// or invalidation brings the spec back.
    retry_at: Option<Instant>,
    fingerprint: Option<ScriptFingerprint>,
}

#[derive(Debug, Clone, Default)]
enum SlotState {
    #[default]
    Empty,
    Ready {
        compiled: Arc<CompiledTransform>,
        verified_at: Instant,
    },
    Failed(Failure),
}

#[derive(Debug, Default)]
struct Slot {
    compile_lock: Mutex<()>,
    state: RwLock<SlotState>,
}

/// Counters describing cache behavior.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    compilations: AtomicU64,
    recompilations: AtomicU64,
    failures: AtomicU64,
    suppressed_retries: AtomicU64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            recompilations: self.recompilations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            suppressed_retries: self.suppressed_retries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    /// Lookups served from the cache
    pub hits: u64,

    /// Lookups that had to compile
    pub misses: u64,

    /// Successful compilations
    pub compilations: u64,

    /// Successful compilations that replaced a stale script
    pub recompilations: u64,

    /// Failed compilations
    pub failures: u64,

    /// Lookups answered with a remembered failure during backoff
    pub suppressed_retries: u64,
}

/// Thread-safe cache of compiled transforms.
#[derive(Debug)]
pub struct EvaluationCache {
    evaluator: Arc<Evaluator>,
    config: CacheConfig,
    slots: RwLock<HashMap<TransformSpec, Arc<Slot>>>,
    stats: CacheStats,
}

impl EvaluationCache {
    /// Creates a cache compiling with `evaluator`.
    pub fn new(evaluator: Arc<Evaluator>) -> Self {
        Self::with_config(evaluator, CacheConfig::default())
    }

    /// Creates a cache with custom configuration.
    pub fn with_config(evaluator: Arc<Evaluator>, config: CacheConfig) -> Self {
        Self {
            evaluator,
            config,
            slots: RwLock::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    pub fn evaluator(&self) -> &Arc<Evaluator> {
        &self.evaluator
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the compiled form of `spec`, compiling it if needed.
    ///
    /// Script specs are recompiled once their file changes. Compile errors
    /// are never cached as successes: an unreadable script is retried on the
    /// next call, a malformed one after an exponential backoff (or as soon as
    /// its file changes).
    pub fn get_or_compile(
        &self,
        spec: &TransformSpec,
    ) -> Result<Arc<CompiledTransform>, EvalError> {
        let slot = self.slot(spec);

        if let Some(compiled) = self.lookup(&slot, spec)? {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(compiled);
        }

        let _compiling = slot.compile_lock.lock();

        // Another caller may have compiled while we waited
        if let Some(compiled) = self.lookup(&slot, spec)? {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(compiled);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        self.compile_into(&slot, spec)
    }

    /// Drops the cached entry for `spec`.
    pub fn invalidate(&self, spec: &TransformSpec) {
        if self.slots.write().remove(spec).is_some() {
            debug!(spec = %spec.describe(), "Invalidated cache entry");
        }
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        self.slots.write().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, spec: &TransformSpec) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().get(spec) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().entry(spec.clone()).or_default())
    }

    /// Serves the slot's current state if it is still valid.
    ///
    /// `Ok(None)` means the caller must compile.
    fn lookup(
        &self,
        slot: &Slot,
        spec: &TransformSpec,
    ) -> Result<Option<Arc<CompiledTransform>>, EvalError> {
        let state = slot.state.read().clone();

        match state {
            SlotState::Empty => Ok(None),
            SlotState::Ready {
                compiled,
                verified_at,
            } => {
                let TransformSpec::Script(script) = spec else {
                    return Ok(Some(compiled));
                };

                let refresh_interval = self.config.refresh_interval;
                if !refresh_interval.is_zero() && verified_at.elapsed() < refresh_interval {
                    return Ok(Some(compiled));
                }

                match ScriptFingerprint::read(script.path()) {
                    Ok(current) if Some(current) == compiled.fingerprint() => {
                        // verified_at is only read when checks are spaced out
                        if !refresh_interval.is_zero() {
                            self.mark_verified(slot, &compiled);
                        }
                        Ok(Some(compiled))
                    }
                    Ok(_) => {
                        debug!(script = %script.path().display(), "Script changed, recompiling");
                        Ok(None)
                    }
                    Err(e) => {
                        trace!(error = %e, "Script marker unreadable");
                        Ok(None)
                    }
                }
            }
            SlotState::Failed(failure) => {
                if failure.retry_at.is_some_and(|at| Instant::now() >= at) {
                    return Ok(None);
                }
                if let TransformSpec::Script(script) = spec {
                    if ScriptFingerprint::read(script.path()).ok() != failure.fingerprint {
                        return Ok(None);
                    }
                }
                self.stats.suppressed_retries.fetch_add(1, Ordering::Relaxed);
                Err(failure.error)
            }
        }
    }

    fn mark_verified(&self, slot: &Slot, compiled: &Arc<CompiledTransform>) {
        let mut state = slot.state.write();
        if let SlotState::Ready {
            compiled: current,
            verified_at,
        } = &mut *state
        {
            if Arc::ptr_eq(current, compiled) {
                *verified_at = Instant::now();
            }
        }
    }

    /// Compiles `spec` and publishes the outcome. Caller holds the compile lock.
    fn compile_into(
        &self,
        slot: &Slot,
        spec: &TransformSpec,
    ) -> Result<Arc<CompiledTransform>, EvalError> {
        let previous = slot.state.read().clone();

        match self.evaluator.compile(spec) {
            Ok(compiled) => {
                let compiled = Arc::new(compiled);
                *slot.state.write() = SlotState::Ready {
                    compiled: Arc::clone(&compiled),
                    verified_at: Instant::now(),
                };

                self.stats.compilations.fetch_add(1, Ordering::Relaxed);
                if matches!(previous, SlotState::Ready { .. }) {
                    self.stats.recompilations.fetch_add(1, Ordering::Relaxed);
                }
                Ok(compiled)
            }
            Err(error @ EvalError::ScriptUnavailable(_)) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(spec = %spec.describe(), error = %error, "Script unavailable");
                *slot.state.write() = SlotState::Empty;
                Err(error)
            }
            Err(error) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);

                let attempts = match previous {
                    SlotState::Failed(failure) => failure.attempts.saturating_add(1),
                    _ => 1,
                };
                let backoff = self.config.backoff(attempts);
                let fingerprint = match spec {
                    TransformSpec::Script(script) => ScriptFingerprint::read(script.path()).ok(),
                    TransformSpec::Expression(_) => None,
                };

                warn!(
                    spec = %spec.describe(),
                    attempts,
                    retry_in = ?backoff,
                    error = %error,
                    "Compilation failed"
                );

                *slot.state.write() = SlotState::Failed(Failure {
                    error: error.clone(),
                    attempts,
                    retry_at: Instant::now().checked_add(backoff),
                    fingerprint,
                });
                Err(error)
            }
        }
    }
}
