//! Shared store of known rate limits and their live usage.
//!
//! Usage changes through exactly two write paths:
//!
//! 1. optimistic: [`RateLimitRegistry::increment_usage`] / [`RateLimitRegistry::try_reserve`],
//!    applied before a request is sent;
//! 2. authoritative: [`RateLimitRegistry::update_usage`], applied from server-reported
//!    figures and ordered by the response timestamp (last write wins).
//!
//! Each limit has its own mutex. The table lock is only written while registering
//! limits, so unrelated dimensions never contend. Windows are aligned to the Unix
//! epoch and rolled over lazily on access.

use crate::ids::{dimension_id, limit_id, DimensionId, LimitId};
use crate::types::{QueryWeight, RateLimitInfo, RateLimiter};
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HEADER_PREFIX: &str = "x-mbx";

/// Source of "now" for admission checks and window roll-over.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Useful in tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        let next = i64::try_from(by.as_millis())
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .and_then(|delta| now.checked_add_signed(delta));
        *now = next.unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("rate limit registry is closed")]
    Closed,
    #[error("unknown rate limit {0}")]
    UnknownLimit(LimitId),
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// The first limit (in weight declaration order) that has no room left.
    Denied { limit_id: LimitId },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Outcome of an authoritative usage overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageUpdate {
    Applied,
    /// Older than the last applied authoritative value; nothing changed.
    Stale,
}

#[derive(Debug)]
struct UsageState {
    limit: u32,
    usage: u32,
    window: u64,
    last_authoritative: Option<DateTime<Utc>>,
}

impl UsageState {
    fn usage_in(&self, window: u64) -> u32 {
        if window > self.window {
            0
        } else {
            self.usage
        }
    }

    fn roll_to(&mut self, window: u64) {
        if window > self.window {
            self.window = window;
            self.usage = 0;
        }
    }
}

/// Epoch-aligned window number of `at`. Zero-length intervals never roll over.
fn window_index(at: DateTime<Utc>, interval: Duration) -> u64 {
    let interval_ms = interval.as_millis();
    if interval_ms == 0 {
        return 0;
    }
    let at_ms = u128::try_from(at.timestamp_millis()).unwrap_or(0);
    u64::try_from(at_ms / interval_ms).unwrap_or(u64::MAX)
}

#[derive(Debug)]
struct LimitCell {
    id: LimitId,
    dimension: DimensionId,
    reset_interval: Duration,
    name: String,
    state: Mutex<UsageState>,
}

impl LimitCell {
    fn lock(&self) -> MutexGuard<'_, UsageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn window_at(&self, at: DateTime<Utc>) -> u64 {
        window_index(at, self.reset_interval)
    }

    fn snapshot(&self, at: DateTime<Utc>) -> RateLimitInfo {
        let state = self.lock();
        RateLimitInfo {
            limit_id: self.id,
            dimension_id: self.dimension,
            reset_interval: self.reset_interval,
            limit: state.limit,
            usage: state.usage_in(self.window_at(at)),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    limits: HashMap<LimitId, Arc<LimitCell>>,
    by_dimension: HashMap<DimensionId, Vec<Arc<LimitCell>>>,
    // scope -> usage header name -> limit
    headers: HashMap<String, HashMap<String, LimitId>>,
}

#[derive(Debug)]
pub struct RateLimitRegistry {
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
    header_prefix: String,
    closed: AtomicBool,
}

impl Default for RateLimitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            clock,
            header_prefix: DEFAULT_HEADER_PREFIX.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    /// Prefix of the response headers carrying live usage (`x-mbx` by default).
    pub fn with_header_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.header_prefix = prefix.into().to_ascii_lowercase();
        self
    }

    pub fn header_prefix(&self) -> &str {
        &self.header_prefix
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Merge published limiters for `scope` into the registry.
    ///
    /// Unseen limits start at their reported usage (or 0). Known limits keep the
    /// higher declared limit and their current usage.
    pub fn register_or_update(
        &self,
        limiters: &[RateLimiter],
        scope: &str,
    ) -> Result<Vec<LimitId>, RegistryError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut tables = self.write_tables();
        let mut ids = Vec::with_capacity(limiters.len());
        for limiter in limiters {
            let dimension = dimension_id(scope, limiter.kind);
            let reset_interval = limiter.reset_interval();
            let id = limit_id(dimension, reset_interval);

            if let Some(cell) = tables.limits.get(&id).cloned() {
                let mut state = cell.lock();
                if limiter.limit > state.limit {
                    debug!("raising {} limit {} -> {}", cell.name, state.limit, limiter.limit);
                    state.limit = limiter.limit;
                }
            } else {
                let name = format!("{}:{}/{}", scope, limiter.kind.as_str(), limiter.window_label());
                let cell = Arc::new(LimitCell {
                    id,
                    dimension,
                    reset_interval,
                    name,
                    state: Mutex::new(UsageState {
                        limit: limiter.limit,
                        usage: limiter.initial_usage.unwrap_or(0),
                        window: window_index(now, reset_interval),
                        last_authoritative: None,
                    }),
                });
                info!("registered rate limit {} ({}) limit={}", cell.name, id, limiter.limit);
                tables.limits.insert(id, Arc::clone(&cell));
                tables.by_dimension.entry(dimension).or_default().push(cell);
            }

            if let Some(header) = limiter.usage_header(&self.header_prefix) {
                tables
                    .headers
                    .entry(scope.to_string())
                    .or_default()
                    .insert(header, id);
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Check whether `weights` fit the remaining capacity right now. Read-only.
    ///
    /// Weights on dimensions with no registered limit are always admitted.
    pub fn test_usage(&self, weights: &[QueryWeight]) -> Result<Admission, RegistryError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let tables = self.read_tables();
        let mut claimed: HashMap<LimitId, u64> = HashMap::new();
        for weight in weights {
            let Some(cells) = tables.by_dimension.get(&weight.dimension) else {
                continue;
            };
            for cell in cells {
                let state = cell.lock();
                let used = u64::from(state.usage_in(cell.window_at(now)));
                let claim = claimed.entry(cell.id).or_insert(0);
                *claim += u64::from(weight.amount);
                if used + *claim > u64::from(state.limit) {
                    return Ok(Admission::Denied { limit_id: cell.id });
                }
            }
        }
        Ok(Admission::Granted)
    }

    /// Optimistically add each weight to every limit on its dimension.
    pub fn increment_usage(
        &self,
        weights: &[QueryWeight],
        timestamp: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        self.ensure_open()?;
        let tables = self.read_tables();
        for weight in weights {
            let Some(cells) = tables.by_dimension.get(&weight.dimension) else {
                continue;
            };
            for cell in cells {
                let mut state = cell.lock();
                state.roll_to(cell.window_at(timestamp));
                state.usage = state.usage.saturating_add(weight.amount);
            }
        }
        Ok(())
    }

    /// Admission check and optimistic increment as one atomic step.
    ///
    /// Every touched limit is locked (ascending id order) for the duration, so
    /// concurrent callers observe each other's reservations.
    pub fn try_reserve(
        &self,
        weights: &[QueryWeight],
        timestamp: DateTime<Utc>,
    ) -> Result<Admission, RegistryError> {
        self.ensure_open()?;
        let tables = self.read_tables();

        let mut cells: Vec<&Arc<LimitCell>> = weights
            .iter()
            .filter_map(|w| tables.by_dimension.get(&w.dimension))
            .flatten()
            .collect();
        cells.sort_by_key(|cell| cell.id);
        cells.dedup_by_key(|cell| cell.id);

        let mut guards: Vec<(LimitId, MutexGuard<'_, UsageState>)> = cells
            .iter()
            .map(|cell| {
                let mut state = cell.lock();
                state.roll_to(cell.window_at(timestamp));
                (cell.id, state)
            })
            .collect();

        let mut claimed: HashMap<LimitId, u64> = HashMap::new();
        for weight in weights {
            let Some(dim_cells) = tables.by_dimension.get(&weight.dimension) else {
                continue;
            };
            for cell in dim_cells {
                let Ok(idx) = guards.binary_search_by_key(&cell.id, |(id, _)| *id) else {
                    continue;
                };
                let state = &guards[idx].1;
                let claim = claimed.entry(cell.id).or_insert(0);
                *claim += u64::from(weight.amount);
                if u64::from(state.usage) + *claim > u64::from(state.limit) {
                    return Ok(Admission::Denied { limit_id: cell.id });
                }
            }
        }

        for (id, state) in guards.iter_mut() {
            if let Some(claim) = claimed.get(&*id) {
                let claim = u32::try_from(*claim).unwrap_or(u32::MAX);
                state.usage = state.usage.saturating_add(claim);
            }
        }
        Ok(Admission::Granted)
    }

    /// Overwrite a limit's usage with a server-reported figure.
    ///
    /// Applied when `timestamp` is not older than the last applied authoritative
    /// update, regardless of the optimistic estimate. Updates for a window that
    /// has already been superseded are stale.
    pub fn update_usage(
        &self,
        limit_id: LimitId,
        usage: u32,
        timestamp: DateTime<Utc>,
    ) -> Result<UsageUpdate, RegistryError> {
        self.ensure_open()?;
        let cell = self
            .read_tables()
            .limits
            .get(&limit_id)
            .cloned()
            .ok_or(RegistryError::UnknownLimit(limit_id))?;

        let window = cell.window_at(timestamp);
        let mut state = cell.lock();
        if state.last_authoritative.is_some_and(|last| timestamp < last) || window < state.window {
            debug!("ignoring stale usage {} for {} at {}", usage, cell.name, timestamp);
            return Ok(UsageUpdate::Stale);
        }
        state.roll_to(window);
        if usage < state.usage {
            debug!(
                "server usage for {} below local estimate ({} < {}); trusting server",
                cell.name, usage, state.usage
            );
        }
        state.usage = usage;
        state.last_authoritative = Some(timestamp);
        Ok(UsageUpdate::Applied)
    }

    pub fn limit_info(&self, limit_id: LimitId) -> Option<RateLimitInfo> {
        if self.is_closed() {
            return None;
        }
        let now = self.clock.now();
        self.read_tables()
            .limits
            .get(&limit_id)
            .map(|cell| cell.snapshot(now))
    }

    /// Snapshot of every registered limit, sorted by name.
    pub fn limits(&self) -> Vec<RateLimitInfo> {
        if self.is_closed() {
            return Vec::new();
        }
        let now = self.clock.now();
        let mut out: Vec<RateLimitInfo> = self
            .read_tables()
            .limits
            .values()
            .map(|cell| cell.snapshot(now))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Usage header name -> limit for `scope`.
    pub fn header_map(&self, scope: &str) -> HashMap<String, LimitId> {
        if self.is_closed() {
            return HashMap::new();
        }
        self.read_tables()
            .headers
            .get(scope)
            .cloned()
            .unwrap_or_default()
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("rate limit registry closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.is_closed() {
            Err(RegistryError::Closed)
        } else {
            Ok(())
        }
    }

    fn read_tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tables(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}
