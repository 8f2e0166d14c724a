//! Resource budgets.
//!
//! Memory, CPU and storage are gauges: a permit holds its amount until it is
//! dropped. API-rate is a fixed window counter: consumption is never given
//! back, it simply expires when the window rolls over.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A budgeted resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Megabytes of working memory.
    Memory,
    /// Concurrent worker slots.
    Cpu,
    /// Megabytes of upload storage.
    Storage,
    /// Outbound API calls per window.
    ApiRate,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [Self::Memory, Self::Cpu, Self::Storage, Self::ApiRate];

    /// Name used in config keys and events.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Storage => "storage",
            Self::ApiRate => "api_rate",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An amount of one resource that an action needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDemand {
    pub resource: ResourceKind,
    pub amount: u64,
}

impl ResourceDemand {
    /// A demand for `amount` units of `resource`.
    #[must_use]
    pub fn new(resource: ResourceKind, amount: u64) -> Self {
        Self { resource, amount }
    }

    /// One API call.
    #[must_use]
    pub fn api_call() -> Self {
        Self::new(ResourceKind::ApiRate, 1)
    }
}

/// Fixed window rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRateLimit {
    #[serde(default = "default_api_limit")]
    pub limit: u64,
    #[serde(default = "default_api_window_ms")]
    pub window_ms: u64,
}

fn default_api_limit() -> u64 {
    60
}

fn default_api_window_ms() -> u64 {
    60_000
}

impl Default for ApiRateLimit {
    fn default() -> Self {
        Self {
            limit: default_api_limit(),
            window_ms: default_api_window_ms(),
        }
    }
}

/// Declared limits for every resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_memory_mb")]
    pub memory: u64,
    #[serde(default = "default_cpu")]
    pub cpu: u64,
    #[serde(default = "default_storage_mb")]
    pub storage: u64,
    #[serde(default)]
    pub api_rate: ApiRateLimit,
}

fn default_memory_mb() -> u64 {
    1024
}

fn default_cpu() -> u64 {
    4
}

fn default_storage_mb() -> u64 {
    4096
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: default_memory_mb(),
            cpu: default_cpu(),
            storage: default_storage_mb(),
            api_rate: ApiRateLimit::default(),
        }
    }
}

impl ResourceLimits {
    /// Sets the CPU slot limit.
    #[must_use]
    pub fn with_cpu(mut self, cpu: u64) -> Self {
        self.cpu = cpu;
        self
    }

    /// Allows `limit` API calls per `window`.
    #[must_use]
    pub fn with_api_rate(mut self, limit: u64, window: Duration) -> Self {
        self.api_rate = ApiRateLimit {
            limit,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
        };
        self
    }

    /// Configured limit for `resource`.
    #[must_use]
    pub fn limit(&self, resource: ResourceKind) -> u64 {
        match resource {
            ResourceKind::Memory => self.memory,
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Storage => self.storage,
            ResourceKind::ApiRate => self.api_rate.limit,
        }
    }
}

#[derive(Debug)]
struct Gauge {
    limit: u64,
    consumed: AtomicU64,
}

impl Gauge {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            consumed: AtomicU64::new(0),
        }
    }

    fn try_acquire(&self, amount: u64) -> bool {
        self.consumed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(amount).filter(|next| *next <= self.limit)
            })
            .is_ok()
    }

    fn release(&self, amount: u64) {
        // Saturate so a double release can never wrap the counter.
        let _ = self
            .consumed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(amount))
            });
    }

    fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct WindowState {
    count: u64,
    window_start: Instant,
}

#[derive(Debug)]
struct RateWindow {
    limit: u64,
    window: Duration,
    state: Mutex<WindowState>,
}

impl RateWindow {
    fn new(limit: &ApiRateLimit) -> Self {
        Self {
            limit: limit.limit,
            window: Duration::from_millis(limit.window_ms),
            state: Mutex::new(WindowState {
                count: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Consumes `amount` from the current window, or returns the time left
    /// until the window resets.
    fn try_acquire(&self, amount: u64) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(state.window_start);
        if elapsed >= self.window {
            state.window_start = now;
            state.count = 0;
        }

        match state.count.checked_add(amount) {
            Some(next) if next <= self.limit => {
                state.count = next;
                Ok(())
            }
            _ => {
                let resets_in = self
                    .window
                    .saturating_sub(now.duration_since(state.window_start));
                Err(resets_in.max(Duration::from_millis(1)))
            }
        }
    }

    fn consumed(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.window_start.elapsed() >= self.window {
            0
        } else {
            state.count
        }
    }
}

/// Live counters for every resource.
#[derive(Debug)]
pub(crate) struct ResourceBudgets {
    limits: ResourceLimits,
    memory: Gauge,
    cpu: Gauge,
    storage: Gauge,
    api_rate: RateWindow,
}

/// Outcome of a failed acquisition.
pub(crate) enum AcquireFailure {
    Exhausted(Option<Duration>),
    ExceedsLimit(u64),
}

impl ResourceBudgets {
    pub(crate) fn new(limits: ResourceLimits) -> Self {
        Self {
            memory: Gauge::new(limits.memory),
            cpu: Gauge::new(limits.cpu),
            storage: Gauge::new(limits.storage),
            api_rate: RateWindow::new(&limits.api_rate),
            limits,
        }
    }

    pub(crate) fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn gauge(&self, resource: ResourceKind) -> Option<&Gauge> {
        match resource {
            ResourceKind::Memory => Some(&self.memory),
            ResourceKind::Cpu => Some(&self.cpu),
            ResourceKind::Storage => Some(&self.storage),
            ResourceKind::ApiRate => None,
        }
    }

    pub(crate) fn acquire(
        self: &Arc<Self>,
        demand: ResourceDemand,
    ) -> Result<ResourcePermit, AcquireFailure> {
        let limit = self.limits.limit(demand.resource);
        if demand.amount > limit {
            return Err(AcquireFailure::ExceedsLimit(limit));
        }

        match self.gauge(demand.resource) {
            Some(gauge) => {
                if !gauge.try_acquire(demand.amount) {
                    return Err(AcquireFailure::Exhausted(None));
                }
            }
            None => self
                .api_rate
                .try_acquire(demand.amount)
                .map_err(|resets_in| AcquireFailure::Exhausted(Some(resets_in)))?,
        }

        Ok(ResourcePermit {
            budgets: Arc::clone(self),
            demand,
        })
    }

    fn release(&self, demand: ResourceDemand) {
        if let Some(gauge) = self.gauge(demand.resource) {
            gauge.release(demand.amount);
        }
    }

    pub(crate) fn consumed(&self, resource: ResourceKind) -> u64 {
        match self.gauge(resource) {
            Some(gauge) => gauge.consumed(),
            None => self.api_rate.consumed(),
        }
    }
}

/// Holds an acquired amount of a resource.
///
/// Gauge resources are returned to the budget when the permit is dropped.
/// API-rate permits only record that the call was admitted.
#[derive(Debug)]
#[must_use = "dropping a permit releases the resource immediately"]
pub struct ResourcePermit {
    budgets: Arc<ResourceBudgets>,
    demand: ResourceDemand,
}

impl ResourcePermit {
    /// Resource this permit holds.
    #[must_use]
    pub fn resource(&self) -> ResourceKind {
        self.demand.resource
    }

    /// Units held.
    #[must_use]
    pub fn amount(&self) -> u64 {
        self.demand.amount
    }
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        self.budgets.release(self.demand);
    }
}

/// Usage of one resource at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub resource: ResourceKind,
    pub limit: u64,
    pub consumed: u64,
}

/// Usage of every resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetSnapshot {
    pub resources: Vec<ResourceUsage>,
}

impl BudgetSnapshot {
    /// Usage of one resource, if it is tracked.
    #[must_use]
    pub fn usage(&self, resource: ResourceKind) -> Option<ResourceUsage> {
        self.resources.iter().copied().find(|u| u.resource == resource)
    }
}
