//! Conditions that end a worker run before a shutdown signal arrives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};

/// Limits checked between batches. In-flight messages always finish first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopLimits {
    /// Stop after this many deliveries were handled.
    pub max_messages: Option<u64>,
    /// Stop after this much wall-clock time.
    pub max_runtime: Option<Duration>,
    /// Stop once resident memory reaches this many bytes.
    pub memory_limit_bytes: Option<u64>,
}

impl StopLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_max_messages(mut self, max: u64) -> Self {
        self.max_messages = Some(max);
        self
    }

    pub fn with_max_runtime(mut self, runtime: Duration) -> Self {
        self.max_runtime = Some(runtime);
        self
    }

    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_bytes = Some(mb * 1024 * 1024);
        self
    }
}

/// Why a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    Shutdown,
    MessageLimit,
    RuntimeLimit,
    MemoryLimit,
}

/// Tracks progress of one run against its [`StopLimits`].
#[derive(Debug)]
pub struct LimitTracker {
    limits: StopLimits,
    started: Instant,
    handled: AtomicU64,
}

impl LimitTracker {
    pub fn new(limits: StopLimits) -> Self {
        Self {
            limits,
            started: Instant::now(),
            handled: AtomicU64::new(0),
        }
    }

    pub fn record(&self, count: u64) {
        self.handled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Deliveries left before the message limit, if any.
    pub fn remaining_messages(&self) -> Option<u64> {
        self.limits
            .max_messages
            .map(|max| max.saturating_sub(self.handled()))
    }

    pub fn check(&self) -> Option<StopReason> {
        self.check_with_memory(resident_memory_bytes)
    }

    fn check_with_memory(&self, probe: impl Fn() -> Option<u64>) -> Option<StopReason> {
        if self.remaining_messages() == Some(0) {
            return Some(StopReason::MessageLimit);
        }

        if let Some(max) = self.limits.max_runtime
            && self.started.elapsed() >= max
        {
            return Some(StopReason::RuntimeLimit);
        }

        if let Some(limit) = self.limits.memory_limit_bytes
            && probe().is_some_and(|rss| rss >= limit)
        {
            return Some(StopReason::MemoryLimit);
        }

        None
    }
}

const PAGE_SIZE: u64 = 4096;

/// Resident set size of this process, from `/proc/self/statm`.
///
/// Returns `None` where procfs is unavailable, which disables the memory limit.
pub fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    parse_statm_rss(&statm)
}

fn parse_statm_rss(statm: &str) -> Option<u64> {
    statm
        .split_whitespace()
        .nth(1)
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * PAGE_SIZE)
}
