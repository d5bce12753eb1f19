use std::time::{Duration, Instant};

const HARD_CAP_MIN_MS: u64 = 5_000;
const HARD_CAP_MAX_MS: u64 = 120_000;
const HARD_CAP_DEFAULT_MS: u64 = 25_000;

const STAGE_MIN_FLOOR_MS: u64 = 250;
const STAGE_MIN_CEIL_MS: u64 = 60_000;
const SAFETY_MAX_MS: u64 = 20_000;

/// Wall-clock deadline tracker for a single invocation.
///
/// Every upstream call derives its timeout through [`Budget::clamp_stage_timeout`]
/// so a slow stage cannot starve a later mandatory one.
#[derive(Debug, Clone)]
pub struct Budget {
    started_at: Instant,
    total: Duration,
    hard_cap_ms: u64,
}

/// Per-stage timeout knobs. All fields have sane defaults via [`Default`].
#[derive(Debug, Clone, Copy)]
pub struct StageLimits {
    pub desired_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub safety_margin_ms: u64,
}

impl Default for StageLimits {
    fn default() -> Self {
        Self {
            desired_ms: 8_000,
            min_ms: 2_500,
            max_ms: 8_000,
            safety_margin_ms: 1_200,
        }
    }
}

impl Budget {
    /// Start a budget from a hard server-side cap plus an optional
    /// caller-supplied deadline. The caller's value never exceeds the cap.
    pub fn start(hard_cap_ms: u64, client_deadline_ms: Option<u64>) -> Self {
        let hard_cap = hard_cap_ms.clamp(HARD_CAP_MIN_MS, HARD_CAP_MAX_MS);
        let total_ms = match client_deadline_ms {
            Some(requested) => requested.clamp(HARD_CAP_MIN_MS, hard_cap),
            None => hard_cap,
        };
        Self {
            started_at: Instant::now(),
            total: Duration::from_millis(total_ms),
            hard_cap_ms: hard_cap,
        }
    }

    /// Budget with the default 25s hard cap.
    pub fn default_cap() -> Self {
        Self::start(HARD_CAP_DEFAULT_MS, None)
    }

    pub fn total_ms(&self) -> u64 {
        self.total.as_millis() as u64
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn remaining_ms(&self) -> u64 {
        self.total_ms().saturating_sub(self.elapsed_ms())
    }

    pub fn expired(&self) -> bool {
        self.remaining_ms() == 0
    }

    /// True when less than `min_remaining_ms` is left, i.e. the next
    /// stage should be left for a future cycle instead of started now.
    pub fn should_defer_stage(&self, min_remaining_ms: u64) -> bool {
        let min = min_remaining_ms.clamp(500, self.hard_cap_ms);
        self.remaining_ms() < min
    }

    /// `clamp(remaining - safety, min, min(desired, max))` with all knobs
    /// themselves clamped to sane bounds. Never returns more than remains.
    pub fn clamp_stage_timeout(&self, limits: StageLimits) -> Duration {
        Duration::from_millis(clamp_stage_timeout_ms(self.remaining_ms(), limits))
    }
}

/// Pure clamp, separated from the clock so callers with an externally
/// tracked remaining value (and tests) can use it directly.
pub fn clamp_stage_timeout_ms(remaining_ms: u64, limits: StageLimits) -> u64 {
    let min = limits.min_ms.clamp(STAGE_MIN_FLOOR_MS, STAGE_MIN_CEIL_MS);
    let max = limits.max_ms.clamp(min, STAGE_MIN_CEIL_MS);
    let ceiling = limits.desired_ms.min(max);
    let safety = limits.safety_margin_ms.min(SAFETY_MAX_MS);

    let raw = remaining_ms.saturating_sub(safety);
    raw.clamp(min, ceiling.max(min))
}
