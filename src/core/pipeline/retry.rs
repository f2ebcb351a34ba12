use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

use super::error::{PipelineError, Stage};

/// Exponential backoff for transient stage failures.
///
/// Retries happen inside the stage deadline, so a slow service still fails
/// the turn on time no matter how many attempts remain.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    /// Default: 1
    pub max_retries: u32,

    /// Delay before the first retry (milliseconds).
    /// Default: 200ms
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay (milliseconds).
    /// Default: 2000ms
    pub max_delay_ms: u64,

    /// Multiplier applied per attempt.
    /// Default: 2.0
    pub backoff_multiplier: f32,

    /// Spread delays by up to ±25%.
    /// Default: true
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_delay_ms: 200,
            max_delay_ms: 2000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), in milliseconds.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let base_delay = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier as f64;

        let delay = base_delay * multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = delay.min(self.max_delay_ms as f64);

        if self.jitter {
            let jitter = rand_jitter(delay * 0.25, attempt);
            (delay + jitter).max(0.0) as u64
        } else {
            delay as u64
        }
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    pub async fn run<T, F, Fut>(&self, stage: Stage, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay_ms = self.delay_for(attempt);
                    warn!(
                        %stage,
                        attempt,
                        delay_ms,
                        error = %err,
                        "Transient pipeline failure, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Distinguishes jitter draws taken within the same clock tick.
static JITTER_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Pseudo-random jitter in `-range..=range`.
///
/// Seeded from the clock, a process-wide draw counter and the attempt number,
/// then mixed with the splitmix64 finalizer.
fn rand_jitter(range: f64, attempt: u32) -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let draw = JITTER_SEQUENCE.fetch_add(1, Ordering::Relaxed);

    let mut z = nanos
        ^ draw.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ u64::from(attempt).rotate_left(32);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;

    let normalized = (z >> 11) as f64 / (1u64 << 53) as f64;
    (normalized - 0.5) * 2.0 * range
}
