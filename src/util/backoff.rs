use rand::Rng;

pub const DEFAULT_INTERVAL_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
/// Upper bound for the delay between two reconnect attempts of a push stream.
pub const MAX_BACKOFF_MILLIS: u64 = 60 * 1_000;
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub interval_millis: u64,
    pub backoff_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            interval_millis: DEFAULT_INTERVAL_MILLIS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

/// Jittered exponential delay for the given number of consecutive failures.
pub fn calculate_backoff_millis(failures: u32) -> u64 {
    calculate_backoff_with_rng(failures, BackoffConfig::default(), &mut rand::thread_rng())
}

fn calculate_backoff_with_rng<R: Rng + ?Sized>(
    failures: u32,
    config: BackoffConfig,
    rng: &mut R,
) -> u64 {
    let exponent = failures.min(16) as i32;
    let base = (config.interval_millis as f64) * config.backoff_factor.powi(exponent);
    let jitter = RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0);
    let value = (base + jitter)
        .round()
        .clamp(0.0, MAX_BACKOFF_MILLIS as f64);
    value as u64
}
