pub mod backoff;
pub mod subscribe;
pub mod time;

pub use backoff::{calculate_backoff_millis, BackoffConfig, MAX_BACKOFF_MILLIS, RANDOM_FACTOR};
pub use subscribe::{Disposer, Unsubscribe};
pub use time::{now_millis, now_rfc3339, DAY_MILLIS};
