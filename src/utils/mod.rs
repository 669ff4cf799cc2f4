pub mod batched;
pub mod cached;
pub mod progress;
pub mod retry;

pub use batched::Batched;
pub use cached::Cached;
pub use progress::{format_bytes, format_duration};
pub use retry::{retry, retry_with_config, RetryBuilder, RetryConfig, RetryStrategy, Retrying};
