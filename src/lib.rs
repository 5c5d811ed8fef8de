pub mod config;
pub mod credential;
pub mod error;
pub mod ledger;
pub mod limits;
pub mod logging;
pub mod pool;
pub mod rotating;
pub mod usage;
pub mod util;

pub use error::{Error, Result};
pub use ledger::{Settlement, UsageSnapshot};
pub use limits::{LimitTable, RateLimitStrategy, RateLimits};
pub use pool::{CredentialPool, KeyUsageHandle, PoolOptions, WaitPolicy};
pub use rotating::{RotatingClient, is_rate_limit_error};
