//! Token authentication and auth rate limiting.

pub mod rate_limit;
pub mod users;

pub use rate_limit::AuthRateLimit;
pub use users::{token_digest, UserDirectory, UserRecord};
