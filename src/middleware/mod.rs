pub mod auth;
pub mod rate_limit;

pub use auth::{authenticate_request, device_info_snapshot, extract_credentials, require_user, Credentials};
pub use rate_limit::{ai_rate_limit, api_rate_limit, RateLimiter};
