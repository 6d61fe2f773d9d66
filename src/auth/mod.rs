pub mod fingerprint;
pub mod machine_id;
pub mod model_access;
pub mod oauth_store;
pub mod rate_limit;
pub mod refresh;
pub mod session_binding;
pub mod session_pool;
pub mod token_manager;
pub mod types;
pub mod usage;

pub use fingerprint::{Fingerprint, FingerprintManager};
pub use machine_id::MachineIdStore;
pub use model_access::AccountLevel;
pub use oauth_store::OAuthTokenStore;
pub use rate_limit::RateLimiter;
pub use session_binding::{extract_session_id, SessionBindingManager};
pub use session_pool::{calculate_cooldown_duration, SessionPoolManager};
pub use token_manager::TokenManager;
pub use types::{AuthConfig, AuthKind, TokenInfo};
