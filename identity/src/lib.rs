pub mod cache;
pub mod client;
pub mod metrics_defs;
pub mod types;

pub use client::{IdentityClient, IdentityError, TOKEN_PREFIX};
pub use types::TenantContext;
