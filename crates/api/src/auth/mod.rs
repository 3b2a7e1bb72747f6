//! Authentication module for Creditledger

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager, SUPABASE_AUDIENCE};
pub use middleware::{require_auth, AuthError, AuthState, AuthUser};
