//! Authentication
//! Mission: verify bearer tokens issued by the external user service.
//! Issuance and password handling live outside this core.

pub mod jwt;
pub mod middleware;
pub mod models;

pub use jwt::JwtHandler;
pub use middleware::extract_token;
pub use models::Claims;
