//! Authentication models
//! Mission: the shape of a verified caller. Token issuance lives in the
//! external user service; this core only verifies.

use serde::{Deserialize, Serialize};

/// JWT claims payload as issued by the external user service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // subject (user id)
    pub username: String,
    pub role: String,
    pub exp: usize, // expiration timestamp
}

impl Claims {
    pub fn into_identity(self) -> crate::models::CallerIdentity {
        crate::models::CallerIdentity {
            user_id: self.sub,
            username: self.username,
            role: self.role,
        }
    }
}
