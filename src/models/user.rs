use serde::{Deserialize, Serialize};

/// JWT claims attached to authenticated requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub name: String,
    pub email: String,
    pub exp: usize,
}
