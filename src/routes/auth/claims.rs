use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Claims {
    pub sub: String, // opaque user id from the identity provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub exp: usize, // expiration (as UNIX timestamp)
    pub iss: String,
    pub aud: String,
}
