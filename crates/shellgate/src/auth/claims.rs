//! JWT claims.

use serde::{Deserialize, Serialize};

/// JWT claims structure.
///
/// Only the standard registered claims are interpreted; anything else a
/// token carries is ignored at this layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,

    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,

    /// Audience.
    #[serde(default)]
    pub aud: Option<Vec<String>>,

    /// Expiration time (as Unix timestamp).
    pub exp: i64,

    /// Issued at (as Unix timestamp).
    #[serde(default)]
    pub iat: Option<i64>,

    /// Not before (as Unix timestamp).
    #[serde(default)]
    pub nbf: Option<i64>,

    /// JWT ID.
    #[serde(default)]
    pub jti: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_minimal_claims() {
        let claims: Claims = serde_json::from_str(r#"{"sub":"u1","exp":253402300799}"#).unwrap();
        assert_eq!(claims.sub, "u1");
        assert!(claims.iss.is_none());
    }
}
