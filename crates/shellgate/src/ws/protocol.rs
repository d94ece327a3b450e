//! Wire protocol types for the broker WebSocket.
//!
//! Control traffic is JSON text frames; terminal I/O is raw binary.
//! The first client frame on every connection is the auth payload and
//! is parsed into a typed [`AuthIntent`] up front rather than probed
//! for fields deep in the control flow.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Close codes with protocol-level meaning.
pub mod close {
    /// Normal closure (idle expiry, socket superseded by a resume).
    pub const NORMAL: u16 = 1000;
    /// Generic policy violation (IP rate limited, missing credentials).
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Internal or container-engine error.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Server busy or shutting down.
    pub const TRY_AGAIN_LATER: u16 = 1013;
    /// Invalid or mismatched credentials.
    pub const INVALID_CREDENTIALS: u16 = 4001;
    /// Malformed auth payload or authentication timeout.
    pub const INVALID_FORMAT: u16 = 4008;
    /// Inbound message exceeded the configured size ceiling.
    pub const MESSAGE_TOO_LARGE: u16 = 4009;
    /// Session limit reached or registration failed.
    pub const SESSION_LIMIT: u16 = 4013;
    /// Resume attempts rate limited for this session ID.
    pub const RESUME_RATE_LIMITED: u16 = 4029;
}

/// Frames sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Unsolicited status updates ("connecting", "error").
    Status {
        payload: StatusPayload,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Session established; carries the client-presented resume token.
    Hello {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

impl ServerFrame {
    pub fn connecting() -> Self {
        Self::Status {
            payload: StatusPayload::Connecting,
            reason: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Status {
            payload: StatusPayload::Error,
            reason: Some(reason.into()),
        }
    }

    pub fn hello(session_id: impl Into<String>) -> Self {
        Self::Hello {
            session_id: session_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusPayload {
    Connecting,
    Error,
}

/// The first (and only pre-auth) message a client sends.
///
/// Presence of `sessionId` signals resume intent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub environment_variables: Option<HashMap<String, String>>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Credential material presented by the client.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub access_token: Option<String>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.api_key.is_none() && self.access_token.is_none()
    }
}

/// Validated, typed form of the auth payload.
#[derive(Debug, Clone)]
pub enum AuthIntent {
    /// Start a new session.
    Fresh {
        credentials: Credentials,
        env: HashMap<String, String>,
    },
    /// Reattach to a previously issued session.
    Resume {
        session_id: String,
        credentials: Credentials,
        env: HashMap<String, String>,
    },
}

impl From<AuthRequest> for AuthIntent {
    fn from(req: AuthRequest) -> Self {
        let credentials = Credentials {
            api_key: req.api_key,
            access_token: req.access_token,
        };
        let env = req.environment_variables.unwrap_or_default();
        match req.session_id {
            Some(session_id) if !session_id.is_empty() => AuthIntent::Resume {
                session_id,
                credentials,
                env,
            },
            _ => AuthIntent::Fresh { credentials, env },
        }
    }
}

impl AuthIntent {
    pub fn credentials(&self) -> &Credentials {
        match self {
            AuthIntent::Fresh { credentials, .. } => credentials,
            AuthIntent::Resume { credentials, .. } => credentials,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connecting_frame_matches_wire_format() {
        let json = serde_json::to_string(&ServerFrame::connecting()).unwrap();
        assert_eq!(json, r#"{"type":"status","payload":"connecting"}"#);
    }

    #[test]
    fn error_frame_carries_reason() {
        let json = serde_json::to_string(&ServerFrame::error("rate limited")).unwrap();
        assert_eq!(
            json,
            r#"{"type":"status","payload":"error","reason":"rate limited"}"#
        );
    }

    #[test]
    fn hello_frame_uses_camel_case_session_id() {
        let json = serde_json::to_string(&ServerFrame::hello("abc")).unwrap();
        assert_eq!(json, r#"{"type":"hello","sessionId":"abc"}"#);
    }

    #[test]
    fn auth_request_with_session_id_is_resume() {
        let req: AuthRequest =
            serde_json::from_str(r#"{"apiKey":"k","sessionId":"s-1"}"#).unwrap();
        match AuthIntent::from(req) {
            AuthIntent::Resume { session_id, credentials, .. } => {
                assert_eq!(session_id, "s-1");
                assert_eq!(credentials.api_key.as_deref(), Some("k"));
            }
            other => panic!("expected resume intent, got {:?}", other),
        }
    }

    #[test]
    fn auth_request_without_session_id_is_fresh() {
        let req: AuthRequest = serde_json::from_str(r#"{"accessToken":"t"}"#).unwrap();
        assert!(matches!(AuthIntent::from(req), AuthIntent::Fresh { .. }));
    }

    #[test]
    fn empty_session_id_falls_back_to_fresh() {
        let req: AuthRequest =
            serde_json::from_str(r#"{"apiKey":"k","sessionId":""}"#).unwrap();
        assert!(matches!(AuthIntent::from(req), AuthIntent::Fresh { .. }));
    }
}
