//! Container configuration and per-session creation specs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::{ContainerError, ContainerResult};

/// Label recording the owning session ID.
pub const LABEL_SESSION: &str = "shellgate.session";
/// Label recording the owning server process identity (PID).
pub const LABEL_OWNER: &str = "shellgate.owner";
/// Label recording the credential hash authorizing resume.
pub const LABEL_CREDENTIAL: &str = "shellgate.credential";

/// Container runtime configuration, loaded from the `[container]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime type: "docker" or "podman" (auto-detected if not set).
    pub runtime: Option<super::RuntimeType>,
    /// Custom path to the container runtime binary.
    pub binary: Option<String>,
    /// Sandbox image for sessions.
    pub image: String,
    /// Build context used when the image is missing.
    pub build_context: Option<String>,
    /// Rebuild the image even if it already exists.
    pub force_rebuild: bool,
    /// Hard ceiling for an image build, in seconds.
    pub build_timeout_secs: u64,
    /// Memory ceiling per session container, in MiB.
    pub memory_limit_mb: u64,
    /// Process-count ceiling per session container.
    pub pids_limit: u32,
    /// Network mode for session containers.
    pub network_mode: String,
    /// Linux capabilities retained after dropping all.
    pub cap_allow: Vec<String>,
    /// Interactive shell launched in the container.
    pub shell: String,
    /// Age beyond which an unowned container is reclaimed at startup,
    /// in seconds. Containers younger than this survive a restart so
    /// cross-process resume can find them.
    pub stale_after_secs: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            image: "shellgate-sandbox:latest".to_string(),
            build_context: None,
            force_rebuild: false,
            build_timeout_secs: 600,
            memory_limit_mb: 512,
            pids_limit: 128,
            network_mode: "none".to_string(),
            cap_allow: vec![
                "CHOWN".to_string(),
                "SETUID".to_string(),
                "SETGID".to_string(),
            ],
            shell: "/bin/bash".to_string(),
            stale_after_secs: 900,
        }
    }
}

/// Everything needed to create one session's container.
#[derive(Debug, Clone, Default)]
pub struct SessionContainerSpec {
    /// Session ID, recorded as a label for cross-process discovery.
    pub session_id: String,
    /// Credential hash, recorded as a label to authorize resume.
    pub credential_hash: String,
    /// Client-supplied environment variables.
    pub env: HashMap<String, String>,
}

impl SessionContainerSpec {
    /// Validate all fields before they are turned into engine arguments.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_session_id(&self.session_id)?;
        validate_credential_hash(&self.credential_hash)?;
        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }
        Ok(())
    }
}

/// Validate a session identifier (UUID-shaped: hex and hyphens).
pub fn validate_session_id(id: &str) -> ContainerResult<()> {
    if id.is_empty() || id.len() > 64 {
        return Err(ContainerError::InvalidInput(
            "session ID must be 1-64 characters".to_string(),
        ));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ContainerError::InvalidInput(format!(
            "session ID '{}' contains invalid characters",
            id
        )));
    }
    Ok(())
}

fn validate_credential_hash(hash: &str) -> ContainerResult<()> {
    if hash.is_empty() || hash.len() > 128 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ContainerError::InvalidInput(
            "credential hash must be a hex digest".to_string(),
        ));
    }
    Ok(())
}

/// Validate an environment variable key.
pub fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() || key.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "env var key must be 1-256 characters".to_string(),
        ));
    }
    let mut chars = key.chars();
    let first = chars.next().unwrap_or('0');
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "env var key '{}' must start with a letter or underscore",
            key
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "env var key '{}' contains invalid characters",
            key
        )));
    }
    Ok(())
}

/// Validate an image name.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() || image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name must be 1-256 characters".to_string(),
        ));
    }
    let valid = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':');
    if !image.chars().all(valid) || image.starts_with('-') {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }
    Ok(())
}

/// Validate a container ID or name.
///
/// Container IDs are hex strings; our container names are
/// "shellgate-" plus a session ID.
pub fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() || id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name must be 1-128 characters".to_string(),
        ));
    }
    let valid = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_validation() {
        assert!(validate_session_id("a1b2c3d4-e5f6-7890-abcd-ef0123456789").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("bad id").is_err());
        assert!(validate_session_id("x;rm -rf /").is_err());
    }

    #[test]
    fn env_key_validation() {
        assert!(validate_env_var_key("PATH").is_ok());
        assert!(validate_env_var_key("_PRIVATE").is_ok());
        assert!(validate_env_var_key("1BAD").is_err());
        assert!(validate_env_var_key("HAS-DASH").is_err());
        assert!(validate_env_var_key("").is_err());
    }

    #[test]
    fn image_name_validation() {
        assert!(validate_image_name("shellgate-sandbox:latest").is_ok());
        assert!(validate_image_name("registry.local/ns/app:1.2").is_ok());
        assert!(validate_image_name("bad image").is_err());
        assert!(validate_image_name("-leading").is_err());
    }

    #[test]
    fn spec_validation_covers_all_fields() {
        let mut spec = SessionContainerSpec {
            session_id: "s-1".to_string(),
            credential_hash: "deadbeef".to_string(),
            env: Default::default(),
        };
        assert!(spec.validate().is_ok());

        spec.env.insert("BAD KEY".to_string(), "v".to_string());
        assert!(spec.validate().is_err());
    }
}
