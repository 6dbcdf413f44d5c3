//! Environment-driven configuration for the control plane CLIs.
//!
//! There is no hot-reload here and no file watcher: every binary in this
//! workspace is a short-lived process invoked once per operation, so
//! configuration is read once from the environment at startup. Loading never
//! panics and never fails outright — a missing signing key, for instance, is
//! only an error once a gate that actually needs one (G4) asks for it.

use std::env;
use std::path::PathBuf;

pub const ENV_ROOT: &str = "CONTROL_PLANE_ROOT";
pub const ENV_SIGNING_KEY: &str = "CONTROL_PLANE_SIGNING_KEY";
pub const ENV_ALLOW_UNSIGNED: &str = "CONTROL_PLANE_ALLOW_UNSIGNED";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set and no default root was supplied")]
    MissingRoot(&'static str),
    #[error("signing key required but {0} is not set (set {1}=true to waive in development)")]
    MissingSigningKey(&'static str, &'static str),
}

/// Parses `CONTROL_PLANE_ALLOW_UNSIGNED`-style booleans the way the rest of
/// the control plane's shell tooling does: `1`/`true`/`yes` (any case) are
/// truthy, everything else — including unset — is falsy.
fn parse_bool_env(key: &str) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => false,
    }
}

/// Resolved configuration for a control-plane CLI invocation.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// HO3 root directory. Required for every operation; callers that also
    /// accept a `--root` CLI flag should prefer that over this when present.
    pub root: PathBuf,
    /// HMAC-SHA256 signing key, if configured. `None` only fails the
    /// operations that need a key (G4 signing, G5 verification without
    /// `allow_unsigned`).
    pub signing_key: Option<String>,
    /// Development waiver for unsigned archives. Should never be set in a
    /// production deployment; see the spec's Open Questions on strict mode.
    pub allow_unsigned: bool,
}

impl ControlPlaneConfig {
    /// Load configuration from the environment. `default_root` is used when
    /// `CONTROL_PLANE_ROOT` is unset, for callers (like tests, or a CLI with
    /// its own `--root` flag) that already have a root in hand.
    pub fn from_env(default_root: Option<PathBuf>) -> Result<Self, ConfigError> {
        let root = match env::var(ENV_ROOT) {
            Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
            _ => default_root.ok_or(ConfigError::MissingRoot(ENV_ROOT))?,
        };
        let signing_key = env::var(ENV_SIGNING_KEY).ok().filter(|v| !v.is_empty());
        let allow_unsigned = parse_bool_env(ENV_ALLOW_UNSIGNED);
        Ok(Self {
            root,
            signing_key,
            allow_unsigned,
        })
    }

    /// The signing key, or an error naming the env var a caller should set.
    /// Gates that actually need to sign or strictly verify call this instead
    /// of matching on `signing_key` themselves.
    pub fn require_signing_key(&self) -> Result<&str, ConfigError> {
        self.signing_key
            .as_deref()
            .ok_or(ConfigError::MissingSigningKey(ENV_SIGNING_KEY, ENV_ALLOW_UNSIGNED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests that
    // touch them so they don't interleave.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        env::remove_var(ENV_ROOT);
        env::remove_var(ENV_SIGNING_KEY);
        env::remove_var(ENV_ALLOW_UNSIGNED);
    }

    #[test]
    fn missing_root_without_default_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let err = ControlPlaneConfig::from_env(None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRoot(_)));
    }

    #[test]
    fn default_root_used_when_env_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let cfg = ControlPlaneConfig::from_env(Some(PathBuf::from("/srv/control-plane"))).unwrap();
        assert_eq!(cfg.root, PathBuf::from("/srv/control-plane"));
        assert!(cfg.signing_key.is_none());
        assert!(!cfg.allow_unsigned);
    }

    #[test]
    fn env_root_takes_precedence_over_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var(ENV_ROOT, "/env/root");
        let cfg = ControlPlaneConfig::from_env(Some(PathBuf::from("/default/root"))).unwrap();
        assert_eq!(cfg.root, PathBuf::from("/env/root"));
        clear_env();
    }

    #[test]
    fn missing_signing_key_only_errors_when_required() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let cfg = ControlPlaneConfig::from_env(Some(PathBuf::from("/root"))).unwrap();
        assert!(cfg.require_signing_key().is_err());
    }

    #[test]
    fn allow_unsigned_accepts_common_truthy_spellings() {
        let _guard = ENV_LOCK.lock().unwrap();
        for v in ["1", "true", "TRUE", "yes", "YES"] {
            clear_env();
            env::set_var(ENV_ALLOW_UNSIGNED, v);
            let cfg = ControlPlaneConfig::from_env(Some(PathBuf::from("/root"))).unwrap();
            assert!(cfg.allow_unsigned, "expected {v:?} to parse as truthy");
        }
        clear_env();
    }

    #[test]
    fn signing_key_present_when_set() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var(ENV_SIGNING_KEY, "dev-secret");
        let cfg = ControlPlaneConfig::from_env(Some(PathBuf::from("/root"))).unwrap();
        assert_eq!(cfg.require_signing_key().unwrap(), "dev-secret");
        clear_env();
    }
}
