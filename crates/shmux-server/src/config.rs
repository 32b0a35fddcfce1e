//! Server configuration: TOML file + CLI overrides.

use crate::auth::{AuthProvider, RoleTableProvider, TableUser, TokenProvider};
use serde::Deserialize;
use shmux_core::{ShmuxError, ShmuxResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub limits: LimitsSection,
    pub container: ContainerSection,
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
    /// Path clients connect to for the WebSocket upgrade.
    pub path: String,
    pub default_shell: String,
    pub default_cwd: Option<String>,
    /// Whitelist of local shells (empty = any).
    pub allowed_shells: Vec<String>,
    /// Whitelist of working-directory prefixes (empty = any).
    pub allowed_paths: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            path: default_ws_path(),
            default_shell: default_shell(),
            default_cwd: None,
            allowed_shells: Vec::new(),
            allowed_paths: Vec::new(),
        }
    }
}

/// `[limits]` section: capacity and timers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub max_sessions_total: usize,
    pub max_sessions_per_client: usize,
    pub max_clients_per_session: usize,
    /// Milliseconds; 0 disables idle reaping.
    pub idle_timeout: u64,
    /// Milliseconds a session may be client-less before it is closed.
    pub orphan_timeout: u64,
    /// Per-session history capacity in characters.
    pub history_size: usize,
    pub history_enabled: bool,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_sessions_total: default_max_sessions_total(),
            max_sessions_per_client: default_max_sessions_per_client(),
            max_clients_per_session: default_max_clients_per_session(),
            idle_timeout: 0,
            orphan_timeout: default_orphan_timeout(),
            history_size: default_history_size(),
            history_enabled: true,
        }
    }
}

/// `[container]` section: container runtime support.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerSection {
    pub enabled: bool,
    pub runtime_path: String,
    pub default_shell: String,
    /// Whitelist of container id/name patterns (regex, falling back to
    /// exact-or-prefix match). Empty = any when container exec is enabled.
    pub allowed_patterns: Vec<String>,
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            runtime_path: default_runtime_path(),
            default_shell: default_shell(),
            allowed_patterns: Vec::new(),
        }
    }
}

/// One `[[auth.users]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthUserEntry {
    pub id: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// `[auth]` section: permission-gate policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// `none`, `token`, or `table`.
    pub mode: String,
    pub require_auth: bool,
    pub allow_anonymous: bool,
    /// Shared secret for `mode = "token"` (UTF-8 bytes).
    pub token_secret: Option<String>,
    pub anonymous_permissions: Vec<String>,
    pub users: Vec<AuthUserEntry>,
    pub roles: HashMap<String, Vec<String>>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            mode: "none".to_string(),
            require_auth: false,
            allow_anonymous: false,
            token_secret: None,
            anonymous_permissions: Vec::new(),
            users: Vec::new(),
            roles: HashMap::new(),
        }
    }
}

fn default_port() -> u16 {
    3000
}
fn default_ws_path() -> String {
    "/terminal".to_string()
}
fn default_shell() -> String {
    "/bin/bash".to_string()
}
fn default_runtime_path() -> String {
    "docker".to_string()
}
fn default_max_sessions_total() -> usize {
    100
}
fn default_max_sessions_per_client() -> usize {
    10
}
fn default_max_clients_per_session() -> usize {
    10
}
fn default_orphan_timeout() -> u64 {
    300_000
}
fn default_history_size() -> usize {
    256 * 1024
}

/// Resolved server configuration: file values merged with CLI overrides,
/// the auth policy constructed.
#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub ws_path: String,
    pub default_shell: String,
    pub default_cwd: Option<String>,
    pub allowed_shells: Vec<String>,
    pub allowed_paths: Vec<String>,
    pub max_sessions_total: usize,
    pub max_sessions_per_client: usize,
    pub max_clients_per_session: usize,
    /// Milliseconds; 0 disables idle reaping.
    pub idle_timeout: u64,
    /// Milliseconds before an orphaned session is closed.
    pub orphan_timeout: u64,
    pub history_size: usize,
    pub history_enabled: bool,
    pub allow_container_exec: bool,
    pub container_runtime_path: String,
    pub default_container_shell: String,
    pub allowed_container_patterns: Vec<String>,
    pub auth_provider: Option<Arc<dyn AuthProvider>>,
    pub require_auth: bool,
    pub allow_anonymous: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            ws_path: default_ws_path(),
            default_shell: default_shell(),
            default_cwd: None,
            allowed_shells: Vec::new(),
            allowed_paths: Vec::new(),
            max_sessions_total: default_max_sessions_total(),
            max_sessions_per_client: default_max_sessions_per_client(),
            max_clients_per_session: default_max_clients_per_session(),
            idle_timeout: 0,
            orphan_timeout: default_orphan_timeout(),
            history_size: default_history_size(),
            history_enabled: true,
            allow_container_exec: false,
            container_runtime_path: default_runtime_path(),
            default_container_shell: default_shell(),
            allowed_container_patterns: Vec::new(),
            auth_provider: None,
            require_auth: false,
            allow_anonymous: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    ///
    /// A missing file silently falls back to defaults; a file that exists
    /// but fails to parse is an error.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_idle_timeout: Option<u64>,
        cli_max_sessions: Option<usize>,
    ) -> ShmuxResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| ShmuxError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let mut config = Self::from_file(file_config)?;
        if let Some(port) = cli_port {
            config.port = port;
        }
        if let Some(idle) = cli_idle_timeout {
            config.idle_timeout = idle;
        }
        if let Some(max) = cli_max_sessions {
            config.max_sessions_total = max;
        }
        Ok(config)
    }

    /// Resolve a parsed config file, constructing the auth policy.
    pub fn from_file(file: ConfigFile) -> ShmuxResult<Self> {
        let auth_provider = build_auth_provider(&file.auth)?;
        Ok(Self {
            port: file.server.port,
            ws_path: file.server.path,
            default_shell: file.server.default_shell,
            default_cwd: file.server.default_cwd,
            allowed_shells: file.server.allowed_shells,
            allowed_paths: file.server.allowed_paths,
            max_sessions_total: file.limits.max_sessions_total,
            max_sessions_per_client: file.limits.max_sessions_per_client,
            max_clients_per_session: file.limits.max_clients_per_session,
            idle_timeout: file.limits.idle_timeout,
            orphan_timeout: file.limits.orphan_timeout,
            history_size: file.limits.history_size,
            history_enabled: file.limits.history_enabled,
            allow_container_exec: file.container.enabled,
            container_runtime_path: file.container.runtime_path,
            default_container_shell: file.container.default_shell,
            allowed_container_patterns: file.container.allowed_patterns,
            auth_provider,
            require_auth: file.auth.require_auth,
            allow_anonymous: file.auth.allow_anonymous,
        })
    }

    /// Whether `shell` passes the local-shell whitelist: normalized-path
    /// equality or case-insensitive basename match. An empty whitelist
    /// allows any shell.
    pub fn shell_allowed(&self, shell: &str) -> bool {
        if self.allowed_shells.is_empty() {
            return true;
        }
        let requested = normalize_path(shell);
        let requested_base = basename_lower(shell);
        self.allowed_shells.iter().any(|allowed| {
            normalize_path(allowed) == requested || basename_lower(allowed) == requested_base
        })
    }

    /// Whether `cwd` is inside one of the allowed working-directory
    /// prefixes. An empty whitelist allows any directory.
    pub fn cwd_allowed(&self, cwd: &str) -> bool {
        if self.allowed_paths.is_empty() {
            return true;
        }
        let requested = normalize_path(cwd);
        self.allowed_paths.iter().any(|allowed| {
            let allowed = normalize_path(allowed);
            requested == allowed || requested.starts_with(&format!("{allowed}/"))
        })
    }
}

fn build_auth_provider(auth: &AuthSection) -> ShmuxResult<Option<Arc<dyn AuthProvider>>> {
    match auth.mode.as_str() {
        "none" => Ok(None),
        "token" => {
            let secret = auth.token_secret.as_ref().ok_or_else(|| {
                ShmuxError::Config("auth.mode = \"token\" requires auth.token_secret".into())
            })?;
            Ok(Some(Arc::new(TokenProvider::new(
                secret.as_bytes().to_vec(),
                auth.anonymous_permissions.clone(),
            ))))
        }
        "table" => {
            let users = auth
                .users
                .iter()
                .map(|u| {
                    (
                        u.id.clone(),
                        TableUser {
                            password: u.password.clone(),
                            roles: u.roles.clone(),
                            username: u.username.clone(),
                        },
                    )
                })
                .collect();
            Ok(Some(Arc::new(RoleTableProvider::new(
                users,
                auth.roles.clone(),
                auth.anonymous_permissions.clone(),
            ))))
        }
        other => Err(ShmuxError::Config(format!("unknown auth.mode: {other}"))),
    }
}

/// Lexically normalize a path: resolve `.` segments, collapse separators,
/// strip a trailing slash. `..` is preserved (never resolved against the
/// filesystem).
fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            other => parts.push(other),
        }
    }
    if path.starts_with('/') {
        format!("/{}", parts.join("/"))
    } else {
        parts.join("/")
    }
}

fn basename_lower(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_lowercase()
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_whitelists_allow_everything() {
        let config = ServerConfig::default();
        assert!(config.shell_allowed("/usr/local/bin/fish"));
        assert!(config.cwd_allowed("/anywhere/at/all"));
    }

    #[test]
    fn shell_whitelist_by_path_or_basename() {
        let config = ServerConfig {
            allowed_shells: vec!["/bin/bash".into(), "/usr/bin/zsh".into()],
            ..ServerConfig::default()
        };
        assert!(config.shell_allowed("/bin/bash"));
        assert!(config.shell_allowed("/bin//bash/"));
        // basename match is case-insensitive and path-independent
        assert!(config.shell_allowed("/usr/local/bin/BASH"));
        assert!(config.shell_allowed("zsh"));
        assert!(!config.shell_allowed("/bin/sh"));
    }

    #[test]
    fn cwd_whitelist_is_prefix_match() {
        let config = ServerConfig {
            allowed_paths: vec!["/home".into(), "/srv/projects/".into()],
            ..ServerConfig::default()
        };
        assert!(config.cwd_allowed("/home"));
        assert!(config.cwd_allowed("/home/alice/code"));
        assert!(config.cwd_allowed("/srv/projects/x"));
        assert!(!config.cwd_allowed("/srv"));
        // not a component-wise prefix
        assert!(!config.cwd_allowed("/homestead"));
    }

    #[test]
    fn parses_full_config_file() {
        let toml_src = r#"
            [server]
            port = 4000
            default_shell = "/bin/sh"
            allowed_shells = ["/bin/sh", "/bin/bash"]

            [limits]
            max_sessions_total = 5
            idle_timeout = 60000
            history_size = 1024

            [container]
            enabled = true
            runtime_path = "podman"
            allowed_patterns = ["^web-"]

            [auth]
            mode = "table"
            require_auth = true
            anonymous_permissions = ["list_sessions"]
            roles = { operator = ["spawn_session", "join_session"] }

            [[auth.users]]
            id = "alice"
            password = "pw"
            roles = ["operator"]
        "#;
        let file: ConfigFile = toml::from_str(toml_src).unwrap();
        let config = ServerConfig::from_file(file).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.max_sessions_total, 5);
        assert_eq!(config.idle_timeout, 60000);
        assert_eq!(config.history_size, 1024);
        assert!(config.allow_container_exec);
        assert_eq!(config.container_runtime_path, "podman");
        assert!(config.require_auth);
        assert!(config.auth_provider.is_some());
    }

    #[test]
    fn token_mode_requires_secret() {
        let file: ConfigFile = toml::from_str("[auth]\nmode = \"token\"\n").unwrap();
        assert!(ServerConfig::from_file(file).is_err());
    }

    #[test]
    fn unknown_auth_mode_rejected() {
        let file: ConfigFile = toml::from_str("[auth]\nmode = \"ldap\"\n").unwrap();
        assert!(ServerConfig::from_file(file).is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.ws_path, "/terminal");
        assert!(!config.allow_container_exec);
        assert!(config.history_enabled);
        assert_eq!(config.idle_timeout, 0);
        assert!(config.auth_provider.is_none());
    }
}
