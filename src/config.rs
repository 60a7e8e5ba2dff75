use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Global configuration for devgate
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and routing configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Where apps live and how long they stay up
    #[serde(default)]
    pub apps: AppsConfig,

    /// How app processes are started
    #[serde(default)]
    pub launch: LaunchConfig,

    /// Local certificate authority settings
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 9280, set to 0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS port (default: 9283, set to 0 to disable)
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Domains served; the matching suffix is stripped to get the app name
    #[serde(default = "default_domains")]
    pub domains: Vec<String>,

    /// Host header that selects the built-in /status and /events endpoints
    #[serde(default = "default_admin_host")]
    pub admin_host: String,

    /// Request path prefixes never served from an app's public/ directory
    #[serde(default)]
    pub ignored_static_paths: Vec<String>,

    /// Log every request and enable debug logging
    #[serde(default)]
    pub debug: bool,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            https_port: default_https_port(),
            bind: default_bind_address(),
            domains: default_domains(),
            admin_host: default_admin_host(),
            ignored_static_paths: Vec::new(),
            debug: false,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppsConfig {
    /// Directory whose entries (dirs, pointer files, symlinks) name apps
    #[serde(default = "default_apps_dir")]
    pub dir: String,

    /// Seconds of inactivity before a running app is stopped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Seconds between idle checks
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_secs: u64,

    /// Maximum seconds to wait for an app to accept connections
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_secs: u64,
}

impl Default for AppsConfig {
    fn default() -> Self {
        Self {
            dir: default_apps_dir(),
            idle_timeout_secs: default_idle_timeout(),
            idle_check_interval_secs: default_idle_check_interval(),
            boot_timeout_secs: default_boot_timeout(),
        }
    }
}

impl AppsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }
}

/// How an app process is started
///
/// # Security Warning
///
/// `command` is run through a login shell inside every app directory.
/// Configuration files must be protected the same way as shell profiles.
#[derive(Debug, Deserialize, Clone)]
pub struct LaunchConfig {
    /// Shell used to start apps (default: $SHELL, falling back to /bin/bash)
    pub shell: Option<String>,

    /// Arguments passed to the shell before the launch script
    #[serde(default = "default_shell_args")]
    pub shell_args: Vec<String>,

    /// Start command run after the app's env files are sourced. It must
    /// listen on the unix socket named by $SOCKET. Defaults to puma.
    pub command: Option<String>,

    /// Value of $THREADS for the app
    #[serde(default = "default_threads")]
    pub threads: u32,

    /// Value of $WORKERS for the app
    #[serde(default)]
    pub workers: u32,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            shell: None,
            shell_args: default_shell_args(),
            command: None,
            threads: default_threads(),
            workers: 0,
        }
    }
}

impl LaunchConfig {
    /// The shell to run, resolving $SHELL when none is configured
    pub fn resolve_shell(&self) -> String {
        if let Some(ref shell) = self.shell {
            return shell.clone();
        }
        match std::env::var("SHELL") {
            Ok(shell) if !shell.is_empty() => shell,
            _ => {
                warn!("SHELL env var not set, using /bin/bash by default");
                "/bin/bash".to_string()
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    /// Directory holding the CA's cert.pem and key.pem
    #[serde(default = "default_support_dir")]
    pub support_dir: String,

    /// Maximum number of issued leaf certificates kept in memory
    #[serde(default = "default_cert_cache_capacity")]
    pub cache_capacity: usize,

    /// Register a newly generated CA with the OS trust store
    #[serde(default = "default_trust")]
    pub trust: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            support_dir: default_support_dir(),
            cache_capacity: default_cert_cache_capacity(),
            trust: default_trust(),
        }
    }
}

fn default_http_port() -> u16 {
    9280
}

fn default_https_port() -> u16 {
    9283
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_domains() -> Vec<String> {
    vec!["test".to_string()]
}

fn default_admin_host() -> String {
    "devgate".to_string()
}

fn default_apps_dir() -> String {
    "~/.devgate".to_string()
}

fn default_idle_timeout() -> u64 {
    15 * 60
}

fn default_idle_check_interval() -> u64 {
    10
}

fn default_boot_timeout() -> u64 {
    120
}

fn default_shell_args() -> Vec<String> {
    vec!["-l".to_string(), "-i".to_string(), "-c".to_string()]
}

fn default_threads() -> u32 {
    5
}

fn default_support_dir() -> String {
    "~/.devgate-ca".to_string()
}

fn default_cert_cache_capacity() -> usize {
    1024
}

fn default_trust() -> bool {
    true
}

/// Expand a leading `~` to the current user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    let home = || dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("/"));
    if path == "~" {
        return home();
    }
    match path.strip_prefix("~/") {
        Some(rest) => home().join(rest),
        None => PathBuf::from(path),
    }
}

/// Sort domains so that the most specific (most labels) is tried first
pub fn sort_domains(domains: &mut [String]) {
    domains.sort_by(|a, b| b.matches('.').count().cmp(&a.matches('.').count()));
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults.
    /// Environment overrides are applied afterwards.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.finish();
        config.validate()?;
        Ok(config)
    }

    /// Apply `DEVGATE_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if lookup("DEVGATE_DEBUG").is_some() {
            self.server.debug = true;
        }
        if let Some(domains) = lookup("DEVGATE_DOMAINS") {
            self.server.domains = domains.split(':').map(String::from).collect();
        }
        if let Some(port) = lookup("DEVGATE_HTTP_PORT") {
            match port.parse() {
                Ok(port) => self.server.http_port = port,
                Err(_) => warn!(value = %port, "Ignoring invalid DEVGATE_HTTP_PORT"),
            }
        }
        if let Some(port) = lookup("DEVGATE_HTTPS_PORT") {
            match port.parse() {
                Ok(port) => self.server.https_port = port,
                Err(_) => warn!(value = %port, "Ignoring invalid DEVGATE_HTTPS_PORT"),
            }
        }
        if let Some(dir) = lookup("DEVGATE_DIR") {
            self.apps.dir = dir;
        }
        if let Some(timeout) = lookup("DEVGATE_TIMEOUT") {
            match timeout.parse() {
                Ok(secs) => self.apps.idle_timeout_secs = secs,
                Err(_) => warn!(value = %timeout, "Ignoring invalid DEVGATE_TIMEOUT"),
            }
        }
    }

    /// Normalize values that other components rely on
    pub fn finish(&mut self) {
        self.server.domains = self
            .server
            .domains
            .iter()
            .map(|d| d.trim().trim_matches('.').to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        sort_domains(&mut self.server.domains);
    }

    pub fn apps_dir(&self) -> PathBuf {
        expand_home(&self.apps.dir)
    }

    pub fn support_dir(&self) -> PathBuf {
        expand_home(&self.tls.support_dir)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.domains.is_empty() {
            anyhow::bail!("At least one domain must be configured");
        }
        if self.apps.idle_timeout_secs == 0 {
            anyhow::bail!("apps.idle_timeout_secs must be greater than zero");
        }
        if self.apps.idle_check_interval_secs == 0 {
            anyhow::bail!("apps.idle_check_interval_secs must be greater than zero");
        }
        if self.apps.boot_timeout_secs == 0 {
            anyhow::bail!("apps.boot_timeout_secs must be greater than zero");
        }
        if self.server.http_port == 0 && self.server.https_port == 0 {
            anyhow::bail!("At least one of http_port and https_port must be enabled");
        }
        if self.tls.cache_capacity == 0 {
            anyhow::bail!("tls.cache_capacity must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
http_port = 80
https_port = 443
domains = ["test", "co.test"]
ignored_static_paths = ["/packs"]

[apps]
dir = "/srv/apps"
idle_timeout_secs = 60

[launch]
shell = "/bin/zsh"
command = "bin/rails server -b unix:$SOCKET"
threads = 3
"#;
        let mut config: Config = toml::from_str(toml).unwrap();
        config.finish();

        assert_eq!(config.server.http_port, 80);
        assert_eq!(config.server.https_port, 443);
        assert_eq!(config.server.domains, vec!["co.test", "test"]);
        assert_eq!(config.server.ignored_static_paths, vec!["/packs"]);
        assert_eq!(config.apps_dir(), PathBuf::from("/srv/apps"));
        assert_eq!(config.apps.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.launch.resolve_shell(), "/bin/zsh");
        assert_eq!(config.launch.threads, 3);
        assert_eq!(config.launch.workers, 0);
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.http_port, 9280);
        assert_eq!(config.server.https_port, 9283);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.domains, vec!["test"]);
        assert_eq!(config.server.admin_host, "devgate");
        assert_eq!(config.apps.idle_timeout(), Duration::from_secs(900));
        assert_eq!(config.apps.idle_check_interval(), Duration::from_secs(10));
        assert_eq!(config.apps.boot_timeout(), Duration::from_secs(120));
        assert_eq!(config.launch.shell_args, vec!["-l", "-i", "-c"]);
        assert_eq!(config.launch.threads, 5);
        assert_eq!(config.tls.cache_capacity, 1024);
        assert!(config.tls.trust);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sort_domains_by_specificity() {
        let mut domains = vec![
            "test".to_string(),
            "co.test".to_string(),
            "a.b.test".to_string(),
        ];
        sort_domains(&mut domains);
        assert_eq!(domains, vec!["a.b.test", "co.test", "test"]);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DEVGATE_DOMAINS", "test:localhost:co.test"),
            ("DEVGATE_HTTP_PORT", "8080"),
            ("DEVGATE_HTTPS_PORT", "not-a-port"),
            ("DEVGATE_DIR", "/tmp/apps"),
            ("DEVGATE_TIMEOUT", "30"),
            ("DEVGATE_DEBUG", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        config.finish();

        assert_eq!(config.server.domains, vec!["co.test", "test", "localhost"]);
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.https_port, 9283);
        assert_eq!(config.apps.dir, "/tmp/apps");
        assert_eq!(config.apps.idle_timeout_secs, 30);
        assert!(config.server.debug);
    }

    #[test]
    fn test_expand_home() {
        let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        assert_eq!(expand_home("~/.devgate"), home.join(".devgate"));
        assert_eq!(expand_home("~"), home);
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.server.domains.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.apps.idle_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.http_port = 0;
        config.server.https_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.server.admin_host, "devgate");
    }
}
