use crate::cors::CorsPolicy;
use anyhow::Result;
use clap::ValueEnum;
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::sync::RwLock;
use tokio::sync::broadcast;

pub const DEFAULT_CONFIG_PATH: &str = "./corspx.json";
pub const DEFAULT_LISTEN_PORT: u16 = 8081;

static LOADED_CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();
// Global broadcaster for config change events
static CONFIG_TX: OnceLock<broadcast::Sender<Config>> = OnceLock::new();
// Environment selected at startup; never changes while the process runs
static ACTIVE_ENV: OnceLock<Environment> = OnceLock::new();

fn config_lock() -> &'static RwLock<Config> {
    LOADED_CONFIG.get_or_init(|| RwLock::new(Config::default()))
}

fn broadcaster() -> &'static broadcast::Sender<Config> {
    CONFIG_TX.get_or_init(|| {
        let (tx, _rx) = broadcast::channel::<Config>(16);
        tx
    })
}

/// Which named CORS policy is active. The permissive development policy is
/// only ever selected through this flag, never implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// Resolve the environment: CLI flag wins, then the CORSPX_ENV variable,
    /// then development.
    pub fn resolve(flag: Option<Environment>) -> Environment {
        if let Some(env) = flag {
            return env;
        }
        match std::env::var("CORSPX_ENV") {
            Ok(value) => Self::from_flag(&value),
            Err(_) => Environment::Development,
        }
    }

    pub fn from_flag(value: &str) -> Environment {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "development" | "dev" | "" => Environment::Development,
            other => {
                warn!("Unknown environment '{}', defaulting to development", other);
                Environment::Development
            }
        }
    }

    pub fn set_active(env: Environment) {
        let _ = ACTIVE_ENV.set(env);
    }

    pub fn active() -> Environment {
        ACTIVE_ENV.get().copied().unwrap_or(Environment::Development)
    }

    /// Name of the policy this environment selects from the config.
    pub fn policy_name(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip)]
    pub(crate) path: PathBuf,
    // Port the proxy listens on; 0 means "use the default"
    #[serde(deserialize_with = "u16_or_default", default = "default_listen_port")]
    listen_port: u16,
    // Base URL requests are forwarded to
    #[serde(deserialize_with = "string_or_default", default = "default_upstream")]
    upstream: String,
    // Only paths under this prefix are forwarded upstream
    #[serde(deserialize_with = "string_or_default", default = "default_forward_prefix")]
    forward_prefix: String,
    // Named CORS policies, selected by environment at startup
    #[serde(default = "default_policies")]
    policies: HashMap<String, CorsPolicy>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_PATH)
    }
}

impl Config {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let path = path.with_extension("json");

        Self {
            path,
            listen_port: DEFAULT_LISTEN_PORT,
            upstream: default_upstream(),
            forward_prefix: default_forward_prefix(),
            policies: default_policies(),
        }
    }

    pub fn get_listen_port(&self) -> u16 {
        // Forgiving deserialization can leave 0 behind; treat it as unset
        if self.listen_port == 0 { DEFAULT_LISTEN_PORT } else { self.listen_port }
    }

    pub fn set_listen_port(&mut self, port: u16) {
        self.listen_port = port;
    }

    pub fn get_upstream(&self) -> &String {
        &self.upstream
    }

    pub fn set_upstream(&mut self, upstream: String) {
        self.upstream = upstream;
    }

    pub fn get_forward_prefix(&self) -> &String {
        &self.forward_prefix
    }

    pub fn get_path(&self) -> &PathBuf {
        &self.path
    }

    pub fn get_policies(&self) -> &HashMap<String, CorsPolicy> {
        &self.policies
    }

    pub fn lookup_policy(&self, name: impl AsRef<str>) -> Option<&CorsPolicy> {
        self.policies.get(name.as_ref())
    }

    /// Policy selected by the given environment. A config missing the named
    /// policy falls back to the built-in permissive one so a hand-edited file
    /// cannot leave the proxy without CORS headers.
    pub fn policy_for(&self, env: Environment) -> CorsPolicy {
        if let Some(policy) = self.policies.get(env.policy_name()) {
            return policy.clone();
        }
        warn!("No '{}' policy in config, using the built-in development policy", env.policy_name());
        CorsPolicy::permissive()
    }

    pub fn active_policy(&self) -> CorsPolicy {
        self.policy_for(Environment::active())
    }

    pub async fn get() -> Self {
        config_lock().read().await.clone()
    }

    pub fn subscribe() -> broadcast::Receiver<Config> {
        broadcaster().subscribe()
    }

    pub async fn try_load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from: {}", path.display());
        let config = if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let result = serde_json::from_str::<Config>(&content);
            if let Err(e) = result {
                error!("Failed to parse config file: {}", e);
                Self::save_default(path).await?;
                Self::new(path)
            } else {
                let mut cfg = result?;
                cfg.path = path.to_owned();
                cfg
            }
        } else {
            warn!("Config file not found, using default config");
            Self::save_default(path).await?;
            Self::new(path)
        };
        trace!("Loaded config: {:#?}", config);

        {
            let mut guard = config_lock().write().await;
            *guard = config.clone();
        }

        let _ = broadcaster().send(config.clone());

        Ok(config)
    }

    /// Apply runtime-only CLI overrides to the loaded config. These are not
    /// persisted; a config reload replaces them.
    pub async fn apply_overrides(port: Option<u16>, upstream: Option<String>) {
        if port.is_none() && upstream.is_none() {
            return;
        }
        let updated = {
            let mut guard = config_lock().write().await;
            if let Some(port) = port {
                info!("Overriding listen port: {}", port);
                guard.listen_port = port;
            }
            if let Some(upstream) = upstream {
                info!("Overriding upstream: {}", upstream);
                guard.upstream = upstream;
            }
            guard.clone()
        };
        let _ = broadcaster().send(updated);
    }

    pub async fn save(&self) -> Result<()> {
        debug!("Saving config to: {}", self.path.display());
        if !self.path.exists() {
            std::fs::create_dir_all(
                self.path.parent().ok_or(anyhow::anyhow!("Failed to create parent directory for config file"))?,
            )?;
            tokio::fs::File::create(&self.path).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    pub async fn save_default(path: impl AsRef<Path>) -> Result<()> {
        debug!("Saving default config to: {}", path.as_ref().display());
        let path = path.as_ref();
        Self::new(path).save().await?;
        Ok(())
    }

    pub fn watch_config_file(&self) {
        use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
        let path = self.path.clone();
        tokio::spawn(async move {
            let (tx, rx) = std::sync::mpsc::channel();
            let mut watcher = RecommendedWatcher::new(tx, NotifyConfig::default()).unwrap();
            watcher.watch(&path, RecursiveMode::NonRecursive).unwrap();
            for res in rx {
                if let Ok(event) = res {
                    if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                        trace!("Config file changed: {:?}", event);
                        debug!("Config file changed, reloading");
                        if let Err(e) = Self::try_load(&path).await {
                            warn!("Failed to reload config: {}", e);
                        }
                    } else {
                        trace!("Config file event: {:?}", event);
                        continue; // ignore other events
                    }
                } else {
                    warn!("Failed to receive config file event: {:?}", res);
                    continue;
                }
            }
        });
    }
}

impl Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string_pretty(self).unwrap();
        writeln!(f, "{}", json)
    }
}

fn string_or_default<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match String::deserialize(deserializer) {
        Ok(s) => Ok(s),
        Err(e) => {
            warn!("Failed to deserialize string value: {}, using default", e);
            Ok(String::default())
        }
    }
}

// Forgiving u16: non-integer or out-of-range types fall back to 0 ("unset").
fn u16_or_default<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    match u16::deserialize(deserializer) {
        Ok(n) => Ok(n),
        Err(e) => {
            warn!("Failed to deserialize u16 value: {}, using default", e);
            Ok(u16::default())
        }
    }
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_upstream() -> String {
    "http://localhost:5001".to_string()
}

fn default_forward_prefix() -> String {
    "/api".to_string()
}

fn default_policies() -> HashMap<String, CorsPolicy> {
    let mut policies = HashMap::new();
    policies.insert(Environment::Development.policy_name().to_string(), CorsPolicy::permissive());
    policies.insert(Environment::Production.policy_name().to_string(), CorsPolicy::restricted());
    policies
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();
        assert_eq!(config.get_listen_port(), 8081);
        assert_eq!(config.get_upstream(), "http://localhost:5001");
        assert_eq!(config.get_forward_prefix(), "/api");
        assert!(config.lookup_policy("development").is_some());
        assert!(config.lookup_policy("production").is_some());
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.get_listen_port(), 8081);
        assert_eq!(config.get_upstream(), "http://localhost:5001");
        assert_eq!(config.get_forward_prefix(), "/api");
        assert_eq!(config.get_policies().len(), 2);
    }

    #[test]
    fn test_listen_port_zero_falls_back_to_default() {
        let config: Config = serde_json::from_str(r#"{"listen_port": 0}"#).unwrap();
        assert_eq!(config.get_listen_port(), 8081);
    }

    #[test]
    fn test_forgiving_listen_port_deserialization() {
        // A wrong-typed port is logged and treated as unset rather than
        // failing the whole config
        let config: Config = serde_json::from_str(r#"{"listen_port": "eighty"}"#).unwrap();
        assert_eq!(config.get_listen_port(), 8081);
    }

    #[test]
    fn test_explicit_values_survive_parsing() {
        let config: Config = serde_json::from_str(
            r#"{"listen_port": 9090, "upstream": "http://127.0.0.1:3000", "forward_prefix": "/v1"}"#,
        )
        .unwrap();
        assert_eq!(config.get_listen_port(), 9090);
        assert_eq!(config.get_upstream(), "http://127.0.0.1:3000");
        assert_eq!(config.get_forward_prefix(), "/v1");
    }

    #[test]
    fn test_config_round_trip() {
        let mut config = Config::default();
        config.set_upstream("http://10.0.0.1:8000".to_string());
        config.set_listen_port(9999);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.get_upstream(), "http://10.0.0.1:8000");
        assert_eq!(parsed.get_listen_port(), 9999);
        assert_eq!(parsed.get_policies().len(), 2);
    }

    #[test]
    fn test_policy_for_selects_by_environment() {
        let config = Config::default();
        let dev = config.policy_for(Environment::Development);
        assert!(dev.allows_any_origin());
        let prod = config.policy_for(Environment::Production);
        assert!(!prod.allows_any_origin());
    }

    #[test]
    fn test_policy_for_missing_policy_falls_back_to_permissive() {
        let mut config = Config::default();
        config.policies.clear();
        let policy = config.policy_for(Environment::Production);
        assert!(policy.allows_any_origin());
    }

    #[test]
    fn test_environment_from_flag() {
        assert_eq!(Environment::from_flag("production"), Environment::Production);
        assert_eq!(Environment::from_flag("PROD"), Environment::Production);
        assert_eq!(Environment::from_flag("development"), Environment::Development);
        assert_eq!(Environment::from_flag("dev"), Environment::Development);
        assert_eq!(Environment::from_flag(""), Environment::Development);
        assert_eq!(Environment::from_flag("staging"), Environment::Development);
    }

    #[test]
    fn test_environment_resolve_prefers_flag() {
        assert_eq!(Environment::resolve(Some(Environment::Production)), Environment::Production);
        assert_eq!(Environment::resolve(Some(Environment::Development)), Environment::Development);
    }

    #[test]
    fn test_environment_policy_names() {
        assert_eq!(Environment::Development.policy_name(), "development");
        assert_eq!(Environment::Production.policy_name(), "production");
    }
}
