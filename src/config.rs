use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;

pub const DEFAULT_PATH: &str = "config.properties";
pub const DEFAULT_KNOWN_HOSTS_DB: &str = "known_hosts.db";
const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

const USER_KEY: &str = "user";
const HOST_KEY: &str = "host";
const PORT_KEY: &str = "port";
const RSA_LOCATION_KEY: &str = "rsaKeyLocation";
const RSA_PASSPHRASE_ENV_KEY: &str = "rsaKeyPassphraseEnv";
const HOST_KEY_CHECKING_KEY: &str = "hostKeyChecking";
const KNOWN_HOSTS_DB_KEY: &str = "knownHostsDb";
const KEEP_ALIVE_KEY: &str = "keepAliveInterval";

/// Bastion connection parameters, loaded once from a properties file and
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TunnelConfig {
    pub bastion_user: String,
    pub bastion_host: String,
    pub bastion_port: u16,
    /// `None` when `rsaKeyLocation` is absent or empty; the default
    /// `~/.ssh/id_rsa` path is resolved at connect time instead.
    pub rsa_key_location: Option<PathBuf>,
    /// name of an environment variable holding the key passphrase
    pub rsa_key_passphrase_env: Option<String>,
    pub host_key_checking: HostKeyChecking,
    pub known_hosts_db: PathBuf,
    /// `None` disables ssh-level keep-alives
    pub keep_alive_interval: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HostKeyChecking {
    /// trust-on-first-use against the fingerprint store
    Tofu,
    /// accept any server key (logged as a warning)
    Off,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read properties file {0}: {1}")]
    Unreadable(String, std::io::Error),
    #[error("missing required property `{0}`")]
    MissingProperty(&'static str),
    #[error("property `port` must be a positive integer, got `{0}`")]
    InvalidPort(String),
    #[error("property `{KEEP_ALIVE_KEY}` must be an integer number of seconds, got `{0}`")]
    InvalidKeepAlive(String),
    #[error("property `{HOST_KEY_CHECKING_KEY}` must be `tofu` or `off`, got `{0}`")]
    InvalidHostKeyChecking(String),
}

impl TunnelConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or(Path::new(DEFAULT_PATH));
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Unreadable(path.display().to_string(), e))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let props = parse_properties(raw);

        let bastion_user = required(&props, USER_KEY)?;
        let bastion_host = required(&props, HOST_KEY)?;
        let raw_port = required(&props, PORT_KEY)?;
        let bastion_port = raw_port
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| ConfigError::InvalidPort(raw_port.clone()))?;

        let rsa_key_location = props
            .get(RSA_LOCATION_KEY)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let rsa_key_passphrase_env = props
            .get(RSA_PASSPHRASE_ENV_KEY)
            .filter(|v| !v.is_empty())
            .cloned();

        let host_key_checking = match props.get(HOST_KEY_CHECKING_KEY) {
            None => HostKeyChecking::Tofu,
            Some(v) if v.eq_ignore_ascii_case("tofu") => HostKeyChecking::Tofu,
            Some(v) if v.eq_ignore_ascii_case("off") => HostKeyChecking::Off,
            Some(v) => return Err(ConfigError::InvalidHostKeyChecking(v.clone())),
        };

        let known_hosts_db = props
            .get(KNOWN_HOSTS_DB_KEY)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KNOWN_HOSTS_DB));

        let keep_alive_interval = match props.get(KEEP_ALIVE_KEY) {
            None => Some(Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS)),
            Some(v) => {
                let secs = v
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidKeepAlive(v.clone()))?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
        };

        Ok(TunnelConfig {
            bastion_user,
            bastion_host,
            bastion_port,
            rsa_key_location,
            rsa_key_passphrase_env,
            host_key_checking,
            known_hosts_db,
            keep_alive_interval,
        })
    }

    /// Private key path for a given home directory: the configured location,
    /// or the `~/.ssh/id_rsa` convention when none was set. Computed on
    /// demand so tests can pass a fake home.
    pub fn key_path_in(&self, home: &Path) -> PathBuf {
        match &self.rsa_key_location {
            Some(path) => path.clone(),
            None => home.join(".ssh").join("id_rsa"),
        }
    }
}

/// Java-style properties: `key=value` lines, `#`/`!` comments, whitespace
/// around keys and values ignored. Lines without `=` are skipped.
fn parse_properties(raw: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            props.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    props
}

fn required(props: &HashMap<String, String>, key: &'static str) -> Result<String, ConfigError> {
    props
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or(ConfigError::MissingProperty(key))
}
