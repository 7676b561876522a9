use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, File};
use serde::Deserialize;

use rmqtt_utils::{deserialize_duration, to_duration};

use crate::error::{EndpointError, Result};
use crate::persistence::PersistenceType;
use crate::transport::{QoS, TlsOptions};

use self::log::{Level, Log, To};

pub mod log;

/// Flat `key → value` configuration, e.g. a `.properties` file
pub trait ConfigurationSource {
    fn get_property(&self, key: &str, default: &str) -> String;

    fn contains_key(&self, key: &str) -> bool;
}

impl ConfigurationSource for HashMap<String, String> {
    fn get_property(&self, key: &str, default: &str) -> String {
        self.get(key).cloned().unwrap_or_else(|| default.into())
    }

    fn contains_key(&self, key: &str) -> bool {
        HashMap::contains_key(self, key)
    }
}

impl ConfigurationSource for BTreeMap<String, String> {
    fn get_property(&self, key: &str, default: &str) -> String {
        self.get(key).cloned().unwrap_or_else(|| default.into())
    }

    fn contains_key(&self, key: &str) -> bool {
        BTreeMap::contains_key(self, key)
    }
}

/// Properties in `key = value` (or `key: value`) lines, `#` and `!` start comments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        text.parse()
    }

    #[inline]
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_str())
    }
}

impl FromStr for Properties {
    type Err = EndpointError;

    fn from_str(text: &str) -> Result<Self> {
        let mut props = Properties::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(['#', '!']) {
                continue;
            }
            match line.split_once(['=', ':']) {
                Some((key, value)) => props.set(key.trim(), value.trim()),
                None => props.set(line, ""),
            }
        }
        Ok(props)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Properties(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl ConfigurationSource for Properties {
    fn get_property(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).into()
    }

    fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }
}

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub host_uri: String,
    #[serde(default)]
    pub persistence: PersistenceType,
    #[serde(default)]
    pub persistence_location: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "Inner::clean_session_default")]
    pub clean_session: bool,
    #[serde(default = "Inner::auto_reconnect_default")]
    pub auto_reconnect: bool,
    #[serde(default = "Inner::retry_interval_default", deserialize_with = "deserialize_duration")]
    pub retry_interval: Duration,
    /// Time between a successful subscribe and the endpoint reporting ready
    #[serde(default = "Inner::settle_delay_default", deserialize_with = "deserialize_duration")]
    pub settle_delay: Duration,
    /// Longest the worker sleeps without being woken
    #[serde(default = "Inner::poll_interval_default", deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,
    #[serde(default = "Inner::keep_alive_default", deserialize_with = "deserialize_duration")]
    pub keep_alive: Duration,
    #[serde(default = "Inner::qos_default")]
    pub qos: u8,
    #[serde(default)]
    pub ssl: Ssl,
    #[serde(default)]
    pub log: Log,
}

impl Inner {
    fn clean_session_default() -> bool {
        true
    }
    fn auto_reconnect_default() -> bool {
        true
    }
    fn retry_interval_default() -> Duration {
        Duration::from_secs(10)
    }
    fn settle_delay_default() -> Duration {
        Duration::from_secs(4)
    }
    fn poll_interval_default() -> Duration {
        Duration::from_secs(1)
    }
    fn keep_alive_default() -> Duration {
        Duration::from_secs(60)
    }
    fn qos_default() -> u8 {
        1
    }
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            host_uri: String::new(),
            persistence: PersistenceType::default(),
            persistence_location: String::new(),
            username: None,
            password: None,
            clean_session: Self::clean_session_default(),
            auto_reconnect: Self::auto_reconnect_default(),
            retry_interval: Self::retry_interval_default(),
            settle_delay: Self::settle_delay_default(),
            poll_interval: Self::poll_interval_default(),
            keep_alive: Self::keep_alive_default(),
            qos: Self::qos_default(),
            ssl: Ssl::default(),
            log: Log::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ssl {
    #[serde(default)]
    pub authority_cert: Option<String>,
    #[serde(default)]
    pub client_cert: Option<String>,
    #[serde(default)]
    pub client_key: Option<String>,
    #[serde(default = "Ssl::version_default")]
    pub version: String,
}

impl Default for Ssl {
    fn default() -> Self {
        Self { authority_cert: None, client_cert: None, client_key: None, version: Self::version_default() }
    }
}

impl Ssl {
    fn version_default() -> String {
        "tlsv1.2".into()
    }

    #[inline]
    pub fn is_configured(&self) -> bool {
        self.authority_cert.is_some() || self.client_cert.is_some() || self.client_key.is_some()
    }

    pub fn to_options(&self) -> Option<TlsOptions> {
        if !self.is_configured() {
            return None;
        }
        Some(TlsOptions {
            authority_cert: self.authority_cert.as_ref().map(Into::into),
            client_cert: self.client_cert.as_ref().map(Into::into),
            client_key: self.client_key.as_ref().map(Into::into),
            version: self.version.clone(),
        })
    }
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    /// Layers `/etc/rmqtt-endpoint/<uuid>`, `$HOME/.config/rmqtt-endpoint/<uuid>`,
    /// the optional `cfg_name` file and `RMQTT_ENDPOINT__*` environment variables.
    pub fn load(uuid: &str, cfg_name: Option<&str>) -> Result<Self> {
        let mut builder =
            Config::builder().add_source(File::with_name(&format!("/etc/rmqtt-endpoint/{}", uuid)).required(false));
        if let Some(home) = std::env::var_os("HOME") {
            let home = home.to_string_lossy();
            builder = builder
                .add_source(File::with_name(&format!("{}/.config/rmqtt-endpoint/{}", home, uuid)).required(false));
        }
        if let Some(cfg) = cfg_name {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }
        builder = builder
            .add_source(config::Environment::with_prefix("rmqtt_endpoint").separator("__").try_parsing(true));

        let inner: Inner = builder.build()?.try_deserialize()?;
        Self::from_inner(inner)
    }

    /// Reads every setting from a flat property source, falling back to defaults
    pub fn from_source(source: &dyn ConfigurationSource) -> Result<Self> {
        let defaults = Inner::default();
        let get = |key: &str, default: &str| source.get_property(key, default);
        let optional = |key: &str| {
            if source.contains_key(key) {
                Some(source.get_property(key, ""))
            } else {
                None
            }
        };
        let duration = |key: &str, default: Duration| -> Result<Duration> {
            match optional(key) {
                Some(v) => to_duration(&v).ok_or_else(|| EndpointError::Configuration(format!("{} = {}", key, v))),
                None => Ok(default),
            }
        };
        let boolean = |key: &str, default: bool| -> Result<bool> {
            match optional(key) {
                Some(v) => parse_bool(&v).ok_or_else(|| EndpointError::Configuration(format!("{} = {}", key, v))),
                None => Ok(default),
            }
        };

        let inner = Inner {
            host_uri: get("host_uri", ""),
            persistence: get("persistence", "file").parse()?,
            persistence_location: get("persistence_location", ""),
            username: optional("username"),
            password: optional("password"),
            clean_session: boolean("clean_session", defaults.clean_session)?,
            auto_reconnect: boolean("auto_reconnect", defaults.auto_reconnect)?,
            retry_interval: duration("retry_interval", defaults.retry_interval)?,
            settle_delay: duration("settle_delay", defaults.settle_delay)?,
            poll_interval: duration("poll_interval", defaults.poll_interval)?,
            keep_alive: duration("keep_alive", defaults.keep_alive)?,
            qos: get("qos", "1").trim().parse().map_err(|_| EndpointError::Configuration("qos".into()))?,
            ssl: Ssl {
                authority_cert: optional("ssl.authority_cert"),
                client_cert: optional("ssl.client_cert"),
                client_key: optional("ssl.client_key"),
                version: get("ssl.version", &Ssl::version_default()),
            },
            log: Log {
                to: match optional("log.to") {
                    Some(v) => v.parse::<To>()?,
                    None => Log::to_default(),
                },
                level: match optional("log.level") {
                    Some(v) => v.parse::<Level>()?,
                    None => Log::level_default(),
                },
                dir: get("log.dir", &Log::dir_default()),
                file: get("log.file", &Log::file_default()),
            },
        };
        Self::from_inner(inner)
    }

    fn from_inner(inner: Inner) -> Result<Self> {
        if inner.host_uri.trim().is_empty() {
            return Err(EndpointError::Configuration("host_uri".into()));
        }
        QoS::try_from(inner.qos)?;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn qos(&self) -> QoS {
        QoS::try_from(self.qos).unwrap_or_default()
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("host_uri", &self.host_uri)
            .field("persistence", &self.persistence)
            .field("retry_interval", &self.retry_interval)
            .field("settle_delay", &self.settle_delay)
            .finish()
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_source_defaults() {
        let props: Properties = [("host_uri", "tcp://localhost:1883")].into_iter().collect();
        let s = Settings::from_source(&props).unwrap();
        assert_eq!(s.host_uri, "tcp://localhost:1883");
        assert_eq!(s.persistence, PersistenceType::File);
        assert_eq!(s.retry_interval, Duration::from_secs(10));
        assert_eq!(s.settle_delay, Duration::from_secs(4));
        assert!(s.clean_session);
        assert!(s.auto_reconnect);
        assert_eq!(s.qos(), QoS::AtLeastOnce);
        assert!(s.ssl.to_options().is_none());
        assert_eq!(s.ssl.version, "tlsv1.2");
        assert_eq!(s.log.to, To::Console);
        assert_eq!(s.log.filename(), "/var/log/rmqtt-endpoint/endpoint.log");
    }

    #[test]
    fn test_missing_host_uri() {
        let props = Properties::default();
        assert!(matches!(Settings::from_source(&props), Err(EndpointError::Configuration(k)) if k == "host_uri"));
    }

    #[test]
    fn test_from_properties_text() {
        let text = "# endpoint\n\
                    host_uri = ssl://broker.example.com:8883\n\
                    persistence: memory\n\
                    retry_interval=500ms\n\
                    settle_delay = 0s\n\
                    clean_session = false\n\
                    username = device\n\
                    ssl.authority_cert = /etc/certs/ca.pem\n\
                    ! comment\n\
                    log.level = debug\n\
                    log.to = off\n";
        let props: Properties = text.parse().unwrap();
        let s = Settings::from_source(&props).unwrap();
        assert_eq!(s.host_uri, "ssl://broker.example.com:8883");
        assert_eq!(s.persistence, PersistenceType::Memory);
        assert_eq!(s.retry_interval, Duration::from_millis(500));
        assert_eq!(s.settle_delay, Duration::ZERO);
        assert!(!s.clean_session);
        assert_eq!(s.username.as_deref(), Some("device"));
        assert_eq!(s.password, None);
        let tls = s.ssl.to_options().unwrap();
        assert_eq!(tls.authority_cert, Some("/etc/certs/ca.pem".into()));
        assert_eq!(s.log.level.inner(), slog::Level::Debug);
        assert!(s.log.to.off());
    }

    #[test]
    fn test_invalid_properties() {
        let mut map = HashMap::new();
        map.insert("host_uri".to_string(), "tcp://localhost".to_string());
        map.insert("persistence".to_string(), "disk".to_string());
        assert!(Settings::from_source(&map).is_err());

        map.insert("persistence".to_string(), "none".to_string());
        map.insert("qos".to_string(), "3".to_string());
        assert!(Settings::from_source(&map).is_err());

        map.insert("qos".to_string(), "0".to_string());
        map.insert("auto_reconnect".to_string(), "maybe".to_string());
        assert!(Settings::from_source(&map).is_err());

        map.insert("auto_reconnect".to_string(), "off".to_string());
        map.insert("retry_interval".to_string(), "10".to_string());
        assert!(
            matches!(Settings::from_source(&map), Err(EndpointError::Configuration(k)) if k == "retry_interval = 10")
        );

        map.insert("retry_interval".to_string(), "10s".to_string());
        let s = Settings::from_source(&map).unwrap();
        assert_eq!(s.retry_interval, Duration::from_secs(10));
        assert!(!s.auto_reconnect);
        assert_eq!(s.qos(), QoS::AtMostOnce);
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("rmqtt-endpoint-settings-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).unwrap();
        scopeguard::defer! {
            let _ = std::fs::remove_dir_all(&dir);
        }
        let file = dir.join("endpoint.toml");
        std::fs::write(
            &file,
            "host_uri = \"tcp://localhost:1883\"\npersistence = \"none\"\nretry_interval = \"2s\"\n\n[log]\nto = \"off\"\n",
        )
        .unwrap();

        let s = Settings::load("no-such-endpoint-uuid", file.to_str()).unwrap();
        assert_eq!(s.host_uri, "tcp://localhost:1883");
        assert_eq!(s.persistence, PersistenceType::None);
        assert_eq!(s.retry_interval, Duration::from_secs(2));
        assert_eq!(s.poll_interval, Duration::from_secs(1));
        assert!(s.log.to.off());
    }
}
