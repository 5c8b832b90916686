use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{de, Deserialize, Deserializer};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::caching::DecisionCacheConfig;
use crate::InstanceName;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the gateway.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "buildgate".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Forwards request headers to a remote service that decides whether a client is authenticated.
#[derive(Clone, Debug, Deserialize)]
pub struct AuthenticatorConfig {
    /// Base URL of the remote decision service.
    pub url: Url,
    /// An arbitrary value that is sent along with every request, for example to tell apart
    /// multiple gateways sharing one decision service.
    #[serde(default)]
    pub scope: serde_json::Value,
    /// The lowercase names of the request headers that are forwarded.
    #[serde(default)]
    pub header_keys: Vec<String>,
    /// Caching of authentication verdicts.
    #[serde(default)]
    pub cache: DecisionCacheConfig,
}

/// Asks a remote service whether an authenticated client may access an instance.
#[derive(Clone, Debug, Deserialize)]
pub struct AuthorizerConfig {
    /// Base URL of the remote decision service.
    pub url: Url,
    /// An arbitrary value that is sent along with every request.
    #[serde(default)]
    pub scope: serde_json::Value,
    /// Caching of authorization verdicts.
    #[serde(default)]
    pub cache: DecisionCacheConfig,
}

/// An execution backend serving all instance names below a prefix.
#[derive(Clone, Debug, Deserialize)]
pub struct BackendConfig {
    /// The instance name prefix, matched component by component. The empty prefix matches all
    /// instance names.
    #[serde(default)]
    pub instance_name_prefix: InstanceName,
    /// Base URL of the backend.
    pub url: Url,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Remote authentication of incoming requests. Requests are not authenticated if unset.
    pub authenticator: Option<AuthenticatorConfig>,

    /// Remote authorization of incoming requests. Requests are not authorized if unset.
    pub authorizer: Option<AuthorizerConfig>,

    /// The execution backends requests are routed to.
    pub backends: Vec<BackendConfig>,

    /// The timeout for a single call to a remote decision service or a backend.
    ///
    /// Streaming responses of backends are not subject to this timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// The timeout for establishing a connection to a remote service.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0:3080".to_owned()
    } else {
        "127.0.0.1:3080".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            authenticator: None,
            authorizer: None,
            backends: Vec::new(),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            )?,
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    fn validate(&self) -> Result<()> {
        let caches = [
            ("authenticator", self.authenticator.as_ref().map(|a| &a.cache)),
            ("authorizer", self.authorizer.as_ref().map(|a| &a.cache)),
        ];
        for (name, cache) in caches {
            if cache.is_some_and(|cache| cache.maximum_size == 0) {
                anyhow::bail!("{name}.cache.maximum_size must be greater than 0");
            }
        }

        let mut prefixes = HashSet::new();
        for backend in &self.backends {
            if !prefixes.insert(&backend.instance_name_prefix) {
                anyhow::bail!(
                    "multiple backends configured for instance name prefix {:?}",
                    backend.instance_name_prefix.as_str()
                );
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
