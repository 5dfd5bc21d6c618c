//! # config
//!
//! Registry client configuration. The on-disk format lives in [`wire`] and is
//! converted into [`RegistryConfig`], which is validated on construction.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod wire;

pub use wire::AclPolicy;

/// client config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// coordination service endpoints
    pub servers: Vec<String>,
    /// root namespace all services live under
    pub root: String,
    /// how long the coordination service may be unreachable before the session expires
    pub session_timeout: Duration,
    /// how often every cached connection set is dropped regardless of watch events
    pub refresh_interval: Duration,
    /// ACL applied to created nodes
    pub acl: AclPolicy,
    /// RPC transport options
    pub dial: DialConfig,
    /// coordination store backend options
    pub store: StoreConfig,
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialConfig {
    pub timeout: Duration,
    pub tls: bool,
    pub keep_alive: Option<KeepAliveConfig>,
}

impl Default for DialConfig {
    fn default() -> Self {
        wire::Dial::default().into()
    }
}

impl From<wire::Dial> for DialConfig {
    fn from(dial: wire::Dial) -> Self {
        Self {
            timeout: dial.timeout,
            tls: dial.tls,
            keep_alive: dial.keep_alive.map(|ka| KeepAliveConfig {
                interval: ka.interval,
                timeout: ka.timeout,
                while_idle: ka.while_idle,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub while_idle: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// JetStream KV bucket holding the node tree
    pub bucket: String,
    /// how often a session refreshes its liveness key
    pub heartbeat_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let store = wire::Store::default();
        Self {
            bucket: store.bucket,
            heartbeat_interval: store.heartbeat_interval,
        }
    }
}

impl RegistryConfig {
    /// config with defaults for everything but the server list
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            root: wire::default_root(),
            session_timeout: wire::default_session_timeout(),
            refresh_interval: wire::default_refresh_interval(),
            acl: AclPolicy::default(),
            dial: DialConfig::default(),
            store: StoreConfig::default(),
            path: None,
        }
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_acl(mut self, acl: AclPolicy) -> Self {
        self.acl = acl;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial.timeout = timeout;
        self
    }

    /// path the config was loaded from, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// read the config at `path`, decoding as JSON then YAML
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::parse_str(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let input = s.as_ref();
        let wire = match serde_json::from_str::<wire::Config>(input) {
            Ok(cfg) => cfg,
            Err(_err) => serde_yaml::from_str::<wire::Config>(input)
                .context("config is neither valid JSON nor YAML")?,
        };
        let config = Self::try_from(wire)?;
        debug!(?config);
        Ok(config)
    }

    /// check the invariants the client relies on
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() || self.servers.iter().any(|s| s.trim().is_empty()) {
            bail!("at least one non-empty coordination server is required");
        }
        if !self.root.starts_with('/') {
            bail!("root path must start with '/', got {:?}", self.root);
        }
        if self.root.len() > 1 && self.root.ends_with('/') {
            bail!("root path must not end with '/', got {:?}", self.root);
        }
        if self.root.contains("//") {
            bail!("root path contains an empty segment: {:?}", self.root);
        }
        if self.session_timeout.is_zero() || self.refresh_interval.is_zero() {
            bail!("session_timeout and refresh_interval must be non-zero");
        }
        if self.dial.timeout.is_zero() {
            bail!("dial timeout must be non-zero");
        }
        if self.store.heartbeat_interval >= self.session_timeout {
            bail!(
                "store heartbeat_interval ({:?}) must be shorter than session_timeout ({:?})",
                self.store.heartbeat_interval,
                self.session_timeout
            );
        }
        Ok(())
    }
}

impl TryFrom<wire::Config> for RegistryConfig {
    type Error = anyhow::Error;

    fn try_from(cfg: wire::Config) -> Result<Self> {
        let config = Self {
            servers: cfg.servers.into_vec(),
            root: normalize_root(&cfg.root),
            session_timeout: cfg.session_timeout,
            refresh_interval: cfg.refresh_interval,
            acl: cfg.acl,
            dial: cfg.dial.into(),
            store: StoreConfig {
                bucket: cfg.store.bucket,
                heartbeat_interval: cfg.store.heartbeat_interval,
            },
            path: None,
        };
        config.validate()?;
        Ok(config)
    }
}

/// prefix a missing leading `/` and drop a trailing one. `rpc` and `/rpc/`
/// both become `/rpc`, the empty string becomes `/`
pub fn normalize_root(root: &str) -> String {
    let trimmed = root.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        format!("/{trimmed}")
    }
}
