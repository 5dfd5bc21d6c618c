use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, de};

/// top-level config type, as it appears on disk
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    pub servers: MaybeList<String>,
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(
        default = "default_session_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub session_timeout: Duration,
    #[serde(
        default = "default_refresh_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub refresh_interval: Duration,
    #[serde(default)]
    pub acl: AclPolicy,
    #[serde(default)]
    pub dial: Dial,
    #[serde(default)]
    pub store: Store,
}

/// Access control applied to every node the client creates.
///
/// `open` matches namespaces written by older registrars (anyone may modify
/// any node). `creator_only` restricts deletion to the session that created
/// the node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AclPolicy {
    #[default]
    Open,
    CreatorOnly,
}

impl std::fmt::Display for AclPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AclPolicy::Open => write!(f, "open"),
            AclPolicy::CreatorOnly => write!(f, "creator_only"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Dial {
    #[serde(
        default = "default_dial_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: Option<KeepAlive>,
}

impl Default for Dial {
    fn default() -> Self {
        Self {
            timeout: default_dial_timeout(),
            tls: false,
            keep_alive: default_keep_alive(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct KeepAlive {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub interval: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
    #[serde(default = "default_while_idle")]
    pub while_idle: bool,
}

/// backend options for the JetStream KV store
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Store {
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(
        default = "default_heartbeat_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub heartbeat_interval: Duration,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

pub fn default_root() -> String {
    "/".to_owned()
}

pub const fn default_session_timeout() -> Duration {
    Duration::from_secs(10)
}

pub const fn default_refresh_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

pub const fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}

pub const fn default_while_idle() -> bool {
    true
}

pub fn default_keep_alive() -> Option<KeepAlive> {
    Some(KeepAlive {
        interval: Duration::from_secs(10),
        timeout: Duration::from_secs(20),
        while_idle: default_while_idle(),
    })
}

pub fn default_bucket() -> String {
    "rpc_registry".to_owned()
}

pub const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(3)
}

/// Parse a duration string with optional time units
/// Accepts: "3600", "3600s", "60m", "24h", "250ms"
/// If no unit is specified, assumes seconds
pub(crate) fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow::Error::msg("empty duration string"));
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis_per_unit = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Seconds(u64),
    String(String),
}

impl WireDuration {
    fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
        let dur = match self {
            WireDuration::Seconds(val) => Duration::from_secs(val),
            WireDuration::String(s) => parse_duration(&s).map_err(E::custom)?,
        };
        if dur.is_zero() {
            return Err(E::custom("duration cannot be zero"));
        }
        Ok(dur)
    }
}

fn deserialize_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    WireDuration::deserialize(de)?.into_duration()
}

fn serialize_duration<S>(dur: &Duration, ser: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if dur.subsec_millis() != 0 {
        ser.serialize_str(&format!("{}ms", dur.as_millis()))
    } else {
        ser.serialize_str(&format!("{}s", dur.as_secs()))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum MaybeList<T> {
    Val(T),
    List(Vec<T>),
}

impl<T> MaybeList<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            MaybeList::Val(v) => vec![v],
            MaybeList::List(list) => list,
        }
    }
}
