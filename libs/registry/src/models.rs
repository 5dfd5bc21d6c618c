//! Typed models shared by the registry components, plus the JSON codec used
//! for records persisted by store backends.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// A `(host, port)` pair advertised by a registered RPC server.
///
/// Displayed the way the payload of a registration entry is written:
/// `host:port`, with IPv6 hosts bracketed (`[::1]:9000`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_owned)
            .unwrap_or(host);
        Self { host, port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse a `host:port` string. IPv6 hosts must be bracketed.
    pub fn parse(s: &str) -> RegistryResult<Self> {
        let malformed = |why: &str| RegistryError::Codec(format!("malformed address {s:?}: {why}"));

        let (host, port) = s.rsplit_once(':').ok_or_else(|| malformed("missing port"))?;
        let host = match host.strip_prefix('[') {
            Some(rest) => rest
                .strip_suffix(']')
                .ok_or_else(|| malformed("unterminated '['"))?,
            None if host.contains(':') => return Err(malformed("too many colons")),
            None => host,
        };
        if host.is_empty() {
            return Err(malformed("empty host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| malformed(&format!("bad port: {e}")))?;
        if port == 0 {
            return Err(malformed("port 0"));
        }
        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }

    /// Decode the payload of a registration entry.
    pub fn from_payload(payload: &[u8]) -> RegistryResult<Self> {
        let s = std::str::from_utf8(payload)
            .map_err(|e| RegistryError::Codec(format!("registration payload is not UTF-8: {e}")))?;
        Self::parse(s.trim())
    }

    /// Encode as the payload of a registration entry.
    pub fn to_payload(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Check that the payload written for this address decodes back to it,
    /// so that resolvers can read the entry. Rejects an empty host, port 0
    /// and hosts that do not survive the `host:port` encoding.
    pub fn validate(&self) -> RegistryResult<()> {
        let decoded = Self::from_payload(&self.to_payload())?;
        if decoded != *self {
            return Err(RegistryError::Codec(format!(
                "address {self} does not round-trip through its payload"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Address {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Address set & snapshots
// ---------------------------------------------------------------------------

/// Addresses currently registered under a service path. May be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet(BTreeSet<Address>);

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.0.contains(addr)
    }

    pub fn insert(&mut self, addr: Address) -> bool {
        self.0.insert(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.0.iter()
    }
}

impl FromIterator<Address> for AddressSet {
    fn from_iter<T: IntoIterator<Item = Address>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for AddressSet {
    type Item = Address;
    type IntoIter = std::collections::btree_set::IntoIter<Address>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a AddressSet {
    type Item = &'a Address;
    type IntoIter = std::collections::btree_set::Iter<'a, Address>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A versioned view of a service's membership.
///
/// Versions increase strictly for a given service; a snapshot is only ever
/// replaced by one with a higher version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSnapshot {
    pub version: u64,
    pub addresses: AddressSet,
}

impl AddressSnapshot {
    pub fn new(version: u64, addresses: AddressSet) -> Self {
        Self { version, addresses }
    }

    /// Replace `self` with `newer` if it carries a higher version.
    pub fn advance(&mut self, newer: AddressSnapshot) -> bool {
        if newer.version > self.version {
            *self = newer;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Coordination-service session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Connected,
    /// The session was lost; ephemeral entries and watches are gone.
    Expired,
    /// Closed locally.
    Closed,
}

impl SessionState {
    /// No further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Expired | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Expired => write!(f, "expired"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Bound to the creating session; the name gets a store-assigned sequence suffix.
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::EphemeralSequential)
    }
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

/// Encode a typed record into JSON bytes for a store backend.
pub fn encode<T: Serialize>(value: &T) -> RegistryResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| RegistryError::Codec(e.to_string()))
}

/// Decode JSON bytes from a store backend into a typed record.
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> RegistryResult<T> {
    serde_json::from_slice(data).map_err(|e| RegistryError::Codec(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        let addr = Address::parse("10.0.0.1:9000").unwrap();
        assert_eq!(addr.host(), "10.0.0.1");
        assert_eq!(addr.port(), 9000);
        assert_eq!(addr.to_string(), "10.0.0.1:9000");

        let addr = Address::parse("echo.internal:50051").unwrap();
        assert_eq!(addr.host(), "echo.internal");
    }

    #[test]
    fn test_address_ipv6() {
        let addr = Address::parse("[::1]:9000").unwrap();
        assert_eq!(addr.host(), "::1");
        assert_eq!(addr.to_string(), "[::1]:9000");
        assert_eq!(Address::new("::1", 9000), addr);
        assert_eq!(Address::new("[::1]", 9000), addr);
    }

    #[test]
    fn test_address_malformed() {
        for bad in ["", "10.0.0.1", "10.0.0.1:", ":9000", "::1:9000", "[::1:9000", "h:70000", "h:0", "h:port"] {
            assert!(Address::parse(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_address_validate() {
        assert!(Address::new("10.0.0.1", 9000).validate().is_ok());
        assert!(Address::new("::1", 9000).validate().is_ok());
        assert!(Address::new("echo.internal", 1).validate().is_ok());
        for bad in [
            Address::new("10.0.0.1", 0),
            Address::new("", 9000),
            Address::new(" 10.0.0.1", 9000),
            Address::new("10.0.0.1\n", 9000),
        ] {
            let err = bad.validate().unwrap_err();
            assert!(matches!(err, RegistryError::Codec(_)), "{bad:?}: {err}");
        }
    }

    #[test]
    fn test_address_payload() {
        let addr = Address::new("10.0.0.2", 9000);
        assert_eq!(addr.to_payload(), b"10.0.0.2:9000");
        assert_eq!(Address::from_payload(b"10.0.0.2:9000\n").unwrap(), addr);
        assert!(Address::from_payload(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_snapshot_advance_discards_stale() {
        let mut current = AddressSnapshot::new(
            3,
            [Address::new("10.0.0.1", 9000)].into_iter().collect(),
        );
        let stale = AddressSnapshot::new(2, AddressSet::new());
        assert!(!current.advance(stale));
        assert_eq!(current.version, 3);
        assert_eq!(current.addresses.len(), 1);

        let same = AddressSnapshot::new(3, AddressSet::new());
        assert!(!current.advance(same));

        let newer = AddressSnapshot::new(4, AddressSet::new());
        assert!(current.advance(newer));
        assert!(current.addresses.is_empty());
    }

    #[test]
    fn test_session_state() {
        assert!(!SessionState::Connected.is_terminal());
        assert!(!SessionState::Connecting.is_terminal());
        assert!(SessionState::Expired.is_terminal());
        assert!(SessionState::Closed.is_terminal());
        assert_eq!(SessionState::Expired.to_string(), "expired");
    }
}
