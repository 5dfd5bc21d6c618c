//! Node path layout.
//!
//! A pure translator from root + service name to concrete node paths:
//!
//! - service path: `{root}/{service}`
//! - registration entry: `{root}/{service}/{host}_{port}_{seq:010}`
//!
//! No component builds a path by hand; everything goes through [`Namespace`].

use std::fmt;

use crate::error::{RegistryError, RegistryResult};
use crate::models::Address;

/// Width of the store-assigned sequence suffix on sequential nodes.
pub const SEQUENCE_WIDTH: usize = 10;

/// Validated name of a logical service: one path segment under the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn new(name: impl Into<String>) -> RegistryResult<Self> {
        let name = name.into();
        if name.is_empty() || name == "." || name == ".." {
            return Err(RegistryError::InvalidPath(format!(
                "invalid service name {name:?}"
            )));
        }
        if name.contains('/') || name.chars().any(char::is_control) {
            return Err(RegistryError::InvalidPath(format!(
                "service name {name:?} must be a single path segment"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ServiceName {
    type Error = RegistryError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Root namespace every service path hangs off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    root: String,
}

impl Namespace {
    /// Build from a configured root. `rpc`, `/rpc` and `/rpc/` are equivalent.
    pub fn new(root: &str) -> RegistryResult<Self> {
        let root = config::normalize_root(root);
        validate_path(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// `{root}/{service}`
    pub fn service_path(&self, service: &ServiceName) -> String {
        join(&self.root, service.as_str())
    }

    /// Name prefix for a registration entry; the store appends the sequence.
    pub fn entry_prefix(&self, service: &ServiceName, addr: &Address) -> String {
        let name = format!("{}_{}_", sanitize_segment(addr.host()), addr.port());
        join(&self.service_path(service), &name)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self {
            root: "/".to_owned(),
        }
    }
}

/// Join a parent path and a child segment without doubling the separator.
pub fn join(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of `path`, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of `path`.
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Every path from the first segment down to `path` itself, root excluded:
/// `/a/b/c` gives `["/a", "/a/b", "/a/b/c"]`.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        out.push(current.clone());
    }
    out
}

/// Absolute, no empty segments, no trailing separator (except the root).
pub fn validate_path(path: &str) -> RegistryResult<()> {
    if !path.starts_with('/') {
        return Err(RegistryError::InvalidPath(format!(
            "path {path:?} is not absolute"
        )));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') || path.contains("//") {
        return Err(RegistryError::InvalidPath(format!(
            "path {path:?} has an empty segment"
        )));
    }
    if path.split('/').any(|s| s == "." || s == "..") {
        return Err(RegistryError::InvalidPath(format!(
            "path {path:?} has a relative segment"
        )));
    }
    Ok(())
}

/// Replace characters that are not safe in a node name with `_`.
pub fn sanitize_segment(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Final name of a sequential node.
pub fn sequential_name(prefix: &str, seq: u64) -> String {
    format!("{prefix}{seq:0width$}", width = SEQUENCE_WIDTH)
}

/// Sequence suffix of a sequential node name, if it has one.
pub fn parse_sequence(name: &str) -> Option<u64> {
    let suffix = name.get(name.len().checked_sub(SEQUENCE_WIDTH)?..)?;
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}
