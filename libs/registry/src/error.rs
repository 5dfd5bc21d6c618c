//! Error types for registry operations.
//!
//! Store-level outcomes (`NodeExists`, `NoNode`, ...) are kept distinct from
//! the registration/discovery failures callers act on, so that races such as
//! two bootstrappers creating the same path can be absorbed without string
//! matching.

use thiserror::Error;

/// Top-level error type for the registry crate.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No coordination server answered within the session timeout.
    #[error("connect error: {0}")]
    Connect(String),

    /// Creating a namespace path failed for a reason other than "already exists".
    #[error("failed to bootstrap path '{path}': {reason}")]
    Bootstrap { path: String, reason: String },

    /// `register` was called while a registration entry is live.
    #[error("already registered as '{node}'")]
    AlreadyRegistered { node: String },

    /// `unregister` was called without an active registration.
    #[error("not registered")]
    NotRegistered,

    /// The RPC transport could not reach an address.
    #[error("failed to dial {address}: {reason}")]
    Dial { address: String, reason: String },

    /// The coordination session was lost. Registration entries are gone.
    #[error("coordination session expired")]
    SessionExpired,

    /// Reading the membership of a service failed.
    #[error("failed to resolve service '{service}': {reason}")]
    Resolve { service: String, reason: String },

    /// Node already exists (create).
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// Node, or the parent of a node being created, does not exist.
    #[error("no such node: {0}")]
    NoNode(String),

    /// Delete refused because the node still has children.
    #[error("node has children: {0}")]
    NotEmpty(String),

    /// The node's ACL forbids the operation for this session.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Store connection or transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Codec error while encoding or decoding a stored record.
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid service name or node path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The client or session has been closed.
    #[error("registry client closed")]
    Closed,
}

impl RegistryError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::Transport(_) | RegistryError::Timeout(_) | RegistryError::Dial { .. }
        )
    }

    /// Returns true if the coordination session is gone.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, RegistryError::SessionExpired)
    }

    /// Returns true for a create that lost a race against an existing node.
    pub fn is_node_exists(&self) -> bool {
        matches!(self, RegistryError::NodeExists(_))
    }

    /// Returns true if the node does not exist.
    pub fn is_no_node(&self) -> bool {
        matches!(self, RegistryError::NoNode(_))
    }

    /// Returns true if no further operation can succeed on this session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RegistryError::SessionExpired | RegistryError::Closed)
    }
}

/// Shorthand result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
