//! Coordination-service abstraction.
//!
//! [`Store`] is the small set of primitives the registry needs from a
//! hierarchical store with session semantics: existence checks, persistent and
//! ephemeral-sequential creation, deletion, reads, and children listing that
//! arms a one-shot watch. Watch firings and session state changes are pushed
//! on the [`EventStream`] returned by [`Connector::connect`], never delivered
//! inline.
//!
//! Two backends ship with the crate:
//! - [`memory::MemoryCluster`], an in-process tree shared by any number of sessions
//! - [`nats::NatsConnector`], backed by a NATS JetStream KV bucket

use std::sync::Arc;

use async_trait::async_trait;
use config::{AclPolicy, RegistryConfig};
use tokio::sync::mpsc;

use crate::error::RegistryResult;
use crate::models::{CreateMode, SessionState};

pub mod memory;
pub mod nats;

/// Notification pushed by a store session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A children watch armed on `path` fired: a child was added or removed.
    /// The watch is consumed and must be re-armed with [`Store::children_w`].
    ChildrenChanged { path: String },
    /// The session moved to a new lifecycle state.
    Session(SessionState),
}

/// Stream of [`StoreEvent`]s for one session.
pub type EventStream = mpsc::UnboundedReceiver<StoreEvent>;

/// One live session against the coordination service.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Identifier of this session, unique across the cluster.
    fn session_id(&self) -> &str;

    async fn exists(&self, path: &str) -> RegistryResult<bool>;

    /// Payload of the node at `path`, `None` if it does not exist.
    async fn get_data(&self, path: &str) -> RegistryResult<Option<Vec<u8>>>;

    /// Create a node. For [`CreateMode::EphemeralSequential`] `path` is a name
    /// prefix and the store appends a sequence number unique among the
    /// parent's children. Returns the path actually created.
    ///
    /// Fails with `NodeExists` if the node is already there and `NoNode` if
    /// the parent is missing.
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        acl: AclPolicy,
    ) -> RegistryResult<String>;

    async fn delete(&self, path: &str) -> RegistryResult<()>;

    /// Names (not paths) of the children of `path`.
    async fn children(&self, path: &str) -> RegistryResult<Vec<String>>;

    /// Names (not paths) of the children of `path`, arming a one-shot watch
    /// that fires the next time a child is added or removed.
    async fn children_w(&self, path: &str) -> RegistryResult<Vec<String>>;

    /// End the session. Ephemeral nodes it owns disappear.
    async fn close(&self);
}

/// Opens store sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &RegistryConfig,
    ) -> RegistryResult<(Arc<dyn Store>, EventStream)>;
}
