//! In-process coordination store.
//!
//! A [`MemoryCluster`] is the shared tree; every [`Connector::connect`] opens
//! a new session against it, so several clients in one process see each
//! other's registrations exactly as separate processes would against a real
//! ensemble. Sessions can be expired and the cluster made unreachable to
//! exercise failure paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use config::{AclPolicy, RegistryConfig};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::models::{CreateMode, SessionState};
use crate::path;
use crate::store::{Connector, EventStream, Store, StoreEvent};

#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<Mutex<ClusterState>>,
}

#[derive(Debug)]
struct ClusterState {
    nodes: BTreeMap<String, MemoryNode>,
    sessions: HashMap<String, SessionSlot>,
    next_session: u64,
    unreachable: bool,
}

impl Default for ClusterState {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_owned(), MemoryNode::persistent(Vec::new(), "", AclPolicy::Open));
        Self {
            nodes,
            sessions: HashMap::new(),
            next_session: 0,
            unreachable: false,
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryNode {
    data: Vec<u8>,
    /// owning session of an ephemeral node
    owner: Option<String>,
    creator: String,
    acl: AclPolicy,
    /// next sequence handed to a sequential child
    next_seq: u64,
}

impl MemoryNode {
    fn persistent(data: Vec<u8>, creator: &str, acl: AclPolicy) -> Self {
        Self {
            data,
            owner: None,
            creator: creator.to_owned(),
            acl,
            next_seq: 0,
        }
    }
}

#[derive(Debug)]
struct SessionSlot {
    events: mpsc::UnboundedSender<StoreEvent>,
    armed: HashSet<String>,
    alive: bool,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unreachable, `connect` never completes.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unreachable = unreachable;
    }

    /// Expire a session as the coordination service would after losing
    /// contact: its ephemeral nodes are removed and it is told `Expired`.
    /// Returns false if the session is unknown or already dead.
    pub fn expire_session(&self, session_id: &str) -> bool {
        let mut state = self.inner.lock();
        match state.sessions.get_mut(session_id) {
            Some(slot) if slot.alive => {
                slot.alive = false;
                slot.armed.clear();
                let _ = slot.events.send(StoreEvent::Session(SessionState::Expired));
            }
            _ => return false,
        }
        state.remove_ephemerals(session_id);
        debug!(session_id, "memory session expired");
        true
    }

    /// Ids of the sessions currently alive.
    pub fn live_sessions(&self) -> Vec<String> {
        let state = self.inner.lock();
        let mut ids: Vec<String> = state
            .sessions
            .iter()
            .filter(|(_, slot)| slot.alive)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn exists(&self, path: &str) -> bool {
        self.inner.lock().nodes.contains_key(path)
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().nodes.get(path).map(|n| n.data.clone())
    }

    /// Sorted child names of `path`.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.inner.lock().children_of(path)
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }
}

impl ClusterState {
    fn children_of(&self, parent: &str) -> Vec<String> {
        let prefix = if parent == "/" {
            "/".to_owned()
        } else {
            format!("{parent}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_owned())
            })
            .collect()
    }

    fn has_children(&self, parent: &str) -> bool {
        !self.children_of(parent).is_empty()
    }

    /// Fire (and disarm) every children watch on `parent`.
    fn fire(&mut self, parent: &str) {
        for slot in self.sessions.values_mut().filter(|s| s.alive) {
            if slot.armed.remove(parent) {
                let _ = slot.events.send(StoreEvent::ChildrenChanged {
                    path: parent.to_owned(),
                });
            }
        }
    }

    fn remove_ephemerals(&mut self, session_id: &str) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner.as_deref() == Some(session_id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in owned {
            self.nodes.remove(&key);
            if let Some(parent) = path::parent(&key) {
                self.fire(parent);
            }
        }
    }

    fn check_session(&self, session_id: &str) -> RegistryResult<()> {
        match self.sessions.get(session_id) {
            Some(slot) if slot.alive => Ok(()),
            Some(_) => Err(RegistryError::SessionExpired),
            None => Err(RegistryError::Closed),
        }
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    async fn connect(
        &self,
        _config: &RegistryConfig,
    ) -> RegistryResult<(Arc<dyn Store>, EventStream)> {
        if self.inner.lock().unreachable {
            // no server answers; the caller's connect timeout decides
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.inner.lock();
            state.next_session += 1;
            let id = format!("mem-{}", state.next_session);
            state.sessions.insert(
                id.clone(),
                SessionSlot {
                    events: tx,
                    armed: HashSet::new(),
                    alive: true,
                },
            );
            id
        };
        debug!(session_id = %id, "memory session opened");

        let session = MemorySession {
            id,
            cluster: self.clone(),
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(session), rx))
    }
}

/// One session against a [`MemoryCluster`].
#[derive(Debug)]
pub struct MemorySession {
    id: String,
    cluster: MemoryCluster,
    closed: AtomicBool,
}

impl MemorySession {
    fn lock(&self) -> RegistryResult<parking_lot::MutexGuard<'_, ClusterState>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }
        let state = self.cluster.inner.lock();
        state.check_session(&self.id)?;
        Ok(state)
    }
}

#[async_trait]
impl Store for MemorySession {
    fn session_id(&self) -> &str {
        &self.id
    }

    async fn exists(&self, path: &str) -> RegistryResult<bool> {
        let state = self.lock()?;
        Ok(state.nodes.contains_key(path))
    }

    async fn get_data(&self, path: &str) -> RegistryResult<Option<Vec<u8>>> {
        let state = self.lock()?;
        Ok(state.nodes.get(path).map(|n| n.data.clone()))
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        acl: AclPolicy,
    ) -> RegistryResult<String> {
        let mut state = self.lock()?;
        let parent = path::parent(path)
            .ok_or_else(|| RegistryError::NodeExists(path.to_owned()))?
            .to_owned();

        let created = match mode {
            CreateMode::Persistent => {
                path::validate_path(path)?;
                if state.nodes.contains_key(path) {
                    return Err(RegistryError::NodeExists(path.to_owned()));
                }
                path.to_owned()
            }
            CreateMode::EphemeralSequential => {
                let parent_node = state
                    .nodes
                    .get_mut(&parent)
                    .ok_or_else(|| RegistryError::NoNode(parent.clone()))?;
                let seq = parent_node.next_seq;
                parent_node.next_seq += 1;
                let created = path::sequential_name(path, seq);
                path::validate_path(&created)?;
                created
            }
        };
        if !state.nodes.contains_key(&parent) {
            return Err(RegistryError::NoNode(parent));
        }
        if state.nodes.contains_key(&created) {
            return Err(RegistryError::NodeExists(created));
        }

        let mut node = MemoryNode::persistent(data.to_vec(), &self.id, acl);
        if mode.is_ephemeral() {
            node.owner = Some(self.id.clone());
        }
        state.nodes.insert(created.clone(), node);
        state.fire(&parent);
        Ok(created)
    }

    async fn delete(&self, path: &str) -> RegistryResult<()> {
        let mut state = self.lock()?;
        let node = state
            .nodes
            .get(path)
            .ok_or_else(|| RegistryError::NoNode(path.to_owned()))?;
        if node.acl == AclPolicy::CreatorOnly && node.creator != self.id {
            return Err(RegistryError::PermissionDenied(path.to_owned()));
        }
        if state.has_children(path) {
            return Err(RegistryError::NotEmpty(path.to_owned()));
        }
        state.nodes.remove(path);
        if let Some(parent) = path::parent(path) {
            state.fire(parent);
        }
        // a watch armed on the deleted node itself fires too
        state.fire(path);
        Ok(())
    }

    async fn children(&self, path: &str) -> RegistryResult<Vec<String>> {
        let state = self.lock()?;
        if !state.nodes.contains_key(path) {
            return Err(RegistryError::NoNode(path.to_owned()));
        }
        Ok(state.children_of(path))
    }

    async fn children_w(&self, path: &str) -> RegistryResult<Vec<String>> {
        let mut state = self.lock()?;
        if !state.nodes.contains_key(path) {
            return Err(RegistryError::NoNode(path.to_owned()));
        }
        let children = state.children_of(path);
        if let Some(slot) = state.sessions.get_mut(&self.id) {
            slot.armed.insert(path.to_owned());
        }
        Ok(children)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.cluster.inner.lock();
        state.sessions.remove(&self.id);
        state.remove_ephemerals(&self.id);
        debug!(session_id = %self.id, "memory session closed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
