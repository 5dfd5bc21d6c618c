//! Coordination store backed by a NATS JetStream KV bucket.
//!
//! The hierarchical tree is flattened into keys:
//!
//! - `node{path}` holds a JSON [`NodeRecord`] for every node (`node/` is the root)
//! - `seq{parent}` is bumped to mint sequence numbers for sequential children;
//!   the bucket revision of the write becomes the sequence
//! - `session/{id}` is the heartbeat of a live session
//!
//! Ephemeral nodes record their owning session. Every session's heartbeat loop
//! sweeps sessions whose heartbeat is older than the session timeout and
//! removes the ephemeral nodes they owned. A session that cannot heartbeat for
//! longer than the timeout, or finds its own heartbeat reaped, reports itself
//! expired.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::ConnectOptions;
use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use config::{AclPolicy, RegistryConfig};
use futures::TryStreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::models::{self, CreateMode, SessionState};
use crate::path;
use crate::store::{Connector, EventStream, Store, StoreEvent};

const NODE_PREFIX: &str = "node";
const SEQ_PREFIX: &str = "seq";
const SESSION_PREFIX: &str = "session/";

/// Record stored under a `node{path}` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(default)]
    pub data: Vec<u8>,
    /// Session owning an ephemeral node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub creator: String,
    #[serde(default)]
    pub acl: AclPolicy,
    pub created_at: DateTime<Utc>,
}

/// Record stored under a `session/{id}` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    session_id: String,
    last_seen: DateTime<Utc>,
}

/// KV key holding the node at `path`.
pub fn node_key(path: &str) -> RegistryResult<String> {
    let key = format!("{NODE_PREFIX}{path}");
    validate_key(&key)?;
    Ok(key)
}

/// Inverse of [`node_key`].
pub fn key_path(key: &str) -> Option<&str> {
    key.strip_prefix(NODE_PREFIX).filter(|p| p.starts_with('/'))
}

/// JetStream KV keys are restricted to `[-/_=.a-zA-Z0-9]` and may not start
/// or end with `.`.
fn validate_key(key: &str) -> RegistryResult<()> {
    let allowed = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '/' | '_' | '=' | '.'));
    if key.is_empty() || !allowed || key.starts_with('.') || key.ends_with('.') || key.contains("..")
    {
        return Err(RegistryError::InvalidPath(format!(
            "'{key}' cannot be stored as a KV key"
        )));
    }
    Ok(())
}

fn transport(what: &str, key: &str, err: impl std::fmt::Display) -> RegistryError {
    RegistryError::Transport(format!("KV {what} failed for key '{key}': {err}"))
}

/// Opens sessions against the NATS servers named in the registry config.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsConnector;

impl NatsConnector {
    pub fn new() -> Self {
        Self
    }

    async fn get_or_create_bucket(
        js: &jetstream::Context,
        bucket: &str,
    ) -> RegistryResult<kv::Store> {
        match js.get_key_value(bucket.to_string()).await {
            Ok(store) => Ok(store),
            Err(get_err) => {
                debug!(bucket, error = %get_err, "creating missing JetStream KV bucket");
                js.create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|create_err| {
                    RegistryError::Transport(format!(
                        "failed to get or create KV bucket '{bucket}': get={get_err}, create={create_err}"
                    ))
                })
            }
        }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(
        &self,
        config: &RegistryConfig,
    ) -> RegistryResult<(Arc<dyn Store>, EventStream)> {
        info!(servers = ?config.servers, bucket = %config.store.bucket, "connecting to NATS");
        let client = ConnectOptions::new()
            .connection_timeout(config.session_timeout)
            .connect(config.servers.clone())
            .await
            .map_err(|e| RegistryError::Connect(format!("NATS connection failed: {e}")))?;

        let js = jetstream::new(client.clone());
        let kv = Self::get_or_create_bucket(&js, &config.store.bucket).await?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            kv,
            client,
            session_id,
            armed: Mutex::new(HashSet::new()),
            expired: AtomicBool::new(false),
            events,
            session_timeout: config.session_timeout,
        });

        shared.ensure_root().await?;
        shared.heartbeat().await?;

        let token = CancellationToken::new();
        let watch = shared
            .kv
            .watch_all()
            .await
            .map_err(|e| RegistryError::Transport(format!("failed to watch KV bucket: {e}")))?;
        tokio::spawn(watch_loop(shared.clone(), watch, token.clone()));
        tokio::spawn(heartbeat_loop(
            shared.clone(),
            config.store.heartbeat_interval,
            token.clone(),
        ));

        info!(session_id = %shared.session_id, "NATS session established");
        let session = NatsSession {
            shared,
            token,
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(session), rx))
    }
}

/// State shared between a session handle and its background loops.
struct Shared {
    kv: kv::Store,
    client: async_nats::Client,
    session_id: String,
    armed: Mutex<HashSet<String>>,
    expired: AtomicBool,
    events: mpsc::UnboundedSender<StoreEvent>,
    session_timeout: Duration,
}

impl Shared {
    fn check(&self) -> RegistryResult<()> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(RegistryError::SessionExpired);
        }
        Ok(())
    }

    fn session_key(&self) -> String {
        format!("{SESSION_PREFIX}{}", self.session_id)
    }

    async fn ensure_root(&self) -> RegistryResult<()> {
        let key = node_key("/")?;
        let record = NodeRecord {
            data: Vec::new(),
            owner: None,
            creator: self.session_id.clone(),
            acl: AclPolicy::Open,
            created_at: Utc::now(),
        };
        match self.kv.create(&key, models::encode(&record)?.into()).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(transport("create", &key, e)),
        }
    }

    async fn heartbeat(&self) -> RegistryResult<()> {
        let key = self.session_key();
        let record = SessionRecord {
            session_id: self.session_id.clone(),
            last_seen: Utc::now(),
        };
        self.kv
            .put(&key, models::encode(&record)?.into())
            .await
            .map(|_| ())
            .map_err(|e| transport("write", &key, e))
    }

    async fn load(&self, path: &str) -> RegistryResult<Option<NodeRecord>> {
        let key = node_key(path)?;
        let value = self
            .kv
            .get(key.clone())
            .await
            .map_err(|e| transport("read", &key, e))?;
        match value {
            Some(bytes) => models::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn keys(&self) -> RegistryResult<Vec<String>> {
        let mut keys = self
            .kv
            .keys()
            .await
            .map_err(|e| RegistryError::Transport(format!("failed to list KV keys: {e}")))?;
        let mut out = Vec::new();
        while let Some(key) = keys
            .try_next()
            .await
            .map_err(|e| RegistryError::Transport(format!("failed reading KV keys: {e}")))?
        {
            out.push(key);
        }
        Ok(out)
    }

    async fn children(&self, parent: &str) -> RegistryResult<Vec<String>> {
        let mut children: Vec<String> = self
            .keys()
            .await?
            .iter()
            .filter_map(|key| key_path(key))
            .filter(|p| path::parent(p) == Some(parent))
            .map(|p| path::name(p).to_owned())
            .collect();
        children.sort();
        Ok(children)
    }

    async fn next_sequence(&self, parent: &str) -> RegistryResult<u64> {
        let key = format!("{SEQ_PREFIX}{parent}");
        validate_key(&key)?;
        self.kv
            .put(&key, self.session_id.clone().into_bytes().into())
            .await
            .map_err(|e| transport("write", &key, e))
    }

    /// Remove every ephemeral node owned by `owner`.
    async fn reap(&self, owner: &str) -> RegistryResult<usize> {
        let mut removed = 0;
        for key in self.keys().await? {
            let Some(path) = key_path(&key) else { continue };
            let record = match self.load(path).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(RegistryError::Codec(reason)) => {
                    warn!(%key, %reason, "skipping undecodable node record");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if record.owner.as_deref() == Some(owner) {
                self.kv
                    .delete(&key)
                    .await
                    .map_err(|e| transport("delete", &key, e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Find sessions whose heartbeat is older than the session timeout and
    /// remove what they left behind.
    async fn sweep(&self) -> RegistryResult<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.session_timeout)
                .map_err(|e| RegistryError::Config(e.to_string()))?;
        for key in self.keys().await? {
            let Some(id) = key.strip_prefix(SESSION_PREFIX) else {
                continue;
            };
            if id == self.session_id {
                continue;
            }
            let Some(bytes) = self
                .kv
                .get(key.clone())
                .await
                .map_err(|e| transport("read", &key, e))?
            else {
                continue;
            };
            let stale = match models::decode::<SessionRecord>(&bytes) {
                Ok(record) => record.last_seen < cutoff,
                Err(err) => {
                    warn!(%key, error = %err, "undecodable session record, reaping");
                    true
                }
            };
            if stale {
                let removed = self.reap(id).await?;
                self.kv
                    .delete(&key)
                    .await
                    .map_err(|e| transport("delete", &key, e))?;
                info!(session_id = id, removed, "reaped expired session");
            }
        }
        Ok(())
    }

    /// Our own heartbeat was reaped by a peer.
    async fn lost_heartbeat(&self) -> RegistryResult<bool> {
        let key = self.session_key();
        let value = self
            .kv
            .get(key.clone())
            .await
            .map_err(|e| transport("read", &key, e))?;
        Ok(value.is_none())
    }

    fn expire(&self) {
        if !self.expired.swap(true, Ordering::SeqCst) {
            self.armed.lock().clear();
            let _ = self.events.send(StoreEvent::Session(SessionState::Expired));
        }
    }
}

/// Fire armed children watches from bucket updates.
async fn watch_loop(shared: Arc<Shared>, mut watch: kv::Watch, token: CancellationToken) {
    loop {
        let entry = tokio::select! {
            _ = token.cancelled() => break,
            entry = watch.try_next() => entry,
        };
        let entry = match entry {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!("KV watch ended");
                break;
            }
            Err(err) => {
                warn!(error = %err, "KV watch failed");
                continue;
            }
        };
        let Some(path) = key_path(&entry.key) else {
            continue;
        };
        let Some(parent) = path::parent(path) else {
            continue;
        };
        let mut fired = Vec::with_capacity(2);
        {
            let mut armed = shared.armed.lock();
            if armed.remove(parent) {
                fired.push(parent.to_owned());
            }
            // a deleted node also fires the watch armed on itself
            if !matches!(entry.operation, kv::Operation::Put) && armed.remove(path) {
                fired.push(path.to_owned());
            }
        }
        for path in fired {
            debug!(%path, op = ?entry.operation, "children watch fired");
            let _ = shared.events.send(StoreEvent::ChildrenChanged { path });
        }
    }
}

/// Time since the last heartbeat write that reached the bucket.
#[derive(Debug)]
struct Liveness {
    last_ok: Instant,
    timeout: Duration,
}

impl Liveness {
    fn new(timeout: Duration) -> Self {
        Self {
            last_ok: Instant::now(),
            timeout,
        }
    }

    /// Record one heartbeat attempt. Returns true once no heartbeat has
    /// succeeded for longer than the session timeout.
    fn record<T>(&mut self, heartbeat: &RegistryResult<T>) -> bool {
        match heartbeat {
            Ok(_) => {
                self.last_ok = Instant::now();
                false
            }
            Err(_) => self.last_ok.elapsed() > self.timeout,
        }
    }
}

/// Heartbeat, sweep peers, and track connectivity.
///
/// Only the heartbeat write decides liveness; a failed peer sweep is logged
/// and retried on the next tick.
async fn heartbeat_loop(shared: Arc<Shared>, every: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    let mut liveness = Liveness::new(shared.session_timeout);
    let mut connected = true;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let conn = shared.client.connection_state();
        let up = matches!(conn, async_nats::connection::State::Connected);
        if up != connected {
            connected = up;
            let state = if up {
                SessionState::Connected
            } else {
                SessionState::Connecting
            };
            let _ = shared.events.send(StoreEvent::Session(state));
        }

        let heartbeat = if up {
            match shared.lost_heartbeat().await {
                Ok(true) => {
                    warn!(session_id = %shared.session_id, "session heartbeat was reaped");
                    shared.expire();
                    break;
                }
                Ok(false) => shared.heartbeat().await,
                Err(err) => Err(err),
            }
        } else {
            Err(RegistryError::Transport(format!("connection {conn:?}")))
        };

        if let Err(err) = &heartbeat {
            warn!(error = %err, "session heartbeat failed");
        }
        if liveness.record(&heartbeat) {
            warn!(session_id = %shared.session_id, "session timed out");
            shared.expire();
            break;
        }
        if heartbeat.is_ok() {
            if let Err(err) = shared.sweep().await {
                warn!(error = %err, "failed to sweep expired sessions");
            }
        }
    }
}

/// One NATS-backed session. Dropping it stops the background loops.
pub struct NatsSession {
    shared: Arc<Shared>,
    token: CancellationToken,
    closed: AtomicBool,
}

impl std::fmt::Debug for NatsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsSession")
            .field("session_id", &self.shared.session_id)
            .finish()
    }
}

impl NatsSession {
    fn check(&self) -> RegistryResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }
        self.shared.check()
    }
}

impl Drop for NatsSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[async_trait]
impl Store for NatsSession {
    fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    async fn exists(&self, path: &str) -> RegistryResult<bool> {
        self.check()?;
        Ok(self.shared.load(path).await?.is_some())
    }

    async fn get_data(&self, path: &str) -> RegistryResult<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.shared.load(path).await?.map(|r| r.data))
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        acl: AclPolicy,
    ) -> RegistryResult<String> {
        self.check()?;
        let parent = path::parent(path)
            .ok_or_else(|| RegistryError::NodeExists(path.to_owned()))?
            .to_owned();
        if self.shared.load(&parent).await?.is_none() {
            return Err(RegistryError::NoNode(parent));
        }

        let created = match mode {
            CreateMode::Persistent => path.to_owned(),
            CreateMode::EphemeralSequential => {
                let seq = self.shared.next_sequence(&parent).await?;
                path::sequential_name(path, seq)
            }
        };
        path::validate_path(&created)?;
        let key = node_key(&created)?;
        let record = NodeRecord {
            data: data.to_vec(),
            owner: mode.is_ephemeral().then(|| self.shared.session_id.clone()),
            creator: self.shared.session_id.clone(),
            acl,
            created_at: Utc::now(),
        };
        match self.shared.kv.create(&key, models::encode(&record)?.into()).await {
            Ok(_) => Ok(created),
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => {
                Err(RegistryError::NodeExists(created))
            }
            Err(e) => Err(transport("create", &key, e)),
        }
    }

    async fn delete(&self, path: &str) -> RegistryResult<()> {
        self.check()?;
        let record = self
            .shared
            .load(path)
            .await?
            .ok_or_else(|| RegistryError::NoNode(path.to_owned()))?;
        if record.acl == AclPolicy::CreatorOnly && record.creator != self.shared.session_id {
            return Err(RegistryError::PermissionDenied(path.to_owned()));
        }
        if !self.shared.children(path).await?.is_empty() {
            return Err(RegistryError::NotEmpty(path.to_owned()));
        }
        let key = node_key(path)?;
        self.shared
            .kv
            .delete(&key)
            .await
            .map_err(|e| transport("delete", &key, e))
    }

    async fn children(&self, path: &str) -> RegistryResult<Vec<String>> {
        self.check()?;
        if self.shared.load(path).await?.is_none() {
            return Err(RegistryError::NoNode(path.to_owned()));
        }
        self.shared.children(path).await
    }

    async fn children_w(&self, path: &str) -> RegistryResult<Vec<String>> {
        self.check()?;
        if self.shared.load(path).await?.is_none() {
            return Err(RegistryError::NoNode(path.to_owned()));
        }
        // arm before listing so a change racing the listing still fires
        self.shared.armed.lock().insert(path.to_owned());
        self.shared.children(path).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        if !self.shared.expired.load(Ordering::SeqCst) {
            if let Err(err) = self.shared.reap(&self.shared.session_id).await {
                warn!(error = %err, "failed to remove ephemeral nodes on close");
            }
            let key = self.shared.session_key();
            if let Err(err) = self.shared.kv.delete(&key).await {
                warn!(%key, error = %err, "failed to remove session heartbeat on close");
            }
        }
        debug!(session_id = %self.shared.session_id, "NATS session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_keys() {
        assert_eq!(node_key("/").unwrap(), "node/");
        assert_eq!(node_key("/rpc/echo").unwrap(), "node/rpc/echo");
        assert_eq!(
            node_key("/rpc/echo/10.0.0.1_9000_0000000001").unwrap(),
            "node/rpc/echo/10.0.0.1_9000_0000000001"
        );
        assert_eq!(key_path("node/rpc/echo"), Some("/rpc/echo"));
        assert_eq!(key_path("node/"), Some("/"));
        assert_eq!(key_path("session/abc"), None);
        assert_eq!(key_path("seq/rpc"), None);
    }

    #[test]
    fn test_invalid_keys_rejected() {
        assert!(node_key("/rpc/echo svc").is_err());
        assert!(node_key("/rpc/ech*").is_err());
        assert!(node_key("/rpc/a..b").is_err());
        assert!(node_key("/rpc/trailing.").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_follows_heartbeat_only() {
        let timeout = Duration::from_secs(10);
        let mut liveness = Liveness::new(timeout);
        let failed: RegistryResult<()> = Err(RegistryError::Transport("down".into()));

        // steady heartbeats never lapse, however long the session lives
        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(5)).await;
            assert!(!liveness.record(&Ok(())));
        }

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!liveness.record(&failed));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(liveness.record(&failed));

        // one successful write resets the window
        assert!(!liveness.record(&Ok(())));
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!liveness.record(&failed));
    }

    #[test]
    fn test_node_record_codec() {
        let record = NodeRecord {
            data: b"10.0.0.1:9000".to_vec(),
            owner: Some("s-1".into()),
            creator: "s-1".into(),
            acl: AclPolicy::Open,
            created_at: Utc::now(),
        };
        let bytes = models::encode(&record).unwrap();
        let back: NodeRecord = models::decode(&bytes).unwrap();
        assert_eq!(back, record);

        let persistent: NodeRecord =
            models::decode(br#"{"creator":"s-2","created_at":"2024-01-01T00:00:00Z"}"#).unwrap();
        assert!(persistent.owner.is_none());
        assert!(persistent.data.is_empty());
        assert_eq!(persistent.acl, AclPolicy::Open);
    }
}
