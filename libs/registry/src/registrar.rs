//! Self-registration of an RPC server instance.
//!
//! A [`Registrar`] is one logical instance: at most one live registration
//! entry at a time. Register and unregister are serialized by the handle
//! lock, so a second `register` fails fast with `AlreadyRegistered` instead
//! of racing the first.

use std::sync::Arc;
use std::time::Duration;

use config::AclPolicy;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bootstrap::ensure_path;
use crate::cache::ConnectionCache;
use crate::dialer::{Dialer, dial_with_timeout};
use crate::error::{RegistryError, RegistryResult};
use crate::metrics;
use crate::models::{Address, SessionState};
use crate::path::{Namespace, ServiceName};
use crate::session::Session;

/// A live registration entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub service: ServiceName,
    pub address: Address,
    /// Path of the ephemeral sequential node.
    pub node: String,
}

pub struct Registrar<D: Dialer> {
    session: Arc<Session>,
    namespace: Namespace,
    acl: AclPolicy,
    dialer: Arc<D>,
    dial_timeout: Duration,
    cache: Arc<ConnectionCache<D>>,
    handle: Arc<Mutex<Option<Registration>>>,
}

// clones share the handle; they are the same logical instance
impl<D: Dialer> Clone for Registrar<D> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            namespace: self.namespace.clone(),
            acl: self.acl,
            dialer: self.dialer.clone(),
            dial_timeout: self.dial_timeout,
            cache: self.cache.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl<D: Dialer> Registrar<D> {
    pub fn new(
        session: Arc<Session>,
        namespace: Namespace,
        acl: AclPolicy,
        dialer: Arc<D>,
        dial_timeout: Duration,
        cache: Arc<ConnectionCache<D>>,
    ) -> Self {
        Self {
            session,
            namespace,
            acl,
            dialer,
            dial_timeout,
            cache,
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// A new logical instance sharing this one's session, with no
    /// registration of its own.
    pub fn fork(&self) -> Self {
        let mut forked = self.clone();
        forked.handle = Arc::new(Mutex::new(None));
        forked
    }

    /// Register `address` under `service`.
    ///
    /// The address must encode to a readable payload and is dial-checked
    /// first; nothing is created if it is malformed or unreachable.
    pub async fn register(
        &self,
        service: &ServiceName,
        address: Address,
    ) -> RegistryResult<Registration> {
        address.validate()?;
        let mut handle = self.handle.lock().await;
        match self.session.state() {
            SessionState::Expired => return Err(RegistryError::SessionExpired),
            SessionState::Closed => return Err(RegistryError::Closed),
            _ => {}
        }
        if let Some(current) = handle.as_ref() {
            return Err(RegistryError::AlreadyRegistered {
                node: current.node.clone(),
            });
        }

        let service_path = self.namespace.service_path(service);
        ensure_path(&self.session, self.namespace.root(), self.acl).await?;
        ensure_path(&self.session, &service_path, self.acl).await?;

        dial_with_timeout(self.dialer.as_ref(), &address, self.dial_timeout).await?;

        let prefix = self.namespace.entry_prefix(service, &address);
        let node = self
            .session
            .create_ephemeral_sequential(&prefix, &address.to_payload(), self.acl)
            .await?;
        metrics::REGISTRATIONS.inc();
        info!(%service, %address, %node, "registered");

        let registration = Registration {
            service: service.clone(),
            address,
            node,
        };
        *handle = Some(registration.clone());
        Ok(registration)
    }

    /// Remove this instance's entry and clear the local connection cache.
    ///
    /// An entry already gone (session expired, node deleted) counts as
    /// removed. Fails with `NotRegistered` when there is nothing to remove.
    pub async fn unregister(&self) -> RegistryResult<Registration> {
        let mut handle = self.handle.lock().await;
        let Some(registration) = handle.as_ref() else {
            return Err(RegistryError::NotRegistered);
        };

        match self.session.delete(&registration.node).await {
            Ok(()) => {}
            Err(RegistryError::NoNode(_)) | Err(RegistryError::SessionExpired) => {
                warn!(node = %registration.node, "registration entry already gone");
            }
            Err(err) => return Err(err),
        }
        metrics::UNREGISTRATIONS.inc();
        info!(service = %registration.service, node = %registration.node, "unregistered");

        let registration = handle.take();
        self.cache.clear("unregister");
        registration.ok_or(RegistryError::NotRegistered)
    }

    /// The live registration, if any.
    pub async fn registration(&self) -> Option<Registration> {
        self.handle.lock().await.clone()
    }
}
