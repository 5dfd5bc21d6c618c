use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use config::RegistryConfig;
use parking_lot::Mutex;
use registry::{Address, Dialer, MemoryCluster, RegistryClient, RegistryError, RegistryResult};

/// Connection handed out by [`FakeDialer`]; clones share one underlying
/// connection, which counts as closed once every clone is dropped.
#[derive(Debug, Clone)]
pub struct FakeConn(Arc<Address>);

impl FakeConn {
    pub fn target(&self) -> &Address {
        &self.0
    }
}

#[derive(Default)]
struct DialerState {
    dials: Vec<Address>,
    failing: HashSet<Address>,
    blocking: HashSet<Address>,
    opened: Vec<Weak<Address>>,
}

/// Dialer that never touches the network. Addresses can be made to fail or
/// to hang forever.
#[derive(Clone, Default)]
pub struct FakeDialer {
    state: Arc<Mutex<DialerState>>,
}

#[allow(unused)]
impl FakeDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, address: Address) {
        self.state.lock().failing.insert(address);
    }

    pub fn block(&self, address: Address) {
        self.state.lock().blocking.insert(address);
    }

    /// Every dial attempted so far, registration dial checks included.
    pub fn dials(&self) -> Vec<Address> {
        self.state.lock().dials.clone()
    }

    pub fn dial_count(&self) -> usize {
        self.state.lock().dials.len()
    }

    /// Connections with at least one live handle.
    pub fn open_connections(&self) -> usize {
        self.state
            .lock()
            .opened
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    type Conn = FakeConn;

    async fn dial(&self, address: &Address) -> RegistryResult<FakeConn> {
        let (fail, block) = {
            let mut state = self.state.lock();
            state.dials.push(address.clone());
            (
                state.failing.contains(address),
                state.blocking.contains(address),
            )
        };
        if block {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(RegistryError::Dial {
                address: address.to_string(),
                reason: "connection refused".into(),
            });
        }
        let conn = Arc::new(address.clone());
        self.state.lock().opened.push(Arc::downgrade(&conn));
        Ok(FakeConn(conn))
    }
}

#[allow(unused)]
pub fn config(root: &str) -> RegistryConfig {
    RegistryConfig::new(["memory"])
        .with_root(root)
        .with_dial_timeout(Duration::from_millis(500))
}

#[allow(unused)]
pub async fn client(
    cluster: &MemoryCluster,
    dialer: &FakeDialer,
    root: &str,
) -> RegistryClient<FakeDialer> {
    RegistryClient::connect(config(root), cluster, dialer.clone())
        .await
        .unwrap()
}
