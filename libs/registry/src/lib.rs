//! # registry
//!
//! Client-side RPC service registry on top of a hierarchical coordination
//! store with session semantics.
//!
//! Servers announce themselves by creating an ephemeral sequential entry under
//! `{root}/{service}`; the entry disappears when their session ends. Clients
//! watch the children of a service path, keep a versioned snapshot of the
//! membership, and hand out cached RPC connections to every live instance.
//!
//! This library provides:
//! - **Session** management with observable state and watch dispatch.
//! - **Namespace bootstrapping** of persistent paths, race-safe.
//! - **Registrar** for self-registration with a dial check.
//! - **Resolver** that re-arms one-shot watches and publishes snapshots.
//! - **Connection cache** populated lazily and invalidated wholesale, on
//!   membership change and on a periodic refresh.
//! - **Store backends**: in-process ([`store::memory`]) and NATS JetStream KV
//!   ([`store::nats`]).
//!
//! ## Example
//!
//! ```no_run
//! # async fn run() -> registry::RegistryResult<()> {
//! let config = config::RegistryConfig::new(["nats://127.0.0.1:4222"]).with_root("/rpc");
//! let client = registry::RegistryClient::connect_nats(config).await?;
//! client.register("echo", "10.0.0.1", 9000).await?;
//! for conn in client.get_connections("echo").await? {
//!     println!("{}", conn.address());
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod cache;
pub mod client;
pub mod dialer;
pub mod error;
pub mod metrics;
pub mod models;
pub mod path;
pub mod refresh;
pub mod registrar;
pub mod resolver;
pub mod session;
pub mod store;

// Re-export key types for convenient access
pub use client::RegistryClient;
pub use dialer::{Connection, Dialer, GrpcDialer};
pub use error::{RegistryError, RegistryResult};
pub use models::{Address, AddressSet, AddressSnapshot, SessionState};
pub use path::{Namespace, ServiceName};
pub use registrar::{Registrar, Registration};
pub use store::memory::MemoryCluster;
pub use store::nats::NatsConnector;
pub use store::{Connector, Store, StoreEvent};
