//! Registry metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!` and
//! registered in the default prometheus registry.
//!
//! # Note
//! Metric registration failures are fatal (using `.unwrap()`). Registration
//! only fails on a duplicate or malformed metric name, which is a programming
//! error.

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, register_int_counter, register_int_counter_vec,
    register_int_gauge,
};

lazy_static! {
    /// Count of registration entries created
    pub static ref REGISTRATIONS: IntCounter = register_int_counter!(
        "rpc_registry_registrations",
        "count of registration entries created"
    ).unwrap();

    /// Count of registration entries removed by unregister
    pub static ref UNREGISTRATIONS: IntCounter = register_int_counter!(
        "rpc_registry_unregistrations",
        "count of registration entries removed by unregister"
    ).unwrap();

    /// Count of RPC connections dialed
    pub static ref DIALS: IntCounter = register_int_counter!(
        "rpc_registry_dials",
        "count of RPC connections dialed"
    ).unwrap();

    /// Count of dials that failed or timed out
    pub static ref DIAL_FAILURES: IntCounter = register_int_counter!(
        "rpc_registry_dial_failures",
        "count of RPC dials that failed or timed out"
    ).unwrap();

    /// Count of get_connections answered from the cache
    pub static ref CACHE_HITS: IntCounter = register_int_counter!(
        "rpc_registry_cache_hits",
        "count of connection lookups served from the cache"
    ).unwrap();

    /// Count of get_connections that had to dial
    pub static ref CACHE_MISSES: IntCounter = register_int_counter!(
        "rpc_registry_cache_misses",
        "count of connection lookups that populated the cache"
    ).unwrap();

    /// Count of cache invalidations, by cause (membership, refresh, unregister)
    pub static ref CACHE_INVALIDATIONS: IntCounterVec = register_int_counter_vec!(
        "rpc_registry_cache_invalidations",
        "count of connection cache invalidations",
        &["cause"]
    ).unwrap();

    /// Count of children watch firings processed by the resolver
    pub static ref WATCH_FIRINGS: IntCounter = register_int_counter!(
        "rpc_registry_watch_firings",
        "count of children watch firings processed"
    ).unwrap();

    /// Count of registration entries skipped because their payload was malformed
    pub static ref MALFORMED_ENTRIES: IntCounter = register_int_counter!(
        "rpc_registry_malformed_entries",
        "count of registration entries skipped with malformed payloads"
    ).unwrap();

    /// Count of coordination sessions that expired
    pub static ref SESSION_EXPIRATIONS: IntCounter = register_int_counter!(
        "rpc_registry_session_expirations",
        "count of coordination sessions lost to expiry"
    ).unwrap();

    /// Number of services currently watched
    pub static ref WATCHED_SERVICES: IntGauge = register_int_gauge!(
        "rpc_registry_watched_services",
        "number of services with an active membership watch"
    ).unwrap();
}
