//! RPC transport seam.
//!
//! The registry never speaks the RPC protocol itself; it only opens
//! connections through a [`Dialer`] and hands them back to callers. The
//! default [`GrpcDialer`] opens tonic channels.

use std::time::Duration;

use async_trait::async_trait;
use config::DialConfig;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::metrics;
use crate::models::Address;

/// Opens connections to RPC servers.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Handle to an open connection. Cloning must share the underlying
    /// connection, not open a new one.
    type Conn: Clone + Send + Sync + 'static;

    async fn dial(&self, address: &Address) -> RegistryResult<Self::Conn>;
}

/// An open connection and the address it was dialed at.
#[derive(Debug, Clone)]
pub struct Connection<C> {
    address: Address,
    channel: C,
}

impl<C> Connection<C> {
    pub fn new(address: Address, channel: C) -> Self {
        Self { address, channel }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }
}

/// Dial `address`, failing with [`RegistryError::Dial`] if it takes longer
/// than `timeout`.
pub async fn dial_with_timeout<D: Dialer + ?Sized>(
    dialer: &D,
    address: &Address,
    timeout: Duration,
) -> RegistryResult<D::Conn> {
    metrics::DIALS.inc();
    let result = match tokio::time::timeout(timeout, dialer.dial(address)).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(err @ RegistryError::Dial { .. })) => Err(err),
        Ok(Err(err)) => Err(RegistryError::Dial {
            address: address.to_string(),
            reason: err.to_string(),
        }),
        Err(_) => Err(RegistryError::Dial {
            address: address.to_string(),
            reason: format!("timed out after {timeout:?}"),
        }),
    };
    if result.is_err() {
        metrics::DIAL_FAILURES.inc();
    }
    result
}

/// Opens gRPC channels with tonic.
#[derive(Debug, Clone, Default)]
pub struct GrpcDialer {
    config: DialConfig,
}

impl GrpcDialer {
    pub fn new(config: DialConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DialConfig {
        &self.config
    }

    /// Endpoint for `address`; the scheme follows the TLS setting.
    pub fn endpoint(&self, address: &Address) -> RegistryResult<Endpoint> {
        let dial_err = |reason: String| RegistryError::Dial {
            address: address.to_string(),
            reason,
        };
        let scheme = if self.config.tls { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{address}"))
            .map_err(|e| dial_err(format!("invalid address: {e}")))?
            .connect_timeout(self.config.timeout);

        if self.config.tls {
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new())
                .map_err(|e| dial_err(format!("TLS config error: {e}")))?;
        }
        if let Some(ka) = &self.config.keep_alive {
            endpoint = endpoint
                .http2_keep_alive_interval(ka.interval)
                .keep_alive_timeout(ka.timeout)
                .keep_alive_while_idle(ka.while_idle);
        }
        Ok(endpoint)
    }
}

#[async_trait]
impl Dialer for GrpcDialer {
    type Conn = Channel;

    async fn dial(&self, address: &Address) -> RegistryResult<Channel> {
        let channel = self
            .endpoint(address)?
            .connect()
            .await
            .map_err(|e| RegistryError::Dial {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        debug!(
            %address,
            tls = self.config.tls,
            keep_alive = self.config.keep_alive.is_some(),
            "gRPC channel connected"
        );
        Ok(channel)
    }
}
