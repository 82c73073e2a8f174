//! The connection contract the connectivity probe drives, plus the default
//! implementation on top of tokio and OpenSSL.

mod session;
pub(crate) mod starttls;
mod tls;
mod tunnel;

pub use tls::{OpensslConnection, OpensslConnectionFactory};

use crate::error::ConnectionError;
use crate::model::{
    ClientAuthCredentials, ConnectivitySettings, HttpTunnelSettings, ProtocolKind, TlsVersion,
};
use async_trait::async_trait;
use std::net::IpAddr;

/// Everything a factory needs to open one connection.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub hostname: String,
    pub ip: IpAddr,
    pub port: u16,
    pub version: TlsVersion,
    pub protocol: ProtocolKind,
    pub client_auth: Option<ClientAuthCredentials>,
    pub settings: ConnectivitySettings,
}

/// A single TLS connection attempt. Setters are applied before the first
/// network call; `close` may be called any number of times.
#[async_trait]
pub trait TlsConnection: Send {
    fn set_server_name_indication(&mut self, name: &str);
    fn set_cipher_list(&mut self, spec: &str);
    fn set_xmpp_target_hostname(&mut self, name: &str);
    fn enable_http_connect_tunnel(&mut self, tunnel: &HttpTunnelSettings);

    /// Opens the transport and runs the plaintext-to-TLS upgrade, if the
    /// protocol has one. No TLS record is sent.
    async fn perform_upgrade(&mut self) -> Result<(), ConnectionError>;

    /// Upgrades if needed, then completes a TLS handshake. Only the transport
    /// connect is retried, at most `network_max_retries` times.
    async fn handshake(&mut self, network_max_retries: u32) -> Result<(), ConnectionError>;

    /// Address of the peer the transport is connected to.
    fn peer_ip(&self) -> Option<IpAddr>;

    fn negotiated_cipher_name(&self) -> Option<String>;

    async fn close(&mut self);
}

pub trait ConnectionFactory: Send + Sync {
    fn create(&self, params: ConnectionParams) -> Box<dyn TlsConnection>;
}
