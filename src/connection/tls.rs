use super::session::{Transport, UpgradeSession};
use super::starttls::{upgrader_for, UpgradeContext};
use super::{tunnel, ConnectionFactory, ConnectionParams, TlsConnection};
use crate::error::ConnectionError;
use crate::model::HttpTunnelSettings;
use async_trait::async_trait;
use openssl::error::ErrorStack;
use openssl::pkey::PKey;
use openssl::ssl::{Ssl, SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tracing::debug;

/// Builds [`OpensslConnection`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpensslConnectionFactory;

impl ConnectionFactory for OpensslConnectionFactory {
    fn create(&self, params: ConnectionParams) -> Box<dyn TlsConnection> {
        Box::new(OpensslConnection::new(params))
    }
}

enum Stage {
    Idle,
    Plain(TcpStream),
    Secure(Box<SslStream<TcpStream>>),
    Closed,
}

pub struct OpensslConnection {
    params: ConnectionParams,
    sni: Option<String>,
    cipher_list: Option<String>,
    xmpp_to: Option<String>,
    tunnel: Option<HttpTunnelSettings>,
    peer_ip: Option<IpAddr>,
    stage: Stage,
}

impl OpensslConnection {
    pub fn new(params: ConnectionParams) -> Self {
        Self {
            params,
            sni: None,
            cipher_list: None,
            xmpp_to: None,
            tunnel: None,
            peer_ip: None,
            stage: Stage::Idle,
        }
    }

    async fn open_transport(&mut self) -> Result<TcpStream, ConnectionError> {
        let settings = &self.params.settings;
        if let Some(tunnel) = self.tunnel.as_ref() {
            return tunnel::open_tunnel(tunnel, &self.params.hostname, self.params.port, settings)
                .await;
        }

        let addr = SocketAddr::new(self.params.ip, self.params.port);
        let stream = match timeout(settings.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(ConnectionError::Timeout),
        };
        self.peer_ip = stream.peer_addr().ok().map(|addr| addr.ip());
        Ok(stream)
    }

    fn build_ssl(&self) -> Result<Ssl, ConnectionError> {
        let tls_setup = |err: ErrorStack| ConnectionError::Handshake(err.to_string());
        let mut builder = SslConnector::builder(SslMethod::tls()).map_err(tls_setup)?;
        // Only the negotiated parameters matter here, never the peer's identity.
        builder.set_verify(SslVerifyMode::NONE);
        if let Some(version) = self.params.version.openssl_version() {
            builder
                .set_min_proto_version(Some(version))
                .map_err(tls_setup)?;
            builder
                .set_max_proto_version(Some(version))
                .map_err(tls_setup)?;
        }
        if let Some(list) = self.cipher_list.as_deref() {
            builder.set_cipher_list(list).map_err(tls_setup)?;
        }
        if let Some(auth) = self.params.client_auth.as_ref() {
            builder
                .set_certificate_chain_file(&auth.certificate_chain)
                .map_err(tls_setup)?;
            match auth.key_password.as_deref() {
                Some(password) => {
                    let pem = std::fs::read(&auth.private_key).map_err(|err| {
                        ConnectionError::Other {
                            category: "ClientAuth".into(),
                            message: format!(
                                "cannot read {}: {err}",
                                auth.private_key.display()
                            ),
                        }
                    })?;
                    let key = PKey::private_key_from_pem_passphrase(&pem, password.as_bytes())
                        .map_err(tls_setup)?;
                    builder.set_private_key(&key).map_err(tls_setup)?;
                }
                None => builder
                    .set_private_key_file(&auth.private_key, SslFiletype::PEM)
                    .map_err(tls_setup)?,
            }
        }

        let connector = builder.build();
        let mut config = connector
            .configure()
            .map_err(tls_setup)?
            .verify_hostname(false);
        config.set_use_server_name_indication(self.sni.is_some());
        let domain = self.sni.as_deref().unwrap_or(&self.params.hostname);
        config.into_ssl(domain).map_err(tls_setup)
    }

    async fn start_tls(&mut self, stream: TcpStream) -> Result<(), ConnectionError> {
        let ssl = self.build_ssl()?;
        let mut tls = SslStream::new(ssl, stream)
            .map_err(|err| ConnectionError::Handshake(err.to_string()))?;

        match timeout(self.params.settings.read_timeout, Pin::new(&mut tls).connect()).await {
            Ok(Ok(())) => {
                self.stage = Stage::Secure(Box::new(tls));
                Ok(())
            }
            Ok(Err(err)) => Err(ConnectionError::Handshake(err.to_string())),
            Err(_) => Err(ConnectionError::Timeout),
        }
    }
}

#[async_trait]
impl TlsConnection for OpensslConnection {
    fn set_server_name_indication(&mut self, name: &str) {
        self.sni = Some(name.to_string());
    }

    fn set_cipher_list(&mut self, spec: &str) {
        self.cipher_list = Some(spec.to_string());
    }

    fn set_xmpp_target_hostname(&mut self, name: &str) {
        self.xmpp_to = Some(name.to_string());
    }

    fn enable_http_connect_tunnel(&mut self, tunnel: &HttpTunnelSettings) {
        self.tunnel = Some(tunnel.clone());
    }

    async fn perform_upgrade(&mut self) -> Result<(), ConnectionError> {
        match self.stage {
            Stage::Idle => {}
            Stage::Plain(_) | Stage::Secure(_) => return Ok(()),
            Stage::Closed => {
                return Err(ConnectionError::Other {
                    category: "ConnectionClosed".into(),
                    message: "connection was already closed".into(),
                })
            }
        }

        let mut stream = self.open_transport().await?;
        if let Some(upgrader) = upgrader_for(self.params.protocol) {
            let ctx = UpgradeContext {
                hostname: &self.params.hostname,
                xmpp_to: self.xmpp_to.as_deref(),
            };
            let transport: &mut dyn Transport = &mut stream;
            let mut session =
                UpgradeSession::new(transport, self.params.settings.read_timeout, upgrader.name());
            upgrader.upgrade(&mut session, &ctx).await?;
        }
        self.stage = Stage::Plain(stream);
        Ok(())
    }

    async fn handshake(&mut self, network_max_retries: u32) -> Result<(), ConnectionError> {
        let mut retries = 0;
        loop {
            match self.perform_upgrade().await {
                Ok(()) => break,
                Err(err) if err.is_transport() && retries < network_max_retries => {
                    retries += 1;
                    debug!(host = %self.params.hostname, retries, error = %err, "retrying connect");
                }
                Err(err) => return Err(err),
            }
        }

        match std::mem::replace(&mut self.stage, Stage::Closed) {
            Stage::Plain(stream) => self.start_tls(stream).await,
            Stage::Secure(tls) => {
                self.stage = Stage::Secure(tls);
                Ok(())
            }
            other => {
                self.stage = other;
                Err(ConnectionError::Other {
                    category: "ConnectionClosed".into(),
                    message: "no transport available for the handshake".into(),
                })
            }
        }
    }

    fn peer_ip(&self) -> Option<IpAddr> {
        self.peer_ip
    }

    fn negotiated_cipher_name(&self) -> Option<String> {
        match &self.stage {
            Stage::Secure(tls) => tls
                .ssl()
                .current_cipher()
                .map(|cipher| cipher.name().to_string()),
            _ => None,
        }
    }

    async fn close(&mut self) {
        if let Stage::Secure(mut tls) = std::mem::replace(&mut self.stage, Stage::Closed) {
            let _ = timeout(self.params.settings.read_timeout, tls.shutdown()).await;
        }
    }
}
