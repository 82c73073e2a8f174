use crate::connection::ConnectionFactory;
use crate::error::{ErrorKind, ProbeError, HANDSHAKE_ERROR};
use crate::model::{
    CipherStrategy, ConnectivitySettings, NegotiatedCapability, ServerConnectivityInfo, TlsVersion,
};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Handshake attempts in priority order. The first success wins, so this
/// order decides which version is reported when several would work.
pub const NEGOTIATION_ORDER: [(TlsVersion, CipherStrategy); 8] = [
    (TlsVersion::Tls1_0, CipherStrategy::Default),
    (TlsVersion::Tls1_0, CipherStrategy::Exhaustive),
    (TlsVersion::Any, CipherStrategy::Default),
    (TlsVersion::Any, CipherStrategy::Exhaustive),
    (TlsVersion::Ssl3, CipherStrategy::Default),
    (TlsVersion::Ssl3, CipherStrategy::Exhaustive),
    (TlsVersion::Tls1_2, CipherStrategy::Default),
    (TlsVersion::Tls1_2, CipherStrategy::Exhaustive),
];

/// Version used to open the transport and run the plaintext upgrade.
const REACHABILITY_VERSION: TlsVersion = TlsVersion::Any;

/// Checks that a target is reachable, then finds one TLS version and cipher
/// suite it accepts.
#[derive(Clone)]
pub struct ConnectivityProbe {
    factory: Arc<dyn ConnectionFactory>,
    settings: ConnectivitySettings,
}

impl ConnectivityProbe {
    pub fn new(factory: Arc<dyn ConnectionFactory>, settings: ConnectivitySettings) -> Self {
        Self { factory, settings }
    }

    pub fn settings(&self) -> &ConnectivitySettings {
        &self.settings
    }

    /// On success the negotiated version and cipher are recorded on `server`.
    #[instrument(skip_all, fields(server = %server.display_name(), protocol = %server.protocol()))]
    pub async fn probe(
        &self,
        server: &mut ServerConnectivityInfo,
    ) -> Result<NegotiatedCapability, ProbeError> {
        let peer_ip = self.check_reachability(server).await?;
        let negotiated = self.negotiate(server, peer_ip).await?;
        info!(
            version = %negotiated.tls_version,
            cipher = %negotiated.cipher_suite,
            "target reachable"
        );
        server.record_negotiated(negotiated.clone());
        Ok(negotiated)
    }

    /// Opens the transport and runs any upgrade. Every failure here is final.
    async fn check_reachability(
        &self,
        server: &ServerConnectivityInfo,
    ) -> Result<IpAddr, ProbeError> {
        let mut connection = server.connection_for(
            self.factory.as_ref(),
            REACHABILITY_VERSION,
            server.ip_address(),
            &self.settings,
        );
        let outcome = connection.perform_upgrade().await;
        let peer_ip = connection.peer_ip();
        connection.close().await;

        match outcome {
            Ok(()) => Ok(peer_ip.unwrap_or_else(|| server.ip_address())),
            Err(err) => {
                let err = ProbeError::from_connection(server.display_name(), server.hostname(), err);
                info!(kind = %err.kind(), detail = %err.detail(), "target unreachable");
                Err(err)
            }
        }
    }

    async fn negotiate(
        &self,
        server: &ServerConnectivityInfo,
        ip: IpAddr,
    ) -> Result<NegotiatedCapability, ProbeError> {
        for (attempt, (version, strategy)) in NEGOTIATION_ORDER.iter().copied().enumerate() {
            let mut connection =
                server.connection_for(self.factory.as_ref(), version, ip, &self.settings);
            if let Some(list) = strategy.cipher_list() {
                connection.set_cipher_list(list);
            }

            let outcome = connection.handshake(0).await;
            let cipher = match outcome {
                Ok(()) => connection.negotiated_cipher_name(),
                Err(_) => None,
            };
            connection.close().await;

            match outcome {
                Ok(()) => {
                    let cipher_suite = cipher.ok_or_else(|| {
                        ProbeError::new(
                            server.display_name(),
                            ErrorKind::HandshakeNegotiationFailure,
                            HANDSHAKE_ERROR,
                        )
                    })?;
                    return Ok(NegotiatedCapability {
                        tls_version: version,
                        cipher_suite,
                    });
                }
                Err(err) => {
                    debug!(
                        attempt = attempt + 1,
                        version = %version,
                        ciphers = %strategy,
                        error = %err,
                        "handshake attempt failed"
                    );
                }
            }
        }

        info!("no TLS version and cipher list combination succeeded");
        Err(ProbeError::new(
            server.display_name(),
            ErrorKind::HandshakeNegotiationFailure,
            HANDSHAKE_ERROR,
        ))
    }
}
