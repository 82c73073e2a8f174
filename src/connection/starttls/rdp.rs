use super::{UpgradeContext, Upgrader};
use crate::connection::session::{Transport, UpgradeSession};
use crate::error::ConnectionError;
use async_trait::async_trait;

/// X.224 Connection Request carrying an RDP negotiation request for TLS.
const CONNECTION_REQUEST: &[u8] =
    b"\x03\x00\x00\x13\x0e\xe0\x00\x00\x00\x00\x00\x01\x00\x08\x00\x03\x00\x00\x00";

const NEGOTIATION_RESPONSE: u8 = 0x02;
const RESPONSE_LEN: usize = 19;

pub(crate) struct RdpUpgrader;

#[async_trait]
impl Upgrader for RdpUpgrader {
    fn name(&self) -> &'static str {
        "rdp"
    }

    async fn upgrade(
        &self,
        session: &mut UpgradeSession<'_, dyn Transport>,
        _ctx: &UpgradeContext<'_>,
    ) -> Result<(), ConnectionError> {
        session.send(CONNECTION_REQUEST).await?;
        let reply = session.read_exact(RESPONSE_LEN).await?;
        if !accepts_tls(&reply) {
            return Err(ConnectionError::StartTls(
                "RDP server does not support TLS".into(),
            ));
        }
        Ok(())
    }
}

fn accepts_tls(reply: &[u8]) -> bool {
    reply.len() >= RESPONSE_LEN && reply[..2] == [0x03, 0x00] && reply[11] == NEGOTIATION_RESPONSE
}
