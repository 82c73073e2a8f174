use super::{UpgradeContext, Upgrader};
use crate::connection::session::{Transport, UpgradeSession};
use crate::error::ConnectionError;
use async_trait::async_trait;

/// Length 8, request code 80877103.
const SSL_REQUEST: &[u8] = b"\x00\x00\x00\x08\x04\xd2\x16\x2f";

pub(crate) struct PostgresUpgrader;

#[async_trait]
impl Upgrader for PostgresUpgrader {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn upgrade(
        &self,
        session: &mut UpgradeSession<'_, dyn Transport>,
        _ctx: &UpgradeContext<'_>,
    ) -> Result<(), ConnectionError> {
        session.send(SSL_REQUEST).await?;
        let reply = session.read_exact(1).await?;
        if reply.first() != Some(&b'S') {
            return Err(ConnectionError::StartTls(
                "Postgres server does not support SSL".into(),
            ));
        }
        Ok(())
    }
}
