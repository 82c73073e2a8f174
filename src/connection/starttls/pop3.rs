use super::{UpgradeContext, Upgrader};
use crate::connection::session::{first_line_complete, Transport, UpgradeSession};
use crate::error::ConnectionError;
use async_trait::async_trait;

pub(crate) struct Pop3Upgrader;

#[async_trait]
impl Upgrader for Pop3Upgrader {
    fn name(&self) -> &'static str {
        "pop3"
    }

    async fn upgrade(
        &self,
        session: &mut UpgradeSession<'_, dyn Transport>,
        _ctx: &UpgradeContext<'_>,
    ) -> Result<(), ConnectionError> {
        let greeting = session.read_until(first_line_complete).await?;
        if !greeting.starts_with(b"+OK") {
            return Err(ConnectionError::StartTls(
                "POP3 server did not send a +OK greeting".into(),
            ));
        }

        session.send(b"STLS\r\n").await?;
        let reply = session.read_until(first_line_complete).await?;
        if !reply.starts_with(b"+OK") {
            return Err(ConnectionError::StartTls("POP3 STLS not supported".into()));
        }
        Ok(())
    }
}
