use super::{UpgradeContext, Upgrader};
use crate::connection::session::{first_line_complete, has_line_starting_with, Transport, UpgradeSession};
use crate::error::ConnectionError;
use async_trait::async_trait;

pub(crate) struct ImapUpgrader;

#[async_trait]
impl Upgrader for ImapUpgrader {
    fn name(&self) -> &'static str {
        "imap"
    }

    async fn upgrade(
        &self,
        session: &mut UpgradeSession<'_, dyn Transport>,
        _ctx: &UpgradeContext<'_>,
    ) -> Result<(), ConnectionError> {
        let greeting = session.read_until(first_line_complete).await?;
        if !greeting.starts_with(b"* OK") {
            return Err(ConnectionError::StartTls(
                "IMAP server did not send an OK greeting".into(),
            ));
        }

        session.send(b". STARTTLS\r\n").await?;
        let reply = session
            .read_until(|buf| {
                has_line_starting_with(buf, b". OK")
                    || has_line_starting_with(buf, b". NO")
                    || has_line_starting_with(buf, b". BAD")
            })
            .await?;
        if !has_line_starting_with(&reply, b". OK") {
            return Err(ConnectionError::StartTls("IMAP STARTTLS not supported".into()));
        }
        Ok(())
    }
}
