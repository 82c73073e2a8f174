use super::{UpgradeContext, Upgrader};
use crate::connection::session::{numeric_reply_code, numeric_reply_complete, Transport, UpgradeSession};
use crate::error::ConnectionError;
use async_trait::async_trait;

pub(crate) struct SmtpUpgrader;

#[async_trait]
impl Upgrader for SmtpUpgrader {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn upgrade(
        &self,
        session: &mut UpgradeSession<'_, dyn Transport>,
        _ctx: &UpgradeContext<'_>,
    ) -> Result<(), ConnectionError> {
        let greeting = session.read_until(numeric_reply_complete).await?;
        if numeric_reply_code(&greeting) != Some(220) {
            return Err(ConnectionError::StartTls(
                "SMTP server did not send a 220 greeting".into(),
            ));
        }

        session.send(b"EHLO tls-preflight\r\n").await?;
        let ehlo = session.read_until(numeric_reply_complete).await?;
        if numeric_reply_code(&ehlo) != Some(250) {
            return Err(ConnectionError::StartTls("SMTP EHLO was rejected".into()));
        }

        session.send(b"STARTTLS\r\n").await?;
        let reply = session.read_until(numeric_reply_complete).await?;
        if numeric_reply_code(&reply) != Some(220) {
            return Err(ConnectionError::StartTls(
                "SMTP STARTTLS not supported".into(),
            ));
        }
        Ok(())
    }
}
