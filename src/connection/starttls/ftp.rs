use super::{UpgradeContext, Upgrader};
use crate::connection::session::{numeric_reply_code, numeric_reply_complete, Transport, UpgradeSession};
use crate::error::ConnectionError;
use async_trait::async_trait;

pub(crate) struct FtpUpgrader;

#[async_trait]
impl Upgrader for FtpUpgrader {
    fn name(&self) -> &'static str {
        "ftp"
    }

    async fn upgrade(
        &self,
        session: &mut UpgradeSession<'_, dyn Transport>,
        _ctx: &UpgradeContext<'_>,
    ) -> Result<(), ConnectionError> {
        session.read_until(numeric_reply_complete).await?;
        session.send(b"AUTH TLS\r\n").await?;
        let reply = session.read_until(numeric_reply_complete).await?;
        if numeric_reply_code(&reply) != Some(234) {
            return Err(ConnectionError::StartTls("FTP AUTH TLS not supported".into()));
        }
        Ok(())
    }
}
