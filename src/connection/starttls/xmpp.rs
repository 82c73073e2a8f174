use super::{UpgradeContext, Upgrader};
use crate::connection::session::{contains, Transport, UpgradeSession};
use crate::error::ConnectionError;
use async_trait::async_trait;

const STARTTLS_REQUEST: &[u8] = b"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>";

pub(crate) struct XmppUpgrader {
    name: &'static str,
    namespace: &'static str,
}

impl XmppUpgrader {
    pub(crate) const CLIENT: XmppUpgrader = XmppUpgrader {
        name: "xmpp",
        namespace: "jabber:client",
    };
    pub(crate) const SERVER: XmppUpgrader = XmppUpgrader {
        name: "xmpp-server",
        namespace: "jabber:server",
    };

    fn stream_header(&self, to: &str) -> String {
        format!(
            "<stream:stream xmlns='{}' xmlns:stream='http://etherx.jabber.org/streams' \
             xmlns:tls='http://www.ietf.org/rfc/rfc2595.txt' to='{}' xml:lang='en' version='1.0'>",
            self.namespace, to
        )
    }
}

#[async_trait]
impl Upgrader for XmppUpgrader {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn upgrade(
        &self,
        session: &mut UpgradeSession<'_, dyn Transport>,
        ctx: &UpgradeContext<'_>,
    ) -> Result<(), ConnectionError> {
        let to = ctx.xmpp_to.unwrap_or(ctx.hostname);
        session.send(self.stream_header(to).as_bytes()).await?;

        let features = session
            .read_until(|buf| contains(buf, b"</stream:features>") || contains(buf, b"<stream:error"))
            .await?;
        if contains(&features, b"<stream:error") {
            return Err(ConnectionError::StartTls(format!(
                "XMPP server rejected the stream for {to}"
            )));
        }
        if !contains(&features, b"starttls") {
            return Err(ConnectionError::StartTls("XMPP STARTTLS not supported".into()));
        }

        session.send(STARTTLS_REQUEST).await?;
        let reply = session
            .read_until(|buf| contains(buf, b"<proceed") || contains(buf, b"<failure"))
            .await?;
        if !contains(&reply, b"<proceed") {
            return Err(ConnectionError::StartTls(format!(
                "Error opening {} STARTTLS: the server refused to proceed",
                session.protocol()
            )));
        }
        Ok(())
    }
}
