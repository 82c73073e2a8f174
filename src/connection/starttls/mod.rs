mod ftp;
mod imap;
mod ldap;
mod pop3;
mod postgres;
mod rdp;
mod smtp;
mod xmpp;

use super::session::{Transport, UpgradeSession};
use crate::error::ConnectionError;
use crate::model::ProtocolKind;
use async_trait::async_trait;

pub(crate) struct UpgradeContext<'a> {
    pub hostname: &'a str,
    pub xmpp_to: Option<&'a str>,
}

/// Plaintext negotiation that hands the socket over to TLS.
#[async_trait]
pub(crate) trait Upgrader: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upgrade(
        &self,
        session: &mut UpgradeSession<'_, dyn Transport>,
        ctx: &UpgradeContext<'_>,
    ) -> Result<(), ConnectionError>;
}

static SMTP_UPGRADER: smtp::SmtpUpgrader = smtp::SmtpUpgrader;
static XMPP_UPGRADER: xmpp::XmppUpgrader = xmpp::XmppUpgrader::CLIENT;
static XMPP_SERVER_UPGRADER: xmpp::XmppUpgrader = xmpp::XmppUpgrader::SERVER;
static FTP_UPGRADER: ftp::FtpUpgrader = ftp::FtpUpgrader;
static POP3_UPGRADER: pop3::Pop3Upgrader = pop3::Pop3Upgrader;
static IMAP_UPGRADER: imap::ImapUpgrader = imap::ImapUpgrader;
static LDAP_UPGRADER: ldap::LdapUpgrader = ldap::LdapUpgrader;
static RDP_UPGRADER: rdp::RdpUpgrader = rdp::RdpUpgrader;
static POSTGRES_UPGRADER: postgres::PostgresUpgrader = postgres::PostgresUpgrader;

/// `None` for protocols where TLS starts on the first byte.
pub(crate) fn upgrader_for(protocol: ProtocolKind) -> Option<&'static dyn Upgrader> {
    match protocol {
        ProtocolKind::PlainTls | ProtocolKind::Https => None,
        ProtocolKind::StarttlsSmtp => Some(&SMTP_UPGRADER),
        ProtocolKind::StarttlsXmpp => Some(&XMPP_UPGRADER),
        ProtocolKind::StarttlsXmppServer => Some(&XMPP_SERVER_UPGRADER),
        ProtocolKind::StarttlsFtp => Some(&FTP_UPGRADER),
        ProtocolKind::StarttlsPop3 => Some(&POP3_UPGRADER),
        ProtocolKind::StarttlsImap => Some(&IMAP_UPGRADER),
        ProtocolKind::StarttlsLdap => Some(&LDAP_UPGRADER),
        ProtocolKind::StarttlsRdp => Some(&RDP_UPGRADER),
        ProtocolKind::StarttlsPostgres => Some(&POSTGRES_UPGRADER),
    }
}
