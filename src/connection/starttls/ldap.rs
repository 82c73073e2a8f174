use super::{UpgradeContext, Upgrader};
use crate::connection::session::{contains, Transport, UpgradeSession};
use crate::error::ConnectionError;
use async_trait::async_trait;

/// ExtendedRequest for the StartTLS OID 1.3.6.1.4.1.1466.20037, message id 1.
const START_TLS_REQUEST: &[u8] = b"\x30\x1d\x02\x01\x01\x77\x18\x80\x161.3.6.1.4.1.1466.20037";

/// ENUMERATED resultCode success(0).
const RESULT_SUCCESS: &[u8] = b"\x0a\x01\x00";

pub(crate) struct LdapUpgrader;

#[async_trait]
impl Upgrader for LdapUpgrader {
    fn name(&self) -> &'static str {
        "ldap"
    }

    async fn upgrade(
        &self,
        session: &mut UpgradeSession<'_, dyn Transport>,
        _ctx: &UpgradeContext<'_>,
    ) -> Result<(), ConnectionError> {
        session.send(START_TLS_REQUEST).await?;
        let reply = session.read_until(extended_response_complete).await?;
        if ber_frame(&reply) == BerFrame::Malformed {
            return Err(ConnectionError::StartTls(
                "LDAP server sent a malformed response".into(),
            ));
        }
        if !contains(&reply, RESULT_SUCCESS) {
            return Err(ConnectionError::StartTls("LDAP StartTLS was rejected".into()));
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum BerFrame {
    Incomplete,
    Complete,
    Malformed,
}

/// Whether a whole BER SEQUENCE with a short or long-form length has
/// arrived. Indefinite and unrepresentable lengths are malformed.
fn ber_frame(buf: &[u8]) -> BerFrame {
    if buf.len() < 2 {
        return BerFrame::Incomplete;
    }
    let first = buf[1] as usize;
    let (header, body) = if first & 0x80 == 0 {
        (2, first)
    } else {
        let octets = first & 0x7f;
        if octets == 0 || octets > std::mem::size_of::<usize>() {
            return BerFrame::Malformed;
        }
        if buf.len() < 2 + octets {
            return BerFrame::Incomplete;
        }
        let len = buf[2..2 + octets]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (2 + octets, len)
    };
    match header.checked_add(body) {
        Some(total) if buf.len() >= total => BerFrame::Complete,
        Some(_) => BerFrame::Incomplete,
        None => BerFrame::Malformed,
    }
}

fn extended_response_complete(buf: &[u8]) -> bool {
    ber_frame(buf) != BerFrame::Incomplete
}
