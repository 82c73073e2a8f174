use crate::error::ConnectionError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

const MAX_REPLY_BYTES: usize = 16 * 1024;

/// Byte stream an upgrade runs over.
pub(crate) trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Plaintext exchange with a server ahead of the TLS handshake.
pub(crate) struct UpgradeSession<'a, S: ?Sized> {
    stream: &'a mut S,
    read_timeout: Duration,
    protocol: &'static str,
}

impl<'a, S> UpgradeSession<'a, S>
where
    S: Transport + ?Sized,
{
    pub(crate) fn new(stream: &'a mut S, read_timeout: Duration, protocol: &'static str) -> Self {
        Self {
            stream,
            read_timeout,
            protocol,
        }
    }

    pub(crate) fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub(crate) async fn send(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        match timeout(self.read_timeout, self.stream.write_all(bytes)).await {
            Ok(result) => result.map_err(ConnectionError::from),
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Reads until `done` accepts the accumulated bytes.
    pub(crate) async fn read_until<F>(&mut self, done: F) -> Result<Vec<u8>, ConnectionError>
    where
        F: Fn(&[u8]) -> bool,
    {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 2048];
        loop {
            let n = match timeout(self.read_timeout, self.stream.read(&mut chunk)).await {
                Ok(Ok(n)) => n,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(ConnectionError::Timeout),
            };
            if n == 0 {
                return Err(ConnectionError::StartTls(format!(
                    "{} server closed the connection during the STARTTLS negotiation",
                    self.protocol
                )));
            }
            buf.extend_from_slice(&chunk[..n]);
            if done(&buf) {
                return Ok(buf);
            }
            if buf.len() >= MAX_REPLY_BYTES {
                return Err(ConnectionError::StartTls(format!(
                    "{} server sent an oversized reply during the STARTTLS negotiation",
                    self.protocol
                )));
            }
        }
    }

    pub(crate) async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, ConnectionError> {
        self.read_until(|buf| buf.len() >= len).await
    }

    /// Reads one byte at a time up to and including `terminator`, so bytes
    /// the peer sent after it stay on the stream for the next reader.
    pub(crate) async fn read_through(
        &mut self,
        terminator: &[u8],
    ) -> Result<Vec<u8>, ConnectionError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(terminator) {
            let n = match timeout(self.read_timeout, self.stream.read(&mut byte)).await {
                Ok(Ok(n)) => n,
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Err(ConnectionError::Timeout),
            };
            if n == 0 {
                return Err(ConnectionError::StartTls(format!(
                    "{} server closed the connection",
                    self.protocol
                )));
            }
            buf.push(byte[0]);
            if buf.len() >= MAX_REPLY_BYTES {
                return Err(ConnectionError::StartTls(format!(
                    "{} server sent an oversized reply",
                    self.protocol
                )));
            }
        }
        Ok(buf)
    }
}

/// True once the last complete line is the final line of a numeric reply
/// (`250 ok` rather than `250-more`).
pub(crate) fn numeric_reply_complete(buf: &[u8]) -> bool {
    last_complete_line(buf)
        .map(|line| line.len() >= 4 && line[..3].iter().all(u8::is_ascii_digit) && line[3] == b' ')
        .unwrap_or(false)
}

/// Three-digit status of the final line of a numeric reply.
pub(crate) fn numeric_reply_code(buf: &[u8]) -> Option<u16> {
    let line = last_complete_line(buf)?;
    std::str::from_utf8(line.get(..3)?).ok()?.parse().ok()
}

pub(crate) fn first_line_complete(buf: &[u8]) -> bool {
    buf.contains(&b'\n')
}

/// True once a complete line starting with `prefix` has been received.
pub(crate) fn has_line_starting_with(buf: &[u8], prefix: &[u8]) -> bool {
    complete_lines(buf).any(|line| line.starts_with(prefix))
}

pub(crate) fn contains(buf: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && buf.windows(needle.len()).any(|window| window == needle)
}

fn complete_lines(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    let end = buf.iter().rposition(|b| *b == b'\n').map(|pos| pos + 1).unwrap_or(0);
    buf[..end]
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

fn last_complete_line(buf: &[u8]) -> Option<&[u8]> {
    complete_lines(buf).last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_multiline_reply_end() {
        assert!(!numeric_reply_complete(b"250-mx.example\r\n250-PIPELINING\r\n"));
        assert!(numeric_reply_complete(b"250-mx.example\r\n250 STARTTLS\r\n"));
        assert!(!numeric_reply_complete(b"250 STARTTLS"));
        assert_eq!(numeric_reply_code(b"220-hello\r\n220 ready\r\n"), Some(220));
    }

    #[test]
    fn finds_tagged_lines() {
        let reply = b"* CAPABILITY IMAP4rev1\r\n. OK Begin TLS\r\n";
        assert!(has_line_starting_with(reply, b". OK"));
        assert!(!has_line_starting_with(b". OK partial", b". OK"));
    }

    #[tokio::test]
    async fn reads_until_predicate_and_reports_close() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server.write_all(b"+OK ready\r\n").await.unwrap();
        });
        let mut session = UpgradeSession::new(&mut client, Duration::from_secs(1), "pop3");
        let greeting = session.read_until(first_line_complete).await.unwrap();
        assert_eq!(greeting, b"+OK ready\r\n");

        let err = session.read_until(first_line_complete).await.unwrap_err();
        assert!(matches!(err, ConnectionError::StartTls(_)));
    }

    #[tokio::test]
    async fn read_through_leaves_trailing_bytes_unread() {
        let (mut client, mut server) = tokio::io::duplex(256);
        server
            .write_all(b"HTTP/1.1 200 OK\r\n\r\n220 mx ready\r\n")
            .await
            .unwrap();
        drop(server);

        let mut session = UpgradeSession::new(&mut client, Duration::from_secs(1), "http-proxy");
        let headers = session.read_through(b"\r\n\r\n").await.unwrap();
        assert_eq!(headers, b"HTTP/1.1 200 OK\r\n\r\n");
        let greeting = session.read_until(first_line_complete).await.unwrap();
        assert_eq!(greeting, b"220 mx ready\r\n");
    }
}
