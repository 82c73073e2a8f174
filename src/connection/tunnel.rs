use super::session::UpgradeSession;
use crate::error::ConnectionError;
use crate::model::{ConnectivitySettings, HttpTunnelSettings};
use base64::Engine;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

/// Connects to the proxy and asks it to `CONNECT` to the target. The returned
/// stream is positioned right after the proxy's response headers, so the
/// target's first bytes are still unread.
pub(crate) async fn open_tunnel(
    tunnel: &HttpTunnelSettings,
    target_host: &str,
    target_port: u16,
    settings: &ConnectivitySettings,
) -> Result<TcpStream, ConnectionError> {
    let proxy_addr = lookup_host((tunnel.hostname.as_str(), tunnel.port))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| {
            ConnectionError::Proxy(format!("Could not resolve the proxy {}", tunnel.hostname))
        })?;

    let mut stream = match timeout(settings.connect_timeout, TcpStream::connect(proxy_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            return Err(ConnectionError::Proxy(format!(
                "Could not connect to the proxy {}:{}: {err}",
                tunnel.hostname, tunnel.port
            )))
        }
        Err(_) => {
            return Err(ConnectionError::Proxy(format!(
                "Could not connect to the proxy {}:{}: timed out",
                tunnel.hostname, tunnel.port
            )))
        }
    };

    let request = connect_request(tunnel, target_host, target_port);
    let mut session = UpgradeSession::new(&mut stream, settings.read_timeout, "http-proxy");
    session.send(request.as_bytes()).await?;
    let response = session
        .read_through(b"\r\n\r\n")
        .await
        .map_err(|err| match err {
            ConnectionError::Timeout => ConnectionError::Timeout,
            other => ConnectionError::Proxy(format!(
                "The proxy closed the connection during the CONNECT request: {other}"
            )),
        })?;

    let status_line = response
        .split(|b| *b == b'\n')
        .next()
        .map(|line| String::from_utf8_lossy(line).trim().to_string())
        .unwrap_or_default();
    if !connect_succeeded(&status_line) {
        return Err(ConnectionError::Proxy(format!(
            "The proxy rejected the CONNECT request for {target_host}:{target_port}: {status_line}"
        )));
    }
    Ok(stream)
}

fn connect_request(tunnel: &HttpTunnelSettings, host: &str, port: u16) -> String {
    let authority = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(user) = tunnel.basic_auth_user.as_deref() {
        let password = tunnel.basic_auth_password.as_deref().unwrap_or_default();
        let credentials =
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");
    request
}

fn connect_succeeded(status_line: &str) -> bool {
    let mut parts = status_line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some(version), Some("200")) if version.starts_with("HTTP/1.")
    )
}
