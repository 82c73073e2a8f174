use crate::error::{ErrorKind, ProbeError};
use crate::model::TargetSpec;
use anyhow::Context;
use std::sync::OnceLock;
use tokio::io::{AsyncBufReadExt, BufReader};

const BAD_PORT_ERROR: &str = "Not a valid host:port";
const NO_IPV6_ERROR: &str = "IPv6 is not supported on this platform";

/// Splits `host[:port]{forced-ip}` into its parts. Either side may use
/// `[ipv6]` notation; a port only ever comes from the host side, falling back
/// to `default_port`.
pub fn parse_target(raw: &str, default_port: Option<u16>) -> Result<TargetSpec, ProbeError> {
    parse_target_with(raw, default_port, ipv6_available())
}

pub fn parse_target_with(
    raw: &str,
    default_port: Option<u16>,
    ipv6_supported: bool,
) -> Result<TargetSpec, ProbeError> {
    let (host_part, forced_ip) = match raw.split_once('{') {
        Some((host, rest)) if rest.contains('}') => (host, Some(rest.replace('}', ""))),
        _ => (raw, None),
    };

    let forced_ip = match forced_ip {
        Some(ip) if ip.contains('[') => Some(parse_ipv6(raw, &ip, ipv6_supported)?.0),
        other => other,
    }
    .filter(|ip| !ip.trim().is_empty());

    if host_part.contains('[') {
        let (host, port) = parse_ipv6(raw, host_part, ipv6_supported)?;
        return Ok(TargetSpec {
            host,
            forced_ip,
            port: port.or(default_port),
        });
    }

    let (host, port) = match host_part.split_once(':') {
        Some((host, rest)) => {
            let port_str = rest.split(':').next().unwrap_or(rest);
            (host, Some(parse_port(raw, port_str)?))
        }
        None => (host_part, None),
    };

    Ok(TargetSpec {
        host: host.to_string(),
        forced_ip,
        port: port.or(default_port),
    })
}

fn parse_ipv6(
    raw: &str,
    part: &str,
    ipv6_supported: bool,
) -> Result<(String, Option<u16>), ProbeError> {
    if !ipv6_supported {
        return Err(ProbeError::new(raw, ErrorKind::Ipv6Unsupported, NO_IPV6_ERROR));
    }

    let (inside, after) = part
        .split_once(']')
        .ok_or_else(|| ProbeError::new(raw, ErrorKind::MalformedTarget, BAD_PORT_ERROR))?;
    let addr = inside
        .split_once('[')
        .map(|(_, addr)| addr)
        .unwrap_or(inside);

    let port = match after.split_once(':') {
        Some((_, rest)) => {
            let port_str = rest.split(':').next().unwrap_or(rest);
            Some(parse_port(raw, port_str)?)
        }
        None => None,
    };
    Ok((addr.to_string(), port))
}

fn parse_port(raw: &str, port: &str) -> Result<u16, ProbeError> {
    port.trim()
        .parse::<u16>()
        .map_err(|_| ProbeError::new(raw, ErrorKind::MalformedTarget, BAD_PORT_ERROR))
}

/// Whether an IPv6 socket can be opened on this host.
pub fn ipv6_available() -> bool {
    static IPV6: OnceLock<bool> = OnceLock::new();
    *IPV6.get_or_init(|| std::net::UdpSocket::bind("[::1]:0").is_ok())
}

/// Reads target strings from a file, one per line. Blank lines and `#`
/// comments are skipped.
pub async fn load_targets(path: &str) -> anyhow::Result<Vec<String>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open input {}", path))?;
    let mut reader = BufReader::new(file).lines();
    let mut targets = Vec::new();
    while let Some(line) = reader.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.contains(char::is_whitespace) {
            tracing::warn!(line = %trimmed, "skipping invalid target");
            continue;
        }
        targets.push(trimmed.to_string());
    }
    Ok(targets)
}
