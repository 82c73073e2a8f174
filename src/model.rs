use crate::connection::{ConnectionFactory, ConnectionParams, TlsConnection};
use crate::error::{ErrorKind, ProbeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Cipher string that enables every suite the local TLS library knows about,
/// including the ones excluded from its default list.
pub const EXHAUSTIVE_CIPHER_LIST: &str = "ALL:COMPLEMENTOFALL";

const XMPP_TO_ERROR: &str = "Can only specify xmpp_to for the XMPP StartTLS protocol.";
const NOT_TESTED_ERROR: &str =
    "Cannot return a connection without testing connectivity; run the connectivity probe first";

/// How the TLS session is wrapped: directly on the socket or after an
/// in-band plaintext upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    PlainTls,
    Https,
    StarttlsSmtp,
    StarttlsXmpp,
    StarttlsXmppServer,
    StarttlsFtp,
    StarttlsPop3,
    StarttlsImap,
    StarttlsLdap,
    StarttlsRdp,
    StarttlsPostgres,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 11] = [
        ProtocolKind::PlainTls,
        ProtocolKind::Https,
        ProtocolKind::StarttlsSmtp,
        ProtocolKind::StarttlsXmpp,
        ProtocolKind::StarttlsXmppServer,
        ProtocolKind::StarttlsFtp,
        ProtocolKind::StarttlsPop3,
        ProtocolKind::StarttlsImap,
        ProtocolKind::StarttlsLdap,
        ProtocolKind::StarttlsRdp,
        ProtocolKind::StarttlsPostgres,
    ];

    pub fn default_port(self) -> u16 {
        match self {
            ProtocolKind::PlainTls | ProtocolKind::Https => 443,
            ProtocolKind::StarttlsSmtp => 25,
            ProtocolKind::StarttlsXmpp => 5222,
            ProtocolKind::StarttlsXmppServer => 5269,
            ProtocolKind::StarttlsFtp => 21,
            ProtocolKind::StarttlsPop3 => 110,
            ProtocolKind::StarttlsImap => 143,
            ProtocolKind::StarttlsLdap => 389,
            ProtocolKind::StarttlsRdp => 3389,
            ProtocolKind::StarttlsPostgres => 5432,
        }
    }

    pub fn is_xmpp(self) -> bool {
        matches!(
            self,
            ProtocolKind::StarttlsXmpp | ProtocolKind::StarttlsXmppServer
        )
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProtocolKind::PlainTls => "tls",
            ProtocolKind::Https => "https",
            ProtocolKind::StarttlsSmtp => "smtp",
            ProtocolKind::StarttlsXmpp => "xmpp",
            ProtocolKind::StarttlsXmppServer => "xmpp-server",
            ProtocolKind::StarttlsFtp => "ftp",
            ProtocolKind::StarttlsPop3 => "pop3",
            ProtocolKind::StarttlsImap => "imap",
            ProtocolKind::StarttlsLdap => "ldap",
            ProtocolKind::StarttlsRdp => "rdp",
            ProtocolKind::StarttlsPostgres => "postgres",
        };
        write!(f, "{}", label)
    }
}

/// Protocol version requested from the TLS library for one handshake.
///
/// `Any` leaves the version range open and lets the library negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "SSLv3")]
    Ssl3,
    #[serde(rename = "TLSv1.0")]
    Tls1_0,
    #[serde(rename = "TLSv1.2")]
    Tls1_2,
    #[serde(rename = "any")]
    Any,
}

impl TlsVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Ssl3 => "SSLv3",
            TlsVersion::Tls1_0 => "TLSv1.0",
            TlsVersion::Tls1_2 => "TLSv1.2",
            TlsVersion::Any => "any",
        }
    }

    /// Version to pin both protocol bounds to, `None` for an open range.
    pub fn openssl_version(&self) -> Option<openssl::ssl::SslVersion> {
        use openssl::ssl::SslVersion;
        match self {
            TlsVersion::Ssl3 => Some(SslVersion::SSL3),
            TlsVersion::Tls1_0 => Some(SslVersion::TLS1),
            TlsVersion::Tls1_2 => Some(SslVersion::TLS1_2),
            TlsVersion::Any => None,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherStrategy {
    /// The library's default cipher list.
    Default,
    /// Every cipher, see [`EXHAUSTIVE_CIPHER_LIST`].
    Exhaustive,
}

impl CipherStrategy {
    pub fn cipher_list(&self) -> Option<&'static str> {
        match self {
            CipherStrategy::Default => None,
            CipherStrategy::Exhaustive => Some(EXHAUSTIVE_CIPHER_LIST),
        }
    }
}

impl fmt::Display for CipherStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherStrategy::Default => write!(f, "default"),
            CipherStrategy::Exhaustive => write!(f, "exhaustive"),
        }
    }
}

/// A target string split into its parts, see [`crate::input::parse_target`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub host: String,
    pub forced_ip: Option<String>,
    pub port: Option<u16>,
}

#[derive(Clone)]
pub struct ClientAuthCredentials {
    pub certificate_chain: PathBuf,
    pub private_key: PathBuf,
    pub key_password: Option<String>,
}

impl fmt::Debug for ClientAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientAuthCredentials")
            .field("certificate_chain", &self.certificate_chain)
            .field("private_key", &self.private_key)
            .field("key_password", &self.key_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone)]
pub struct HttpTunnelSettings {
    pub hostname: String,
    pub port: u16,
    pub basic_auth_user: Option<String>,
    pub basic_auth_password: Option<String>,
}

impl fmt::Debug for HttpTunnelSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTunnelSettings")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("basic_auth_user", &self.basic_auth_user)
            .field(
                "basic_auth_password",
                &self.basic_auth_password.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Everything about a target that does not come from the target string.
#[derive(Debug, Clone)]
pub struct TargetOptions {
    pub protocol: ProtocolKind,
    pub sni: Option<String>,
    pub xmpp_to: Option<String>,
    pub client_auth: Option<ClientAuthCredentials>,
    pub http_tunnel: Option<HttpTunnelSettings>,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            protocol: ProtocolKind::PlainTls,
            sni: None,
            xmpp_to: None,
            client_auth: None,
            http_tunnel: None,
        }
    }
}

/// Timeouts and retry budget handed by value to every probe and connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivitySettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Transport retries for consumers of a validated target. The
    /// connectivity probe itself never retries.
    pub network_max_retries: u32,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            network_max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiatedCapability {
    pub tls_version: TlsVersion,
    pub cipher_suite: String,
}

/// One target under test. Built with validation, then filled in exactly once
/// by a successful connectivity probe.
#[derive(Debug, Clone)]
pub struct ServerConnectivityInfo {
    hostname: String,
    ip_address: IpAddr,
    port: u16,
    protocol: ProtocolKind,
    sni: String,
    xmpp_to: Option<String>,
    client_auth: Option<ClientAuthCredentials>,
    http_tunnel: Option<HttpTunnelSettings>,
    negotiated: Option<NegotiatedCapability>,
}

impl ServerConnectivityInfo {
    /// Validates the options and resolves `hostname` when no IP is given.
    /// The lookup blocks.
    pub fn new(
        hostname: impl Into<String>,
        port: Option<u16>,
        ip_address: Option<IpAddr>,
        options: TargetOptions,
    ) -> Result<Self, ProbeError> {
        let hostname = hostname.into();
        let port = port.unwrap_or_else(|| options.protocol.default_port());
        let identity = display_name(&hostname, port);

        if options.xmpp_to.is_some() && !options.protocol.is_xmpp() {
            return Err(ProbeError::new(
                identity,
                ErrorKind::InvalidConfiguration,
                XMPP_TO_ERROR,
            ));
        }

        let ip_address = match ip_address {
            Some(ip) => ip,
            None => resolve_hostname(&hostname).ok_or_else(|| {
                ProbeError::new(
                    identity.clone(),
                    ErrorKind::NameResolutionFailure,
                    format!("Could not resolve {hostname}"),
                )
            })?,
        };

        let sni = options
            .sni
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| hostname.clone());

        Ok(Self {
            hostname,
            ip_address,
            port,
            protocol: options.protocol,
            sni,
            xmpp_to: options.xmpp_to,
            client_auth: options.client_auth,
            http_tunnel: options.http_tunnel,
            negotiated: None,
        })
    }

    /// Parses a `host[:port]{ip}` string and builds the target from it.
    pub fn from_command_line(raw: &str, options: TargetOptions) -> Result<Self, ProbeError> {
        let spec = crate::input::parse_target(raw, None)?;
        let ip_address = match spec.forced_ip.as_deref() {
            Some(ip) => Some(ip.parse::<IpAddr>().map_err(|_| {
                ProbeError::new(
                    raw,
                    ErrorKind::MalformedTarget,
                    format!("Not a valid IP address: {ip}"),
                )
            })?),
            None => None,
        };
        Self::new(spec.host, spec.port, ip_address, options).map_err(|err| err.with_target(raw))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn ip_address(&self) -> IpAddr {
        self.ip_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn sni(&self) -> &str {
        &self.sni
    }

    pub fn xmpp_to(&self) -> Option<&str> {
        self.xmpp_to.as_deref()
    }

    pub fn client_auth(&self) -> Option<&ClientAuthCredentials> {
        self.client_auth.as_ref()
    }

    pub fn http_tunnel(&self) -> Option<&HttpTunnelSettings> {
        self.http_tunnel.as_ref()
    }

    /// Version and cipher found by the probe, `None` until it succeeds.
    pub fn negotiated(&self) -> Option<&NegotiatedCapability> {
        self.negotiated.as_ref()
    }

    pub fn display_name(&self) -> String {
        display_name(&self.hostname, self.port)
    }

    pub fn view(&self) -> TargetView {
        TargetView {
            host: self.hostname.clone(),
            addr: self.ip_address.to_string(),
            port: self.port,
        }
    }

    pub(crate) fn record_negotiated(&mut self, negotiated: NegotiatedCapability) {
        self.negotiated = Some(negotiated);
    }

    /// Connection configured for this target. Without an explicit version the
    /// negotiated one is used, which requires a successful probe.
    pub fn preconfigured_connection(
        &self,
        factory: &dyn ConnectionFactory,
        version: Option<TlsVersion>,
        settings: &ConnectivitySettings,
    ) -> Result<Box<dyn TlsConnection>, ProbeError> {
        let version = match (version, self.negotiated.as_ref()) {
            (Some(version), _) => version,
            (None, Some(negotiated)) => negotiated.tls_version,
            (None, None) => {
                return Err(ProbeError::new(
                    self.display_name(),
                    ErrorKind::InvalidConfiguration,
                    NOT_TESTED_ERROR,
                ))
            }
        };
        Ok(self.connection_for(factory, version, self.ip_address, settings))
    }

    pub(crate) fn connection_for(
        &self,
        factory: &dyn ConnectionFactory,
        version: TlsVersion,
        ip: IpAddr,
        settings: &ConnectivitySettings,
    ) -> Box<dyn TlsConnection> {
        let mut connection = factory.create(ConnectionParams {
            hostname: self.hostname.clone(),
            ip,
            port: self.port,
            version,
            protocol: self.protocol,
            client_auth: self.client_auth.clone(),
            settings: settings.clone(),
        });

        if self.protocol.is_xmpp() {
            if let Some(to) = self.xmpp_to.as_deref() {
                connection.set_xmpp_target_hostname(to);
            }
        }
        if let Some(tunnel) = self.http_tunnel.as_ref() {
            connection.enable_http_connect_tunnel(tunnel);
        }
        connection.set_server_name_indication(&self.sni);
        connection
    }
}

fn display_name(hostname: &str, port: u16) -> String {
    if hostname.contains(':') {
        format!("[{hostname}]:{port}")
    } else {
        format!("{hostname}:{port}")
    }
}

fn resolve_hostname(hostname: &str) -> Option<IpAddr> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Some(ip);
    }
    let addrs = dns_lookup::lookup_host(hostname).ok()?;
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetView {
    pub host: String,
    pub addr: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub targets: Vec<String>,
    pub input: Option<String>,
    pub options: TargetOptions,
    pub max_concurrency: usize,
    pub settings: ConnectivitySettings,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jsonl,
    Pretty,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Jsonl => write!(f, "jsonl"),
            OutputFormat::Pretty => write!(f, "pretty"),
        }
    }
}
