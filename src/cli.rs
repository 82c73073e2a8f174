use anyhow::{anyhow, bail, Context};
use clap::{Parser, ValueEnum};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tls_preflight::model::{
    ClientAuthCredentials, Config, ConnectivitySettings, HttpTunnelSettings, OutputConfig,
    OutputFormat, ProtocolKind, TargetOptions,
};
use url::Url;

#[derive(Debug, Parser)]
#[command(author, version, about = "TLS connectivity pre-flight checker", long_about = None)]
pub struct Cli {
    /// Targets as host[:port]{ip}, IPv6 addresses in brackets
    #[arg(value_name = "TARGET")]
    pub targets: Vec<String>,

    /// File containing targets (one per line)
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    pub input: Option<String>,

    /// Plaintext protocol to upgrade from before the TLS handshake
    #[arg(long = "starttls", value_name = "PROTOCOL", default_value_t = StartTls::Plain)]
    pub starttls: StartTls,

    /// Server name to send in the SNI extension (defaults to the hostname)
    #[arg(long = "sni", value_name = "NAME")]
    pub sni: Option<String>,

    /// Hostname for the 'to' attribute of the XMPP stream
    #[arg(long = "xmpp-to", value_name = "HOST")]
    pub xmpp_to: Option<String>,

    /// Tunnel every connection through an HTTP proxy: http://[user:pass@]host:port
    #[arg(long = "https-tunnel", value_name = "URL")]
    pub https_tunnel: Option<String>,

    /// Client certificate chain (PEM)
    #[arg(long = "cert", value_name = "FILE")]
    pub cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long = "key", value_name = "FILE")]
    pub key: Option<PathBuf>,

    /// Passphrase for the client private key
    #[arg(long = "keypass", value_name = "PASSPHRASE")]
    pub keypass: Option<String>,

    /// Maximum number of targets probed at once (capped at 50)
    #[arg(long = "concurrency", default_value_t = 50)]
    pub concurrency: usize,

    /// Connect timeout in milliseconds
    #[arg(long = "connect-timeout", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Read timeout in milliseconds
    #[arg(long = "read-timeout", default_value_t = 5000)]
    pub read_timeout_ms: u64,

    /// Output format
    #[arg(long = "output", default_value_t = OutputFormat::Pretty)]
    pub output: OutputFormat,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum StartTls {
    Plain,
    Https,
    Smtp,
    Xmpp,
    XmppServer,
    Ftp,
    Pop3,
    Imap,
    Ldap,
    Rdp,
    Postgres,
}

impl StartTls {
    fn protocol(self) -> ProtocolKind {
        match self {
            StartTls::Plain => ProtocolKind::PlainTls,
            StartTls::Https => ProtocolKind::Https,
            StartTls::Smtp => ProtocolKind::StarttlsSmtp,
            StartTls::Xmpp => ProtocolKind::StarttlsXmpp,
            StartTls::XmppServer => ProtocolKind::StarttlsXmppServer,
            StartTls::Ftp => ProtocolKind::StarttlsFtp,
            StartTls::Pop3 => ProtocolKind::StarttlsPop3,
            StartTls::Imap => ProtocolKind::StarttlsImap,
            StartTls::Ldap => ProtocolKind::StarttlsLdap,
            StartTls::Rdp => ProtocolKind::StarttlsRdp,
            StartTls::Postgres => ProtocolKind::StarttlsPostgres,
        }
    }
}

impl fmt::Display for StartTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartTls::Plain => write!(f, "plain"),
            other => write!(f, "{}", other.protocol()),
        }
    }
}

impl Cli {
    pub fn into_config(self) -> anyhow::Result<Config> {
        if self.targets.is_empty() && self.input.is_none() {
            bail!("at least one TARGET or --input is required");
        }

        if self.concurrency == 0 {
            bail!("concurrency must be greater than zero");
        }

        let protocol = self.starttls.protocol();
        if self.xmpp_to.is_some() && !protocol.is_xmpp() {
            bail!("--xmpp-to can only be used with --starttls xmpp or xmpp-server");
        }

        let client_auth = match (self.cert, self.key) {
            (Some(certificate_chain), Some(private_key)) => Some(ClientAuthCredentials {
                certificate_chain,
                private_key,
                key_password: self.keypass,
            }),
            (None, None) => {
                if self.keypass.is_some() {
                    bail!("--keypass requires --cert and --key");
                }
                None
            }
            _ => bail!("--cert and --key must be used together"),
        };

        let http_tunnel = self
            .https_tunnel
            .as_deref()
            .map(parse_tunnel)
            .transpose()?;

        Ok(Config {
            targets: self.targets,
            input: self.input,
            options: TargetOptions {
                protocol,
                sni: self.sni,
                xmpp_to: self.xmpp_to,
                client_auth,
                http_tunnel,
            },
            max_concurrency: self.concurrency,
            settings: ConnectivitySettings {
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                read_timeout: Duration::from_millis(self.read_timeout_ms),
                ..ConnectivitySettings::default()
            },
            output: OutputConfig {
                format: self.output,
            },
        })
    }
}

fn parse_tunnel(raw: &str) -> anyhow::Result<HttpTunnelSettings> {
    let url = Url::parse(raw).with_context(|| format!("invalid --https-tunnel URL {raw}"))?;
    if url.scheme() != "http" {
        bail!("--https-tunnel must be an http:// URL, got {}", url.scheme());
    }
    let hostname = url
        .host_str()
        .ok_or_else(|| anyhow!("--https-tunnel URL has no host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();

    Ok(HttpTunnelSettings {
        hostname,
        port: url.port_or_known_default().unwrap_or(80),
        basic_auth_user: Some(url.username())
            .filter(|user| !user.is_empty())
            .map(str::to_string),
        basic_auth_password: url.password().map(str::to_string),
    })
}
