use crate::engine::{ConnectivityReport, InvalidTarget};
use crate::error::ErrorKind;
use crate::model::{
    NegotiatedCapability, OutputConfig, OutputFormat, ProtocolKind, ServerConnectivityInfo,
    TargetView,
};
use crate::util::now_iso8601;
use serde::Serialize;
use std::io::{BufWriter, Stdout, Write};
use std::net::SocketAddr;

const PRETTY_TITLE: &str = "CHECKING CONNECTIVITY TO SERVER(S)";

/// Renders a [`ConnectivityReport`] as text or JSON lines.
pub struct ReportWriter<W: Write> {
    cfg: OutputConfig,
    writer: BufWriter<W>,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Record<'a> {
    Reachable {
        timestamp: &'a str,
        target: TargetView,
        protocol: ProtocolKind,
        sni: &'a str,
        #[serde(flatten)]
        negotiated: Option<&'a NegotiatedCapability>,
    },
    Invalid {
        timestamp: &'a str,
        target: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        resolved: Option<TargetView>,
        error_kind: ErrorKind,
        error: &'a str,
    },
}

impl ReportWriter<Stdout> {
    pub fn stdout(cfg: OutputConfig) -> Self {
        Self::new(cfg, std::io::stdout())
    }
}

impl<W: Write> ReportWriter<W> {
    pub fn new(cfg: OutputConfig, writer: W) -> Self {
        Self {
            cfg,
            writer: BufWriter::new(writer),
        }
    }

    pub fn write_report(&mut self, report: &ConnectivityReport) -> anyhow::Result<()> {
        match self.cfg.format {
            OutputFormat::Jsonl => self.write_jsonl(report)?,
            OutputFormat::Pretty => self.write_pretty(report)?,
        }
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> anyhow::Result<W> {
        self.writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("failed to flush report: {}", err.error()))
    }

    fn write_jsonl(&mut self, report: &ConnectivityReport) -> anyhow::Result<()> {
        let timestamp = now_iso8601();
        for server in &report.reachable {
            let record = Record::Reachable {
                timestamp: &timestamp,
                target: server.view(),
                protocol: server.protocol(),
                sni: server.sni(),
                negotiated: server.negotiated(),
            };
            writeln!(self.writer, "{}", serde_json::to_string(&record)?)?;
        }
        for invalid in &report.invalid {
            let record = Record::Invalid {
                timestamp: &timestamp,
                target: invalid.error.target(),
                resolved: invalid.server.as_ref().map(ServerConnectivityInfo::view),
                error_kind: invalid.error.kind(),
                error: invalid.error.detail(),
            };
            writeln!(self.writer, "{}", serde_json::to_string(&record)?)?;
        }
        Ok(())
    }

    fn write_pretty(&mut self, report: &ConnectivityReport) -> anyhow::Result<()> {
        writeln!(self.writer)?;
        writeln!(self.writer, " {PRETTY_TITLE}")?;
        writeln!(self.writer, " {}", "-".repeat(PRETTY_TITLE.len()))?;
        writeln!(self.writer)?;
        for server in &report.reachable {
            writeln!(self.writer, "{}", reachable_line(server))?;
        }
        for invalid in &report.invalid {
            writeln!(self.writer, "{}", invalid_line(invalid))?;
        }
        writeln!(self.writer)?;
        Ok(())
    }
}

fn reachable_line(server: &ServerConnectivityInfo) -> String {
    let addr = SocketAddr::new(server.ip_address(), server.port());
    let mut line = format!("   {:<35} => {}", server.display_name(), addr);
    if let Some(negotiated) = server.negotiated() {
        line.push_str(&format!(
            "  {}  {}",
            negotiated.tls_version, negotiated.cipher_suite
        ));
    }
    line
}

fn invalid_line(invalid: &InvalidTarget) -> String {
    format!(
        "   {:<35} => WARNING: {}; discarding corresponding tasks.",
        invalid.error.target(),
        invalid.error.detail()
    )
}
