use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tls_preflight::connection::{ConnectionFactory, ConnectionParams, TlsConnection};
use tls_preflight::engine::probe::{ConnectivityProbe, NEGOTIATION_ORDER};
use tls_preflight::engine::ConnectivityTester;
use tls_preflight::error::{ConnectionError, ErrorKind, HANDSHAKE_ERROR, TIMEOUT_ERROR};
use tls_preflight::model::{
    CipherStrategy, ConnectivitySettings, HttpTunnelSettings, ProtocolKind,
    ServerConnectivityInfo, TargetOptions, TlsVersion, EXHAUSTIVE_CIPHER_LIST,
};

#[derive(Clone, Copy, Debug)]
enum Reach {
    Ok,
    Timeout,
    Refused,
    UpgradeRefused,
    ProxyDown,
    ProxyUnresolved,
    Unresolved,
    Broken,
}

impl Reach {
    fn error(self) -> Option<ConnectionError> {
        match self {
            Reach::Ok => None,
            Reach::Timeout => Some(ConnectionError::Timeout),
            Reach::Refused => Some(
                std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into(),
            ),
            Reach::UpgradeRefused => Some(ConnectionError::StartTls(
                "SMTP STARTTLS not supported".into(),
            )),
            Reach::ProxyDown => Some(ConnectionError::Proxy("proxy said 502".into())),
            Reach::ProxyUnresolved => Some(ConnectionError::Proxy(
                "Could not resolve the proxy proxy.test".into(),
            )),
            Reach::Unresolved => Some(ConnectionError::NameResolution("down.test".into())),
            Reach::Broken => Some(ConnectionError::Other {
                category: "InvalidState".into(),
                message: "socket in a bad state".into(),
            }),
        }
    }
}

#[derive(Clone, Copy)]
struct Script {
    reach: Reach,
    /// 1-based handshake attempt that succeeds.
    succeed_on: Option<usize>,
    cipher: Option<&'static str>,
    peer_ip: Option<IpAddr>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            reach: Reach::Ok,
            succeed_on: Some(1),
            cipher: Some("ECDHE-RSA-AES256-GCM-SHA384"),
            peer_ip: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Attempt {
    ip: IpAddr,
    version: TlsVersion,
    strategy: CipherStrategy,
    retries: u32,
    sni: Option<String>,
}

#[derive(Default)]
struct Log {
    attempts: Mutex<HashMap<String, Vec<Attempt>>>,
    upgrade_ips: Mutex<Vec<IpAddr>>,
    versions: Mutex<Vec<TlsVersion>>,
    xmpp_to: Mutex<Vec<String>>,
    tunnels: AtomicUsize,
    created: AtomicUsize,
    closed: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Log {
    fn attempts_for(&self, host: &str) -> Vec<Attempt> {
        self.attempts
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct FakeFactory {
    scripts: HashMap<String, Script>,
    fallback: Script,
    delay: Option<Duration>,
    log: Arc<Log>,
}

impl FakeFactory {
    fn with(host: &str, script: Script) -> Self {
        let mut factory = Self::default();
        factory.scripts.insert(host.to_string(), script);
        factory
    }
}

impl ConnectionFactory for FakeFactory {
    fn create(&self, params: ConnectionParams) -> Box<dyn TlsConnection> {
        self.log.created.fetch_add(1, Ordering::SeqCst);
        let now = self.log.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.peak.fetch_max(now, Ordering::SeqCst);
        self.log.versions.lock().unwrap().push(params.version);
        let script = self
            .scripts
            .get(&params.hostname)
            .copied()
            .unwrap_or(self.fallback);
        Box::new(FakeConnection {
            params,
            script,
            delay: self.delay,
            log: self.log.clone(),
            cipher_list: None,
            sni: None,
            handshaken: false,
            closed: false,
        })
    }
}

struct FakeConnection {
    params: ConnectionParams,
    script: Script,
    delay: Option<Duration>,
    log: Arc<Log>,
    cipher_list: Option<String>,
    sni: Option<String>,
    handshaken: bool,
    closed: bool,
}

#[async_trait]
impl TlsConnection for FakeConnection {
    fn set_server_name_indication(&mut self, name: &str) {
        self.sni = Some(name.to_string());
    }

    fn set_cipher_list(&mut self, spec: &str) {
        self.cipher_list = Some(spec.to_string());
    }

    fn set_xmpp_target_hostname(&mut self, name: &str) {
        self.log.xmpp_to.lock().unwrap().push(name.to_string());
    }

    fn enable_http_connect_tunnel(&mut self, _tunnel: &HttpTunnelSettings) {
        self.log.tunnels.fetch_add(1, Ordering::SeqCst);
    }

    async fn perform_upgrade(&mut self) -> Result<(), ConnectionError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.log.upgrade_ips.lock().unwrap().push(self.params.ip);
        match self.script.reach.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn handshake(&mut self, network_max_retries: u32) -> Result<(), ConnectionError> {
        let strategy = match self.cipher_list.as_deref() {
            Some(EXHAUSTIVE_CIPHER_LIST) => CipherStrategy::Exhaustive,
            _ => CipherStrategy::Default,
        };
        let attempt_number = {
            let mut attempts = self.log.attempts.lock().unwrap();
            let attempts = attempts.entry(self.params.hostname.clone()).or_default();
            attempts.push(Attempt {
                ip: self.params.ip,
                version: self.params.version,
                strategy,
                retries: network_max_retries,
                sni: self.sni.clone(),
            });
            attempts.len()
        };
        if self.script.succeed_on == Some(attempt_number) {
            self.handshaken = true;
            Ok(())
        } else {
            Err(ConnectionError::Handshake("sslv3 alert handshake failure".into()))
        }
    }

    fn peer_ip(&self) -> Option<IpAddr> {
        self.script.peer_ip
    }

    fn negotiated_cipher_name(&self) -> Option<String> {
        if self.handshaken {
            self.script.cipher.map(str::to_string)
        } else {
            None
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.closed.fetch_add(1, Ordering::SeqCst);
            self.log.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

fn loopback() -> Option<IpAddr> {
    Some("127.0.0.1".parse().unwrap())
}

fn server(host: &str) -> ServerConnectivityInfo {
    ServerConnectivityInfo::new(host, Some(443), loopback(), TargetOptions::default()).unwrap()
}

fn probe_with(factory: FakeFactory) -> (ConnectivityProbe, Arc<Log>) {
    let log = factory.log.clone();
    (
        ConnectivityProbe::new(Arc::new(factory), ConnectivitySettings::default()),
        log,
    )
}

#[tokio::test]
async fn failing_target_walks_the_full_search_in_order() {
    let (probe, log) = probe_with(FakeFactory::with(
        "legacy.test",
        Script {
            succeed_on: None,
            ..Script::default()
        },
    ));
    let mut info = server("legacy.test");

    let err = probe.probe(&mut info).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeNegotiationFailure);
    assert_eq!(err.detail(), HANDSHAKE_ERROR);
    assert_eq!(err.target(), "legacy.test:443");
    assert!(info.negotiated().is_none());

    let observed: Vec<(TlsVersion, CipherStrategy)> = log
        .attempts_for("legacy.test")
        .iter()
        .map(|attempt| (attempt.version, attempt.strategy))
        .collect();
    assert_eq!(observed, NEGOTIATION_ORDER.to_vec());

    // one reachability connection plus eight handshakes, all closed
    assert_eq!(log.created.load(Ordering::SeqCst), 9);
    assert_eq!(log.closed.load(Ordering::SeqCst), 9);
}

#[tokio::test]
async fn search_stops_at_the_first_success() {
    let (probe, log) = probe_with(FakeFactory::with(
        "modern.test",
        Script {
            succeed_on: Some(3),
            ..Script::default()
        },
    ));
    let mut info = server("modern.test");

    let negotiated = probe.probe(&mut info).await.unwrap();
    assert_eq!(negotiated.tls_version, TlsVersion::Any);
    assert_eq!(negotiated.cipher_suite, "ECDHE-RSA-AES256-GCM-SHA384");
    assert_eq!(info.negotiated(), Some(&negotiated));

    let attempts = log.attempts_for("modern.test");
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[2].version, TlsVersion::Any);
    assert_eq!(attempts[2].strategy, CipherStrategy::Default);
    assert!(attempts.iter().all(|attempt| attempt.retries == 0));
    assert_eq!(log.created.load(Ordering::SeqCst), log.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn handshake_without_a_cipher_name_is_a_negotiation_failure() {
    let (probe, log) = probe_with(FakeFactory::with(
        "odd.test",
        Script {
            cipher: None,
            ..Script::default()
        },
    ));
    let mut info = server("odd.test");

    let err = probe.probe(&mut info).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeNegotiationFailure);
    assert_eq!(log.attempts_for("odd.test").len(), 1);
    assert!(info.negotiated().is_none());
}

#[tokio::test]
async fn reachability_failures_are_final_and_classified() {
    let cases = [
        (Reach::Timeout, ErrorKind::ConnectionTimeout, TIMEOUT_ERROR.to_string()),
        (Reach::Refused, ErrorKind::ConnectionRejected, "Connection rejected".to_string()),
        (
            Reach::UpgradeRefused,
            ErrorKind::ProtocolUpgradeFailure,
            "SMTP STARTTLS not supported".to_string(),
        ),
        (Reach::ProxyDown, ErrorKind::ProxyFailure, "proxy said 502".to_string()),
        (
            Reach::ProxyUnresolved,
            ErrorKind::ProxyFailure,
            "Could not resolve the proxy proxy.test".to_string(),
        ),
        (
            Reach::Unresolved,
            ErrorKind::NameResolutionFailure,
            "Could not resolve down.test".to_string(),
        ),
        (
            Reach::Broken,
            ErrorKind::UnclassifiedFailure,
            "InvalidState: socket in a bad state".to_string(),
        ),
    ];

    for (reach, kind, detail) in cases {
        let (probe, log) = probe_with(FakeFactory::with(
            "down.test",
            Script {
                reach,
                ..Script::default()
            },
        ));
        let mut info = server("down.test");

        let err = probe.probe(&mut info).await.unwrap_err();
        assert_eq!(err.kind(), kind, "{reach:?}");
        assert_eq!(err.detail(), detail, "{reach:?}");
        assert!(log.attempts_for("down.test").is_empty(), "{reach:?}");
        assert_eq!(log.created.load(Ordering::SeqCst), 1);
        assert_eq!(log.closed.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn negotiation_uses_the_observed_peer_ip() {
    let observed: IpAddr = "192.0.2.9".parse().unwrap();
    let (probe, log) = probe_with(FakeFactory::with(
        "moved.test",
        Script {
            succeed_on: Some(2),
            peer_ip: Some(observed),
            ..Script::default()
        },
    ));
    let mut info = server("moved.test");

    probe.probe(&mut info).await.unwrap();
    assert_eq!(log.upgrade_ips.lock().unwrap()[0], loopback().unwrap());
    assert!(log
        .attempts_for("moved.test")
        .iter()
        .all(|attempt| attempt.ip == observed));
    assert_eq!(info.ip_address(), loopback().unwrap());
}

#[tokio::test]
async fn every_connection_carries_sni_xmpp_target_and_tunnel() {
    let (probe, log) = probe_with(FakeFactory::with(
        "chat.test",
        Script {
            succeed_on: Some(4),
            ..Script::default()
        },
    ));
    let options = TargetOptions {
        protocol: ProtocolKind::StarttlsXmpp,
        sni: Some("front.test".into()),
        xmpp_to: Some("example.org".into()),
        http_tunnel: Some(HttpTunnelSettings {
            hostname: "proxy.test".into(),
            port: 3128,
            basic_auth_user: None,
            basic_auth_password: None,
        }),
        ..TargetOptions::default()
    };
    let mut info = ServerConnectivityInfo::new("chat.test", None, loopback(), options).unwrap();
    assert_eq!(info.port(), 5222);

    probe.probe(&mut info).await.unwrap();
    let attempts = log.attempts_for("chat.test");
    assert_eq!(attempts.len(), 4);
    assert!(attempts
        .iter()
        .all(|attempt| attempt.sni.as_deref() == Some("front.test")));
    assert_eq!(log.xmpp_to.lock().unwrap().len(), 5);
    assert_eq!(log.tunnels.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn preconfigured_connection_requires_a_tested_target() {
    let factory = Arc::new(FakeFactory::with(
        "ready.test",
        Script {
            succeed_on: Some(7),
            ..Script::default()
        },
    ));
    let log = factory.log.clone();
    let settings = ConnectivitySettings::default();
    let probe = ConnectivityProbe::new(factory.clone(), settings.clone());
    let mut info = server("ready.test");

    let err = info
        .preconfigured_connection(factory.as_ref(), None, &settings)
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

    probe.probe(&mut info).await.unwrap();
    assert_eq!(info.negotiated().unwrap().tls_version, TlsVersion::Tls1_2);

    let mut connection = info
        .preconfigured_connection(factory.as_ref(), None, &settings)
        .unwrap();
    connection.close().await;
    assert_eq!(log.versions.lock().unwrap().last(), Some(&TlsVersion::Tls1_2));

    let mut connection = info
        .preconfigured_connection(factory.as_ref(), Some(TlsVersion::Tls1_0), &settings)
        .unwrap();
    connection.close().await;
    assert_eq!(log.versions.lock().unwrap().last(), Some(&TlsVersion::Tls1_0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn target_strings_are_partitioned_under_their_own_names() {
    let mut factory = FakeFactory::default();
    factory.scripts.insert(
        "picky.test".into(),
        Script {
            succeed_on: None,
            ..Script::default()
        },
    );
    factory.scripts.insert(
        "down.test".into(),
        Script {
            reach: Reach::Refused,
            ..Script::default()
        },
    );
    let tester = ConnectivityTester::new(Arc::new(factory), ConnectivitySettings::default());

    let raw = vec![
        "ok.test:8443{127.0.0.1}",
        "picky.test{127.0.0.2}",
        "bad.test:abc",
        "down.test:443{127.0.0.3}",
        "worse.test{not-an-ip}",
        "also-ok.test{127.0.0.4}",
    ];
    let report = tester
        .test_target_strings(raw.clone(), &TargetOptions::default(), 50)
        .await;

    assert_eq!(report.len(), raw.len());
    let reachable: Vec<String> = report.reachable.iter().map(|s| s.display_name()).collect();
    assert_eq!(reachable, vec!["ok.test:8443", "also-ok.test:443"]);
    assert!(report.reachable.iter().all(|s| s.negotiated().is_some()));

    let invalid: Vec<(&str, ErrorKind, bool)> = report
        .invalid
        .iter()
        .map(|t| (t.error.target(), t.error.kind(), t.server.is_some()))
        .collect();
    assert_eq!(
        invalid,
        vec![
            ("picky.test{127.0.0.2}", ErrorKind::HandshakeNegotiationFailure, true),
            ("bad.test:abc", ErrorKind::MalformedTarget, false),
            ("down.test:443{127.0.0.3}", ErrorKind::ConnectionRejected, true),
            ("worse.test{not-an-ip}", ErrorKind::MalformedTarget, false),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_bounds_concurrency_and_loses_nothing() {
    for (targets, concurrency, ceiling) in [(200usize, 50usize, 50usize), (10, 50, 10)] {
        let mut factory = FakeFactory {
            delay: Some(Duration::from_millis(5)),
            ..FakeFactory::default()
        };
        for i in (0..targets).filter(|i| i % 4 == 0) {
            factory.scripts.insert(
                format!("host{i}.test"),
                Script {
                    reach: Reach::Timeout,
                    ..Script::default()
                },
            );
        }
        let log = factory.log.clone();
        let tester = ConnectivityTester::new(Arc::new(factory), ConnectivitySettings::default());
        let servers = (0..targets)
            .map(|i| server(&format!("host{i}.test")))
            .collect();

        let report = tester.test_all(servers, concurrency).await;

        let peak = log.peak.load(Ordering::SeqCst);
        assert!(peak <= ceiling, "peak {peak} above {ceiling}");
        assert_eq!(report.len(), targets);
        assert_eq!(report.invalid.len(), targets.div_ceil(4));
        assert!(report.reachable.iter().all(|s| s.negotiated().is_some()));
        assert!(report
            .invalid
            .iter()
            .all(|t| t.error.kind() == ErrorKind::ConnectionTimeout && t.server.is_some()));
        let mut names: Vec<String> = report
            .reachable
            .iter()
            .map(|s| s.hostname().to_string())
            .chain(report.invalid.iter().map(|t| {
                t.server
                    .as_ref()
                    .map(|s| s.hostname().to_string())
                    .unwrap_or_default()
            }))
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), targets);
        assert_eq!(log.created.load(Ordering::SeqCst), log.closed.load(Ordering::SeqCst));
    }
}
