//! Connectivity pre-flight for TLS scanners: validate targets, reach them
//! (through STARTTLS or an HTTP proxy when asked) and find one TLS version
//! and cipher suite each accepts before any deeper scan runs.

pub mod connection;
pub mod engine;
pub mod error;
pub mod input;
pub mod model;
pub mod output;
mod util;

pub use connection::{ConnectionFactory, OpensslConnectionFactory, TlsConnection};
pub use engine::{ConnectivityReport, ConnectivityTester, InvalidTarget};
pub use error::{ConnectionError, ErrorKind, ProbeError};
pub use model::{ServerConnectivityInfo, TargetOptions};
