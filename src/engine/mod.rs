pub mod pool;
pub mod probe;

use crate::connection::ConnectionFactory;
use crate::error::{ErrorKind, ProbeError};
use crate::model::{ConnectivitySettings, ServerConnectivityInfo, TargetOptions};
use async_trait::async_trait;
use pool::{Job, WorkerPool};
use probe::ConnectivityProbe;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const DEFAULT_MAX_CONCURRENCY: usize = pool::MAX_CONCURRENCY;

/// Outcome of one testing run. Every input lands in exactly one of the two
/// lists, in submission order.
#[derive(Debug, Default)]
pub struct ConnectivityReport {
    pub reachable: Vec<ServerConnectivityInfo>,
    pub invalid: Vec<InvalidTarget>,
}

impl ConnectivityReport {
    pub fn len(&self) -> usize {
        self.reachable.len() + self.invalid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A discarded target. `server` is missing when the target string could not
/// be turned into a [`ServerConnectivityInfo`] at all.
#[derive(Debug)]
pub struct InvalidTarget {
    pub server: Option<ServerConnectivityInfo>,
    pub error: ProbeError,
}

enum JobTarget {
    Pending(TargetOptions),
    Built(ServerConnectivityInfo),
}

/// Probes one target. The job owns its target for the whole run and carries
/// the identity that errors are reported under.
pub struct ConnectivityJob {
    index: usize,
    identity: String,
    target: JobTarget,
    probe: ConnectivityProbe,
}

impl ConnectivityJob {
    pub fn for_server(index: usize, server: ServerConnectivityInfo, probe: ConnectivityProbe) -> Self {
        Self {
            index,
            identity: server.display_name(),
            target: JobTarget::Built(server),
            probe,
        }
    }

    /// Parsing and name resolution happen inside the job, so a slow lookup
    /// only holds up one worker.
    pub fn for_target_string(
        index: usize,
        raw: String,
        options: TargetOptions,
        probe: ConnectivityProbe,
    ) -> Self {
        Self {
            index,
            identity: raw,
            target: JobTarget::Pending(options),
            probe,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn into_server(self) -> Option<ServerConnectivityInfo> {
        match self.target {
            JobTarget::Built(server) => Some(server),
            JobTarget::Pending(_) => None,
        }
    }

    async fn build(&self, options: TargetOptions) -> Result<ServerConnectivityInfo, ProbeError> {
        let raw = self.identity.clone();
        tokio::task::spawn_blocking(move || ServerConnectivityInfo::from_command_line(&raw, options))
            .await
            .map_err(|err| {
                ProbeError::new(
                    self.identity.clone(),
                    ErrorKind::UnclassifiedFailure,
                    format!("JoinError: {err}"),
                )
            })?
    }
}

#[async_trait]
impl Job for ConnectivityJob {
    type Output = ServerConnectivityInfo;
    type Error = ProbeError;

    /// Yields the probed target with its negotiated capability recorded. A
    /// target built from a string is kept on the job even when the probe
    /// fails, so the invalid entry can still show what was resolved.
    async fn run(&mut self) -> Result<ServerConnectivityInfo, ProbeError> {
        let mut server = match &self.target {
            JobTarget::Built(server) => server.clone(),
            JobTarget::Pending(options) => {
                let server = self.build(options.clone()).await?;
                self.target = JobTarget::Built(server.clone());
                server
            }
        };
        self.probe.probe(&mut server).await?;
        self.target = JobTarget::Built(server.clone());
        Ok(server)
    }
}

/// Fans connectivity probes out over a [`WorkerPool`] and partitions the
/// targets into reachable and invalid.
#[derive(Clone)]
pub struct ConnectivityTester {
    probe: ConnectivityProbe,
}

impl ConnectivityTester {
    pub fn new(factory: Arc<dyn ConnectionFactory>, settings: ConnectivitySettings) -> Self {
        Self {
            probe: ConnectivityProbe::new(factory, settings),
        }
    }

    pub fn probe(&self) -> &ConnectivityProbe {
        &self.probe
    }

    pub async fn test_all(
        &self,
        servers: Vec<ServerConnectivityInfo>,
        max_concurrency: usize,
    ) -> ConnectivityReport {
        let jobs = servers
            .into_iter()
            .enumerate()
            .map(|(index, server)| ConnectivityJob::for_server(index, server, self.probe.clone()))
            .collect();
        self.run(jobs, max_concurrency).await
    }

    /// Like [`Self::test_all`], starting from raw `host[:port]{ip}` strings.
    /// Errors for targets that never parsed are reported under the string.
    pub async fn test_target_strings<I, S>(
        &self,
        raw: I,
        options: &TargetOptions,
        max_concurrency: usize,
    ) -> ConnectivityReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let jobs = raw
            .into_iter()
            .enumerate()
            .map(|(index, raw)| {
                ConnectivityJob::for_target_string(
                    index,
                    raw.into(),
                    options.clone(),
                    self.probe.clone(),
                )
            })
            .collect();
        self.run(jobs, max_concurrency).await
    }

    #[instrument(skip_all, fields(targets = jobs.len(), max_concurrency = max_concurrency))]
    async fn run(&self, jobs: Vec<ConnectivityJob>, max_concurrency: usize) -> ConnectivityReport {
        let mut pool = WorkerPool::new();
        for job in jobs {
            pool.submit(job);
        }
        let outcome = pool.run(max_concurrency).drain().await;

        let mut reachable = Vec::with_capacity(outcome.results.len());
        let mut invalid = Vec::with_capacity(outcome.errors.len());

        for (job, server) in outcome.results {
            reachable.push((job.index(), server));
        }
        for (job, error) in outcome.errors {
            let index = job.index();
            let error = error.with_target(job.identity());
            warn!(server = %error.target(), kind = %error.kind(), "discarding target");
            invalid.push((
                index,
                InvalidTarget {
                    server: job.into_server(),
                    error,
                },
            ));
        }

        reachable.sort_by_key(|(index, _)| *index);
        invalid.sort_by_key(|(index, _)| *index);
        info!(
            reachable = reachable.len(),
            invalid = invalid.len(),
            "connectivity testing finished"
        );

        ConnectivityReport {
            reachable: reachable.into_iter().map(|(_, server)| server).collect(),
            invalid: invalid.into_iter().map(|(_, target)| target).collect(),
        }
    }
}
