use crate::config::Config;
use crate::error::Result;
use crate::host::{Executor, ProcessTable};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// `docker info` can hang on some hosts when the daemon is not running.
const DOCKER_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Native,
    Container,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Native => write!(f, "native"),
            Backend::Container => write!(f, "docker"),
        }
    }
}

pub fn resolve_backend(cfg: &Config) -> Result<Backend> {
    if cfg.is_true("docker", "use_docker")? {
        Ok(Backend::Container)
    } else {
        Ok(Backend::Native)
    }
}

/// Outcome of a host capability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Available,
    Unavailable,
    /// The host does not let us find out; checks relying on it are skipped.
    Unknown,
}

impl Capability {
    fn from_bool(ok: bool) -> Self {
        if ok {
            Capability::Available
        } else {
            Capability::Unavailable
        }
    }
}

/// Host capabilities, probed once per invocation. Purely advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub docker: Capability,
    pub binaries: Capability,
    pub connections: Capability,
}

impl Capabilities {
    pub fn probe(cfg: &Config, executor: &dyn Executor, processes: &dyn ProcessTable) -> Self {
        let connections = match processes.ports_in_use() {
            Ok(_) => Capability::Available,
            Err(err) => {
                debug!(
                    "Note: cannot list network connections ({err}), will not scan them for action \"start\""
                );
                Capability::Unknown
            }
        };

        let docker = Capability::from_bool(matches!(
            executor.run_quiet("docker", &["info"], Some(DOCKER_PROBE_TIMEOUT)),
            Ok(output) if output.success()
        ));
        if docker == Capability::Unavailable {
            warn!("Note: `docker info` failed, therefore docker.USE_DOCKER=true not supported");
        }

        let binaries = Capability::from_bool(
            ["server", "index"]
                .iter()
                .all(|section| binary_responds(cfg, executor, section)),
        );
        if binaries == Capability::Unavailable {
            warn!("Note: QLever binaries not found or failed, therefore docker.USE_DOCKER=false not supported");
        }

        Capabilities {
            docker,
            binaries,
            connections,
        }
    }

    pub fn for_backend(&self, backend: Backend) -> Capability {
        match backend {
            Backend::Native => self.binaries,
            Backend::Container => self.docker,
        }
    }

    /// Logs a warning when the selected backend failed its probe.
    pub fn warn_if_unsupported(&self, backend: Backend) {
        if self.for_backend(backend) == Capability::Unavailable {
            warn!("The {backend} backend did not pass its startup check, the command may fail");
        }
    }
}

fn binary_responds(cfg: &Config, executor: &dyn Executor, section: &str) -> bool {
    let Ok(binary) = cfg.get(section, "binary") else {
        return false;
    };
    if let Err(err) = which::which(&binary) {
        debug!("{section}.binary \"{binary}\" not found: {err}");
        return false;
    }
    // Only a failure to run counts; the exit code of --help is ignored.
    match executor.run_quiet(&binary, &["--help"], None) {
        Ok(_) => true,
        Err(err) => {
            debug!("Running \"{binary} --help\" failed: {err}");
            false
        }
    }
}
