//! Container runtime access.
//!
//! The sweep only needs three calls from a runtime, captured by
//! [`ContainerRuntime`]. [`DockerRuntime`] implements it on top of the
//! Docker Engine API through bollard, pinned to a fixed API version and
//! connected using the same `DOCKER_HOST`, `DOCKER_TLS_VERIFY` and
//! `DOCKER_CERT_PATH` conventions as the docker CLI.

use bollard::container::{InspectContainerOptions, ListContainersOptions, RemoveContainerOptions};
use bollard::{ClientVersion, Docker};
use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;

use crate::config::env_var;

/// Runtime endpoint selection, following the docker CLI
pub const DOCKER_HOST_ENV: &str = "DOCKER_HOST";
/// Any non-empty value turns on TLS for TCP endpoints
pub const TLS_VERIFY_ENV: &str = "DOCKER_TLS_VERIFY";
/// Directory holding `ca.pem`, `cert.pem` and `key.pem`
pub const CERT_PATH_ENV: &str = "DOCKER_CERT_PATH";

/// Docker Engine API version every request is pinned to.
pub const API_VERSION: ClientVersion = ClientVersion {
    major_version: 1,
    minor_version: 41,
};

/// Per-request timeout in seconds; bollard requires one.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// A container as returned by the list call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
}

/// The subset of inspect output the sweep needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    /// Creation time as reported by the runtime (RFC 3339, nanoseconds)
    pub created: String,
}

/// Minimal capability set required to reap containers.
pub trait ContainerRuntime {
    /// List running containers.
    fn list(&self) -> Result<Vec<ContainerSummary>>;
    /// Fetch details for a single container.
    fn inspect(&self, id: &str) -> Result<ContainerDetails>;
    /// Remove a container without stopping it gracefully first.
    fn remove_forced(&self, id: &str) -> Result<()>;
}

/// Client certificate material for a TLS endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub ca: Utf8PathBuf,
    pub cert: Utf8PathBuf,
    pub key: Utf8PathBuf,
}

impl TlsFiles {
    /// The docker CLI layout: `ca.pem`, `cert.pem` and `key.pem` in `dir`.
    pub fn in_dir(dir: &Utf8Path) -> Self {
        Self {
            ca: dir.join("ca.pem"),
            cert: dir.join("cert.pem"),
            key: dir.join("key.pem"),
        }
    }
}

/// Where the Docker daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(String),
    NamedPipe(String),
    Http(String),
    Tls { addr: String, files: TlsFiles },
}

impl Endpoint {
    /// Platform default local endpoint.
    pub fn local_default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(windows)] {
                Self::NamedPipe("//./pipe/docker_engine".to_owned())
            } else {
                Self::Unix("/var/run/docker.sock".to_owned())
            }
        }
    }

    /// Resolve the endpoint from `DOCKER_HOST`, `DOCKER_TLS_VERIFY` and
    /// `DOCKER_CERT_PATH`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_var, dirs::home_dir)
    }

    /// Resolve the endpoint using an arbitrary variable lookup. `home` is
    /// only consulted when TLS is on and no certificate path is given.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Result<Option<String>>,
        home: impl FnOnce() -> Option<std::path::PathBuf>,
    ) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).map(|v| v.filter(|v| !v.is_empty()));

        let endpoint = Self::parse(non_empty(DOCKER_HOST_ENV)?.as_deref())?;
        let tls_verify = non_empty(TLS_VERIFY_ENV)?.is_some();
        let cert_path = non_empty(CERT_PATH_ENV)?;
        if !tls_verify && cert_path.is_none() {
            return Ok(endpoint);
        }

        let addr = match endpoint {
            Self::Http(addr) => addr,
            // Local sockets never use TLS.
            other => return Ok(other),
        };
        let cert_dir = match cert_path {
            Some(p) => Utf8PathBuf::from(p),
            None => {
                let home = home().ok_or_else(|| {
                    eyre!("TLS requested but {CERT_PATH_ENV} is unset and there is no home directory")
                })?;
                let home = Utf8PathBuf::try_from(home).context("Home directory is not UTF-8")?;
                home.join(".docker")
            }
        };
        let hostport = addr
            .strip_prefix("tcp://")
            .or_else(|| addr.strip_prefix("http://"))
            .unwrap_or(&addr);
        Ok(Self::Tls {
            addr: format!("tcp://{hostport}"),
            files: TlsFiles::in_dir(&cert_dir),
        })
    }

    /// Parse a `DOCKER_HOST` value; `None` or empty selects the local default.
    pub fn parse(host: Option<&str>) -> Result<Self> {
        let Some(host) = host.filter(|h| !h.is_empty()) else {
            return Ok(Self::local_default());
        };
        let endpoint = if let Some(path) = host.strip_prefix("unix://") {
            Self::Unix(path.to_owned())
        } else if let Some(path) = host.strip_prefix("npipe://") {
            Self::NamedPipe(path.to_owned())
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Self::Http(host.to_owned())
        } else {
            return Err(eyre!("Unsupported {DOCKER_HOST_ENV}: {host}"));
        };
        Ok(endpoint)
    }
}

/// [`ContainerRuntime`] backed by the Docker Engine API.
///
/// Requests are issued one at a time on a private current-thread runtime,
/// so callers see ordinary blocking calls.
#[derive(Debug)]
pub struct DockerRuntime {
    rt: tokio::runtime::Runtime,
    docker: Docker,
}

impl DockerRuntime {
    /// Build a client for `endpoint` pinned to `version`.
    pub fn connect(endpoint: &Endpoint, version: &ClientVersion) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create async runtime")?;
        let docker = {
            // Connectors may spawn onto the ambient runtime.
            let _guard = rt.enter();
            connect_endpoint(endpoint, version)
                .wrap_err_with(|| format!("Failed to connect to Docker API at {endpoint:?}"))?
        };
        tracing::debug!(
            "Connected to {endpoint:?} using API version {}.{}",
            version.major_version,
            version.minor_version
        );
        Ok(Self { rt, docker })
    }
}

fn connect_endpoint(endpoint: &Endpoint, version: &ClientVersion) -> Result<Docker> {
    let docker = match endpoint {
        Endpoint::Http(addr) => Docker::connect_with_http(addr, REQUEST_TIMEOUT_SECS, version)?,
        Endpoint::Tls { addr, files } => Docker::connect_with_ssl(
            addr,
            files.key.as_std_path(),
            files.cert.as_std_path(),
            files.ca.as_std_path(),
            REQUEST_TIMEOUT_SECS,
            version,
        )?,
        #[cfg(unix)]
        Endpoint::Unix(path) => Docker::connect_with_unix(path, REQUEST_TIMEOUT_SECS, version)?,
        #[cfg(windows)]
        Endpoint::NamedPipe(path) => {
            Docker::connect_with_named_pipe(path, REQUEST_TIMEOUT_SECS, version)?
        }
        #[allow(unreachable_patterns)]
        other => return Err(eyre!("{other:?} is not supported on this platform")),
    };
    Ok(docker)
}

impl ContainerRuntime for DockerRuntime {
    fn list(&self) -> Result<Vec<ContainerSummary>> {
        let summaries = self
            .rt
            .block_on(
                self.docker
                    .list_containers(None::<ListContainersOptions<String>>),
            )
            .context("Failed to list Docker containers")?;
        let containers = summaries
            .into_iter()
            .filter_map(|s| match s.id {
                Some(id) => Some(ContainerSummary { id }),
                None => {
                    tracing::warn!("Skipping container without an ID: {:?}", s.names);
                    None
                }
            })
            .collect();
        Ok(containers)
    }

    fn inspect(&self, id: &str) -> Result<ContainerDetails> {
        let info = self
            .rt
            .block_on(
                self.docker
                    .inspect_container(id, None::<InspectContainerOptions>),
            )?;
        let created = info
            .created
            .ok_or_else(|| eyre!("inspect response has no creation time"))?;
        Ok(ContainerDetails { created })
    }

    fn remove_forced(&self, id: &str) -> Result<()> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.rt
            .block_on(self.docker.remove_container(id, Some(opts)))?;
        Ok(())
    }
}
