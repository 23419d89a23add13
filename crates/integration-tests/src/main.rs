use std::process::Output;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};
use xshell::{cmd, Shell};

/// Label used to identify containers created by integration tests
pub(crate) const INTEGRATION_TEST_LABEL: &str = "ctr-reaper.integration-test=1";

/// An address where nothing listens, so every API call fails fast
pub(crate) const DEAD_DOCKER_HOST: &str = "tcp://127.0.0.1:1";

mod tests {
    pub mod docker;
    pub mod setup;
}

/// Get the path to the ctr-reaper binary, checking CTR_REAPER_PATH first,
/// then falling back to "ctr-reaper" on PATH.
pub(crate) fn get_reaper_command() -> Result<String> {
    if let Ok(path) = std::env::var("CTR_REAPER_PATH") {
        return Ok(path);
    }
    if let Some(path) = ["target/debug/ctr-reaper", "target/release/ctr-reaper"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set CTR_REAPER_PATH={path} to run using this binary"
        ));
    }
    Ok("ctr-reaper".to_owned())
}

/// A scratch directory holding the audit log for one test.
pub(crate) struct Scratch {
    _dir: tempfile::TempDir,
    pub(crate) log_path: Utf8PathBuf,
}

impl Scratch {
    pub(crate) fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path())
            .ok_or_else(|| eyre!("tempdir is not UTF-8: {}", dir.path().display()))?;
        let log_path = root.join("logs/audit.log");
        Ok(Self {
            _dir: dir,
            log_path,
        })
    }
}

/// Run ctr-reaper with a controlled environment, without failing on a
/// non-zero exit.
pub(crate) fn run_reaper(
    sh: &Shell,
    running_time: Option<&str>,
    log_path: &Utf8Path,
    docker_host: Option<&str>,
) -> Result<Output> {
    let reaper = get_reaper_command()?;
    let mut c = cmd!(sh, "{reaper}")
        .env("DOCKER_CLEANUP_LOG", log_path.as_str())
        .env("RUST_LOG", "debug")
        .ignore_status();
    c = match running_time {
        Some(v) => c.env("DOCKER_RUNNING_TIME", v),
        None => c.env_remove("DOCKER_RUNNING_TIME"),
    };
    c = match docker_host {
        Some(v) => c.env("DOCKER_HOST", v),
        None => c.env_remove("DOCKER_HOST"),
    };
    Ok(c.output()?)
}

/// Whether a Docker daemon is reachable through the docker CLI.
pub(crate) fn docker_available() -> bool {
    std::process::Command::new("docker")
        .args(["version", "--format", "{{.Server.Version}}"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Cleanup all containers with the integration test label
pub(crate) fn cleanup_integration_test_containers() {
    let list_output = std::process::Command::new("docker")
        .args([
            "ps",
            "-a",
            "--filter",
            &format!("label={INTEGRATION_TEST_LABEL}"),
            "-q",
        ])
        .output();

    if let Ok(output) = list_output {
        if output.status.success() {
            let container_ids = String::from_utf8_lossy(&output.stdout);
            for container_id in container_ids.lines().filter(|l| !l.is_empty()) {
                let _ = std::process::Command::new("docker")
                    .args(["rm", "-f", container_id])
                    .output();
            }
        }
    }
}

fn main() {
    let args = Arguments::from_args();
    let have_docker = docker_available();

    #[allow(unused_mut)]
    let mut tests = vec![
        Trial::test("help_lists_environment", || {
            tests::setup::test_help_lists_environment()?;
            Ok(())
        }),
        Trial::test("malformed_running_time_is_fatal", || {
            tests::setup::test_malformed_running_time_is_fatal()?;
            Ok(())
        }),
        Trial::test("unsupported_docker_host_is_fatal", || {
            tests::setup::test_unsupported_docker_host_is_fatal()?;
            Ok(())
        }),
        Trial::test("list_failure_is_fatal", || {
            tests::setup::test_list_failure_is_fatal()?;
            Ok(())
        }),
        Trial::test("young_container_is_kept", || {
            tests::docker::test_young_container_is_kept()?;
            Ok(())
        })
        .with_ignored_flag(!have_docker),
    ];

    #[cfg(unix)]
    tests.push(Trial::test("non_utf8_running_time_is_fatal", || {
        tests::setup::test_non_utf8_running_time_is_fatal()?;
        Ok(())
    }));

    let exit_code = libtest_mimic::run(&args, tests);

    if have_docker {
        cleanup_integration_test_containers();
    }

    exit_code.exit();
}
