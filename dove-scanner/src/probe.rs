//! Two-stage verification of decoded endpoints.
//!
//! Stage A opens a timed TCP connection to the endpoint and applies the
//! latency gate. Stage B runs the external engine against a synthesized
//! config on a leased loopback port, waits for the port to open and pulls a
//! fixed payload through it with the transfer tool.
//!
//! Every Stage B resource lives in a [`TunnelHarness`] owned by one probe. The
//! normal path calls `shutdown`, which terminates the engine's process group,
//! reaps it and removes the config file. If the probe future is dropped
//! before that (cancellation, panic), the harness `Drop` kills the group and
//! the temp file removes itself.

use crate::error::{ProbeError, Result};
use crate::link::ParsedEndpoint;
use crate::result::VerificationOutcome;
use crate::xray::{self, EngineConfig, LOOPBACK};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::io::Write;
use std::net::{Ipv4Addr, TcpListener as StdTcpListener};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const PORT_CLAIM_ATTEMPTS: usize = 64;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[cfg(unix)]
const NULL_DEVICE: &str = "/dev/null";
#[cfg(not(unix))]
const NULL_DEVICE: &str = "NUL";

/// Anything that can decide whether an endpoint is usable right now.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, raw_link: &str, endpoint: &ParsedEndpoint) -> VerificationOutcome;
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub tcp_timeout: Duration,
    /// Connects must complete in strictly fewer milliseconds than this.
    pub max_latency_ms: u64,
    pub engine_path: PathBuf,
    pub transfer_tool: PathBuf,
    pub payload_url: String,
    pub payload_kb: f64,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub transfer_timeout: Duration,
    pub port_range: RangeInclusive<u16>,
    /// Where per-probe engine configs are written.
    pub work_dir: PathBuf,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            tcp_timeout: Duration::from_secs(10),
            max_latency_ms: 1050,
            engine_path: PathBuf::from("xray"),
            transfer_tool: PathBuf::from("curl"),
            payload_url: "http://speedtest.tele2.net/1MB.zip".to_string(),
            payload_kb: 1024.0,
            startup_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            transfer_timeout: Duration::from_secs(20),
            port_range: 10000..=20000,
            work_dir: std::env::temp_dir(),
        }
    }
}

pub struct Prober {
    options: ProbeOptions,
    ports: PortPool,
}

impl Prober {
    pub fn new(options: ProbeOptions) -> Self {
        Self {
            options,
            ports: PortPool::default(),
        }
    }

    /// Stage A. Returns the connect time in whole milliseconds, or `None` when
    /// the connect failed or timed out.
    pub async fn tcp_ping(&self, host: &str, port: u16) -> Option<u64> {
        let start = Instant::now();
        match tokio::time::timeout(self.options.tcp_timeout, TcpStream::connect((host, port))).await
        {
            Ok(Ok(_stream)) => Some(start.elapsed().as_millis() as u64),
            Ok(Err(e)) => {
                debug!("TCP connect to {}:{} failed: {}", host, port, e);
                None
            }
            Err(_) => {
                debug!("TCP connect to {}:{} timed out", host, port);
                None
            }
        }
    }

    pub fn latency_acceptable(&self, latency_ms: u64) -> bool {
        latency_ms > 0 && latency_ms < self.options.max_latency_ms
    }

    /// Stage B. Returns throughput in KB/s.
    pub async fn probe_tunnel(&self, endpoint: &ParsedEndpoint) -> Result<f64> {
        let lease = self.ports.claim(&self.options.port_range)?;
        let config = xray::synthesize(endpoint, lease.port);

        let mut harness = TunnelHarness::launch(&self.options, &config)?;
        let outcome = self.drive(&mut harness, lease.port).await;
        harness.shutdown().await;

        outcome
    }

    async fn drive(&self, harness: &mut TunnelHarness, port: u16) -> Result<f64> {
        self.wait_for_port(harness, port).await?;
        self.run_transfer(port).await
    }

    async fn wait_for_port(&self, harness: &mut TunnelHarness, port: u16) -> Result<()> {
        let deadline = Instant::now() + self.options.startup_timeout;
        loop {
            let attempt = tokio::time::timeout(
                self.options.poll_interval,
                TcpStream::connect((LOOPBACK, port)),
            )
            .await;
            if let Ok(Ok(_)) = attempt {
                debug!("engine listening on control port {}", port);
                return Ok(());
            }

            if let Some(status) = harness.exit_status() {
                return Err(ProbeError::EngineExited(status));
            }
            if Instant::now() >= deadline {
                return Err(ProbeError::TunnelStartup {
                    port,
                    timeout_ms: self.options.startup_timeout.as_millis(),
                });
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn run_transfer(&self, port: u16) -> Result<f64> {
        let tool = self.options.transfer_tool.display().to_string();
        let mut command = Command::new(&self.options.transfer_tool);
        command
            .arg("--socks5-hostname")
            .arg(format!("{}:{}", LOOPBACK, port))
            .arg("-o")
            .arg(NULL_DEVICE)
            .arg("-s")
            .arg("-m")
            .arg(self.options.transfer_timeout.as_secs().max(1).to_string())
            .arg(&self.options.payload_url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        // the tool enforces its own limit; this one catches a tool that ignores it
        let hard_limit = self.options.transfer_timeout + SHUTDOWN_GRACE;
        let output = tokio::time::timeout(hard_limit, command.output())
            .await
            .map_err(|_| ProbeError::TunnelTransfer(format!("{} timed out", tool)))?
            .map_err(|source| ProbeError::Spawn {
                program: tool.clone(),
                source,
            })?;
        let elapsed = start.elapsed();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::TunnelTransfer(format!(
                "{} exited with {}: {}",
                tool,
                output.status,
                stderr.trim()
            )));
        }

        let seconds = elapsed.as_secs_f64().max(0.001);
        Ok(((self.options.payload_kb / seconds) * 100.0).round() / 100.0)
    }
}

#[async_trait]
impl Verifier for Prober {
    async fn verify(&self, raw_link: &str, endpoint: &ParsedEndpoint) -> VerificationOutcome {
        let target = format!("{} {}:{}", endpoint.scheme, endpoint.host, endpoint.port);

        let Some(latency) = self.tcp_ping(&endpoint.host, endpoint.port).await else {
            info!("✗ {} → TCP fail", target);
            return VerificationOutcome::unreachable();
        };
        if !self.latency_acceptable(latency) {
            info!("✗ {} → TCP rejected ({}ms)", target, latency);
            return VerificationOutcome::rejected(latency);
        }
        info!("✓ {} → {}ms", target, latency);

        match self.probe_tunnel(endpoint).await {
            Ok(kbps) => {
                info!("✓ {} → {} KB/s", target, kbps);
                VerificationOutcome::working(latency, kbps)
            }
            Err(e) => {
                info!("✗ {} → tunnel probe failed: {}", target, e);
                debug!("failed link: {}", raw_link);
                VerificationOutcome::tunnel_failed(latency)
            }
        }
    }
}

/// In-process registry of control ports currently leased to probes.
#[derive(Clone, Default)]
struct PortPool {
    claimed: Arc<Mutex<HashSet<u16>>>,
}

impl PortPool {
    /// Random pick from `range`, skipping ports leased to other probes and
    /// ports that fail a loopback bind test.
    fn claim(&self, range: &RangeInclusive<u16>) -> Result<PortLease> {
        let mut rng = rand::thread_rng();
        for _ in 0..PORT_CLAIM_ATTEMPTS {
            let port = rng.gen_range(range.clone());
            let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
            if claimed.contains(&port) {
                continue;
            }
            if StdTcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_err() {
                continue;
            }
            claimed.insert(port);
            return Ok(PortLease {
                port,
                pool: self.clone(),
            });
        }
        Err(ProbeError::NoFreePort(PORT_CLAIM_ATTEMPTS))
    }

    fn release(&self, port: u16) {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
    }
}

struct PortLease {
    port: u16,
    pool: PortPool,
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.port);
    }
}

/// The engine process and its config file, owned by exactly one probe.
struct TunnelHarness {
    child: Option<Child>,
    process_group: Option<u32>,
    config_file: Option<NamedTempFile>,
}

impl TunnelHarness {
    fn launch(options: &ProbeOptions, config: &EngineConfig) -> Result<Self> {
        // dropped (and removed) if anything below fails
        let mut config_file = tempfile::Builder::new()
            .prefix("dove-probe-")
            .suffix(".json")
            .tempfile_in(&options.work_dir)?;
        config_file.write_all(config.to_json()?.as_bytes())?;
        config_file.flush()?;

        let mut command = Command::new(&options.engine_path);
        command
            .arg("run")
            .arg("-c")
            .arg(config_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| ProbeError::Spawn {
            program: options.engine_path.display().to_string(),
            source,
        })?;
        let process_group = child.id();
        debug!(
            "spawned engine pid {:?} with {}",
            process_group,
            config_file.path().display()
        );

        Ok(Self {
            child: Some(child),
            process_group,
            config_file: Some(config_file),
        })
    }

    /// `Some(status)` once the engine has exited on its own.
    fn exit_status(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(e.to_string()),
        }
    }

    async fn shutdown(mut self) {
        if let Some(mut child) = self.child.take() {
            signal_group(self.process_group, &mut child, false);
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("engine exited with {}", status),
                Ok(Err(e)) => warn!("failed to reap engine process: {}", e),
                Err(_) => {
                    warn!("engine ignored SIGTERM, killing process group");
                    signal_group(self.process_group, &mut child, true);
                    if let Err(e) = child.kill().await {
                        warn!("failed to kill engine process: {}", e);
                    }
                }
            }
            self.reap_stragglers().await;
        }

        if let Some(config_file) = self.config_file.take() {
            let path = config_file.path().to_path_buf();
            if let Err(e) = config_file.close() {
                warn!("failed to remove probe config {}: {}", path.display(), e);
            }
        }
    }

    /// The leader is gone but other members of its group may have ignored
    /// SIGTERM. Give them the grace period, then SIGKILL the group.
    async fn reap_stragglers(&self) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while group_alive(self.process_group) {
            if Instant::now() >= deadline {
                warn!("engine process group outlived SIGTERM, killing it");
                kill_group(self.process_group);
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for TunnelHarness {
    fn drop(&mut self) {
        // only reached when the probe was abandoned before shutdown ran
        if let Some(mut child) = self.child.take() {
            warn!("probe abandoned, killing engine process group");
            signal_group(self.process_group, &mut child, true);
        }
    }
}

#[cfg(unix)]
fn signal_group(process_group: Option<u32>, _child: &mut Child, force: bool) {
    let Some(pgid) = process_group else {
        return;
    };
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    // SAFETY: killpg has no memory-safety preconditions
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!("failed to signal engine process group {}: {}", pgid, err);
        }
    }
}

#[cfg(unix)]
fn group_alive(process_group: Option<u32>) -> bool {
    let Some(pgid) = process_group else {
        return false;
    };
    // SAFETY: signal 0 only checks that the group exists
    unsafe { libc::killpg(pgid as libc::pid_t, 0) == 0 }
}

#[cfg(unix)]
fn kill_group(process_group: Option<u32>) {
    let Some(pgid) = process_group else {
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions
    if unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!("failed to kill engine process group {}: {}", pgid, err);
        }
    }
}

#[cfg(not(unix))]
fn group_alive(_process_group: Option<u32>) -> bool {
    false
}

#[cfg(not(unix))]
fn kill_group(_process_group: Option<u32>) {}

#[cfg(not(unix))]
fn signal_group(_process_group: Option<u32>, child: &mut Child, _force: bool) {
    if let Err(e) = child.start_kill() {
        warn!("failed to kill engine process: {}", e);
    }
}
