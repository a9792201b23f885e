//! Managed tunnel child process: config rendering, spawn, readiness, teardown.

use crate::config::ScanConfiguration;
use crate::types::FailureReason;
use anyhow::{bail, Result};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time::{self, Instant};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READY_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Render the tunnel client configuration routing through `ip`: a local SOCKS
/// inbound on the configured port, a VLESS-over-WebSocket outbound carrying
/// the scan identity.
pub fn render_client_config(config: &ScanConfiguration, ip: IpAddr) -> serde_json::Value {
    serde_json::json!({
        "log": { "loglevel": "warning" },
        "inbounds": [{
            "tag": "socks-in",
            "listen": "127.0.0.1",
            "port": config.local_socks_port,
            "protocol": "socks",
            "settings": { "auth": "noauth", "udp": true }
        }],
        "outbounds": [{
            "tag": "vless-out",
            "protocol": "vless",
            "settings": {
                "vnext": [{
                    "address": ip.to_string(),
                    "port": config.vless_port,
                    "users": [{ "id": config.uuid, "encryption": "none" }]
                }]
            },
            "streamSettings": {
                "network": "ws",
                "security": "tls",
                "tlsSettings": { "serverName": config.server_name },
                "wsSettings": {
                    "path": config.ws_path,
                    "headers": { "Host": config.host_header }
                }
            }
        }]
    })
}

/// One running tunnel process bound to the local proxy port. The child is
/// spawned with `kill_on_drop`, so dropping the handle on any path still
/// terminates the process and frees the port.
#[derive(Debug)]
pub struct TunnelProcess {
    child: Child,
    config_path: PathBuf,
    socks_port: u16,
}

impl TunnelProcess {
    /// Spawn the tunnel routing through `ip` and wait until its SOCKS inbound
    /// accepts connections, or until `startup_timeout` elapses.
    pub async fn launch(
        config: &ScanConfiguration,
        ip: IpAddr,
        startup_timeout: Duration,
    ) -> Result<Self, FailureReason> {
        let document = render_client_config(config, ip);
        let rendered = match serde_json::to_vec_pretty(&document) {
            Ok(bytes) => bytes,
            Err(_) => return Err(FailureReason::ProcessStart),
        };
        let config_path =
            std::env::temp_dir().join(format!("edge-scan-tunnel-{}.json", config.local_socks_port));
        if let Err(err) = tokio::fs::write(&config_path, rendered).await {
            tracing::warn!("failed to write tunnel config {}: {err}", config_path.display());
            return Err(FailureReason::ProcessStart);
        }

        let mut child = match Command::new(&config.tunnel_binary)
            .arg("-config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(
                    "failed to spawn tunnel binary {}: {err}",
                    config.tunnel_binary.display()
                );
                remove_config(&config_path).await;
                return Err(FailureReason::ProcessStart);
            }
        };

        let socks_addr = SocketAddr::from(([127, 0, 0, 1], config.local_socks_port));
        let deadline = Instant::now() + startup_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                tracing::warn!("tunnel process exited during startup: {status}");
                remove_config(&config_path).await;
                return Err(FailureReason::ProcessStart);
            }
            if let Ok(Ok(_)) =
                time::timeout(READY_CONNECT_TIMEOUT, TcpStream::connect(socks_addr)).await
            {
                return Ok(Self {
                    child,
                    config_path,
                    socks_port: config.local_socks_port,
                });
            }
            if Instant::now() >= deadline {
                terminate(&mut child).await;
                remove_config(&config_path).await;
                return Err(FailureReason::ReadinessTimeout);
            }
            time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    /// Terminate the process and release the proxy port. Teardown errors are
    /// logged, never raised.
    pub async fn shutdown(mut self) {
        terminate(&mut self.child).await;
        remove_config(&self.config_path).await;
    }
}

async fn terminate(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        // InvalidInput means the child already exited.
        if err.kind() != std::io::ErrorKind::InvalidInput {
            tracing::warn!("failed to signal tunnel process: {err}");
        }
    }
    match time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => tracing::warn!("failed to reap tunnel process: {err}"),
        Err(_) => tracing::warn!("tunnel process did not exit within the grace period"),
    }
}

async fn remove_config(path: &PathBuf) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove tunnel config {}: {err}", path.display());
        }
    }
}

/// Pre-flight check that the local proxy port can be bound, reclaiming it
/// from a stale process left over from a previous run if necessary.
pub async fn ensure_port_free(port: u16) -> Result<()> {
    if try_bind(port).await {
        return Ok(());
    }
    tracing::warn!("local proxy port {port} is in use, attempting to reclaim it");
    reclaim_port(port).await;
    time::sleep(Duration::from_millis(500)).await;
    if try_bind(port).await {
        Ok(())
    } else {
        bail!("port {port} is still in use after reclaim")
    }
}

async fn try_bind(port: u16) -> bool {
    TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port)))
        .await
        .is_ok()
}

#[cfg(unix)]
async fn reclaim_port(port: u16) {
    let output = match Command::new("lsof")
        .arg("-ti")
        .arg(format!(":{port}"))
        .output()
        .await
    {
        Ok(output) => output,
        Err(err) => {
            tracing::warn!("could not look up processes on port {port}: {err}");
            return;
        }
    };
    for pid in String::from_utf8_lossy(&output.stdout).split_whitespace() {
        tracing::info!("killing stale process {pid} holding port {port}");
        if let Err(err) = Command::new("kill").arg("-9").arg(pid).status().await {
            tracing::warn!("failed to kill process {pid}: {err}");
        }
    }
}

#[cfg(not(unix))]
async fn reclaim_port(port: u16) {
    tracing::warn!("port reclaim is not supported on this platform; free port {port} manually");
}
