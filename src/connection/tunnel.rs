// ABOUTME: SSH local port forwarding by supervising an `ssh -N -L` child process
// ABOUTME: Waits until the forwarded port accepts connections before handing it out

use super::{Tunnel, TunnelOpener};
use crate::config::SshTunnelSpec;
use crate::error::SyncError;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

/// Opens tunnels by spawning the system `ssh` client.
///
/// Key or agent authentication is used by default. When the tunnel settings carry a
/// password, `sshpass` must be installed; the password is passed through the
/// `SSHPASS` environment variable, never on the command line.
pub struct SshCommandOpener {
    ready_timeout: Duration,
}

impl SshCommandOpener {
    pub fn new(ready_timeout: Duration) -> Self {
        Self { ready_timeout }
    }
}

/// A running `ssh` port forward. The child is killed on close or drop.
pub struct SshTunnel {
    child: Child,
    local_port: u16,
}

#[async_trait]
impl TunnelOpener for SshCommandOpener {
    async fn open(
        &self,
        spec: &SshTunnelSpec,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Box<dyn Tunnel>, SyncError> {
        let local_port = pick_free_port()?;
        let mut command = build_command(spec, local_port, remote_host, remote_port)?;

        let mut child = command
            .spawn()
            .map_err(|e| SyncError::tunnel(format!("failed to spawn ssh: {}", e)))?;

        match wait_until_ready(&mut child, local_port, self.ready_timeout).await {
            Ok(()) => {
                // ssh keeps writing warnings for the life of the tunnel
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(forward_stderr(stderr, local_port));
                }
                tracing::info!(
                    "SSH tunnel established: 127.0.0.1:{} -> {}:{} via {}",
                    local_port,
                    remote_host,
                    remote_port,
                    spec.host
                );
                Ok(Box::new(SshTunnel { child, local_port }))
            }
            Err(e) => {
                let _ = child.kill().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Tunnel for SshTunnel {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    async fn close(self: Box<Self>) -> Result<(), SyncError> {
        let mut this = self;
        if this
            .child
            .try_wait()
            .map_err(|e| SyncError::tunnel(e.to_string()))?
            .is_some()
        {
            return Ok(());
        }
        this.child
            .kill()
            .await
            .map_err(|e| SyncError::tunnel(format!("failed to stop ssh: {}", e)))?;
        tracing::debug!("SSH tunnel on local port {} closed", this.local_port);
        Ok(())
    }
}

fn pick_free_port() -> Result<u16, SyncError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|e| SyncError::tunnel(format!("no free local port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| SyncError::tunnel(e.to_string()))?
        .port();
    Ok(port)
}

fn locate(tool: &str) -> Result<PathBuf, SyncError> {
    which::which(tool).map_err(|_| SyncError::tunnel(format!("'{}' not found in PATH", tool)))
}

/// Build the ssh invocation for a forward `127.0.0.1:local -> remote_host:remote_port`.
fn build_command(
    spec: &SshTunnelSpec,
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
) -> Result<Command, SyncError> {
    let ssh = locate("ssh")?;

    let mut command = match &spec.password {
        Some(password) => {
            let mut c = Command::new(locate("sshpass")?);
            c.arg("-e").arg(&ssh).env("SSHPASS", password);
            c
        }
        None => Command::new(&ssh),
    };

    command.args(ssh_args(spec, local_port, remote_host, remote_port));
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(command)
}

fn ssh_args(
    spec: &SshTunnelSpec,
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
) -> Vec<String> {
    let mut args = vec![
        "-N".to_string(),
        "-L".to_string(),
        format!("127.0.0.1:{}:{}:{}", local_port, remote_host, remote_port),
        "-p".to_string(),
        spec.port.to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=30".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
    ];
    if spec.password.is_none() {
        args.push("-o".to_string());
        args.push("BatchMode=yes".to_string());
    }
    if let Some(identity) = &spec.identity_file {
        args.push("-i".to_string());
        args.push(identity.display().to_string());
    }
    args.push(format!("{}@{}", spec.username, spec.host));
    args
}

/// Log each stderr line of a running tunnel until the pipe closes.
///
/// Returns the number of lines read.
async fn forward_stderr<R: AsyncRead + Unpin>(stderr: R, local_port: u16) -> usize {
    let mut lines = BufReader::new(stderr).lines();
    let mut count = 0;
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!("ssh (port {}): {}", local_port, line);
        count += 1;
    }
    count
}

async fn wait_until_ready(
    child: &mut Child,
    local_port: u16,
    timeout: Duration,
) -> Result<(), SyncError> {
    let deadline = Instant::now() + timeout;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));

    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| SyncError::tunnel(e.to_string()))?
        {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            return Err(SyncError::tunnel(format!(
                "ssh exited with {}: {}",
                status,
                stderr.trim()
            )));
        }

        if TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(SyncError::tunnel(format!(
                "local port {} not reachable after {:?}",
                local_port, timeout
            )));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
