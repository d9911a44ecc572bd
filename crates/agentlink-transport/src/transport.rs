//! Duplex channel to the agent: spawned child over stdio or TCP, an external
//! endpoint, or caller-supplied I/O.

use std::{fmt, process::Stdio, time::Duration};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
    net::TcpStream,
    process::{ChildStdout, Command},
    sync::{oneshot, watch},
};

use agentlink_core::{ClientOptions, Error, Result};

use crate::launch::{CommandBuilder, TransportFlag};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Exit of a spawned agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub success: bool,
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Handle to a spawned agent process group.
///
/// A monitor task owns the child; this handle asks it to kill the group and
/// observes the exit. Dropping the handle kills the group.
pub struct AgentProcess {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl AgentProcess {
    fn monitor(mut child: AsyncGroupChild) -> Self {
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::debug!(?pid, "Failed to kill agent process group: {e}");
                    }
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => ProcessExit {
                    code: status.code(),
                    success: status.success(),
                },
                Err(e) => {
                    tracing::debug!(?pid, "Failed to wait for agent process: {e}");
                    ProcessExit {
                        code: None,
                        success: false,
                    }
                }
            };
            tracing::debug!(?pid, %exit, "Agent process exited");
            exit_tx.send_replace(Some(exit));
        });

        Self {
            pid,
            kill: Some(kill_tx),
            exit: exit_rx,
        }
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Kill the process group. Idempotent.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Receiver that flips to `Some` when the process exits.
    #[must_use]
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    /// Wait for exit, up to `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<ProcessExit> {
        let mut rx = self.exit.clone();
        tokio::time::timeout(timeout, rx.wait_for(Option::is_some))
            .await
            .ok()
            .and_then(|r| r.ok().and_then(|exit| *exit))
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// An established duplex channel.
pub struct Transport {
    pub reader: BoxReader,
    pub writer: BoxWriter,
    /// Present when we spawned the agent.
    pub process: Option<AgentProcess>,
    /// Human-readable endpoint for logs.
    pub label: String,
}

impl Transport {
    /// Wrap caller-supplied I/O, e.g. an in-process agent.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: None,
            label: "custom".to_string(),
        }
    }

    /// Establish the channel described by `options`.
    ///
    /// # Errors
    /// `InvalidConfig` for contradictory options, `ProcessNotFound` when the
    /// executable cannot be located, `ConnectionRefused` when an endpoint
    /// is unreachable.
    pub async fn connect(options: &ClientOptions) -> Result<Self> {
        options.validate()?;
        if let Some(ref url) = options.cli_url {
            let (host, port) = parse_cli_url(url)?;
            return connect_tcp(&host, port).await;
        }
        if options.use_stdio {
            spawn_stdio(options).await
        } else {
            spawn_tcp(options).await
        }
    }
}

/// Parse `port`, `host:port` or `http(s)://host:port`.
///
/// # Errors
/// Returns `InvalidConfig` when no valid port can be found.
pub fn parse_cli_url(url: &str) -> Result<(String, u16)> {
    let trimmed = url.trim();
    let rest = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .unwrap_or(trimmed)
        .trim_end_matches('/');

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("localhost", rest),
    };
    let host = if host.is_empty() { "localhost" } else { host };
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| Error::InvalidConfig(format!("invalid cli_url: {url}")))?;
    Ok((host.to_string(), port))
}

async fn connect_tcp(host: &str, port: u16) -> Result<Transport> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::ConnectionRefused(format!("{host}:{port}: {e}")))?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY: {e}");
    }
    tracing::info!(host, port, "Connected to agent over TCP");
    let (reader, writer) = stream.into_split();
    Ok(Transport {
        reader: Box::new(reader),
        writer: Box::new(writer),
        process: None,
        label: format!("tcp://{host}:{port}"),
    })
}

async fn build_command(options: &ClientOptions, flag: TransportFlag) -> Result<Command> {
    let parts = CommandBuilder::from_options(options).build(flag)?;
    let (program, args) = parts.into_resolved().await?;
    tracing::debug!(program = %program.display(), ?args, "Spawning agent");

    let mut command = Command::new(program);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .envs(&options.env);
    if let Some(ref cwd) = options.cwd {
        command.current_dir(cwd);
    }
    Ok(command)
}

fn spawn_group(command: &mut Command) -> Result<AsyncGroupChild> {
    command.group_spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::ProcessNotFound(e.to_string())
        } else {
            Error::Io(e)
        }
    })
}

fn forward_stderr(child: &mut AsyncGroupChild) {
    let Some(stderr) = child.inner().stderr.take() else {
        return;
    };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "agentlink::agent", "{line}");
        }
    });
}

fn forward_stdout(mut lines: tokio::io::Lines<BufReader<ChildStdout>>) {
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "agentlink::agent", "{line}");
        }
    });
}

async fn spawn_stdio(options: &ClientOptions) -> Result<Transport> {
    let mut command = build_command(options, TransportFlag::Stdio).await?;
    command.stdin(Stdio::piped());
    let mut child = spawn_group(&mut command)?;

    let stdin = child.inner().stdin.take();
    let stdout = child.inner().stdout.take();
    let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
        let _ = child.kill().await;
        return Err(Error::Protocol("agent stdio pipes unavailable".into()));
    };
    forward_stderr(&mut child);

    let process = AgentProcess::monitor(child);
    tracing::info!(pid = ?process.pid(), "Spawned agent over stdio");
    Ok(Transport {
        reader: Box::new(stdout),
        writer: Box::new(stdin),
        process: Some(process),
        label: "stdio".to_string(),
    })
}

async fn spawn_tcp(options: &ClientOptions) -> Result<Transport> {
    let mut command = build_command(options, TransportFlag::Port(options.port)).await?;
    command.stdin(Stdio::null());
    let mut child = spawn_group(&mut command)?;
    forward_stderr(&mut child);

    let Some(stdout) = child.inner().stdout.take() else {
        let _ = child.kill().await;
        return Err(Error::Protocol("agent stdout unavailable".into()));
    };
    let mut lines = BufReader::new(stdout).lines();

    let announced = tokio::time::timeout(options.port_discovery_timeout, async {
        while let Some(line) = lines.next_line().await? {
            if let Some(port) = announced_port(&line) {
                return Ok(Some(port));
            }
            tracing::debug!(target: "agentlink::agent", "{line}");
        }
        Ok::<_, std::io::Error>(None)
    })
    .await;

    let port = match announced {
        Ok(Ok(Some(port))) => port,
        Ok(Ok(None)) => {
            let _ = child.kill().await;
            return Err(Error::ConnectionRefused(
                "agent exited before announcing its port".into(),
            ));
        }
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(Error::Io(e));
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(Error::Timeout(options.port_discovery_timeout));
        }
    };
    forward_stdout(lines);
    let process = AgentProcess::monitor(child);

    let mut transport = connect_tcp("127.0.0.1", port).await?;
    transport.process = Some(process);
    Ok(transport)
}

/// Port from a `... listening on port <n>` line.
fn announced_port(line: &str) -> Option<u16> {
    let idx = line.find("listening on port")?;
    line[idx..]
        .split_whitespace()
        .last()
        .and_then(|p| p.trim_end_matches(|c: char| !c.is_ascii_digit()).parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli_url() {
        assert_eq!(parse_cli_url("8080").unwrap(), ("localhost".into(), 8080));
        assert_eq!(parse_cli_url("127.0.0.1:9000").unwrap(), ("127.0.0.1".into(), 9000));
        assert_eq!(
            parse_cli_url("http://agent.local:3000/").unwrap(),
            ("agent.local".into(), 3000)
        );
        assert!(matches!(parse_cli_url("http://host"), Err(Error::InvalidConfig(_))));
        assert!(parse_cli_url("host:0").is_err());
    }

    #[test]
    fn test_announced_port() {
        assert_eq!(announced_port("CLI server listening on port 41235"), Some(41235));
        assert_eq!(announced_port("listening on port 80."), Some(80));
        assert_eq!(announced_port("starting up"), None);
    }

    #[tokio::test]
    async fn test_external_endpoint_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let options = ClientOptions::new().cli_url(format!("127.0.0.1:{port}"));
        let err = Transport::connect(&options).await.err().unwrap();
        assert!(matches!(err, Error::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn test_external_endpoint_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let options = ClientOptions::new().cli_url(format!("http://127.0.0.1:{port}"));
        let transport = Transport::connect(&options).await.unwrap();
        assert!(transport.process.is_none());
        assert_eq!(transport.label, format!("tcp://127.0.0.1:{port}"));
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let options = ClientOptions::new().cli_path("/definitely/not/here/agent");
        let err = Transport::connect(&options).await.err().unwrap();
        assert!(matches!(err, Error::ProcessNotFound(_)));
    }
}
