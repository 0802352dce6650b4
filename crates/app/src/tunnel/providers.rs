use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::Mutex,
};
use tracing::{debug, info};

use super::TunnelProvider;
use crate::error::TunnelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A tunnel backed by a long-running CLI that prints its public URL.
pub struct ProcessTunnel {
    name: &'static str,
    binary: String,
    args: fn(u16) -> Vec<String>,
    scan: fn(&str) -> Option<String>,
    stream: OutputStream,
    timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl ProcessTunnel {
    pub fn new(
        name: &'static str,
        binary: impl Into<String>,
        args: fn(u16) -> Vec<String>,
        scan: fn(&str) -> Option<String>,
        stream: OutputStream,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            binary: binary.into(),
            args,
            scan,
            stream,
            timeout,
            child: Mutex::new(None),
        }
    }

    async fn wait_for_url<R>(&self, reader: R) -> Result<String, TunnelError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut lines = BufReader::new(reader).lines();
        let scan = self.scan;
        let name = self.name;
        let found = tokio::time::timeout(self.timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(provider = name, %line, "tunnel output");
                if let Some(url) = scan(&line) {
                    return Some(url);
                }
            }
            None
        })
        .await
        .map_err(|_| TunnelError::Timeout {
            provider: name.into(),
            seconds: self.timeout.as_secs(),
        })?
        .ok_or_else(|| TunnelError::Exited {
            provider: name.into(),
        })?;

        // Keep draining so the child never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(provider = name, %line, "tunnel output");
            }
        });
        Ok(found)
    }
}

#[async_trait]
impl TunnelProvider for ProcessTunnel {
    fn name(&self) -> &str {
        self.name
    }

    async fn is_available(&self) -> bool {
        which::which(&self.binary).is_ok()
    }

    async fn connect(&self, port: u16) -> Result<String, TunnelError> {
        let mut command = Command::new(&self.binary);
        command
            .args((self.args)(port))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        match self.stream {
            OutputStream::Stdout => command.stdout(Stdio::piped()).stderr(Stdio::null()),
            OutputStream::Stderr => command.stdout(Stdio::null()).stderr(Stdio::piped()),
        };
        let mut child = command.spawn().map_err(|err| TunnelError::Spawn {
            provider: self.name.into(),
            reason: err.to_string(),
        })?;

        let outcome = match self.stream {
            OutputStream::Stdout => match child.stdout.take() {
                Some(out) => self.wait_for_url(out).await,
                None => Err(TunnelError::Exited {
                    provider: self.name.into(),
                }),
            },
            OutputStream::Stderr => match child.stderr.take() {
                Some(err) => self.wait_for_url(err).await,
                None => Err(TunnelError::Exited {
                    provider: self.name.into(),
                }),
            },
        };

        match outcome {
            Ok(url) => {
                *self.child.lock().await = Some(child);
                Ok(url)
            }
            Err(err) => {
                let _ = child.kill().await;
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TunnelError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        child.kill().await.map_err(|err| TunnelError::Disconnect {
            provider: self.name.into(),
            reason: err.to_string(),
        })?;
        info!(provider = self.name, "tunnel process stopped");
        Ok(())
    }
}

pub fn cloudflared(timeout: Duration) -> ProcessTunnel {
    ProcessTunnel::new(
        "cloudflared",
        "cloudflared",
        |port| {
            vec![
                "tunnel".into(),
                "--no-autoupdate".into(),
                "--url".into(),
                format!("http://localhost:{port}"),
            ]
        },
        scan_cloudflared,
        OutputStream::Stderr,
        timeout,
    )
}

pub fn ngrok(timeout: Duration) -> ProcessTunnel {
    ProcessTunnel::new(
        "ngrok",
        "ngrok",
        |port| {
            vec![
                "http".into(),
                port.to_string(),
                "--log".into(),
                "stdout".into(),
                "--log-format".into(),
                "json".into(),
            ]
        },
        scan_ngrok,
        OutputStream::Stdout,
        timeout,
    )
}

/// Quick tunnels announce themselves inside a banner on stderr.
fn scan_cloudflared(line: &str) -> Option<String> {
    line.split(|c: char| c.is_whitespace() || c == '|')
        .find(|token| token.starts_with("https://") && token.contains(".trycloudflare.com"))
        .map(str::to_owned)
}

/// ngrok logs JSON objects; the started tunnel carries a `url` field.
fn scan_ngrok(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    value
        .get("url")
        .and_then(Value::as_str)
        .filter(|url| url.starts_with("https://"))
        .map(str::to_owned)
}
