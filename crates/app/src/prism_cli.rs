use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use tokio::process::Command;
use tracing::{debug, info};

/// Thin wrapper around the `prism` executable for auth-related commands.
#[derive(Debug, Clone)]
pub struct PrismCli {
    binary: String,
}

impl PrismCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn resolve(&self) -> Result<PathBuf> {
        which::which(&self.binary)
            .with_context(|| format!("prism cli '{}' not found on PATH", self.binary))
    }

    pub async fn login(&self, service_url: &str) -> Result<()> {
        self.run(service_url, &["login"]).await?;
        info!(%service_url, "prism login completed");
        Ok(())
    }

    pub async fn logout(&self, service_url: &str) -> Result<()> {
        self.run(service_url, &["logout"]).await?;
        info!(%service_url, "prism logout completed");
        Ok(())
    }

    pub async fn access_token(&self, service_url: &str) -> Result<String> {
        self.run(service_url, &["me:token"]).await
    }

    pub async fn refresh_token(&self, service_url: &str) -> Result<String> {
        self.run(service_url, &["me:token", "--type", "refresh"])
            .await
    }

    async fn run(&self, service_url: &str, args: &[&str]) -> Result<String> {
        let binary = self.resolve()?;
        debug!(binary = %binary.display(), ?args, "running prism cli");
        let output = Command::new(&binary)
            .args(args)
            .env("PRISMATIC_URL", service_url)
            .output()
            .await
            .with_context(|| format!("failed to execute {}", binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "prism {:?} failed (code {:?}): {}",
                args,
                output.status.code(),
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if args.first() == Some(&"me:token") && stdout.is_empty() {
            return Err(anyhow!("prism {:?} printed no token", args));
        }
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let cli = PrismCli::new("prism-binary-that-does-not-exist");
        let err = cli
            .access_token("https://app.prismatic.io")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found on PATH"));
    }
}
