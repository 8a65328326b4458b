use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

/// Remote command execution on a server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SshClient: Send + Sync {
    /// Run `cmd` and return its stdout. Non-zero exit is an error carrying
    /// the command's output.
    async fn output(&self, cmd: &str) -> Result<String>;

    /// A client for `host:port` reached through this one.
    fn add_hop(&self, host: &str, port: u16) -> Result<Arc<dyn SshClient>>;
}

/// Opens clients to servers by address.
#[cfg_attr(test, automock)]
pub trait SshConnector: Send + Sync {
    fn connect(&self, host: &str) -> Result<Arc<dyn SshClient>>;
}

/// Client that shells out to the system `ssh` binary, chaining bastion hops
/// with `-J`.
#[derive(Debug, Clone)]
pub struct CommandSshClient {
    user: String,
    key_path: PathBuf,
    connect_timeout: Duration,
    /// Bastion `host:port` pairs, outermost first.
    bastions: Vec<(String, u16)>,
    target: (String, u16),
}

impl CommandSshClient {
    pub fn new(user: impl Into<String>, key_path: impl Into<PathBuf>, host: &str) -> Self {
        Self {
            user: user.into(),
            key_path: key_path.into(),
            connect_timeout: Duration::from_secs(10),
            bastions: Vec::new(),
            target: (host.to_string(), 22),
        }
    }

    fn args(&self, cmd: &str) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "-o".into(),
            "BatchMode=yes".into(),
        ];
        if !self.bastions.is_empty() {
            let jumps: Vec<String> = self
                .bastions
                .iter()
                .map(|(h, p)| format!("{}@{h}:{p}", self.user))
                .collect();
            args.push("-J".into());
            args.push(jumps.join(","));
        }
        args.push("-p".into());
        args.push(self.target.1.to_string());
        args.push(format!("{}@{}", self.user, self.target.0));
        args.push(cmd.to_string());
        args
    }
}

#[async_trait]
impl SshClient for CommandSshClient {
    async fn output(&self, cmd: &str) -> Result<String> {
        let target = self.target.0.as_str();
        debug!(host = target, cmd, "ssh: running command");
        let out = Command::new("ssh").args(self.args(cmd)).output().await?;
        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(Error::Ssh(format!(
                "{cmd:?} on {target} failed ({}): {stderr}{stdout}",
                out.status
            )));
        }
        Ok(stdout)
    }

    fn add_hop(&self, host: &str, port: u16) -> Result<Arc<dyn SshClient>> {
        let mut next = self.clone();
        let previous = std::mem::replace(&mut next.target, (host.to_string(), port));
        next.bastions.push(previous);
        Ok(Arc::new(next))
    }
}

/// Connector producing [`CommandSshClient`]s with a shared user and key.
#[derive(Debug, Clone)]
pub struct CommandSshConnector {
    user: String,
    key_path: PathBuf,
}

impl CommandSshConnector {
    pub fn new(user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            key_path: key_path.into(),
        }
    }
}

impl SshConnector for CommandSshConnector {
    fn connect(&self, host: &str) -> Result<Arc<dyn SshClient>> {
        if host.is_empty() {
            return Err(Error::Ssh("cannot connect to an empty address".into()));
        }
        Ok(Arc::new(CommandSshClient::new(
            self.user.clone(),
            self.key_path.clone(),
            host,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_client_targets_host_without_jump() {
        let client = CommandSshClient::new("ubuntu", "/keys/id", "203.0.113.4");
        let args = client.args("uptime");
        assert!(!args.contains(&"-J".to_string()));
        assert_eq!(args[args.len() - 2], "ubuntu@203.0.113.4");
        assert_eq!(args.last().unwrap(), "uptime");
    }

    #[test]
    fn hops_become_jump_hosts() {
        let client = CommandSshClient::new("ubuntu", "/keys/id", "203.0.113.4");
        let mut hopped = client.clone();
        let previous = std::mem::replace(&mut hopped.target, ("10.101.1.10".into(), 22));
        hopped.bastions.push(previous);
        let args = hopped.args("kubectl get nodes");
        let j = args.iter().position(|a| a == "-J").unwrap();
        assert_eq!(args[j + 1], "ubuntu@203.0.113.4:22");
        assert_eq!(args[args.len() - 2], "ubuntu@10.101.1.10");
    }

    #[test]
    fn connector_rejects_empty_address() {
        let connector = CommandSshConnector::new("ubuntu", "/keys/id");
        assert!(connector.connect("").is_err());
        assert!(connector.connect("203.0.113.4").is_ok());
    }
}
