use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info};

use crate::ssh::SshClient;
use crate::{Error, Result};

/// Run the driver install commands on every node in parallel. The first
/// failure, or running past `timeout`, abandons the remaining installs.
pub async fn install_gpu_drivers(
    nodes: Vec<(String, Arc<dyn SshClient>)>,
    cmds: &[String],
    timeout: Duration,
) -> Result<()> {
    let mut set = JoinSet::new();
    for (node, client) in nodes {
        let cmds = cmds.to_vec();
        set.spawn(async move {
            for cmd in &cmds {
                client
                    .output(cmd)
                    .await
                    .map_err(|e| Error::Ssh(format!("gpu driver install on {node}: {e}")))?;
            }
            info!(node = %node, "gpu drivers installed");
            Ok::<_, Error>(())
        });
    }

    let wait_all = async {
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(Error::Fatal(format!("gpu install task failed: {e}"))),
            }
        }
        Ok(())
    };
    let result = match tokio::time::timeout(timeout, wait_all).await {
        Ok(result) => result,
        Err(_) => Err(Error::NotReady(format!(
            "gpu driver install did not finish within {timeout:?}"
        ))),
    };
    if let Err(e) = &result {
        error!(error = %e, "gpu driver install abandoned");
        set.abort_all();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::MockSshClient;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok_client(counter: Arc<AtomicUsize>) -> Arc<dyn SshClient> {
        let mut client = MockSshClient::new();
        client.expect_output().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(String::new())
        });
        Arc::new(client)
    }

    fn cmds() -> Vec<String> {
        vec!["sudo apt-get update".into(), "sudo apt-get install -y nvidia".into()]
    }

    #[tokio::test]
    async fn every_node_runs_every_command() {
        let counter = Arc::new(AtomicUsize::new(0));
        let nodes = (1..=3)
            .map(|i| (format!("node-{i}"), ok_client(counter.clone())))
            .collect();
        install_gpu_drivers(nodes, &cmds(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn first_failure_is_returned() {
        let mut bad = MockSshClient::new();
        bad.expect_output()
            .returning(|_| Err(Error::Ssh("dpkg lock held".into())));
        let nodes = vec![
            ("node-1".to_string(), ok_client(Arc::new(AtomicUsize::new(0)))),
            ("node-2".to_string(), Arc::new(bad) as Arc<dyn SshClient>),
        ];
        let err = install_gpu_drivers(nodes, &cmds(), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("node-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_installs_time_out() {
        struct Hanging;

        #[async_trait::async_trait]
        impl SshClient for Hanging {
            async fn output(&self, _cmd: &str) -> Result<String> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(String::new())
            }

            fn add_hop(&self, _host: &str, _port: u16) -> Result<Arc<dyn SshClient>> {
                Ok(Arc::new(Hanging))
            }
        }

        let nodes = vec![("node-1".to_string(), Arc::new(Hanging) as Arc<dyn SshClient>)];
        let err = install_gpu_drivers(nodes, &cmds(), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
    }
}
