//! Kubernetes cluster readiness polling and the deadline budget shared by
//! the phases of a lifecycle operation.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use ec_infra::VmProvider;
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::progress::{UpdateCallback, UpdateKind};
use crate::ssh::SshClient;
use crate::{Error, Result};

pub const GET_NODES_CMD: &str = "kubectl get nodes --no-headers";

static NODE_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\S+\s+(Ready|NotReady)(?:,\S+)?\s").expect("static regex")
});

/// Deadline for an operation, drawn down by each phase in turn.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutBudget {
    start: Instant,
    total: Duration,
}

impl TimeoutBudget {
    pub fn new(total: Duration) -> Self {
        Self {
            start: Instant::now(),
            total,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// What is left of the total, never negative.
    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.elapsed())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCounts {
    pub ready: u32,
    pub not_ready: u32,
}

/// Count nodes by status in `kubectl get nodes` output. Header and
/// unrecognized lines are ignored.
pub fn count_nodes(output: &str) -> NodeCounts {
    let mut counts = NodeCounts::default();
    for line in output.lines() {
        let Some(caps) = NODE_STATUS.captures(line) else {
            continue;
        };
        match &caps[1] {
            "Ready" => counts.ready += 1,
            _ => counts.not_ready += 1,
        }
    }
    counts
}

/// Where to find a cluster's master and how many nodes make it ready.
pub struct ReadinessTarget<'a> {
    pub master_name: &'a str,
    pub subnet_name: &'a str,
    /// Workers plus masters.
    pub expected_nodes: u32,
}

/// Resolve the master's internal address and open a client to it through
/// the load balancer.
pub async fn master_client(
    provider: &dyn VmProvider,
    lb_client: &dyn SshClient,
    master_name: &str,
    subnet_name: &str,
) -> Result<Arc<dyn SshClient>> {
    let detail = provider.get_server_detail(master_name).await?;
    let ip = detail.ip_on_subnet(subnet_name).ok_or_else(|| {
        Error::NotReady(format!("{master_name} has no address on {subnet_name} yet"))
    })?;
    lb_client.add_hop(&ip.internal_addr, 22)
}

/// Poll the master until enough nodes report `Ready` or `timeout` passes.
/// The last sleep is cut short so one poll lands on the deadline. Returns the
/// master client for follow-up commands.
pub async fn wait_cluster_ready(
    provider: &dyn VmProvider,
    lb_client: &dyn SshClient,
    target: &ReadinessTarget<'_>,
    poll_interval: Duration,
    timeout: Duration,
    progress: &UpdateCallback,
) -> Result<Arc<dyn SshClient>> {
    let budget = TimeoutBudget::new(timeout);
    let mut master: Option<Arc<dyn SshClient>> = None;
    let mut last = None;

    loop {
        if master.is_none() {
            match master_client(provider, lb_client, target.master_name, target.subnet_name).await
            {
                Ok(client) => master = Some(client),
                Err(e) => debug!(master = target.master_name, error = %e, "master not reachable yet"),
            }
        }

        if let Some(client) = &master {
            match client.output(GET_NODES_CMD).await {
                Ok(out) => {
                    let counts = count_nodes(&out);
                    if last != Some(counts) {
                        progress(
                            UpdateKind::Step,
                            &format!("{} of {} nodes active", counts.ready, target.expected_nodes),
                        );
                        last = Some(counts);
                    }
                    if counts.ready >= target.expected_nodes {
                        info!(master = target.master_name, nodes = counts.ready, "cluster ready");
                        return Ok(client.clone());
                    }
                }
                Err(e) => debug!(master = target.master_name, error = %e, "kubectl not answering yet"),
            }
        }

        if budget.is_exhausted() {
            let ready = last.map(|c| c.ready).unwrap_or(0);
            return Err(Error::NotReady(format!(
                "cluster {} not ready after {timeout:?}: {ready} of {} nodes active",
                target.master_name, target.expected_nodes
            )));
        }
        tokio::time::sleep(poll_interval.min(budget.remaining())).await;
    }
}
