//! Resource naming for clusters and their load balancers.
//!
//! Every VM, subnet, and group name derived from a cluster goes through this
//! module so that the node-number encoding has exactly one inverse.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::{AppInstKey, ClusterInstKey};

pub const MASTER_PREFIX: &str = "mex-k8s-master";
pub const NODE_PREFIX: &str = "mex-k8s-node";
pub const DOCKER_VM_PREFIX: &str = "mex-docker-vm";
pub const SUBNET_PREFIX: &str = "mex-k8s-subnet";

static NODE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^{NODE_PREFIX}-(\d+)-")).expect("static regex")
});

/// `cluster-org`, with characters the backends reject replaced.
pub fn cluster_suffix(key: &ClusterInstKey) -> String {
    sanitize(&format!("{}-{}", key.cluster_name, key.organization))
}

pub fn master_name(key: &ClusterInstKey) -> String {
    format!("{MASTER_PREFIX}-{}", cluster_suffix(key))
}

/// Name of worker `n` (1-based).
pub fn node_name(key: &ClusterInstKey, n: u32) -> String {
    format!("{NODE_PREFIX}-{n}-{}", cluster_suffix(key))
}

/// Worker number encoded in a node name, if it is one.
pub fn node_number(name: &str) -> Option<u32> {
    NODE_NUMBER
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn docker_vm_name(key: &ClusterInstKey) -> String {
    format!("{DOCKER_VM_PREFIX}-{}", cluster_suffix(key))
}

pub fn subnet_name(key: &ClusterInstKey) -> String {
    format!("{SUBNET_PREFIX}-{}", cluster_suffix(key))
}

/// VM group name for a cluster's resources.
pub fn cluster_group_name(key: &ClusterInstKey) -> String {
    cluster_suffix(key)
}

pub fn secgrp_name(group_name: &str) -> String {
    format!("{group_name}-sg")
}

/// Fully qualified name of a cluster's dedicated load balancer.
pub fn dedicated_lb_name(key: &ClusterInstKey, app_dns_root: &str) -> String {
    format!(
        "{}.{}.{app_dns_root}",
        sanitize(&key.cluster_name),
        sanitize(&key.cloudlet)
    )
}

/// VM group name for an app instance deployed as a VM.
pub fn app_vm_group_name(key: &AppInstKey) -> String {
    sanitize(&format!("{}-{}", key.app_name, key.organization))
}

/// Port a VM (or a shared LB) uses on a subnet.
pub fn internal_port_name(vm_name: &str, subnet_name: &str) -> String {
    format!("{vm_name}-{subnet_name}-port")
}

pub fn external_port_name(vm_name: &str, network_name: &str) -> String {
    format!("{vm_name}-{network_name}-port")
}

/// Lowercase, with anything outside `[a-z0-9-.]` turned into `-`.
pub fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-' | '.') => c,
            _ => '-',
        })
        .collect()
}
