//! Firewall rule derivation and idempotent reconciliation against the
//! provider's security groups.

use ec_infra::VmProvider;
use ec_infra::types::{ActionType, Protocol, SecurityRule};
use tracing::{debug, info, warn};

use crate::Result;
use crate::model::{PrivacyPolicy, TrustPolicy};

/// Label for the rules opening the exposed LB ports.
pub const LB_PORTS_LABEL: &str = "rootlb-ports";

/// Label under which a server's SSH access rules live.
pub fn ssh_label(server_name: &str) -> String {
    format!("{server_name}-ssh")
}

pub fn privacy_policy_label(server_name: &str) -> String {
    format!("{server_name}-privacy-policy")
}

/// Outbound rules for a restricted policy. An empty list means nothing is
/// restricted after all, which is spelled out as an explicit allow-all rule.
pub fn egress_rules(outbound: &[SecurityRule]) -> Vec<SecurityRule> {
    if outbound.is_empty() {
        vec![SecurityRule::allow_all_egress()]
    } else {
        outbound.to_vec()
    }
}

fn same_rules(a: &[SecurityRule], b: &[SecurityRule]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    a.dedup();
    b.sort();
    b.dedup();
    a == b
}

/// Make the rules under `label` equal `desired`, replacing the whole label
/// (remove, then add) when they differ. Returns whether anything changed.
pub async fn reconcile_rules(
    provider: &dyn VmProvider,
    secgrp_name: &str,
    server_name: &str,
    label: &str,
    desired: &[SecurityRule],
) -> Result<bool> {
    let current = provider.get_security_rules(secgrp_name, label).await?;
    if same_rules(&current, desired) {
        debug!(secgrp = secgrp_name, label, "security rules already in place");
        return Ok(false);
    }
    provider
        .remove_whitelist_security_rules(secgrp_name, server_name, label)
        .await?;
    if !desired.is_empty() {
        provider
            .whitelist_security_rules(secgrp_name, server_name, label, desired)
            .await?;
    }
    info!(
        secgrp = secgrp_name,
        label,
        rules = desired.len(),
        "security rules replaced"
    );
    Ok(true)
}

/// Open SSH to a server from the operator's address and, when given, from the
/// server's own external address.
pub async fn seed_ssh_access(
    provider: &dyn VmProvider,
    secgrp_name: &str,
    server_name: &str,
    operator_ip: Option<&str>,
    server_external_ip: Option<&str>,
) -> Result<()> {
    let rules: Vec<SecurityRule> = [operator_ip, server_external_ip]
        .into_iter()
        .flatten()
        .filter(|ip| !ip.is_empty())
        .map(|ip| SecurityRule::ingress(Protocol::Tcp, 22, 22, format!("{ip}/32")))
        .collect();
    if rules.is_empty() {
        warn!(server = server_name, "no address known to allow ssh from");
        return Ok(());
    }
    reconcile_rules(
        provider,
        secgrp_name,
        server_name,
        &ssh_label(server_name),
        &rules,
    )
    .await?;
    Ok(())
}

/// Apply a cluster privacy policy's egress rules to the cluster's group.
/// Without a policy the label is cleared.
pub async fn apply_privacy_policy(
    provider: &dyn VmProvider,
    secgrp_name: &str,
    server_name: &str,
    policy: Option<&PrivacyPolicy>,
) -> Result<bool> {
    let desired = policy
        .map(|p| egress_rules(&p.outbound_security_rules))
        .unwrap_or_default();
    reconcile_rules(
        provider,
        secgrp_name,
        server_name,
        &privacy_policy_label(server_name),
        &desired,
    )
    .await
}

/// Apply the cloudlet trust policy to the cloudlet security group.
pub async fn configure_cloudlet_security(
    provider: &dyn VmProvider,
    cloudlet_secgrp_name: &str,
    trust_policy: Option<&TrustPolicy>,
    action: ActionType,
) -> Result<()> {
    let restricted = trust_policy.is_some();
    let rules = trust_policy
        .map(|p| egress_rules(&p.outbound_security_rules))
        .unwrap_or_default();
    provider
        .configure_cloudlet_security_rules(cloudlet_secgrp_name, restricted, &rules, action)
        .await?;
    info!(
        secgrp = cloudlet_secgrp_name,
        policy = trust_policy.map(|p| p.name.as_str()).unwrap_or("none"),
        ?action,
        "cloudlet security rules configured"
    );
    Ok(())
}
