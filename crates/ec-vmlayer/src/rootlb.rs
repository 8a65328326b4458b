//! Root load balancers: the shared LB of the cloudlet and the dedicated LB
//! of each cluster that asks for one.

use std::collections::HashMap;
use std::net::IpAddr;

use ec_infra::VmProvider;
use ec_infra::types::{ActionType, NEXT_AVAILABLE, ServerIp, SubnetOrchestrationParams};
use ipnetwork::Ipv4Network;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::compiler::external_port_network;
use crate::config::PlatformConfig;
use crate::interfaces;
use crate::names;
use crate::platform::VmPlatform;
use crate::progress::{UpdateCallback, UpdateKind};
use crate::readiness::TimeoutBudget;
use crate::security::{self, LB_PORTS_LABEL};
use crate::ssh::SshClient;
use crate::{Error, Result};

/// Serializes interface changes on load balancers and caches their
/// external addresses.
pub struct RootLbManager {
    shared_lb_name: String,
    shared_lock: Mutex<()>,
    ip_cache: RwLock<HashMap<String, ServerIp>>,
}

impl RootLbManager {
    pub fn new(shared_lb_name: impl Into<String>) -> Self {
        Self {
            shared_lb_name: shared_lb_name.into(),
            shared_lock: Mutex::new(()),
            ip_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared_lb_name(&self) -> &str {
        &self.shared_lb_name
    }

    /// Held for the whole of an interface attach or detach on the shared
    /// LB. Dedicated LBs are only changed by their own cluster's operations
    /// and get `None`.
    pub async fn lock_if_shared(&self, lb_name: &str) -> Option<MutexGuard<'_, ()>> {
        if lb_name == self.shared_lb_name() {
            Some(self.shared_lock.lock().await)
        } else {
            None
        }
    }

    pub async fn invalidate(&self, lb_name: &str) {
        self.ip_cache.write().await.remove(lb_name);
    }

    pub async fn cached_ip(&self, lb_name: &str) -> Option<ServerIp> {
        self.ip_cache.read().await.get(lb_name).cloned()
    }

    /// External address of a load balancer, translated through the
    /// cloudlet's address map when the provider requires it.
    pub async fn external_ip(
        &self,
        provider: &dyn VmProvider,
        config: &PlatformConfig,
        lb_name: &str,
    ) -> Result<ServerIp> {
        if let Some(ip) = self.cached_ip(lb_name).await {
            return Ok(ip);
        }
        let scheme = config.parsed_network_scheme()?;
        let network = external_port_network(config, &scheme);
        let detail = provider.get_server_detail(lb_name).await?;
        let mut ip = detail
            .ip_on_network(&network)
            .cloned()
            .ok_or_else(|| Error::Lookup(format!("{lb_name} has no address on {network}")))?;

        if provider.requires_external_ip_mapping() {
            let mapped = config.external_ip_map.get(&ip.external_addr).ok_or_else(|| {
                Error::Config(format!(
                    "no external mapping for {} of {lb_name}",
                    ip.external_addr
                ))
            })?;
            ip.external_addr = mapped.clone();
        }
        self.ip_cache
            .write()
            .await
            .insert(lb_name.to_string(), ip.clone());
        Ok(ip)
    }
}

/// Address of the machine this process runs on, as the internet sees it.
pub async fn public_ip(http: &reqwest::Client, url: &str) -> Result<String> {
    let body = http.get(url).send().await?.error_for_status()?.text().await?;
    let addr = body.trim();
    addr.parse::<IpAddr>()
        .map_err(|_| Error::Lookup(format!("{url} returned {addr:?}, not an address")))?;
    Ok(addr.to_string())
}

/// Gateway address and prefix length of a populated subnet.
pub fn gateway_cidr(subnet: &SubnetOrchestrationParams) -> Result<(String, u8)> {
    let net: Ipv4Network = subnet
        .cidr
        .parse()
        .map_err(|e| Error::Config(format!("subnet {} cidr {:?}: {e}", subnet.name, subnet.cidr)))?;
    let gateway = if subnet.gateway_ip.is_empty() || subnet.gateway_ip == NEXT_AVAILABLE {
        net.nth(1)
            .ok_or_else(|| Error::Config(format!("subnet {} has no host addresses", subnet.name)))?
            .to_string()
    } else {
        subnet.gateway_ip.clone()
    };
    Ok((gateway, net.prefix()))
}

impl VmPlatform {
    /// Bring a load balancer into service. Safe to repeat on an LB that is
    /// already set up.
    pub async fn setup_root_lb(
        &self,
        lb_name: &str,
        secgrp_name: &str,
        progress: &UpdateCallback,
    ) -> Result<()> {
        progress(UpdateKind::Task, &format!("Setting up root LB {lb_name}"));
        self.root_lb.invalidate(lb_name).await;

        let ip = self
            .root_lb
            .external_ip(&*self.provider, &self.config, lb_name)
            .await
            .map_err(|e| Error::phase("resolve root LB address", e))?;

        let operator_ip = match public_ip(&self.http, &self.config.public_ip_url).await {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!(lb = lb_name, error = %e, "could not determine own public address");
                None
            }
        };
        security::seed_ssh_access(
            &*self.provider,
            secgrp_name,
            lb_name,
            operator_ip.as_deref(),
            Some(ip.external_addr.as_str()),
        )
        .await
        .map_err(|e| Error::phase("open ssh access", e))?;

        let client = self
            .wait_root_lb_reachable(lb_name, progress)
            .await
            .map_err(|e| Error::phase("wait for root LB", e))?;

        if self.config.skip_install_resource_tracker {
            debug!(lb = lb_name, "skipping resource tracker install");
        } else {
            client
                .output(&self.config.resource_tracker_install_cmd)
                .await
                .map_err(|e| Error::phase("install resource tracker", e))?;
        }

        self.add_static_route(&*client)
            .await
            .map_err(|e| Error::phase("add static route", e))?;

        let rules: Vec<_> = self
            .config
            .exposed_lb_ports
            .iter()
            .map(|p| p.to_ingress_rule("0.0.0.0/0"))
            .collect();
        security::reconcile_rules(&*self.provider, secgrp_name, lb_name, LB_PORTS_LABEL, &rules)
            .await
            .map_err(|e| Error::phase("whitelist load balancer ports", e))?;

        self.dns
            .activate_a_record(lb_name, &ip.external_addr)
            .await
            .map_err(|e| Error::phase("activate DNS record", e))?;

        self.provider
            .prepare_root_lb(lb_name)
            .await
            .map_err(|e| Error::phase("prepare root LB", e))?;

        info!(lb = lb_name, addr = %ip.external_addr, "root LB ready");
        Ok(())
    }

    async fn wait_root_lb_reachable(
        &self,
        lb_name: &str,
        progress: &UpdateCallback,
    ) -> Result<std::sync::Arc<dyn SshClient>> {
        let budget = TimeoutBudget::new(self.config.root_lb_ready_timeout);
        let mut last_status = String::new();
        loop {
            let detail = self.provider.get_server_detail(lb_name).await?;
            if detail.is_active() {
                let client = self.root_lb_client(lb_name).await?;
                match client.output("echo ok").await {
                    Ok(_) => return Ok(client),
                    Err(e) => debug!(lb = lb_name, error = %e, "root LB not reachable yet"),
                }
            } else if detail.status != last_status {
                progress(
                    UpdateKind::Step,
                    &format!("{lb_name} is {}", detail.status),
                );
                last_status = detail.status.clone();
            }
            if budget.is_exhausted() {
                return Err(Error::NotReady(format!(
                    "{lb_name} not reachable within {:?}",
                    self.config.root_lb_ready_timeout
                )));
            }
            tokio::time::sleep(self.config.root_lb_poll_interval.min(budget.remaining())).await;
        }
    }

    /// With an external router, route every cluster subnet via the router.
    /// Without one, each subnet is reached through its attached interface.
    async fn add_static_route(&self, client: &dyn SshClient) -> Result<()> {
        let Some(router) = &self.config.external_router else {
            return Ok(());
        };
        let gateway = self.provider.get_router_gateway_ip(router).await?;
        let supernet = self.config.parsed_network_scheme()?.supernet()?;
        client
            .output(&format!("sudo ip route replace {supernet} via {gateway}"))
            .await?;
        info!(route = %supernet, via = %gateway, "static route added");
        Ok(())
    }

    /// Give a load balancer an interface on `subnet` at the subnet's gateway
    /// address and route the subnet through it.
    pub async fn attach_and_enable_root_lb_interface(
        &self,
        lb_name: &str,
        attach_port: bool,
        subnet: &SubnetOrchestrationParams,
        action: ActionType,
    ) -> Result<()> {
        let _guard = self.root_lb.lock_if_shared(lb_name).await;
        let port_name = names::internal_port_name(lb_name, &subnet.name);
        let (gateway, prefix) = gateway_cidr(subnet)?;

        if attach_port {
            self.provider
                .attach_port_to_server(lb_name, &subnet.name, &port_name, &gateway, action)
                .await?;
        }
        let detail = self.provider.get_server_detail(lb_name).await?;
        let mac = detail
            .ip_on_port(&port_name)
            .or_else(|| detail.ip_on_subnet(&subnet.name))
            .map(|ip| ip.mac_address.clone())
            .ok_or_else(|| Error::Lookup(format!("{lb_name} has no port on {}", subnet.name)))?;

        let client = self.root_lb_client(lb_name).await?;
        interfaces::configure_internal_interface(&*client, &mac, &format!("{gateway}/{prefix}"))
            .await?;
        info!(lb = lb_name, subnet = %subnet.name, gateway = %gateway, "root LB interface attached");
        Ok(())
    }

    /// Undo [`attach_and_enable_root_lb_interface`](Self::attach_and_enable_root_lb_interface).
    /// A load balancer or port that no longer exists counts as detached.
    pub async fn detach_and_disable_root_lb_interface(
        &self,
        lb_name: &str,
        subnet_name: &str,
    ) -> Result<()> {
        let _guard = self.root_lb.lock_if_shared(lb_name).await;
        let port_name = names::internal_port_name(lb_name, subnet_name);

        let detail = match self.provider.get_server_detail(lb_name).await {
            Ok(d) => d,
            Err(e) if e.is_server_not_found() => {
                warn!(lb = lb_name, "root LB already gone, nothing to detach");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut disable_err = None;
        match detail.ip_on_port(&port_name) {
            Some(ip) => {
                let disabled = match self.root_lb_client(lb_name).await {
                    Ok(client) => {
                        interfaces::unconfigure_internal_interface(&*client, &ip.mac_address).await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = disabled {
                    warn!(lb = lb_name, error = %e, "could not disable interface, detaching port anyway");
                    disable_err = Some(e);
                }
            }
            None => debug!(lb = lb_name, port = %port_name, "no interface to disable"),
        }

        match self
            .provider
            .detach_port_from_server(lb_name, subnet_name, &port_name)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_server_not_found() => {
                warn!(lb = lb_name, "root LB vanished during detach");
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(e) = disable_err {
            return Err(e);
        }
        info!(lb = lb_name, subnet = subnet_name, "root LB interface detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress;
    use crate::testutil::{self, SHARED_LB};
    use ec_infra::fake::FakeProvider;
    use std::time::Duration;

    fn subnet(cidr: &str, gateway: &str) -> SubnetOrchestrationParams {
        SubnetOrchestrationParams {
            name: "mex-k8s-subnet-c1-acme".into(),
            id: String::new(),
            network_name: "mex-k8s-net-1".into(),
            cidr: cidr.into(),
            cidr_pattern: "10.101.X.0/24".into(),
            gateway_ip: gateway.into(),
            skip_gateway: gateway.is_empty(),
            dhcp_enabled: true,
            dns_servers: vec![],
        }
    }

    #[test]
    fn gateway_defaults_to_first_host() {
        assert_eq!(
            gateway_cidr(&subnet("10.101.4.0/24", "")).unwrap(),
            ("10.101.4.1".to_string(), 24)
        );
        assert_eq!(
            gateway_cidr(&subnet("10.101.4.0/24", "10.101.4.254")).unwrap(),
            ("10.101.4.254".to_string(), 24)
        );
        assert!(gateway_cidr(&subnet(NEXT_AVAILABLE, NEXT_AVAILABLE)).is_err());
    }

    #[tokio::test]
    async fn external_ip_is_cached_until_invalidated() {
        let provider = FakeProvider::new();
        testutil::add_shared_lb(&provider).await;
        let config = PlatformConfig::for_cloudlet("hamburg");
        let manager = RootLbManager::new(SHARED_LB);

        let ip = manager.external_ip(&provider, &config, SHARED_LB).await.unwrap();
        assert_eq!(ip.external_addr, testutil::SHARED_LB_ADDR);
        manager.external_ip(&provider, &config, SHARED_LB).await.unwrap();
        let lookups = |calls: Vec<String>| {
            calls
                .iter()
                .filter(|c| c.starts_with("get_server_detail"))
                .count()
        };
        assert_eq!(lookups(provider.calls().await), 1);

        manager.invalidate(SHARED_LB).await;
        manager.external_ip(&provider, &config, SHARED_LB).await.unwrap();
        assert_eq!(lookups(provider.calls().await), 2);
    }

    #[tokio::test]
    async fn unmapped_external_address_is_rejected() {
        let provider = FakeProvider::new().with_external_ip_mapping();
        testutil::add_shared_lb(&provider).await;
        let mut config = PlatformConfig::for_cloudlet("hamburg");
        let manager = RootLbManager::new(SHARED_LB);
        assert!(matches!(
            manager.external_ip(&provider, &config, SHARED_LB).await,
            Err(Error::Config(_))
        ));

        config
            .external_ip_map
            .insert(testutil::SHARED_LB_ADDR.into(), "198.51.100.10".into());
        let ip = manager.external_ip(&provider, &config, SHARED_LB).await.unwrap();
        assert_eq!(ip.external_addr, "198.51.100.10");
    }

    #[tokio::test]
    async fn setup_runs_every_step_and_publishes_dns() {
        let h = testutil::harness().await;
        h.platform
            .setup_root_lb(SHARED_LB, "shared-sg", &progress::noop())
            .await
            .unwrap();

        assert_eq!(
            h.dns.lookup(SHARED_LB).await.as_deref(),
            Some(testutil::SHARED_LB_ADDR)
        );
        assert_eq!(h.provider.rules("shared-sg", LB_PORTS_LABEL).await.len(), 1);
        assert!(!h.provider.rules("shared-sg", &security::ssh_label(SHARED_LB)).await.is_empty());
        let cmds = h.ssh.commands_on(testutil::SHARED_LB_ADDR);
        assert!(cmds.iter().any(|c| c == "echo ok"));
        assert!(cmds.iter().any(|c| c.contains("resource-tracker")));
        // no router, so no static route
        assert!(!cmds.iter().any(|c| c.contains("ip route replace")));
        assert!(h.provider.calls().await.contains(&format!("prepare_root_lb:{SHARED_LB}")));

        // a second run changes nothing
        h.platform
            .setup_root_lb(SHARED_LB, "shared-sg", &progress::noop())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn router_mode_routes_supernet_via_router() {
        let h = testutil::harness_with(|config, provider| {
            config.external_router = Some("ext-router".into());
            provider.with_router_gateway("10.101.0.1")
        })
        .await;
        h.platform
            .setup_root_lb(SHARED_LB, "shared-sg", &progress::noop())
            .await
            .unwrap();
        assert!(
            h.ssh
                .commands_on(testutil::SHARED_LB_ADDR)
                .contains(&"sudo ip route replace 10.101.0.0/16 via 10.101.0.1".to_string())
        );
    }

    #[tokio::test]
    async fn setup_failure_names_the_phase() {
        let h = testutil::harness().await;
        h.ssh.fail("sudo apt-get install");
        let err = h
            .platform
            .setup_root_lb(SHARED_LB, "shared-sg", &progress::noop())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("install resource tracker: "), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_lb_times_out() {
        let h = testutil::harness().await;
        h.ssh.fail("echo ok");
        let err = h
            .platform
            .setup_root_lb(SHARED_LB, "shared-sg", &progress::noop())
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::NotReady(_)), "{err}");
    }

    #[tokio::test]
    async fn attach_then_detach_shared_interface() {
        let h = testutil::harness().await;
        let subnet = subnet("10.101.4.0/24", "10.101.4.1");
        h.platform
            .attach_and_enable_root_lb_interface(SHARED_LB, true, &subnet, ActionType::Create)
            .await
            .unwrap();
        let detail = h.provider.servers().await;
        let lb = detail.iter().find(|d| d.name == SHARED_LB).unwrap();
        assert_eq!(lb.ip_on_subnet(&subnet.name).unwrap().internal_addr, "10.101.4.1");
        assert!(
            h.ssh
                .commands_on(testutil::SHARED_LB_ADDR)
                .iter()
                .any(|c| c.contains("addresses: [10.101.4.1/24]"))
        );

        h.platform
            .detach_and_disable_root_lb_interface(SHARED_LB, &subnet.name)
            .await
            .unwrap();
        let detail = h.provider.servers().await;
        let lb = detail.iter().find(|d| d.name == SHARED_LB).unwrap();
        assert!(lb.ip_on_subnet(&subnet.name).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lb_that_answers_at_the_deadline_is_accepted() {
        let h = testutil::harness_with(|config, provider| {
            config.root_lb_poll_interval = Duration::from_secs(7);
            config.public_ip_url = String::new();
            provider
        })
        .await;
        h.provider.set_server_status(SHARED_LB, "BUILD").await;
        let platform = h.platform.clone();
        let setup = tokio::spawn(async move {
            platform
                .setup_root_lb(SHARED_LB, "shared-sg", &progress::noop())
                .await
        });
        tokio::time::sleep(Duration::from_secs(58)).await;
        h.provider.set_server_status(SHARED_LB, "ACTIVE").await;
        setup.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dedicated_lb_changes_skip_the_shared_lock() {
        let h = testutil::harness().await;
        let held = h.platform.root_lb().lock_if_shared(SHARED_LB).await;
        assert!(held.is_some());
        assert!(
            h.platform
                .root_lb()
                .lock_if_shared("c1.hamburg.edge.local")
                .await
                .is_none()
        );
        let detach = h
            .platform
            .detach_and_disable_root_lb_interface("c1.hamburg.edge.local", "s");
        tokio::time::timeout(Duration::from_secs(5), detach)
            .await
            .expect("detach waited on the shared LB lock")
            .unwrap();
    }

    #[tokio::test]
    async fn detach_from_missing_lb_is_a_no_op() {
        let h = testutil::harness().await;
        h.platform
            .detach_and_disable_root_lb_interface("gone.hamburg.edge.local", "s")
            .await
            .unwrap();
    }
}
