//! OS-level configuration of a load balancer's internal interfaces: address,
//! forwarding, NAT, and a persistent name for the NIC.

use tracing::{debug, info, warn};

use crate::ssh::SshClient;
use crate::{Error, Result};

const UDEV_RULES_FILE: &str = "/etc/udev/rules.d/70-persistent-net.rules";
const IPTABLES_SAVE: &str = "sudo sh -c 'iptables-save > /etc/iptables/rules.v4'";

/// Name of the interface carrying `mac` in `ip -br link` output.
pub fn interface_for_mac(ip_link_output: &str, mac: &str) -> Option<String> {
    ip_link_output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let name = fields.next()?;
        let _state = fields.next()?;
        let addr = fields.next()?;
        addr.eq_ignore_ascii_case(mac)
            .then(|| name.split('@').next().unwrap_or(name).to_string())
    })
}

/// Device of the default route in `ip route show default` output.
pub fn default_route_interface(ip_route_output: &str) -> Option<String> {
    ip_route_output
        .lines()
        .filter(|l| l.starts_with("default"))
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            fields.find(|f| *f == "dev")?;
            fields.next().map(str::to_string)
        })
}

pub fn netplan_file(iface: &str) -> String {
    format!("/etc/netplan/50-{iface}.yaml")
}

fn netplan_config(iface: &str, mac: &str, addr_cidr: &str) -> String {
    format!(
        "network:\n  version: 2\n  ethernets:\n    {iface}:\n      match:\n        macaddress: {mac}\n      set-name: {iface}\n      addresses: [{addr_cidr}]\n      dhcp4: false\n"
    )
}

fn ensure_rule(table: Option<&str>, rule: &str) -> String {
    let t = table.map(|t| format!("-t {t} ")).unwrap_or_default();
    format!("sudo iptables {t}-C {rule} || sudo iptables {t}-A {rule}")
}

fn remove_rule(table: Option<&str>, rule: &str) -> String {
    let t = table.map(|t| format!("-t {t} ")).unwrap_or_default();
    format!("if sudo iptables {t}-C {rule}; then sudo iptables {t}-D {rule}; fi")
}

fn forward_rules(internal: &str, external: &str) -> [String; 2] {
    [
        format!("FORWARD -i {internal} -o {external} -j ACCEPT"),
        format!(
            "FORWARD -i {external} -o {internal} -m state --state RELATED,ESTABLISHED -j ACCEPT"
        ),
    ]
}

/// Commands that bring `iface` up with `addr_cidr` and route it out of
/// `external`. Every command is safe to re-run.
pub fn configure_commands(iface: &str, mac: &str, addr_cidr: &str, external: &str) -> Vec<String> {
    let file = netplan_file(iface);
    let mut cmds = vec![
        format!(
            "cat <<'EOF' | sudo tee {file} >/dev/null\n{}EOF",
            netplan_config(iface, mac, addr_cidr)
        ),
        "sudo netplan apply".to_string(),
        format!("sudo ip link set {iface} up"),
        "sudo sysctl -w net.ipv4.ip_forward=1".to_string(),
    ];
    cmds.extend(forward_rules(iface, external).iter().map(|r| ensure_rule(None, r)));
    cmds.push(ensure_rule(
        Some("nat"),
        &format!("POSTROUTING -o {external} -j MASQUERADE"),
    ));
    cmds.push(IPTABLES_SAVE.to_string());
    cmds.push(format!(
        "grep -qs '{mac}' {UDEV_RULES_FILE} || echo 'SUBSYSTEM==\"net\", ACTION==\"add\", ATTR{{address}}==\"{mac}\", NAME=\"{iface}\"' | sudo tee -a {UDEV_RULES_FILE} >/dev/null"
    ));
    cmds
}

/// Reverse of [`configure_commands`]. The NAT rule is shared by every
/// subnet behind the LB and stays.
pub fn unconfigure_commands(iface: &str, mac: &str, external: &str) -> Vec<String> {
    let mut cmds = vec![
        format!("sudo ip link set {iface} down || true"),
        format!("sudo rm -f {}", netplan_file(iface)),
        "sudo netplan apply".to_string(),
    ];
    cmds.extend(forward_rules(iface, external).iter().map(|r| remove_rule(None, r)));
    cmds.push(IPTABLES_SAVE.to_string());
    cmds.push(format!("sudo sed -i '/{mac}/d' {UDEV_RULES_FILE}"));
    cmds
}

async fn discover(client: &dyn SshClient, mac: &str) -> Result<(Option<String>, String)> {
    let links = client.output("ip -br link").await?;
    let iface = interface_for_mac(&links, mac);
    let routes = client.output("ip route show default").await?;
    let external = default_route_interface(&routes)
        .ok_or_else(|| Error::Ssh("no default route on load balancer".into()))?;
    Ok((iface, external))
}

/// Configure the interface with `mac` as `addr_cidr`. Returns its name.
pub async fn configure_internal_interface(
    client: &dyn SshClient,
    mac: &str,
    addr_cidr: &str,
) -> Result<String> {
    let (iface, external) = discover(client, mac).await?;
    let iface =
        iface.ok_or_else(|| Error::Ssh(format!("no interface with mac {mac} on load balancer")))?;
    for cmd in configure_commands(&iface, mac, addr_cidr, &external) {
        debug!(iface = %iface, cmd = %cmd, "configuring interface");
        client.output(&cmd).await?;
    }
    info!(iface = %iface, addr = addr_cidr, "internal interface up");
    Ok(iface)
}

/// Take down the interface with `mac`. An interface that is already gone
/// only has its persisted name removed.
pub async fn unconfigure_internal_interface(client: &dyn SshClient, mac: &str) -> Result<()> {
    let (iface, external) = discover(client, mac).await?;
    let Some(iface) = iface else {
        warn!(mac, "interface already absent");
        client
            .output(&format!("sudo sed -i '/{mac}/d' {UDEV_RULES_FILE}"))
            .await?;
        return Ok(());
    };
    for cmd in unconfigure_commands(&iface, mac, &external) {
        client.output(&cmd).await?;
    }
    info!(iface = %iface, "internal interface removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::MockSshClient;
    use std::sync::{Arc, Mutex};

    const LINKS: &str = "lo               UNKNOWN        00:00:00:00:00:00 <LOOPBACK,UP,LOWER_UP>\n\
                         ens3             UP             fa:16:3e:00:00:01 <BROADCAST,MULTICAST,UP,LOWER_UP>\n\
                         ens4             DOWN           fa:16:3e:00:00:02 <BROADCAST,MULTICAST>\n";
    const ROUTES: &str = "default via 203.0.113.254 dev ens3 proto dhcp src 203.0.113.4 metric 100\n";

    fn scripted(log: Arc<Mutex<Vec<String>>>) -> MockSshClient {
        let mut client = MockSshClient::new();
        client.expect_output().returning(move |cmd| {
            log.lock().unwrap().push(cmd.to_string());
            Ok(match cmd {
                "ip -br link" => LINKS.to_string(),
                "ip route show default" => ROUTES.to_string(),
                _ => String::new(),
            })
        });
        client
    }

    #[test]
    fn mac_lookup_is_case_insensitive() {
        assert_eq!(
            interface_for_mac(LINKS, "FA:16:3E:00:00:02").as_deref(),
            Some("ens4")
        );
        assert_eq!(interface_for_mac(LINKS, "fa:16:3e:ff:ff:ff"), None);
        assert_eq!(
            interface_for_mac("veth1@if3 UP aa:bb:cc:dd:ee:ff <UP>", "aa:bb:cc:dd:ee:ff").as_deref(),
            Some("veth1")
        );
    }

    #[test]
    fn default_route_device_is_parsed() {
        assert_eq!(default_route_interface(ROUTES).as_deref(), Some("ens3"));
        assert_eq!(default_route_interface("10.0.0.0/8 dev ens4"), None);
    }

    #[test]
    fn configure_commands_are_rerunnable() {
        let cmds = configure_commands("ens4", "fa:16:3e:00:00:02", "10.101.3.1/24", "ens3");
        assert!(cmds[0].contains("addresses: [10.101.3.1/24]"));
        assert!(cmds[0].contains("sudo tee /etc/netplan/50-ens4.yaml"));
        for cmd in cmds.iter().filter(|c| c.contains("iptables ") && !c.contains("iptables-save")) {
            assert!(cmd.contains(" -C ") && cmd.contains(" -A "), "{cmd}");
        }
        assert!(cmds.last().unwrap().starts_with("grep -qs"));
    }

    #[tokio::test]
    async fn configure_discovers_interface_by_mac() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let client = scripted(log.clone());
        let iface = configure_internal_interface(&client, "fa:16:3e:00:00:02", "10.101.3.1/24")
            .await
            .unwrap();
        assert_eq!(iface, "ens4");
        let log = log.lock().unwrap();
        assert!(log.iter().any(|c| c == "sudo ip link set ens4 up"));
        assert!(
            log.iter()
                .any(|c| c.contains("FORWARD -i ens4 -o ens3 -j ACCEPT"))
        );
    }

    #[tokio::test]
    async fn configure_fails_when_mac_is_unknown() {
        let client = scripted(Arc::new(Mutex::new(Vec::new())));
        let err = configure_internal_interface(&client, "fa:16:3e:ff:ff:ff", "10.101.3.1/24")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Ssh(_)));
    }

    #[tokio::test]
    async fn unconfigure_tolerates_missing_interface() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let client = scripted(log.clone());
        unconfigure_internal_interface(&client, "fa:16:3e:ff:ff:ff")
            .await
            .unwrap();
        let log = log.lock().unwrap();
        assert_eq!(
            log.last().unwrap(),
            &format!("sudo sed -i '/fa:16:3e:ff:ff:ff/d' {UDEV_RULES_FILE}")
        );
        assert!(!log.iter().any(|c| c.contains("netplan")));
    }

    #[tokio::test]
    async fn unconfigure_removes_forwarding_but_keeps_nat() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let client = scripted(log.clone());
        unconfigure_internal_interface(&client, "fa:16:3e:00:00:02")
            .await
            .unwrap();
        let log = log.lock().unwrap();
        assert!(log.iter().any(|c| c.contains("-D FORWARD -i ens4")));
        assert!(!log.iter().any(|c| c.contains("MASQUERADE")));
    }
}
