use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use ec_infra::types::SHARED_VOLUME_DEVICE;

/// Bootstrap server registration for a VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChefParams {
    pub node_name: String,
    pub server_path: String,
    pub client_key: String,
}

/// Inputs to a VM's first-boot document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudConfigParams {
    pub hostname: String,
    pub chef: Option<ChefParams>,
    pub extra_boot_commands: Vec<String>,
    /// Left empty when DNS is pushed through the subnet.
    pub dns_servers: Vec<String>,
    /// Export the shared volume over NFS.
    pub shared_volume: bool,
}

impl CloudConfigParams {
    /// Render the `#cloud-config` document.
    pub fn render(&self) -> String {
        let mut doc = format!(
            "#cloud-config\nhostname: {host}\nmanage_etc_hosts: true\n",
            host = self.hostname
        );

        if let Some(chef) = &self.chef {
            doc.push_str(&format!(
                "chef:\n  node_name: {}\n  server_url: {}\n  validation_name: {}\n  validation_key: |\n",
                chef.node_name, chef.server_path, chef.node_name
            ));
            for line in chef.client_key.lines() {
                doc.push_str(&format!("    {line}\n"));
            }
        }

        if !self.dns_servers.is_empty() {
            doc.push_str("manage_resolv_conf: true\nresolv_conf:\n  nameservers:\n");
            for server in &self.dns_servers {
                doc.push_str(&format!("    - {server}\n"));
            }
        }

        let mut runcmd: Vec<String> = Vec::new();
        if self.shared_volume {
            let dev = format!("/dev/{SHARED_VOLUME_DEVICE}");
            doc.push_str(&format!(
                "fs_setup:\n  - label: share\n    filesystem: ext4\n    device: {dev}\nmounts:\n  - [ \"{dev}\", \"/share\" ]\n"
            ));
            runcmd.push("chown nobody:nogroup /share".into());
            runcmd.push("chmod 777 /share".into());
            runcmd.push(
                "echo \"/share *(rw,sync,no_subtree_check,no_root_squash)\" >> /etc/exports".into(),
            );
            runcmd.push("exportfs -a".into());
        }
        runcmd.extend(self.extra_boot_commands.iter().cloned());

        if !runcmd.is_empty() {
            doc.push_str("runcmd:\n");
            for cmd in runcmd {
                doc.push_str(&format!("  - {cmd}\n"));
            }
        }
        doc
    }

    /// Base64 of the rendered document, as providers expect user data.
    pub fn encode(&self) -> String {
        STANDARD.encode(self.render())
    }
}
