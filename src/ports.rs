//! TCP port reservation and firewall rules via `netsh`

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::platform;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    #[default]
    All,
}

impl Protocol {
    fn netsh_name(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMPv4",
            Protocol::All => "any",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// Outbound traffic a container is allowed to originate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FirewallRuleSpec {
    pub protocol: Protocol,
    pub networks: Vec<IpRange>,
    pub ports: Vec<PortRange>,
}

impl FirewallRuleSpec {
    pub fn validate(&self) -> Result<()> {
        for range in &self.ports {
            if range.start > range.end {
                return Err(Error::InvalidArgument(format!(
                    "port range {}-{} is inverted",
                    range.start, range.end
                )));
            }
        }
        if !self.ports.is_empty() && !matches!(self.protocol, Protocol::Tcp | Protocol::Udp) {
            return Err(Error::InvalidArgument(
                "port ranges require the TCP or UDP protocol".into(),
            ));
        }
        Ok(())
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait Firewall: Send + Sync {
    fn open_port(&self, port: u16, user_name: &str) -> Result<()>;
    fn close_port(&self, port: u16, user_name: &str) -> Result<()>;
    fn create_outbound_rule(&self, user_name: &str, rule: &FirewallRuleSpec) -> Result<()>;
    fn remove_all_rules(&self, user_name: &str) -> Result<()>;
}

/// HTTP.sys URL reservations
#[cfg_attr(test, mockall::automock)]
pub trait UrlAclManager: Send + Sync {
    fn add_reservation(&self, port: u16, user_name: &str) -> Result<()>;
    fn delete_reservation(&self, port: u16) -> Result<()>;
}

/// Port bookkeeping the container talks to
#[cfg_attr(test, mockall::automock)]
pub trait PortManager: Send + Sync {
    /// Reserve `port` (0 picks a free one) for the user and open it in the firewall
    fn reserve_local_port(&self, port: u16, user_name: &str) -> Result<u16>;
    fn release_local_port(&self, port: u16, user_name: &str) -> Result<()>;
    fn create_outbound_rule(&self, user_name: &str, rule: &FirewallRuleSpec) -> Result<()>;
    fn remove_firewall_rules(&self, user_name: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct NetshFirewall;

impl Firewall for NetshFirewall {
    fn open_port(&self, port: u16, user_name: &str) -> Result<()> {
        platform::run_command(
            "netsh",
            &[
                "advfirewall",
                "firewall",
                "add",
                "rule",
                &format!("name={user_name}"),
                "dir=in",
                "action=allow",
                "protocol=TCP",
                &format!("localport={port}"),
            ],
        )?;
        Ok(())
    }

    fn close_port(&self, port: u16, user_name: &str) -> Result<()> {
        platform::run_command(
            "netsh",
            &[
                "advfirewall",
                "firewall",
                "delete",
                "rule",
                &format!("name={user_name}"),
                "protocol=TCP",
                &format!("localport={port}"),
            ],
        )?;
        Ok(())
    }

    fn create_outbound_rule(&self, user_name: &str, rule: &FirewallRuleSpec) -> Result<()> {
        rule.validate()?;
        let mut args = vec![
            "advfirewall".to_string(),
            "firewall".to_string(),
            "add".to_string(),
            "rule".to_string(),
            format!("name={user_name}"),
            "dir=out".to_string(),
            "action=allow".to_string(),
            format!("protocol={}", rule.protocol.netsh_name()),
        ];
        if !rule.networks.is_empty() {
            let ips: Vec<_> = rule
                .networks
                .iter()
                .map(|r| format!("{}-{}", r.start, r.end))
                .collect();
            args.push(format!("remoteip={}", ips.join(",")));
        }
        if !rule.ports.is_empty() {
            let ports: Vec<_> = rule
                .ports
                .iter()
                .map(|r| format!("{}-{}", r.start, r.end))
                .collect();
            args.push(format!("remoteport={}", ports.join(",")));
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        platform::run_command("netsh", &args)?;
        Ok(())
    }

    fn remove_all_rules(&self, user_name: &str) -> Result<()> {
        match platform::run_command(
            "netsh",
            &["advfirewall", "firewall", "delete", "rule", &format!("name={user_name}")],
        ) {
            // netsh exits non-zero when no rule matched
            Err(Error::Command { stderr, .. }) if stderr.contains("No rules match") => Ok(()),
            other => other.map(|_| ()),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct NetshUrlAcl;

fn url_for(port: u16) -> String {
    format!("url=http://*:{port}/")
}

impl UrlAclManager for NetshUrlAcl {
    fn add_reservation(&self, port: u16, user_name: &str) -> Result<()> {
        platform::run_command(
            "netsh",
            &["http", "add", "urlacl", &url_for(port), &format!("user={user_name}")],
        )?;
        Ok(())
    }

    fn delete_reservation(&self, port: u16) -> Result<()> {
        platform::run_command("netsh", &["http", "delete", "urlacl", &url_for(port)])?;
        Ok(())
    }
}

pub struct LocalTcpPortManager {
    firewall: Arc<dyn Firewall>,
    url_acl: Arc<dyn UrlAclManager>,
}

impl LocalTcpPortManager {
    pub fn new(firewall: Arc<dyn Firewall>, url_acl: Arc<dyn UrlAclManager>) -> Self {
        Self { firewall, url_acl }
    }

    pub fn netsh() -> Self {
        Self::new(Arc::new(NetshFirewall), Arc::new(NetshUrlAcl))
    }
}

impl PortManager for LocalTcpPortManager {
    fn reserve_local_port(&self, port: u16, user_name: &str) -> Result<u16> {
        let port = if port == 0 {
            platform::free_tcp_port()?
        } else {
            port
        };

        self.url_acl.add_reservation(port, user_name)?;
        if let Err(e) = self.firewall.open_port(port, user_name) {
            if let Err(undo) = self.url_acl.delete_reservation(port) {
                tracing::warn!(port, error = %undo, "failed to drop URL reservation");
            }
            return Err(e);
        }
        tracing::info!(port, user = user_name, "reserved port");
        Ok(port)
    }

    fn release_local_port(&self, port: u16, user_name: &str) -> Result<()> {
        let closed = self.firewall.close_port(port, user_name);
        let deleted = self.url_acl.delete_reservation(port);
        closed.and(deleted)
    }

    fn create_outbound_rule(&self, user_name: &str, rule: &FirewallRuleSpec) -> Result<()> {
        rule.validate()?;
        self.firewall.create_outbound_rule(user_name, rule)
    }

    fn remove_firewall_rules(&self, user_name: &str) -> Result<()> {
        self.firewall.remove_all_rules(user_name)
    }
}
