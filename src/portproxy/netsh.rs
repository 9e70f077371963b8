//! Privileged port proxy rules (`netsh interface portproxy`)
//!
//! The privileged service publishes container ports by asking the OS to
//! forward `listenaddress:listenport` to the VM's address. Rules that were
//! applied are remembered so they can all be removed on shutdown.
//!
//! Library-only: none of the bundled binaries drive it. A privileged Windows
//! service embeds [`NetshPortProxy`] and feeds it the same [`PortMapping`]s
//! the `port-proxy` control channel receives.

use super::{ConnectAddr, PortMapping, PortProxyError, Protocol};
use async_trait::async_trait;
use parking_lot::Mutex;
use ring::digest;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info, warn};

const NETSH: &str = "netsh";

/// Runs an external command
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<(), PortProxyError>;
}

/// Executes commands through `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct NetshRunner;

#[async_trait]
impl CommandRunner for NetshRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<(), PortProxyError> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }
        Err(PortProxyError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            message: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stdout).trim()
            ),
        })
    }
}

/// One `listenaddress:listenport -> connectaddress:connectport` rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortProxyRule {
    pub listen_address: IpAddr,
    pub listen_port: String,
    pub connect_address: Option<IpAddr>,
}

impl PortProxyRule {
    fn family(&self) -> &'static str {
        if self.listen_address.is_ipv4() {
            "v4tov4"
        } else {
            "v6tov6"
        }
    }

    /// Arguments for `netsh` adding this rule; the connect port equals the listen port
    pub fn add_args(&self) -> Result<Vec<String>, PortProxyError> {
        let connect = self.connect_address.ok_or_else(|| {
            PortProxyError::InvalidAddress(format!(
                "no connect address for {}",
                self.listen_address
            ))
        })?;
        let mut args = self.base_args("add");
        args.push(format!("connectport={}", self.listen_port));
        args.push(format!("connectaddress={}", connect));
        Ok(args)
    }

    /// Arguments for `netsh` deleting this rule
    pub fn delete_args(&self) -> Vec<String> {
        self.base_args("delete")
    }

    fn base_args(&self, action: &str) -> Vec<String> {
        vec![
            "interface".to_string(),
            "portproxy".to_string(),
            action.to_string(),
            self.family().to_string(),
            format!("listenport={}", self.listen_port),
            format!("listenaddress={}", self.listen_address),
        ]
    }
}

fn parse_ip(addr: &str) -> Result<IpAddr, PortProxyError> {
    addr.parse()
        .map_err(|_| PortProxyError::InvalidAddress(format!("invalid IP address: {}", addr)))
}

/// First connect address of the same IP family as `listen_ip`.
///
/// Connect addresses are in CIDR notation (`172.20.1.2/20`).
pub fn connect_address(
    listen_ip: &str,
    connect_addrs: &[ConnectAddr],
) -> Result<IpAddr, PortProxyError> {
    let listen = parse_ip(listen_ip)?;

    for addr in connect_addrs {
        let ip = parse_ip(addr.addr.split('/').next().unwrap_or_default())?;
        if ip.is_ipv4() == listen.is_ipv4() {
            return Ok(ip);
        }
    }
    Err(PortProxyError::InvalidAddress(format!(
        "failed to find connect address: {:?} for listen IP: {}",
        connect_addrs, listen_ip
    )))
}

/// Key a mapping by its content, ignoring the remove flag
fn mapping_key(mapping: &PortMapping) -> Result<String, PortProxyError> {
    let applied = PortMapping {
        remove: false,
        ..mapping.clone()
    };
    let bytes = serde_json::to_vec(&applied)?;
    Ok(hex::encode(digest::digest(&digest::SHA256, &bytes)))
}

/// Applies port mappings as OS port proxy rules
pub struct NetshPortProxy<R: CommandRunner = NetshRunner> {
    runner: R,
    applied: Mutex<HashMap<String, PortMapping>>,
}

impl NetshPortProxy<NetshRunner> {
    pub fn new() -> Self {
        Self::with_runner(NetshRunner)
    }
}

impl Default for NetshPortProxy<NetshRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> NetshPortProxy<R> {
    pub fn with_runner(runner: R) -> Self {
        Self {
            runner,
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Number of mappings currently applied
    pub fn len(&self) -> usize {
        self.applied.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.lock().is_empty()
    }

    /// Add or delete the rules of `mapping`, depending on its remove flag
    pub async fn exec(&self, mapping: &PortMapping) -> Result<(), PortProxyError> {
        if mapping.remove {
            self.delete(mapping).await
        } else {
            self.add(mapping).await
        }
    }

    async fn add(&self, mapping: &PortMapping) -> Result<(), PortProxyError> {
        for rule in rules(mapping, true)? {
            self.runner.run(NETSH, &rule.add_args()?).await?;
            debug!(
                "netsh: forwarding {}:{} to {:?}",
                rule.listen_address, rule.listen_port, rule.connect_address
            );
        }

        let key = mapping_key(mapping)?;
        self.applied.lock().insert(key, mapping.clone());
        Ok(())
    }

    async fn delete(&self, mapping: &PortMapping) -> Result<(), PortProxyError> {
        for rule in rules(mapping, false)? {
            self.runner.run(NETSH, &rule.delete_args()).await?;
        }

        let key = mapping_key(mapping)?;
        self.applied.lock().remove(&key);
        Ok(())
    }

    /// Delete every applied rule, reporting all failures at the end
    pub async fn remove_all(&self) -> Result<(), PortProxyError> {
        let applied: Vec<PortMapping> = self.applied.lock().values().cloned().collect();
        info!("netsh: removing {} port proxy mappings", applied.len());

        let mut failures = Vec::new();
        for mapping in applied {
            if let Err(e) = self.delete(&mapping).await {
                warn!("netsh: removing port proxy: {}", e);
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PortProxyError::RemoveAll(failures))
        }
    }
}

fn rules(mapping: &PortMapping, with_connect: bool) -> Result<Vec<PortProxyRule>, PortProxyError> {
    let mut rules = Vec::new();
    for (port_proto, bindings) in &mapping.ports {
        if super::protocol_of(port_proto) != Protocol::Tcp {
            debug!("netsh: skipping non-TCP port {}", port_proto);
            continue;
        }
        for binding in bindings {
            binding.port()?;
            let connect_address = if with_connect {
                Some(connect_address(binding.listen_ip(), &mapping.connect_addrs)?)
            } else {
                None
            };
            rules.push(PortProxyRule {
                listen_address: parse_ip(binding.listen_ip())?,
                listen_port: binding.host_port.clone(),
                connect_address,
            });
        }
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_deletes: bool,
    }

    #[async_trait]
    impl CommandRunner for Recorder {
        async fn run(&self, program: &str, args: &[String]) -> Result<(), PortProxyError> {
            let line = format!("{} {}", program, args.join(" "));
            self.calls.lock().push(line.clone());
            if self.fail_deletes && args[2] == "delete" {
                return Err(PortProxyError::CommandFailed {
                    command: line,
                    message: "exit status: 1".to_string(),
                });
            }
            Ok(())
        }
    }

    fn mapping(host_ip: &str, port: u16) -> PortMapping {
        let mut mapping = PortMapping::single("80/tcp", host_ip, port);
        mapping.connect_addrs = vec![
            ConnectAddr {
                network: "ip".to_string(),
                addr: "fd00::2/64".to_string(),
            },
            ConnectAddr {
                network: "ip".to_string(),
                addr: "172.20.1.2/20".to_string(),
            },
        ];
        mapping
    }

    #[test]
    fn test_connect_address_matches_family() {
        let addrs = mapping("", 80).connect_addrs;
        assert_eq!(
            connect_address("127.0.0.1", &addrs).unwrap().to_string(),
            "172.20.1.2"
        );
        assert_eq!(connect_address("::1", &addrs).unwrap().to_string(), "fd00::2");
        assert!(connect_address("localhost", &addrs).is_err());
        assert!(connect_address("127.0.0.1", &addrs[..1]).is_err());
    }

    #[test]
    fn test_rule_args() {
        let rule = PortProxyRule {
            listen_address: "::1".parse().unwrap(),
            listen_port: "8080".to_string(),
            connect_address: Some("fd00::2".parse().unwrap()),
        };
        assert_eq!(
            rule.add_args().unwrap().join(" "),
            "interface portproxy add v6tov6 listenport=8080 listenaddress=::1 connectport=8080 connectaddress=fd00::2"
        );
        assert_eq!(
            rule.delete_args().join(" "),
            "interface portproxy delete v6tov6 listenport=8080 listenaddress=::1"
        );
    }

    #[test]
    fn test_mapping_key_ignores_remove_flag() {
        let added = mapping("127.0.0.1", 8080);
        let removed = added.clone().into_remove();
        assert_eq!(mapping_key(&added).unwrap(), mapping_key(&removed).unwrap());
        assert_ne!(
            mapping_key(&added).unwrap(),
            mapping_key(&mapping("127.0.0.1", 8081)).unwrap()
        );
    }

    #[tokio::test]
    async fn test_exec_add_then_remove() {
        let proxy = NetshPortProxy::with_runner(Recorder::default());
        let added = mapping("127.0.0.1", 8080);

        proxy.exec(&added).await.unwrap();
        assert_eq!(proxy.len(), 1);
        proxy.exec(&added.into_remove()).await.unwrap();
        assert!(proxy.is_empty());

        let calls = proxy.runner.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                "netsh interface portproxy add v4tov4 listenport=8080 listenaddress=127.0.0.1 connectport=8080 connectaddress=172.20.1.2",
                "netsh interface portproxy delete v4tov4 listenport=8080 listenaddress=127.0.0.1",
            ]
        );
    }

    #[tokio::test]
    async fn test_remove_all_aggregates_failures() {
        let proxy = NetshPortProxy::with_runner(Recorder {
            fail_deletes: true,
            ..Recorder::default()
        });
        proxy.exec(&mapping("127.0.0.1", 8080)).await.unwrap();
        proxy.exec(&mapping("127.0.0.1", 8081)).await.unwrap();

        match proxy.remove_all().await {
            Err(PortProxyError::RemoveAll(failures)) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected result: {:?}", other),
        }
        // Both deletes were attempted
        let deletes = proxy
            .runner
            .calls
            .lock()
            .iter()
            .filter(|c| c.contains(" delete "))
            .count();
        assert_eq!(deletes, 2);
    }
}
