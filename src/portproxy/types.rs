//! Port mapping control messages

use super::PortProxyError;
use bytes::BytesMut;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest control message accepted (64 KB)
pub const MAX_MAPPING_SIZE: usize = 64 * 1024;

/// Bind address used when a binding leaves `HostIp` empty
pub const DEFAULT_LISTEN_IP: &str = "127.0.0.1";

/// Request to start or stop forwarding a set of host ports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(rename = "Remove", default)]
    pub remove: bool,
    /// `"<port>/<proto>"` to host bindings
    #[serde(rename = "Ports", default, deserialize_with = "null_as_default")]
    pub ports: BTreeMap<String, Vec<PortBinding>>,
    #[serde(rename = "ConnectAddrs", default, deserialize_with = "null_as_default")]
    pub connect_addrs: Vec<ConnectAddr>,
}

/// Host side of a published port
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostIp", alias = "HostIP", default)]
    pub host_ip: String,
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

/// Address of the VM side a privileged port proxy connects to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectAddr {
    #[serde(rename = "Network", default)]
    pub network: String,
    /// Address in CIDR notation, e.g. `172.20.1.2/20`
    #[serde(rename = "Addr", default)]
    pub addr: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl PortMapping {
    /// Single binding mapping, handy for clients and tests
    pub fn single(port_proto: &str, host_ip: &str, host_port: u16) -> Self {
        let mut ports = BTreeMap::new();
        ports.insert(
            port_proto.to_string(),
            vec![PortBinding {
                host_ip: host_ip.to_string(),
                host_port: host_port.to_string(),
            }],
        );
        Self {
            remove: false,
            ports,
            connect_addrs: Vec::new(),
        }
    }

    /// Same mapping, flagged for removal
    pub fn into_remove(mut self) -> Self {
        self.remove = true;
        self
    }
}

impl PortBinding {
    /// Numeric host port
    pub fn port(&self) -> Result<u16, PortProxyError> {
        match self.host_port.trim().parse::<u16>() {
            Ok(0) | Err(_) => Err(PortProxyError::InvalidPort(self.host_port.clone())),
            Ok(port) => Ok(port),
        }
    }

    /// Address the forwarding listener binds to
    pub fn listen_ip(&self) -> &str {
        if self.host_ip.is_empty() {
            DEFAULT_LISTEN_IP
        } else {
            &self.host_ip
        }
    }
}

/// Transport protocol of a published port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Other(String),
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Other(p) => write!(f, "{}", p),
        }
    }
}

/// Protocol part of a `"<port>/<proto>"` key; a missing protocol means tcp
pub fn protocol_of(port_proto: &str) -> Protocol {
    match port_proto.split_once('/') {
        None => Protocol::Tcp,
        Some((_, proto)) => match proto.to_lowercase().as_str() {
            "tcp" | "" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => Protocol::Other(other.to_string()),
        },
    }
}

/// Read exactly one JSON-encoded [`PortMapping`] from `reader`.
///
/// Does not wait for the writer to close once a complete object arrived.
pub async fn read_mapping<R>(reader: &mut R) -> Result<PortMapping, PortProxyError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let n = reader.read_buf(&mut buf).await?;

        let mut objects = serde_json::Deserializer::from_slice(&buf).into_iter::<PortMapping>();
        match objects.next() {
            Some(Ok(mapping)) => return Ok(mapping),
            Some(Err(e)) if !(e.is_eof() && n > 0) => return Err(PortProxyError::Decode(e)),
            None if n == 0 => return Err(PortProxyError::EmptyMessage),
            _ => {}
        }

        if buf.len() > MAX_MAPPING_SIZE {
            return Err(PortProxyError::MessageTooLarge(buf.len()));
        }
    }
}
