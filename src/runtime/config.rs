use crate::error::{Result, SlpError};
use crate::model::{Attributes, Scopes};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

/// Agent configuration.
/// All timing values are in milliseconds unless otherwise specified.
#[derive(Debug, Deserialize, Clone)]
pub struct SlpConfig {
    /// SLP port for UDP and TCP (default: 427)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local address to bind listeners to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Administratively scoped SLP group (default: 239.255.255.253)
    #[serde(default = "default_multicast_address")]
    pub multicast_address: String,
    #[serde(default = "default_multicast_ttl")]
    pub multicast_ttl: u32,
    /// Scopes this agent serves (default: ["default"])
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
    /// Attributes advertised in DAAdverts and SAAdverts, in wire form
    #[serde(default)]
    pub attributes: String,
    /// Statically configured DAs as `host` or `host:port`
    #[serde(default)]
    pub directory_agents: Vec<String>,
    /// Multicast convergence window (default: 3000)
    #[serde(default = "default_convergence_timeframe")]
    pub convergence_timeframe_ms: u64,
    /// Wait for one unicast reply (default: 5000)
    #[serde(default = "default_unicast_timeout")]
    pub unicast_timeout_ms: u64,
    /// Extra attempts when forwarding a registration to a DA (default: 2)
    #[serde(default = "default_forward_retries")]
    pub forward_retries: u32,
    /// Period of the cache expiry sweep (default: 1000)
    #[serde(default = "default_sweep_period")]
    pub sweep_period_ms: u64,
    /// Largest datagram sent or received (default: 1400)
    #[serde(default = "default_mtu")]
    pub max_transmission_unit: usize,
    /// Concurrent TCP connections served (default: 50)
    #[serde(default = "default_max_tcp_connections")]
    pub max_tcp_connections: usize,
    /// Largest request accepted over TCP, in bytes (default: 1048576)
    #[serde(default = "default_max_tcp_frame")]
    pub max_tcp_frame: usize,
    /// DA heartbeat: period of unsolicited DAAdverts, 0 disables (default: 10800000)
    #[serde(default = "default_advertise_period")]
    pub advertise_period_ms: u64,
    /// Service agents look for DAs by multicast when they start (default: true)
    #[serde(default = "default_da_discovery_on_start")]
    pub da_discovery_on_start: bool,
}

impl Default for SlpConfig {
    fn default() -> Self {
        SlpConfig {
            port: default_port(),
            bind_address: default_bind_address(),
            multicast_address: default_multicast_address(),
            multicast_ttl: default_multicast_ttl(),
            scopes: default_scopes(),
            language: default_language(),
            attributes: String::new(),
            directory_agents: Vec::new(),
            convergence_timeframe_ms: default_convergence_timeframe(),
            unicast_timeout_ms: default_unicast_timeout(),
            forward_retries: default_forward_retries(),
            sweep_period_ms: default_sweep_period(),
            max_transmission_unit: default_mtu(),
            max_tcp_connections: default_max_tcp_connections(),
            max_tcp_frame: default_max_tcp_frame(),
            advertise_period_ms: default_advertise_period(),
            da_discovery_on_start: default_da_discovery_on_start(),
        }
    }
}

fn default_port() -> u16 { crate::DEFAULT_PORT }
fn default_bind_address() -> String { "0.0.0.0".to_string() }
fn default_multicast_address() -> String { crate::DEFAULT_MULTICAST_GROUP.to_string() }
fn default_multicast_ttl() -> u32 { 255 }
fn default_scopes() -> Vec<String> { vec![Scopes::DEFAULT.to_string()] }
fn default_language() -> String { "en".to_string() }
fn default_convergence_timeframe() -> u64 { 3000 }
fn default_unicast_timeout() -> u64 { 5000 }
fn default_forward_retries() -> u32 { 2 }
fn default_sweep_period() -> u64 { 1000 }
fn default_mtu() -> usize { 1400 }
fn default_max_tcp_connections() -> usize { 50 }
fn default_max_tcp_frame() -> usize { 1 << 20 }
fn default_advertise_period() -> u64 { 3 * 60 * 60 * 1000 }
fn default_da_discovery_on_start() -> bool { true }

impl SlpConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| SlpError::Config(format!("cannot open {}: {}", path.display(), e)))?;
        let config: SlpConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| SlpError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: SlpConfig =
            serde_json::from_str(text).map_err(|e| SlpError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.bind_ip()?;
        self.multicast_group()?;
        self.agent_attributes()?;
        if self.max_transmission_unit < 64 {
            return Err(SlpError::Config(format!(
                "max_transmission_unit {} is too small",
                self.max_transmission_unit
            )));
        }
        Ok(())
    }

    pub fn bind_ip(&self) -> Result<IpAddr> {
        self.bind_address
            .parse()
            .map_err(|_| SlpError::Config(format!("invalid bind_address '{}'", self.bind_address)))
    }

    pub fn bind_socket(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.bind_ip()?, self.port))
    }

    pub fn multicast_group(&self) -> Result<Ipv4Addr> {
        self.multicast_address.parse().map_err(|_| {
            SlpError::Config(format!("invalid multicast_address '{}'", self.multicast_address))
        })
    }

    pub fn multicast_destination(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::from((self.multicast_group()?, self.port)))
    }

    /// Interface used for multicast membership: the bind address when it is IPv4.
    pub fn multicast_interface(&self) -> Ipv4Addr {
        match self.bind_ip() {
            Ok(IpAddr::V4(ip)) => ip,
            _ => Ipv4Addr::UNSPECIFIED,
        }
    }

    pub fn agent_scopes(&self) -> Scopes {
        Scopes::new(&self.scopes)
    }

    pub fn agent_attributes(&self) -> Result<Attributes> {
        Attributes::from_wire(&self.attributes)
            .map_err(|e| SlpError::Config(format!("invalid attributes: {}", e)))
    }

    /// Resolves `directory_agents`; entries without a port use the SLP port.
    pub fn directory_agent_addresses(&self) -> Result<Vec<SocketAddr>> {
        self.directory_agents
            .iter()
            .map(|entry| {
                if let Ok(ip) = entry.parse::<IpAddr>() {
                    return Ok(SocketAddr::new(ip, self.port));
                }
                if let Ok(addr) = entry.parse::<SocketAddr>() {
                    return Ok(addr);
                }
                let target = if entry.contains(':') {
                    entry.clone()
                } else {
                    format!("{}:{}", entry, self.port)
                };
                target
                    .to_socket_addrs()
                    .ok()
                    .and_then(|mut addrs| addrs.next())
                    .ok_or_else(|| {
                        SlpError::Config(format!("cannot resolve directory agent '{}'", entry))
                    })
            })
            .collect()
    }

    pub fn convergence_timeframe(&self) -> Duration {
        Duration::from_millis(self.convergence_timeframe_ms)
    }

    pub fn unicast_timeout(&self) -> Duration {
        Duration::from_millis(self.unicast_timeout_ms)
    }

    pub fn sweep_period(&self) -> Duration {
        Duration::from_millis(self.sweep_period_ms.max(1))
    }

    pub fn advertise_period(&self) -> Option<Duration> {
        Some(self.advertise_period_ms)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
