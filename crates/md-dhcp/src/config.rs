use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid IPv4 address for {field}: {value:?}")]
    InvalidAddress { field: String, value: String },
    #[error("invalid lease duration: {0:?}")]
    InvalidDuration(String),
    #[error("unknown role: {0:?}")]
    UnknownRole(String),
}

/// Subnet roles, in pool-index order. Index 0 is the lowest-priority pool
/// handed to unclassified clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    Staff,
    Boss,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Guest, Role::Staff, Role::Boss];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Staff => "staff",
            Role::Boss => "boss",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Role::Guest => 0,
            Role::Staff => 1,
            Role::Boss => 2,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownRole(s.to_string()))
    }
}

/// How clients are matched to roles. Classification itself belongs to an
/// external authority; the policy is carried so the admin API can set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    #[default]
    IpMac,
    AuthUser,
}

/// On-disk description of one subnet pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetConfig {
    #[serde(default)]
    pub ip_start: String,
    #[serde(default)]
    pub ip_stop: String,
    #[serde(default = "default_netmask")]
    pub netmask: String,
    #[serde(default)]
    pub router: String,
    #[serde(default)]
    pub dns: String,
    #[serde(default = "default_lease_time")]
    pub lease_time: String,
}

impl SubnetConfig {
    fn with_octet(third: u8) -> Self {
        Self {
            ip_start: format!("192.168.{third}.10"),
            ip_stop: format!("192.168.{third}.250"),
            netmask: default_netmask(),
            router: format!("192.168.{third}.1"),
            dns: format!("192.168.{third}.1"),
            lease_time: default_lease_time(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhcpConfig {
    #[serde(default = "default_rest_port")]
    pub rest_port: u16,
    #[serde(default)]
    pub interface: String,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub allocate: MatchPolicy,
    #[serde(default = "default_lease_file")]
    pub lease_file: String,
    #[serde(default = "default_guest")]
    pub guest: SubnetConfig,
    #[serde(default = "default_staff")]
    pub staff: SubnetConfig,
    #[serde(default = "default_boss")]
    pub boss: SubnetConfig,
    /// Single static route entry, `"<mac> <ip>"`.
    #[serde(default)]
    pub static_route: String,
}

fn default_rest_port() -> u16 {
    8067
}

fn default_netmask() -> String {
    "255.255.255.0".to_string()
}

fn default_lease_time() -> String {
    "1h".to_string()
}

fn default_lease_file() -> String {
    "lease.txt".to_string()
}

fn default_guest() -> SubnetConfig {
    SubnetConfig::with_octet(10)
}

fn default_staff() -> SubnetConfig {
    SubnetConfig::with_octet(20)
}

fn default_boss() -> SubnetConfig {
    SubnetConfig::with_octet(30)
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            rest_port: default_rest_port(),
            interface: String::new(),
            server_id: String::new(),
            allocate: MatchPolicy::default(),
            lease_file: default_lease_file(),
            guest: default_guest(),
            staff: default_staff(),
            boss: default_boss(),
            static_route: String::new(),
        }
    }
}

impl DhcpConfig {
    /// Load from a YAML file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Atomic write: temp file then rename.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn subnet(&self, role: Role) -> &SubnetConfig {
        match role {
            Role::Guest => &self.guest,
            Role::Staff => &self.staff,
            Role::Boss => &self.boss,
        }
    }

    pub fn subnet_mut(&mut self, role: Role) -> &mut SubnetConfig {
        match role {
            Role::Guest => &mut self.guest,
            Role::Staff => &mut self.staff,
            Role::Boss => &mut self.boss,
        }
    }

    /// Server identifier; `None` when not configured.
    pub fn server_ip(&self) -> Result<Option<Ipv4Addr>, ConfigError> {
        parse_optional_addr("server_id", &self.server_id)
    }

    /// Validated pools, indexed by [`Role::index`].
    pub fn pools(&self) -> Result<Vec<Pool>, ConfigError> {
        Role::ALL
            .into_iter()
            .map(|role| Pool::from_config(role, self.subnet(role)))
            .collect()
    }
}

/// A parsed, immutable subnet pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub role: Role,
    pub start: Ipv4Addr,
    pub stop: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub lease_time: Duration,
}

impl Pool {
    pub fn from_config(role: Role, subnet: &SubnetConfig) -> Result<Self, ConfigError> {
        let field = |name: &str| format!("{role}.{name}");

        let lease_time = parse_duration(&subnet.lease_time)?;
        if lease_time.is_zero() {
            return Err(ConfigError::InvalidDuration(subnet.lease_time.clone()));
        }

        Ok(Self {
            role,
            start: parse_addr(&field("ip_start"), &subnet.ip_start)?,
            stop: parse_addr(&field("ip_stop"), &subnet.ip_stop)?,
            netmask: parse_addr(&field("netmask"), &subnet.netmask)?,
            router: parse_optional_addr(&field("router"), &subnet.router)?,
            dns: parse_optional_addr(&field("dns"), &subnet.dns)?,
            lease_time,
        })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (self.start..=self.stop).contains(&ip)
    }

    /// Lease time in whole seconds, clamped to the width of option 51.
    pub fn lease_secs(&self) -> u32 {
        u32::try_from(self.lease_time.as_secs()).unwrap_or(u32::MAX)
    }
}

fn parse_addr(field: &str, value: &str) -> Result<Ipv4Addr, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidAddress {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn parse_optional_addr(field: &str, value: &str) -> Result<Option<Ipv4Addr>, ConfigError> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    parse_addr(field, value).map(Some)
}

/// Parse a duration string such as `60s`, `1h30m` or `1.5h`.
///
/// Accepts a sequence of `<number><unit>` terms with units `ns`, `us`/`µs`,
/// `ms`, `s`, `m`, `h`. A bare `0` is also accepted.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let err = || ConfigError::InvalidDuration(s.to_string());
    let input = s.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.is_empty() {
        return Err(err());
    }

    let is_numeric = |c: char| c.is_ascii_digit() || c == '.';
    let mut rest = input;
    let mut total_nanos = 0f64;

    while !rest.is_empty() {
        let num_end = rest.find(|c: char| !is_numeric(c)).ok_or_else(err)?;
        if num_end == 0 {
            return Err(err());
        }
        let value: f64 = rest[..num_end].parse().map_err(|_| err())?;
        rest = &rest[num_end..];

        let unit_end = rest.find(is_numeric).unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(err()),
        };
        total_nanos += (value * nanos_per_unit).round();
        rest = &rest[unit_end..];
    }

    if !total_nanos.is_finite() || total_nanos >= u64::MAX as f64 {
        return Err(err());
    }
    Ok(Duration::from_nanos(total_nanos as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_pools_are_valid() {
        let config = DhcpConfig::default();
        let pools = config.pools().unwrap();
        assert_eq!(pools.len(), 3);
        assert_eq!(pools[0].role, Role::Guest);
        assert_eq!(pools[1].role, Role::Staff);
        assert_eq!(pools[2].role, Role::Boss);
        assert_eq!(pools[0].lease_time, Duration::from_secs(3600));
        assert_eq!(config.lease_file, "lease.txt");
        assert_eq!(config.server_ip().unwrap(), None);
    }

    #[test]
    fn test_deserialize_partial_yaml() {
        let yaml = r#"
interface: eth1
server_id: 192.168.0.1
guest:
  ip_start: 192.168.0.10
  ip_stop: 192.168.0.20
  lease_time: 60s
"#;
        let config: DhcpConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.interface, "eth1");
        assert_eq!(config.server_ip().unwrap(), Some(Ipv4Addr::new(192, 168, 0, 1)));
        assert_eq!(config.guest.netmask, "255.255.255.0");
        assert_eq!(config.guest.router, "");
        assert_eq!(config.staff, default_staff());

        let guest = Pool::from_config(Role::Guest, &config.guest).unwrap();
        assert_eq!(guest.start, Ipv4Addr::new(192, 168, 0, 10));
        assert_eq!(guest.router, None);
        assert_eq!(guest.lease_secs(), 60);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("minidhcp.yaml");

        let mut config = DhcpConfig::default();
        config.interface = "eth0".to_string();
        config.allocate = MatchPolicy::AuthUser;
        config.save(&path).unwrap();

        let loaded = DhcpConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DhcpConfig::load(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, DhcpConfig::default());
    }

    #[test]
    fn test_invalid_pool_address() {
        let mut subnet = default_guest();
        subnet.ip_start = "192.168.0".to_string();
        let err = Pool::from_config(Role::Guest, &subnet).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress { ref field, .. } if field == "guest.ip_start"));
    }

    #[test]
    fn test_zero_lease_time_rejected() {
        let mut subnet = default_guest();
        subnet.lease_time = "0s".to_string();
        assert!(matches!(
            Pool::from_config(Role::Guest, &subnet),
            Err(ConfigError::InvalidDuration(_))
        ));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("60").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("1..5s").is_err());
    }

    #[test]
    fn test_role_roundtrip() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
            assert_eq!(Role::ALL[role.index()], role);
        }
        assert!("admin".parse::<Role>().is_err());
    }
}
