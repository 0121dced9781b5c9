//! Gateway configuration types.
//!
//! The configuration is a plain serde struct loaded from TOML. Settings that
//! may change while the gateway runs are described by [`CONFIG_FIELDS`], a
//! hand-written table of field names, value kinds and sensitivity, which
//! drives [`GatewayConfig::validate_update`] and
//! [`GatewayConfig::apply_update`].

use crate::error::{GatewayError, GatewayResult};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Default tunnel MTU.
pub const DEFAULT_MTU: u16 = 1460;

/// Smallest MTU accepted (IPv4 minimum reassembly size).
pub const MIN_MTU: u16 = 576;

/// Largest MTU accepted (jumbo frames).
pub const MAX_MTU: u16 = 9000;

/// Minimum IP lease in seconds.
pub const MIN_IP_LEASE_SECS: u64 = 60;

/// Default reservation table location.
pub const DEFAULT_IP_MAP_FILE: &str = "/var/lib/sslvpn/ip_map.json";

/// How client traffic is attached to the host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Point-to-point TUN device per session.
    #[default]
    Tun,
    /// Layer-2 TAP device bridged to the host.
    Tap,
    /// macvtap on top of the egress interface.
    Macvtap,
    /// ipvtap on top of the egress interface.
    Ipvtap,
}

impl LinkMode {
    /// All accepted modes.
    pub const ALL: [LinkMode; 4] = [LinkMode::Tun, LinkMode::Tap, LinkMode::Macvtap, LinkMode::Ipvtap];

    /// Configuration spelling of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkMode::Tun => "tun",
            LinkMode::Tap => "tap",
            LinkMode::Macvtap => "macvtap",
            LinkMode::Ipvtap => "ipvtap",
        }
    }

    /// Parse the configuration spelling.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.as_str() == s)
    }
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Egress interface used for NAT (e.g., "eth0").
    #[serde(default = "default_ipv4_master")]
    pub ipv4_master: String,

    /// VPN client network.
    #[serde(default = "default_ipv4_cidr")]
    pub ipv4_cidr: Ipv4Net,

    /// Gateway address: local end of every point-to-point link.
    #[serde(default = "default_ipv4_gateway")]
    pub ipv4_gateway: Ipv4Addr,

    /// First address handed out to clients.
    #[serde(default = "default_ipv4_start")]
    pub ipv4_start: Ipv4Addr,

    /// Last address handed out to clients.
    #[serde(default = "default_ipv4_end")]
    pub ipv4_end: Ipv4Addr,

    /// Upper bound for the per-session MTU.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// How client traffic is attached to the host.
    #[serde(default)]
    pub link_mode: LinkMode,

    /// Masquerade client traffic behind the egress interface.
    #[serde(default = "default_true")]
    pub iptables_nat: bool,

    /// Running inside a restricted network namespace (container).
    ///
    /// Interface-scoped firewall matches are unavailable there.
    #[serde(default)]
    pub in_container: bool,

    /// Maximum concurrent sessions.
    #[serde(default = "default_max_client")]
    pub max_client: u32,

    /// Maximum concurrent sessions per user.
    #[serde(default = "default_max_user_client")]
    pub max_user_client: u32,

    /// Seconds an address stays bound to a user after disconnect.
    #[serde(default = "default_ip_lease")]
    pub ip_lease: u64,

    /// CSTP keepalive interval (seconds).
    #[serde(default = "default_cstp_keepalive")]
    pub cstp_keepalive: u32,

    /// CSTP dead-peer-detection interval (seconds).
    #[serde(default = "default_cstp_dpd")]
    pub cstp_dpd: u32,

    /// Keepalive interval for mobile clients (seconds).
    #[serde(default = "default_mobile_keepalive")]
    pub mobile_keepalive: u32,

    /// Dead-peer-detection interval for mobile clients (seconds).
    #[serde(default = "default_mobile_dpd")]
    pub mobile_dpd: u32,

    /// Idle session timeout in seconds (0 disables).
    #[serde(default)]
    pub idle_timeout: u64,

    /// Absolute session timeout in seconds (0 disables).
    #[serde(default)]
    pub session_timeout: u64,

    /// JSON file holding the IP reservation table.
    #[serde(default = "default_ip_map_file")]
    pub ip_map_file: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ipv4_master: default_ipv4_master(),
            ipv4_cidr: default_ipv4_cidr(),
            ipv4_gateway: default_ipv4_gateway(),
            ipv4_start: default_ipv4_start(),
            ipv4_end: default_ipv4_end(),
            mtu: DEFAULT_MTU,
            link_mode: LinkMode::Tun,
            iptables_nat: true,
            in_container: false,
            max_client: default_max_client(),
            max_user_client: default_max_user_client(),
            ip_lease: default_ip_lease(),
            cstp_keepalive: default_cstp_keepalive(),
            cstp_dpd: default_cstp_dpd(),
            mobile_keepalive: default_mobile_keepalive(),
            mobile_dpd: default_mobile_dpd(),
            idle_timeout: 0,
            session_timeout: 0,
            ip_map_file: default_ip_map_file(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config_with_source(
                format!("Failed to read config file: {}", path.display()),
                e,
            )
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            GatewayError::Config(ctx) => GatewayError::config_with_source(
                format!("Failed to parse config file: {}", path.display()),
                ctx,
            ),
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> GatewayResult<Self> {
        toml::from_str(content)
            .map_err(|e| GatewayError::config_with_source("Invalid configuration", e))
    }

    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - the gateway or pool bounds are outside `ipv4_cidr`, or start > end
    /// - `mtu` is outside 576..=9000
    /// - client limits are zero or `max_user_client > max_client`
    /// - `ip_lease` is under 60 seconds, a keepalive is zero, or a DPD
    ///   interval does not exceed its keepalive
    /// - `ipv4_master` or `ip_map_file` is empty
    pub fn validate(&self) -> Result<(), String> {
        self.validate_network()
            .map_err(|e| format!("network: {}", e))?;
        self.validate_connection_limits()
            .map_err(|e| format!("connection limits: {}", e))?;
        self.validate_timeouts()
            .map_err(|e| format!("timeouts: {}", e))?;

        if self.ip_map_file.as_os_str().is_empty() {
            return Err("'ip_map_file' cannot be empty".to_string());
        }

        Ok(())
    }

    fn validate_network(&self) -> Result<(), String> {
        let cidr = self.ipv4_cidr;

        if self.ipv4_master.trim().is_empty() {
            return Err("'ipv4_master' cannot be empty".to_string());
        }

        for (name, ip) in [
            ("ipv4_gateway", self.ipv4_gateway),
            ("ipv4_start", self.ipv4_start),
            ("ipv4_end", self.ipv4_end),
        ] {
            if !cidr.contains(&ip) {
                return Err(format!("'{}' {} is not within 'ipv4_cidr' {}", name, ip, cidr));
            }
        }

        if u32::from(self.ipv4_start) > u32::from(self.ipv4_end) {
            return Err(format!(
                "'ipv4_start' {} must not be greater than 'ipv4_end' {}",
                self.ipv4_start, self.ipv4_end
            ));
        }

        validate_mtu(i64::from(self.mtu))
    }

    fn validate_connection_limits(&self) -> Result<(), String> {
        if self.max_client == 0 {
            return Err("'max_client' must be greater than 0".to_string());
        }
        if self.max_user_client == 0 {
            return Err("'max_user_client' must be greater than 0".to_string());
        }
        if self.max_user_client > self.max_client {
            return Err(format!(
                "'max_user_client' ({}) cannot exceed 'max_client' ({})",
                self.max_user_client, self.max_client
            ));
        }
        Ok(())
    }

    fn validate_timeouts(&self) -> Result<(), String> {
        if self.ip_lease < MIN_IP_LEASE_SECS {
            return Err(format!(
                "'ip_lease' must be at least {} seconds, got {}",
                MIN_IP_LEASE_SECS, self.ip_lease
            ));
        }
        if self.cstp_keepalive == 0 {
            return Err("'cstp_keepalive' must be greater than 0".to_string());
        }
        if self.mobile_keepalive == 0 {
            return Err("'mobile_keepalive' must be greater than 0".to_string());
        }
        if self.cstp_dpd <= self.cstp_keepalive {
            return Err(format!(
                "'cstp_dpd' ({}) must be greater than 'cstp_keepalive' ({})",
                self.cstp_dpd, self.cstp_keepalive
            ));
        }
        if self.mobile_dpd <= self.mobile_keepalive {
            return Err(format!(
                "'mobile_dpd' ({}) must be greater than 'mobile_keepalive' ({})",
                self.mobile_dpd, self.mobile_keepalive
            ));
        }
        Ok(())
    }

    /// Check whether `value` may be written to `key` at runtime.
    ///
    /// Rejects unknown and sensitive keys, values of the wrong kind, and
    /// values failing the per-key range checks.
    pub fn validate_update(key: &str, value: &ConfigValue) -> Result<(), String> {
        let field = config_field(key).ok_or_else(|| format!("unknown setting '{}'", key))?;
        if field.sensitive {
            return Err(format!("'{}' is sensitive and cannot be changed at runtime", key));
        }
        if value.kind() != field.kind {
            return Err(format!(
                "'{}' expects a {} value, got {}",
                key,
                field.kind,
                value.kind()
            ));
        }

        match (key, value) {
            ("ipv4_start" | "ipv4_end", ConfigValue::Str(s)) => {
                s.parse::<Ipv4Addr>()
                    .map_err(|_| format!("'{}' is not a valid IPv4 address: {}", key, s))?;
            }
            ("mtu", ConfigValue::Int(n)) => validate_mtu(*n)?,
            ("max_client" | "max_user_client" | "cstp_keepalive" | "cstp_dpd"
            | "mobile_keepalive" | "mobile_dpd", ConfigValue::Int(n)) => {
                if *n <= 0 || *n > i64::from(u32::MAX) {
                    return Err(format!("'{}' must be greater than 0", key));
                }
            }
            ("ip_lease", ConfigValue::Int(n)) => {
                if *n < MIN_IP_LEASE_SECS as i64 {
                    return Err(format!(
                        "'ip_lease' must be at least {} seconds",
                        MIN_IP_LEASE_SECS
                    ));
                }
            }
            ("idle_timeout" | "session_timeout", ConfigValue::Int(n)) => {
                if *n < 0 {
                    return Err(format!("'{}' cannot be negative", key));
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Validate and apply a runtime update.
    ///
    /// The update is applied to a copy first and the whole configuration is
    /// re-validated, so cross-field rules (pool bounds inside the CIDR, DPD
    /// greater than keepalive) hold after a successful call.
    pub fn apply_update(&mut self, key: &str, value: ConfigValue) -> Result<(), String> {
        Self::validate_update(key, &value)?;

        let mut next = self.clone();
        match (key, value) {
            ("ipv4_start", ConfigValue::Str(s)) => next.ipv4_start = parse_ipv4(key, &s)?,
            ("ipv4_end", ConfigValue::Str(s)) => next.ipv4_end = parse_ipv4(key, &s)?,
            ("mtu", ConfigValue::Int(n)) => next.mtu = to_int(key, n)?,
            ("iptables_nat", ConfigValue::Bool(b)) => next.iptables_nat = b,
            ("max_client", ConfigValue::Int(n)) => next.max_client = to_int(key, n)?,
            ("max_user_client", ConfigValue::Int(n)) => next.max_user_client = to_int(key, n)?,
            ("ip_lease", ConfigValue::Int(n)) => next.ip_lease = to_int(key, n)?,
            ("cstp_keepalive", ConfigValue::Int(n)) => next.cstp_keepalive = to_int(key, n)?,
            ("cstp_dpd", ConfigValue::Int(n)) => next.cstp_dpd = to_int(key, n)?,
            ("mobile_keepalive", ConfigValue::Int(n)) => next.mobile_keepalive = to_int(key, n)?,
            ("mobile_dpd", ConfigValue::Int(n)) => next.mobile_dpd = to_int(key, n)?,
            ("idle_timeout", ConfigValue::Int(n)) => next.idle_timeout = to_int(key, n)?,
            ("session_timeout", ConfigValue::Int(n)) => next.session_timeout = to_int(key, n)?,
            (key, _) => return Err(format!("'{}' cannot be changed at runtime", key)),
        }

        next.validate()?;
        *self = next;
        Ok(())
    }

    /// Current value of a setting, by table name.
    pub fn get(&self, key: &str) -> Option<ConfigValue> {
        let value = match key {
            "ipv4_master" => ConfigValue::Str(self.ipv4_master.clone()),
            "ipv4_cidr" => ConfigValue::Str(self.ipv4_cidr.to_string()),
            "ipv4_gateway" => ConfigValue::Str(self.ipv4_gateway.to_string()),
            "ipv4_start" => ConfigValue::Str(self.ipv4_start.to_string()),
            "ipv4_end" => ConfigValue::Str(self.ipv4_end.to_string()),
            "mtu" => ConfigValue::Int(i64::from(self.mtu)),
            "link_mode" => ConfigValue::Str(self.link_mode.to_string()),
            "iptables_nat" => ConfigValue::Bool(self.iptables_nat),
            "in_container" => ConfigValue::Bool(self.in_container),
            "max_client" => ConfigValue::Int(i64::from(self.max_client)),
            "max_user_client" => ConfigValue::Int(i64::from(self.max_user_client)),
            "ip_lease" => ConfigValue::Int(self.ip_lease as i64),
            "cstp_keepalive" => ConfigValue::Int(i64::from(self.cstp_keepalive)),
            "cstp_dpd" => ConfigValue::Int(i64::from(self.cstp_dpd)),
            "mobile_keepalive" => ConfigValue::Int(i64::from(self.mobile_keepalive)),
            "mobile_dpd" => ConfigValue::Int(i64::from(self.mobile_dpd)),
            "idle_timeout" => ConfigValue::Int(self.idle_timeout as i64),
            "session_timeout" => ConfigValue::Int(self.session_timeout as i64),
            "ip_map_file" => ConfigValue::Str(self.ip_map_file.display().to_string()),
            _ => return None,
        };
        Some(value)
    }
}

// ============================================================================
// Field table
// ============================================================================

/// Kind of value a setting holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Int,
    Bool,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::Str => "string",
            ValueKind::Int => "integer",
            ValueKind::Bool => "boolean",
        })
    }
}

/// A dynamically supplied setting value (e.g., from an admin request).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl ConfigValue {
    /// Kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            ConfigValue::Str(_) => ValueKind::Str,
            ConfigValue::Int(_) => ValueKind::Int,
            ConfigValue::Bool(_) => ValueKind::Bool,
        }
    }

    /// Parse raw text as a value of the given kind.
    pub fn parse(kind: ValueKind, raw: &str) -> Result<Self, String> {
        match kind {
            ValueKind::Str => Ok(ConfigValue::Str(raw.to_string())),
            ValueKind::Int => raw
                .trim()
                .parse()
                .map(ConfigValue::Int)
                .map_err(|_| format!("'{}' is not an integer", raw)),
            ValueKind::Bool => raw
                .trim()
                .parse()
                .map(ConfigValue::Bool)
                .map_err(|_| format!("'{}' is not a boolean", raw)),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Str(s) => f.write_str(s),
            ConfigValue::Int(n) => write!(f, "{}", n),
            ConfigValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// One entry of the settings table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigField {
    pub name: &'static str,
    pub kind: ValueKind,
    /// Sensitive settings require a restart to change.
    pub sensitive: bool,
}

const fn field(name: &'static str, kind: ValueKind, sensitive: bool) -> ConfigField {
    ConfigField {
        name,
        kind,
        sensitive,
    }
}

/// Every setting of [`GatewayConfig`], in declaration order.
pub const CONFIG_FIELDS: &[ConfigField] = &[
    field("ipv4_master", ValueKind::Str, true),
    field("ipv4_cidr", ValueKind::Str, true),
    field("ipv4_gateway", ValueKind::Str, true),
    field("ipv4_start", ValueKind::Str, false),
    field("ipv4_end", ValueKind::Str, false),
    field("mtu", ValueKind::Int, false),
    field("link_mode", ValueKind::Str, true),
    field("iptables_nat", ValueKind::Bool, false),
    field("in_container", ValueKind::Bool, true),
    field("max_client", ValueKind::Int, false),
    field("max_user_client", ValueKind::Int, false),
    field("ip_lease", ValueKind::Int, false),
    field("cstp_keepalive", ValueKind::Int, false),
    field("cstp_dpd", ValueKind::Int, false),
    field("mobile_keepalive", ValueKind::Int, false),
    field("mobile_dpd", ValueKind::Int, false),
    field("idle_timeout", ValueKind::Int, false),
    field("session_timeout", ValueKind::Int, false),
    field("ip_map_file", ValueKind::Str, true),
];

/// Look up a setting by name.
pub fn config_field(name: &str) -> Option<&'static ConfigField> {
    CONFIG_FIELDS.iter().find(|f| f.name == name)
}

fn validate_mtu(mtu: i64) -> Result<(), String> {
    if mtu < i64::from(MIN_MTU) || mtu > i64::from(MAX_MTU) {
        return Err(format!(
            "'mtu' must be between {} and {}, got {}",
            MIN_MTU, MAX_MTU, mtu
        ));
    }
    Ok(())
}

fn parse_ipv4(key: &str, s: &str) -> Result<Ipv4Addr, String> {
    s.parse()
        .map_err(|_| format!("'{}' is not a valid IPv4 address: {}", key, s))
}

fn to_int<T: TryFrom<i64>>(key: &str, n: i64) -> Result<T, String> {
    T::try_from(n).map_err(|_| format!("'{}' value {} is out of range", key, n))
}

// Default value functions for serde
fn default_ipv4_master() -> String {
    "eth0".to_string()
}

fn default_ipv4_cidr() -> Ipv4Net {
    let network = Ipv4Addr::new(192, 168, 90, 0);
    Ipv4Net::new(network, 24).unwrap_or_else(|_| Ipv4Net::from(network))
}

fn default_ipv4_gateway() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 90, 1)
}

fn default_ipv4_start() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 90, 100)
}

fn default_ipv4_end() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 90, 200)
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

fn default_true() -> bool {
    true
}

fn default_max_client() -> u32 {
    200
}

fn default_max_user_client() -> u32 {
    3
}

fn default_ip_lease() -> u64 {
    86400
}

fn default_cstp_keepalive() -> u32 {
    4
}

fn default_cstp_dpd() -> u32 {
    30
}

fn default_mobile_keepalive() -> u32 {
    4
}

fn default_mobile_dpd() -> u32 {
    60
}

fn default_ip_map_file() -> PathBuf {
    PathBuf::from(DEFAULT_IP_MAP_FILE)
}
