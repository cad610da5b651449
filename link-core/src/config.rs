// Network configuration structures that can be tested independently
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

pub const DEFAULT_COMMAND_PORT: u16 = 50001;
pub const DEFAULT_UPDATE_PORT: u16 = 3232;

const MAX_SSID_LEN: usize = 32;
const MAX_CREDENTIAL_LEN: usize = 64;

/// Maximum station transmit power. Discriminants follow the ESP-IDF
/// `esp_wifi_set_max_tx_power` unit of 0.25 dBm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPower {
    Dbm19_5,
    Dbm19,
    Dbm18_5,
    Dbm17,
    Dbm15,
    Dbm13,
    Dbm11,
    Dbm8_5,
    Dbm7,
    Dbm5,
    Dbm2,
    DbmMinus1,
}

impl TxPower {
    pub fn quarter_dbm(self) -> i8 {
        match self {
            Self::Dbm19_5 => 78,
            Self::Dbm19 => 76,
            Self::Dbm18_5 => 74,
            Self::Dbm17 => 68,
            Self::Dbm15 => 60,
            Self::Dbm13 => 52,
            Self::Dbm11 => 44,
            Self::Dbm8_5 => 34,
            Self::Dbm7 => 28,
            Self::Dbm5 => 20,
            Self::Dbm2 => 8,
            Self::DbmMinus1 => -4,
        }
    }

    pub fn dbm(self) -> f32 {
        self.quarter_dbm() as f32 / 4.0
    }
}

impl Default for TxPower {
    fn default() -> Self {
        Self::Dbm11
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    pub ssid: String,
    pub credential: String,
    pub host_offset: u8,
    pub gateway_base: [u8; 3],
    pub subnet_mask: [u8; 4],
    pub update_auth_secret: String,
    pub tx_power: TxPower,
    pub command_port: u16,
    pub update_port: u16,
    /// `None` keeps waiting for the access point forever.
    pub connect_timeout_ms: Option<u32>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            credential: String::new(),
            host_offset: 10,
            gateway_base: [192, 168, 1],
            subnet_mask: [255, 255, 255, 0],
            update_auth_secret: String::new(),
            tx_power: TxPower::default(),
            command_port: DEFAULT_COMMAND_PORT,
            update_port: DEFAULT_UPDATE_PORT,
            connect_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticAddressing {
    pub local: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl StaticAddressing {
    pub fn prefix_len(&self) -> u8 {
        u32::from(self.mask).count_ones() as u8
    }
}

impl fmt::Display for StaticAddressing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} via {}", self.local, self.prefix_len(), self.gateway)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidSsid(usize),
    CredentialTooLong(usize),
    InvalidHostOffset(u8),
    InvalidSubnetMask([u8; 4]),
    GatewayOutsideSubnet,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSsid(len) => write!(f, "SSID must be 1..={MAX_SSID_LEN} bytes, got {len}"),
            Self::CredentialTooLong(len) => {
                write!(f, "credential must be at most {MAX_CREDENTIAL_LEN} bytes, got {len}")
            }
            Self::InvalidHostOffset(offset) => {
                write!(f, "host offset {offset} collides with network, gateway or broadcast")
            }
            Self::InvalidSubnetMask(m) => {
                write!(f, "subnet mask {}.{}.{}.{} is not contiguous", m[0], m[1], m[2], m[3])
            }
            Self::GatewayOutsideSubnet => write!(f, "gateway is not inside the local subnet"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssid.is_empty() || self.ssid.len() > MAX_SSID_LEN {
            return Err(ConfigError::InvalidSsid(self.ssid.len()));
        }
        if self.credential.len() > MAX_CREDENTIAL_LEN {
            return Err(ConfigError::CredentialTooLong(self.credential.len()));
        }
        self.addressing().map(|_| ())
    }

    /// Local address is the configured prefix plus the host offset, the
    /// gateway is the same prefix plus `.1`.
    pub fn addressing(&self) -> Result<StaticAddressing, ConfigError> {
        if matches!(self.host_offset, 0 | 1 | 255) {
            return Err(ConfigError::InvalidHostOffset(self.host_offset));
        }

        let mask_bits = u32::from_be_bytes(self.subnet_mask);
        if mask_bits == 0 || (!mask_bits).wrapping_add(1) & !mask_bits != 0 {
            return Err(ConfigError::InvalidSubnetMask(self.subnet_mask));
        }

        let [a, b, c] = self.gateway_base;
        let local = Ipv4Addr::new(a, b, c, self.host_offset);
        let gateway = Ipv4Addr::new(a, b, c, 1);
        let mask = Ipv4Addr::from(self.subnet_mask);

        if u32::from(local) & mask_bits != u32::from(gateway) & mask_bits {
            return Err(ConfigError::GatewayOutsideSubnet);
        }

        Ok(StaticAddressing { local, gateway, mask })
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(|ms| Duration::from_millis(ms as u64))
    }

    pub fn has_update_auth(&self) -> bool {
        !self.update_auth_secret.is_empty()
    }
}

/// Poll cadences of the two background loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimings {
    pub connect_blink: Duration,
    pub update_poll: Duration,
    pub command_poll: Duration,
}

impl Default for LinkTimings {
    fn default() -> Self {
        Self {
            connect_blink: Duration::from_millis(250),
            update_poll: Duration::from_millis(50),
            command_poll: Duration::from_millis(50),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NetworkConfig {
        NetworkConfig {
            ssid: "arena".to_string(),
            credential: "hunter22".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_offset_five_resolves_to_dot_five() {
        let mut cfg = config();
        cfg.host_offset = 5;
        cfg.gateway_base = [192, 168, 1];

        let addr = cfg.addressing().unwrap();
        assert_eq!(addr.local, Ipv4Addr::new(192, 168, 1, 5));
        assert_eq!(addr.gateway, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(addr.mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(addr.prefix_len(), 24);
        assert_eq!(addr.to_string(), "192.168.1.5/24 via 192.168.1.1");
    }

    #[test]
    fn test_reserved_offsets_rejected() {
        for offset in [0u8, 1, 255] {
            let mut cfg = config();
            cfg.host_offset = offset;
            assert_eq!(cfg.addressing(), Err(ConfigError::InvalidHostOffset(offset)));
        }
    }

    #[test]
    fn test_non_contiguous_mask_rejected() {
        let mut cfg = config();
        cfg.subnet_mask = [255, 0, 255, 0];
        assert_eq!(
            cfg.addressing(),
            Err(ConfigError::InvalidSubnetMask([255, 0, 255, 0]))
        );

        cfg.subnet_mask = [0, 0, 0, 0];
        assert!(cfg.addressing().is_err());
    }

    #[test]
    fn test_gateway_must_share_subnet() {
        let mut cfg = config();
        cfg.subnet_mask = [255, 255, 255, 128];
        cfg.host_offset = 200;
        assert_eq!(cfg.addressing(), Err(ConfigError::GatewayOutsideSubnet));

        cfg.host_offset = 100;
        assert!(cfg.addressing().is_ok());
    }

    #[test]
    fn test_validate_checks_ssid_and_credential() {
        let mut cfg = config();
        assert!(cfg.validate().is_ok());

        cfg.ssid.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidSsid(0)));

        cfg.ssid = "x".repeat(33);
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidSsid(33)));

        cfg.ssid = "arena".to_string();
        cfg.credential = "p".repeat(65);
        assert_eq!(cfg.validate(), Err(ConfigError::CredentialTooLong(65)));
    }

    #[test]
    fn test_network_config_serialization() {
        let mut cfg = config();
        cfg.connect_timeout_ms = Some(30_000);
        cfg.tx_power = TxPower::Dbm8_5;

        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"hostOffset\":10"));
        assert!(json.contains("\"connectTimeoutMs\":30000"));

        let deserialized: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, deserialized);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: NetworkConfig =
            serde_json::from_str(r#"{"ssid":"arena","hostOffset":42}"#).unwrap();
        assert_eq!(cfg.host_offset, 42);
        assert_eq!(cfg.command_port, DEFAULT_COMMAND_PORT);
        assert_eq!(cfg.update_port, DEFAULT_UPDATE_PORT);
        assert_eq!(cfg.tx_power, TxPower::Dbm11);
        assert!(cfg.connect_timeout().is_none());
        assert!(!cfg.has_update_auth());
    }

    #[test]
    fn test_tx_power_units() {
        assert_eq!(TxPower::Dbm11.quarter_dbm(), 44);
        assert_eq!(TxPower::Dbm19_5.dbm(), 19.5);
        assert_eq!(TxPower::DbmMinus1.dbm(), -1.0);
    }
}
