//! Configuration types, deserialisable from JSON/TOML via derived
//! `Serialize`/`Deserialize` for persistence and IPC.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListenPortConfig {
    pub port: u16,
    pub category_mask: u16,
    pub priority: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "in")]
    pub in_addr: String,
    #[serde(rename = "out")]
    pub out_addr: String,
    pub id: String,
    pub secret: String,
    pub category_mask: u16,
    pub priority: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticNodeConfig {
    pub public_key: String,
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalIdMode {
    #[serde(default)]
    pub direct_only: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalIdConfig {
    pub public_key: String,
    #[serde(default)]
    pub category: u16,
    #[serde(default)]
    pub mode: LocalIdMode,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AdnlConfig {
    /// Enables the persistent address-list cache when present.
    pub db_root: Option<PathBuf>,
    #[serde(default)]
    pub listen_ports: Vec<ListenPortConfig>,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    #[serde(default)]
    pub static_nodes: Vec<StaticNodeConfig>,
    #[serde(default)]
    pub local_ids: Vec<LocalIdConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_config() {
        let json = r#"{"local_ids":[{"public_key":"abcd","category":0}]}"#;
        let cfg: AdnlConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.db_root.is_none());
        assert_eq!(cfg.local_ids.len(), 1);
        assert!(!cfg.local_ids[0].mode.direct_only);
    }
}
