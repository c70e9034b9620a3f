//! Peer member model.

use serde::{Deserialize, Serialize};

/// Liveness state of a peer registry node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeState {
    #[default]
    Up,
    Suspicious,
    Down,
}

/// One peer registry node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub ip: String,
    pub port: u16,
    pub state: NodeState,
    pub address: String,
}

impl Member {
    pub fn new(ip: String, port: u16) -> Self {
        let address = format!("{}:{}", ip, port);
        Self {
            ip,
            port,
            state: NodeState::Up,
            address,
        }
    }

    /// Parse an `ip:port` address into a member.
    pub fn from_address(address: &str) -> Option<Self> {
        let (ip, port) = address.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        Some(Self::new(ip.to_string(), port))
    }

    pub fn is_alive(&self) -> bool {
        self.state == NodeState::Up
    }
}
