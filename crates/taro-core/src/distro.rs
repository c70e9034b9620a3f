//! Distro ownership routing.
//!
//! Every service name is owned by exactly one alive peer: the name is
//! hashed onto the sorted healthy member list. The owner reports the
//! service's checksum during anti-entropy and reaps it when empty;
//! everyone else is downstream for that name.

use std::sync::Arc;

use crate::cluster::MemberManager;

/// Hash-based ownership decisions over the live peer set.
pub struct DistroMapper {
    members: Arc<MemberManager>,
    distro_enabled: bool,
}

/// Deterministic 31-based string hash. Stable across peers and runs,
/// which the ownership partition depends on.
fn distro_hash(name: &str) -> u32 {
    let mut hash: i32 = 0;
    for b in name.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(b as i32);
    }
    hash.unsigned_abs()
}

impl DistroMapper {
    pub fn new(members: Arc<MemberManager>, distro_enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            members,
            distro_enabled,
        })
    }

    /// Does this peer own responsibility for `service_name`?
    pub fn responsible(&self, service_name: &str) -> bool {
        if !self.distro_enabled || self.members.is_standalone() {
            return true;
        }
        let servers = self.members.healthy_members();
        if servers.is_empty() {
            return false;
        }
        let Some(index) = servers
            .iter()
            .position(|m| self.members.is_self(&m.address))
        else {
            // Not in the healthy list yet (e.g. still joining): take
            // responsibility rather than dropping work on the floor.
            return true;
        };
        distro_hash(service_name) as usize % servers.len() == index
    }

    /// Address of the peer that owns `service_name`.
    pub fn map_server(&self, service_name: &str) -> String {
        let servers = self.members.healthy_members();
        if !self.distro_enabled || servers.is_empty() {
            return self.members.local_address().to_string();
        }
        let index = distro_hash(service_name) as usize % servers.len();
        servers[index].address.clone()
    }

    /// Snapshot of the healthy peer addresses, local peer included.
    pub fn cluster_state(&self) -> Vec<String> {
        self.members
            .healthy_members()
            .into_iter()
            .map(|m| m.address)
            .collect()
    }
}
