//! Cluster membership bookkeeping.
//!
//! Tracks the set of peer registry nodes and which one is "self". The
//! transport that discovers and health-checks peers lives outside this
//! crate; it reports state through [`MemberManager::update_state`].

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use taro_common::local_ip;

use crate::model::{Member, NodeState};

/// Server member manager for the local peer set.
pub struct MemberManager {
    local_address: String,
    members: DashMap<String, Member>,
}

impl MemberManager {
    /// Build a manager for `port` on the local address, seeded with the
    /// given peer addresses. Self is always a member.
    pub fn new(port: u16, seed_addresses: &[String]) -> Arc<Self> {
        let local = Member::new(local_ip(), port);
        Self::with_local_member(local, seed_addresses)
    }

    pub fn with_local_member(local: Member, seed_addresses: &[String]) -> Arc<Self> {
        let members = DashMap::new();
        members.insert(local.address.clone(), local.clone());
        for address in seed_addresses {
            if let Some(member) = Member::from_address(address) {
                members.insert(member.address.clone(), member);
            }
        }
        info!(
            "member manager up, local={}, peers={}",
            local.address,
            members.len()
        );
        Arc::new(Self {
            local_address: local.address,
            members,
        })
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn is_self(&self, address: &str) -> bool {
        self.local_address == address
    }

    /// True when this node is the only member.
    pub fn is_standalone(&self) -> bool {
        self.members.len() <= 1
    }

    pub fn all_members(&self) -> Vec<Member> {
        self.members.iter().map(|e| e.value().clone()).collect()
    }

    /// Alive members sorted by address. The sort keeps the distro hash
    /// stable across peers that see the same member set.
    pub fn healthy_members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .members
            .iter()
            .filter(|e| e.value().is_alive())
            .map(|e| e.value().clone())
            .collect();
        members.sort_by(|a, b| a.address.cmp(&b.address));
        members
    }

    pub fn member_join(&self, member: Member) {
        info!("member joined: {}", member.address);
        self.members.insert(member.address.clone(), member);
    }

    pub fn member_leave(&self, address: &str) {
        if self.members.remove(address).is_some() {
            info!("member left: {}", address);
        }
    }

    pub fn update_state(&self, address: &str, state: NodeState) {
        if let Some(mut member) = self.members.get_mut(address) {
            member.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<MemberManager> {
        MemberManager::with_local_member(
            Member::new("10.0.0.1".to_string(), 8848),
            &["10.0.0.2:8848".to_string(), "10.0.0.3:8848".to_string()],
        )
    }

    #[test]
    fn test_self_is_member() {
        let manager = manager();
        assert!(manager.is_self("10.0.0.1:8848"));
        assert_eq!(manager.all_members().len(), 3);
        assert!(!manager.is_standalone());
    }

    #[test]
    fn test_healthy_members_sorted() {
        let manager = manager();
        let healthy = manager.healthy_members();
        let addresses: Vec<&str> = healthy.iter().map(|m| m.address.as_str()).collect();
        assert_eq!(
            addresses,
            vec!["10.0.0.1:8848", "10.0.0.2:8848", "10.0.0.3:8848"]
        );
    }

    #[test]
    fn test_down_member_excluded() {
        let manager = manager();
        manager.update_state("10.0.0.2:8848", NodeState::Down);
        assert_eq!(manager.healthy_members().len(), 2);
        assert_eq!(manager.all_members().len(), 3);
    }

    #[test]
    fn test_member_join_and_leave() {
        let manager = manager();
        manager.member_join(Member::new("10.0.0.4".to_string(), 8848));
        assert_eq!(manager.all_members().len(), 4);
        manager.member_leave("10.0.0.4:8848");
        assert_eq!(manager.all_members().len(), 3);
    }

    #[test]
    fn test_standalone() {
        let manager =
            MemberManager::with_local_member(Member::new("10.0.0.1".to_string(), 8848), &[]);
        assert!(manager.is_standalone());
    }
}
