//! Cluster membership and distro ownership for the Taro naming core.

pub mod cluster;
pub mod distro;
pub mod model;

pub use cluster::MemberManager;
pub use distro::DistroMapper;
pub use model::{Member, NodeState};
