//! Instance-list merging.
//!
//! Computes the next authoritative instance list for one plane of a
//! service, given the action and the current list held by the
//! consistency layer. The caller writes the result back through
//! `Consistency.put`; the in-memory table only changes when that write
//! notifies back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use taro_common::{Result, TaroError};
use taro_consistency::ConsistencyService;

use crate::key::build_instance_list_key;
use crate::model::{DEFAULT_CLUSTER, Instance, Instances};
use crate::service::Service;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Add,
    Remove,
}

/// Smallest unused non-negative integer rendered as a string; the chosen
/// id is inserted into `seen`.
pub fn generate_instance_id(seen: &mut HashSet<String>) -> String {
    let mut candidate: u64 = 0;
    loop {
        let id = candidate.to_string();
        if seen.insert(id.clone()) {
            return id;
        }
        candidate += 1;
    }
}

/// Compute the merged instance list for the given plane.
pub async fn merge(
    service: &Arc<Service>,
    consistency: &dyn ConsistencyService,
    action: Action,
    ephemeral: bool,
    new_ips: Vec<Instance>,
    snowflake_ids: bool,
) -> Result<Vec<Instance>> {
    let key = build_instance_list_key(&service.namespace_id, &service.name, ephemeral);

    let remote: Vec<Instance> = match consistency.get(&key).await? {
        Some(datum) => serde_json::from_value::<Instances>(datum.value)
            .map_err(|e| TaroError::ConsistencyFailure(format!("bad instance list {}: {}", key, e)))?
            .instance_list,
        None => Vec::new(),
    };

    let local: HashMap<String, Instance> = service
        .all_ips_of_plane(ephemeral)
        .into_iter()
        .map(|i| (i.ip_addr(), i))
        .collect();
    let mut current_ids: HashSet<String> =
        local.values().map(|i| i.instance_id.clone()).collect();

    // The remote snapshot wins on identity, local health and beat survive.
    let mut merged: HashMap<String, Instance> = HashMap::with_capacity(remote.len());
    for mut instance in remote {
        if let Some(held) = local.get(&instance.ip_addr()) {
            instance.healthy = held.healthy;
            instance.last_beat = held.last_beat;
        }
        merged.insert(instance.datum_key(), instance);
    }

    for mut instance in new_ips {
        if instance.cluster_name.is_empty() {
            instance.cluster_name = DEFAULT_CLUSTER.to_string();
        }
        service.get_or_create_cluster(&instance.cluster_name);
        match action {
            Action::Remove => {
                merged.remove(&instance.datum_key());
            }
            Action::Add => {
                instance.instance_id = if snowflake_ids {
                    generate_instance_id(&mut current_ids)
                } else {
                    instance.composite_id()
                };
                merged.insert(instance.datum_key(), instance);
            }
        }
    }

    if action == Action::Add && merged.is_empty() {
        return Err(TaroError::InvalidArgument(format!(
            "add produced an empty instance list for {}",
            service.name
        )));
    }

    debug!(
        "merged {} plane of {}: {} instances",
        if ephemeral { "ephemeral" } else { "persistent" },
        service.name,
        merged.len()
    );
    Ok(merged.into_values().collect())
}
