//! Consistency key construction and parsing.
//!
//! Three key families exist: service meta, ephemeral instance lists and
//! persistent instance lists. The meta key omits the namespace segment
//! for the default namespace, so the inverse parser has to distinguish a
//! leading namespace from a service name containing dots; canonical
//! service names always contain the `::` splitter, which resolves it.

use taro_common::DEFAULT_NAMESPACE;

use crate::model::SERVICE_NAME_SPLITTER;

pub const SERVICE_META_KEY_PREFIX: &str = "com.alibaba.nacos.naming.domains.meta.";
pub const INSTANCE_LIST_KEY_PREFIX: &str = "com.alibaba.nacos.naming.iplist.";
pub const EPHEMERAL_INSTANCE_LIST_KEY_PREFIX: &str = "com.alibaba.nacos.naming.iplist.ephemeral.";

/// Namespace separator inside instance-list keys.
const NAMESPACE_KEY_CONNECTOR: &str = "##";

/// Reserved service name of the runtime switch record.
pub const SWITCH_DOMAIN_NAME: &str = "00-00---000-NACOS_SWITCH_DOMAIN-000---00-00";

pub fn build_service_meta_key(namespace_id: &str, service_name: &str) -> String {
    if namespace_id == DEFAULT_NAMESPACE {
        format!("{}{}", SERVICE_META_KEY_PREFIX, service_name)
    } else {
        format!("{}{}.{}", SERVICE_META_KEY_PREFIX, namespace_id, service_name)
    }
}

pub fn build_instance_list_key(namespace_id: &str, service_name: &str, ephemeral: bool) -> String {
    let prefix = if ephemeral {
        EPHEMERAL_INSTANCE_LIST_KEY_PREFIX
    } else {
        INSTANCE_LIST_KEY_PREFIX
    };
    format!(
        "{}{}{}{}",
        prefix, namespace_id, NAMESPACE_KEY_CONNECTOR, service_name
    )
}

pub fn match_service_meta_key(key: &str) -> bool {
    key.starts_with(SERVICE_META_KEY_PREFIX)
}

pub fn match_instance_list_key(key: &str) -> bool {
    key.starts_with(INSTANCE_LIST_KEY_PREFIX)
}

pub fn match_ephemeral_instance_list_key(key: &str) -> bool {
    key.starts_with(EPHEMERAL_INSTANCE_LIST_KEY_PREFIX)
}

pub fn match_switch_key(key: &str) -> bool {
    key.contains(SWITCH_DOMAIN_NAME)
}

/// Parse a service-meta key into `(namespace, service_name)`.
///
/// Namespace ids must not contain `.`; a leading segment without the
/// `::` splitter is read as the namespace, anything else as a service
/// name in the default namespace.
pub fn parse_service_meta_key(key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix(SERVICE_META_KEY_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    if let Some((head, tail)) = rest.split_once('.')
        && !head.contains(SERVICE_NAME_SPLITTER)
        && !tail.is_empty()
    {
        return Some((head.to_string(), tail.to_string()));
    }
    Some((DEFAULT_NAMESPACE.to_string(), rest.to_string()))
}

/// Parse an instance-list key into `(namespace, service_name, ephemeral)`.
pub fn parse_instance_list_key(key: &str) -> Option<(String, String, bool)> {
    let (rest, ephemeral) = match key.strip_prefix(EPHEMERAL_INSTANCE_LIST_KEY_PREFIX) {
        Some(rest) => (rest, true),
        None => (key.strip_prefix(INSTANCE_LIST_KEY_PREFIX)?, false),
    };
    let (namespace_id, service_name) = rest.split_once(NAMESPACE_KEY_CONNECTOR)?;
    if namespace_id.is_empty() || service_name.is_empty() {
        return None;
    }
    Some((namespace_id.to_string(), service_name.to_string(), ephemeral))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_key_default_namespace_omitted() {
        let key = build_service_meta_key("public", "DEFAULT_GROUP::svc");
        assert_eq!(
            key,
            "com.alibaba.nacos.naming.domains.meta.DEFAULT_GROUP::svc"
        );
        assert_eq!(
            parse_service_meta_key(&key).unwrap(),
            ("public".to_string(), "DEFAULT_GROUP::svc".to_string())
        );
    }

    #[test]
    fn test_meta_key_with_namespace() {
        let key = build_service_meta_key("dev", "DEFAULT_GROUP::svc");
        assert_eq!(
            key,
            "com.alibaba.nacos.naming.domains.meta.dev.DEFAULT_GROUP::svc"
        );
        assert_eq!(
            parse_service_meta_key(&key).unwrap(),
            ("dev".to_string(), "DEFAULT_GROUP::svc".to_string())
        );
    }

    #[test]
    fn test_meta_key_dotted_service_name() {
        let key = build_service_meta_key("public", "DEFAULT_GROUP::my.svc");
        assert_eq!(
            parse_service_meta_key(&key).unwrap(),
            ("public".to_string(), "DEFAULT_GROUP::my.svc".to_string())
        );
    }

    #[test]
    fn test_instance_list_keys() {
        let ephemeral = build_instance_list_key("public", "DEFAULT_GROUP::svc", true);
        assert_eq!(
            ephemeral,
            "com.alibaba.nacos.naming.iplist.ephemeral.public##DEFAULT_GROUP::svc"
        );
        let persistent = build_instance_list_key("public", "DEFAULT_GROUP::svc", false);
        assert_eq!(
            persistent,
            "com.alibaba.nacos.naming.iplist.public##DEFAULT_GROUP::svc"
        );

        assert!(match_ephemeral_instance_list_key(&ephemeral));
        assert!(!match_ephemeral_instance_list_key(&persistent));
        assert!(match_instance_list_key(&ephemeral));
        assert!(match_instance_list_key(&persistent));
    }

    #[test]
    fn test_parse_instance_list_key() {
        let key = build_instance_list_key("dev", "G::svc", true);
        assert_eq!(
            parse_instance_list_key(&key).unwrap(),
            ("dev".to_string(), "G::svc".to_string(), true)
        );
        let key = build_instance_list_key("dev", "G::svc", false);
        assert_eq!(
            parse_instance_list_key(&key).unwrap(),
            ("dev".to_string(), "G::svc".to_string(), false)
        );
        assert!(parse_instance_list_key("com.alibaba.nacos.naming.iplist.noconnector").is_none());
    }

    #[test]
    fn test_meta_key_is_not_instance_list_key() {
        let key = build_service_meta_key("public", "DEFAULT_GROUP::svc");
        assert!(match_service_meta_key(&key));
        assert!(!match_instance_list_key(&key));
    }

    #[test]
    fn test_switch_key() {
        let key = build_service_meta_key("public", SWITCH_DOMAIN_NAME);
        assert!(match_switch_key(&key));
        assert!(!match_switch_key(
            &build_service_meta_key("public", "DEFAULT_GROUP::svc")
        ));
    }
}
