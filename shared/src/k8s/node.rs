use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus, Taint};

const NODE_READY_CONDITION: &str = "Ready";
const INTERNAL_IP_ADDRESS_TYPE: &str = "InternalIP";

/// Returns the `Ready` condition of a Node, if reported.
pub fn ready_condition(node: &Node) -> Option<&NodeCondition> {
    node.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|condition| condition.type_ == NODE_READY_CONDITION)
}

/// This determines if a node is in the Ready state.
pub fn is_node_ready(k8s_node: &Node) -> bool {
    ready_condition(k8s_node).is_some_and(|condition| condition.status == "True")
}

/// InternalIP addresses reported in the Node status.
pub fn internal_addresses(node: &Node) -> Vec<String> {
    node.status
        .as_ref()
        .unwrap_or(&NodeStatus::default())
        .addresses
        .as_ref()
        .unwrap_or(&Vec::new())
        .iter()
        .filter(|address| address.type_ == INTERNAL_IP_ADDRESS_TYPE)
        .map(|address| address.address.clone())
        .collect()
}

/// Taint identity is (key, effect); values do not participate.
pub fn has_taint(taints: &[Taint], candidate: &Taint) -> bool {
    taints
        .iter()
        .any(|taint| taint.key == candidate.key && taint.effect == candidate.effect)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(conditions: serde_json::Value, addresses: serde_json::Value) -> Node {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": { "name": "node-a" },
            "status": { "conditions": conditions, "addresses": addresses }
        }))
        .unwrap()
    }

    #[test]
    fn test_is_node_ready() {
        let ready = node(
            json!([
                { "type": "MemoryPressure", "status": "False" },
                { "type": "Ready", "status": "True" }
            ]),
            json!([]),
        );
        assert!(is_node_ready(&ready));

        let not_ready = node(json!([{ "type": "Ready", "status": "Unknown" }]), json!([]));
        assert!(!is_node_ready(&not_ready));

        assert!(!is_node_ready(&Node::default()));
    }

    #[test]
    fn test_internal_addresses_filters_type() {
        let node = node(
            json!([]),
            json!([
                { "type": "ExternalIP", "address": "198.51.100.7" },
                { "type": "InternalIP", "address": "10.0.0.5" },
                { "type": "Hostname", "address": "node-a" }
            ]),
        );
        assert_eq!(internal_addresses(&node), vec!["10.0.0.5".to_string()]);
    }

    #[test]
    fn test_has_taint_matches_key_and_effect_only() {
        let existing = vec![Taint {
            key: "dedicated".to_string(),
            effect: "NoSchedule".to_string(),
            value: Some("gpu".to_string()),
            ..Default::default()
        }];
        let same_identity = Taint {
            key: "dedicated".to_string(),
            effect: "NoSchedule".to_string(),
            value: Some("other".to_string()),
            ..Default::default()
        };
        let other_effect = Taint {
            key: "dedicated".to_string(),
            effect: "NoExecute".to_string(),
            ..Default::default()
        };
        assert!(has_taint(&existing, &same_identity));
        assert!(!has_taint(&existing, &other_effect));
    }
}
