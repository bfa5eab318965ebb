use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

/// True when the selector selects nothing on purpose: no matchLabels and no
/// matchExpressions. Controllers refuse to act on empty selectors to avoid
/// selecting every object in a namespace.
pub fn is_empty(selector: &LabelSelector) -> bool {
    selector
        .match_labels
        .as_ref()
        .map(BTreeMap::is_empty)
        .unwrap_or(true)
        && selector
            .match_expressions
            .as_ref()
            .map(Vec::is_empty)
            .unwrap_or(true)
}

/// Evaluates a selector against a label map, supporting matchLabels and the
/// In/NotIn/Exists/DoesNotExist expression operators.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expression in expressions {
            let actual = labels.get(&expression.key);
            let values = expression.values.as_deref().unwrap_or(&[]);
            let matched = match expression.operator.as_str() {
                "In" => actual.is_some_and(|v| values.contains(v)),
                "NotIn" => !actual.is_some_and(|v| values.contains(v)),
                "Exists" => actual.is_some(),
                "DoesNotExist" => actual.is_none(),
                _ => false,
            };
            if !matched {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_detection() {
        assert!(is_empty(&LabelSelector::default()));
        let selector = LabelSelector {
            match_labels: Some(labels(&[("role", "worker")])),
            ..Default::default()
        };
        assert!(!is_empty(&selector));
    }

    #[test]
    fn test_match_labels() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("role", "worker")])),
            ..Default::default()
        };
        assert!(matches(&selector, &labels(&[("role", "worker"), ("zone", "a")])));
        assert!(!matches(&selector, &labels(&[("role", "master")])));
        assert!(!matches(&selector, &labels(&[])));
    }

    #[test]
    fn test_match_expressions() {
        let selector = LabelSelector {
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "role".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec!["worker".to_string(), "infra".to_string()]),
                },
                LabelSelectorRequirement {
                    key: "quarantined".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                },
            ]),
            ..Default::default()
        };
        assert!(matches(&selector, &labels(&[("role", "infra")])));
        assert!(!matches(&selector, &labels(&[("role", "master")])));
        assert!(!matches(
            &selector,
            &labels(&[("role", "worker"), ("quarantined", "true")])
        ));
    }

}
