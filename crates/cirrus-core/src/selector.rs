use crate::resources::ResourceError;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::BTreeMap;

/// Evaluate a label selector against a label set.
///
/// An empty selector matches everything. Unknown operators are rejected.
pub fn matches(
    selector: &LabelSelector,
    labels: Option<&BTreeMap<String, String>>,
) -> Result<bool, ResourceError> {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);

    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }

    for requirement in selector.match_expressions.iter().flatten() {
        let values = requirement.values.as_deref().unwrap_or_default();
        let current = labels.get(&requirement.key);
        let ok = match requirement.operator.as_str() {
            "In" => current.is_some_and(|v| values.contains(v)),
            "NotIn" => current.is_none_or(|v| !values.contains(v)),
            "Exists" => current.is_some(),
            "DoesNotExist" => current.is_none(),
            other => {
                return Err(ResourceError::InvalidSelector(format!(
                    "unsupported operator '{}' for key '{}'",
                    other, requirement.key
                )))
            }
        };
        if !ok {
            return Ok(false);
        }
    }

    Ok(true)
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
    fn test_match_labels() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("region", "east")])),
            ..Default::default()
        };
        assert!(matches(&selector, Some(&labels(&[("region", "east"), ("x", "y")]))).unwrap());
        assert!(!matches(&selector, Some(&labels(&[("region", "west")]))).unwrap());
        assert!(!matches(&selector, None).unwrap());
        assert!(matches(&LabelSelector::default(), None).unwrap());
    }

    #[test]
    fn test_match_expressions() {
        let requirement = |op: &str, values: Option<Vec<&str>>| LabelSelectorRequirement {
            key: "zone".to_string(),
            operator: op.to_string(),
            values: values.map(|v| v.into_iter().map(String::from).collect()),
        };
        let set = labels(&[("zone", "a")]);
        let check = |r: LabelSelectorRequirement| {
            let selector = LabelSelector {
                match_expressions: Some(vec![r]),
                ..Default::default()
            };
            matches(&selector, Some(&set))
        };

        assert!(check(requirement("In", Some(vec!["a", "b"]))).unwrap());
        assert!(!check(requirement("NotIn", Some(vec!["a"]))).unwrap());
        assert!(check(requirement("Exists", None)).unwrap());
        assert!(!check(requirement("DoesNotExist", None)).unwrap());
        assert!(check(requirement("Gt", None)).is_err());
    }
}
