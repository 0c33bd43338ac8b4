use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    pub key: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub values: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects the endpoints a policy rule applies to.
///
/// An empty selector selects every endpoint in the policy's namespace.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<Map>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_expressions: Option<Expressions>,
}

// === Selector ===

impl Selector {
    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.as_ref().map_or(true, |m| m.is_empty())
            && self.match_expressions.as_ref().map_or(true, |e| e.is_empty())
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    #[test]
    fn empty_selectors() {
        for (selector, empty, msg) in &[
            (Selector::default(), true, "default"),
            (Selector::from_map(Map::new()), true, "empty labels"),
            (Selector::from_expressions(vec![]), true, "empty expressions"),
            (
                Selector::from_iter(Some(("app", "web"))),
                false,
                "label match",
            ),
            (
                Selector::from_iter(Some(Expression {
                    key: "app".into(),
                    operator: Operator::Exists,
                    values: BTreeSet::new(),
                })),
                false,
                "expression match",
            ),
        ] {
            assert_eq!(selector.is_empty(), *empty, "{}", msg);
        }
    }

    #[test]
    fn deserializes_camel_case() {
        let selector: Selector = serde_json::from_value(serde_json::json!({
            "matchLabels": { "app": "web" },
            "matchExpressions": [{ "key": "tier", "operator": "In", "values": ["a", "b"] }],
        }))
        .unwrap();
        assert_eq!(
            selector.match_labels,
            Some(maplit::btreemap! { "app".to_string() => "web".to_string() })
        );
        let exprs = selector.match_expressions.unwrap();
        assert_eq!(exprs[0].operator, Operator::In);
        assert_eq!(exprs[0].values.len(), 2);
    }
}
