//! Dynamic-group rule compiler.
//!
//! A rule is a JSON tree:
//!
//! ```json
//! {"op": "and", "rules": [
//!     {"field": "environment", "op": "eq", "value": "prod"},
//!     {"field": "tags.role", "op": "in", "value": ["db", "cache"]},
//!     {"op": "or", "rules": [ ... ]}
//! ]}
//! ```
//!
//! Only allow-listed host fields (`name`, `hostname`, `environment`,
//! `os_type`, `username`, `port`, `tags.<key>`) and operators (`eq`, `neq`,
//! `contains`, `in`) are accepted. A missing or empty rule matches every
//! host. Anything malformed compiles to [`HostPredicate::Nothing`], so a
//! broken or tampered rule can never select the whole fleet.

use serde_json::Value;

use crate::types::Host;

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum HostPredicate {
    All,
    Nothing,
    And(Vec<HostPredicate>),
    Or(Vec<HostPredicate>),
    Condition(Condition),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: HostField,
    pub op: ConditionOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostField {
    Name,
    Hostname,
    Environment,
    OsType,
    Username,
    Port,
    Tag(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionOp {
    Eq(Value),
    Neq(Value),
    /// Lower-cased needle for case-insensitive substring matching.
    Contains(String),
    /// Never empty.
    In(Vec<Value>),
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Compile an optional rule. `None`, `null` and `{}` match all hosts.
pub fn compile(rule: Option<&Value>) -> HostPredicate {
    match rule {
        None | Some(Value::Null) => HostPredicate::All,
        Some(Value::Object(map)) if map.is_empty() => HostPredicate::All,
        Some(node) => compile_block(node),
    }
}

fn compile_block(node: &Value) -> HostPredicate {
    let Some(obj) = node.as_object() else {
        return HostPredicate::Nothing;
    };

    let op = match obj.get("op") {
        None | Some(Value::Null) => "and".to_string(),
        Some(Value::String(s)) => s.to_lowercase(),
        Some(_) => return HostPredicate::Nothing,
    };
    let Some(Value::Array(items)) = obj.get("rules") else {
        return HostPredicate::Nothing;
    };
    if op != "and" && op != "or" {
        return HostPredicate::Nothing;
    }

    let compiled: Vec<HostPredicate> = items.iter().map(compile_item).collect();
    if compiled.is_empty() {
        return HostPredicate::Nothing;
    }

    if op == "and" {
        HostPredicate::And(compiled)
    } else {
        HostPredicate::Or(compiled)
    }
}

fn compile_item(item: &Value) -> HostPredicate {
    let Some(obj) = item.as_object() else {
        return HostPredicate::Nothing;
    };
    if obj.contains_key("rules") {
        return compile_block(item);
    }
    compile_condition(obj.get("field"), obj.get("op"), obj.get("value"))
        .map(HostPredicate::Condition)
        .unwrap_or(HostPredicate::Nothing)
}

fn compile_condition(
    field: Option<&Value>,
    op: Option<&Value>,
    value: Option<&Value>,
) -> Option<Condition> {
    let field = parse_field(field?.as_str()?)?;
    let op = op?.as_str()?.to_lowercase();
    let value = value.cloned().unwrap_or(Value::Null);

    let op = match op.as_str() {
        "eq" => ConditionOp::Eq(value),
        "neq" => ConditionOp::Neq(value),
        "contains" => ConditionOp::Contains(value.as_str()?.to_lowercase()),
        "in" => {
            let values = match value {
                Value::Null => Vec::new(),
                Value::Array(v) => v,
                scalar => vec![scalar],
            };
            if values.is_empty() {
                return None;
            }
            ConditionOp::In(values)
        }
        _ => return None,
    };
    Some(Condition { field, op })
}

fn parse_field(raw: &str) -> Option<HostField> {
    if let Some(key) = raw.strip_prefix("tags.") {
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        return Some(HostField::Tag(key.to_string()));
    }
    match raw {
        "name" => Some(HostField::Name),
        "hostname" => Some(HostField::Hostname),
        "environment" => Some(HostField::Environment),
        "os_type" => Some(HostField::OsType),
        "username" => Some(HostField::Username),
        "port" => Some(HostField::Port),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// A host attribute as seen by a condition. Missing attributes behave like
/// SQL `NULL`: no operator matches them, not even `neq`.
#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Text(String),
    Number(i64),
}

impl FieldValue {
    fn as_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Number(n) => n.to_string(),
        }
    }

    fn equals(&self, expected: &Value) -> bool {
        match (self, expected) {
            (FieldValue::Text(s), Value::String(e)) => s == e,
            (FieldValue::Number(n), Value::Number(e)) => e.as_i64() == Some(*n),
            (FieldValue::Number(n), Value::String(e)) => e.trim().parse::<i64>().ok() == Some(*n),
            (FieldValue::Text(s), Value::Number(e)) => s == &e.to_string(),
            (FieldValue::Text(s), Value::Bool(b)) => s == &b.to_string(),
            _ => false,
        }
    }
}

fn field_value(host: &Host, field: &HostField) -> Option<FieldValue> {
    match field {
        HostField::Name => Some(FieldValue::Text(host.name.clone())),
        HostField::Hostname => Some(FieldValue::Text(host.hostname.clone())),
        HostField::Environment => host.environment.clone().map(FieldValue::Text),
        HostField::OsType => host.os_type.clone().map(FieldValue::Text),
        HostField::Username => Some(FieldValue::Text(host.username.clone())),
        HostField::Port => Some(FieldValue::Number(i64::from(host.port))),
        HostField::Tag(key) => match host.tags.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(FieldValue::Text(s.clone())),
            other => Some(FieldValue::Text(other.to_string())),
        },
    }
}

impl Condition {
    pub fn matches(&self, host: &Host) -> bool {
        let Some(actual) = field_value(host, &self.field) else {
            return false;
        };
        match &self.op {
            ConditionOp::Eq(v) => actual.equals(v),
            ConditionOp::Neq(v) => !v.is_null() && !actual.equals(v),
            ConditionOp::Contains(needle) => actual.as_text().to_lowercase().contains(needle),
            ConditionOp::In(values) => values.iter().any(|v| actual.equals(v)),
        }
    }
}

impl HostPredicate {
    pub fn matches(&self, host: &Host) -> bool {
        match self {
            HostPredicate::All => true,
            HostPredicate::Nothing => false,
            HostPredicate::And(parts) => parts.iter().all(|p| p.matches(host)),
            HostPredicate::Or(parts) => parts.iter().any(|p| p.matches(host)),
            HostPredicate::Condition(c) => c.matches(host),
        }
    }

    /// Hosts from `hosts` that satisfy the predicate, in input order.
    pub fn select<'a>(&self, hosts: &'a [Host]) -> Vec<&'a Host> {
        hosts.iter().filter(|h| self.matches(h)).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fleet() -> Vec<Host> {
        vec![
            Host::new(1, "db-1", "10.0.0.1")
                .with_environment("prod")
                .with_tag("role", "db"),
            Host::new(2, "web-1", "10.0.0.2")
                .with_environment("prod")
                .with_tag("role", "web"),
            Host::new(3, "db-2", "10.0.1.1")
                .with_environment("staging")
                .with_tag("role", "db"),
            Host::new(4, "bare", "10.0.1.2"),
        ]
    }

    fn ids(pred: &HostPredicate) -> Vec<i64> {
        let hosts = fleet();
        pred.select(&hosts).iter().map(|h| h.id).collect()
    }

    #[test]
    fn empty_rule_matches_all() {
        assert_eq!(ids(&compile(None)), vec![1, 2, 3, 4]);
        assert_eq!(ids(&compile(Some(&Value::Null))), vec![1, 2, 3, 4]);
        assert_eq!(ids(&compile(Some(&json!({})))), vec![1, 2, 3, 4]);
    }

    #[test]
    fn and_of_environment_and_tag() {
        let rule = json!({"op":"and","rules":[
            {"field":"environment","op":"eq","value":"prod"},
            {"field":"tags.role","op":"eq","value":"db"}
        ]});
        assert_eq!(ids(&compile(Some(&rule))), vec![1]);
    }

    #[test]
    fn malformed_nodes_match_nothing() {
        let cases = [
            json!({"op":"xor","rules":[{"field":"name","op":"eq","value":"db-1"}]}),
            json!({"op":"and","rules":{"field":"name"}}),
            json!({"op":"and"}),
            json!({"op":"and","rules":[]}),
            json!({"op":"and","rules":[{"field":"password","op":"eq","value":"x"}]}),
            json!({"op":"and","rules":[{"field":"name","op":"like","value":"%"}]}),
            json!({"op":"or","rules":[{"field":"name","op":"contains","value":7}]}),
            json!({"op":"or","rules":[{"field":"name","op":"in","value":[]}]}),
            json!({"op":"or","rules":[{"field":"tags.","op":"eq","value":"db"}]}),
            json!({"op":"or","rules":["not-an-object"]}),
            json!("select * from hosts"),
            json!([1, 2, 3]),
        ];
        for rule in cases {
            assert!(ids(&compile(Some(&rule))).is_empty(), "rule {rule} matched hosts");
        }
    }

    #[test]
    fn broken_branch_in_or_does_not_widen() {
        let rule = json!({"op":"or","rules":[
            {"field":"unknown","op":"eq","value":"x"},
            {"field":"name","op":"eq","value":"web-1"}
        ]});
        assert_eq!(ids(&compile(Some(&rule))), vec![2]);
    }

    #[test]
    fn contains_is_case_insensitive() {
        let rule = json!({"rules":[{"field":"name","op":"contains","value":"DB"}]});
        assert_eq!(ids(&compile(Some(&rule))), vec![1, 3]);
    }

    #[test]
    fn in_accepts_lists_and_scalars() {
        let rule = json!({"op":"and","rules":[{"field":"tags.role","op":"in","value":["web","db"]}]});
        assert_eq!(ids(&compile(Some(&rule))), vec![1, 2, 3]);
        let rule = json!({"op":"and","rules":[{"field":"environment","op":"in","value":"staging"}]});
        assert_eq!(ids(&compile(Some(&rule))), vec![3]);
    }

    #[test]
    fn neq_skips_missing_attributes() {
        let rule = json!({"op":"and","rules":[{"field":"environment","op":"neq","value":"prod"}]});
        assert_eq!(ids(&compile(Some(&rule))), vec![3]);
    }

    #[test]
    fn port_compares_numerically() {
        let rule = json!({"op":"and","rules":[{"field":"port","op":"eq","value":"22"}]});
        assert_eq!(ids(&compile(Some(&rule))).len(), 4);
        let rule = json!({"op":"and","rules":[{"field":"port","op":"in","value":[2222]}]});
        assert!(ids(&compile(Some(&rule))).is_empty());
    }

    #[test]
    fn nested_blocks_recurse() {
        let rule = json!({"op":"and","rules":[
            {"field":"tags.role","op":"eq","value":"db"},
            {"op":"or","rules":[
                {"field":"environment","op":"eq","value":"staging"},
                {"field":"hostname","op":"contains","value":"0.0.1"}
            ]}
        ]});
        assert_eq!(ids(&compile(Some(&rule))), vec![1, 3]);
    }

    #[test]
    fn op_defaults_to_and() {
        let rule = json!({"rules":[
            {"field":"environment","op":"EQ","value":"prod"},
            {"field":"tags.role","op":"eq","value":"web"}
        ]});
        assert_eq!(ids(&compile(Some(&rule))), vec![2]);
    }
}
