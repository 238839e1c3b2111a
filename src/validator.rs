//! Declarative response validation.
//!
//! Expectation trees are authored as plain YAML values where string leaves
//! may carry a rule prefix:
//!
//! | leaf            | check                                             |
//! |-----------------|---------------------------------------------------|
//! | any literal     | deep equality (numbers compared numerically)      |
//! | `regex:<pat>`   | regex search against the stringified value        |
//! | `type:<name>`   | runtime JSON type                                 |
//! | `len:<pred>`    | length of an array, string or object              |
//! | `exists:<bool>` | key presence in the parent mapping                |
//! | mapping         | recurse; keys absent from the expectation ignored |
//!
//! Trees are compiled once with [`Expectation::compile`]; validation is a
//! pure function that reports every mismatch instead of failing fast.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub enum Expectation {
    Literal(Value),
    Regex(Regex),
    Type(TypeName),
    Len(LenPredicate),
    Exists(bool),
    Object(Vec<(String, Expectation)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeName {
    String,
    Integer,
    Float,
    Number,
    Bool,
    List,
    Dict,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LenOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LenPredicate {
    pub op: LenOp,
    pub n: usize,
}

/// One field that did not meet its expectation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    /// Dot path from the root; empty for the root itself.
    pub path: String,
    pub expected: String,
    /// `None` when the field is missing.
    pub actual: Option<Value>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "$" } else { &self.path };
        match &self.actual {
            Some(actual) => write!(
                f,
                "'{path}': expected {}, got {actual}",
                self.expected
            ),
            None => write!(f, "'{path}': missing, expected {}", self.expected),
        }
    }
}

impl Expectation {
    /// Compile an authored expectation value into a rule tree.
    pub fn compile(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Self::compile_leaf(s),
            Value::Object(map) => {
                let mut fields = Vec::with_capacity(map.len());
                for (key, sub) in map {
                    let compiled = Self::compile(sub).map_err(|e| match e {
                        Error::Configuration(msg) => {
                            Error::Configuration(format!("{key}: {msg}"))
                        }
                        other => other,
                    })?;
                    fields.push((key.clone(), compiled));
                }
                Ok(Expectation::Object(fields))
            }
            other => Ok(Expectation::Literal(other.clone())),
        }
    }

    fn compile_leaf(s: &str) -> Result<Self> {
        if let Some(pattern) = s.strip_prefix("regex:") {
            let re = Regex::new(pattern).map_err(|e| {
                Error::config(format!("invalid regex '{pattern}': {e}"))
            })?;
            Ok(Expectation::Regex(re))
        } else if let Some(name) = s.strip_prefix("type:") {
            Ok(Expectation::Type(TypeName::parse(name)?))
        } else if let Some(pred) = s.strip_prefix("len:") {
            Ok(Expectation::Len(LenPredicate::parse(pred)?))
        } else if let Some(flag) = s.strip_prefix("exists:") {
            let flag = flag.trim().to_ascii_lowercase();
            Ok(Expectation::Exists(matches!(
                flag.as_str(),
                "true" | "1" | "yes"
            )))
        } else {
            Ok(Expectation::Literal(Value::String(s.to_string())))
        }
    }

    fn describe(&self) -> String {
        match self {
            Expectation::Literal(v) => v.to_string(),
            Expectation::Regex(re) => format!("match /{}/", re.as_str()),
            Expectation::Type(t) => format!("type {t}"),
            Expectation::Len(p) => format!("length {p}"),
            Expectation::Exists(true) => "present".to_string(),
            Expectation::Exists(false) => "absent".to_string(),
            Expectation::Object(_) => "object".to_string(),
        }
    }
}

impl TypeName {
    fn parse(name: &str) -> Result<Self> {
        let t = match name.trim().to_ascii_lowercase().as_str() {
            "string" | "str" => TypeName::String,
            "integer" | "int" => TypeName::Integer,
            "float" => TypeName::Float,
            "number" => TypeName::Number,
            "bool" | "boolean" => TypeName::Bool,
            "list" | "array" => TypeName::List,
            "dict" | "object" => TypeName::Dict,
            "null" | "none" => TypeName::Null,
            other => {
                return Err(Error::config(format!("unknown type name '{other}'")))
            }
        };
        Ok(t)
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            TypeName::String => value.is_string(),
            TypeName::Integer => value.is_i64() || value.is_u64(),
            TypeName::Float => value.is_f64(),
            TypeName::Number => value.is_number(),
            TypeName::Bool => value.is_boolean(),
            TypeName::List => value.is_array(),
            TypeName::Dict => value.is_object(),
            TypeName::Null => value.is_null(),
        }
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeName::String => "string",
            TypeName::Integer => "integer",
            TypeName::Float => "float",
            TypeName::Number => "number",
            TypeName::Bool => "bool",
            TypeName::List => "list",
            TypeName::Dict => "dict",
            TypeName::Null => "null",
        };
        f.write_str(name)
    }
}

impl LenPredicate {
    fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        // Two-character operators first so ">=" is not read as ">".
        let (op, rest) = if let Some(rest) = expr.strip_prefix(">=") {
            (LenOp::Ge, rest)
        } else if let Some(rest) = expr.strip_prefix("<=") {
            (LenOp::Le, rest)
        } else if let Some(rest) = expr.strip_prefix('>') {
            (LenOp::Gt, rest)
        } else if let Some(rest) = expr.strip_prefix('<') {
            (LenOp::Lt, rest)
        } else {
            (LenOp::Eq, expr)
        };
        let n = rest.trim().parse::<usize>().map_err(|_| {
            Error::config(format!("invalid length predicate 'len:{expr}'"))
        })?;
        Ok(Self { op, n })
    }

    pub fn holds(self, len: usize) -> bool {
        match self.op {
            LenOp::Gt => len > self.n,
            LenOp::Ge => len >= self.n,
            LenOp::Lt => len < self.n,
            LenOp::Le => len <= self.n,
            LenOp::Eq => len == self.n,
        }
    }
}

impl fmt::Display for LenPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            LenOp::Gt => "> ",
            LenOp::Ge => ">= ",
            LenOp::Lt => "< ",
            LenOp::Le => "<= ",
            LenOp::Eq => "",
        };
        write!(f, "{op}{}", self.n)
    }
}

/// Validate `actual` against a compiled expectation tree.
pub fn validate(expect: &Expectation, actual: &Value) -> Vec<Mismatch> {
    let mut out = Vec::new();
    check(expect, Some(actual), "", &mut out);
    out
}

fn check(
    expect: &Expectation,
    actual: Option<&Value>,
    path: &str,
    out: &mut Vec<Mismatch>,
) {
    let mut fail = |actual: Option<Value>| {
        out.push(Mismatch {
            path: path.to_string(),
            expected: expect.describe(),
            actual,
        })
    };

    if let Expectation::Exists(should_exist) = expect {
        if actual.is_some() != *should_exist {
            fail(actual.cloned());
        }
        return;
    }

    let Some(actual) = actual else {
        fail(None);
        return;
    };

    match expect {
        Expectation::Literal(expected) => {
            if !json_eq(expected, actual) {
                fail(Some(actual.clone()));
            }
        }
        Expectation::Regex(re) => {
            if !re.is_match(&stringify(actual)) {
                fail(Some(actual.clone()));
            }
        }
        Expectation::Type(t) => {
            if !t.matches(actual) {
                fail(Some(actual.clone()));
            }
        }
        Expectation::Len(pred) => match length(actual) {
            Some(len) if pred.holds(len) => {}
            Some(len) => fail(Some(Value::from(len))),
            None => fail(Some(actual.clone())),
        },
        Expectation::Object(fields) => match actual.as_object() {
            Some(map) => {
                for (key, sub) in fields {
                    let child = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    check(sub, map.get(key), &child, out);
                }
            }
            None => fail(Some(actual.clone())),
        },
        Expectation::Exists(_) => unreachable!("handled above"),
    }
}

/// A header expectation, name already lowercased.
#[derive(Debug, Clone)]
pub struct HeaderExpectation {
    pub name: String,
    pub expect: Expectation,
}

pub fn compile_headers(
    expected: &BTreeMap<String, String>,
) -> Result<Vec<HeaderExpectation>> {
    expected
        .iter()
        .map(|(name, value)| {
            Ok(HeaderExpectation {
                name: name.to_ascii_lowercase(),
                expect: Expectation::compile(&Value::String(value.clone()))?,
            })
        })
        .collect()
}

/// Validate response headers; header names compare case-insensitively.
pub fn validate_headers(
    expectations: &[HeaderExpectation],
    headers: &HashMap<String, String>,
) -> Vec<Mismatch> {
    let lowered: HashMap<String, &String> = headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect();

    let mut out = Vec::new();
    for he in expectations {
        let actual = lowered.get(&he.name).map(|v| Value::String((*v).clone()));
        check(&he.expect, actual.as_ref(), &he.name, &mut out);
    }
    out
}

/// Look up a dot-separated path; numeric segments index into arrays.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn json_eq(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(a), Value::Number(b)) => {
            if a.is_f64() || b.is_f64() {
                a.as_f64() == b.as_f64()
            } else {
                a == b
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| json_eq(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|w| json_eq(v, w)))
        }
        _ => expected == actual,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn length(value: &Value) -> Option<usize> {
    match value {
        Value::Array(items) => Some(items.len()),
        Value::String(s) => Some(s.chars().count()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(expected: Value, actual: Value) -> Vec<Mismatch> {
        let compiled = Expectation::compile(&expected).unwrap();
        validate(&compiled, &actual)
    }

    #[test]
    fn literal_fields_pass_and_extra_fields_are_ignored() {
        assert!(run(
            json!({"id": 1, "name": "alice"}),
            json!({"id": 1, "name": "alice", "extra": true})
        )
        .is_empty());
    }

    #[test]
    fn literal_mismatch_reports_path_and_values() {
        let errors = run(json!({"id": 1}), json!({"id": 2}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "id");
        assert_eq!(errors[0].actual, Some(json!(2)));
        assert_eq!(errors[0].to_string(), "'id': expected 1, got 2");
    }

    #[test]
    fn literal_arrays_are_order_sensitive() {
        assert!(run(json!({"v": [1, 2]}), json!({"v": [1, 2]})).is_empty());
        assert_eq!(run(json!({"v": [1, 2]}), json!({"v": [2, 1]})).len(), 1);
    }

    #[test]
    fn numbers_compare_numerically() {
        assert!(run(json!({"v": 1}), json!({"v": 1.0})).is_empty());
    }

    #[test]
    fn every_mismatch_is_reported() {
        let errors = run(
            json!({"a": 1, "b": 2, "c": 3}),
            json!({"a": 10, "b": 20, "c": 3}),
        );
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn regex_uses_search_semantics() {
        assert!(run(json!({"id": "regex:^\\d+$"}), json!({"id": "123"})).is_empty());
        assert!(run(json!({"msg": "regex:wor"}), json!({"msg": "hello world"})).is_empty());
        assert!(run(json!({"id": "regex:^\\d+$"}), json!({"id": 42})).is_empty());
        assert_eq!(run(json!({"id": "regex:^\\d+$"}), json!({"id": "abc"})).len(), 1);
    }

    #[test]
    fn regex_on_missing_key_fails() {
        let errors = run(json!({"id": "regex:.*"}), json!({"other": 1}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].actual.is_none());
        assert!(errors[0].to_string().contains("missing"));
    }

    #[test]
    fn len_predicates() {
        assert_eq!(run(json!({"items": "len:>0"}), json!({"items": []})).len(), 1);
        assert!(run(json!({"items": "len:>0"}), json!({"items": [1]})).is_empty());
        assert!(run(json!({"items": "len:3"}), json!({"items": [1, 2, 3]})).is_empty());
        assert_eq!(run(json!({"items": "len:3"}), json!({"items": [1, 2]})).len(), 1);
        assert_eq!(run(json!({"items": "len:3"}), json!({"items": [1, 2, 3, 4]})).len(), 1);
        assert!(run(json!({"items": "len:>=2"}), json!({"items": [1, 2]})).is_empty());
        assert!(run(json!({"items": "len:<=2"}), json!({"items": [1, 2]})).is_empty());
        assert_eq!(run(json!({"items": "len:<2"}), json!({"items": [1, 2]})).len(), 1);
    }

    #[test]
    fn len_on_strings_and_objects() {
        assert!(run(json!({"name": "len:>2"}), json!({"name": "hello"})).is_empty());
        assert!(run(json!({"meta": "len:2"}), json!({"meta": {"a": 1, "b": 2}})).is_empty());
    }

    #[test]
    fn len_on_scalar_is_a_reported_mismatch() {
        let errors = run(json!({"items": "len:>0"}), json!({"items": 42}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].actual, Some(json!(42)));
    }

    #[test]
    fn type_rules() {
        assert!(run(json!({"v": "type:number"}), json!({"v": 1})).is_empty());
        assert!(run(json!({"v": "type:number"}), json!({"v": 1.5})).is_empty());
        assert_eq!(run(json!({"v": "type:number"}), json!({"v": "1"})).len(), 1);
        assert!(run(json!({"v": "type:int"}), json!({"v": 10})).is_empty());
        assert_eq!(run(json!({"v": "type:integer"}), json!({"v": 1.5})).len(), 1);
        assert!(run(json!({"v": "type:float"}), json!({"v": 1.5})).is_empty());
        assert!(run(json!({"v": "type:string"}), json!({"v": "x"})).is_empty());
        assert!(run(json!({"v": "type:bool"}), json!({"v": true})).is_empty());
        assert!(run(json!({"v": "type:array"}), json!({"v": [1]})).is_empty());
        assert!(run(json!({"v": "type:object"}), json!({"v": {}})).is_empty());
        assert!(run(json!({"v": "type:null"}), json!({"v": null})).is_empty());
        assert_eq!(run(json!({"v": "type:dict"}), json!({"v": []})).len(), 1);
    }

    #[test]
    fn exists_checks_presence_only() {
        assert!(run(json!({"k": "exists:true"}), json!({"k": null})).is_empty());
        assert!(run(json!({"k": "exists:yes"}), json!({"k": ""})).is_empty());
        assert_eq!(run(json!({"k": "exists:true"}), json!({"other": 1})).len(), 1);
        assert!(run(json!({"k": "exists:false"}), json!({"other": 1})).is_empty());
        let errors = run(json!({"k": "exists:false"}), json!({"k": 1}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].expected, "absent");
    }

    #[test]
    fn nested_mappings_recurse_with_dotted_paths() {
        assert!(run(
            json!({"a": {"b": {"c": 42}}}),
            json!({"a": {"b": {"c": 42, "d": 0}}})
        )
        .is_empty());

        let errors = run(json!({"user": {"name": "alice"}}), json!({"user": {"name": "bob"}}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "user.name");
    }

    #[test]
    fn nested_mapping_against_non_object_is_reported() {
        let errors = run(json!({"user": {"name": "alice"}}), json!({"user": "nope"}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "user");
        assert_eq!(errors[0].expected, "object");
    }

    #[test]
    fn root_type_mismatch_does_not_panic() {
        let errors = run(json!({"id": 1}), json!([1, 2, 3]));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "");
    }

    #[test]
    fn invalid_rules_are_rejected_at_compile_time() {
        assert!(Expectation::compile(&json!({"a": "regex:("})).is_err());
        assert!(Expectation::compile(&json!({"a": "len:many"})).is_err());
        let err = Expectation::compile(&json!({"a": {"b": "type:custom"}})).unwrap_err();
        assert!(err.to_string().contains("a: b: unknown type name"));
    }

    #[test]
    fn headers_match_case_insensitively() {
        let mut expected = BTreeMap::new();
        expected.insert("Content-Type".to_string(), "regex:json".to_string());
        expected.insert("X-Trace".to_string(), "abc".to_string());
        let compiled = compile_headers(&expected).unwrap();

        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert("x-trace".to_string(), "abc".to_string());
        assert!(validate_headers(&compiled, &headers).is_empty());

        headers.remove("x-trace");
        let errors = validate_headers(&compiled, &headers);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "x-trace");
    }

    #[test]
    fn lookup_path_walks_objects_and_arrays() {
        let value = json!({"data": {"items": [{"id": "a"}, {"id": "b"}]}});
        assert_eq!(lookup_path(&value, "data.items.1.id"), Some(&json!("b")));
        assert_eq!(lookup_path(&value, "data.missing"), None);
        assert_eq!(lookup_path(&value, "data.items.x"), None);
        assert_eq!(lookup_path(&value, ""), Some(&value));
    }
}
