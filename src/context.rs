//! Per-scenario variable store and `{var}` template resolution.

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use tracing::debug;

use crate::error::{Error, Result};

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(\w+)\}").expect("failed to compile context token regex")
});

/// Variables saved by earlier steps of one scenario run.
///
/// A fresh context is created for every run; setup, steps and teardown
/// share it. Values are only ever added, so a variable is visible from the
/// step after the one that saved it onwards.
#[derive(Debug, Clone, Default)]
pub struct ScenarioContext {
    vars: HashMap<String, Value>,
}

impl ScenarioContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        debug!(variable = %name, %value, "saved context variable");
        self.vars.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Replace every `{name}` token in `text`. Unknown names are an error.
    pub fn resolve_str(&self, text: &str) -> Result<String> {
        let mut missing = None;
        let resolved = TOKEN_RE.replace_all(text, |caps: &Captures| {
            match self.vars.get(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    missing.get_or_insert_with(|| caps[1].to_string());
                    String::new()
                }
            }
        });
        match missing {
            Some(name) => Err(Error::UnresolvedVariable(name)),
            None => Ok(resolved.into_owned()),
        }
    }

    /// Resolve tokens in every string leaf of a JSON value.
    ///
    /// A string made of exactly one token takes the saved value as-is, so a
    /// saved integer stays an integer in a request body.
    pub fn resolve_value(&self, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) => {
                if let Some(name) = sole_token(s) {
                    return self
                        .vars
                        .get(name)
                        .cloned()
                        .ok_or_else(|| Error::UnresolvedVariable(name.to_string()));
                }
                self.resolve_str(s).map(Value::String)
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_value(v))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_value(v)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    pub fn resolve_headers(
        &self,
        headers: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        headers
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve_str(v)?)))
            .collect()
    }

    pub fn resolve_params(
        &self,
        params: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>> {
        params
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve_value(v)?)))
            .collect()
    }
}

fn sole_token(s: &str) -> Option<&str> {
    let caps = TOKEN_RE.captures(s)?;
    let whole = caps.get(0)?;
    (whole.start() == 0 && whole.end() == s.len())
        .then(|| caps.get(1).map(|m| m.as_str()))
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ScenarioContext {
        let mut ctx = ScenarioContext::new();
        ctx.save("user_id", json!(42));
        ctx.save("token", json!("abc"));
        ctx
    }

    #[test]
    fn resolves_tokens_in_strings() {
        let ctx = ctx();
        assert_eq!(
            ctx.resolve_str("/users/{user_id}").unwrap(),
            "/users/42"
        );
        assert_eq!(ctx.resolve_str("Bearer {token}").unwrap(), "Bearer abc");
        assert_eq!(ctx.resolve_str("no tokens").unwrap(), "no tokens");
    }

    #[test]
    fn unresolved_token_is_an_error() {
        let err = ctx().resolve_str("/orders/{order_id}").unwrap_err();
        assert!(matches!(err, Error::UnresolvedVariable(ref n) if n == "order_id"));
        assert_eq!(err.to_string(), "unresolved context variable '{order_id}'");
    }

    #[test]
    fn sole_token_keeps_json_type() {
        let ctx = ctx();
        let body = json!({
            "id": "{user_id}",
            "label": "user-{user_id}",
            "nested": {"list": ["{token}", 1]}
        });
        assert_eq!(
            ctx.resolve_value(&body).unwrap(),
            json!({
                "id": 42,
                "label": "user-42",
                "nested": {"list": ["abc", 1]}
            })
        );
    }

    #[test]
    fn resolve_value_fails_on_nested_unknown_token() {
        let body = json!({"a": [{"b": "{missing}"}]});
        assert!(ctx().resolve_value(&body).is_err());
    }

    #[test]
    fn empty_braces_are_left_alone() {
        assert_eq!(ctx().resolve_str("{}").unwrap(), "{}");
    }
}
