//! Variables, `((var))` interpolation and credential tracking.

use crate::errors::{ExecError, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Marker written in place of a credential value.
pub const REDACTED: &str = "((redacted))";

/// Source prefix selecting build-local vars, as in `((.:name))`.
const LOCAL_SOURCE: &str = ".";

/// A credential store.
pub trait Variables: Send + Sync + Debug {
    /// Looks up a variable by name.
    fn get(&self, name: &str) -> Option<Value>;
}

/// Variables held in memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticVariables {
    vars: BTreeMap<String, Value>,
}

impl StaticVariables {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable.
    #[must_use]
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

impl Variables for StaticVariables {
    fn get(&self, name: &str) -> Option<Value> {
        self.vars.get(name).cloned()
    }
}

/// A parsed `((source:name.field))` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarRef {
    /// Credential source; `.` for local vars.
    pub source: Option<String>,
    /// Variable name.
    pub name: String,
    /// Field path into the variable's value.
    pub fields: Vec<String>,
}

impl VarRef {
    /// Parses the text between `((` and `))`.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (source, path) = match text.split_once(':') {
            Some((source, path)) => (Some(source.trim().to_string()), path.trim()),
            None => (None, text),
        };

        let mut segments = path.split('.');
        let name = segments.next().unwrap_or_default().to_string();
        if name.is_empty() {
            return Err(ExecError::UndefinedVariable(text.to_string()));
        }

        Ok(Self {
            source,
            name,
            fields: segments.map(ToString::to_string).collect(),
        })
    }

    /// Returns true for `((.:name))` references.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.source.as_deref() == Some(LOCAL_SOURCE)
    }

    /// Walks the field path into a resolved value.
    #[must_use]
    pub fn select(&self, value: Value) -> Option<Value> {
        self.fields.iter().try_fold(value, |v, field| match v {
            Value::Object(mut map) => map.remove(field),
            _ => None,
        })
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = &self.source {
            write!(f, "{source}:")?;
        }
        f.write_str(&self.name)?;
        for field in &self.fields {
            write!(f, ".{field}")?;
        }
        Ok(())
    }
}

/// Build-local vars, scoped like artifacts.
#[derive(Debug, Default)]
pub(crate) struct LocalVars {
    parent: Option<Arc<LocalVars>>,
    vars: RwLock<BTreeMap<String, Value>>,
}

impl LocalVars {
    pub(crate) fn new_scope(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(self)),
            vars: RwLock::new(BTreeMap::new()),
        })
    }

    pub(crate) fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.vars.read().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|p| p.get(name))
    }

    pub(crate) fn set(&self, name: &str, value: Value) {
        self.vars.write().insert(name.to_string(), value);
    }
}

/// Records credential values resolved during a build so they can be
/// scrubbed from its output.
#[derive(Debug, Default)]
pub struct CredentialTracker {
    enabled: bool,
    credentials: Mutex<Vec<(String, String)>>,
}

impl CredentialTracker {
    /// Creates a tracker; a disabled tracker records nothing.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            credentials: Mutex::new(Vec::new()),
        }
    }

    /// Returns whether tracking is enabled.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Records every string inside `value` under `name`.
    pub fn track(&self, name: &str, value: &Value) {
        if !self.enabled {
            return;
        }

        let mut leaves = Vec::new();
        collect_strings(value, &mut leaves);

        let mut credentials = self.credentials.lock();
        for leaf in leaves {
            if !credentials.iter().any(|(_, v)| *v == leaf) {
                credentials.push((name.to_string(), leaf));
            }
        }
    }

    /// Returns the tracked `(name, value)` pairs in the order they were seen.
    #[must_use]
    pub fn credentials(&self) -> Vec<(String, String)> {
        self.credentials.lock().clone()
    }

    /// Replaces tracked values in `text` with [`REDACTED`].
    ///
    /// Values are matched line by line so that a multi-line secret is
    /// scrubbed even when it reaches the log in pieces. Lines of a single
    /// character are left alone.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (_, value) in self.credentials.lock().iter() {
            for line in value.split('\n') {
                let line = line.trim();
                if line.len() > 1 {
                    out = out.replace(line, REDACTED);
                }
            }
        }
        out
    }

    /// Redacts every string inside a JSON value.
    #[must_use]
    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        Value::Number(_) | Value::Bool(_) | Value::Null => {}
    }
}

/// Replaces `((var))` placeholders inside `value` using `resolve`.
///
/// A string that is exactly one placeholder becomes the resolved value
/// itself; placeholders embedded in longer strings are substituted as text.
pub(crate) fn interpolate<F>(value: &Value, resolve: &mut F) -> Result<Value>
where
    F: FnMut(&VarRef) -> Result<Value>,
{
    match value {
        Value::String(s) => interpolate_str(s, resolve),
        Value::Array(items) => items
            .iter()
            .map(|v| interpolate(v, resolve))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate(v, resolve)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn interpolate_str<F>(s: &str, resolve: &mut F) -> Result<Value>
where
    F: FnMut(&VarRef) -> Result<Value>,
{
    if let Some(inner) = s.strip_prefix("((").and_then(|r| r.strip_suffix("))")) {
        if !inner.contains("((") && !inner.contains("))") {
            return resolve(&VarRef::parse(inner)?);
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("((") {
        let Some(len) = rest[start + 2..].find("))") else {
            break;
        };
        out.push_str(&rest[..start]);
        let reference = VarRef::parse(&rest[start + 2..start + 2 + len])?;
        match resolve(&reference)? {
            Value::String(v) => out.push_str(&v),
            other => out.push_str(&other.to_string()),
        }
        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);

    Ok(Value::String(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_references() {
        let local = VarRef::parse(".:version").unwrap();
        assert!(local.is_local());
        assert_eq!(local.name, "version");

        let nested = VarRef::parse(" vault:creds.user ").unwrap();
        assert_eq!(nested.source.as_deref(), Some("vault"));
        assert_eq!(nested.name, "creds");
        assert_eq!(nested.fields, vec!["user"]);
        assert_eq!(nested.to_string(), "vault:creds.user");

        assert!(VarRef::parse("").is_err());
    }

    #[test]
    fn test_select_field() {
        let r = VarRef::parse("creds.user").unwrap();
        assert_eq!(r.select(json!({"user": "admin"})), Some(json!("admin")));
        assert_eq!(r.select(json!("flat")), None);
    }

    #[test]
    fn test_interpolate_whole_and_embedded() {
        let mut resolve = |r: &VarRef| match r.name.as_str() {
            "port" => Ok(json!(8080)),
            "host" => Ok(json!("example.com")),
            other => Err(ExecError::UndefinedVariable(other.to_string())),
        };

        let out = interpolate(
            &json!({"port": "((port))", "url": "https://((host)):((port))/", "n": 1}),
            &mut resolve,
        )
        .unwrap();
        assert_eq!(
            out,
            json!({"port": 8080, "url": "https://example.com:8080/", "n": 1})
        );

        assert!(interpolate(&json!("((missing))"), &mut resolve).is_err());
    }

    #[test]
    fn test_redact_single_and_multi_line() {
        let tracker = CredentialTracker::new(true);
        tracker.track("source-param", &json!("super-secret-source"));
        tracker.track("git-key", &json!("{\n123\n456\n789\n}\n"));

        assert_eq!(
            tracker.redact("ok super-secret-source ok"),
            "ok ((redacted)) ok"
        );
        assert_eq!(
            tracker.redact("{\nok123ok\nok456ok\n}\n"),
            "{\nok((redacted))ok\nok((redacted))ok\n}\n"
        );
    }

    #[test]
    fn test_disabled_tracker_records_nothing() {
        let tracker = CredentialTracker::new(false);
        tracker.track("k", &json!("secret"));
        assert!(tracker.credentials().is_empty());
        assert_eq!(tracker.redact("secret"), "secret");
    }

    #[test]
    fn test_redact_nested_value() {
        let tracker = CredentialTracker::new(true);
        tracker.track("creds", &json!({"password": "hunter22"}));
        assert_eq!(
            tracker.redact_value(&json!({"some": "hunter22", "n": [1, "hunter22"]})),
            json!({"some": "((redacted))", "n": [1, "((redacted))"]})
        );
    }

    #[test]
    fn test_local_vars_scope() {
        let root = Arc::new(LocalVars::default());
        root.set("a", json!(1));
        let child = root.new_scope();
        child.set("b", json!(2));
        assert_eq!(child.get("a"), Some(json!(1)));
        assert_eq!(child.get("b"), Some(json!(2)));
        assert_eq!(root.get("b"), None);
    }
}
