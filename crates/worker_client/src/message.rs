use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkerError;

/// Family tag that makes a plugin compatible with every instance.
pub const WILDCARD_FAMILY: &str = "*";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

/// An instance as reported by the worker host.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct InstanceRecord {
    pub name: String,                    // Unique within one session
    pub family: String,                  // Primary family, used for compatibility
    #[serde(default)]
    pub families: Vec<String>,           // Extra compatibility tags
    #[serde(default)]
    pub publish: Option<bool>,           // Initial toggle, absent means `true`
}

impl InstanceRecord {
    pub fn new(name: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            family: family.into(),
            families: vec![],
            publish: None,
        }
    }

    pub fn with_publish(mut self, publish: bool) -> Self {
        self.publish = Some(publish);
        self
    }

    pub fn with_families(mut self, families: &[&str]) -> Self {
        self.families = families.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// Stage kinds, in the order a host normally runs them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum PluginKind {
    Selector,
    Validator,
    Extractor,
    Conformer,
    Integrator,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginKind::Selector => "Selector",
            PluginKind::Validator => "Validator",
            PluginKind::Extractor => "Extractor",
            PluginKind::Conformer => "Conformer",
            PluginKind::Integrator => "Integrator",
        };
        f.write_str(name)
    }
}

/// A processing stage as reported by the worker host.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PluginRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PluginKind,
    pub order: f64,                      // Execution order, ascending
    #[serde(default = "default_true")]
    pub active: bool,                    // Host-level availability
    #[serde(default)]
    pub optional: bool,                  // May the user switch it off?
    #[serde(default)]
    pub families: Vec<String>,           // `*` matches every family
}

fn default_true() -> bool {
    true
}

impl PluginRecord {
    pub fn new(name: impl Into<String>, kind: PluginKind, order: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            order,
            active: true,
            optional: true,
            families: vec![WILDCARD_FAMILY.to_string()],
        }
    }

    pub fn with_families(mut self, families: &[&str]) -> Self {
        self.families = families.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }
}

/// Opaque identifier of one submitted job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct JobHandle(pub String);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position in the host's log stream. Handed back on every poll so
/// already delivered records are not sent twice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(transparent)]
pub struct Cursor(pub u64);

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            instance: None,
            plugin: None,
            traceback: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct LogRecord {
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
}

impl LogRecord {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Info,
            message: message.into(),
            instance: None,
            plugin: None,
        }
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct JobStatus {
    pub running: bool,
    pub cursor: Cursor,                  // Pass back on the next poll
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub messages: Vec<LogRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ApplicationInfo {
    pub host_name: String,
    pub version: String,
    pub connect_time: DateTime<Utc>,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

// -----------------------------------------------------------------------------
// Request / result payloads
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubmitJobParams {
    pub instance: String,
    pub plugin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubmitJobResult {
    pub handle: JobHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PollJobParams {
    pub handle: JobHandle,
    #[serde(default)]
    pub cursor: Cursor,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListInstancesResult {
    pub instances: Vec<InstanceRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListPluginsResult {
    pub plugins: Vec<PluginRecord>,
}

// -----------------------------------------------------------------------------
// Ingestion checks
// -----------------------------------------------------------------------------

/// Reject instance lists a registry could not hold.
pub fn validate_instances(instances: &[InstanceRecord]) -> Result<(), WorkerError> {
    let mut seen = HashSet::new();
    for instance in instances {
        if instance.name.trim().is_empty() {
            return Err(WorkerError::Schema("instance with an empty name".into()));
        }
        if !seen.insert(instance.name.as_str()) {
            return Err(WorkerError::Schema(format!(
                "duplicate instance name `{}`",
                instance.name
            )));
        }
    }
    Ok(())
}

pub fn validate_plugins(plugins: &[PluginRecord]) -> Result<(), WorkerError> {
    for plugin in plugins {
        if plugin.name.trim().is_empty() {
            return Err(WorkerError::Schema("plugin with an empty name".into()));
        }
        if !plugin.order.is_finite() {
            return Err(WorkerError::Schema(format!(
                "plugin `{}` has a non-finite order",
                plugin.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plugin_record_reads_host_json() {
        let raw = json!({
            "name": "ValidateNamespace",
            "type": "Validator",
            "order": 1.0,
            "families": ["napoleon.animation.cache"]
        });
        let plugin: PluginRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(plugin.kind, PluginKind::Validator);
        assert!(plugin.active);
        assert!(!plugin.optional);
    }

    #[test]
    fn unknown_plugin_kind_is_rejected() {
        let raw = json!({"name": "Weird", "type": "Painter", "order": 1.0});
        assert!(serde_json::from_value::<PluginRecord>(raw).is_err());
    }

    #[test]
    fn instance_publish_flag_is_optional() {
        let raw = json!({"name": "Peter01", "family": "napoleon.asset.rig"});
        let instance: InstanceRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(instance.publish, None);
        assert!(instance.families.is_empty());
    }

    #[test]
    fn duplicate_instances_fail_validation() {
        let instances = vec![
            InstanceRecord::new("A", "f"),
            InstanceRecord::new("A", "g"),
        ];
        let err = validate_instances(&instances).unwrap_err();
        assert!(matches!(err, WorkerError::Schema(_)));
    }

    #[test]
    fn nan_order_fails_validation() {
        let plugins = vec![PluginRecord::new("P", PluginKind::Validator, f64::NAN)];
        assert!(validate_plugins(&plugins).is_err());
    }

    #[test]
    fn cursor_is_a_bare_number_on_the_wire() {
        let status = JobStatus {
            running: true,
            cursor: Cursor(7),
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["cursor"], json!(7));
    }
}
