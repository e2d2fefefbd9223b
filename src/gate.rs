use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use worker_client::message::{ErrorRecord, PluginKind};

/// An error reported by a plugin, tagged with the stage that raised it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedError {
    pub plugin: String,
    pub stage: PluginKind,
    pub record: ErrorRecord,
}

/// Errors per instance name, in the order they came in.
pub type ErrorsByInstance = HashMap<String, Vec<RecordedError>>;

/// Stages whose errors block extraction.
pub fn gates_extraction(stage: PluginKind) -> bool {
    matches!(stage, PluginKind::Selector | PluginKind::Validator)
}

/// Halt before `next` when it starts extraction and any instance still
/// carries an error from a validation stage.
///
/// Errors raised by extractors and later stages are reported but never stop
/// the run on their own.
pub fn should_halt(errors: &ErrorsByInstance, next: PluginKind) -> bool {
    next == PluginKind::Extractor
        && errors
            .values()
            .flatten()
            .any(|error| gates_extraction(error.stage))
}
