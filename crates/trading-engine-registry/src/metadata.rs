//! Strategy module metadata contract and validation.
//!
//! Every loaded module carries a validated [`Metadata`] block: a lowercase
//! name, a display name, its config schema, and the event types the
//! strategy subscribes to. Validation produces staged
//! [`ModuleDiagnostic`]s addressing the offending field, so control-plane
//! callers can point at `metadata.events[0]` rather than guessing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use trading_engine_core::error::{DiagnosticStage, ModuleDiagnostic};
use trading_engine_core::event::EventType;

/// Maximum display-name length.
pub const DISPLAY_NAME_LIMIT: usize = 80;

/// Config field injected automatically when a module omits it.
pub const DRY_RUN_FIELD: &str = "dry_run";

/// One declared config field of a strategy module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

/// Validated module metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Lowercase strategy name
    pub name: String,
    /// Human-facing name, at most [`DISPLAY_NAME_LIMIT`] characters
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared config schema, always containing a `dry_run` field
    pub config: Vec<ConfigField>,
    /// Event types the strategy subscribes to; never empty
    pub events: Vec<EventType>,
    /// Optional tag the module wants its revision stored under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl Metadata {
    /// Validate a raw metadata export. Returns every diagnostic found, not
    /// just the first, so module authors fix one round of feedback.
    pub fn from_value(value: &Value) -> Result<Metadata, Vec<ModuleDiagnostic>> {
        let mut diagnostics = Vec::new();

        let Some(object) = value.as_object() else {
            return Err(vec![ModuleDiagnostic::new(
                DiagnosticStage::Validation,
                "metadata must be an object",
            )
            .with_field("metadata")]);
        };

        let name = match object.get("name").and_then(Value::as_str) {
            Some(name) if !name.trim().is_empty() => name.trim().to_lowercase(),
            _ => {
                diagnostics.push(
                    ModuleDiagnostic::new(DiagnosticStage::Validation, "metadata.name is required")
                        .with_field("metadata.name")
                        .with_hint("export a non-empty lowercase strategy name"),
                );
                String::new()
            }
        };

        let display_name = match object.get("displayName").and_then(Value::as_str) {
            Some(display) if !display.trim().is_empty() => {
                let display = display.trim().to_string();
                if display.chars().count() > DISPLAY_NAME_LIMIT {
                    diagnostics.push(
                        ModuleDiagnostic::new(
                            DiagnosticStage::Validation,
                            format!(
                                "metadata.displayName exceeds {DISPLAY_NAME_LIMIT} characters"
                            ),
                        )
                        .with_field("metadata.displayName"),
                    );
                }
                display
            }
            _ => {
                diagnostics.push(
                    ModuleDiagnostic::new(
                        DiagnosticStage::Validation,
                        "metadata.displayName is required",
                    )
                    .with_field("metadata.displayName"),
                );
                String::new()
            }
        };

        let description = object
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut config = Vec::new();
        if let Some(raw_config) = object.get("config") {
            match raw_config.as_array() {
                Some(fields) => {
                    for (index, field) in fields.iter().enumerate() {
                        match serde_json::from_value::<ConfigField>(field.clone()) {
                            Ok(field) if !field.name.trim().is_empty() => config.push(field),
                            _ => diagnostics.push(
                                ModuleDiagnostic::new(
                                    DiagnosticStage::Validation,
                                    "config field requires name and type",
                                )
                                .with_field(format!("metadata.config[{index}]")),
                            ),
                        }
                    }
                }
                None => diagnostics.push(
                    ModuleDiagnostic::new(DiagnosticStage::Validation, "metadata.config must be an array")
                        .with_field("metadata.config"),
                ),
            }
        }

        let mut events = Vec::new();
        match object.get("events").and_then(Value::as_array) {
            Some(raw_events) if !raw_events.is_empty() => {
                for (index, raw) in raw_events.iter().enumerate() {
                    let parsed = raw.as_str().and_then(EventType::parse);
                    match parsed {
                        Some(event_type) => {
                            if !events.contains(&event_type) {
                                events.push(event_type);
                            }
                        }
                        None => diagnostics.push(
                            ModuleDiagnostic::new(
                                DiagnosticStage::Validation,
                                format!("unknown event type {raw}"),
                            )
                            .with_field(format!("metadata.events[{index}]"))
                            .with_hint("use one of the enumerated event type names"),
                        ),
                    }
                }
            }
            _ => diagnostics.push(
                ModuleDiagnostic::new(
                    DiagnosticStage::Validation,
                    "metadata.events must declare at least one event type",
                )
                .with_field("metadata.events"),
            ),
        }

        let tag = object
            .get("tag")
            .and_then(Value::as_str)
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty());

        if !diagnostics.is_empty() {
            return Err(diagnostics);
        }

        let mut metadata = Metadata {
            name,
            display_name,
            description,
            config,
            events,
            tag,
        };
        metadata.inject_dry_run();
        Ok(metadata)
    }

    /// Ensure the config schema carries `dry_run: bool` defaulting to true.
    fn inject_dry_run(&mut self) {
        if self.config.iter().any(|field| field.name == DRY_RUN_FIELD) {
            return;
        }
        self.config.push(ConfigField {
            name: DRY_RUN_FIELD.to_string(),
            field_type: "bool".to_string(),
            description: Some("Log orders instead of routing them".to_string()),
            default: Some(Value::Bool(true)),
            required: false,
        });
    }

    /// Schema defaults folded into a config map; explicit values win.
    pub fn apply_defaults(&self, config: &mut serde_json::Map<String, Value>) {
        for field in &self.config {
            if let Some(default) = &field.default {
                config
                    .entry(field.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_metadata() -> Value {
        json!({
            "name": "Delay",
            "displayName": "Delay Strategy",
            "events": ["trade", "ticker"],
            "config": [
                {"name": "interval_ms", "type": "number", "default": 100, "required": false}
            ],
            "tag": "v1.0.0"
        })
    }

    #[test]
    fn test_valid_metadata_lowercases_name_and_injects_dry_run() {
        let metadata = Metadata::from_value(&valid_metadata()).unwrap();
        assert_eq!(metadata.name, "delay");
        assert_eq!(metadata.events, vec![EventType::Trade, EventType::Ticker]);
        let dry_run = metadata
            .config
            .iter()
            .find(|f| f.name == DRY_RUN_FIELD)
            .expect("dry_run injected");
        assert_eq!(dry_run.default, Some(Value::Bool(true)));
        assert_eq!(metadata.tag.as_deref(), Some("v1.0.0"));
    }

    #[test]
    fn test_unknown_event_type_is_flagged_with_position() {
        let mut raw = valid_metadata();
        raw["events"] = json!(["UnknownEvent"]);
        let diagnostics = Metadata::from_value(&raw).unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].stage, DiagnosticStage::Validation);
        assert_eq!(diagnostics[0].field.as_deref(), Some("metadata.events[0]"));
    }

    #[test]
    fn test_missing_required_fields_collects_all_diagnostics() {
        let diagnostics = Metadata::from_value(&json!({})).unwrap_err();
        let fields: Vec<&str> = diagnostics
            .iter()
            .filter_map(|d| d.field.as_deref())
            .collect();
        assert!(fields.contains(&"metadata.name"));
        assert!(fields.contains(&"metadata.displayName"));
        assert!(fields.contains(&"metadata.events"));
    }

    #[test]
    fn test_display_name_length_limit() {
        let mut raw = valid_metadata();
        raw["displayName"] = json!("x".repeat(81));
        let diagnostics = Metadata::from_value(&raw).unwrap_err();
        assert!(diagnostics
            .iter()
            .any(|d| d.field.as_deref() == Some("metadata.displayName")));
    }

    #[test]
    fn test_apply_defaults_keeps_explicit_values() {
        let metadata = Metadata::from_value(&valid_metadata()).unwrap();
        let mut config = serde_json::Map::new();
        config.insert("interval_ms".to_string(), json!(250));
        metadata.apply_defaults(&mut config);
        assert_eq!(config["interval_ms"], json!(250));
        assert_eq!(config[DRY_RUN_FIELD], json!(true));
    }
}
