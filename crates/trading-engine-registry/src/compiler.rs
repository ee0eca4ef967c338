//! Module compiler seam.
//!
//! Decoding user strategy modules is an external concern: the store only
//! needs something that turns source text into a validated
//! [`CompiledModule`]. Production embedders plug in their interpreter
//! behind [`ModuleCompiler`]; this crate ships [`JsonModuleCompiler`], a
//! reference implementation over a JSON module manifest, which the built-in
//! strategies and the test suite use.
//!
//! Diagnostics are staged: `compile` for unparseable source, `execute` when
//! the source parses but exports no usable metadata object, `validation`
//! for metadata contract violations.

use serde_json::Value;

use trading_engine_core::error::{DiagnosticStage, EngineError, ModuleDiagnostic, Result};
use trading_engine_core::event::EventType;

use crate::metadata::Metadata;

/// A parsed, validated strategy module.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledModule {
    pub metadata: Metadata,
    /// Event types the module's handler subscribes to
    pub subscribed_events: Vec<EventType>,
    /// Whether the handler accepts events from more than one provider
    pub wants_cross_provider_events: bool,
}

/// Compiles strategy module source in an isolated context per call.
#[cfg_attr(test, mockall::automock)]
pub trait ModuleCompiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<CompiledModule>;
}

/// Reference compiler over a JSON module manifest of the shape
/// `{"metadata": {...}, "handler": {"wantsCrossProviderEvents": bool}}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonModuleCompiler;

impl ModuleCompiler for JsonModuleCompiler {
    fn compile(&self, source: &str) -> Result<CompiledModule> {
        let document: Value = match serde_json::from_str(source) {
            Ok(document) => document,
            Err(err) => {
                let diagnostic =
                    ModuleDiagnostic::new(DiagnosticStage::Compile, err.to_string())
                        .with_position(err.line() as u32, err.column() as u32);
                return Err(EngineError::MetadataInvalid {
                    diagnostics: vec![diagnostic],
                });
            }
        };

        let Some(metadata_value) = document.get("metadata") else {
            return Err(EngineError::MetadataInvalid {
                diagnostics: vec![ModuleDiagnostic::new(
                    DiagnosticStage::Execute,
                    "module did not export a metadata object",
                )
                .with_hint("export `{\"metadata\": {...}}` at the top level")],
            });
        };

        let metadata = Metadata::from_value(metadata_value)
            .map_err(|diagnostics| EngineError::MetadataInvalid { diagnostics })?;

        let wants_cross_provider_events = document
            .get("handler")
            .and_then(|handler| handler.get("wantsCrossProviderEvents"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let subscribed_events = metadata.events.clone();
        Ok(CompiledModule {
            metadata,
            subscribed_events,
            wants_cross_provider_events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_stage_diagnostic_carries_position() {
        let err = JsonModuleCompiler.compile("{not json").unwrap_err();
        let EngineError::MetadataInvalid { diagnostics } = err else {
            panic!("expected MetadataInvalid");
        };
        assert_eq!(diagnostics[0].stage, DiagnosticStage::Compile);
        assert!(diagnostics[0].line.is_some());
        assert!(diagnostics[0].column.is_some());
    }

    #[test]
    fn test_execute_stage_when_metadata_export_missing() {
        let err = JsonModuleCompiler.compile(r#"{"handler": {}}"#).unwrap_err();
        let EngineError::MetadataInvalid { diagnostics } = err else {
            panic!("expected MetadataInvalid");
        };
        assert_eq!(diagnostics[0].stage, DiagnosticStage::Execute);
    }

    #[test]
    fn test_cross_provider_flag_extraction() {
        let source = r#"{
            "metadata": {
                "name": "spread",
                "displayName": "Spread Watcher",
                "events": ["ticker"]
            },
            "handler": {"wantsCrossProviderEvents": true}
        }"#;
        let module = JsonModuleCompiler.compile(source).unwrap();
        assert!(module.wants_cross_provider_events);
        assert_eq!(module.subscribed_events, vec![EventType::Ticker]);
    }

    #[test]
    fn test_validation_diagnostics_pass_through() {
        let source = r#"{"metadata": {"name": "x", "displayName": "X", "events": ["UnknownEvent"]}}"#;
        let err = JsonModuleCompiler.compile(source).unwrap_err();
        let EngineError::MetadataInvalid { diagnostics } = err else {
            panic!("expected MetadataInvalid");
        };
        assert_eq!(diagnostics[0].stage, DiagnosticStage::Validation);
        assert_eq!(diagnostics[0].field.as_deref(), Some("metadata.events[0]"));
    }
}
