use std::time::Instant;

use super::rhai_engine::{create_engine, load_entry};
use super::validator::{ScriptValidationError, ScriptValidator};
use super::{SandboxLimits, ScriptError, ScriptLanguage, ScriptRole};

/// Checks that a Rhai script compiles and evaluates to a closure or `Fn(...)` pointer.
///
/// The top level is evaluated under the default sandbox limits, so a script that loops
/// forever before producing its function fails here instead of on the first request.
#[derive(Debug, Clone, Default)]
pub struct RhaiValidator {
    limits: SandboxLimits,
}

impl RhaiValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: SandboxLimits) -> Self {
        Self { limits }
    }
}

impl ScriptValidator for RhaiValidator {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::Rhai
    }

    fn validate(&self, script: &str) -> Result<(), ScriptValidationError> {
        let engine = create_engine(&self.limits, Some(Instant::now() + self.limits.timeout));
        load_entry(&engine, script, "validation", ScriptRole::Header, &self.limits)
            .map(|_| ())
            .map_err(|e| match e {
                ScriptError::Compile { message, .. } => ScriptValidationError::SyntaxError {
                    engine: "rhai".to_string(),
                    message,
                },
                ScriptError::NotCallable { .. } => ScriptValidationError::NotCallable {
                    engine: "rhai".to_string(),
                },
                other => ScriptValidationError::LoadError {
                    engine: "rhai".to_string(),
                    message: other.to_string(),
                },
            })
    }
}
