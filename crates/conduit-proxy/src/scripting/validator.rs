//! Load-time script validation shared by every engine.
//!
//! A script is valid when it compiles and its top level evaluates to a callable. The
//! callable itself is not invoked.

use thiserror::Error;

use super::ScriptLanguage;

pub trait ScriptValidator {
    fn language(&self) -> ScriptLanguage;

    fn validate(&self, script: &str) -> Result<(), ScriptValidationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptValidationError {
    #[error("[{engine}] Syntax error: {message}")]
    SyntaxError { engine: String, message: String },
    #[error("[{engine}] Script must evaluate to a function")]
    NotCallable { engine: String },
    #[error("[{engine}] Load error: {message}")]
    LoadError { engine: String, message: String },
    #[error("Unsupported script engine: {engine}")]
    UnsupportedEngine { engine: String },
}

impl ScriptValidationError {
    pub fn engine(&self) -> &str {
        match self {
            ScriptValidationError::SyntaxError { engine, .. }
            | ScriptValidationError::NotCallable { engine }
            | ScriptValidationError::LoadError { engine, .. }
            | ScriptValidationError::UnsupportedEngine { engine } => engine,
        }
    }
}

/// Validate `script` with the validator for `language`.
pub fn validate_script(language: ScriptLanguage, script: &str) -> Result<(), ScriptValidationError> {
    match language {
        ScriptLanguage::Rhai => super::RhaiValidator::new().validate(script),
        #[cfg(feature = "javascript")]
        ScriptLanguage::JavaScript => super::JsValidator::new().validate(script),
        #[cfg(not(feature = "javascript"))]
        ScriptLanguage::JavaScript => Err(ScriptValidationError::UnsupportedEngine {
            engine: "javascript (feature disabled)".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ScriptValidationError::SyntaxError {
            engine: "rhai".to_string(),
            message: "unexpected token".to_string(),
        };
        assert_eq!(err.to_string(), "[rhai] Syntax error: unexpected token");
        assert_eq!(err.engine(), "rhai");
    }

    #[test]
    fn test_validate_script_dispatches_rhai() {
        assert!(validate_script(ScriptLanguage::Rhai, "|h, ctx| h").is_ok());
        assert!(matches!(
            validate_script(ScriptLanguage::Rhai, "40 + 2"),
            Err(ScriptValidationError::NotCallable { .. })
        ));
    }

    #[cfg(feature = "javascript")]
    #[test]
    fn test_validate_script_dispatches_javascript() {
        assert!(validate_script(ScriptLanguage::JavaScript, "(h, ctx) => h").is_ok());
        assert!(matches!(
            validate_script(ScriptLanguage::JavaScript, "(h, ctx) => {"),
            Err(ScriptValidationError::SyntaxError { .. })
        ));
    }
}
