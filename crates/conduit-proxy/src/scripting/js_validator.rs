use super::js_engine::{create_context, load_entry};
use super::validator::{ScriptValidationError, ScriptValidator};
use super::{SandboxLimits, ScriptError, ScriptLanguage, ScriptRole};

/// Checks that a JavaScript script parses and evaluates to a function.
#[derive(Debug, Clone, Default)]
pub struct JsValidator {
    limits: SandboxLimits,
}

impl JsValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: SandboxLimits) -> Self {
        Self { limits }
    }
}

impl ScriptValidator for JsValidator {
    fn language(&self) -> ScriptLanguage {
        ScriptLanguage::JavaScript
    }

    fn validate(&self, script: &str) -> Result<(), ScriptValidationError> {
        let role = ScriptRole::Header;
        let result = create_context(&self.limits, role)
            .and_then(|mut context| load_entry(&mut context, script, role));

        result.map(|_| ()).map_err(|e| match e {
            ScriptError::Compile { message, .. } => ScriptValidationError::SyntaxError {
                engine: "javascript".to_string(),
                message,
            },
            ScriptError::NotCallable { .. } => ScriptValidationError::NotCallable {
                engine: "javascript".to_string(),
            },
            other => ScriptValidationError::LoadError {
                engine: "javascript".to_string(),
                message: other.to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arrow_function_is_valid() {
        let validator = JsValidator::new();
        assert!(validator
            .validate("(headers, ctx) => ({ ...headers, 'x-source': 'conduit' })")
            .is_ok());
    }

    #[test]
    fn test_named_function_completion_is_valid() {
        let script = r#"
function transform(body, headers, ctx) {
    return { body: body, headers: headers };
}
transform;
"#;
        assert!(JsValidator::new().validate(script).is_ok());
    }

    #[test]
    fn test_syntax_error() {
        let script = r#"
(headers, ctx {
    return headers;
}
"#;
        assert!(matches!(
            JsValidator::new().validate(script),
            Err(ScriptValidationError::SyntaxError { .. })
        ));
    }

    #[test]
    fn test_single_declaration_is_valid() {
        let script = "function transform(headers, ctx) { return headers; }";
        assert!(JsValidator::new().validate(script).is_ok());
    }

    #[test]
    fn test_non_function_value_is_not_callable() {
        let script = "const limit = 10;\nlimit * 2";
        assert!(matches!(
            JsValidator::new().validate(script),
            Err(ScriptValidationError::NotCallable { .. })
        ));
    }

    #[test]
    fn test_top_level_error_is_load_error() {
        let err = JsValidator::new()
            .validate("undefinedFunction(); (h) => h")
            .unwrap_err();
        assert!(matches!(err, ScriptValidationError::LoadError { .. }), "{err:?}");
    }
}
