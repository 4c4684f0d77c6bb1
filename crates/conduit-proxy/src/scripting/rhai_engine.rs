use std::sync::Arc;
use std::time::Instant;

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, Map, Scope, AST};
use serde_json::Value;
use tracing::debug;

use super::{
    console_emit, unix_millis, ConsoleLevel, Invocation, SandboxLimits, ScriptError, ScriptRole,
    SharedContext, SCRIPT_LOG_TARGET,
};

/// Check the deadline once every this many operations.
const PROGRESS_CHECK_INTERVAL: u64 = 256;

/// `console` object exposed to Rhai scripts.
#[derive(Debug, Clone)]
pub struct ScriptConsole {
    label: Arc<str>,
    role: ScriptRole,
}

impl ScriptConsole {
    pub fn new(label: &str, role: ScriptRole) -> Self {
        Self {
            label: Arc::from(label),
            role,
        }
    }

    fn emit(&mut self, level: ConsoleLevel, parts: &[Dynamic]) {
        let message = parts
            .iter()
            .map(|part| part.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        console_emit(level, &self.label, self.role, &message);
    }
}

/// `timer` object exposed to Rhai scripts.
#[derive(Debug, Clone)]
pub struct ScriptTimer {
    started: Instant,
}

impl ScriptTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn now(&mut self) -> i64 {
        unix_millis()
    }

    pub fn elapsed(&mut self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }
}

/// Build a sandboxed engine.
///
/// No module imports, no `eval`, bounded strings/collections/call depth, and when a
/// deadline is given the progress callback terminates the script once it passes.
pub(super) fn create_engine(limits: &SandboxLimits, deadline: Option<Instant>) -> Engine {
    let mut engine = Engine::new();

    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");
    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(limits.max_call_depth);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_collection_size);
    engine.set_max_map_size(limits.max_collection_size);

    if let Some(deadline) = deadline {
        engine.on_progress(move |operations| {
            if operations % PROGRESS_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
                Some(Dynamic::from("timeout"))
            } else {
                None
            }
        });
    }

    engine.on_print(|text| debug!(target: SCRIPT_LOG_TARGET, "{text}"));
    engine.on_debug(|text, _source, position| {
        debug!(target: SCRIPT_LOG_TARGET, %position, "{text}")
    });

    engine
        .register_type_with_name::<SharedContext>("Context")
        .register_fn("get", |ctx: &mut SharedContext, key: &str| -> Dynamic {
            ctx.get_value(key).map(json_to_dynamic).unwrap_or(Dynamic::UNIT)
        })
        .register_fn("set", |ctx: &mut SharedContext, key: &str, value: Dynamic| {
            ctx.set_value(key, dynamic_to_json(value))
        })
        .register_fn("has", |ctx: &mut SharedContext, key: &str| ctx.contains(key))
        .register_fn("remove", |ctx: &mut SharedContext, key: &str| -> Dynamic {
            ctx.remove(key).map(json_to_dynamic).unwrap_or(Dynamic::UNIT)
        })
        .register_indexer_get(|ctx: &mut SharedContext, key: &str| -> Dynamic {
            ctx.get_value(key).map(json_to_dynamic).unwrap_or(Dynamic::UNIT)
        })
        .register_indexer_set(|ctx: &mut SharedContext, key: &str, value: Dynamic| {
            ctx.set_value(key, dynamic_to_json(value))
        });

    engine.register_type_with_name::<ScriptConsole>("Console");
    for (name, level) in ConsoleLevel::METHODS {
        engine.register_fn(name, move |console: &mut ScriptConsole, message: Dynamic| {
            console.emit(level, &[message])
        });
        engine.register_fn(
            name,
            move |console: &mut ScriptConsole, first: Dynamic, second: Dynamic| {
                console.emit(level, &[first, second])
            },
        );
    }

    engine
        .register_type_with_name::<ScriptTimer>("Timer")
        .register_fn("now", ScriptTimer::now)
        .register_fn("elapsed", ScriptTimer::elapsed);

    engine
}

/// Compile the source and evaluate it down to the function it defines.
pub(super) fn load_entry(
    engine: &Engine,
    source: &str,
    label: &str,
    role: ScriptRole,
    limits: &SandboxLimits,
) -> Result<(AST, FnPtr), ScriptError> {
    let ast = engine.compile(source).map_err(|e| ScriptError::Compile {
        role,
        message: e.to_string(),
    })?;

    let mut scope = Scope::new();
    scope.push("console", ScriptConsole::new(label, role));
    scope.push("timer", ScriptTimer::start());

    let entry = engine
        .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
        .map_err(|e| script_error(*e, role, limits))?;

    let entry = entry
        .flatten()
        .try_cast::<FnPtr>()
        .ok_or(ScriptError::NotCallable { role })?;
    Ok((ast, entry))
}

pub(super) fn invoke(invocation: &Invocation) -> Result<Option<Value>, ScriptError> {
    let role = invocation.role;
    let limits = &invocation.limits;
    let engine = create_engine(limits, Some(Instant::now() + limits.timeout));
    let (ast, entry) = load_entry(&engine, &invocation.source, &invocation.label, role, limits)?;

    let mut args = invocation.args.iter().cloned().map(json_to_dynamic);
    let mut next_arg = || args.next().unwrap_or(Dynamic::UNIT);
    let context = Dynamic::from(invocation.context.clone());

    let result = match role {
        ScriptRole::Header | ScriptRole::Param => {
            entry.call::<Dynamic>(&engine, &ast, (next_arg(), context))
        }
        ScriptRole::Response => {
            let body = next_arg();
            let headers = next_arg();
            entry.call::<Dynamic>(&engine, &ast, (body, headers, context))
        }
    }
    .map_err(|e| script_error(*e, role, limits))?
    .flatten();

    if result.is_unit() {
        Ok(None)
    } else {
        Ok(Some(dynamic_to_json(result)))
    }
}

fn script_error(err: EvalAltResult, role: ScriptRole, limits: &SandboxLimits) -> ScriptError {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => script_error(*inner, role, limits),
        EvalAltResult::ErrorTerminated(..) => ScriptError::Timeout {
            role,
            limit_ms: limits.timeout.as_millis() as u64,
        },
        EvalAltResult::ErrorRuntime(value, _) => ScriptError::Runtime {
            role,
            message: value.to_string(),
        },
        EvalAltResult::ErrorTooManyOperations(..)
        | EvalAltResult::ErrorStackOverflow(..)
        | EvalAltResult::ErrorDataTooLarge(..) => ScriptError::ResourceLimit {
            role,
            message: err.to_string(),
        },
        EvalAltResult::ErrorParsing(..) => ScriptError::Compile {
            role,
            message: err.to_string(),
        },
        other => ScriptError::Runtime {
            role,
            message: other.to_string(),
        },
    }
}

pub(super) fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s),
        Value::Array(arr) => Dynamic::from_array(arr.into_iter().map(json_to_dynamic).collect()),
        Value::Object(obj) => {
            let mut map = Map::new();
            for (k, v) in obj {
                map.insert(k.into(), json_to_dynamic(v));
            }
            Dynamic::from_map(map)
        }
    }
}

pub(super) fn dynamic_to_json(value: Dynamic) -> Value {
    let value = value.flatten();
    if value.is_unit() {
        Value::Null
    } else if let Ok(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        Value::Number(i.into())
    } else if let Ok(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if let Ok(c) = value.as_char() {
        Value::String(c.to_string())
    } else if value.is_string() {
        value.into_string().map(Value::String).unwrap_or(Value::Null)
    } else if value.is_array() {
        value
            .into_array()
            .map(|arr| Value::Array(arr.into_iter().map(dynamic_to_json).collect()))
            .unwrap_or(Value::Null)
    } else if value.is_map() {
        let mut obj = serde_json::Map::new();
        if let Some(map) = value.try_cast::<Map>() {
            for (k, v) in map {
                obj.insert(k.to_string(), dynamic_to_json(v));
            }
        }
        Value::Object(obj)
    } else if let Some(ctx) = value.clone().try_cast::<SharedContext>() {
        Value::Object(ctx.snapshot())
    } else {
        Value::String(value.to_string())
    }
}
