//! Boa-backed JavaScript engine.
//!
//! Boa has no interrupt hook, so the only in-engine stop is the loop iteration budget.
//! It counts each loop on its own: nested loops multiply it. The sandbox bounds how many
//! such workers may be alive at once.

use std::cell::RefCell;
use std::time::Instant;

use boa_engine::{
    js_string, native_function::NativeFunction, object::builtins::JsArray, property::PropertyKey,
    Context, JsError, JsObject, JsResult, JsValue, Source,
};
use serde_json::Value;

use super::{
    console_emit, unix_millis, ConsoleLevel, Invocation, SandboxLimits, ScriptError, ScriptRole,
};

/// Create a JavaScript object with Object.prototype so scripts get toString, spread, etc.
fn create_js_object(context: &Context) -> JsObject {
    JsObject::with_object_proto(context.intrinsics())
}

struct ConsoleScope {
    label: String,
    role: ScriptRole,
    started: Instant,
}

// Native functions are plain fn pointers, so the invocation they report for lives here.
thread_local! {
    static CURRENT_SCOPE: RefCell<Option<ConsoleScope>> = const { RefCell::new(None) };
}

fn set_current_scope(scope: ConsoleScope) {
    CURRENT_SCOPE.with(|s| {
        *s.borrow_mut() = Some(scope);
    });
}

fn clear_current_scope() {
    CURRENT_SCOPE.with(|s| {
        *s.borrow_mut() = None;
    });
}

fn with_current_scope<T>(f: impl FnOnce(&ConsoleScope) -> T) -> Option<T> {
    CURRENT_SCOPE.with(|s| s.borrow().as_ref().map(f))
}

pub(super) fn invoke(invocation: &Invocation) -> Result<Option<Value>, ScriptError> {
    set_current_scope(ConsoleScope {
        label: invocation.label.clone(),
        role: invocation.role,
        started: Instant::now(),
    });

    let result = invoke_inner(invocation);

    clear_current_scope();

    result
}

fn invoke_inner(invocation: &Invocation) -> Result<Option<Value>, ScriptError> {
    let role = invocation.role;
    let mut context = create_context(&invocation.limits, role)?;
    let entry = load_entry(&mut context, &invocation.source, role)?;

    let mut args = Vec::with_capacity(invocation.args.len() + 1);
    for arg in &invocation.args {
        args.push(json_to_js(&mut context, arg, role)?);
    }
    let ctx_value = json_to_js(
        &mut context,
        &Value::Object(invocation.context.snapshot()),
        role,
    )?;
    args.push(ctx_value.clone());

    let result = entry.call(&JsValue::undefined(), &args, &mut context);

    // Writes to `ctx` survive even when the script throws afterwards.
    if let Ok(Value::Object(values)) = js_to_json(&mut context, &ctx_value) {
        invocation.context.replace(values);
    }

    let result = result.map_err(|e| script_error(&e, &mut context, role))?;
    if result.is_null() || result.is_undefined() {
        return Ok(None);
    }
    js_to_json(&mut context, &result)
        .map(Some)
        .map_err(|e| ScriptError::InvalidResult {
            role,
            message: e.to_string(),
        })
}

/// A fresh context with runtime limits, no `eval`, and the `console`/`timer` globals.
pub(super) fn create_context(limits: &SandboxLimits, role: ScriptRole) -> Result<Context, ScriptError> {
    let mut context = Context::default();
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(limits.loop_iteration_limit);
    context
        .runtime_limits_mut()
        .set_recursion_limit(limits.max_call_depth);

    let setup = |context: &mut Context| -> JsResult<()> {
        let global = context.global_object();
        global.delete_property_or_throw(js_string!("eval"), context)?;

        let console = create_js_object(context);
        register_method(&console, "log", console_log, context)?;
        register_method(&console, "info", console_info, context)?;
        register_method(&console, "warn", console_warn, context)?;
        register_method(&console, "error", console_error, context)?;
        register_method(&console, "debug", console_debug, context)?;
        global.set(js_string!("console"), console, false, context)?;

        let timer = create_js_object(context);
        register_method(&timer, "now", timer_now, context)?;
        register_method(&timer, "elapsed", timer_elapsed, context)?;
        global.set(js_string!("timer"), timer, false, context)?;
        Ok(())
    };
    setup(&mut context).map_err(|e| ScriptError::Internal(format!("{role} script setup: {e}")))?;

    Ok(context)
}

/// Evaluate the source down to the function it defines.
///
/// The source is first evaluated as a parenthesised expression so both `(h, ctx) => ...`
/// and `function (h, ctx) { ... }` work; anything that is not an expression is evaluated
/// as a program and its completion value is used.
pub(super) fn load_entry(
    context: &mut Context,
    source: &str,
    role: ScriptRole,
) -> Result<JsObject, ScriptError> {
    let wrapped = format!("(\n{source}\n)");
    let value = match context.eval(Source::from_bytes(wrapped.as_bytes())) {
        Ok(value) => value,
        Err(e) if is_syntax_error(&e) => context
            .eval(Source::from_bytes(source.as_bytes()))
            .map_err(|e| {
                if is_syntax_error(&e) {
                    ScriptError::Compile {
                        role,
                        message: e.to_string(),
                    }
                } else {
                    script_error(&e, context, role)
                }
            })?,
        Err(e) => return Err(script_error(&e, context, role)),
    };

    value
        .as_callable()
        .cloned()
        .ok_or(ScriptError::NotCallable { role })
}

fn is_syntax_error(err: &JsError) -> bool {
    err.to_string().starts_with("SyntaxError")
}

fn script_error(err: &JsError, context: &mut Context, role: ScriptRole) -> ScriptError {
    let message = error_message(err, context);
    if message.contains("iteration limit") || message.contains("recursion limit") {
        ScriptError::ResourceLimit { role, message }
    } else {
        ScriptError::Runtime { role, message }
    }
}

fn error_message(err: &JsError, context: &mut Context) -> String {
    if let Some(s) = err.as_opaque().and_then(JsValue::as_string) {
        return s.to_std_string_escaped();
    }
    match err.try_native(context) {
        Ok(native) => native.to_string(),
        Err(_) => err.to_string(),
    }
}

/// Register a native function method on a JS object.
fn register_method(
    obj: &JsObject,
    name: &str,
    func: fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>,
    context: &mut Context,
) -> JsResult<()> {
    obj.set(
        PropertyKey::from(js_string!(name)),
        NativeFunction::from_fn_ptr(func).to_js_function(context.realm()),
        false,
        context,
    )
    .map(|_| ())
}

fn console_call(level: ConsoleLevel, args: &[JsValue]) -> JsResult<JsValue> {
    let message = args
        .iter()
        .map(|arg| match arg.as_string() {
            Some(s) => s.to_std_string_escaped(),
            None => arg.display().to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ");
    with_current_scope(|scope| console_emit(level, &scope.label, scope.role, &message));
    Ok(JsValue::undefined())
}

fn console_log(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    console_call(ConsoleLevel::Log, args)
}

fn console_info(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    console_call(ConsoleLevel::Info, args)
}

fn console_warn(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    console_call(ConsoleLevel::Warn, args)
}

fn console_error(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    console_call(ConsoleLevel::Error, args)
}

fn console_debug(_this: &JsValue, args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    console_call(ConsoleLevel::Debug, args)
}

fn timer_now(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::from(unix_millis()))
}

fn timer_elapsed(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    let elapsed = with_current_scope(|scope| scope.started.elapsed().as_millis() as i64);
    Ok(JsValue::from(elapsed.unwrap_or(0)))
}

fn json_to_js(context: &mut Context, value: &Value, role: ScriptRole) -> Result<JsValue, ScriptError> {
    json_to_js_result(context, value)
        .map_err(|e| ScriptError::Internal(format!("{role} script argument conversion: {e}")))
}

fn json_to_js_result(context: &mut Context, value: &Value) -> JsResult<JsValue> {
    match value {
        Value::Null => Ok(JsValue::null()),
        Value::Bool(b) => Ok(JsValue::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(JsValue::from(i))
            } else if let Some(f) = n.as_f64() {
                Ok(JsValue::from(f))
            } else {
                Ok(JsValue::null())
            }
        }
        Value::String(s) => Ok(JsValue::from(js_string!(s.clone()))),
        Value::Array(arr) => {
            let js_arr = JsArray::new(context);
            for (i, v) in arr.iter().enumerate() {
                let js_val = json_to_js_result(context, v)?;
                js_arr.set(i as u32, js_val, false, context)?;
            }
            Ok(js_arr.into())
        }
        Value::Object(obj) => {
            let js_obj = create_js_object(context);
            for (k, v) in obj {
                let js_val = json_to_js_result(context, v)?;
                js_obj.set(js_string!(k.clone()), js_val, false, context)?;
            }
            Ok(js_obj.into())
        }
    }
}

/// Integral numbers come back as JSON integers; NaN and infinities become `null`.
fn js_to_json(context: &mut Context, value: &JsValue) -> JsResult<Value> {
    if value.is_null() || value.is_undefined() {
        return Ok(Value::Null);
    }

    if let Some(b) = value.as_boolean() {
        return Ok(Value::Bool(b));
    }

    if let Some(n) = value.as_number() {
        if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
            return Ok(Value::Number((n as i64).into()));
        }
        return Ok(serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null));
    }

    if let Some(s) = value.as_string() {
        return Ok(Value::String(s.to_std_string_escaped()));
    }

    if let Some(obj) = value.as_object() {
        if obj.is_callable() {
            return Ok(Value::Null);
        }

        if obj.is_array() {
            let len = obj
                .get(js_string!("length"), context)?
                .as_number()
                .unwrap_or(0.0) as u32;
            let mut arr = Vec::with_capacity(len as usize);
            for i in 0..len {
                let item = obj.get(i, context)?;
                arr.push(js_to_json(context, &item)?);
            }
            return Ok(Value::Array(arr));
        }

        let mut map = serde_json::Map::new();
        for key in obj.own_property_keys(context)? {
            let key_str = match &key {
                PropertyKey::String(s) => s.to_std_string_escaped(),
                PropertyKey::Index(i) => i.get().to_string(),
                PropertyKey::Symbol(_) => continue,
            };
            let val = obj.get(key.clone(), context)?;
            if val.is_undefined() {
                continue;
            }
            map.insert(key_str, js_to_json(context, &val)?);
        }
        return Ok(Value::Object(map));
    }

    Ok(Value::Null)
}
