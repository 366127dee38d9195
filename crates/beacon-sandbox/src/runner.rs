//! JavaScript execution for widget scripts.
//!
//! Every execution gets a brand-new interpreter built on a blocking thread,
//! so no state survives between instances or between ticks of one instance.
//! The interpreter has no filesystem, network or process bindings; the only
//! host data it sees is the prelude generated from the [`ScriptContext`].
//!
//! ## Script contract
//!
//! ```javascript
//! function run() {
//!     print("fetching " + url);          // appended to the execution log
//!     return { temp: 42, id: WIDGET_INSTANCE_ID };
//! }
//! ```
//!
//! A string return value is used as-is, anything else is `JSON.stringify`-ed.
//! The output must parse as a JSON object or array.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_core::config::SandboxConfig;
use beacon_core::ExecutionResult;
use boa_engine::{context::ContextBuilder, Source};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::{ScriptContext, CONFIG_VARIABLE, INSTANCE_ID_VARIABLE};
use crate::error::{Result, SandboxError};

const LOG_GLOBAL: &str = "__beaconLog";

const CALL_RUN: &str = "(function () {
    if (typeof run !== 'function') { throw new Error('script does not define run()'); }
    var result = run();
    if (typeof result === 'string') { return result; }
    return JSON.stringify(result);
})()";

const RESERVED_WORDS: &[&str] = &[
    "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete", "do",
    "else", "enum", "export", "extends", "false", "finally", "for", "function", "if", "import",
    "in", "instanceof", "let", "new", "null", "return", "static", "super", "switch", "this",
    "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield", "await",
    "undefined", "NaN", "Infinity", "print", "run",
    // standard globals the prelude and scripts rely on
    "globalThis", "eval", "arguments", "Object", "Function", "Array", "String", "Number",
    "Boolean", "Symbol", "BigInt", "Math", "JSON", "Date", "RegExp", "Error", "TypeError",
    "RangeError", "SyntaxError", "ReferenceError", "EvalError", "URIError", "AggregateError",
    "Promise", "Proxy", "Reflect", "Map", "Set", "WeakMap", "WeakSet", "WeakRef",
    "ArrayBuffer", "DataView", "Int8Array", "Uint8Array", "Uint8ClampedArray", "Int16Array",
    "Uint16Array", "Int32Array", "Uint32Array", "Float32Array", "Float64Array",
    "BigInt64Array", "BigUint64Array", "Intl", "parseInt", "parseFloat", "isNaN", "isFinite",
    "encodeURI", "encodeURIComponent", "decodeURI", "decodeURIComponent", "escape", "unescape",
];

/// Executes one script against one context within a time budget.
///
/// Implementations must return promptly once `cancel` fires.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn execute(
        &self,
        script: &str,
        context: &ScriptContext,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> ExecutionResult;
}

/// Interpreter limits applied inside each fresh context.
#[derive(Debug, Clone, Copy)]
struct Limits {
    loop_iterations: u64,
    recursion: usize,
}

/// What the interpreter thread hands back.
struct Evaluation {
    outcome: Result<String>,
    log: String,
}

/// boa-backed [`ScriptRunner`] sharing a bounded pool of interpreter threads.
pub struct BoaRunner {
    permits: Arc<Semaphore>,
    live: Arc<AtomicUsize>,
    limits: Limits,
}

/// Counts an interpreter thread for as long as it runs, including after its
/// caller has given up on it.
struct LiveInterpreter(Arc<AtomicUsize>);

impl LiveInterpreter {
    fn enter(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for LiveInterpreter {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BoaRunner {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            live: Arc::new(AtomicUsize::new(0)),
            limits: Limits {
                loop_iterations: config.loop_iteration_limit,
                recursion: config.recursion_limit,
            },
        }
    }

    /// Interpreter threads still running, abandoned ones included.
    pub fn live_interpreters(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    async fn run(
        &self,
        script: &str,
        context: &ScriptContext,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> (Result<String>, String) {
        let prelude = build_prelude(context);
        let script = script.to_string();
        let limits = self.limits;
        let permits = Arc::clone(&self.permits);
        let live = Arc::clone(&self.live);
        // The budget covers the wait for a pool slot. The slot belongs to this
        // future, so it is freed when the budget runs out even if the
        // interpreter thread is still going.
        let task = async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| SandboxError::Fatal(format!("interpreter pool closed: {e}")))?;
            let guard = LiveInterpreter::enter(live);
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                evaluate(&prelude, &script, limits)
            })
            .await
            .map_err(|e| SandboxError::Fatal(format!("interpreter thread failed: {e}")))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => (Err(SandboxError::Cancelled), String::new()),
            joined = tokio::time::timeout(budget, task) => match joined {
                Err(_elapsed) => {
                    warn!(
                        instance_id = context.instance_id,
                        budget_ms = budget.as_millis() as u64,
                        live_interpreters = self.live_interpreters(),
                        "script execution timed out"
                    );
                    (
                        Err(SandboxError::Timeout { ms: budget.as_millis() as u64 }),
                        String::new(),
                    )
                }
                Ok(Err(e)) => (Err(e), String::new()),
                Ok(Ok(evaluation)) => {
                    let outcome = evaluation.outcome.and_then(|raw| validate_output(&raw).map(|_| raw));
                    (outcome, evaluation.log)
                }
            },
        }
    }
}

#[async_trait]
impl ScriptRunner for BoaRunner {
    async fn execute(
        &self,
        script: &str,
        context: &ScriptContext,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let (outcome, log) = self.run(script, context, budget, cancel).await;
        match outcome {
            Ok(data) => {
                debug!(instance_id = context.instance_id, bytes = data.len(), "script succeeded");
                ExecutionResult::success(data, log)
            }
            Err(e) => {
                debug!(instance_id = context.instance_id, error = %e, "script failed");
                let diagnostic = if log.is_empty() {
                    e.to_string()
                } else {
                    format!("{log}\n{e}")
                };
                ExecutionResult::failure(e.kind(), diagnostic)
            }
        }
    }
}

/// Runs on a blocking thread; the boa context never leaves it.
fn evaluate(prelude: &str, script: &str, limits: Limits) -> Evaluation {
    let mut context = match ContextBuilder::new().build() {
        Ok(ctx) => ctx,
        Err(err) => {
            return Evaluation {
                outcome: Err(SandboxError::Fatal(format!(
                    "failed to construct JS context: {err}"
                ))),
                log: String::new(),
            }
        }
    };
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(limits.loop_iterations);
    context
        .runtime_limits_mut()
        .set_recursion_limit(limits.recursion);

    if let Err(err) = context.eval(Source::from_bytes(prelude.as_bytes())) {
        return Evaluation {
            outcome: Err(SandboxError::Fatal(format!("injecting context failed: {err}"))),
            log: String::new(),
        };
    }

    let outcome = context
        .eval(Source::from_bytes(script.as_bytes()))
        .map_err(|err| SandboxError::Script(format!("evaluating script failed: {err}")))
        .and_then(|_| {
            context
                .eval(Source::from_bytes(CALL_RUN.as_bytes()))
                .map_err(|err| SandboxError::Script(format!("calling run failed: {err}")))
        })
        .and_then(|value| {
            value
                .to_string(&mut context)
                .map(|s| s.to_std_string_escaped())
                .map_err(|err| SandboxError::Script(format!("stringify result failed: {err}")))
        });

    let log_expr = format!("{LOG_GLOBAL}.join('\\n')");
    let log = context
        .eval(Source::from_bytes(log_expr.as_bytes()))
        .ok()
        .and_then(|v| v.as_string().map(|s| s.to_std_string_escaped()))
        .unwrap_or_default();

    Evaluation { outcome, log }
}

fn validate_output(raw: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| SandboxError::InvalidOutput(e.to_string()))?;
    if value.is_object() || value.is_array() {
        Ok(())
    } else {
        Err(SandboxError::InvalidOutput(
            "expected a JSON object or array".to_string(),
        ))
    }
}

/// Generate the JS that defines the context globals and the log sink.
fn build_prelude(context: &ScriptContext) -> String {
    let mut prelude = format!(
        "var {LOG_GLOBAL} = [];\n\
         function print() {{ {LOG_GLOBAL}.push(Array.prototype.map.call(arguments, String).join(' ')); }}\n\
         var {INSTANCE_ID_VARIABLE} = {};\n",
        context.instance_id
    );

    let config: serde_json::Map<String, serde_json::Value> = context
        .variables
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect();
    prelude.push_str(&format!(
        "var {CONFIG_VARIABLE} = {};\n",
        serde_json::Value::Object(config)
    ));

    for (name, value) in context.variables.iter() {
        if is_injectable(name) {
            prelude.push_str(&format!("var {name} = {};\n", js_string_literal(value)));
        }
    }
    prelude
}

fn js_string_literal(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".into())
}

fn is_injectable(name: &str) -> bool {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$');
    valid_start
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        && !name.starts_with("__")
        && name != INSTANCE_ID_VARIABLE
        && name != CONFIG_VARIABLE
        && !RESERVED_WORDS.contains(&name)
}
