//! Rhai script handlers
//!
//! A [`ScriptHandler`] runs a Rhai script as a [`HandlerPlugin`]. The script
//! defines any of the hook functions; hooks it does not define are skipped.
//!
//! ```rhai
//! fn on_load() { this.count = 0; }
//!
//! fn on_data(batch) {
//!     for s in batch.states {
//!         if s.name == "LED_off" {
//!             this.count += 1;
//!             set_variable("LED_n", this.count % 4 + 1);
//!         }
//!     }
//! }
//! ```
//!
//! ## Hooks
//!
//! - `on_load()`, `on_run_start()`, `on_run_stop()`, `on_tick()`
//! - `on_data(batch)` - `batch` is a map of arrays: `states`/`events` hold
//!   `#{name, time}`, `prints` hold `#{text, time}`, `analog` holds
//!   `#{channel, time, value}`
//! - `on_peer_message(from, message)`
//!
//! Hooks share state through `this`, an object map that lives as long as
//! the handler. Top-level statements are not executed.
//!
//! ## Functions
//!
//! - `set_variable(name, value)` - Set a task variable on the device
//! - `print(text)` / `print_to_log(text)` - Write to the operator log
//! - `subject()` - Experiment subject, or `()` outside an experiment
//! - `task_name()` - Name of the uploaded task
//! - `peer_set_variable(subject, name, value)` - Set a variable on a peer's device
//! - `notify_peer(subject, message)` - Call a peer's `on_peer_message`
//!
//! Calls made by a script are queued and applied once the hook returns,
//! including when the hook fails part way through.

use crate::error::{Result, ResultExt, TaskRunError};
use crate::handler::{HandlerContext, HandlerFactory, HandlerPlugin, NoopHandler};
use crate::task::TaskDefinition;
use crate::types::{Batch, VariableValue};
use rhai::{Array, CallFnOptions, Dynamic, Engine, EvalAltResult, FuncArgs, Map, Scope, AST};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// File extension of handler scripts
pub const HANDLER_FILE_EXTENSION: &str = "rhai";

/// Something a script asked for during a hook
#[derive(Debug, Clone, PartialEq)]
enum ScriptAction {
    SetVariable { name: String, value: VariableValue },
    Log(String),
    PeerSetVariable {
        subject: String,
        name: String,
        value: VariableValue,
    },
    NotifyPeer { subject: String, message: String },
}

type SharedActions = Arc<Mutex<Vec<ScriptAction>>>;

/// Session details readable from scripts, refreshed before every hook
#[derive(Debug, Clone, Default)]
struct ScriptEnv {
    subject: Option<String>,
    task_name: String,
}

type SharedScriptEnv = Arc<RwLock<ScriptEnv>>;

/// Handler plugin backed by a Rhai script
pub struct ScriptHandler {
    name: String,
    engine: Engine,
    ast: AST,
    /// Defined script functions as (name, arity)
    hooks: HashSet<(String, usize)>,
    this: Dynamic,
    actions: SharedActions,
    env: SharedScriptEnv,
}

impl ScriptHandler {
    /// Compile a handler from source
    pub fn compile(name: impl Into<String>, source: &str) -> Result<Self> {
        let name = name.into();
        let actions: SharedActions = Arc::new(Mutex::new(Vec::new()));
        let env: SharedScriptEnv = Arc::new(RwLock::new(ScriptEnv::default()));

        let mut engine = Engine::new();
        Self::configure_engine(&mut engine, actions.clone(), env.clone());

        let ast = engine
            .compile(source)
            .map_err(|e| TaskRunError::Script(format!("{}: {}", name, e)))?;
        let hooks = ast
            .iter_functions()
            .map(|f| (f.name.to_string(), f.params.len()))
            .collect();

        Ok(Self {
            name,
            engine,
            ast,
            hooks,
            this: Dynamic::from_map(Map::new()),
            actions,
            env,
        })
    }

    /// Compile a handler from a `.rhai` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            TaskRunError::Script(format!("Failed to read handler {:?}: {}", path, e))
        })?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("handler")
            .to_string();
        Self::compile(name, &source)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the script defines `hook` taking `arity` parameters
    pub fn has_hook(&self, hook: &str, arity: usize) -> bool {
        self.hooks.contains(&(hook.to_string(), arity))
    }

    /// The script's persistent `this` map
    pub fn state(&self) -> &Dynamic {
        &self.this
    }

    /// Evaluate an expression with the handler's functions available
    pub fn eval_expression(&self, expr: &str) -> Result<Dynamic> {
        self.engine
            .eval_expression::<Dynamic>(expr)
            .context("Expression evaluation failed")
    }

    /// Configure the Rhai engine with handler functions and safety limits
    fn configure_engine(engine: &mut Engine, actions: SharedActions, env: SharedScriptEnv) {
        // Set safety limits
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(100_000);
        engine.set_max_string_size(10_000);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(1_000);

        {
            let actions = actions.clone();
            engine.on_print(move |text| push(&actions, ScriptAction::Log(text.to_string())));
        }
        {
            let actions = actions.clone();
            engine.register_fn("print_to_log", move |text: &str| {
                push(&actions, ScriptAction::Log(text.to_string()))
            });
        }
        {
            let actions = actions.clone();
            engine.register_fn(
                "set_variable",
                move |name: &str, value: Dynamic| -> std::result::Result<(), Box<EvalAltResult>> {
                    let value = to_variable_value(name, &value)?;
                    push(
                        &actions,
                        ScriptAction::SetVariable {
                            name: name.to_string(),
                            value,
                        },
                    );
                    Ok(())
                },
            );
        }
        {
            let actions = actions.clone();
            engine.register_fn(
                "peer_set_variable",
                move |subject: &str,
                      name: &str,
                      value: Dynamic|
                      -> std::result::Result<(), Box<EvalAltResult>> {
                    let value = to_variable_value(name, &value)?;
                    push(
                        &actions,
                        ScriptAction::PeerSetVariable {
                            subject: subject.to_string(),
                            name: name.to_string(),
                            value,
                        },
                    );
                    Ok(())
                },
            );
        }
        {
            let actions = actions.clone();
            engine.register_fn("notify_peer", move |subject: &str, message: &str| {
                push(
                    &actions,
                    ScriptAction::NotifyPeer {
                        subject: subject.to_string(),
                        message: message.to_string(),
                    },
                )
            });
        }
        {
            let env = env.clone();
            engine.register_fn("subject", move || -> Dynamic {
                env.read()
                    .ok()
                    .and_then(|e| e.subject.clone())
                    .map(Dynamic::from)
                    .unwrap_or(Dynamic::UNIT)
            });
        }
        {
            let env = env.clone();
            engine.register_fn("task_name", move || -> String {
                env.read().map(|e| e.task_name.clone()).unwrap_or_default()
            });
        }
    }

    fn call_hook(
        &mut self,
        hook: &str,
        args: impl FuncArgs,
        ctx: &mut HandlerContext<'_>,
    ) -> anyhow::Result<()> {
        if let Ok(mut env) = self.env.write() {
            env.subject = ctx.subject().map(str::to_string);
            env.task_name = ctx.identity().task_name.clone();
        }

        let mut scope = Scope::new();
        let options = CallFnOptions::new()
            .eval_ast(false)
            .bind_this_ptr(&mut self.this);
        let result =
            self.engine
                .call_fn_with_options::<Dynamic>(options, &mut scope, &self.ast, hook, args);

        let applied = self.apply_actions(ctx);
        if let Err(e) = result {
            anyhow::bail!("{}: {}", self.name, e);
        }
        applied
    }

    fn apply_actions(&mut self, ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        let actions = match self.actions.lock() {
            Ok(mut queued) => std::mem::take(&mut *queued),
            Err(_) => anyhow::bail!("{}: action queue poisoned", self.name),
        };

        let mut first_error: Option<TaskRunError> = None;
        for action in actions {
            match action {
                ScriptAction::SetVariable { name, value } => {
                    // undeclared names and device failures are already reported
                    let _ = ctx.set_variable(&name, value);
                }
                ScriptAction::Log(line) => ctx.log(&line),
                ScriptAction::PeerSetVariable {
                    subject,
                    name,
                    value,
                } => {
                    if let Err(e) = ctx.peer_set_variable(&subject, &name, value) {
                        first_error.get_or_insert(e);
                    }
                }
                ScriptAction::NotifyPeer { subject, message } => {
                    if let Err(e) = ctx.notify_peer(&subject, &message) {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn call_if_defined(
        &mut self,
        hook: &str,
        ctx: &mut HandlerContext<'_>,
    ) -> anyhow::Result<()> {
        if !self.has_hook(hook, 0) {
            return Ok(());
        }
        self.call_hook(hook, (), ctx)
    }
}

impl HandlerPlugin for ScriptHandler {
    fn on_load(&mut self, ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        self.call_if_defined("on_load", ctx)
    }

    fn on_run_start(&mut self, ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        self.call_if_defined("on_run_start", ctx)
    }

    fn on_run_stop(&mut self, ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        self.call_if_defined("on_run_stop", ctx)
    }

    fn on_data(&mut self, batch: &Batch, ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        if !self.has_hook("on_data", 1) {
            return Ok(());
        }
        self.call_hook("on_data", (batch_to_dynamic(batch),), ctx)
    }

    fn on_tick(&mut self, ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        self.call_if_defined("on_tick", ctx)
    }

    fn on_peer_message(
        &mut self,
        from: &str,
        message: &str,
        ctx: &mut HandlerContext<'_>,
    ) -> anyhow::Result<()> {
        if !self.has_hook("on_peer_message", 2) {
            return Ok(());
        }
        self.call_hook(
            "on_peer_message",
            (from.to_string(), message.to_string()),
            ctx,
        )
    }
}

fn push(actions: &SharedActions, action: ScriptAction) {
    if let Ok(mut queued) = actions.lock() {
        queued.push(action);
    }
}

fn to_variable_value(
    name: &str,
    value: &Dynamic,
) -> std::result::Result<VariableValue, Box<EvalAltResult>> {
    if let Ok(v) = value.as_bool() {
        return Ok(VariableValue::Bool(v));
    }
    if let Ok(v) = value.as_int() {
        return Ok(VariableValue::Int(v));
    }
    if let Ok(v) = value.as_float() {
        return Ok(VariableValue::Float(v));
    }
    if value.is_string() {
        if let Ok(v) = value.clone().into_string() {
            return Ok(VariableValue::Text(v));
        }
    }
    Err(format!("cannot set {} to a value of type {}", name, value.type_name()).into())
}

fn record(fields: [(&str, Dynamic); 2]) -> Dynamic {
    let mut map = Map::new();
    for (key, value) in fields {
        map.insert(key.into(), value);
    }
    Dynamic::from_map(map)
}

/// Convert a batch into the map handed to `on_data`
fn batch_to_dynamic(batch: &Batch) -> Dynamic {
    let states: Array = batch
        .states
        .iter()
        .map(|s| {
            record([
                ("name", Dynamic::from(s.name.clone())),
                ("time", Dynamic::from(s.time as rhai::INT)),
            ])
        })
        .collect();
    let events: Array = batch
        .events
        .iter()
        .map(|e| {
            record([
                ("name", Dynamic::from(e.name.clone())),
                ("time", Dynamic::from(e.time as rhai::INT)),
            ])
        })
        .collect();
    let prints: Array = batch
        .prints
        .iter()
        .map(|p| {
            record([
                ("text", Dynamic::from(p.text.clone())),
                ("time", Dynamic::from(p.time as rhai::INT)),
            ])
        })
        .collect();
    let analog: Array = batch
        .analog
        .iter()
        .map(|a| {
            let mut map = Map::new();
            map.insert("channel".into(), Dynamic::from(a.channel.clone()));
            map.insert("time".into(), Dynamic::from(a.time as rhai::INT));
            map.insert("value".into(), Dynamic::from(a.value as rhai::FLOAT));
            Dynamic::from_map(map)
        })
        .collect();

    let mut map = Map::new();
    map.insert("states".into(), Dynamic::from_array(states));
    map.insert("events".into(), Dynamic::from_array(events));
    map.insert("prints".into(), Dynamic::from_array(prints));
    map.insert("analog".into(), Dynamic::from_array(analog));
    Dynamic::from_map(map)
}

/// Loads `<handlers_dir>/<task>.rhai`, falling back to a no-op handler
#[derive(Debug, Clone)]
pub struct ScriptHandlerFactory {
    handlers_dir: PathBuf,
}

impl ScriptHandlerFactory {
    pub fn new(handlers_dir: impl Into<PathBuf>) -> Self {
        Self {
            handlers_dir: handlers_dir.into(),
        }
    }

    /// Script path used for a task
    pub fn script_path(&self, task: &TaskDefinition) -> PathBuf {
        self.handlers_dir
            .join(format!("{}.{}", task.name, HANDLER_FILE_EXTENSION))
    }
}

impl HandlerFactory for ScriptHandlerFactory {
    fn create(&self, task: &TaskDefinition) -> Result<Box<dyn HandlerPlugin>> {
        let path = self.script_path(task);
        if !path.exists() {
            tracing::debug!("No handler script at {:?}, using no-op handler", path);
            return Ok(Box::new(NoopHandler));
        }
        tracing::info!("Loading handler script {:?}", path);
        Ok(Box::new(ScriptHandler::load(&path)?))
    }
}
