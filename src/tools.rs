//! # Tool System
//!
//! Tools are the capabilities the model can invoke: named, schema-described
//! operations that produce a lazy sequence of yields. The executor consults
//! each tool's capability predicates to decide scheduling, validates input
//! against the tool's schema before invocation, and forwards yields to the
//! query loop as they arrive.
//!
//! ## Tool lifecycle
//!
//! ```text
//! 1. Definition:   build a tool with name, description, schema, handler
//! 2. Registration: add it to a ToolRegistry
//! 3. Invocation:   the model emits tool_use{name, input}
//! 4. Validation:   schema check, then the optional semantic validator
//! 5. Execution:    the handler yields progress / streaming output / result
//! 6. Response:     the final result becomes a tool_result block
//! ```
//!
//! ## Yields
//!
//! A tool's `call` returns a pull stream of [`ToolYield`]s. `Progress` and
//! `StreamingOutput` may occur any number of times; at most one `Result`
//! terminates the sequence. The executor keeps draining the stream after the
//! `Result` so deferred cleanup inside the tool completes.
//!
//! ## Capability predicates
//!
//! - [`Tool::is_read_only`]: the tool does not mutate observable state.
//! - [`Tool::is_concurrency_safe`]: the tool may run alongside others.
//!
//! Both must hold for a tool to join a concurrent safe run; a tool failing
//! either predicate executes as a barrier. A tool may additionally gate on
//! user assent via `needs_permissions`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use panpan::tools::{tool, ToolYield};
//! use serde_json::json;
//!
//! let echo = tool("Echo", "Echo the input back")
//!     .param("text", "string")
//!     .read_only(true)
//!     .concurrency_safe(true)
//!     .build_result(|input, _ctx| async move {
//!         let text = input["text"].as_str().unwrap_or_default().to_string();
//!         Ok((json!({ "text": text }), text))
//!     });
//! ```

use crate::Result;
use crate::cancel::CancelHandle;
use crate::provider::LlmHandle;
use futures::stream::Stream;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Which output stream a [`ToolYield::StreamingOutput`] line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One yield from a tool's `call` sequence.
#[derive(Debug, Clone)]
pub enum ToolYield {
    /// A human-visible progress note ("compiling...", "3 of 7 files").
    Progress { content: String },

    /// One line of live subprocess output.
    StreamingOutput { stream: OutputStream, line: String },

    /// The terminal yield: structured data plus the string rendered into
    /// the tool_result sent to the model.
    Result {
        data: Value,
        result_for_assistant: String,
    },
}

/// Lazy pull sequence of yields produced by one tool call.
pub type ToolYieldStream = Pin<Box<dyn Stream<Item = Result<ToolYield>> + Send>>;

/// Handler invoked when the model calls the tool.
///
/// `Arc` so registries and dispatch batches share one handler; the returned
/// stream is pinned and boxed for dynamic dispatch across differing
/// handler types, and `Send` so the executor can drive it from any worker.
pub type ToolHandler = Arc<dyn Fn(Value, ToolContext) -> ToolYieldStream + Send + Sync>;

/// Optional semantic validator, run after the structural schema check.
/// Must not perform observable side effects.
pub type ToolValidator =
    Arc<dyn Fn(&Value, &ToolContext) -> std::result::Result<(), String> + Send + Sync>;

/// Optional per-input permission predicate. When it returns true the
/// executor must obtain user assent before invoking the tool.
pub type PermissionPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Timestamps of files read during the current batch, shared across the
/// tools of a batch. Write tools consult it to reject writes to files the
/// model never read.
pub type ReadTimestamps = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

/// Execution context threaded into every tool call.
#[derive(Clone)]
pub struct ToolContext {
    /// Working directory tools resolve relative paths against.
    pub cwd: PathBuf,

    /// Cancellation handle for the current REPL turn. Tools poll it at
    /// natural suspension points.
    pub cancel: CancelHandle,

    /// Shared file-read-timestamp map (see [`ReadTimestamps`]).
    pub read_timestamps: ReadTimestamps,

    /// Provider/model handle inherited from the enclosing loop. Used by
    /// the Task tool to run nested conversations.
    pub llm: Option<Arc<LlmHandle>>,
}

impl ToolContext {
    /// Creates a context rooted at `cwd` with a fresh cancel handle.
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            cancel: CancelHandle::new(),
            read_timestamps: Arc::new(Mutex::new(HashMap::new())),
            llm: None,
        }
    }

    /// Replaces the cancellation handle.
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attaches the LLM handle used by nested (Task) conversations.
    pub fn with_llm(mut self, llm: Arc<LlmHandle>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Records that `path` was read now. Read tools call this so write
    /// tools can verify read-before-write.
    pub fn record_read(&self, path: impl Into<PathBuf>) {
        if let Ok(mut map) = self.read_timestamps.lock() {
            map.insert(path.into(), SystemTime::now());
        }
    }

    /// The recorded read timestamp for `path`, if any.
    pub fn read_timestamp(&self, path: &Path) -> Option<SystemTime> {
        self.read_timestamps
            .lock()
            .ok()
            .and_then(|map| map.get(path).copied())
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("cwd", &self.cwd)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

// ============================================================================
// SCHEMA HANDLING
// ============================================================================

/// Normalizes a schema into full JSON Schema form.
///
/// Accepts three shapes, in the order they are checked:
///
/// 1. **Full JSON Schema**: has `"type": "object"` and `"properties"`;
///    passed through unchanged.
/// 2. **Simple notation**: `{"path": "string", "limit": "integer"}`;
///    every parameter becomes a required property of that type.
/// 3. **Extended notation**: `{"path": {"type": "string", "optional":
///    true}}`; `"optional": true` (or `"required": false`) keeps the
///    parameter out of the `required` list.
fn normalize_schema(schema: Value) -> Value {
    let Value::Object(map) = &schema else {
        return json!({ "type": "object", "properties": {} });
    };

    // Already full JSON Schema.
    if map.get("type").and_then(Value::as_str) == Some("object") && map.contains_key("properties") {
        return schema;
    }

    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();

    for (name, spec) in map {
        match spec {
            Value::String(ty) => {
                properties.insert(name.clone(), json!({ "type": ty }));
                required.push(Value::String(name.clone()));
            }
            Value::Object(obj) => {
                let optional = obj.get("optional").and_then(Value::as_bool).unwrap_or(false)
                    || obj.get("required").and_then(Value::as_bool) == Some(false);
                let mut prop = obj.clone();
                prop.remove("optional");
                prop.remove("required");
                properties.insert(name.clone(), Value::Object(prop));
                if !optional {
                    required.push(Value::String(name.clone()));
                }
            }
            other => {
                properties.insert(name.clone(), other.clone());
                required.push(Value::String(name.clone()));
            }
        }
    }

    json!({
        "type": "object",
        "properties": Value::Object(properties),
        "required": Value::Array(required),
    })
}

/// Structural validation of `input` against a (normalized) schema.
///
/// Checks the subset of JSON Schema the tool system emits: the top-level
/// object shape, `required` membership, and per-property `type`. Unknown
/// properties are allowed; the model routinely sends more than the schema
/// names and tools ignore what they don't use.
pub fn validate_against_schema(schema: &Value, input: &Value) -> std::result::Result<(), String> {
    let Value::Object(input_map) = input else {
        return Err(format!("input must be a JSON object, got {}", type_name(input)));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !input_map.contains_key(name) {
                return Err(format!("missing required parameter '{}'", name));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, prop) in properties {
            let Some(value) = input_map.get(name) else {
                continue;
            };
            let Some(expected) = prop.get("type").and_then(Value::as_str) else {
                continue;
            };
            if !type_matches(expected, value) {
                return Err(format!(
                    "parameter '{}' must be {}, got {}",
                    name,
                    expected,
                    type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        // Unknown type keyword: don't reject what we can't check.
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// TOOL
// ============================================================================

/// Schema surface serialized to the provider as the tool's parameter spec.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// An immutable tool descriptor.
///
/// Metadata and handler never change after construction, so a registry
/// can hand out `Arc<Tool>` clones to concurrent batches without locks.
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    input_schema: Value,
    read_only: bool,
    concurrency_safe: bool,
    needs_permissions: Option<PermissionPredicate>,
    validator: Option<ToolValidator>,
    handler: ToolHandler,
}

impl Tool {
    /// Creates a tool from parts. The schema is normalized (see
    /// [`normalize_schema`]) and the tool defaults to the conservative
    /// capability profile: not read-only, not concurrency-safe.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: ToolHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: normalize_schema(input_schema),
            read_only: false,
            concurrency_safe: false,
            needs_permissions: None,
            validator: None,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// Whether the tool mutates no observable state.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the tool may run alongside other tools.
    pub fn is_concurrency_safe(&self) -> bool {
        self.concurrency_safe
    }

    /// Whether this input requires user assent before invocation.
    pub fn needs_permissions(&self, input: &Value) -> bool {
        match &self.needs_permissions {
            Some(predicate) => predicate(input),
            None => false,
        }
    }

    /// Structural then semantic input validation. Side-effect free.
    pub fn validate_input(
        &self,
        input: &Value,
        ctx: &ToolContext,
    ) -> std::result::Result<(), String> {
        validate_against_schema(&self.input_schema, input)?;
        if let Some(validator) = &self.validator {
            validator(input, ctx)?;
        }
        Ok(())
    }

    /// Invokes the tool, producing its yield sequence.
    pub fn call(&self, input: Value, ctx: ToolContext) -> ToolYieldStream {
        (self.handler)(input, ctx)
    }

    /// The schema surface sent to the provider.
    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .field("concurrency_safe", &self.concurrency_safe)
            .finish()
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Starts building a tool. See the module docs for an example.
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder {
        name: name.into(),
        description: description.into(),
        params: serde_json::Map::new(),
        read_only: false,
        concurrency_safe: false,
        needs_permissions: None,
        validator: None,
    }
}

/// Builder for [`Tool`] using the simple parameter notation.
pub struct ToolBuilder {
    name: String,
    description: String,
    params: serde_json::Map<String, Value>,
    read_only: bool,
    concurrency_safe: bool,
    needs_permissions: Option<PermissionPredicate>,
    validator: Option<ToolValidator>,
}

impl ToolBuilder {
    /// Adds a required parameter with a simple type ("string", "number",
    /// "integer", "boolean", "array", "object").
    pub fn param(mut self, name: impl Into<String>, ty: impl Into<String>) -> Self {
        self.params.insert(name.into(), Value::String(ty.into()));
        self
    }

    /// Adds an optional parameter with a simple type.
    pub fn optional_param(mut self, name: impl Into<String>, ty: impl Into<String>) -> Self {
        let ty: String = ty.into();
        self.params
            .insert(name.into(), json!({ "type": ty, "optional": true }));
        self
    }

    /// Marks the tool read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Marks the tool concurrency-safe.
    pub fn concurrency_safe(mut self, safe: bool) -> Self {
        self.concurrency_safe = safe;
        self
    }

    /// Gates invocation on user assent when the predicate returns true.
    pub fn needs_permissions<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.needs_permissions = Some(Arc::new(predicate));
        self
    }

    /// Installs a semantic validator run after the schema check.
    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value, &ToolContext) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Finishes the tool with a streaming handler.
    pub fn build<F>(self, handler: F) -> Tool
    where
        F: Fn(Value, ToolContext) -> ToolYieldStream + Send + Sync + 'static,
    {
        Tool {
            name: self.name,
            description: self.description,
            input_schema: normalize_schema(Value::Object(self.params)),
            read_only: self.read_only,
            concurrency_safe: self.concurrency_safe,
            needs_permissions: self.needs_permissions,
            validator: self.validator,
            handler: Arc::new(handler),
        }
    }

    /// Finishes the tool with a handler that produces a single result:
    /// `(data, result_for_assistant)`. The handler future is wrapped into
    /// a one-yield sequence.
    pub fn build_result<F, Fut>(self, handler: F) -> Tool
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(Value, String)>> + Send + 'static,
    {
        self.build(move |input, ctx| {
            let fut = handler(input, ctx);
            Box::pin(futures::stream::once(async move {
                let (data, result_for_assistant) = fut.await?;
                Ok(ToolYield::Result {
                    data,
                    result_for_assistant,
                })
            }))
        })
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Registry mapping tool names to descriptors, in registration order.
///
/// Populated at startup; the executor looks tools up lazily by the string
/// name the model emitted. Registration order is preserved so the schema
/// list sent to the provider is deterministic.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a list of tools.
    pub fn from_tools(tools: impl IntoIterator<Item = Tool>) -> Self {
        Self {
            tools: tools.into_iter().map(Arc::new).collect(),
        }
    }

    /// Registers a tool. A tool with a duplicate name replaces the
    /// earlier registration.
    pub fn register(&mut self, tool: Tool) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(Arc::new(tool));
    }

    /// Looks a tool up by name.
    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    /// Registered tool names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// Schema surfaces for the provider, in registration order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema()).collect()
    }

    /// Iterates the registered tools.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Tool>> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// A new registry keeping only the named tools, preserving order.
    pub fn retain_named(&self, keep: &[String]) -> ToolRegistry {
        ToolRegistry {
            tools: self
                .tools
                .iter()
                .filter(|t| keep.iter().any(|name| name == t.name()))
                .cloned()
                .collect(),
        }
    }

    /// A new registry without the named tools, preserving order.
    pub fn without_named(&self, drop: &[&str]) -> ToolRegistry {
        ToolRegistry {
            tools: self
                .tools
                .iter()
                .filter(|t| !drop.contains(&t.name()))
                .cloned()
                .collect(),
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
