//! Functions the model may call, and how calls are executed.
//!
//! Only `executeCode` is registered. The default [`NodeExecutor`] runs the
//! code in a separate Node.js process with a cleared environment, a scratch
//! working directory and a hard timeout. Every failure, including a missing
//! `node` binary, comes back as an `{ "error": ... }` result rather than an
//! error for the caller.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::stream::FunctionCall;

pub const EXECUTE_CODE: &str = "executeCode";

/// Default execution time limit in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Marks the line carrying the outcome, so console output can't be
/// mistaken for it.
const RESULT_MARKER: &str = "__SANDCHAT_RESULT__";

/// Declaration sent to the API so the model knows it can call us.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub fn execute_code_definition() -> FunctionDefinition {
    FunctionDefinition {
        name: EXECUTE_CODE.to_string(),
        description: "Execute JavaScript code and return the result".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The JavaScript code to execute"
                }
            },
            "required": ["code"]
        }),
    }
}

pub fn available_functions() -> Vec<FunctionDefinition> {
    vec![execute_code_definition()]
}

/// Result of running a snippet.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Completed; `None` when the code returned nothing.
    Value(Option<Value>),
    /// Threw, failed to compile, or could not be run.
    Error(String),
}

impl ExecutionOutcome {
    /// The JSON text stored as the function message content.
    pub fn to_json(&self) -> String {
        let value = match self {
            ExecutionOutcome::Value(Some(v)) => json!({ "result": v }),
            ExecutionOutcome::Value(None) => json!({}),
            ExecutionOutcome::Error(message) => json!({ "error": message }),
        };
        value.to_string()
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, code: &str) -> ExecutionOutcome;
}

/// Route a completed call to its implementation and return the JSON text of
/// its result.
pub async fn dispatch(executor: &dyn Executor, call: &FunctionCall) -> String {
    if call.name != EXECUTE_CODE {
        warn!(function = %call.name, "model called an unknown function");
        return ExecutionOutcome::Error(format!("unknown function `{}`", call.name)).to_json();
    }

    let Some(code) = call.arguments.get("code").and_then(|v| v.as_str()) else {
        return ExecutionOutcome::Error("missing required string argument `code`".to_string())
            .to_json();
    };

    debug!(bytes = code.len(), "executing code");
    executor.execute(code).await.to_json()
}

/// Runs JavaScript with the `node` binary in a child process.
#[derive(Debug, Clone)]
pub struct NodeExecutor {
    binary: String,
    args: Vec<String>,
    timeout: Duration,
}

impl Default for NodeExecutor {
    fn default() -> Self {
        Self {
            binary: "node".to_string(),
            args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl NodeExecutor {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    /// Extra flags passed to node before the script, e.g. `--permission`.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, code: &str) -> Result<ExecutionOutcome, String> {
        let scratch = tempfile::TempDir::new().map_err(|e| format!("no scratch dir: {e}"))?;

        let mut command = Command::new(&self.binary);
        command.args(&self.args).arg("-").env_clear();
        // Keep PATH so a bare `node` still resolves
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }

        let mut child = command
            .current_dir(scratch.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to start {}: {e}", self.binary))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(wrap_script(code).as_bytes())
                .await
                .map_err(|e| format!("failed to send code: {e}"))?;
        }

        // On timeout the child is dropped here and killed via kill_on_drop
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                warn!(timeout_secs = self.timeout.as_secs(), "code execution timed out");
                format!("execution timed out after {}s", self.timeout.as_secs())
            })?
            .map_err(|e| format!("process error: {e}"))?;

        Ok(parse_output(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
            output.status.code(),
        ))
    }
}

#[async_trait]
impl Executor for NodeExecutor {
    async fn execute(&self, code: &str) -> ExecutionOutcome {
        self.run(code).await.unwrap_or_else(ExecutionOutcome::Error)
    }
}

/// Wrap user code as the body of an async function and report the outcome
/// on a marked line.
fn wrap_script(code: &str) -> String {
    let source = Value::String(code.to_string()).to_string();
    format!(
        r#"const source = {source};
(async () => {{
  try {{
    const run = new Function("return (async () => {{\n" + source + "\n}})();");
    const value = await run();
    return value === undefined ? {{}} : {{ result: value }};
  }} catch (error) {{
    return {{ error: error && error.message !== undefined ? String(error.message) : String(error) }};
  }}
}})().then((outcome) => {{
  let text;
  try {{
    text = JSON.stringify(outcome);
  }} catch (error) {{
    text = JSON.stringify({{ error: String(error && error.message) }});
  }}
  process.stdout.write("\n{marker}" + text + "\n", () => process.exit(0));
}});
"#,
        source = source,
        marker = RESULT_MARKER,
    )
}

fn parse_output(stdout: &str, stderr: &str, status: Option<i32>) -> ExecutionOutcome {
    let Some(line) = stdout
        .lines()
        .rev()
        .find_map(|l| l.strip_prefix(RESULT_MARKER))
    else {
        let detail = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string());
        return ExecutionOutcome::Error(match (detail, status) {
            (Some(d), _) => d,
            (None, Some(code)) => format!("process exited with status {code}"),
            (None, None) => "process terminated by signal".to_string(),
        });
    };

    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(mut map)) => {
            if let Some(err) = map.remove("error") {
                let message = match err {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                ExecutionOutcome::Error(message)
            } else {
                ExecutionOutcome::Value(map.remove("result"))
            }
        }
        Ok(other) => ExecutionOutcome::Error(format!("unexpected outcome: {other}")),
        Err(e) => ExecutionOutcome::Error(format!("unreadable outcome: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted {
        outcome: ExecutionOutcome,
        seen: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(outcome: ExecutionOutcome) -> Self {
            Self {
                outcome,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Executor for Scripted {
        async fn execute(&self, code: &str) -> ExecutionOutcome {
            self.seen.lock().unwrap().push(code.to_string());
            self.outcome.clone()
        }
    }

    fn call(name: &str, arguments: Value) -> FunctionCall {
        FunctionCall {
            name: name.to_string(),
            arguments,
        }
    }

    fn node_available() -> bool {
        std::process::Command::new("node")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_definition_shape() {
        let def = serde_json::to_value(execute_code_definition()).unwrap();
        assert_eq!(def["name"], "executeCode");
        assert_eq!(def["parameters"]["required"], json!(["code"]));
        assert_eq!(def["parameters"]["properties"]["code"]["type"], "string");
    }

    #[test]
    fn test_outcome_json() {
        assert_eq!(ExecutionOutcome::Value(Some(json!(2))).to_json(), r#"{"result":2}"#);
        assert_eq!(ExecutionOutcome::Value(None).to_json(), "{}");
        assert_eq!(
            ExecutionOutcome::Error("boom".to_string()).to_json(),
            r#"{"error":"boom"}"#
        );
    }

    #[tokio::test]
    async fn test_dispatch_passes_code_to_executor() {
        let exec = Scripted::new(ExecutionOutcome::Value(Some(json!(2))));
        let out = dispatch(&exec, &call(EXECUTE_CODE, json!({"code": "return 1+1"}))).await;
        assert_eq!(out, r#"{"result":2}"#);
        assert_eq!(exec.seen.lock().unwrap().as_slice(), ["return 1+1"]);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_function() {
        let exec = Scripted::new(ExecutionOutcome::Value(None));
        let out = dispatch(&exec, &call("deleteEverything", json!({}))).await;
        let v: Value = serde_json::from_str(&out).unwrap();
        assert!(v["error"].as_str().unwrap().contains("deleteEverything"));
        assert!(exec.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_missing_code_argument() {
        let exec = Scripted::new(ExecutionOutcome::Value(None));
        let out = dispatch(&exec, &call(EXECUTE_CODE, json!({"script": "1"}))).await;
        let v: Value = serde_json::from_str(&out).unwrap();
        assert!(v["error"].is_string());
    }

    #[test]
    fn test_script_embeds_code_as_string_literal() {
        let script = wrap_script("return \"a\";\n`${x}`");
        assert!(script.starts_with(r#"const source = "return \"a\";\n`${x}`";"#));
        assert!(script.contains(RESULT_MARKER));
    }

    #[test]
    fn test_parse_output_result_after_console_noise() {
        let stdout = format!("hello\n{}{{\"result\":[1,2]}}\n", RESULT_MARKER);
        assert_eq!(
            parse_output(&stdout, "", Some(0)),
            ExecutionOutcome::Value(Some(json!([1, 2])))
        );
    }

    #[test]
    fn test_parse_output_error() {
        let stdout = format!("{}{{\"error\":\"x is not defined\"}}", RESULT_MARKER);
        assert_eq!(
            parse_output(&stdout, "", Some(0)),
            ExecutionOutcome::Error("x is not defined".to_string())
        );
    }

    #[test]
    fn test_parse_output_undefined_result() {
        let stdout = format!("{}{{}}", RESULT_MARKER);
        assert_eq!(parse_output(&stdout, "", Some(0)), ExecutionOutcome::Value(None));
    }

    #[test]
    fn test_parse_output_without_marker_uses_stderr() {
        assert_eq!(
            parse_output("", "trace\nSyntaxError: bad\n\n", Some(1)),
            ExecutionOutcome::Error("SyntaxError: bad".to_string())
        );
        assert_eq!(
            parse_output("", "", Some(3)),
            ExecutionOutcome::Error("process exited with status 3".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error_result() {
        let exec = NodeExecutor::new("/nonexistent/sandchat-node");
        match exec.execute("return 1").await {
            ExecutionOutcome::Error(msg) => assert!(msg.contains("failed to start")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_node_returns_value() {
        if !node_available() {
            return;
        }
        let exec = NodeExecutor::default();
        assert_eq!(
            exec.execute("return 1 + 1;").await,
            ExecutionOutcome::Value(Some(json!(2)))
        );
    }

    #[tokio::test]
    async fn test_node_captures_thrown_error() {
        if !node_available() {
            return;
        }
        let exec = NodeExecutor::default();
        assert_eq!(
            exec.execute("throw new Error('boom');").await,
            ExecutionOutcome::Error("boom".to_string())
        );
    }

    #[tokio::test]
    async fn test_node_timeout() {
        if !node_available() {
            return;
        }
        let exec = NodeExecutor::default().with_timeout(Duration::from_millis(500));
        match exec.execute("while (true) {}").await {
            ExecutionOutcome::Error(msg) => assert!(msg.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
