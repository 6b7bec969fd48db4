//! Execution context shared between the bridge and its collaborators.
//!
//! The surrounding task-execution framework builds an [`ExecutionContext`]
//! before invoking the handler. From the bridge's perspective everything in
//! it is read-only except the result slot, which is written at most as a
//! side effect of exit-code interpretation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Final outcome of a task run. `None` in the context's result slot means
/// "not yet decided".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Succeeded,
    SucceededWithIssues,
    Failed,
    Canceled,
    Skipped,
}

/// Destination for the host's output, debug and error lines.
///
/// The framework owns rendering (localization, log queues); the bridge only
/// forwards lines. Implementations must be safe to call from concurrent
/// line pumps.
pub trait OutputSink: Send + Sync {
    fn output(&self, line: &str);
    fn debug(&self, line: &str);
    fn error(&self, line: &str);
}

/// Classifier for embedded commands carried on output lines.
///
/// Returns `true` when the line was recognized and consumed (it must not be
/// forwarded to the sink). The classifier is responsible for its own thread
/// safety; it may set the context result as a command side effect.
pub trait CommandClassifier: Send + Sync {
    fn try_process(&self, context: &ExecutionContext, line: &str) -> bool;
}

/// Authorization material attached to an endpoint, JSON-encoded on the wire.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct EndpointAuthorization {
    pub scheme: String,
    pub parameters: BTreeMap<String, String>,
}

/// A named, typed external connection descriptor available to a running task.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// `None` (or nil) means the endpoint is identified through its data map.
    pub id: Option<Uuid>,
    pub name: String,
    pub type_name: String,
    pub url: String,
    pub authorization: EndpointAuthorization,
    pub data: BTreeMap<String, String>,
}

/// Task variables, split into the public set and the private (secret) set.
///
/// Private values must never be logged in the clear; the protocol encoder
/// logs key names only.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    pub public: BTreeMap<String, String>,
    pub private: BTreeMap<String, String>,
}

impl Variables {
    /// Union of both sets. A name present in both resolves to the private
    /// value, matching the precedence of secret overrides.
    pub fn combined(&self) -> BTreeMap<String, String> {
        let mut all = self.public.clone();
        all.extend(self.private.clone());
        all
    }
}

/// Per-run execution state handed to the bridge by the framework.
pub struct ExecutionContext {
    /// Cooperative cancellation signal for the whole run.
    pub cancel: CancellationToken,
    /// Whether debug tracing is enabled for this run (drives OUTPUTPREFER).
    pub write_debug: bool,
    pub endpoints: Vec<Endpoint>,
    pub variables: Variables,
    sink: Arc<dyn OutputSink>,
    result: Mutex<Option<TaskResult>>,
}

impl ExecutionContext {
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            write_debug: false,
            endpoints: Vec::new(),
            variables: Variables::default(),
            sink,
            result: Mutex::new(None),
        }
    }

    /// Current task result, `None` while undecided.
    pub fn result(&self) -> Option<TaskResult> {
        *self
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_result(&self, result: TaskResult) {
        *self
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(result);
    }

    pub fn output(&self, line: &str) {
        self.sink.output(line);
    }

    pub fn debug(&self, line: &str) {
        self.sink.debug(line);
    }

    pub fn error(&self, line: &str) {
        self.sink.error(line);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Sink that records every line for assertions.
    #[derive(Default)]
    pub struct MemorySink {
        pub output: Mutex<Vec<String>>,
        pub debug: Mutex<Vec<String>>,
        pub errors: Mutex<Vec<String>>,
    }

    impl MemorySink {
        pub fn output_lines(&self) -> Vec<String> {
            self.output.lock().unwrap().clone()
        }

        pub fn debug_lines(&self) -> Vec<String> {
            self.debug.lock().unwrap().clone()
        }

        pub fn error_lines(&self) -> Vec<String> {
            self.errors.lock().unwrap().clone()
        }
    }

    impl OutputSink for MemorySink {
        fn output(&self, line: &str) {
            self.output.lock().unwrap().push(line.to_string());
        }

        fn debug(&self, line: &str) {
            self.debug.lock().unwrap().push(line.to_string());
        }

        fn error(&self, line: &str) {
            self.errors.lock().unwrap().push(line.to_string());
        }
    }

    /// Classifier that recognizes nothing.
    pub struct NullClassifier;

    impl CommandClassifier for NullClassifier {
        fn try_process(&self, _context: &ExecutionContext, _line: &str) -> bool {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemorySink;
    use super::*;

    #[test]
    fn test_result_starts_undecided() {
        let context = ExecutionContext::new(Arc::new(MemorySink::default()));
        assert_eq!(context.result(), None);
    }

    #[test]
    fn test_set_result() {
        let context = ExecutionContext::new(Arc::new(MemorySink::default()));
        context.set_result(TaskResult::Succeeded);
        assert_eq!(context.result(), Some(TaskResult::Succeeded));
        context.set_result(TaskResult::Failed);
        assert_eq!(context.result(), Some(TaskResult::Failed));
    }

    #[test]
    fn test_combined_prefers_private_value() {
        let mut variables = Variables::default();
        variables
            .public
            .insert("shared".to_string(), "public".to_string());
        variables
            .private
            .insert("shared".to_string(), "secret".to_string());
        variables
            .public
            .insert("only_public".to_string(), "a".to_string());

        let all = variables.combined();
        assert_eq!(all.get("shared").map(String::as_str), Some("secret"));
        assert_eq!(all.get("only_public").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_sink_forwarding() {
        let sink = Arc::new(MemorySink::default());
        let context = ExecutionContext::new(sink.clone());
        context.output("out");
        context.debug("dbg");
        context.error("err");
        assert_eq!(sink.output_lines(), vec!["out"]);
        assert_eq!(sink.debug_lines(), vec!["dbg"]);
        assert_eq!(sink.error_lines(), vec!["err"]);
    }
}
