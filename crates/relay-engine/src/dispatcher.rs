use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use relay_core::agent::ToolCallRequest;
use relay_core::context::ExecutionContext;
use relay_core::tools::{Tool, ToolContext, ToolError, ToolExecutionResult};
use relay_telemetry::MetricsRecorder;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-run tool dispatcher. Created from one run's context plus a catalog of
/// capabilities, used only by that run's drive task, and released when the
/// run finalizes.
///
/// Dispatch-level failures (unknown tool, missing permission, bad
/// parameters) surface as typed errors; capability failures, timeouts and
/// panics are folded into a failed `ToolExecutionResult` so the run can
/// degrade gracefully instead of aborting.
pub struct ScopedDispatcher {
    context: Arc<ExecutionContext>,
    tools: HashMap<String, Arc<dyn Tool>>,
    tool_timeout: Duration,
    cancel: CancellationToken,
    metrics: Option<Arc<MetricsRecorder>>,
    released: AtomicBool,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl ScopedDispatcher {
    pub fn create_scoped(context: Arc<ExecutionContext>, catalog: &[Arc<dyn Tool>]) -> Self {
        let tools = catalog
            .iter()
            .map(|t| (t.name().to_string(), Arc::clone(t)))
            .collect();
        Self {
            context,
            tools,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            cancel: CancellationToken::new(),
            metrics: None,
            released: AtomicBool::new(false),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn success_count(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Invoke one tool on behalf of the owning run. Produces exactly one
    /// result per invocation.
    pub async fn execute_tool(
        &self,
        request: &ToolCallRequest,
    ) -> Result<ToolExecutionResult, ToolError> {
        if self.is_released() {
            return Err(ToolError::Released);
        }

        let Some(tool) = self.tools.get(&request.name) else {
            return Err(self.record_rejection(&request.name, ToolError::NotFound(request.name.clone())));
        };

        for permission in tool.required_permissions() {
            if !self.context.has_permission(&permission) {
                return Err(self.record_rejection(
                    &request.name,
                    ToolError::PermissionDenied {
                        tool: request.name.clone(),
                        missing: permission,
                    },
                ));
            }
        }

        if let Err(e) = self.check_required_parameters(tool.as_ref(), &request.parameters) {
            return Err(self.record_rejection(&request.name, e));
        }

        if self.cancel.is_cancelled() {
            return Ok(self.record(ToolExecutionResult::err(
                &self.context.user_id,
                "cancelled before execution",
                Duration::ZERO,
            ), &request.name));
        }

        let tool_ctx = ToolContext {
            user_id: self.context.user_id.clone(),
            run_id: self.context.run_id.clone(),
            agent_context: self.context.agent_context.clone(),
            abort_signal: self.cancel.clone(),
        };

        let start = Instant::now();
        let outcome = tokio::time::timeout(
            self.tool_timeout,
            std::panic::AssertUnwindSafe(tool.execute(request.parameters.clone(), &tool_ctx))
                .catch_unwind(),
        )
        .await;
        let duration = start.elapsed();

        let result = match outcome {
            Ok(Ok(Ok(value))) => {
                ToolExecutionResult::ok(&self.context.user_id, value, duration)
            }
            Ok(Ok(Err(e))) => {
                debug!(tool = %request.name, error = %e, "tool reported failure");
                ToolExecutionResult::err(&self.context.user_id, e.to_string(), duration)
            }
            Ok(Err(panic)) => {
                error!(
                    tool = %request.name,
                    user_id = %self.context.user_id,
                    run_id = %self.context.run_id,
                    panic = %panic_message(&panic),
                    "tool panicked during execution"
                );
                ToolExecutionResult::err(
                    &self.context.user_id,
                    "internal error: tool crashed",
                    duration,
                )
            }
            Err(_) => {
                warn!(
                    tool = %request.name,
                    timeout_secs = self.tool_timeout.as_secs(),
                    "tool timed out"
                );
                ToolExecutionResult::err(
                    &self.context.user_id,
                    format!("tool timed out after {}s", self.tool_timeout.as_secs()),
                    duration,
                )
            }
        };

        Ok(self.record(result, &request.name))
    }

    /// Enforce the top-level `required` list of the tool's parameter schema.
    fn check_required_parameters(
        &self,
        tool: &dyn Tool,
        parameters: &serde_json::Value,
    ) -> Result<(), ToolError> {
        let schema = tool.parameters_schema();
        let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
            return Ok(());
        };

        for name in required.iter().filter_map(|v| v.as_str()) {
            let present = parameters.get(name).map(|v| !v.is_null()).unwrap_or(false);
            if !present {
                return Err(ToolError::InvalidParameters(format!(
                    "missing required parameter: {name}"
                )));
            }
        }
        Ok(())
    }

    /// Dispatch-level rejections never produce a `ToolExecutionResult`, but
    /// the caller still surfaces them as `tool_error` events, so they count
    /// as failures and export under their own outcome label.
    fn record_rejection(&self, tool_name: &str, err: ToolError) -> ToolError {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(
                "tool.invocations",
                &[("tool", tool_name), ("outcome", "rejected")],
                1,
            );
        }
        err
    }

    fn record(&self, result: ToolExecutionResult, tool_name: &str) -> ToolExecutionResult {
        let outcome = if result.success {
            self.successes.fetch_add(1, Ordering::Relaxed);
            "success"
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            "failure"
        };
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(
                "tool.invocations",
                &[("tool", tool_name), ("outcome", outcome)],
                1,
            );
            metrics.histogram_observe(
                "tool.duration_ms",
                &[("tool", tool_name)],
                result.duration.as_millis() as f64,
            );
        }
        result
    }

    /// Release the scope. Idempotent; after release every dispatch returns
    /// `ToolError::Released`.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            debug!(
                user_id = %self.context.user_id,
                run_id = %self.context.run_id,
                successes = self.success_count(),
                failures = self.failure_count(),
                "dispatcher scope released"
            );
        }
    }
}

impl Drop for ScopedDispatcher {
    // Backstop for aborted drive tasks: the scope is released on every exit
    // path even when nobody called release().
    fn drop(&mut self) {
        self.release();
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
