use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use relay_core::agent::{Agent, AgentStep, TurnState};
use relay_core::context::ExecutionContext;
use relay_core::errors::ModelError;
use relay_core::events::RunEvent;
use relay_core::ids::{RunId, UserId};
use relay_core::tools::{Tool, ToolExecutionResult};
use relay_telemetry::MetricsRecorder;

use crate::alerts::{Alert, AlertSink, FailureRateMonitor, LogAlertSink};
use crate::dispatcher::ScopedDispatcher;
use crate::error::EngineError;
use crate::registry::{AgentRegistry, Session};
use crate::tracker::ExecutionTracker;

const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(45);
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine tuning knobs. Constructed in main and injected; no globals.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Hard ceiling per run. The drive task is aborted when it elapses.
    pub run_timeout: Duration,
    /// Per-tool-invocation timeout inside the dispatcher.
    pub tool_timeout: Duration,
    /// Agent steps allowed before the run fails with `max_steps`.
    pub max_steps: u32,
    /// Retry budget for retryable model errors within one step.
    pub model_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Soft latency target. Finishing 50% over it raises a SlowRun alert and
    /// nothing else.
    pub soft_duration_target: Duration,
    pub failure_rate_window: usize,
    pub failure_rate_threshold: f64,
    /// Capacity of each user's event channel.
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_timeout: DEFAULT_RUN_TIMEOUT,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            max_steps: 50,
            model_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
            soft_duration_target: Duration::from_secs(10),
            failure_rate_window: 20,
            failure_rate_threshold: 0.5,
            channel_capacity: 256,
        }
    }
}

/// Drives agent runs: one supervised task per run, ordered per-user event
/// delivery, cooperative cancellation, and a hard abort at the run ceiling.
pub struct ExecutionEngine {
    config: EngineConfig,
    tracker: Arc<ExecutionTracker>,
    registry: Arc<AgentRegistry>,
    tools: Vec<Arc<dyn Tool>>,
    metrics: Arc<MetricsRecorder>,
    alerts: Arc<dyn AlertSink>,
    failure_monitor: FailureRateMonitor,
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        tracker: Arc<ExecutionTracker>,
        registry: Arc<AgentRegistry>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Self {
        let failure_monitor =
            FailureRateMonitor::new(config.failure_rate_window, config.failure_rate_threshold);
        Self {
            config,
            tracker,
            registry,
            tools,
            metrics: Arc::new(MetricsRecorder::new()),
            alerts: Arc::new(LogAlertSink),
            failure_monitor,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Start a run. Validates and registers synchronously; the returned
    /// run_id is already queryable in the tracker when this returns. The run
    /// itself proceeds on a supervised background task.
    pub fn start_run(
        self: &Arc<Self>,
        context: ExecutionContext,
        agent_name: impl Into<String>,
        input: serde_json::Value,
    ) -> Result<RunId, EngineError> {
        context.validate()?;
        self.tracker.register(&context.user_id, &context.run_id)?;

        let session = self.registry.get_or_create_session(&context.user_id);
        let cancel = session.begin_run(&context.run_id);
        self.registry.note_run_started();

        let run_id = context.run_id.clone();
        let engine = Arc::clone(self);
        let agent_name = agent_name.into();
        tokio::spawn(async move {
            engine
                .supervise(Arc::new(context), agent_name, input, cancel, session)
                .await;
        });

        Ok(run_id)
    }

    /// Request cooperative cancellation. Returns false for unknown or
    /// already-finished runs.
    pub fn cancel_run(&self, user_id: &UserId, run_id: &RunId) -> bool {
        match self.registry.get_session(user_id) {
            Some(session) => session.cancel_run(run_id),
            None => false,
        }
    }

    /// Race the drive task against the run ceiling, then finalize exactly
    /// once and release every per-run resource.
    #[instrument(skip_all, fields(user_id = %ctx.user_id, run_id = %ctx.run_id, agent = %agent_name))]
    async fn supervise(
        &self,
        ctx: Arc<ExecutionContext>,
        agent_name: String,
        input: serde_json::Value,
        cancel: CancellationToken,
        session: Arc<Session>,
    ) {
        let started = Instant::now();
        let dispatcher = Arc::new(
            ScopedDispatcher::create_scoped(Arc::clone(&ctx), &self.tools)
                .with_timeout(self.config.tool_timeout)
                .with_cancellation(cancel.clone())
                .with_metrics(Arc::clone(&self.metrics)),
        );

        let mut drive = {
            let engine = RunDriver {
                config: self.config.clone(),
                tracker: Arc::clone(&self.tracker),
                registry: Arc::clone(&self.registry),
                dispatcher: Arc::clone(&dispatcher),
                session: Arc::clone(&session),
                ctx: Arc::clone(&ctx),
            };
            let agent_name = agent_name.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.drive(agent_name, input, cancel).await })
        };

        let outcome = tokio::select! {
            joined = &mut drive => match joined {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    error!("run task panicked");
                    Err(EngineError::Internal("run task panicked".into()))
                }
                Err(_) => Err(EngineError::Cancelled),
            },
            _ = tokio::time::sleep(self.config.run_timeout) => {
                warn!(ceiling_secs = self.config.run_timeout.as_secs(), "run hit hard ceiling, aborting");
                cancel.cancel();
                drive.abort();
                let _ = drive.await;
                Err(EngineError::Timeout(self.config.run_timeout))
            }
        };

        let duration = started.elapsed();
        let terminal = self.finalize(&ctx, outcome, duration);

        // Release order: scope, run slot, counters, then the terminal event.
        dispatcher.release();
        session.end_run(&ctx.run_id);
        self.registry.note_run_finished();
        self.record_run(&ctx, &terminal, duration);

        if let Some(event) = terminal {
            emit_to_session(&session, event).await;
        }
    }

    /// Compare-and-set finalization. A lost race means someone else already
    /// finalized; log it and emit nothing.
    fn finalize(
        &self,
        ctx: &ExecutionContext,
        outcome: Result<serde_json::Value, EngineError>,
        duration: Duration,
    ) -> Option<RunEvent> {
        match outcome {
            Ok(result) => match self
                .tracker
                .complete(&ctx.user_id, &ctx.run_id, result.clone())
            {
                Ok(_) => {
                    info!(duration_ms = duration.as_millis() as u64, "run completed");
                    Some(RunEvent::agent_completed(ctx, result))
                }
                Err(e) => {
                    warn!(error = %e, "finalization race lost, run already terminal");
                    None
                }
            },
            Err(err) => {
                let reason = err.failure_reason();
                match self.tracker.fail(&ctx.user_id, &ctx.run_id, reason) {
                    Ok(_) => {
                        info!(reason = reason, duration_ms = duration.as_millis() as u64, "run failed");
                        Some(RunEvent::agent_failed(ctx, reason.to_string()))
                    }
                    Err(e) => {
                        warn!(error = %e, "finalization race lost, run already terminal");
                        None
                    }
                }
            }
        }
    }

    fn record_run(&self, ctx: &ExecutionContext, terminal: &Option<RunEvent>, duration: Duration) {
        let failed = matches!(terminal, Some(RunEvent::AgentFailed { .. }));
        let outcome = if failed { "failed" } else { "completed" };
        self.metrics
            .counter_inc("runs.total", &[("outcome", outcome)], 1);
        self.metrics
            .histogram_observe("run.duration_ms", &[], duration.as_millis() as f64);

        if let Some(RunEvent::AgentFailed { reason, .. }) = terminal {
            self.alerts.notify(&Alert::RunFailed {
                user_id: ctx.user_id.clone(),
                run_id: ctx.run_id.clone(),
                reason: reason.clone(),
            });
        }

        // Soft target: 50% over is an alert, never an error.
        let slow_cutoff = self.config.soft_duration_target + self.config.soft_duration_target / 2;
        if !failed && duration > slow_cutoff {
            self.alerts.notify(&Alert::SlowRun {
                user_id: ctx.user_id.clone(),
                run_id: ctx.run_id.clone(),
                duration,
                target: self.config.soft_duration_target,
            });
        }

        if let Some(ratio) = self.failure_monitor.record(failed) {
            self.alerts.notify(&Alert::FailureRateElevated {
                window: self.failure_monitor.window(),
                failure_ratio: ratio,
            });
        }
    }
}

/// The per-run drive task's captured state. Lives on the spawned task so the
/// supervisor can abort it wholesale at the run ceiling.
struct RunDriver {
    config: EngineConfig,
    tracker: Arc<ExecutionTracker>,
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<ScopedDispatcher>,
    session: Arc<Session>,
    ctx: Arc<ExecutionContext>,
}

impl RunDriver {
    #[instrument(skip_all, fields(user_id = %self.ctx.user_id, run_id = %self.ctx.run_id))]
    async fn drive(
        &self,
        agent_name: String,
        input: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, EngineError> {
        self.tracker.mark_running(&self.ctx.user_id, &self.ctx.run_id)?;
        self.emit(RunEvent::agent_started(&self.ctx, &agent_name)).await;

        let agent = self
            .session
            .resolve_agent(&agent_name, self.registry.factories())
            .ok_or(EngineError::AgentNotFound(agent_name))?;

        let mut turn = TurnState::new(input);
        let mut thinking_seq = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if turn.steps_taken >= self.config.max_steps {
                return Err(EngineError::MaxStepsExceeded(self.config.max_steps));
            }

            let step = self.next_step_with_retries(agent.as_ref(), &turn, &cancel).await?;
            turn.steps_taken += 1;

            match step {
                AgentStep::Thinking { fragment } => {
                    self.emit(RunEvent::agent_thinking(&self.ctx, thinking_seq, fragment))
                        .await;
                    thinking_seq += 1;
                }
                AgentStep::ToolCall { request } => {
                    if cancel.is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    self.emit(RunEvent::tool_executing(&self.ctx, &request.id, &request.name))
                        .await;

                    // Tool failure is never fatal: the observation goes back
                    // to the agent, which decides how to proceed.
                    let observation = match self.dispatcher.execute_tool(&request).await {
                        Ok(result) => {
                            if result.success {
                                self.emit(RunEvent::tool_completed(
                                    &self.ctx,
                                    &request.id,
                                    &request.name,
                                    result.duration.as_millis() as u64,
                                ))
                                .await;
                            } else {
                                let error = result
                                    .error_message
                                    .clone()
                                    .unwrap_or_else(|| "tool failed".into());
                                self.emit(RunEvent::tool_error(
                                    &self.ctx,
                                    &request.id,
                                    &request.name,
                                    error,
                                ))
                                .await;
                            }
                            result
                        }
                        Err(dispatch_err) => {
                            debug!(tool = %request.name, error = %dispatch_err, "dispatch rejected");
                            self.emit(RunEvent::tool_error(
                                &self.ctx,
                                &request.id,
                                &request.name,
                                dispatch_err.to_string(),
                            ))
                            .await;
                            ToolExecutionResult::err(
                                &self.ctx.user_id,
                                dispatch_err.to_string(),
                                Duration::ZERO,
                            )
                        }
                    };
                    turn.observations.push(observation);
                }
                AgentStep::Complete { result } => return Ok(result),
            }
        }
    }

    /// One agent step with bounded retries on retryable model errors.
    /// Backoff sleeps are cancellation-aware.
    async fn next_step_with_retries(
        &self,
        agent: &dyn Agent,
        turn: &TurnState,
        cancel: &CancellationToken,
    ) -> Result<AgentStep, EngineError> {
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                step = agent.next_step(turn) => step,
            };

            let err = match result {
                Ok(step) => return Ok(step),
                Err(ModelError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => e,
            };

            attempt += 1;
            if !err.is_retryable() || attempt > self.config.model_retries {
                return Err(EngineError::ModelCall {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = err
                .suggested_delay()
                .unwrap_or_else(|| self.backoff_delay(attempt));
            warn!(
                attempt = attempt,
                kind = err.error_kind(),
                delay_ms = delay.as_millis() as u64,
                "model call failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Exponential backoff with up to 25% jitter, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_base
            .saturating_mul(1u32 << attempt.min(16).saturating_sub(1));
        let capped = exp.min(self.config.backoff_cap);
        let jitter_ms = capped.as_millis() as u64 / 4;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        capped + jitter
    }

    async fn emit(&self, event: RunEvent) {
        emit_to_session(&self.session, event).await;
    }
}

async fn emit_to_session(session: &Session, event: RunEvent) {
    match session.emitter() {
        Some(emitter) => {
            if let Err(e) = emitter.emit(event).await {
                warn!(error = %e, "event delivery failed");
            }
        }
        None => warn!("no event receivers — event dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relay_core::agent::ToolCallRequest;
    use relay_core::ids::ThreadId;
    use relay_core::state::RunStatus;
    use relay_core::tools::{ToolContext, ToolError};
    use std::collections::VecDeque;

    /// Agent that replays a fixed script of steps.
    struct ScriptedAgent {
        name: String,
        script: Mutex<VecDeque<Result<AgentStep, ModelError>>>,
    }

    impl ScriptedAgent {
        fn new(name: &str, script: Vec<Result<AgentStep, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn name(&self) -> &str {
            &self.name
        }
        async fn next_step(&self, _turn: &TurnState) -> Result<AgentStep, ModelError> {
            self.script.lock().pop_front().unwrap_or(Ok(AgentStep::Complete {
                result: serde_json::Value::Null,
            }))
        }
    }

    /// Agent that never finishes; used for ceiling and cancellation tests.
    struct StallingAgent;

    #[async_trait]
    impl Agent for StallingAgent {
        fn name(&self) -> &str {
            "staller"
        }
        async fn next_step(&self, _turn: &TurnState) -> Result<AgentStep, ModelError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(AgentStep::Complete {
                result: serde_json::Value::Null,
            })
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            parameters: serde_json::Value,
            ctx: &ToolContext,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::json!({"echo": parameters, "user": ctx.user_id.as_str()}))
        }
    }

    fn engine_with(config: EngineConfig) -> Arc<ExecutionEngine> {
        let tracker = Arc::new(ExecutionTracker::new());
        let registry = Arc::new(AgentRegistry::new());
        Arc::new(ExecutionEngine::new(
            config,
            tracker,
            registry,
            vec![Arc::new(EchoTool)],
        ))
    }

    fn bound_context(
        engine: &Arc<ExecutionEngine>,
        user: &str,
    ) -> (ExecutionContext, Arc<crate::EventEmitter>, tokio::sync::mpsc::Receiver<RunEvent>) {
        let user_id = UserId::from_raw(user);
        let session = engine.registry().get_or_create_session(&user_id);
        let (emitter, rx) = crate::EventEmitter::channel(user_id.clone(), 64);
        session.bind_emitter(&emitter);
        let ctx = ExecutionContext::new(user_id, ThreadId::new());
        (ctx, emitter, rx)
    }

    async fn drain_until_terminal(
        rx: &mut tokio::sync::mpsc::Receiver<RunEvent>,
    ) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn single_run_event_sequence() {
        let engine = engine_with(EngineConfig::default());
        let (ctx, _emitter, mut rx) = bound_context(&engine, "alice");
        let run_id = ctx.run_id.clone();
        let user_id = ctx.user_id.clone();

        let session = engine.registry().get_or_create_session(&user_id);
        session.register_agent(ScriptedAgent::new(
            "planner",
            vec![
                Ok(AgentStep::Thinking {
                    fragment: "checking".into(),
                }),
                Ok(AgentStep::ToolCall {
                    request: ToolCallRequest::new("echo", serde_json::json!({"q": 1})),
                }),
                Ok(AgentStep::Complete {
                    result: serde_json::json!({"done": true}),
                }),
            ],
        ));

        engine
            .start_run(ctx, "planner", serde_json::json!("go"))
            .unwrap();

        let events = drain_until_terminal(&mut rx).await;
        let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "agent_started",
                "agent_thinking",
                "tool_executing",
                "tool_completed",
                "agent_completed"
            ]
        );
        for event in &events {
            assert_eq!(event.user_id(), &user_id);
            assert_eq!(event.run_id(), &run_id);
        }

        let state = engine
            .tracker()
            .get_execution_state(&user_id, &run_id)
            .unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.result_data, Some(serde_json::json!({"done": true})));
    }

    #[tokio::test]
    async fn unregistered_tool_degrades_gracefully() {
        let engine = engine_with(EngineConfig::default());
        let (ctx, _emitter, mut rx) = bound_context(&engine, "alice");
        let run_id = ctx.run_id.clone();
        let user_id = ctx.user_id.clone();

        let session = engine.registry().get_or_create_session(&user_id);
        session.register_agent(ScriptedAgent::new(
            "planner",
            vec![
                Ok(AgentStep::ToolCall {
                    request: ToolCallRequest::new("no_such_tool", serde_json::json!({})),
                }),
                Ok(AgentStep::Complete {
                    result: serde_json::json!("fell back"),
                }),
            ],
        ));

        engine
            .start_run(ctx, "planner", serde_json::Value::Null)
            .unwrap();

        let events = drain_until_terminal(&mut rx).await;
        let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec!["agent_started", "tool_executing", "tool_error", "agent_completed"]
        );

        // The run still completes
        let state = engine
            .tracker()
            .get_execution_state(&user_id, &run_id)
            .unwrap();
        assert_eq!(state.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn tool_events_pair_by_call_id() {
        let engine = engine_with(EngineConfig::default());
        let (ctx, _emitter, mut rx) = bound_context(&engine, "alice");

        let session = engine.registry().get_or_create_session(&ctx.user_id);
        session.register_agent(ScriptedAgent::new(
            "planner",
            vec![
                Ok(AgentStep::ToolCall {
                    request: ToolCallRequest::new("echo", serde_json::json!({"n": 1})),
                }),
                Ok(AgentStep::ToolCall {
                    request: ToolCallRequest::new("echo", serde_json::json!({"n": 2})),
                }),
                Ok(AgentStep::Complete {
                    result: serde_json::Value::Null,
                }),
            ],
        ));
        engine
            .start_run(ctx, "planner", serde_json::Value::Null)
            .unwrap();

        let events = drain_until_terminal(&mut rx).await;
        let mut open = Vec::new();
        for event in &events {
            match event {
                RunEvent::ToolExecuting { tool_call_id, .. } => open.push(tool_call_id.clone()),
                RunEvent::ToolCompleted { tool_call_id, .. }
                | RunEvent::ToolError { tool_call_id, .. } => {
                    // Completion must match the most recent open invocation
                    assert_eq!(open.pop().as_ref(), Some(tool_call_id));
                }
                _ => {}
            }
        }
        assert!(open.is_empty());
    }

    #[tokio::test]
    async fn thinking_sequence_is_monotonic() {
        let engine = engine_with(EngineConfig::default());
        let (ctx, _emitter, mut rx) = bound_context(&engine, "alice");

        let session = engine.registry().get_or_create_session(&ctx.user_id);
        session.register_agent(ScriptedAgent::new(
            "planner",
            vec![
                Ok(AgentStep::Thinking { fragment: "a".into() }),
                Ok(AgentStep::Thinking { fragment: "b".into() }),
                Ok(AgentStep::Thinking { fragment: "c".into() }),
                Ok(AgentStep::Complete {
                    result: serde_json::Value::Null,
                }),
            ],
        ));
        engine
            .start_run(ctx, "planner", serde_json::Value::Null)
            .unwrap();

        let events = drain_until_terminal(&mut rx).await;
        let sequences: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::AgentThinking { sequence, .. } => Some(*sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn concurrent_users_are_isolated() {
        let engine = engine_with(EngineConfig::default());
        let users = ["u1", "u2", "u3", "u4", "u5"];
        let mut receivers = Vec::new();

        for user in users {
            let (ctx, emitter, rx) = bound_context(&engine, user);
            let session = engine.registry().get_or_create_session(&ctx.user_id);
            session.register_agent(ScriptedAgent::new(
                "planner",
                vec![
                    Ok(AgentStep::ToolCall {
                        request: ToolCallRequest::new(
                            "echo",
                            serde_json::json!({"sentinel": user}),
                        ),
                    }),
                    Ok(AgentStep::Complete {
                        result: serde_json::json!({"sentinel": user}),
                    }),
                ],
            ));
            let user_id = ctx.user_id.clone();
            engine
                .start_run(ctx, "planner", serde_json::Value::Null)
                .unwrap();
            receivers.push((user_id, emitter, rx));
        }

        for (user_id, _emitter, mut rx) in receivers {
            let events = drain_until_terminal(&mut rx).await;
            assert!(!events.is_empty());
            for event in &events {
                // No cross-user leakage on any channel
                assert_eq!(event.user_id(), &user_id);
            }
            match events.last().unwrap() {
                RunEvent::AgentCompleted { result, .. } => {
                    assert_eq!(result["sentinel"], user_id.as_str());
                }
                other => panic!("unexpected terminal event: {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_ceiling_aborts_and_releases() {
        let engine = engine_with(EngineConfig::default());
        let (ctx, _emitter, mut rx) = bound_context(&engine, "alice");
        let run_id = ctx.run_id.clone();
        let user_id = ctx.user_id.clone();

        let session = engine.registry().get_or_create_session(&user_id);
        session.register_agent(Arc::new(StallingAgent));

        engine
            .start_run(ctx, "staller", serde_json::Value::Null)
            .unwrap();

        let events = drain_until_terminal(&mut rx).await;
        match events.last().unwrap() {
            RunEvent::AgentFailed { reason, .. } => assert_eq!(reason, "timeout"),
            other => panic!("unexpected terminal event: {other:?}"),
        }

        let state = engine
            .tracker()
            .get_execution_state(&user_id, &run_id)
            .unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.failure_reason.as_deref(), Some("timeout"));

        // Run slot released; the user can start another run immediately
        assert_eq!(session.active_run_count(), 0);
        let health = engine.registry().get_registry_health();
        assert_eq!(health.active_runs, 0);
    }

    #[tokio::test]
    async fn cancellation_fails_run_with_reason() {
        let engine = engine_with(EngineConfig::default());
        let (ctx, _emitter, mut rx) = bound_context(&engine, "alice");
        let run_id = ctx.run_id.clone();
        let user_id = ctx.user_id.clone();

        let session = engine.registry().get_or_create_session(&user_id);
        session.register_agent(Arc::new(StallingAgent));

        engine
            .start_run(ctx, "staller", serde_json::Value::Null)
            .unwrap();

        // Wait for the run to actually start before cancelling
        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type(), "agent_started");
        assert!(engine.cancel_run(&user_id, &run_id));

        let events = drain_until_terminal(&mut rx).await;
        match events.last().unwrap() {
            RunEvent::AgentFailed { reason, .. } => assert_eq!(reason, "cancelled"),
            other => panic!("unexpected terminal event: {other:?}"),
        }

        let state = engine
            .tracker()
            .get_execution_state(&user_id, &run_id)
            .unwrap();
        assert_eq!(state.failure_reason.as_deref(), Some("cancelled"));
        assert_eq!(session.active_run_count(), 0);
    }

    #[tokio::test]
    async fn cancel_unknown_run_is_noop() {
        let engine = engine_with(EngineConfig::default());
        assert!(!engine.cancel_run(&UserId::from_raw("ghost"), &RunId::new()));
    }

    #[tokio::test]
    async fn invalid_context_rejected_before_registration() {
        let engine = engine_with(EngineConfig::default());
        let ctx = ExecutionContext::new(UserId::from_raw(""), ThreadId::new());
        let run_id = ctx.run_id.clone();

        let err = engine
            .start_run(ctx, "planner", serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidContext(_)));
        // Nothing registered
        assert!(engine
            .tracker()
            .get_execution_state(&UserId::from_raw(""), &run_id)
            .is_none());
    }

    #[tokio::test]
    async fn unknown_agent_fails_after_start_event() {
        let engine = engine_with(EngineConfig::default());
        let (ctx, _emitter, mut rx) = bound_context(&engine, "alice");
        let run_id = ctx.run_id.clone();
        let user_id = ctx.user_id.clone();

        engine
            .start_run(ctx, "missing", serde_json::Value::Null)
            .unwrap();

        let events = drain_until_terminal(&mut rx).await;
        let types: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["agent_started", "agent_failed"]);
        match events.last().unwrap() {
            RunEvent::AgentFailed { reason, .. } => assert_eq!(reason, "agent_not_found"),
            other => panic!("unexpected terminal event: {other:?}"),
        }

        let state = engine
            .tracker()
            .get_execution_state(&user_id, &run_id)
            .unwrap();
        assert_eq!(state.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn factory_serves_fresh_session() {
        use relay_core::agent::AgentFactory;

        struct PlannerFactory;
        impl AgentFactory for PlannerFactory {
            fn agent_name(&self) -> &str {
                "planner"
            }
            fn create(&self) -> Arc<dyn Agent> {
                ScriptedAgent::new(
                    "planner",
                    vec![Ok(AgentStep::Complete {
                        result: serde_json::json!("from factory"),
                    })],
                )
            }
        }

        let engine = engine_with(EngineConfig::default());
        engine.registry().register_factory(Arc::new(PlannerFactory));

        // No register_agent call for this user at all
        let (ctx, _emitter, mut rx) = bound_context(&engine, "fresh");
        engine
            .start_run(ctx, "planner", serde_json::Value::Null)
            .unwrap();

        let events = drain_until_terminal(&mut rx).await;
        match events.last().unwrap() {
            RunEvent::AgentCompleted { result, .. } => assert_eq!(result, "from factory"),
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_model_errors_are_retried() {
        let engine = engine_with(EngineConfig::default());
        let (ctx, _emitter, mut rx) = bound_context(&engine, "alice");

        let session = engine.registry().get_or_create_session(&ctx.user_id);
        session.register_agent(ScriptedAgent::new(
            "flaky",
            vec![
                Err(ModelError::Overloaded),
                Err(ModelError::Network("reset".into())),
                Ok(AgentStep::Complete {
                    result: serde_json::json!("recovered"),
                }),
            ],
        ));
        engine
            .start_run(ctx, "flaky", serde_json::Value::Null)
            .unwrap();

        let events = drain_until_terminal(&mut rx).await;
        match events.last().unwrap() {
            RunEvent::AgentCompleted { result, .. } => assert_eq!(result, "recovered"),
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fatal_model_error_fails_run() {
        let engine = engine_with(EngineConfig::default());
        let (ctx, _emitter, mut rx) = bound_context(&engine, "alice");
        let run_id = ctx.run_id.clone();
        let user_id = ctx.user_id.clone();

        let session = engine.registry().get_or_create_session(&user_id);
        session.register_agent(ScriptedAgent::new(
            "broken",
            vec![Err(ModelError::InvalidRequest("bad prompt".into()))],
        ));
        engine
            .start_run(ctx, "broken", serde_json::Value::Null)
            .unwrap();

        let events = drain_until_terminal(&mut rx).await;
        match events.last().unwrap() {
            RunEvent::AgentFailed { reason, .. } => assert_eq!(reason, "model_error"),
            other => panic!("unexpected terminal event: {other:?}"),
        }
        let state = engine
            .tracker()
            .get_execution_state(&user_id, &run_id)
            .unwrap();
        assert_eq!(state.failure_reason.as_deref(), Some("model_error"));
    }

    #[tokio::test]
    async fn max_steps_bounds_runaway_agents() {
        let mut config = EngineConfig::default();
        config.max_steps = 3;
        let engine = engine_with(config);
        let (ctx, _emitter, mut rx) = bound_context(&engine, "alice");

        let script: Vec<_> = (0..10)
            .map(|i| {
                Ok(AgentStep::Thinking {
                    fragment: format!("step {i}"),
                })
            })
            .collect();
        let session = engine.registry().get_or_create_session(&ctx.user_id);
        session.register_agent(ScriptedAgent::new("looper", script));

        engine
            .start_run(ctx, "looper", serde_json::Value::Null)
            .unwrap();

        let events = drain_until_terminal(&mut rx).await;
        match events.last().unwrap() {
            RunEvent::AgentFailed { reason, .. } => assert_eq!(reason, "max_steps"),
            other => panic!("unexpected terminal event: {other:?}"),
        }
        let thinking = events
            .iter()
            .filter(|e| e.event_type() == "agent_thinking")
            .count();
        assert_eq!(thinking, 3);
    }

    #[tokio::test]
    async fn run_metrics_recorded() {
        let metrics = Arc::new(MetricsRecorder::new());
        let tracker = Arc::new(ExecutionTracker::new());
        let registry = Arc::new(AgentRegistry::new());
        let engine = Arc::new(
            ExecutionEngine::new(
                EngineConfig::default(),
                tracker,
                registry,
                vec![Arc::new(EchoTool)],
            )
            .with_metrics(Arc::clone(&metrics)),
        );

        let (ctx, _emitter, mut rx) = bound_context(&engine, "alice");
        let session = engine.registry().get_or_create_session(&ctx.user_id);
        session.register_agent(ScriptedAgent::new(
            "planner",
            vec![Ok(AgentStep::Complete {
                result: serde_json::Value::Null,
            })],
        ));
        engine
            .start_run(ctx, "planner", serde_json::Value::Null)
            .unwrap();
        drain_until_terminal(&mut rx).await;

        assert_eq!(
            metrics.counter_get("runs.total", &[("outcome", "completed")]),
            1
        );
        assert_eq!(metrics.histogram_summary("run.duration_ms", &[]).count, 1);
    }
}
