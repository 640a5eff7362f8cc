// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! The long-lived wrapper around one reasoning-model subprocess.
//!
//! An [`AgentSession`] is created once per session, holds the composed
//! system prompt and the tool surface fixed for its lifetime, and turns
//! each user message into a lazy stream of envelopes. Conversation memory
//! lives inside the model subprocess, which is why the wrapper must stay
//! alive for the whole user session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_channel::Sender;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use atelier_protocol::Envelope;

use crate::audit::AuditRecorder;
use crate::config::Config;
use crate::error::AtelierErr;
use crate::error::Result;
use crate::hooks::HookPipeline;
use crate::hooks::PreHookDecision;
use crate::hooks::TurnFlags;
use crate::model::ModelEvent;
use crate::model::ModelInput;
use crate::model::ModelProfile;
use crate::model::ModelTransport;
use crate::model::TransportFactory;
use crate::policy::PolicyDecision;
use crate::policy::PolicyGate;
use crate::prompt;
use crate::sandbox::SandboxSupervisor;
use crate::state::SessionState;
use crate::subagent;
use crate::subagent::SubagentSpec;
use crate::tools;
use crate::tools::TOOL_TASK;
use crate::tools::ToolCall;
use crate::tools::ToolContext;
use crate::tools::ToolOutput;

/// Outcome of handling one tool-use event.
enum TurnControl {
    Continue,
    /// The client channel is gone; stop driving the turn.
    ChannelClosed,
    /// The model subprocess stopped accepting input.
    ModelDied,
    /// A post-hook exhausted its budget; the turn ends with this error.
    Fail(String),
}

/// One in-flight turn: a stream of envelopes plus a handle to cancel the
/// driving task (used by the turn timeout).
pub struct TurnHandle {
    rx: async_channel::Receiver<Envelope>,
    abort: AbortHandle,
}

impl TurnHandle {
    /// Next envelope, or `None` once the turn task has finished and the
    /// stream drained.
    pub async fn next(&self) -> Option<Envelope> {
        self.rx.recv().await.ok()
    }

    pub fn abort(&self) {
        if !self.abort.is_finished() {
            self.abort.abort();
        }
    }
}

pub struct AgentSession {
    session_id: Uuid,
    transport: Box<dyn ModelTransport>,
    factory: Arc<dyn TransportFactory>,
    ctx: ToolContext,
    policy: PolicyGate,
    hooks: HookPipeline,
    flags: Mutex<TurnFlags>,
    cleaned_up: AtomicBool,
}

impl AgentSession {
    /// Materialise the workspace, compose the system prompt, connect the
    /// model subprocess and configure it. Called exactly once per session;
    /// a failure here is an `InitError` and no envelope may have been sent
    /// yet.
    pub async fn initialize(
        session_id: Uuid,
        config: Arc<Config>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Arc<Self>> {
        let supervisor = Arc::new(
            SandboxSupervisor::create(session_id, Arc::clone(&config))
                .await
                .map_err(|e| AtelierErr::Init(format!("workspace creation failed: {e}")))?,
        );

        let components = prompt::load_component_registry(supervisor.workspace_root());
        let system_prompt = prompt::compose_system_prompt(&config, &components);

        let transport = factory
            .create(&ModelProfile::main())
            .await
            .map_err(|e| AtelierErr::Init(format!("model transport failed: {e}")))?;
        transport
            .send(ModelInput::Configure {
                system_prompt,
                tools: tools::builtin_tool_specs(),
                subagents: subagent::adverts(),
                cwd: supervisor.workspace_root().to_path_buf(),
            })
            .await
            .map_err(|e| AtelierErr::Init(format!("model configuration failed: {e}")))?;

        let audit = AuditRecorder::new(&config.audit_dir, session_id)
            .map_err(|e| AtelierErr::Init(format!("audit log creation failed: {e}")))?;
        let hooks = HookPipeline::new(audit, config.build_failure_limit);
        let policy = PolicyGate::from_config(&config);

        info!("agent session {session_id} initialized");
        Ok(Arc::new(Self {
            session_id,
            transport,
            factory,
            ctx: ToolContext {
                supervisor,
                state: Arc::new(SessionState::new()),
                config,
            },
            policy,
            hooks,
            flags: Mutex::new(TurnFlags::default()),
            cleaned_up: AtomicBool::new(false),
        }))
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn supervisor(&self) -> &Arc<SandboxSupervisor> {
        &self.ctx.supervisor
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.ctx.state
    }

    /// Issue one user turn. The returned stream terminates with exactly
    /// one `done` (success) or `error` (failure) envelope. The caller
    /// serialises turns; this method does not.
    pub fn chat(self: &Arc<Self>, text: String) -> TurnHandle {
        let (tx, rx) = async_channel::bounded(64);
        let sess = Arc::clone(self);
        let abort = tokio::spawn(async move {
            sess.run_turn(text, tx).await;
        })
        .abort_handle();
        TurnHandle { rx, abort }
    }

    /// Clear per-turn hook state. The connection manager calls this after
    /// a timeout or mid-stream error so the next turn starts clean.
    pub fn reset_turn_flags(&self) {
        self.flags.lock().unwrap().reset();
    }

    /// Disconnect the model subprocess and release session resources.
    /// Idempotent and infallible.
    pub async fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("agent session {} cleaning up", self.session_id);
        self.transport.shutdown().await;
        self.ctx.supervisor.teardown().await;
    }

    async fn run_turn(&self, text: String, tx: Sender<Envelope>) {
        self.reset_turn_flags();

        if self.transport.send(ModelInput::User { text }).await.is_err() {
            let _ = tx
                .send(Envelope::Error {
                    message: "model subprocess died".to_string(),
                })
                .await;
            return;
        }

        // Model-side tools (e.g. data exploration) report their own
        // results; remember names by call id so the pass-through can be
        // classified by the planning hook.
        let mut model_side_tools: HashMap<String, String> = HashMap::new();

        loop {
            let event = match self.transport.recv().await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => {
                    let _ = tx
                        .send(Envelope::Error {
                            message: "model stream ended unexpectedly".to_string(),
                        })
                        .await;
                    return;
                }
            };

            match event {
                ModelEvent::Text { text } => {
                    if tx.send(Envelope::Text { content: text }).await.is_err() {
                        return;
                    }
                }
                ModelEvent::ToolUse { id, name, input } => {
                    let call = ToolCall { id, name, input };
                    match self
                        .handle_tool_use(
                            self.transport.as_ref(),
                            &call,
                            &tx,
                            None,
                            &mut model_side_tools,
                        )
                        .await
                    {
                        TurnControl::Continue => {}
                        TurnControl::ChannelClosed => return,
                        TurnControl::ModelDied => {
                            let _ = tx
                                .send(Envelope::Error {
                                    message: "model subprocess died".to_string(),
                                })
                                .await;
                            return;
                        }
                        TurnControl::Fail(message) => {
                            let _ = tx.send(Envelope::Error { message }).await;
                            return;
                        }
                    }
                }
                ModelEvent::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    if let Some(name) = model_side_tools.remove(&tool_use_id) {
                        self.hooks
                            .note_exploration_result(&name, is_error, &self.ctx);
                    }
                    if tx
                        .send(Envelope::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                ModelEvent::Done {
                    cost_usd,
                    duration_ms,
                    num_turns,
                } => {
                    let preview_url = self.ctx.supervisor.preview_url();
                    let _ = tx
                        .send(Envelope::Done {
                            preview_url,
                            cost_usd,
                            duration_ms,
                            num_turns,
                        })
                        .await;
                    return;
                }
                ModelEvent::Error { message } => {
                    warn!("turn error from model: {message}");
                    let _ = tx.send(Envelope::Error { message }).await;
                    return;
                }
            }
        }
    }

    /// Gate, audit, execute and hook one tool call. `allowed_tools` is the
    /// restriction of the sub-agent driving the call, if any; `transport`
    /// is wherever the result envelope must be echoed back to.
    async fn handle_tool_use(
        &self,
        transport: &dyn ModelTransport,
        call: &ToolCall,
        tx: &Sender<Envelope>,
        allowed_tools: Option<&[&str]>,
        model_side_tools: &mut HashMap<String, String>,
    ) -> TurnControl {
        if let Some(allowed) = allowed_tools
            && !allowed.contains(&call.name.as_str())
        {
            let reason = format!(
                "blocked: tool {} is not permitted for this sub-agent",
                call.name
            );
            self.hooks
                .audit_call(
                    call,
                    &PolicyDecision::Deny {
                        reason: reason.clone(),
                    },
                )
                .await;
            return self.send_denial(transport, call, tx, reason).await;
        }

        let decision = self.policy.decide(call, &self.ctx);
        self.hooks.audit_call(call, &decision).await;
        if let PolicyDecision::Deny { reason } = decision {
            return self.send_denial(transport, call, tx, reason).await;
        }
        if let PreHookDecision::Deny { reason } = self.hooks.run_pre(call, &self.ctx) {
            return self.send_denial(transport, call, tx, reason).await;
        }

        // The gate allowed the call; now the client gets to see it.
        if tx
            .send(Envelope::ToolUse {
                tool: call.name.clone(),
                input: call.input.clone(),
                id: call.id.clone(),
            })
            .await
            .is_err()
        {
            return TurnControl::ChannelClosed;
        }

        // Tools we do not implement are executed by the model itself;
        // their results come back as pass-through events.
        if !tools::is_builtin_tool(&call.name) {
            model_side_tools.insert(call.id.clone(), call.name.clone());
            return TurnControl::Continue;
        }

        let output = if call.name == TOOL_TASK {
            self.run_subagent(call, tx).await
        } else {
            tools::dispatch(call, &self.ctx).await
        };

        let effects = {
            let mut flags = self.flags.lock().unwrap();
            self.hooks.run_post(call, &output, &self.ctx, &mut flags)
        };

        let content = output.to_content();
        if tx
            .send(Envelope::ToolResult {
                tool_use_id: call.id.clone(),
                content: content.clone(),
                is_error: output.is_error,
            })
            .await
            .is_err()
        {
            return TurnControl::ChannelClosed;
        }
        if transport
            .send(ModelInput::ToolOutput {
                tool_use_id: call.id.clone(),
                content,
                is_error: output.is_error,
            })
            .await
            .is_err()
        {
            return TurnControl::ModelDied;
        }

        for message in effects.inject {
            if transport
                .send(ModelInput::System { text: message })
                .await
                .is_err()
            {
                return TurnControl::ModelDied;
            }
        }
        if let Some(message) = effects.fail_turn {
            return TurnControl::Fail(message);
        }

        TurnControl::Continue
    }

    /// A denied call never executes: the model and the client both receive
    /// a synthetic error result, and the turn continues.
    async fn send_denial(
        &self,
        transport: &dyn ModelTransport,
        call: &ToolCall,
        tx: &Sender<Envelope>,
        reason: String,
    ) -> TurnControl {
        info!("denied tool call {} ({}): {reason}", call.name, call.id);
        let content = JsonValue::String(reason);
        if tx
            .send(Envelope::ToolResult {
                tool_use_id: call.id.clone(),
                content: content.clone(),
                is_error: true,
            })
            .await
            .is_err()
        {
            return TurnControl::ChannelClosed;
        }
        if transport
            .send(ModelInput::ToolOutput {
                tool_use_id: call.id.clone(),
                content,
                is_error: true,
            })
            .await
            .is_err()
        {
            return TurnControl::ModelDied;
        }
        TurnControl::Continue
    }

    /// Delegate to a registered sub-agent: fresh reasoning context, its
    /// declared tool subset, same policy gate, hooks and workspace. The
    /// sub-agent's final text becomes the Task tool result.
    async fn run_subagent(&self, call: &ToolCall, tx: &Sender<Envelope>) -> ToolOutput {
        #[derive(Deserialize)]
        struct TaskParams {
            subagent: String,
            prompt: String,
        }

        let params: TaskParams = match serde_json::from_value(call.input.clone()) {
            Ok(p) => p,
            Err(e) => return ToolOutput::error(format!("failed to parse Task arguments: {e}")),
        };
        let Some(spec) = subagent::find(&params.subagent) else {
            return ToolOutput::error(format!("unknown sub-agent: {}", params.subagent));
        };

        let profile = ModelProfile {
            role: spec.name.to_string(),
            tier: spec.tier,
        };
        let transport = match self.factory.create(&profile).await {
            Ok(t) => t,
            Err(e) => {
                return ToolOutput::error(format!(
                    "failed to start sub-agent {}: {e}",
                    spec.name
                ));
            }
        };

        debug!("delegating to sub-agent {}", spec.name);
        let result = self
            .drive_subagent(transport.as_ref(), spec, &params.prompt, tx)
            .await;
        transport.shutdown().await;

        match result {
            Ok(text) => ToolOutput::text(text),
            Err(e) => ToolOutput::error(format!("sub-agent {} failed: {e}", spec.name)),
        }
    }

    async fn drive_subagent(
        &self,
        transport: &dyn ModelTransport,
        spec: &SubagentSpec,
        prompt: &str,
        tx: &Sender<Envelope>,
    ) -> Result<String> {
        transport
            .send(ModelInput::Configure {
                system_prompt: spec.prompt.to_string(),
                tools: tools::tool_specs_for(spec.tools),
                subagents: Vec::new(),
                cwd: self.ctx.supervisor.workspace_root().to_path_buf(),
            })
            .await?;
        transport
            .send(ModelInput::User {
                text: prompt.to_string(),
            })
            .await?;

        let mut transcript = String::new();
        let mut model_side_tools: HashMap<String, String> = HashMap::new();
        loop {
            let event = transport
                .recv()
                .await?
                .ok_or_else(|| AtelierErr::Stream("sub-agent stream ended unexpectedly".into()))?;
            match event {
                ModelEvent::Text { text } => {
                    if !transcript.is_empty() {
                        transcript.push('\n');
                    }
                    transcript.push_str(&text);
                }
                ModelEvent::ToolUse { id, name, input } => {
                    let call = ToolCall { id, name, input };
                    match Box::pin(self.handle_tool_use(
                        transport,
                        &call,
                        tx,
                        Some(spec.tools),
                        &mut model_side_tools,
                    ))
                    .await
                    {
                        TurnControl::Continue => {}
                        TurnControl::ChannelClosed => {
                            return Err(AtelierErr::Stream("client channel closed".into()));
                        }
                        TurnControl::ModelDied => return Err(AtelierErr::ModelProcessDied),
                        TurnControl::Fail(message) => return Err(AtelierErr::Stream(message)),
                    }
                }
                ModelEvent::ToolResult { .. } => {
                    // Internal to the sub-agent; nothing to forward.
                }
                ModelEvent::Done { .. } => return Ok(transcript),
                ModelEvent::Error { message } => return Err(AtelierErr::Stream(message)),
            }
        }
    }
}
