//! Per-turn conversation session orchestration.
//!
//! A [`ConversationSession`] runs exactly one turn. The turn itself executes
//! on a detached driver task that owns every resource needing cleanup (ledger
//! scope, memory manager, streaming pipeline), so Finalizing runs exactly
//! once no matter how the turn ends: success, backend failure, or the
//! caller walking away from the frame stream.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;

use gcommon::ThreadId;
use gledger::{LedgerScope, UsageLedger};
use gmemory::{MemoryManager, ThreadPatch, ThreadRecord, ThreadStore};
use gprovider::{
    CompletionRequest, KeyResolver, KeyStatusSink, Message, ModelProvider, NoopKeyStatusSink,
    ProviderRegistry, Role, UsageDelta, UsageHandle,
};

use crate::normalize::{NormalizedError, normalize_internal, normalize_provider_error};
use crate::pipeline::{PipelineEvent, Rechunker, TokenPipeline};
use crate::{
    ChatError, DeliveryPacing, Frame, GatewayHooks, NoopGatewayHooks, PromptSource, SessionPhase,
    StaticPromptSource, ThreadBinding, TurnDisposition, TurnRequest,
};

const FRAME_QUEUE_DEPTH: usize = 16;

pub struct GatewayBuilder {
    registry: Arc<ProviderRegistry>,
    keys: Arc<dyn KeyResolver>,
    store: Arc<dyn ThreadStore>,
    prompts: Arc<dyn PromptSource>,
    key_status: Arc<dyn KeyStatusSink>,
    hooks: Arc<dyn GatewayHooks>,
    context_budget_tokens: u32,
}

impl GatewayBuilder {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        keys: Arc<dyn KeyResolver>,
        store: Arc<dyn ThreadStore>,
    ) -> Self {
        Self {
            registry,
            keys,
            store,
            prompts: Arc::new(StaticPromptSource::empty()),
            key_status: Arc::new(NoopKeyStatusSink),
            hooks: Arc::new(NoopGatewayHooks),
            context_budget_tokens: gmemory::DEFAULT_CONTEXT_BUDGET_TOKENS,
        }
    }

    pub fn prompts(mut self, prompts: Arc<dyn PromptSource>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn key_status(mut self, key_status: Arc<dyn KeyStatusSink>) -> Self {
        self.key_status = key_status;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn GatewayHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn context_budget_tokens(mut self, context_budget_tokens: u32) -> Self {
        self.context_budget_tokens = context_budget_tokens;
        self
    }

    pub fn build(self) -> ChatGateway {
        ChatGateway {
            registry: self.registry,
            keys: self.keys,
            store: self.store,
            prompts: self.prompts,
            key_status: self.key_status,
            hooks: self.hooks,
            context_budget_tokens: self.context_budget_tokens,
        }
    }
}

/// The long-lived entry point: collaborators wired once, one session opened
/// per turn.
#[derive(Clone)]
pub struct ChatGateway {
    registry: Arc<ProviderRegistry>,
    keys: Arc<dyn KeyResolver>,
    store: Arc<dyn ThreadStore>,
    prompts: Arc<dyn PromptSource>,
    key_status: Arc<dyn KeyStatusSink>,
    hooks: Arc<dyn GatewayHooks>,
    context_budget_tokens: u32,
}

impl ChatGateway {
    pub fn builder(
        registry: Arc<ProviderRegistry>,
        keys: Arc<dyn KeyResolver>,
        store: Arc<dyn ThreadStore>,
    ) -> GatewayBuilder {
        GatewayBuilder::new(registry, keys, store)
    }

    pub fn store(&self) -> Arc<dyn ThreadStore> {
        Arc::clone(&self.store)
    }

    pub fn session(&self, binding: ThreadBinding) -> ConversationSession {
        ConversationSession {
            shared: SessionShared {
                registry: Arc::clone(&self.registry),
                keys: Arc::clone(&self.keys),
                store: Arc::clone(&self.store),
                prompts: Arc::clone(&self.prompts),
                key_status: Arc::clone(&self.key_status),
                hooks: Arc::clone(&self.hooks),
                context_budget_tokens: self.context_budget_tokens,
                binding,
            },
            phase: Arc::new(Mutex::new(SessionPhase::Idle)),
        }
    }
}

#[derive(Clone)]
struct SessionShared {
    registry: Arc<ProviderRegistry>,
    keys: Arc<dyn KeyResolver>,
    store: Arc<dyn ThreadStore>,
    prompts: Arc<dyn PromptSource>,
    key_status: Arc<dyn KeyStatusSink>,
    hooks: Arc<dyn GatewayHooks>,
    context_budget_tokens: u32,
    binding: ThreadBinding,
}

/// One turn's lifecycle handle. `stream_turn` may be called once; afterwards
/// the session only reports its phase.
pub struct ConversationSession {
    shared: SessionShared,
    phase: Arc<Mutex<SessionPhase>>,
}

impl ConversationSession {
    pub fn phase(&self) -> SessionPhase {
        self.phase
            .lock()
            .map(|phase| *phase)
            .unwrap_or(SessionPhase::Closed)
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.shared.binding.thread_id
    }

    /// Launches the turn and returns the outbound frame stream.
    ///
    /// The turn runs to Finalizing/Closed even if the returned stream is
    /// dropped early. Calling this on a session that already ran is a
    /// programming error and fails with `InvalidState`.
    pub async fn stream_turn(&mut self, turn: TurnRequest) -> Result<FrameStream, ChatError> {
        if !turn.regenerate && turn.user_input.trim().is_empty() {
            return Err(ChatError::invalid_request("user_input must not be empty"));
        }

        {
            let mut phase = self
                .phase
                .lock()
                .map_err(|_| ChatError::invalid_state("session phase lock poisoned"))?;
            if *phase != SessionPhase::Idle {
                return Err(ChatError::invalid_state(
                    "session already ran its turn; open a new session for the next one",
                ));
            }

            *phase = SessionPhase::Initializing;
        }

        let (sender, receiver) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let driver = TurnDriver {
            shared: self.shared.clone(),
            phase: Arc::clone(&self.phase),
            turn,
            frames: sender,
        };
        tokio::spawn(driver.run());

        Ok(FrameStream { receiver })
    }
}

/// Pull side of the turn's outbound frames.
#[derive(Debug)]
pub struct FrameStream {
    receiver: mpsc::Receiver<Frame>,
}

impl Stream for FrameStream {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.receiver.poll_recv(cx)
    }
}

struct TurnDriver {
    shared: SessionShared,
    phase: Arc<Mutex<SessionPhase>>,
    turn: TurnRequest,
    frames: mpsc::Sender<Frame>,
}

struct PreparedTurn {
    provider: Arc<dyn ModelProvider>,
    memory: MemoryManager,
    scope: LedgerScope,
    request: CompletionRequest,
    user_message: Option<Message>,
}

struct StreamOutcome {
    assistant_text: String,
    usage: Option<UsageHandle>,
    failure: Option<gprovider::ProviderError>,
    disconnected: bool,
}

impl TurnDriver {
    async fn run(self) {
        let TurnDriver {
            shared,
            phase,
            turn,
            frames,
        } = self;

        set_phase(&phase, SessionPhase::Initializing);
        shared
            .hooks
            .on_turn_start(&shared.binding.thread_id, &turn.turn_id);

        let prepared = match initialize(&shared, &turn).await {
            Ok(prepared) => prepared,
            Err(normalized) => {
                set_phase(&phase, SessionPhase::Erroring);
                report_error(&shared, &normalized).await;
                let _ = frames.send(Frame::terminal_error(&normalized.record)).await;

                set_phase(&phase, SessionPhase::Finalizing);
                shared.hooks.on_turn_finalized(
                    &shared.binding.thread_id,
                    &turn.turn_id,
                    &TurnDisposition::Failed(normalized.record.code),
                    None,
                );
                set_phase(&phase, SessionPhase::Closed);
                return;
            }
        };

        let PreparedTurn {
            provider,
            mut memory,
            scope,
            request,
            user_message,
        } = prepared;

        set_phase(&phase, SessionPhase::Streaming);
        let outcome = run_streaming(provider.as_ref(), request, &turn.pacing, &frames).await;

        let failure_code = match &outcome.failure {
            Some(error) => {
                set_phase(&phase, SessionPhase::Erroring);
                let normalized = normalize_provider_error(error, shared.hooks.as_ref());
                report_error(&shared, &normalized).await;
                if !outcome.disconnected {
                    let _ = frames.send(Frame::terminal_error(&normalized.record)).await;
                }

                Some(normalized.record.code)
            }
            None => None,
        };

        set_phase(&phase, SessionPhase::Finalizing);
        let usage = match outcome.usage {
            Some(handle) => handle.resolve().await,
            None => None,
        };

        finalize(
            &shared,
            &turn,
            scope,
            &mut memory,
            user_message,
            &outcome.assistant_text,
            usage,
            provider.model(),
        )
        .await;

        let disposition = match failure_code {
            Some(code) => TurnDisposition::Failed(code),
            None if outcome.disconnected => TurnDisposition::Disconnected,
            None => TurnDisposition::Completed,
        };
        shared.hooks.on_turn_finalized(
            &shared.binding.thread_id,
            &turn.turn_id,
            &disposition,
            usage.as_ref(),
        );
        set_phase(&phase, SessionPhase::Closed);
    }
}

async fn initialize(
    shared: &SessionShared,
    turn: &TurnRequest,
) -> Result<PreparedTurn, NormalizedError> {
    let binding = &shared.binding;
    let thread_id = &binding.thread_id;

    let access = shared
        .keys
        .resolve(&binding.key_id, &binding.scope)
        .await
        .map_err(|error| {
            let error = if error.provider.is_none() {
                error.with_provider(binding.provider)
            } else {
                error
            };
            normalize_provider_error(&error, shared.hooks.as_ref())
        })?;

    let binder = shared.registry.get(binding.provider).ok_or_else(|| {
        normalize_internal(
            "registry",
            &format!("no binder registered for provider '{}'", binding.provider),
        )
    })?;
    let provider = binder.bind(access, binding.config.clone());

    shared
        .store
        .create_if_missing(ThreadRecord::new(
            thread_id.clone(),
            binding.provider,
            provider.model(),
        ))
        .await
        .map_err(|error| normalize_internal("store", &error.to_string()))?;

    let context = shared
        .store
        .load_context(thread_id)
        .await
        .map_err(|error| normalize_internal("store", &error.to_string()))?;
    let mut memory = MemoryManager::from_stored(context, shared.context_budget_tokens);

    // Prune failure is non-fatal and already logged by the manager; the
    // regenerate replay of a turn must not prune a second time.
    if !turn.regenerate {
        let _ = memory.prune(&turn.turn_id, provider.as_ref()).await;
    }

    let mut messages = Vec::new();
    let system_prompt = shared
        .prompts
        .system_prompt(thread_id)
        .await
        .map_err(|error| normalize_internal("prompts", &error.to_string()))?;
    if let Some(prompt) = system_prompt {
        messages.push(Message::new(Role::System, prompt));
    }

    if let Some(summary) = memory.summary() {
        messages.push(Message::new(
            Role::System,
            format!("Summary of the earlier conversation: {summary}"),
        ));
    }

    messages.extend(memory.messages().iter().cloned());

    let user_message = if turn.regenerate {
        // Re-produce the previous answer: present the context up to the
        // last user message, without appending new input.
        while matches!(messages.last(), Some(last) if last.role == Role::Assistant) {
            messages.pop();
        }
        None
    } else {
        let user = Message::new(Role::User, turn.user_input.clone())
            .with_image_urls(turn.attachments.clone());
        messages.push(user.clone());
        Some(user)
    };

    if messages.iter().all(|message| message.role != Role::User) {
        return Err(normalize_internal(
            "session",
            "turn has no user content to send to the model",
        ));
    }

    let scope = UsageLedger::new(Arc::clone(&shared.store)).open(thread_id.clone());

    Ok(PreparedTurn {
        provider,
        memory,
        scope,
        request: CompletionRequest::new(messages),
        user_message,
    })
}

async fn run_streaming(
    provider: &dyn ModelProvider,
    request: CompletionRequest,
    pacing: &DeliveryPacing,
    frames: &mpsc::Sender<Frame>,
) -> StreamOutcome {
    let call = match provider.stream(request).await {
        Ok(call) => call,
        Err(error) => {
            return StreamOutcome {
                assistant_text: String::new(),
                usage: None,
                failure: Some(error),
                disconnected: false,
            };
        }
    };

    let mut pipeline = TokenPipeline::spawn(call.tokens);
    let mut chunker = Rechunker::new(pacing.chunk_chars);
    let mut assistant_text = String::new();
    let mut failure = None;
    let mut disconnected = false;

    'consume: loop {
        match pipeline.next().await {
            Some(PipelineEvent::Token(token)) => {
                assistant_text.push_str(&token);
                for piece in chunker.push(&token) {
                    if !deliver(frames, pacing, &piece).await {
                        disconnected = true;
                        break 'consume;
                    }
                }
            }
            Some(PipelineEvent::Closed(Ok(()))) => {
                if let Some(piece) = chunker.flush()
                    && !deliver(frames, pacing, &piece).await
                {
                    disconnected = true;
                }
                break;
            }
            Some(PipelineEvent::Closed(Err(error))) => {
                // Partial output already produced stays delivered; the
                // terminal error frame is appended after it.
                if let Some(piece) = chunker.flush() {
                    let _ = deliver(frames, pacing, &piece).await;
                }
                failure = Some(error);
                break;
            }
            None => break,
        }
    }

    // Cancels a still-running producer on early exit (consumer disconnect).
    drop(pipeline);

    StreamOutcome {
        assistant_text,
        usage: Some(call.usage),
        failure,
        disconnected,
    }
}

async fn deliver(frames: &mpsc::Sender<Frame>, pacing: &DeliveryPacing, chunk: &str) -> bool {
    if let Some(delay) = pacing.inter_chunk_delay {
        tokio::time::sleep(delay).await;
    }

    frames.send(Frame::content(chunk)).await.is_ok()
}

async fn report_error(shared: &SessionShared, normalized: &NormalizedError) {
    shared
        .hooks
        .on_error_normalized(&shared.binding.thread_id, &normalized.record);

    if let Some(flag) = normalized.key_flag {
        shared.key_status.flag(&shared.binding.key_id, flag);
    }

    if let Err(error) = shared
        .store
        .set_fields(
            &shared.binding.thread_id,
            ThreadPatch::new().with_last_error(normalized.record.clone()),
        )
        .await
    {
        tracing::warn!(
            thread_id = %shared.binding.thread_id,
            error = %error,
            "failed to persist last_error on thread"
        );
    }
}

#[allow(clippy::too_many_arguments)]
async fn finalize(
    shared: &SessionShared,
    turn: &TurnRequest,
    scope: LedgerScope,
    memory: &mut MemoryManager,
    user_message: Option<Message>,
    assistant_text: &str,
    usage: Option<UsageDelta>,
    model: &str,
) {
    let thread_id = &shared.binding.thread_id;

    // Ledger close first: usage must never be lost to a later failure.
    let ledger_result = if turn.regenerate {
        scope.close_regenerate(model).await
    } else {
        let credit_charge = if turn.paid_tier { turn.credit_price } else { 0 };
        scope.close(usage, credit_charge, model).await
    };
    if let Err(error) = ledger_result {
        tracing::error!(
            thread_id = %thread_id,
            error = %error,
            "ledger close failed during finalization"
        );
    }

    // Memory write-back. Turns that produced no assistant text leave the
    // stored context untouched.
    let mut context_dirty = false;
    if turn.regenerate {
        if !assistant_text.is_empty() && memory.replace_last_assistant(assistant_text) {
            context_dirty = true;
        }
    } else if let Some(user) = user_message
        && !assistant_text.is_empty()
    {
        memory.commit_exchange(user, Message::new(Role::Assistant, assistant_text));
        context_dirty = true;
    }

    let summary_changed = memory.summary().is_some();
    if context_dirty || summary_changed {
        if let Err(error) = shared.store.save_context(thread_id, memory.to_stored()).await {
            tracing::error!(
                thread_id = %thread_id,
                error = %error,
                "context persistence failed during finalization"
            );
        }
    }
}

fn set_phase(phase: &Arc<Mutex<SessionPhase>>, value: SessionPhase) {
    if let Ok(mut guard) = phase.lock() {
        *guard = value;
    }
}
