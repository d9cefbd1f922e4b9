//! Token-budgeted context window with a rolling summary.

use gcommon::TurnId;
use gprovider::{CompletionRequest, Message, ModelProvider, Role};

/// Default serialized-token budget for the recent-message window.
pub const DEFAULT_CONTEXT_BUDGET_TOKENS: u32 = 3_000;

const SUMMARY_OUTPUT_CEILING: u32 = 256;

const SUMMARY_INSTRUCTION: &str = "Compress the following conversation excerpt into a short \
summary. Preserve concrete facts, names, decisions, and unresolved questions. Reply with the \
summary text only.";

/// Rough serialized size of the window, using the 4-characters-per-token
/// heuristic. Only relative accuracy matters here: the estimate decides when
/// to compress, not what to bill.
pub fn estimate_tokens(messages: &[Message]) -> u32 {
    messages
        .iter()
        .map(|message| (message.content.chars().count() as u32).div_ceil(4) + 1)
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneOutcome {
    /// The window fits the budget; nothing to do.
    WithinBudget,
    /// Over budget but with ≤1 message there is nothing to compress.
    SkippedSparseWindow,
    /// This logical turn already pruned once (regenerate replay).
    SkippedRepeatTurn,
    /// The oldest portion was folded into the summary and evicted.
    Summarized { evicted: usize },
    /// Summarization failed; the window was left untouched.
    Failed,
}

/// Owns the in-memory view of one thread's conversation context for the
/// duration of a turn.
#[derive(Debug)]
pub struct MemoryManager {
    messages: Vec<Message>,
    summary: Option<String>,
    budget_tokens: u32,
    last_pruned_turn: Option<TurnId>,
}

impl MemoryManager {
    pub fn new(budget_tokens: u32) -> Self {
        Self {
            messages: Vec::new(),
            summary: None,
            budget_tokens,
            last_pruned_turn: None,
        }
    }

    pub fn from_stored(context: crate::StoredContext, budget_tokens: u32) -> Self {
        Self {
            messages: context.messages,
            summary: context.summary,
            budget_tokens,
            last_pruned_turn: None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn budget_tokens(&self) -> u32 {
        self.budget_tokens
    }

    pub fn estimated_tokens(&self) -> u32 {
        estimate_tokens(&self.messages)
    }

    pub fn is_over_budget(&self) -> bool {
        self.estimated_tokens() > self.budget_tokens
    }

    /// Records a completed exchange at the end of the window.
    pub fn commit_exchange(&mut self, user: Message, assistant: Message) {
        self.messages.push(user);
        self.messages.push(assistant);
    }

    /// Swaps the content of the trailing assistant message, used when a turn
    /// re-produces the previous answer instead of extending the transcript.
    /// Returns whether there was an assistant message to replace.
    pub fn replace_last_assistant(&mut self, content: impl Into<String>) -> bool {
        match self.messages.iter_mut().rev().find(|m| m.role == Role::Assistant) {
            Some(message) => {
                message.content = content.into();
                message.image_urls.clear();
                true
            }
            None => false,
        }
    }

    pub fn to_stored(&self) -> crate::StoredContext {
        crate::StoredContext::new(self.messages.clone(), self.summary.clone())
    }

    /// Bounds the window by folding its oldest half into the rolling summary.
    ///
    /// The summarization call is a plain non-streaming completion against the
    /// turn's bound provider. Failure is non-fatal: the window and summary
    /// are left untouched and the turn proceeds without compression.
    pub async fn prune(&mut self, turn_id: &TurnId, summarizer: &dyn ModelProvider) -> PruneOutcome {
        if self.last_pruned_turn.as_ref() == Some(turn_id) {
            return PruneOutcome::SkippedRepeatTurn;
        }
        self.last_pruned_turn = Some(turn_id.clone());

        if !self.is_over_budget() {
            return PruneOutcome::WithinBudget;
        }

        if self.messages.len() <= 1 {
            return PruneOutcome::SkippedSparseWindow;
        }

        let split = (self.messages.len() / 2).max(1);
        let request = summarize_request(self.summary.as_deref(), &self.messages[..split]);

        match summarizer.complete(request).await {
            Ok(completion) if !completion.text.trim().is_empty() => {
                self.summary = Some(completion.text.trim().to_string());
                self.messages.drain(..split);
                tracing::info!(
                    turn_id = %turn_id,
                    evicted = split,
                    remaining_tokens = self.estimated_tokens(),
                    "context window compressed"
                );
                PruneOutcome::Summarized { evicted: split }
            }
            Ok(_) => {
                tracing::warn!(
                    turn_id = %turn_id,
                    "summarizer returned empty text; window left unchanged"
                );
                PruneOutcome::Failed
            }
            Err(error) => {
                tracing::warn!(
                    turn_id = %turn_id,
                    error = %error,
                    "context summarization failed; window left unchanged"
                );
                PruneOutcome::Failed
            }
        }
    }
}

fn summarize_request(prior_summary: Option<&str>, excerpt: &[Message]) -> CompletionRequest {
    let mut body = String::new();
    if let Some(summary) = prior_summary {
        body.push_str("Summary so far:\n");
        body.push_str(summary);
        body.push_str("\n\n");
    }

    body.push_str("Conversation excerpt:\n");
    for message in excerpt {
        let speaker = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        body.push_str(speaker);
        body.push_str(": ");
        body.push_str(&message.content);
        body.push('\n');
    }

    CompletionRequest::new(vec![
        Message::new(Role::System, SUMMARY_INSTRUCTION),
        Message::new(Role::User, body),
    ])
    .with_max_output_tokens(SUMMARY_OUTPUT_CEILING)
}
