//! Accumulates streamed fragments into growing message records.
//!
//! The assembler is the single writer of the conversation's message list.
//! Bot fragments append to the most recent still-typing bot record; a user
//! message or a terminal signal breaks the run, so fragments never merge
//! across turns.

use crate::session::SessionEvent;
use crate::types::{ChatMessage, Sender};

/// Heading the tutor emits when a generated question set is ready.
pub const QUESTIONS_HEADING: &str = "## Generated Questions";
/// Heading the tutor emits when a review test has been graded.
pub const TEST_COMPLETE_HEADING: &str = "## Test Complete";

/// Signal raised when a finalized bot turn carries a known sentinel heading.
///
/// This is the hook point for UI affordances; the assembler itself only
/// reports which heading it saw.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TurnSignal {
    /// No sentinel in the finalized text.
    None,
    /// The generated-questions heading appeared.
    QuestionsReady,
    /// The test-completion heading appeared.
    TestCompleted,
}

/// Folds session events into an ordered message list.
///
/// Fragments are applied strictly in arrival order; there is no reordering
/// or deduplication. The transport delivers in order on a single logical
/// stream with a single consumer, and this type must only ever have one
/// writer.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    messages: Vec<ChatMessage>,
    next_id: u64,
}

impl MessageAssembler {
    /// Creates an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// The assembled conversation so far, in order.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Consumes the assembler, returning the message list.
    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Applies one inbound bot fragment.
    ///
    /// Appends to the last message if it is a bot message still typing;
    /// otherwise starts a new bot record with `is_typing = true`.
    pub fn push_fragment(&mut self, text: &str) {
        if let Some(last) = self.messages.last_mut() {
            if last.sender == Sender::Bot && last.is_typing {
                last.text.push_str(text);
                return;
            }
        }
        let id = self.allocate_id();
        self.messages.push(ChatMessage::bot_typing(id, text));
    }

    /// Records an outbound user message.
    ///
    /// User records are finalized immediately, so a later fragment batch
    /// starts a fresh bot record rather than merging across the user turn.
    pub fn push_user(&mut self, text: impl Into<String>) {
        let id = self.allocate_id();
        self.messages.push(ChatMessage::user(id, text));
    }

    /// Removes the most recent user message, if the last record is one.
    ///
    /// Supports optimistic-UI rollback when a send fails.
    pub fn pop_user(&mut self) -> Option<ChatMessage> {
        match self.messages.last() {
            Some(last) if last.sender == Sender::User => self.messages.pop(),
            _ => None,
        }
    }

    /// Handles the terminal signal for the current bot turn.
    ///
    /// Marks every still-typing message finalized and scans the newly
    /// finalized text for sentinel headings.
    pub fn finish_turn(&mut self) -> TurnSignal {
        let mut signal = TurnSignal::None;
        for message in &mut self.messages {
            if !message.is_typing {
                continue;
            }
            message.is_typing = false;
            if message.text.contains(TEST_COMPLETE_HEADING) {
                signal = TurnSignal::TestCompleted;
            } else if message.text.contains(QUESTIONS_HEADING) && signal == TurnSignal::None {
                signal = TurnSignal::QuestionsReady;
            }
        }
        signal
    }

    /// Dispatches one session event onto the assembler.
    ///
    /// `Connected` and `Error` do not touch message state; connection
    /// lifecycle is the session's concern.
    pub fn apply(&mut self, event: &SessionEvent) -> TurnSignal {
        match event {
            SessionEvent::Fragment(text) => {
                self.push_fragment(text);
                TurnSignal::None
            }
            SessionEvent::Done => self.finish_turn(),
            SessionEvent::Connected | SessionEvent::Error(_) => TurnSignal::None,
        }
    }
}
