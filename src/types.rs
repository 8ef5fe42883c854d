//! Core protocol types: session scopes, wire events, and message records.

use std::fmt;

use serde::{Deserialize, Serialize};

///////////////////////////////////////////// TutorLevel /////////////////////////////////////////////

/// Difficulty level requested for a review-test session.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TutorLevel {
    /// Easiest question set.
    Beginner,
    /// Default question set.
    #[default]
    Intermediate,
    /// Hardest question set.
    Advanced,
}

impl TutorLevel {
    /// The lowercase wire representation used in query strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            TutorLevel::Beginner => "beginner",
            TutorLevel::Intermediate => "intermediate",
            TutorLevel::Advanced => "advanced",
        }
    }
}

impl fmt::Display for TutorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//////////////////////////////////////////// SessionScope ////////////////////////////////////////////

/// Identifies a logical conversation: its mode and the context it is scoped to.
///
/// A scope is immutable once a session starts; a different scope requires a
/// new session. The scope determines both the subscribe endpoint and the send
/// endpoint for the conversation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SessionScope {
    /// Question-generation mode, scoped to a task.
    QuestionGeneration {
        /// The kind of task questions are generated for.
        task_type: String,
        /// The field within the task.
        task_field: String,
    },
    /// Review-test mode, scoped to a single review card.
    ReviewTest {
        /// The review card under test.
        review_card_id: String,
        /// Requested difficulty.
        tutor_level: TutorLevel,
    },
}

impl SessionScope {
    /// Path of the SSE subscribe endpoint for this scope, relative to the base URL.
    pub fn subscribe_path(&self) -> &'static str {
        match self {
            SessionScope::QuestionGeneration { .. } => "chat/subscribe",
            SessionScope::ReviewTest { .. } => "chat/test-subscribe",
        }
    }

    /// Path of the outbound message endpoint for this scope, relative to the base URL.
    pub fn send_path(&self) -> &'static str {
        match self {
            SessionScope::QuestionGeneration { .. } => "chat/message",
            SessionScope::ReviewTest { .. } => "chat/test-message",
        }
    }

    /// Query parameters carried on the subscribe call.
    pub fn subscribe_query(&self) -> Vec<(&'static str, String)> {
        match self {
            SessionScope::QuestionGeneration {
                task_type,
                task_field,
            } => vec![
                ("taskType", task_type.clone()),
                ("taskField", task_field.clone()),
            ],
            SessionScope::ReviewTest {
                review_card_id,
                tutor_level,
            } => vec![
                ("reviewCardId", review_card_id.clone()),
                ("tutorLevel", tutor_level.as_str().to_string()),
            ],
        }
    }
}

///////////////////////////////////////////// StreamEvent ////////////////////////////////////////////

/// JSON body of a `message` wire event.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// One incremental piece of bot-generated text.
    pub content: String,
}

/// A named event decoded from the SSE subscription.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamEvent {
    /// The server acknowledged the subscription.
    Connected,
    /// An incremental message fragment.
    Message(MessageEvent),
    /// The current bot turn is complete.
    Done,
    /// Server liveness signal; carries no payload.
    Heartbeat,
}

////////////////////////////////////////////// Messages //////////////////////////////////////////////

/// Who authored a message record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    /// The human user.
    User,
    /// The tutor bot.
    Bot,
}

/// One message in the conversation.
///
/// Bot records are created on the first fragment of a turn and grow by
/// appending text while `is_typing` is true. A terminal signal finalizes them.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Monotonic identifier assigned by the assembler.
    pub id: u64,
    /// Message author.
    pub sender: Sender,
    /// Accumulated text.
    pub text: String,
    /// True while fragments may still be appended.
    pub is_typing: bool,
}

impl ChatMessage {
    /// Creates a finalized user message.
    pub fn user(id: u64, text: impl Into<String>) -> Self {
        ChatMessage {
            id,
            sender: Sender::User,
            text: text.into(),
            is_typing: false,
        }
    }

    /// Creates an in-progress bot message seeded with the first fragment.
    pub fn bot_typing(id: u64, text: impl Into<String>) -> Self {
        ChatMessage {
            id,
            sender: Sender::Bot,
            text: text.into(),
            is_typing: true,
        }
    }
}

/// Body of the outbound send call.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    /// The user's message text.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_generation_endpoints() {
        let scope = SessionScope::QuestionGeneration {
            task_type: "essay".to_string(),
            task_field: "history".to_string(),
        };
        assert_eq!(scope.subscribe_path(), "chat/subscribe");
        assert_eq!(scope.send_path(), "chat/message");
        assert_eq!(
            scope.subscribe_query(),
            vec![
                ("taskType", "essay".to_string()),
                ("taskField", "history".to_string()),
            ]
        );
    }

    #[test]
    fn review_test_endpoints() {
        let scope = SessionScope::ReviewTest {
            review_card_id: "card-42".to_string(),
            tutor_level: TutorLevel::Advanced,
        };
        assert_eq!(scope.subscribe_path(), "chat/test-subscribe");
        assert_eq!(scope.send_path(), "chat/test-message");
        assert_eq!(
            scope.subscribe_query(),
            vec![
                ("reviewCardId", "card-42".to_string()),
                ("tutorLevel", "advanced".to_string()),
            ]
        );
    }

    #[test]
    fn message_event_deserializes_content() {
        let event: MessageEvent = serde_json::from_str(r#"{"content": "Hel"}"#).unwrap();
        assert_eq!(event.content, "Hel");
    }

    #[test]
    fn send_request_serializes_message_field() {
        let body = SendMessageRequest {
            message: "What is spaced repetition?".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"message":"What is spaced repetition?"}"#
        );
    }
}
