//! Conversation history for one session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Appended to an assistant turn's stored text when the user cuts it off
pub const INTERRUPTION_MARKER: &str = " [interrupted]";

/// Speaker of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One entry in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub interrupted: bool,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            interrupted: false,
            at: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }
}

/// How an open assistant turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    /// Turn kept in history
    Kept,
    /// Turn had no text and was removed
    Discarded,
    /// No assistant turn was open
    NothingOpen,
}

/// Ordered turns with at most one open assistant turn
///
/// The first turn is always the system prompt.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
    open: Option<usize>,
}

impl ConversationHistory {
    /// Start a history with the fixed system turn
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::new(Role::System, system_prompt)],
            open: None,
        }
    }

    /// Append a finished user turn
    pub fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::user(text));
    }

    /// Open a new, empty assistant turn
    ///
    /// Any turn still open is closed first.
    pub fn open_assistant(&mut self) {
        if self.open.is_some() {
            tracing::warn!("opening assistant turn while another is open");
            self.close_open();
        }
        self.turns.push(Turn::new(Role::Assistant, String::new()));
        self.open = Some(self.turns.len() - 1);
    }

    /// Append generated text to the open assistant turn
    ///
    /// Returns false if no turn is open.
    pub fn append_to_open(&mut self, text: &str) -> bool {
        match self.open.and_then(|i| self.turns.get_mut(i)) {
            Some(turn) => {
                turn.text.push_str(text);
                true
            }
            None => false,
        }
    }

    /// Close the open assistant turn as complete
    pub fn close_open(&mut self) -> Closed {
        self.finish_open(false)
    }

    /// Close the open assistant turn as interrupted
    ///
    /// Non-empty text gets [`INTERRUPTION_MARKER`] appended. Because the turn
    /// is closed afterwards, repeating the call cannot add a second marker.
    pub fn interrupt_open(&mut self) -> Closed {
        self.finish_open(true)
    }

    fn finish_open(&mut self, interrupted: bool) -> Closed {
        let Some(index) = self.open.take() else {
            return Closed::NothingOpen;
        };

        let is_empty = self.turns.get(index).is_none_or(|t| t.text.is_empty());
        if is_empty {
            self.turns.remove(index);
            return Closed::Discarded;
        }

        if let Some(turn) = self.turns.get_mut(index) {
            if interrupted {
                turn.text.push_str(INTERRUPTION_MARKER);
                turn.interrupted = true;
            }
        }
        Closed::Kept
    }

    /// Whether an assistant turn is currently open
    #[must_use]
    pub const fn has_open(&self) -> bool {
        self.open.is_some()
    }

    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Copy of the turns for handing to a generator
    #[must_use]
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Always false: the system turn is present from creation
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
