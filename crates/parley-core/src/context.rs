use serde::{Deserialize, Serialize};

use crate::history::{ContentPart, HistoryEntry, Role};

/// The complete input for one generation call.
#[derive(Clone, Debug, PartialEq)]
pub struct LlmRequest {
    pub system_instruction: Option<String>,
    pub turns: Vec<Turn>,
    pub options: GenerationOptions,
}

impl LlmRequest {
    /// Create an empty request (useful for testing).
    pub fn empty() -> Self {
        Self {
            system_instruction: None,
            turns: Vec::new(),
            options: GenerationOptions::default(),
        }
    }

    /// Build a request from trimmed history (oldest first) followed by the
    /// current round's user parts.
    pub fn from_history(
        system_instruction: Option<String>,
        history: &[HistoryEntry],
        current: Vec<ContentPart>,
        options: GenerationOptions,
    ) -> Self {
        let mut turns: Vec<Turn> = history.iter().map(Turn::from_entry).collect();
        if !current.is_empty() {
            turns.push(Turn {
                role: TurnRole::User,
                parts: current,
            });
        }
        Self {
            system_instruction,
            turns,
            options,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Model,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub parts: Vec<ContentPart>,
}

impl Turn {
    /// Tool results go back to the model on the user side of the exchange.
    pub fn from_entry(entry: &HistoryEntry) -> Self {
        let role = match entry.role {
            Role::Model => TurnRole::Model,
            Role::User | Role::Tool => TurnRole::User,
        };
        Self {
            role,
            parts: entry.parts.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerationOptions {
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub stop_sequences: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{EntryId, ThreadId};
    use chrono::Utc;

    fn entry(role: Role, text: &str) -> HistoryEntry {
        HistoryEntry {
            id: EntryId::new(),
            thread_id: ThreadId::from_raw("t"),
            role,
            parts: vec![ContentPart::text(text)],
            created_at: Utc::now(),
            token_cost: 1,
        }
    }

    #[test]
    fn tool_entries_map_to_user_turns() {
        let history = vec![
            entry(Role::User, "hi"),
            entry(Role::Model, "hello"),
            entry(Role::Tool, "{}"),
        ];
        let req = LlmRequest::from_history(None, &history, vec![], GenerationOptions::default());
        let roles: Vec<_> = req.turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![TurnRole::User, TurnRole::Model, TurnRole::User]);
    }

    #[test]
    fn current_parts_appended_last() {
        let history = vec![entry(Role::User, "old")];
        let req = LlmRequest::from_history(
            Some("sys".into()),
            &history,
            vec![ContentPart::text("new")],
            GenerationOptions::default(),
        );
        assert_eq!(req.turns.len(), 2);
        assert_eq!(req.turns[1].parts, vec![ContentPart::text("new")]);
        assert_eq!(req.system_instruction.as_deref(), Some("sys"));
    }

    #[test]
    fn empty_request() {
        let req = LlmRequest::empty();
        assert!(req.turns.is_empty());
        assert!(req.options.stop_sequences.is_empty());
    }
}
