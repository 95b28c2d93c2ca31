use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    error::GenerationError,
    llm::LanguageModel,
    models::{ChatRole, ChatTurn, GenerationOptions, Scenario},
};

pub const CHAT_FALLBACK_REPLY: &str = "The connection flickered and the reply was lost. Please try again.";

/// Upper bound on the history carried between turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryBudget {
    pub max_turns: usize,
    pub max_chars: usize,
}

impl Default for HistoryBudget {
    fn default() -> Self {
        Self { max_turns: 12, max_chars: 8000 }
    }
}

#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: Uuid,
    pub scenario_id: String,
    turns: VecDeque<ChatTurn>,
}

impl ChatSession {
    pub fn new(scenario_id: impl Into<String>) -> Self {
        Self { id: Uuid::new_v4(), scenario_id: scenario_id.into(), turns: VecDeque::new() }
    }

    /// Keeps the session id but forgets the history, e.g. after the active scenario changed.
    pub fn restart(&mut self, scenario_id: impl Into<String>) {
        self.scenario_id = scenario_id.into();
        self.turns.clear();
    }

    pub fn turns(&self) -> impl Iterator<Item = &ChatTurn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Drops the oldest turns until the history fits the budget. A reply is
    /// never kept without the message it answered, so the history always
    /// starts with a visitor turn.
    fn enforce(&mut self, budget: &HistoryBudget) -> usize {
        let mut chars: usize = self.turns.iter().map(|t| t.content.len()).sum();
        let mut dropped = 0;
        while self.turns.len() > budget.max_turns
            || chars > budget.max_chars
            || self.turns.front().is_some_and(|t| t.role == ChatRole::Assistant)
        {
            let Some(oldest) = self.turns.pop_front() else { break };
            chars -= oldest.content.len();
            dropped += 1;
        }
        dropped
    }
}

/// In-memory chat sessions, capped at `max_sessions`. When full, the session
/// that has been idle longest is evicted.
pub struct SessionStore {
    sessions: RwLock<Sessions>,
    max_sessions: usize,
}

#[derive(Default)]
struct Sessions {
    /// Each entry carries the `clock` value of its last save.
    entries: HashMap<Uuid, (u64, ChatSession)>,
    clock: u64,
}

impl SessionStore {
    pub fn new(max_sessions: usize) -> Self {
        Self { sessions: RwLock::default(), max_sessions: max_sessions.max(1) }
    }

    pub fn get(&self, id: &Uuid) -> Option<ChatSession> {
        self.sessions.read().entries.get(id).map(|(_, session)| session.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().entries.len()
    }

    /// Stores `session` as the most recently active one.
    pub fn save(&self, session: ChatSession) {
        let mut sessions = self.sessions.write();
        sessions.clock += 1;
        let stamp = sessions.clock;
        sessions.entries.insert(session.id, (stamp, session));
        while sessions.entries.len() > self.max_sessions {
            let idle = sessions.entries.iter().min_by_key(|(_, (seen, _))| *seen).map(|(id, _)| *id);
            let Some(idle) = idle else { break };
            sessions.entries.remove(&idle);
            debug!("🧹 Evicted idle chat session {}", idle);
        }
    }
}

pub struct ChatSynthesizer {
    model: Arc<dyn LanguageModel>,
    options: GenerationOptions,
    budget: HistoryBudget,
}

impl ChatSynthesizer {
    pub fn new(model: Arc<dyn LanguageModel>, options: GenerationOptions, budget: HistoryBudget) -> Self {
        Self { model, options, budget }
    }

    /// Sends `message` in character. On success both turns are recorded; on
    /// failure the session is left exactly as it was.
    pub async fn respond(
        &self,
        session: &mut ChatSession,
        scenario: &Scenario,
        message: &str,
    ) -> Result<String, GenerationError> {
        let prompt = build_chat_prompt(scenario, session, message);
        let reply = match self.model.generate(&prompt, &self.options).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("❌ Chat reply failed for session {}: {}", session.id, e);
                return Err(e);
            }
        };

        session.turns.push_back(ChatTurn::user(message));
        session.turns.push_back(ChatTurn::assistant(reply.clone()));
        let dropped = session.enforce(&self.budget);
        info!("💬 Session {} now holds {} turns ({} dropped)", session.id, session.len(), dropped);
        Ok(reply)
    }
}

pub fn build_chat_prompt(scenario: &Scenario, session: &ChatSession, message: &str) -> String {
    let mut transcript = String::new();
    for turn in session.turns() {
        let speaker = match turn.role {
            ChatRole::User => "Visitor",
            ChatRole::Assistant => "You",
        };
        transcript.push_str(&format!("{speaker}: {}\n", turn.content));
    }
    if transcript.is_empty() {
        transcript.push_str("(no earlier messages)\n");
    }

    format!(
        r#"You are a resident of an alternative internet and you chat with a visitor who is browsing it.
Stay fully in character, answer in plain text, keep replies short and conversational, and never mention that this world is fictional.

This is the scenario you live in:
```
{scenario}
```

Conversation so far:
{transcript}
Visitor: {message}
You:"#,
        scenario = scenario.full_description.trim(),
        message = message.trim(),
    )
}
