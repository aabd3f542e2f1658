//! Session-scoped, capped chat transcript persisted to local storage.

use anyhow::Result;

use crate::state::ChatMessage;
use crate::store::{LocalStore, MemoryStore};

/// Entries kept per session; also bounds the context sent to the backend.
pub const MAX_TRANSCRIPT_LEN: usize = 30;

/// Rendered in place of an empty transcript. The backend treats an empty
/// string as an absent field.
pub const EMPTY_CONTEXT_PLACEHOLDER: &str = "Keine vorherigen Nachrichten";

/// Turns sent as the shorter `conversation_context` alongside the full history.
pub const CONVERSATION_CONTEXT_TURNS: usize = 10;

const KEY_PREFIX: &str = "chatHistory_";

/// Transcript excerpts seeded into chat and voice requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationContext {
    pub chat_history: String,
    pub conversation_context: String,
}

pub fn storage_key(session_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, session_id)
}

/// Session id of the most recently written transcript, if any.
pub fn latest_session_id(store: &dyn LocalStore) -> Result<Option<String>> {
    Ok(store
        .latest_with_prefix(KEY_PREFIX)?
        .and_then(|(key, _)| key.strip_prefix(KEY_PREFIX).map(str::to_string)))
}

pub struct TranscriptStore {
    session_id: String,
    messages: Vec<ChatMessage>,
    store: Box<dyn LocalStore>,
    persistent: bool,
}

impl TranscriptStore {
    /// Load the transcript for `session_id`.
    ///
    /// Falls back to the most recently written transcript of any other
    /// session when this one has nothing stored yet.
    pub fn load(store: Box<dyn LocalStore>, session_id: &str) -> Self {
        let mut transcript = Self {
            session_id: session_id.to_string(),
            messages: Vec::new(),
            store,
            persistent: true,
        };

        let own = match transcript.store.get(&storage_key(session_id)) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Failed to read transcript for session {}: {}", session_id, e);
                None
            }
        };

        let raw = match own {
            Some(raw) => Some(raw),
            None => match transcript.store.latest_with_prefix(KEY_PREFIX) {
                Ok(Some((key, raw))) => {
                    log::info!("No transcript for session {}, adopting {}", session_id, key);
                    Some(raw)
                }
                Ok(None) => None,
                Err(e) => {
                    log::warn!("Failed to look up previous transcripts: {}", e);
                    None
                }
            },
        };

        if let Some(raw) = raw {
            match serde_json::from_str::<Vec<ChatMessage>>(&raw) {
                Ok(mut messages) => {
                    let excess = messages.len().saturating_sub(MAX_TRANSCRIPT_LEN);
                    messages.drain(..excess);
                    transcript.messages = messages;
                }
                Err(e) => log::warn!("Discarding unreadable transcript: {}", e),
            }
        }

        transcript
    }

    /// A transcript that never touches disk.
    pub fn in_memory(session_id: &str) -> Self {
        Self::load(Box::new(MemoryStore::new()), session_id)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// False once a storage write has failed.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn append(&mut self, message: ChatMessage) -> &[ChatMessage] {
        self.messages.push(message);
        if self.messages.len() > MAX_TRANSCRIPT_LEN {
            let excess = self.messages.len() - MAX_TRANSCRIPT_LEN;
            self.messages.drain(..excess);
        }
        self.persist();
        &self.messages
    }

    /// Empties the transcript. The caller resets whatever is on screen.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.persist();
    }

    /// The last `n` entries as `Role: content` lines.
    pub fn render_context(&self, n: usize) -> String {
        let n = n.min(MAX_TRANSCRIPT_LEN);
        if self.messages.is_empty() || n == 0 {
            return EMPTY_CONTEXT_PLACEHOLDER.to_string();
        }

        let start = self.messages.len().saturating_sub(n);
        self.messages[start..]
            .iter()
            .map(|m| format!("{}: {}", m.role.label(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn conversation_context(&self) -> ConversationContext {
        ConversationContext {
            chat_history: self.render_context(MAX_TRANSCRIPT_LEN),
            conversation_context: self.render_context(CONVERSATION_CONTEXT_TURNS),
        }
    }

    fn persist(&mut self) {
        if !self.persistent {
            return;
        }

        let result = serde_json::to_string(&self.messages)
            .map_err(anyhow::Error::from)
            .and_then(|json| self.store.set(&storage_key(&self.session_id), &json));

        if let Err(e) = result {
            log::warn!(
                "Failed to persist transcript for session {}, continuing in memory: {}",
                self.session_id,
                e
            );
            self.persistent = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ChatRole, MessageSource};
    use anyhow::anyhow;

    fn msg(i: usize) -> ChatMessage {
        ChatMessage::user(format!("message {}", i))
    }

    struct FailingStore;

    impl LocalStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }
        fn set(&mut self, _key: &str, _value: &str) -> Result<()> {
            Err(anyhow!("quota exceeded"))
        }
        fn latest_with_prefix(&self, _prefix: &str) -> Result<Option<(String, String)>> {
            Ok(None)
        }
    }

    #[test]
    fn test_append_caps_at_thirty_keeping_most_recent() {
        let mut transcript = TranscriptStore::in_memory("s1");
        for i in 0..45 {
            transcript.append(msg(i));
            assert!(transcript.len() <= MAX_TRANSCRIPT_LEN);
        }
        let contents: Vec<&str> = transcript.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents.first(), Some(&"message 15"));
        assert_eq!(contents.last(), Some(&"message 44"));
        assert_eq!(contents.len(), 30);
    }

    #[test]
    fn test_render_context_empty_placeholder() {
        let transcript = TranscriptStore::in_memory("s1");
        assert_eq!(transcript.render_context(30), "Keine vorherigen Nachrichten");
    }

    #[test]
    fn test_render_context_last_n() {
        let mut transcript = TranscriptStore::in_memory("s1");
        transcript.append(ChatMessage::user("Hallo"));
        transcript.append(ChatMessage::assistant("Wie kann ich helfen?"));
        transcript.append(ChatMessage::new(ChatRole::User, "Termin bitte", MessageSource::Voice));

        assert_eq!(
            transcript.render_context(2),
            "Assistant: Wie kann ich helfen?\nUser: Termin bitte"
        );
        assert_eq!(transcript.render_context(100).lines().count(), 3);
    }

    #[test]
    fn test_conversation_context_lengths() {
        let mut transcript = TranscriptStore::in_memory("s1");
        for i in 0..31 {
            transcript.append(msg(i));
        }
        let context = transcript.conversation_context();
        assert_eq!(context.chat_history.lines().count(), 30);
        assert!(context.chat_history.starts_with("User: message 1\n"));
        assert_eq!(context.conversation_context.lines().count(), 10);
        assert!(context.conversation_context.ends_with("User: message 30"));
    }

    #[test]
    fn test_load_reads_persisted_session() {
        let mut store = MemoryStore::new();
        let saved = vec![ChatMessage::user("persisted")];
        store
            .set(&storage_key("s1"), &serde_json::to_string(&saved).unwrap())
            .unwrap();

        let transcript = TranscriptStore::load(Box::new(store), "s1");
        assert_eq!(transcript.messages(), saved.as_slice());
    }

    #[test]
    fn test_load_adopts_most_recent_prior_session() {
        let mut store = MemoryStore::new();
        let older = vec![ChatMessage::user("older")];
        let newer = vec![ChatMessage::user("newer")];
        store.set(&storage_key("a"), &serde_json::to_string(&older).unwrap()).unwrap();
        store.set(&storage_key("b"), &serde_json::to_string(&newer).unwrap()).unwrap();

        let transcript = TranscriptStore::load(Box::new(store), "fresh");
        assert_eq!(transcript.session_id(), "fresh");
        assert_eq!(transcript.messages()[0].content, "newer");
    }

    #[test]
    fn test_latest_session_id_strips_prefix() {
        let mut store = MemoryStore::new();
        assert_eq!(latest_session_id(&store).unwrap(), None);
        store.set(&storage_key("a"), "[]").unwrap();
        store.set(&storage_key("browser_b"), "[]").unwrap();
        assert_eq!(latest_session_id(&store).unwrap().as_deref(), Some("browser_b"));
    }

    #[test]
    fn test_load_empty_without_any_history() {
        let transcript = TranscriptStore::in_memory("s1");
        assert!(transcript.is_empty());
    }

    #[test]
    fn test_unreadable_transcript_is_discarded() {
        let mut store = MemoryStore::new();
        store.set(&storage_key("s1"), "{not json").unwrap();
        let transcript = TranscriptStore::load(Box::new(store), "s1");
        assert!(transcript.is_empty());
    }

    #[test]
    fn test_storage_failure_degrades_to_memory() {
        let mut transcript = TranscriptStore::load(Box::new(FailingStore), "s1");
        transcript.append(msg(1));
        transcript.append(msg(2));
        assert_eq!(transcript.len(), 2);
        assert!(!transcript.is_persistent());
    }

    #[test]
    fn test_clear_persists_empty_transcript() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = crate::store::FileStore::open(dir.path()).unwrap();
        let mut transcript = TranscriptStore::load(Box::new(store), "s1");
        transcript.append(msg(1));
        transcript.clear();
        assert!(transcript.is_empty());

        let reopened = TranscriptStore::load(
            Box::new(crate::store::FileStore::open(dir.path()).unwrap()),
            "s1",
        );
        assert!(reopened.is_empty());
    }
}
