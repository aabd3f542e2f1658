use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::state::ChatMessage;

/// Reads the backend inbox for a session, newest entry first.
#[async_trait]
pub trait InboxFetcher: Send + Sync {
    async fn fetch_inbox(&self, session_id: &str) -> Result<Vec<ChatMessage>>;
}

/// Periodic inbox checks, paced by the delivery policy.
#[derive(Clone)]
pub struct PollSource {
    fetcher: Arc<dyn InboxFetcher>,
}

impl PollSource {
    pub fn new(fetcher: Arc<dyn InboxFetcher>) -> Self {
        Self { fetcher }
    }

    pub async fn check(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        self.fetcher.fetch_inbox(session_id).await
    }
}

/// Entries of a newest-first inbox snapshot that lie beyond the
/// `delivered` high-water mark, oldest first, plus the new mark.
///
/// A snapshot shorter than the mark means the backend dropped its queue;
/// everything in it is then considered new.
pub fn slice_new_entries(
    snapshot: Vec<ChatMessage>,
    delivered: usize,
) -> (Vec<ChatMessage>, usize) {
    let total = snapshot.len();
    let fresh = if total >= delivered { total - delivered } else { total };

    let mut new_entries: Vec<ChatMessage> = snapshot.into_iter().take(fresh).collect();
    new_entries.reverse();
    (new_entries, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbox(contents: &[&str]) -> Vec<ChatMessage> {
        contents.iter().map(|c| ChatMessage::assistant(*c)).collect()
    }

    fn contents(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn test_slice_takes_unseen_oldest_first() {
        let (new_entries, mark) = slice_new_entries(inbox(&["c", "b", "a"]), 1);
        assert_eq!(contents(&new_entries), vec!["b", "c"]);
        assert_eq!(mark, 3);
    }

    #[test]
    fn test_slice_nothing_new() {
        let (new_entries, mark) = slice_new_entries(inbox(&["b", "a"]), 2);
        assert!(new_entries.is_empty());
        assert_eq!(mark, 2);
    }

    #[test]
    fn test_slice_resets_when_inbox_shrinks() {
        let (new_entries, mark) = slice_new_entries(inbox(&["z"]), 4);
        assert_eq!(contents(&new_entries), vec!["z"]);
        assert_eq!(mark, 1);
    }
}
