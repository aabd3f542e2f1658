use regex::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;

use crate::state::{ChatMessage, ChatRole};

/// How long a delivered `(role, content)` pair suppresses repeats.
pub const DEDUP_WINDOW: Duration = Duration::from_millis(10_000);

fn whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// Trimmed, lowercased, whitespace runs collapsed to one space.
pub fn normalize_content(content: &str) -> String {
    whitespace()
        .replace_all(content.trim(), " ")
        .to_lowercase()
}

/// Content-based duplicate filter over a sliding time window.
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    seen: VecDeque<(Instant, ChatRole, String)>,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _, _)) = self.seen.front() {
            if now.saturating_duration_since(*at) >= self.window {
                self.seen.pop_front();
            } else {
                break;
            }
        }
    }

    /// True if an equivalent message was seen within the window. Otherwise
    /// the message is remembered and false is returned.
    pub fn is_duplicate(&mut self, message: &ChatMessage, now: Instant) -> bool {
        self.prune(now);
        let key = normalize_content(&message.content);
        if self
            .seen
            .iter()
            .any(|(_, role, content)| *role == message.role && *content == key)
        {
            return true;
        }
        self.seen.push_back((now, message.role, key));
        false
    }

    /// Remember a message without checking it.
    pub fn remember(&mut self, message: &ChatMessage, now: Instant) {
        self.prune(now);
        self.seen
            .push_back((now, message.role, normalize_content(&message.content)));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize_content("  Hallo\n\tWELT  "), "hallo welt");
    }

    #[test]
    fn test_duplicate_within_window() {
        let start = Instant::now();
        let mut dedup = DedupWindow::default();
        let msg = ChatMessage::assistant("Termin ist gebucht");
        let echo = ChatMessage::assistant("termin  ist gebucht ");

        assert!(!dedup.is_duplicate(&msg, start));
        assert!(dedup.is_duplicate(&echo, start + Duration::from_millis(9_999)));
    }

    #[test]
    fn test_expires_after_window() {
        let start = Instant::now();
        let mut dedup = DedupWindow::default();
        let msg = ChatMessage::assistant("ok");

        assert!(!dedup.is_duplicate(&msg, start));
        assert!(!dedup.is_duplicate(&msg, start + Duration::from_millis(10_000)));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_role_is_part_of_key() {
        let start = Instant::now();
        let mut dedup = DedupWindow::default();
        assert!(!dedup.is_duplicate(&ChatMessage::user("ja"), start));
        assert!(!dedup.is_duplicate(&ChatMessage::assistant("ja"), start));
    }

    #[test]
    fn test_remembered_messages_suppress_echoes() {
        let start = Instant::now();
        let mut dedup = DedupWindow::default();
        dedup.remember(&ChatMessage::assistant("Done."), start);
        assert!(dedup.is_duplicate(&ChatMessage::assistant("done."), start));
    }
}
