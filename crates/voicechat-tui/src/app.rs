use ratatui::layout::Rect;
use tokio::sync::mpsc;
use voicechat_core::api::{ChatReply, SaasBranding};
use voicechat_core::presenter::ScrollState;
use voicechat_core::{BackendClient, ChatMessage, DeliveryHandle, DeliveryStatus, Profile};

use crate::tui::AppEvent;

/// Pixel height of one terminal row, for the follow tolerance.
pub const ROW_HEIGHT_PX: u32 = 16;

pub const DEFAULT_WELCOME: &str =
    "Hallo! Schreiben Sie mir hier oder starten Sie mit Ctrl-V einen Anruf.";

/// The scrollable conversation panel.
///
/// Scroll position is kept in pixels so the follow tolerance applies the same
/// way it does on a web page; rendering converts back to rows.
pub struct ChatView {
    welcome: String,
    entries: Vec<ChatMessage>,
    pending: bool,
    scroll: ScrollState,
    width: u16,
}

impl ChatView {
    pub fn new(welcome: &str) -> Self {
        Self {
            welcome: welcome.to_string(),
            entries: Vec::new(),
            pending: false,
            scroll: ScrollState::default(),
            width: 0,
        }
    }

    pub fn welcome(&self) -> &str {
        &self.welcome
    }

    pub fn set_welcome(&mut self, welcome: &str) {
        self.welcome = welcome.to_string();
        self.refresh_height();
    }

    pub fn entries(&self) -> &[ChatMessage] {
        &self.entries
    }

    pub fn push(&mut self, entry: ChatMessage) {
        self.entries.push(entry);
        self.refresh_height();
    }

    /// Drops every entry; the welcome stays.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.refresh_height();
        self.scroll.scroll_to_bottom();
    }

    /// Inner size of the chat panel, in rows and columns.
    pub fn resize(&mut self, width: u16, height: u16) {
        if self.width == width && self.scroll.viewport_height == height as u32 * ROW_HEIGHT_PX {
            return;
        }
        let following = self.scroll.is_following();
        self.width = width;
        self.scroll.viewport_height = height as u32 * ROW_HEIGHT_PX;
        self.refresh_height();
        self.scroll.autoscroll(following);
    }

    pub fn autoscroll(&mut self, force: bool) -> bool {
        self.refresh_height();
        self.scroll.autoscroll(force)
    }

    pub fn set_pending(&mut self, pending: bool) {
        self.pending = pending;
        self.refresh_height();
    }

    pub fn scroll_rows(&mut self, rows: i64) {
        self.scroll.scroll_by(rows * ROW_HEIGHT_PX as i64);
    }

    pub fn page(&mut self, pages: i64) {
        let rows = (self.scroll.viewport_height / ROW_HEIGHT_PX).saturating_sub(1).max(1);
        self.scroll_rows(pages * rows as i64);
    }

    /// First visible row.
    pub fn scroll_row(&self) -> u16 {
        (self.scroll.offset / ROW_HEIGHT_PX).min(u16::MAX as u32) as u16
    }

    pub fn is_following(&self) -> bool {
        self.scroll.is_following()
    }

    fn refresh_height(&mut self) {
        let rows = self.total_rows();
        self.scroll.content_height = rows * ROW_HEIGHT_PX;
        if self.scroll.offset > self.scroll.max_offset() {
            self.scroll.scroll_to_bottom();
        }
    }

    /// Rows the panel needs: a role line, the wrapped content and a blank
    /// line per entry, the welcome counted as one more entry.
    fn total_rows(&self) -> u32 {
        let wrap_width = if self.width > 0 { self.width as usize } else { 50 };
        let block_rows = |content: &str| -> u32 {
            let body: usize = content
                .lines()
                .map(|line| line.chars().count() / wrap_width + 1)
                .sum();
            (body.max(1) + 2) as u32
        };

        let mut rows = block_rows(&self.welcome);
        rows += self.entries.iter().map(|e| block_rows(&e.content)).sum::<u32>();
        if self.pending {
            rows += 2;
        }
        rows
    }
}

pub struct App {
    pub should_quit: bool,

    // Input line
    pub input: String,
    pub cursor: usize,

    pub chat: ChatView,
    pub chat_area: Option<Rect>,

    // Session
    pub backend: BackendClient,
    pub delivery: DeliveryHandle,
    pub status: DeliveryStatus,
    pub session_id: String,
    pub vapi_session_id: Option<String>,
    pub assistant_id: String,
    pub profile: Profile,
    pub registered: Option<bool>,
    pub company_name: Option<String>,

    // Request state
    pub chat_pending: bool,
    pub voice_active: bool,
    pub notice: Option<String>,
    pub animation_frame: u8,

    pub events: mpsc::UnboundedSender<AppEvent>,
}

pub struct AppParts {
    pub backend: BackendClient,
    pub delivery: DeliveryHandle,
    pub session_id: String,
    pub assistant_id: String,
    pub profile: Profile,
    pub events: mpsc::UnboundedSender<AppEvent>,
}

impl App {
    pub fn new(parts: AppParts) -> Self {
        let status = parts.delivery.status();
        Self {
            should_quit: false,
            input: String::new(),
            cursor: 0,
            chat: ChatView::new(DEFAULT_WELCOME),
            chat_area: None,
            backend: parts.backend,
            delivery: parts.delivery,
            status,
            session_id: parts.session_id,
            vapi_session_id: None,
            assistant_id: parts.assistant_id,
            company_name: parts.profile.company_name.clone(),
            profile: parts.profile,
            registered: None,
            chat_pending: false,
            voice_active: false,
            notice: None,
            animation_frame: 0,
            events: parts.events,
        }
    }

    /// Tick animation frame and pick up delivery status changes
    pub fn tick(&mut self) {
        if self.chat_pending {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
        self.status = self.delivery.status();
    }

    pub fn apply_branding(&mut self, branding: SaasBranding) {
        let welcome = [&branding.welcome_message, &branding.first_message]
            .into_iter()
            .find(|text| !text.trim().is_empty())
            .cloned();
        if let Some(welcome) = welcome {
            self.chat.set_welcome(&welcome);
        }
        if !branding.company_name.trim().is_empty() {
            self.company_name = Some(branding.company_name);
        }
    }

    pub fn start_chat(&mut self) {
        self.chat_pending = true;
        self.chat.set_pending(true);
        self.chat.autoscroll(true);
        self.delivery.set_chat_active(true);
    }

    pub fn finish_chat(&mut self, reply: Result<ChatReply, String>) {
        self.chat_pending = false;
        self.chat.set_pending(false);
        self.delivery.set_chat_active(false);

        match reply {
            Ok(reply) => {
                if let Some(session_id) = reply.session_id.filter(|id| !id.is_empty()) {
                    self.vapi_session_id = Some(session_id);
                }
                if reply.message.trim().is_empty() {
                    log::warn!("Chat reply without a message");
                } else {
                    self.delivery.record(ChatMessage::assistant(reply.message));
                }
                self.notice = None;
            }
            Err(e) => {
                log::warn!("Chat request failed: {}", e);
                self.notice = Some(format!("Chat failed: {}", e));
            }
        }
    }

    pub fn finish_voice_session(&mut self, result: Result<String, String>) {
        match result {
            Ok(session_id) => {
                self.notice = Some(format!("Voice session {} active", session_id));
                self.vapi_session_id = Some(session_id);
            }
            Err(e) => {
                log::warn!("Could not start voice session: {}", e);
                self.notice = Some(format!("Voice session failed: {}", e));
                self.voice_active = false;
                self.delivery.set_voice_active(false);
            }
        }
    }

    pub fn header_title(&self) -> String {
        match &self.company_name {
            Some(name) => format!(" {} Voice Assistant ", name),
            None => " Voice Assistant ".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_with(rows: u16, entries: usize) -> ChatView {
        let mut view = ChatView::new("Hallo");
        view.resize(40, rows);
        for i in 0..entries {
            view.push(ChatMessage::assistant(format!("entry {}", i)));
        }
        view
    }

    #[test]
    fn test_rows_include_wrapping_and_welcome() {
        let mut view = ChatView::new("Hallo");
        view.resize(10, 5);
        // welcome: 3 rows; 25 chars at width 10: role + 3 + blank
        view.push(ChatMessage::user("a".repeat(25)));
        assert_eq!(view.total_rows(), 3 + 5);

        view.set_pending(true);
        assert_eq!(view.total_rows(), 3 + 5 + 2);
    }

    #[test]
    fn test_autoscroll_follows_from_bottom() {
        let mut view = view_with(10, 0);
        for i in 0..50 {
            view.push(ChatMessage::assistant(format!("entry {}", i)));
            assert!(view.autoscroll(false));
        }
        // 51 blocks of 3 rows, 10 visible
        assert_eq!(view.scroll_row(), 153 - 10);
    }

    #[test]
    fn test_reading_history_is_not_interrupted() {
        let mut view = view_with(10, 100);
        view.autoscroll(true);
        // 10 rows = 160px viewport, tolerance 640px = 40 rows
        view.scroll_rows(-60);
        let row = view.scroll_row();

        view.push(ChatMessage::assistant("new"));
        assert!(!view.autoscroll(false));
        assert_eq!(view.scroll_row(), row);

        assert!(view.autoscroll(true));
        assert!(view.scroll_row() > row);
    }

    #[test]
    fn test_within_tolerance_still_follows() {
        let mut view = view_with(10, 100);
        view.autoscroll(true);
        view.scroll_rows(-20);

        view.push(ChatMessage::assistant("new"));
        assert!(view.autoscroll(false));
        assert!(view.is_following());
    }

    #[test]
    fn test_clear_keeps_welcome() {
        let mut view = view_with(10, 20);
        view.clear();
        assert!(view.entries().is_empty());
        assert_eq!(view.welcome(), "Hallo");
        assert_eq!(view.scroll_row(), 0);
    }

    #[test]
    fn test_page_moves_by_viewport() {
        let mut view = view_with(10, 100);
        view.autoscroll(true);
        let bottom = view.scroll_row();
        view.page(-1);
        assert_eq!(view.scroll_row(), bottom - 9);
    }
}
