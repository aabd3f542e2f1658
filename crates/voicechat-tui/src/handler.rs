use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseEvent, MouseEventKind};
use ratatui::layout::Rect;
use voicechat_core::{ChatMessage, ChatRequest};

use crate::app::App;
use crate::tui::AppEvent;

/// Convert a character index to a byte index for UTF-8 safe string operations
fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

pub async fn handle_event(app: &mut App, event: AppEvent) -> Result<()> {
    match event {
        AppEvent::Key(key) => {
            app.delivery.mark_activity();
            handle_key(app, key).await?;
        }
        AppEvent::Mouse(mouse) => handle_mouse(app, mouse),
        AppEvent::Resize(_, _) => {}
        AppEvent::Tick => app.tick(),
        AppEvent::Render(entry) => app.chat.push(entry),
        AppEvent::Autoscroll(force) => {
            app.chat.autoscroll(force);
        }
        AppEvent::ClearChat => app.chat.clear(),
        AppEvent::ChatReply(reply) => app.finish_chat(reply),
        AppEvent::VoiceSession(result) => app.finish_voice_session(result),
        AppEvent::Registered(ok) => {
            app.registered = Some(ok);
            if !ok {
                app.notice = Some("Session not registered, tool results may not arrive".to_string());
            }
        }
        AppEvent::Branding(branding) => app.apply_branding(branding),
    }
    Ok(())
}

async fn handle_key(app: &mut App, key: KeyEvent) -> Result<()> {
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        match key.code {
            KeyCode::Char('c') => app.should_quit = true,
            KeyCode::Char('v') => toggle_voice(app).await,
            KeyCode::Char('l') => {
                app.delivery.clear();
                app.notice = Some("Conversation cleared".to_string());
            }
            _ => {}
        }
        return Ok(());
    }

    match key.code {
        KeyCode::Esc => app.should_quit = true,
        KeyCode::Enter => send_chat(app).await,
        KeyCode::PageUp => app.chat.page(-1),
        KeyCode::PageDown => app.chat.page(1),
        KeyCode::Up => app.chat.scroll_rows(-1),
        KeyCode::Down => app.chat.scroll_rows(1),
        KeyCode::Backspace => {
            if app.cursor > 0 {
                app.cursor -= 1;
                let byte_pos = char_to_byte_index(&app.input, app.cursor);
                app.input.remove(byte_pos);
            }
        }
        KeyCode::Delete => {
            let char_count = app.input.chars().count();
            if app.cursor < char_count {
                let byte_pos = char_to_byte_index(&app.input, app.cursor);
                app.input.remove(byte_pos);
            }
        }
        KeyCode::Left => {
            app.cursor = app.cursor.saturating_sub(1);
        }
        KeyCode::Right => {
            let char_count = app.input.chars().count();
            app.cursor = (app.cursor + 1).min(char_count);
        }
        KeyCode::Home => {
            app.cursor = 0;
        }
        KeyCode::End => {
            app.cursor = app.input.chars().count();
            app.chat.autoscroll(true);
        }
        KeyCode::Char(c) => {
            let byte_pos = char_to_byte_index(&app.input, app.cursor);
            app.input.insert(byte_pos, c);
            app.cursor += 1;
        }
        _ => {}
    }
    Ok(())
}

async fn send_chat(app: &mut App) {
    let message = app.input.trim().to_string();
    if message.is_empty() || app.chat_pending {
        return;
    }

    // context is taken before the new turn is recorded
    let Some(context) = app.delivery.context().await else {
        app.notice = Some("Delivery stopped, restart to continue".to_string());
        return;
    };

    app.input.clear();
    app.cursor = 0;
    app.delivery.record(ChatMessage::user(message.as_str()));
    app.start_chat();

    let request = ChatRequest::new(&message, &app.assistant_id, &app.session_id, context)
        .with_session(app.vapi_session_id.clone())
        .with_profile(app.profile.clone());
    let backend = app.backend.clone();
    let tx = app.events.clone();
    tokio::spawn(async move {
        let reply = backend.chat(&request).await.map_err(|e| e.to_string());
        let _ = tx.send(AppEvent::ChatReply(reply));
    });
}

async fn toggle_voice(app: &mut App) {
    app.voice_active = !app.voice_active;
    app.delivery.set_voice_active(app.voice_active);

    if !app.voice_active {
        app.notice = Some("Voice call ended".to_string());
        return;
    }

    app.notice = Some("Starting voice session...".to_string());
    let context = app.delivery.context().await;
    let backend = app.backend.clone();
    let profile = app.profile.clone();
    let tx = app.events.clone();
    tokio::spawn(async move {
        let result = backend
            .create_session(&profile, context.as_ref())
            .await
            .map_err(|e| e.to_string());
        let _ = tx.send(AppEvent::VoiceSession(result));
    });
}

fn point_in_rect(x: u16, y: u16, rect: Rect) -> bool {
    x >= rect.x && x < rect.x + rect.width && y >= rect.y && y < rect.y + rect.height
}

fn handle_mouse(app: &mut App, mouse: MouseEvent) {
    let in_chat = app
        .chat_area
        .map(|r| point_in_rect(mouse.column, mouse.row, r))
        .unwrap_or(false);
    if !in_chat {
        return;
    }

    match mouse.kind {
        MouseEventKind::ScrollDown => {
            app.delivery.mark_activity();
            app.chat.scroll_rows(3);
        }
        MouseEventKind::ScrollUp => {
            app.delivery.mark_activity();
            app.chat.scroll_rows(-3);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppParts;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use voicechat_core::{
        BackendClient, DeliveryClient, DeliveryTask, InboxSource, PollSource, Presenter, Profile,
        TranscriptStore,
    };
    use voicechat_core::delivery::InboxFetcher;

    struct EmptyInbox;

    #[async_trait]
    impl InboxFetcher for EmptyInbox {
        async fn fetch_inbox(&self, _session_id: &str) -> Result<Vec<ChatMessage>> {
            Ok(Vec::new())
        }
    }

    struct NullPresenter;

    impl Presenter for NullPresenter {
        fn render(&mut self, _entry: &ChatMessage) {}
        fn autoscroll(&mut self, _force: bool) {}
    }

    fn test_app() -> (App, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = DeliveryClient::new(
            TranscriptStore::in_memory("s1"),
            NullPresenter,
            tokio::time::Instant::now(),
        );
        let delivery = DeliveryTask::spawn(client, InboxSource::Poll(PollSource::new(Arc::new(EmptyInbox))));
        let app = App::new(AppParts {
            // nothing listens here; chat requests fail fast
            backend: BackendClient::new("http://127.0.0.1:9"),
            delivery,
            session_id: "s1".to_string(),
            assistant_id: "asst".to_string(),
            profile: Profile::default(),
            events: tx,
        });
        (app, rx)
    }

    fn key(code: KeyCode) -> AppEvent {
        AppEvent::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn ctrl(c: char) -> AppEvent {
        AppEvent::Key(KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL))
    }

    #[test]
    fn test_char_to_byte_index_utf8() {
        assert_eq!(char_to_byte_index("grüße", 3), 4);
        assert_eq!(char_to_byte_index("abc", 10), 3);
    }

    #[tokio::test]
    async fn test_editing_handles_multibyte_input() {
        let (mut app, _rx) = test_app();
        for c in "Grüße".chars() {
            handle_event(&mut app, key(KeyCode::Char(c))).await.unwrap();
        }
        handle_event(&mut app, key(KeyCode::Left)).await.unwrap();
        handle_event(&mut app, key(KeyCode::Backspace)).await.unwrap();
        assert_eq!(app.input, "Grüe");
        assert_eq!(app.cursor, 3);
    }

    #[tokio::test]
    async fn test_enter_records_turn_and_marks_chat_pending() {
        let (mut app, mut rx) = test_app();
        app.input = "Ich brauche einen Termin".to_string();
        app.cursor = app.input.chars().count();

        handle_event(&mut app, key(KeyCode::Enter)).await.unwrap();
        assert!(app.input.is_empty());
        assert!(app.chat_pending);

        // second Enter while waiting is ignored
        app.input = "noch was".to_string();
        handle_event(&mut app, key(KeyCode::Enter)).await.unwrap();
        assert_eq!(app.input, "noch was");

        let context = app.delivery.context().await.unwrap();
        assert_eq!(context.chat_history, "User: Ich brauche einen Termin");

        // the request fails against a closed port and reports back
        let reply = rx.recv().await.unwrap();
        assert!(matches!(reply, AppEvent::ChatReply(Err(_))));
        handle_event(&mut app, reply).await.unwrap();
        assert!(!app.chat_pending);
        assert!(app.notice.as_deref().unwrap_or("").starts_with("Chat failed"));
    }

    #[tokio::test]
    async fn test_chat_reply_is_recorded() {
        let (mut app, _rx) = test_app();
        app.start_chat();
        let reply = voicechat_core::ChatReply {
            message: "Gern, wann passt es Ihnen?".to_string(),
            session_id: Some("vapi-9".to_string()),
        };
        handle_event(&mut app, AppEvent::ChatReply(Ok(reply))).await.unwrap();

        assert_eq!(app.vapi_session_id.as_deref(), Some("vapi-9"));
        let context = app.delivery.context().await.unwrap();
        assert_eq!(context.chat_history, "Assistant: Gern, wann passt es Ihnen?");
    }

    #[tokio::test]
    async fn test_ctrl_l_clears_and_ctrl_c_quits() {
        let (mut app, _rx) = test_app();
        app.delivery.record(ChatMessage::user("hallo"));
        handle_event(&mut app, ctrl('l')).await.unwrap();
        let context = app.delivery.context().await.unwrap();
        assert_eq!(context.chat_history, "Keine vorherigen Nachrichten");

        handle_event(&mut app, ctrl('c')).await.unwrap();
        assert!(app.should_quit);
    }

    #[tokio::test]
    async fn test_failed_voice_session_resets_flag() {
        let (mut app, mut rx) = test_app();
        handle_event(&mut app, ctrl('v')).await.unwrap();
        assert!(app.voice_active);

        let result = rx.recv().await.unwrap();
        assert!(matches!(result, AppEvent::VoiceSession(Err(_))));
        handle_event(&mut app, result).await.unwrap();
        assert!(!app.voice_active);
    }
}
