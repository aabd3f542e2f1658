use std::io::Write;
use chrono::Local;
use tokio::sync::mpsc;
use voicechat_core::{ChatMessage, Presenter};

use crate::tui::AppEvent;

/// Forwards presenter calls to the UI loop, which owns the chat view.
pub struct TuiPresenter {
    tx: mpsc::UnboundedSender<AppEvent>,
}

impl TuiPresenter {
    pub fn new(tx: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: AppEvent) {
        // the UI loop is gone during shutdown
        let _ = self.tx.send(event);
    }
}

impl Presenter for TuiPresenter {
    fn render(&mut self, entry: &ChatMessage) {
        self.send(AppEvent::Render(entry.clone()));
    }

    fn autoscroll(&mut self, force: bool) {
        self.send(AppEvent::Autoscroll(force));
    }

    fn clear(&mut self) {
        self.send(AppEvent::ClearChat);
    }
}

/// Prints one tagged line per entry, for `watch`.
pub struct ConsolePresenter<W: Write> {
    out: W,
}

impl ConsolePresenter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> ConsolePresenter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

pub fn format_entry(entry: &ChatMessage) -> String {
    format!(
        "[{}] [{}] {}: {}",
        entry.timestamp.with_timezone(&Local).format("%H:%M:%S"),
        entry.source.tag(),
        entry.role.label(),
        entry.content
    )
}

impl<W: Write> Presenter for ConsolePresenter<W> {
    fn render(&mut self, entry: &ChatMessage) {
        if let Err(e) = writeln!(self.out, "{}", format_entry(entry)) {
            log::warn!("Failed to print message: {}", e);
        }
    }

    // a terminal stream always shows the newest line
    fn autoscroll(&mut self, _force: bool) {
        let _ = self.out.flush();
    }

    fn clear(&mut self) {
        let _ = writeln!(self.out, "--- conversation cleared ---");
    }
}
