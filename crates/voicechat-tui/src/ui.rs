use ratatui::{
    Frame,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph, Wrap},
};
use voicechat_core::{ChatMessage, ChatRole, DeliveryPhase, MessageSource};
use crate::app::App;

/// Styles `**bold**` runs; an unmatched `**` stays literal.
fn parse_markdown_line(text: &str) -> Line<'static> {
    let parts: Vec<&str> = text.split("**").collect();
    // an even part count means the last `**` never closed
    let unclosed = parts.len() % 2 == 0;

    let mut spans: Vec<Span<'static>> = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        let is_last = i == parts.len() - 1;
        if i % 2 == 1 && !(unclosed && is_last) && !part.is_empty() {
            spans.push(Span::styled(
                part.to_string(),
                Style::default().add_modifier(Modifier::BOLD),
            ));
        } else if i % 2 == 1 {
            spans.push(Span::raw(format!("**{}", part)));
        } else if !part.is_empty() {
            spans.push(Span::raw(part.to_string()));
        }
    }

    if spans.is_empty() {
        Line::default()
    } else {
        Line::from(spans)
    }
}

fn source_color(source: MessageSource) -> Color {
    match source {
        MessageSource::Chat => Color::DarkGray,
        MessageSource::Voice => Color::Green,
        MessageSource::VoiceFunction => Color::Magenta,
    }
}

fn entry_lines(entry: &ChatMessage) -> Vec<Line<'static>> {
    let (label, color) = match entry.role {
        ChatRole::User => ("You:", Color::Cyan),
        ChatRole::Assistant => ("Assistant:", Color::Yellow),
    };

    let mut lines = vec![Line::from(vec![
        Span::styled(
            format!("[{}] ", entry.source.tag()),
            Style::default().fg(source_color(entry.source)),
        ),
        Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
    ])];
    match entry.role {
        ChatRole::User => lines.extend(entry.content.lines().map(|l| Line::from(l.to_string()))),
        ChatRole::Assistant => lines.extend(entry.content.lines().map(parse_markdown_line)),
    }
    lines.push(Line::default());
    lines
}

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    let [header_area, chat_area, input_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(3),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);
    render_chat(app, frame, chat_area);
    render_input(app, frame, input_area);
    render_footer(app, frame, footer_area);
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let status = &app.status;
    let (phase_text, phase_color) = match status.phase {
        DeliveryPhase::Active => ("active", Color::Green),
        DeliveryPhase::Paused => ("paused", Color::Yellow),
        DeliveryPhase::Uninitialized => ("offline", Color::Red),
    };
    let link = if status.transport == "push" {
        if status.connected { " connected" } else { " connecting" }
    } else {
        ""
    };

    let mut spans = vec![
        Span::styled(app.header_title(), Style::default().fg(Color::Cyan).bold()),
        Span::styled(format!(" {} ", app.session_id), Style::default().fg(Color::Gray)),
        Span::styled(format!(" {}{} ", status.transport, link), Style::default().fg(Color::Gray)),
        Span::styled(format!(" {} ", phase_text), Style::default().fg(phase_color).bold()),
    ];
    if status.transport == "poll" && status.phase == DeliveryPhase::Active {
        spans.push(Span::styled(
            format!("every {}s ", status.poll_interval_ms / 1000),
            Style::default().fg(Color::Gray),
        ));
    }
    if app.voice_active {
        spans.push(Span::styled(" ● CALL ", Style::default().fg(Color::White).bg(Color::Red).bold()));
    }
    if app.registered == Some(false) {
        spans.push(Span::styled(" unregistered ", Style::default().fg(Color::Red)));
    }

    let header = Paragraph::new(Line::from(spans)).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn render_chat(app: &mut App, frame: &mut Frame, area: Rect) {
    app.chat_area = Some(area);
    app.chat
        .resize(area.width.saturating_sub(2), area.height.saturating_sub(2));

    let border_color = if app.chat.is_following() { Color::Cyan } else { Color::DarkGray };
    let title = if app.chat.is_following() {
        " Conversation ".to_string()
    } else {
        " Conversation (End to follow) ".to_string()
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(title);

    let mut lines: Vec<Line> = vec![
        Line::from(Span::styled(
            "Assistant:",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )),
        Line::from(Span::styled(
            app.chat.welcome().to_string(),
            Style::default().add_modifier(Modifier::ITALIC),
        )),
        Line::default(),
    ];
    for entry in app.chat.entries() {
        lines.extend(entry_lines(entry));
    }

    if app.chat_pending {
        lines.push(Line::from(Span::styled(
            "Assistant:",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )));
        // Animated ellipsis: cycles through ".", "..", "..."
        let dots = ".".repeat((app.animation_frame as usize) + 1);
        lines.push(Line::from(Span::styled(
            format!("Typing{}", dots),
            Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
        )));
    }

    let chat = Paragraph::new(Text::from(lines))
        .block(block)
        .wrap(Wrap { trim: true })
        .scroll((app.chat.scroll_row(), 0));

    frame.render_widget(chat, area);
}

fn render_input(app: &App, frame: &mut Frame, area: Rect) {
    let border_color = if app.chat_pending { Color::DarkGray } else { Color::Yellow };
    let input_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(" Message ");

    // Keep the cursor visible by scrolling the input horizontally
    let inner_width = area.width.saturating_sub(2) as usize;
    let scroll_offset = if inner_width == 0 || app.cursor < inner_width {
        0
    } else {
        app.cursor - inner_width + 1
    };

    let visible_text: String = app
        .input
        .chars()
        .skip(scroll_offset)
        .take(inner_width)
        .collect();

    let input = Paragraph::new(visible_text)
        .style(Style::default().fg(Color::Cyan))
        .block(input_block);
    frame.render_widget(input, area);

    let cursor_x = (app.cursor - scroll_offset) as u16;
    frame.set_cursor_position((area.x + cursor_x + 1, area.y + 1));
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let key_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let label_style = Style::default().bg(Color::Black).fg(Color::White);

    let mut spans = vec![
        Span::styled(" Enter ", key_style),
        Span::styled(" send ", label_style),
        Span::styled(" ^V ", key_style),
        Span::styled(if app.voice_active { " end call " } else { " call " }, label_style),
        Span::styled(" ^L ", key_style),
        Span::styled(" clear ", label_style),
        Span::styled(" PgUp/PgDn ", key_style),
        Span::styled(" scroll ", label_style),
        Span::styled(" End ", key_style),
        Span::styled(" follow ", label_style),
        Span::styled(" Esc ", key_style),
        Span::styled(" quit ", label_style),
    ];
    if let Some(notice) = &app.notice {
        spans.push(Span::styled(format!("  {}", notice), Style::default().fg(Color::Yellow)));
    }

    let footer = Paragraph::new(Line::from(spans)).style(Style::default().bg(Color::Black));
    frame.render_widget(footer, area);
}
