use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph, Wrap},
};
use sandchat_core::markdown::{self, plain_text, render_message, Inline, MarkdownVisitor};
use sandchat_core::preview::SANDBOX_PERMISSIONS;
use sandchat_core::{ChatMessage, ChatRole};
use crate::app::{App, InputMode};

/// Lines of each source shown in the preview panel.
const PREVIEW_SNIPPET_LINES: usize = 6;

/// Renders markdown blocks into styled terminal lines.
pub struct LineRenderer;

impl MarkdownVisitor for LineRenderer {
    type Output = Vec<Line<'static>>;

    fn heading(&mut self, level: u8, content: &[Inline]) -> Self::Output {
        let style = match level {
            1 => Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD | Modifier::UNDERLINED),
            2 => Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            _ => Style::default().add_modifier(Modifier::BOLD),
        };
        inline_lines(content, style)
    }

    fn paragraph(&mut self, content: &[Inline]) -> Self::Output {
        inline_lines(content, Style::default())
    }

    fn code_block(&mut self, language: Option<&str>, code: &str) -> Self::Output {
        let border = Style::default().fg(Color::DarkGray);
        let badge = language.filter(|l| !l.is_empty()).unwrap_or("text");

        let mut lines = vec![Line::from(vec![
            Span::styled("╭─", border),
            Span::styled(
                format!(" {} ", badge),
                Style::default().bg(Color::DarkGray).fg(Color::White).bold(),
            ),
        ])];
        for code_line in code.lines() {
            lines.push(Line::from(vec![
                Span::styled("│ ", border),
                Span::styled(code_line.to_string(), Style::default().fg(Color::LightGreen)),
            ]));
        }
        lines.push(Line::from(Span::styled("╰─", border)));
        lines
    }

    fn list(&mut self, start: Option<u64>, items: Vec<Vec<Self::Output>>) -> Self::Output {
        let marker_style = Style::default().fg(Color::Yellow);
        let mut lines = Vec::new();

        for (i, item) in items.into_iter().enumerate() {
            let marker = match start {
                Some(n) => format!("{}. ", n + i as u64),
                None => "• ".to_string(),
            };
            let indent = " ".repeat(marker.chars().count());

            let mut item_lines = item.into_iter().flatten().peekable();
            if item_lines.peek().is_none() {
                lines.push(Line::from(Span::styled(marker, marker_style)));
                continue;
            }
            let mut first = true;
            for line in item_lines {
                let prefix = if first {
                    Span::styled(marker.clone(), marker_style)
                } else {
                    Span::raw(indent.clone())
                };
                first = false;
                lines.push(prefixed(prefix, line));
            }
        }
        lines
    }

    fn block_quote(&mut self, children: Vec<Self::Output>) -> Self::Output {
        let bar = Style::default().fg(Color::DarkGray);
        children
            .into_iter()
            .flatten()
            .map(|line| {
                prefixed(Span::styled("▎ ", bar), line)
                    .patch_style(Style::default().fg(Color::Gray).add_modifier(Modifier::ITALIC))
            })
            .collect()
    }

    fn rule(&mut self) -> Self::Output {
        vec![Line::from(Span::styled(
            "─".repeat(24),
            Style::default().fg(Color::DarkGray),
        ))]
    }
}

fn prefixed(prefix: Span<'static>, line: Line<'static>) -> Line<'static> {
    let mut spans = Vec::with_capacity(line.spans.len() + 1);
    spans.push(prefix);
    spans.extend(line.spans);
    Line::from(spans)
}

/// Inline nodes as lines; hard breaks start a new line.
fn inline_lines(content: &[Inline], style: Style) -> Vec<Line<'static>> {
    let mut lines: Vec<Vec<Span<'static>>> = vec![Vec::new()];
    push_inlines(content, style, &mut lines);
    lines.into_iter().map(Line::from).collect()
}

fn push_inlines(content: &[Inline], style: Style, lines: &mut Vec<Vec<Span<'static>>>) {
    for inline in content {
        match inline {
            Inline::Text(text) => push_span(lines, Span::styled(text.clone(), style)),
            Inline::Code(code) => push_span(
                lines,
                Span::styled(code.clone(), style.fg(Color::LightYellow).bg(Color::Black)),
            ),
            Inline::Strong(children) => push_inlines(children, style.add_modifier(Modifier::BOLD), lines),
            Inline::Emphasis(children) => push_inlines(children, style.add_modifier(Modifier::ITALIC), lines),
            Inline::Strikethrough(children) => {
                push_inlines(children, style.add_modifier(Modifier::CROSSED_OUT), lines)
            }
            Inline::Link { url, content } => {
                push_inlines(content, style.fg(Color::Blue).add_modifier(Modifier::UNDERLINED), lines);
                if plain_text(content) != *url {
                    push_span(lines, Span::styled(format!(" <{}>", url), Style::default().fg(Color::DarkGray)));
                }
            }
            Inline::SoftBreak => push_span(lines, Span::styled(" ", style)),
            Inline::HardBreak => lines.push(Vec::new()),
        }
    }
}

fn push_span(lines: &mut Vec<Vec<Span<'static>>>, span: Span<'static>) {
    if let Some(line) = lines.last_mut() {
        line.push(span);
    }
}

/// Rendered blocks as lines, with a blank line between blocks.
fn block_lines(blocks: &[markdown::Block]) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    for (i, block) in markdown::render(blocks, &mut LineRenderer).into_iter().enumerate() {
        if i > 0 {
            lines.push(Line::default());
        }
        lines.extend(block);
    }
    lines
}

/// Mask all but the last four characters of an API key.
fn mask_key(key: &str) -> String {
    let len = key.chars().count();
    if len == 0 {
        String::new()
    } else if len <= 4 {
        "*".repeat(len)
    } else {
        let masked_len = len - 4;
        let last_four: String = key.chars().skip(masked_len).collect();
        format!("{}...{}", "*".repeat(masked_len.min(20)), last_four)
    }
}

/// Rows needed to show `lines` wrapped at `width` columns.
fn wrapped_height(lines: &[Line], width: u16) -> u16 {
    let width = width.max(1) as usize;
    let rows: usize = lines
        .iter()
        .map(|line| line.width().div_ceil(width).max(1))
        .sum();
    rows.min(u16::MAX as usize) as u16
}

fn message_lines(
    message: &ChatMessage,
    index: usize,
    preview_index: Option<usize>,
) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    let rendered = render_message(&message.content);

    match message.role {
        ChatRole::User => {
            lines.push(
                Line::from(Span::styled(
                    "You:",
                    Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
                ))
                .alignment(Alignment::Right),
            );
            for line in block_lines(&rendered.blocks) {
                lines.push(line.alignment(Alignment::Right));
            }
        }
        ChatRole::Assistant => {
            lines.push(Line::from(Span::styled(
                "AI:",
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            )));
            lines.extend(block_lines(&rendered.blocks));
        }
        ChatRole::Function => {
            let name = message.name.as_deref().unwrap_or("function");
            lines.push(Line::from(Span::styled(
                format!("⚙ {}:", name),
                Style::default().fg(Color::Magenta).add_modifier(Modifier::BOLD),
            )));
            for line in message.content.lines() {
                lines.push(Line::from(Span::styled(
                    line.to_string(),
                    Style::default().fg(Color::DarkGray),
                )));
            }
        }
        ChatRole::System => {
            lines.push(Line::from(Span::styled(
                "System:",
                Style::default().fg(Color::DarkGray).add_modifier(Modifier::BOLD),
            )));
            lines.push(Line::from(Span::styled(
                message.content.clone(),
                Style::default().fg(Color::DarkGray),
            )));
        }
    }

    if message.role != ChatRole::Function && rendered.bundle.is_some() {
        let marker = if preview_index == Some(index) {
            Line::from(vec![
                Span::styled("▸ Preview ready ", Style::default().fg(Color::Green).bold()),
                Span::styled("(p: sandboxed, o: new tab)", Style::default().fg(Color::DarkGray)),
            ])
        } else {
            Line::from(Span::styled("▸ Previewable code", Style::default().fg(Color::DarkGray)))
        };
        let marker = if message.role == ChatRole::User {
            marker.alignment(Alignment::Right)
        } else {
            marker
        };
        lines.push(marker);
    }

    lines.push(Line::default());
    lines
}

fn chat_lines(app: &App) -> Vec<Line<'static>> {
    let transcript = app.controller.transcript();
    let preview_index = app.preview.as_ref().map(|(i, _)| *i);

    if transcript.is_empty() && !app.controller.is_streaming() {
        let hint = if app.has_api_key() {
            "Ask for a page, a widget or some JavaScript..."
        } else {
            "Enter your xAI API key to start chatting."
        };
        return vec![Line::from(Span::styled(hint, Style::default().fg(Color::DarkGray)))];
    }

    let mut lines: Vec<Line<'static>> = Vec::new();
    for (i, message) in transcript.messages().iter().enumerate() {
        lines.extend(message_lines(message, i, preview_index));
    }

    let replying = transcript
        .last()
        .map(|m| m.role == ChatRole::Assistant)
        .unwrap_or(false);
    if app.controller.is_streaming() && (!replying || app.controller.pending_call().is_some()) {
        // Animated ellipsis: cycles through ".", "..", "..."
        let dots = ".".repeat((app.animation_frame as usize) + 1);
        let label = match app.controller.pending_call() {
            Some(name) => format!("Calling {}{}", name, dots),
            None => format!("Thinking{}", dots),
        };
        if !replying {
            lines.push(Line::from(Span::styled(
                "AI:",
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            )));
        }
        lines.push(Line::from(Span::styled(
            label,
            Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
        )));
    }

    lines
}

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    // Main layout: header, body, input, footer
    let [header_area, body_area, input_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(3),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);

    if app.show_preview_panel && app.preview.is_some() {
        let [chat_area, preview_area] = Layout::horizontal([
            Constraint::Percentage(60),
            Constraint::Percentage(40),
        ])
        .areas(body_area);
        render_chat(app, frame, chat_area);
        render_preview_panel(app, frame, preview_area);
    } else {
        render_chat(app, frame, body_area);
    }

    render_input(app, frame, input_area);
    render_footer(app, frame, footer_area);
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let (state, state_style) = match app.controller.pending_call() {
        Some(name) => (format!(" calling {} ", name), Style::default().fg(Color::Magenta)),
        None if app.controller.is_streaming() => {
            (" streaming ".to_string(), Style::default().fg(Color::Yellow))
        }
        None => (" idle ".to_string(), Style::default().fg(Color::Green)),
    };

    let title = Line::from(vec![
        Span::styled(" sandchat ", Style::default().fg(Color::Cyan).bold()),
        Span::styled(
            format!("{} ", app.controller.settings().model),
            Style::default().fg(Color::White),
        ),
        Span::styled(state, state_style),
        Span::styled(
            format!("v{}", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::DarkGray),
        ),
    ]);

    let header = Paragraph::new(title).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn render_chat(app: &mut App, frame: &mut Frame, area: Rect) {
    let inner_width = area.width.saturating_sub(2);
    let inner_height = area.height.saturating_sub(2);

    let lines = chat_lines(app);
    app.update_chat_metrics(wrapped_height(&lines, inner_width), inner_height);

    let border_color = if app.input_mode == InputMode::Normal {
        Color::Cyan
    } else {
        Color::DarkGray
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(format!(" Chat ({} messages) ", app.controller.transcript().len()));

    let chat = Paragraph::new(Text::from(lines))
        .block(block)
        .wrap(Wrap { trim: false })
        .scroll((app.chat_scroll, 0));

    frame.render_widget(chat, area);
}

fn render_preview_panel(app: &App, frame: &mut Frame, area: Rect) {
    let Some((index, bundle)) = &app.preview else {
        return;
    };

    let key_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let mut lines = vec![
        Line::from(vec![
            Span::styled(" p ", key_style),
            Span::raw(" sandboxed  "),
            Span::styled(" o ", key_style),
            Span::raw(" new tab"),
        ]),
        Line::from(Span::styled(
            format!("sandbox: {}", SANDBOX_PERMISSIONS),
            Style::default().fg(Color::DarkGray),
        )),
        Line::default(),
    ];

    let sections = [
        ("HTML", &bundle.html, Color::LightRed),
        ("CSS", &bundle.css, Color::LightBlue),
        ("JavaScript", &bundle.js, Color::LightYellow),
    ];
    for (label, source, color) in sections {
        if source.is_empty() {
            continue;
        }
        let count = source.lines().count();
        lines.push(Line::from(Span::styled(
            format!("{} ({} lines)", label, count),
            Style::default().fg(color).bold(),
        )));
        for line in source.lines().take(PREVIEW_SNIPPET_LINES) {
            lines.push(Line::from(Span::styled(
                format!("  {}", line),
                Style::default().fg(Color::Gray),
            )));
        }
        if count > PREVIEW_SNIPPET_LINES {
            lines.push(Line::from(Span::styled("  ...", Style::default().fg(Color::DarkGray))));
        }
        lines.push(Line::default());
    }

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green))
        .title(format!(" Preview: message {} ", index + 1));

    let panel = Paragraph::new(Text::from(lines))
        .block(block)
        .wrap(Wrap { trim: false });
    frame.render_widget(panel, area);
}

fn render_input(app: &App, frame: &mut Frame, area: Rect) {
    let inner_width = area.width.saturating_sub(2) as usize;

    let (title, display, cursor, border_color) = match app.input_mode {
        InputMode::ApiKey => {
            let masked = mask_key(&app.api_key_input);
            let cursor = masked.chars().count();
            (
                " xAI API key (Enter to save, Esc to cancel) ".to_string(),
                masked,
                Some(cursor),
                Color::Yellow,
            )
        }
        mode => {
            let editing = mode == InputMode::Editing;
            let title = if app.controller.is_streaming() {
                " Message (waiting for reply) "
            } else {
                " Message (Enter to send) "
            };
            // Keep the cursor in view for long input
            let offset = app.input_cursor.saturating_sub(inner_width.saturating_sub(1));
            let visible: String = app.input.chars().skip(offset).collect();
            let cursor = editing.then_some(app.input_cursor - offset);
            let color = if editing { Color::Cyan } else { Color::DarkGray };
            (title.to_string(), visible, cursor, color)
        }
    };

    let text = if display.is_empty() && app.input_mode == InputMode::Normal {
        Line::from(Span::styled("Press i to type a message", Style::default().fg(Color::DarkGray)))
    } else {
        Line::from(display)
    };

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(title);
    frame.render_widget(Paragraph::new(text).block(block), area);

    if let Some(cursor) = cursor {
        let cursor_x = (cursor as u16).min(area.width.saturating_sub(3));
        frame.set_cursor_position((area.x + 1 + cursor_x, area.y + 1));
    }
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let (mode_text, mode_style) = match app.input_mode {
        InputMode::Normal => (" NORMAL ", Style::default().bg(Color::Blue).fg(Color::White)),
        InputMode::Editing => (" INSERT ", Style::default().bg(Color::Yellow).fg(Color::Black)),
        InputMode::ApiKey => (" API KEY ", Style::default().bg(Color::Magenta).fg(Color::White)),
    };

    // Key style: dark background with bright text for visibility on both light/dark terminals
    let key_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let label_style = Style::default().bg(Color::Black).fg(Color::White);

    let keys: &[(&str, &str)] = match app.input_mode {
        InputMode::Normal => &[
            ("i", "type"),
            ("j/k", "scroll"),
            ("p", "preview"),
            ("o", "new tab"),
            ("v", "panel"),
            ("K", "API key"),
            ("C", "clear"),
            ("q", "quit"),
        ],
        InputMode::Editing => &[("Enter", "send"), ("Esc", "normal"), ("↑/↓", "scroll")],
        InputMode::ApiKey => &[("Enter", "save"), ("Esc", "cancel")],
    };

    let mut spans = vec![Span::styled(mode_text, mode_style)];
    if let Some(status) = &app.status {
        spans.push(Span::styled(
            format!(" {} ", status),
            Style::default().fg(Color::LightRed),
        ));
    }
    for (key, label) in keys {
        spans.push(Span::styled(format!(" {} ", key), key_style));
        spans.push(Span::styled(format!(" {} ", label), label_style));
    }

    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}
