use ratatui::{
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};
use relaychat_core::sandbox::{Token, TokenKind};
use relaychat_core::{ExecutionView, MessageKind, RenderedView};

use crate::app::{App, InputMode};
use crate::highlight::highlight_lines;

/// The input box grows with its content up to this many lines
const MAX_INPUT_LINES: u16 = 5;

/// Parse a line of text and convert **bold** markdown to styled spans
fn parse_markdown_line(text: &str) -> Line<'static> {
    let mut spans: Vec<Span<'static>> = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("**") {
        let after = &rest[start + 2..];
        match after.find("**") {
            Some(end) if end > 0 => {
                if start > 0 {
                    spans.push(Span::raw(rest[..start].to_string()));
                }
                spans.push(Span::styled(
                    after[..end].to_string(),
                    Style::default().add_modifier(Modifier::BOLD),
                ));
                rest = &after[end + 2..];
            }
            // No closing **, treat as literal
            _ => break,
        }
    }

    if !rest.is_empty() {
        spans.push(Span::raw(rest.to_string()));
    }

    Line::from(spans)
}

fn token_style(kind: TokenKind) -> Style {
    match kind {
        TokenKind::Keyword => Style::default().fg(Color::Magenta),
        TokenKind::String | TokenKind::Template => Style::default().fg(Color::Green),
        TokenKind::Number => Style::default().fg(Color::Yellow),
        TokenKind::Comment => Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
        TokenKind::Operator | TokenKind::Punctuation => Style::default().fg(Color::Gray),
        TokenKind::Identifier => Style::default().fg(Color::Cyan),
        TokenKind::Whitespace | TokenKind::Plain => Style::default(),
    }
}

fn gutter() -> Span<'static> {
    Span::styled("│ ", Style::default().fg(Color::DarkGray))
}

/// Split highlighted tokens into display lines behind a gutter
fn code_lines(tokens: &[Token]) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    let mut current = vec![gutter()];

    for token in tokens {
        let style = token_style(token.kind);
        let mut pieces = token.text.split('\n');
        if let Some(first) = pieces.next() {
            if !first.is_empty() {
                current.push(Span::styled(first.to_string(), style));
            }
        }
        for piece in pieces {
            lines.push(Line::from(std::mem::replace(&mut current, vec![gutter()])));
            if !piece.is_empty() {
                current.push(Span::styled(piece.to_string(), style));
            }
        }
    }
    lines.push(Line::from(current));
    lines
}

fn execution_lines(view: &ExecutionView) -> Vec<Line<'static>> {
    let lines = view.lines();
    let last = lines.len().saturating_sub(1);

    lines
        .into_iter()
        .enumerate()
        .map(|(i, line)| {
            let style = match view {
                ExecutionView::Error { .. } if i == last => {
                    Style::default().fg(Color::Red).add_modifier(Modifier::BOLD)
                }
                ExecutionView::Output { .. } if i == last => Style::default().fg(Color::Green),
                ExecutionView::Preview { .. } if i == 0 => {
                    Style::default().fg(Color::Blue).add_modifier(Modifier::BOLD)
                }
                ExecutionView::Preview { .. } => Style::default().fg(Color::Blue),
                _ => Style::default(),
            };
            Line::from(Span::styled(line, style))
        })
        .collect()
}

fn view_lines(view: &RenderedView) -> Vec<Line<'static>> {
    match view {
        RenderedView::Plain(text) => text.lines().map(parse_markdown_line).collect(),
        RenderedView::Code {
            fragment,
            highlighted,
            execution,
        } => {
            let mut lines = Vec::new();
            if let Some(language) = &fragment.language {
                lines.push(Line::from(Span::styled(
                    format!("[{}]", language),
                    Style::default().fg(Color::DarkGray),
                )));
            }
            let foreign = match &fragment.language {
                Some(language) if !fragment.is_sandbox_language() => highlight_lines(&fragment.source, language),
                _ => None,
            };
            match foreign {
                Some(code) => lines.extend(code.into_iter().map(|line| {
                    let mut spans = vec![gutter()];
                    spans.extend(line.spans);
                    Line::from(spans)
                })),
                None => lines.extend(code_lines(highlighted)),
            }
            lines.extend(execution_lines(execution));
            lines
        }
    }
}

/// Every line of the chat list, including the busy indicator
fn chat_lines(app: &App) -> Vec<Line<'static>> {
    let mut lines: Vec<Line<'static>> = Vec::new();

    for (index, msg) in app.conversation.snapshot().iter().enumerate() {
        match msg.kind {
            MessageKind::Outgoing => {
                lines.push(Line::from(Span::styled(
                    "You:",
                    Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
                )));
                match app.views.get(index).and_then(Option::as_ref) {
                    Some(view) => lines.extend(view_lines(view)),
                    None => lines.extend(msg.text.lines().map(|line| Line::from(line.to_string()))),
                }
            }
            MessageKind::Incoming => {
                lines.push(Line::from(Span::styled(
                    "AI:",
                    Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
                )));
                match app.views.get(index).and_then(Option::as_ref) {
                    Some(view) => lines.extend(view_lines(view)),
                    None => lines.extend(msg.text.lines().map(parse_markdown_line)),
                }
            }
        }
        lines.push(Line::default());
    }

    if app.busy() {
        lines.push(Line::from(Span::styled(
            "AI:",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )));
        // Animated ellipsis: cycles through ".", "..", "..."
        let dots = ".".repeat((app.animation_frame as usize) + 1);
        lines.push(Line::from(Span::styled(
            format!("Generating response{}", dots),
            Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
        )));
    }

    lines
}

/// Rows the lines take once wrapped to `width`
fn wrapped_height(lines: &[Line], width: u16) -> u16 {
    let width = width.max(1) as usize;
    let total: usize = lines
        .iter()
        .map(|line| line.width().max(1).div_ceil(width))
        .sum();
    total.min(u16::MAX as usize) as u16
}

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    let input_lines = (app.input.split('\n').count() as u16).clamp(1, MAX_INPUT_LINES);
    let [header_area, chat_area, input_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(input_lines + 2),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);
    render_chat(app, frame, chat_area);
    render_input(app, frame, input_area);
    render_footer(app, frame, footer_area);
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let title = Line::from(vec![
        Span::styled(" relaychat ", Style::default().fg(Color::Cyan).bold()),
        Span::styled(app.server_endpoint().to_string(), Style::default().fg(Color::Gray)),
        Span::raw(" "),
        Span::styled(
            format!("v{}", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::DarkGray),
        ),
    ]);

    let header = Paragraph::new(title).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn render_chat(app: &mut App, frame: &mut Frame, area: Rect) {
    // Inner size minus borders, for scroll calculations
    app.chat_height = area.height.saturating_sub(2);
    app.chat_width = area.width.saturating_sub(2);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(if app.input_mode == InputMode::Normal {
            Color::Cyan
        } else {
            Color::DarkGray
        }))
        .title(" Chat ");

    if app.conversation.is_empty() && !app.busy() {
        let hint = Paragraph::new(Text::from(Span::styled(
            "Ask anything. Code in the reply is run in a sandbox.",
            Style::default().fg(Color::DarkGray),
        )))
        .block(block);
        frame.render_widget(hint, area);
        return;
    }

    let lines = chat_lines(app);
    app.set_content_height(wrapped_height(&lines, app.chat_width));

    let chat = Paragraph::new(Text::from(lines))
        .block(block)
        .wrap(Wrap { trim: false })
        .scroll((app.scroll, 0));

    frame.render_widget(chat, area);
}

fn render_input(app: &App, frame: &mut Frame, area: Rect) {
    let editing = app.input_mode == InputMode::Editing;
    let border_color = if app.busy() {
        Color::DarkGray
    } else if editing {
        Color::Yellow
    } else {
        Color::Gray
    };

    let title = if app.busy() {
        " Waiting for reply "
    } else {
        " Message (Enter to send, Shift+Enter for newline) "
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(title);

    // Cursor position as (row, column) inside the text
    let before: String = app.input.chars().take(app.cursor).collect();
    let row = before.matches('\n').count() as u16;
    let column = before.rsplit('\n').next().map_or(0, |s| s.chars().count()) as u16;

    // Scroll so the cursor stays visible
    let inner_width = area.width.saturating_sub(2);
    let inner_height = area.height.saturating_sub(2).max(1);
    let scroll_x = if inner_width > 0 && column >= inner_width {
        column - inner_width + 1
    } else {
        0
    };
    let scroll_y = row.saturating_sub(inner_height - 1);

    // Cyan text to match the "You:" style
    let input = Paragraph::new(app.input.as_str())
        .style(Style::default().fg(Color::Cyan))
        .block(block)
        .scroll((scroll_y, scroll_x));

    frame.render_widget(input, area);

    if editing {
        frame.set_cursor_position((
            area.x + 1 + column - scroll_x,
            area.y + 1 + row - scroll_y,
        ));
    }
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let (mode_text, mode_style) = match app.input_mode {
        InputMode::Normal => (" NORMAL ", Style::default().bg(Color::Blue).fg(Color::White)),
        InputMode::Editing => (" INSERT ", Style::default().bg(Color::Yellow).fg(Color::Black)),
    };

    // Key style: dark background with bright text for visibility on both light/dark terminals
    let key_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let label_style = Style::default().bg(Color::Black).fg(Color::White);

    let mut spans = vec![Span::styled(mode_text, mode_style)];
    let hints: &[(&str, &str)] = match app.input_mode {
        InputMode::Normal => &[
            (" i ", " type "),
            (" j/k ", " scroll "),
            (" PgUp/PgDn ", " page "),
            (" q ", " quit "),
        ],
        InputMode::Editing => &[
            (" Enter ", " send "),
            (" Esc ", " normal "),
            (" PgUp/PgDn ", " scroll "),
            (" Ctrl+C ", " quit "),
        ],
    };
    for (key, label) in hints {
        spans.push(Span::styled(*key, key_style));
        spans.push(Span::styled(*label, label_style));
    }

    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaychat_core::{highlight, Message, RelayClient, Renderer};

    fn line_text(line: &Line) -> String {
        line.spans.iter().map(|s| s.content.as_ref()).collect()
    }

    #[test]
    fn test_parse_markdown_bold() {
        let line = parse_markdown_line("a **b** c");
        assert_eq!(line.spans.len(), 3);
        assert_eq!(line.spans[1].content, "b");
        assert!(line.spans[1].style.add_modifier.contains(Modifier::BOLD));

        // Unclosed markers stay literal
        assert_eq!(line_text(&parse_markdown_line("a **b")), "a **b");
    }

    #[test]
    fn test_code_lines_follow_newlines() {
        let lines = code_lines(&highlight("let x = 1;\nx + 1"));
        assert_eq!(lines.len(), 2);
        assert_eq!(line_text(&lines[0]), "│ let x = 1;");
        assert_eq!(line_text(&lines[1]), "│ x + 1");
    }

    #[test]
    fn test_error_line_is_red() {
        let lines = execution_lines(&relaychat_core::execute("1 +"));
        let last = lines.last().unwrap();
        assert!(line_text(last).starts_with("Error: "));
        assert_eq!(last.spans[0].style.fg, Some(Color::Red));
    }

    #[test]
    fn test_chat_lines_show_roles_and_output() {
        let mut app = App::new(RelayClient::new("http://127.0.0.1:9"), Renderer::default());
        app.views.push(None);
        app.conversation.append(Message::outgoing("2+2"));
        let text = "```2+2```".to_string();
        app.receive(crate::app::Reply {
            view: relaychat_core::render(&text),
            text,
        });

        let texts: Vec<String> = chat_lines(&app).iter().map(line_text).collect();
        assert_eq!(texts, vec!["You:", "2+2", "", "AI:", "│ 2+2", "Output: 4", ""]);
    }

    #[tokio::test]
    async fn test_outgoing_code_shows_output() {
        let mut app = App::new(RelayClient::new("http://127.0.0.1:9"), Renderer::default());
        app.input = "```1+1```".to_string();
        app.send();

        let texts: Vec<String> = chat_lines(&app).iter().map(line_text).collect();
        assert_eq!(texts[..4], ["You:", "│ 1+1", "Output: 2", ""]);
        assert_eq!(texts[4], "AI:");
    }

    #[test]
    fn test_foreign_language_block_keeps_source_lines() {
        let view = relaychat_core::render("```python\nx = 1\nprint(x)\n```");
        let texts: Vec<String> = view_lines(&view).iter().map(line_text).collect();
        assert_eq!(texts[0], "[python]");
        assert_eq!(texts[1], "│ x = 1");
        assert_eq!(texts[2], "│ print(x)");
        assert!(texts.last().unwrap().starts_with("Error: "));
    }

    #[test]
    fn test_wrapped_height() {
        let lines = vec![Line::from("abcdef"), Line::default()];
        assert_eq!(wrapped_height(&lines, 4), 3);
        assert_eq!(wrapped_height(&lines, 10), 2);
    }
}
