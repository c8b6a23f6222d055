//! Highlighting for fenced blocks tagged with a language other than the
//! sandbox's own, e.g. `python` or `rust`.

use std::sync::OnceLock;

use ratatui::style::{Color, Style};
use ratatui::text::{Line, Span};
use syntect::easy::HighlightLines;
use syntect::highlighting::{Theme, ThemeSet};
use syntect::parsing::SyntaxSet;
use syntect::util::LinesWithEndings;

const THEME: &str = "base16-ocean.dark";

fn syntaxes() -> &'static SyntaxSet {
    static CACHED: OnceLock<SyntaxSet> = OnceLock::new();
    CACHED.get_or_init(SyntaxSet::load_defaults_newlines)
}

fn theme() -> Option<&'static Theme> {
    static CACHED: OnceLock<ThemeSet> = OnceLock::new();
    CACHED.get_or_init(ThemeSet::load_defaults).themes.get(THEME)
}

/// Styled lines for `source`, or `None` when the language is unknown
pub fn highlight_lines(source: &str, language: &str) -> Option<Vec<Line<'static>>> {
    let syntaxes = syntaxes();
    let syntax = syntaxes.find_syntax_by_token(language)?;
    let mut highlighter = HighlightLines::new(syntax, theme()?);

    let mut lines = Vec::new();
    for line in LinesWithEndings::from(source) {
        let ranges = match highlighter.highlight_line(line, syntaxes) {
            Ok(ranges) => ranges,
            Err(e) => {
                tracing::debug!("Highlighting {} failed: {}", language, e);
                return None;
            }
        };
        let spans: Vec<Span<'static>> = ranges
            .into_iter()
            .map(|(style, text)| {
                let fg = style.foreground;
                Span::styled(
                    text.trim_end_matches('\n').to_string(),
                    Style::default().fg(Color::Rgb(fg.r, fg.g, fg.b)),
                )
            })
            .filter(|span| !span.content.is_empty())
            .collect();
        lines.push(Line::from(spans));
    }
    Some(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(line: &Line) -> String {
        line.spans.iter().map(|s| s.content.as_ref()).collect()
    }

    #[test]
    fn test_known_language_keeps_text() {
        let lines = highlight_lines("def f():\n    return 1\n", "python").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(text(&lines[0]), "def f():");
        assert_eq!(text(&lines[1]), "    return 1");
        assert!(lines[0].spans.len() > 1);
    }

    #[test]
    fn test_unknown_language() {
        assert!(highlight_lines("x", "no-such-language").is_none());
    }
}
