//! Message rendering: plain prose, or a highlighted and executed code
//! fragment when the text contains backtick-delimited code.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::sandbox::{tokenize, ExecutionView, Executor, Token, TokenKind};

const INFO_STRINGS: &[&str] = &[
    "js", "javascript", "jsx", "mjs", "ts", "typescript", "tsx", "html", "xml", "json", "css", "python",
    "py", "rust", "rs", "bash", "sh", "shell", "console", "text", "plaintext", "sql", "yaml", "toml",
    "java", "c", "cpp", "go", "ruby", "markdown", "md",
];

/// Tags of code the sandbox lexer understands
const SANDBOX_LANGUAGES: &[&str] = &["js", "javascript", "jsx", "mjs"];

fn fenced_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| Regex::new(r"```([\s\S]*?)```").expect("fenced block regex must compile"))
}

fn inline_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| Regex::new(r"`([^`]+)`").expect("inline code regex must compile"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Delimiter {
    Fenced,
    Inline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeFragment {
    pub source: String,
    pub delimiter: Delimiter,
    /// Info string of a fenced block, e.g. `js`
    pub language: Option<String>,
}

impl CodeFragment {
    /// Untagged fragments are assumed to be in the sandbox language
    pub fn is_sandbox_language(&self) -> bool {
        self.language
            .as_deref()
            .map_or(true, |tag| SANDBOX_LANGUAGES.contains(&tag.to_ascii_lowercase().as_str()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderedView {
    Plain(String),
    Code {
        fragment: CodeFragment,
        highlighted: Vec<Token>,
        execution: ExecutionView,
    },
}

impl RenderedView {
    pub fn is_code(&self) -> bool {
        matches!(self, RenderedView::Code { .. })
    }
}

/// Locate the code fragment of a message: the first fenced block, else the
/// first inline span. Later matches are ignored.
pub fn extract_fragment(text: &str) -> Option<CodeFragment> {
    if let Some(captures) = fenced_regex().captures(text) {
        let inner = captures.get(1).map_or("", |m| m.as_str());
        let (language, body) = split_info_string(inner);
        return Some(CodeFragment {
            source: body.trim().to_string(),
            delimiter: Delimiter::Fenced,
            language,
        });
    }

    inline_regex().captures(text).map(|captures| CodeFragment {
        source: captures.get(1).map_or("", |m| m.as_str()).to_string(),
        delimiter: Delimiter::Inline,
        language: None,
    })
}

/// Strip a bare language tag from the first line of a multi-line block
fn split_info_string(inner: &str) -> (Option<String>, &str) {
    if let Some((head, rest)) = inner.split_once('\n') {
        let tag = head.trim();
        if INFO_STRINGS.contains(&tag.to_ascii_lowercase().as_str()) {
            return (Some(tag.to_string()), rest);
        }
    }
    (None, inner)
}

/// Token stream for display. Source the lexer rejects comes back as one
/// plain token so it can still be shown.
pub fn highlight(source: &str) -> Vec<Token> {
    tokenize(source).unwrap_or_else(|_| {
        vec![Token {
            kind: TokenKind::Plain,
            text: source.to_string(),
            offset: 0,
        }]
    })
}

#[derive(Debug, Clone, Default)]
pub struct Renderer {
    executor: Executor,
}

impl Renderer {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    /// Pure with respect to `text`: the same input always gives the same view
    pub fn render(&self, text: &str) -> RenderedView {
        match extract_fragment(text) {
            Some(fragment) => {
                let highlighted = highlight(&fragment.source);
                let execution = self.executor.execute(&fragment.source);
                RenderedView::Code {
                    fragment,
                    highlighted,
                    execution,
                }
            }
            None => RenderedView::Plain(text.to_string()),
        }
    }
}

/// Render with the default sandbox limits
pub fn render(text: &str) -> RenderedView {
    Renderer::default().render(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text() {
        assert_eq!(render("Just prose."), RenderedView::Plain("Just prose.".to_string()));
        assert!(!render("").is_code());
    }

    #[test]
    fn test_fenced_block_is_extracted_and_run() {
        let view = render("Here you go: ```console.log(1+1)``` enjoy");
        let RenderedView::Code {
            fragment, execution, ..
        } = view
        else {
            panic!("expected code view");
        };
        assert_eq!(fragment.source, "console.log(1+1)");
        assert_eq!(fragment.delimiter, Delimiter::Fenced);
        assert_eq!(execution.lines(), vec!["2"]);
    }

    #[test]
    fn test_two_plus_two_scenario() {
        let RenderedView::Code { execution, .. } = render("```2+2```") else {
            panic!("expected code view");
        };
        assert_eq!(execution.lines(), vec!["Output: 4"]);
    }

    #[test]
    fn test_only_first_fence_counts() {
        let fragment = extract_fragment("```1``` and ```2```").unwrap();
        assert_eq!(fragment.source, "1");
    }

    #[test]
    fn test_fence_wins_over_inline() {
        let fragment = extract_fragment("use `x` like ```\nlet y = 2\n```").unwrap();
        assert_eq!(fragment.delimiter, Delimiter::Fenced);
        assert_eq!(fragment.source, "let y = 2");
    }

    #[test]
    fn test_inline_span() {
        let fragment = extract_fragment("Try `[1,2].map(x => x * 2)` now").unwrap();
        assert_eq!(fragment.delimiter, Delimiter::Inline);
        assert_eq!(fragment.source, "[1,2].map(x => x * 2)");
    }

    #[test]
    fn test_language_tag_is_stripped() {
        let fragment = extract_fragment("```javascript\nconst a = 1;\na + 1\n```").unwrap();
        assert_eq!(fragment.language.as_deref(), Some("javascript"));
        assert_eq!(fragment.source, "const a = 1;\na + 1");

        // A lone identifier on one line is code, not a language tag
        let fragment = extract_fragment("```answer```").unwrap();
        assert_eq!(fragment.language, None);
    }

    #[test]
    fn test_sandbox_language_detection() {
        let fragment = extract_fragment("```JS\n1\n```").unwrap();
        assert!(fragment.is_sandbox_language());
        let fragment = extract_fragment("```python\nprint(1)\n```").unwrap();
        assert_eq!(fragment.language.as_deref(), Some("python"));
        assert!(!fragment.is_sandbox_language());
        assert!(extract_fragment("`x`").unwrap().is_sandbox_language());
    }

    #[test]
    fn test_highlight_reproduces_source() {
        let tokens = highlight("let x = 'a' // note");
        let joined: String = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(joined, "let x = 'a' // note");
        assert_eq!(tokens[0].kind, TokenKind::Keyword);

        let fallback = highlight("'unterminated");
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].kind, TokenKind::Plain);
    }

    #[test]
    fn test_render_is_idempotent() {
        let text = "```[1, 2, 3].reduce((a, b) => a + b)```";
        assert_eq!(render(text), render(text));
    }

    #[test]
    fn test_error_fragment_does_not_panic() {
        let RenderedView::Code { execution, .. } = render("```let = oops```") else {
            panic!("expected code view");
        };
        assert!(execution.is_error());
    }
}
