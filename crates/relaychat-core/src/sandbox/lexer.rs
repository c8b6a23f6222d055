use serde::Serialize;

use super::error::ExecutionError;

/// Category of a lexed token, shared by the parser and the highlighter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TokenKind {
    Whitespace,
    Comment,
    Keyword,
    Identifier,
    Number,
    String,
    Template,
    Operator,
    Punctuation,
    /// Text the lexer could not split; only produced by the highlighter
    Plain,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Byte offset of the token in the source
    pub offset: usize,
}

impl Token {
    pub fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }
}

const KEYWORDS: &[&str] = &[
    "let", "const", "var", "if", "else", "while", "do", "for", "of", "break", "continue", "return",
    "function", "true", "false", "null", "undefined", "typeof", "throw", "try", "catch",
    "finally", "new", "class", "import", "export", "in",
];

// Longest first so that maximal munch works with a linear scan.
const OPERATORS: &[&str] = &[
    ">>>", "===", "!==", "**=", "...", "=>", "==", "!=", "<=", ">=", "&&", "||", "??", "?.",
    "++", "--", "+=", "-=", "*=", "/=", "%=", "**", "<<", ">>", "+", "-", "*", "/", "%", "<",
    ">", "=", "!", "?", ":", ".", "&", "|", "^", "~",
];

const PUNCTUATION: &[char] = &['(', ')', '{', '}', '[', ']', ',', ';'];

pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphanumeric()
}

/// Split source text into tokens, trivia included.
///
/// Concatenating the `text` of every token reproduces the input exactly,
/// which is what lets the highlighter reuse this lexer.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ExecutionError> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < source.len() {
        let rest = &source[pos..];
        let c = match rest.chars().next() {
            Some(c) => c,
            None => break,
        };

        let (kind, len) = if c.is_whitespace() {
            let len = rest
                .char_indices()
                .find(|(_, ch)| !ch.is_whitespace())
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            (TokenKind::Whitespace, len)
        } else if rest.starts_with("//") {
            let len = rest.find('\n').unwrap_or(rest.len());
            (TokenKind::Comment, len)
        } else if rest.starts_with("/*") {
            match rest[2..].find("*/") {
                Some(end) => (TokenKind::Comment, end + 4),
                None => return Err(ExecutionError::syntax("Unterminated comment", pos)),
            }
        } else if c.is_ascii_digit() || (c == '.' && next_is_digit(rest)) {
            (TokenKind::Number, scan_number(rest))
        } else if c == '"' || c == '\'' {
            (TokenKind::String, scan_string(rest, c, pos)?)
        } else if c == '`' {
            (TokenKind::Template, scan_template(rest, pos)?)
        } else if is_ident_start(c) {
            let len = rest
                .char_indices()
                .find(|(_, ch)| !is_ident_continue(*ch))
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            let kind = if is_keyword(&rest[..len]) {
                TokenKind::Keyword
            } else {
                TokenKind::Identifier
            };
            (kind, len)
        } else if PUNCTUATION.contains(&c) {
            (TokenKind::Punctuation, 1)
        } else if let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            // `?.5` is a conditional followed by a number, not optional chaining
            if *op == "?." && next_is_digit(&rest[1..]) {
                (TokenKind::Operator, 1)
            } else {
                (TokenKind::Operator, op.len())
            }
        } else {
            return Err(ExecutionError::syntax(
                format!("Invalid or unexpected token '{}'", c),
                pos,
            ));
        };

        tokens.push(Token {
            kind,
            text: rest[..len].to_string(),
            offset: pos,
        });
        pos += len;
    }

    Ok(tokens)
}

fn next_is_digit(rest: &str) -> bool {
    rest.chars().nth(1).map_or(false, |c| c.is_ascii_digit())
}

fn scan_number(rest: &str) -> usize {
    let bytes = rest.as_bytes();
    if bytes.len() > 2 && bytes[0] == b'0' && matches!(bytes[1], b'x' | b'X' | b'b' | b'B' | b'o' | b'O') {
        let mut i = 2;
        while i < bytes.len() && (bytes[i].is_ascii_hexdigit() || bytes[i] == b'_') {
            i += 1;
        }
        return i;
    }

    let mut i = 0;
    while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'_') {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < bytes.len() && matches!(bytes[i], b'e' | b'E') {
        let mut j = i + 1;
        if j < bytes.len() && matches!(bytes[j], b'+' | b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    i
}

fn scan_string(rest: &str, quote: char, offset: usize) -> Result<usize, ExecutionError> {
    let mut chars = rest.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '\n' => break,
            c if c == quote => return Ok(i + c.len_utf8()),
            _ => {}
        }
    }
    Err(ExecutionError::syntax("Invalid or unexpected token: unterminated string", offset))
}

fn scan_template(rest: &str, offset: usize) -> Result<usize, ExecutionError> {
    let mut chars = rest.char_indices().skip(1).peekable();
    let mut depth = 0usize;
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '$' if depth == 0 && chars.peek().map(|(_, c)| *c) == Some('{') => {
                chars.next();
                depth = 1;
            }
            '{' if depth > 0 => depth += 1,
            '}' if depth > 0 => depth -= 1,
            '`' if depth == 0 => return Ok(i + 1),
            _ => {}
        }
    }
    Err(ExecutionError::syntax("Unterminated template literal", offset))
}

/// Decode the escapes of a quoted string token, quotes excluded
pub fn unescape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('v') => out.push('\u{b}'),
            Some('u') => {
                let hex: String = if chars.peek() == Some(&'{') {
                    chars.next();
                    chars.by_ref().take_while(|c| *c != '}').collect()
                } else {
                    chars.by_ref().take(4).collect()
                };
                if let Some(ch) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    out.push(ch);
                }
            }
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                if let Some(ch) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    out.push(ch);
                }
            }
            Some('\n') => {}
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src)
            .unwrap()
            .into_iter()
            .filter(|t| !t.is_trivia())
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_tokens_reproduce_source() {
        let src = "const x = `a${1 + 2}b`; // done\nx ** 2 /* tail */";
        let joined: String = tokenize(src).unwrap().into_iter().map(|t| t.text).collect();
        assert_eq!(joined, src);
    }

    #[test]
    fn test_operator_maximal_munch() {
        let ops: Vec<String> = tokenize("a === b !== c ?? d")
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TokenKind::Operator)
            .map(|t| t.text)
            .collect();
        assert_eq!(ops, vec!["===", "!==", "??"]);
    }

    #[test]
    fn test_keywords_and_literals() {
        assert_eq!(
            kinds("let s = 'hi' + 1.5e3"),
            vec![
                TokenKind::Keyword,
                TokenKind::Identifier,
                TokenKind::Operator,
                TokenKind::String,
                TokenKind::Operator,
                TokenKind::Number,
            ]
        );
    }

    #[test]
    fn test_unterminated_string_is_error() {
        assert!(tokenize("'abc").is_err());
        assert!(tokenize("\"abc\ndef\"").is_err());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"a\nb\tA\'"), "a\nb\tA'");
    }
}
