//! JSX-style markup recognition.
//!
//! Markup is parsed into a tree and shown as a static outline. No element is
//! ever instantiated and embedded `{...}` expressions are kept as source text.

use serde::Serialize;

const MAX_DEPTH: usize = 64;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track", "wbr",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribute {
    pub name: String,
    /// `None` for bare boolean attributes like `disabled`
    pub value: Option<AttributeValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AttributeValue {
    Literal(String),
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MarkupNode {
    Element {
        tag: String,
        attributes: Vec<Attribute>,
        children: Vec<MarkupNode>,
    },
    /// `<>...</>`
    Fragment(Vec<MarkupNode>),
    Text(String),
    Expression(String),
}

impl MarkupNode {
    /// Indented outline of the tree, one line per node
    pub fn outline(&self) -> Vec<String> {
        let mut lines = Vec::new();
        self.write_outline(0, &mut lines);
        lines
    }

    fn write_outline(&self, depth: usize, lines: &mut Vec<String>) {
        let pad = "  ".repeat(depth);
        match self {
            MarkupNode::Element {
                tag,
                attributes,
                children,
            } => {
                let attrs: String = attributes.iter().map(|a| format!(" {}", a)).collect();
                if children.is_empty() {
                    lines.push(format!("{}<{}{} />", pad, tag, attrs));
                    return;
                }
                lines.push(format!("{}<{}{}>", pad, tag, attrs));
                for child in children {
                    child.write_outline(depth + 1, lines);
                }
                lines.push(format!("{}</{}>", pad, tag));
            }
            MarkupNode::Fragment(children) => {
                lines.push(format!("{}<>", pad));
                for child in children {
                    child.write_outline(depth + 1, lines);
                }
                lines.push(format!("{}</>", pad));
            }
            MarkupNode::Text(text) => lines.push(format!("{}{}", pad, text)),
            MarkupNode::Expression(expr) => lines.push(format!("{}{{{}}}", pad, expr)),
        }
    }

    /// Tag of the root element, `None` for fragments and leaves
    pub fn tag(&self) -> Option<&str> {
        match self {
            MarkupNode::Element { tag, .. } => Some(tag),
            _ => None,
        }
    }
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            None => write!(f, "{}", self.name),
            Some(AttributeValue::Literal(v)) => write!(f, "{}=\"{}\"", self.name, v),
            Some(AttributeValue::Expression(e)) => write!(f, "{}={{{}}}", self.name, e),
        }
    }
}

/// Find the first parsable markup element in `source`.
///
/// Returns `None` when nothing in the source even looks like a tag, and the
/// first parse error when tags are present but none of them parse.
pub fn find_markup(source: &str) -> Option<Result<MarkupNode, String>> {
    let mut first_error = None;

    for (pos, c) in source.char_indices() {
        if c != '<' {
            continue;
        }
        let next = source[pos + 1..].chars().next();
        if !matches!(next, Some(n) if n.is_ascii_alphabetic() || n == '>') {
            continue;
        }

        let mut parser = MarkupParser {
            src: source,
            pos,
            depth: 0,
        };
        match parser.element() {
            Ok(node) => return Some(Ok(node)),
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }

    first_error.map(Err)
}

struct MarkupParser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> MarkupParser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn eat(&mut self, s: &str) -> bool {
        if self.rest().starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, s: &str) -> Result<(), String> {
        if self.eat(s) {
            Ok(())
        } else {
            Err(format!("Expected '{}' at offset {}", s, self.pos))
        }
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn name(&mut self) -> String {
        let len = self
            .rest()
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
            .map(|(i, _)| i)
            .unwrap_or(self.rest().len());
        let name = self.rest()[..len].to_string();
        self.pos += len;
        name
    }

    fn element(&mut self) -> Result<MarkupNode, String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("Markup is nested too deeply".to_string());
        }
        let node = self.element_inner();
        self.depth -= 1;
        node
    }

    fn element_inner(&mut self) -> Result<MarkupNode, String> {
        self.expect("<")?;

        if self.eat(">") {
            let children = self.children("")?;
            return Ok(MarkupNode::Fragment(children));
        }

        let tag = self.name();
        if tag.is_empty() {
            return Err(format!("Expected a tag name at offset {}", self.pos));
        }

        let mut attributes = Vec::new();
        loop {
            self.skip_whitespace();
            if self.eat("/>") {
                return Ok(MarkupNode::Element {
                    tag,
                    attributes,
                    children: Vec::new(),
                });
            }
            if self.eat(">") {
                break;
            }
            attributes.push(self.attribute()?);
        }

        if VOID_ELEMENTS.contains(&tag.as_str()) {
            return Ok(MarkupNode::Element {
                tag,
                attributes,
                children: Vec::new(),
            });
        }

        let children = self.children(&tag)?;
        Ok(MarkupNode::Element {
            tag,
            attributes,
            children,
        })
    }

    fn attribute(&mut self) -> Result<Attribute, String> {
        let name = self.name();
        if name.is_empty() {
            return Err(format!(
                "Unexpected '{}' in tag at offset {}",
                self.peek().unwrap_or(' '),
                self.pos
            ));
        }

        self.skip_whitespace();
        if !self.eat("=") {
            return Ok(Attribute { name, value: None });
        }
        self.skip_whitespace();

        let value = match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                let end = self
                    .rest()
                    .find(quote)
                    .ok_or_else(|| format!("Unterminated attribute value for '{}'", name))?;
                let literal = self.rest()[..end].to_string();
                self.pos += end + 1;
                AttributeValue::Literal(literal)
            }
            Some('{') => AttributeValue::Expression(self.braced()?),
            _ => return Err(format!("Expected a value for attribute '{}'", name)),
        };

        Ok(Attribute {
            name,
            value: Some(value),
        })
    }

    /// Consume a balanced `{...}` and return the trimmed inside
    fn braced(&mut self) -> Result<String, String> {
        let start = self.pos;
        self.expect("{")?;
        let mut depth = 1usize;
        let mut quote: Option<char> = None;
        let mut chars = self.rest().char_indices();

        while let Some((i, c)) = chars.next() {
            match (quote, c) {
                (Some(_), '\\') => {
                    chars.next();
                }
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '"' | '\'' | '`') => quote = Some(c),
                (None, '{') => depth += 1,
                (None, '}') => {
                    depth -= 1;
                    if depth == 0 {
                        let inner = self.rest()[..i].trim().to_string();
                        self.pos += i + 1;
                        return Ok(inner);
                    }
                }
                _ => {}
            }
        }

        Err(format!("Unterminated expression starting at offset {}", start))
    }

    fn children(&mut self, tag: &str) -> Result<Vec<MarkupNode>, String> {
        let mut children = Vec::new();

        loop {
            if self.rest().is_empty() {
                return Err(if tag.is_empty() {
                    "Unterminated fragment".to_string()
                } else {
                    format!("Unterminated element <{}>", tag)
                });
            }

            if self.eat("</") {
                let closing = self.name();
                self.skip_whitespace();
                self.expect(">")?;
                if closing != tag {
                    return Err(format!(
                        "Expected corresponding closing tag for <{}> but found </{}>",
                        tag, closing
                    ));
                }
                return Ok(children);
            }

            match self.peek() {
                Some('<') => children.push(self.element()?),
                Some('{') => {
                    let expr = self.braced()?;
                    // `{/* comment */}` renders nothing
                    if !expr.is_empty() && !(expr.starts_with("/*") && expr.ends_with("*/")) {
                        children.push(MarkupNode::Expression(expr));
                    }
                }
                _ => {
                    let end = self.rest().find(['<', '{']).unwrap_or(self.rest().len());
                    let text = self.rest()[..end].split_whitespace().collect::<Vec<_>>().join(" ");
                    self.pos += end;
                    if !text.is_empty() {
                        children.push(MarkupNode::Text(text));
                    }
                }
            }
        }
    }
}
