//! Recursive-descent parser for the sandbox language.
//!
//! The language is the expression-and-statement core of JavaScript: enough to
//! run the snippets a chat model tends to produce, without any of the parts
//! that reach outside the interpreter (modules, classes, `new`, regexes).

use std::rc::Rc;

use super::error::ExecutionError;
use super::lexer::{self, TokenKind};

/// Nesting limit for statements and expressions while parsing
const MAX_NESTING: usize = 128;

#[derive(Debug)]
pub struct Program {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Let,
    Const,
    Var,
}

#[derive(Debug)]
pub enum Stmt {
    Expr(Expr),
    Declare {
        kind: DeclKind,
        declarations: Vec<(String, Option<Expr>)>,
    },
    Function(Rc<FunctionDef>),
    If {
        test: Expr,
        consequent: Box<Stmt>,
        alternate: Option<Box<Stmt>>,
    },
    While {
        test: Expr,
        body: Box<Stmt>,
    },
    DoWhile {
        body: Box<Stmt>,
        test: Expr,
    },
    For {
        init: Option<Box<Stmt>>,
        test: Option<Expr>,
        update: Option<Expr>,
        body: Box<Stmt>,
    },
    ForOf {
        kind: DeclKind,
        name: String,
        iterable: Expr,
        body: Box<Stmt>,
    },
    Block(Vec<Stmt>),
    Return(Option<Expr>),
    Throw(Expr),
    Try {
        block: Vec<Stmt>,
        param: Option<String>,
        handler: Option<Vec<Stmt>>,
        finalizer: Option<Vec<Stmt>>,
    },
    Break,
    Continue,
    Empty,
}

#[derive(Debug)]
pub struct FunctionDef {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: FunctionBody,
}

#[derive(Debug)]
pub enum FunctionBody {
    Block(Vec<Stmt>),
    Expr(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    BitNot,
    TypeOf,
}

#[derive(Debug)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Undefined,
    Template {
        quasis: Vec<String>,
        exprs: Vec<Expr>,
    },
    Ident(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Function(Rc<FunctionDef>),
    Unary {
        op: UnaryOp,
        argument: Box<Expr>,
    },
    Update {
        increment: bool,
        prefix: bool,
        target: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
    Assign {
        op: Option<BinaryOp>,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Member {
        object: Box<Expr>,
        property: String,
        optional: bool,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        optional: bool,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        optional: bool,
    },
}

impl Expr {
    fn is_assignable(&self) -> bool {
        matches!(self, Expr::Ident(_) | Expr::Member { .. } | Expr::Index { .. })
    }
}

/// A significant (non-trivia) token
#[derive(Debug, Clone)]
struct Sig {
    kind: TokenKind,
    text: String,
    offset: usize,
    newline_before: bool,
}

pub fn parse_program(source: &str) -> Result<Program, ExecutionError> {
    let mut parser = Parser::new(source, 0)?;
    let mut body = Vec::new();
    while !parser.at_end() {
        body.push(parser.statement()?);
    }
    Ok(Program { body })
}

/// Parse a standalone expression that must span the whole source
fn parse_expression(source: &str, base_offset: usize) -> Result<Expr, ExecutionError> {
    let mut parser = Parser::new(source, base_offset)?;
    let expr = parser.expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(tok) => Err(parser.unexpected(tok)),
    }
}

struct Parser {
    tokens: Vec<Sig>,
    pos: usize,
    depth: usize,
    end_offset: usize,
}

impl Parser {
    fn new(source: &str, base_offset: usize) -> Result<Self, ExecutionError> {
        let raw = lexer::tokenize(source).map_err(|e| shift_offset(e, base_offset))?;
        let mut tokens = Vec::with_capacity(raw.len());
        let mut newline_before = false;
        for tok in raw {
            if tok.is_trivia() {
                newline_before |= tok.text.contains('\n');
                continue;
            }
            tokens.push(Sig {
                kind: tok.kind,
                text: tok.text,
                offset: tok.offset + base_offset,
                newline_before,
            });
            newline_before = false;
        }
        Ok(Self {
            tokens,
            pos: 0,
            depth: 0,
            end_offset: base_offset + source.len(),
        })
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Sig> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, n: usize) -> Option<&Sig> {
        self.tokens.get(self.pos + n)
    }

    /// True when the next token is the given operator, punctuation or keyword
    fn is(&self, text: &str) -> bool {
        self.peek().map_or(false, |t| is_symbolic(t) && t.text == text)
    }

    fn is_at(&self, n: usize, text: &str) -> bool {
        self.peek_at(n).map_or(false, |t| is_symbolic(t) && t.text == text)
    }

    fn bump(&mut self) -> Option<Sig> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, text: &str) -> bool {
        if self.is(text) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, text: &str) -> Result<(), ExecutionError> {
        if self.eat(text) {
            return Ok(());
        }
        Err(match self.peek() {
            Some(tok) => ExecutionError::syntax(
                format!("Unexpected token '{}', expected '{}'", tok.text, text),
                tok.offset,
            ),
            None => self.unexpected_end(),
        })
    }

    fn expect_ident(&mut self) -> Result<String, ExecutionError> {
        match self.peek() {
            Some(tok) if tok.kind == TokenKind::Identifier => {
                let name = tok.text.clone();
                self.pos += 1;
                Ok(name)
            }
            Some(tok) => Err(self.unexpected(tok)),
            None => Err(self.unexpected_end()),
        }
    }

    fn unexpected(&self, tok: &Sig) -> ExecutionError {
        ExecutionError::syntax(format!("Unexpected token '{}'", tok.text), tok.offset)
    }

    fn unexpected_end(&self) -> ExecutionError {
        ExecutionError::syntax("Unexpected end of input", self.end_offset)
    }

    fn error_here(&self, message: impl Into<String>) -> ExecutionError {
        let offset = self.peek().map_or(self.end_offset, |t| t.offset);
        ExecutionError::syntax(message, offset)
    }

    fn enter(&mut self) -> Result<(), ExecutionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error_here("Code is nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn statement(&mut self) -> Result<Stmt, ExecutionError> {
        self.enter()?;
        let result = self.statement_inner();
        self.leave();
        result
    }

    fn statement_inner(&mut self) -> Result<Stmt, ExecutionError> {
        let tok = match self.peek() {
            Some(tok) => tok.clone(),
            None => return Err(self.unexpected_end()),
        };

        if tok.kind == TokenKind::Keyword {
            match tok.text.as_str() {
                "let" | "const" | "var" => {
                    let stmt = self.declaration()?;
                    self.consume_semicolon()?;
                    return Ok(stmt);
                }
                "function" if self.peek_at(1).map_or(false, |t| t.kind == TokenKind::Identifier) => {
                    self.bump();
                    let name = self.expect_ident()?;
                    return Ok(Stmt::Function(Rc::new(self.function_rest(Some(name))?)));
                }
                "if" => return self.if_statement(),
                "while" => {
                    self.bump();
                    self.expect("(")?;
                    let test = self.expression()?;
                    self.expect(")")?;
                    let body = Box::new(self.statement()?);
                    return Ok(Stmt::While { test, body });
                }
                "do" => {
                    self.bump();
                    let body = Box::new(self.statement()?);
                    if !self.eat("while") {
                        return Err(self.error_here("Expected 'while' after do block"));
                    }
                    self.expect("(")?;
                    let test = self.expression()?;
                    self.expect(")")?;
                    self.eat(";");
                    return Ok(Stmt::DoWhile { body, test });
                }
                "for" => return self.for_statement(),
                "return" => {
                    self.bump();
                    let argument = if self.at_statement_end() {
                        None
                    } else {
                        Some(self.expression()?)
                    };
                    self.consume_semicolon()?;
                    return Ok(Stmt::Return(argument));
                }
                "break" => {
                    self.bump();
                    self.consume_semicolon()?;
                    return Ok(Stmt::Break);
                }
                "continue" => {
                    self.bump();
                    self.consume_semicolon()?;
                    return Ok(Stmt::Continue);
                }
                "throw" => {
                    self.bump();
                    if self.at_statement_end() {
                        return Err(self.error_here("Illegal newline after throw"));
                    }
                    let argument = self.expression()?;
                    self.consume_semicolon()?;
                    return Ok(Stmt::Throw(argument));
                }
                "try" => return self.try_statement(),
                "class" | "import" | "export" => {
                    return Err(ExecutionError::syntax(
                        format!("'{}' is not supported in the sandbox", tok.text),
                        tok.offset,
                    ));
                }
                _ => {}
            }
        }

        if self.is(";") {
            self.bump();
            return Ok(Stmt::Empty);
        }
        if self.is("{") {
            return Ok(Stmt::Block(self.block()?));
        }

        let expr = self.expression()?;
        self.consume_semicolon()?;
        Ok(Stmt::Expr(expr))
    }

    fn at_statement_end(&self) -> bool {
        match self.peek() {
            None => true,
            Some(tok) => tok.newline_before || self.is(";") || self.is("}"),
        }
    }

    /// Automatic semicolon insertion: a newline, `}` or end of input will do
    fn consume_semicolon(&mut self) -> Result<(), ExecutionError> {
        if self.eat(";") || self.at_statement_end() {
            return Ok(());
        }
        match self.peek() {
            Some(tok) => Err(self.unexpected(tok)),
            None => Ok(()),
        }
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ExecutionError> {
        self.expect("{")?;
        let mut body = Vec::new();
        while !self.is("}") {
            if self.at_end() {
                return Err(self.unexpected_end());
            }
            body.push(self.statement()?);
        }
        self.bump();
        Ok(body)
    }

    fn decl_kind(&mut self) -> Option<DeclKind> {
        let kind = match self.peek().map(|t| t.text.as_str()) {
            Some("let") => DeclKind::Let,
            Some("const") => DeclKind::Const,
            Some("var") => DeclKind::Var,
            _ => return None,
        };
        self.bump();
        Some(kind)
    }

    fn declaration(&mut self) -> Result<Stmt, ExecutionError> {
        let kind = match self.decl_kind() {
            Some(kind) => kind,
            None => return Err(self.error_here("Expected a declaration")),
        };

        let mut declarations = Vec::new();
        loop {
            if self.is("{") || self.is("[") {
                return Err(self.error_here("Destructuring is not supported in the sandbox"));
            }
            let name = self.expect_ident()?;
            let init = if self.eat("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            if kind == DeclKind::Const && init.is_none() {
                return Err(self.error_here("Missing initializer in const declaration"));
            }
            declarations.push((name, init));
            if !self.eat(",") {
                break;
            }
        }
        Ok(Stmt::Declare { kind, declarations })
    }

    fn if_statement(&mut self) -> Result<Stmt, ExecutionError> {
        self.bump();
        self.expect("(")?;
        let test = self.expression()?;
        self.expect(")")?;
        let consequent = Box::new(self.statement()?);
        let alternate = if self.eat("else") {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Stmt::If {
            test,
            consequent,
            alternate,
        })
    }

    fn for_statement(&mut self) -> Result<Stmt, ExecutionError> {
        self.bump();
        self.expect("(")?;

        let is_for_of = matches!(
            self.peek().map(|t| t.text.as_str()),
            Some("let") | Some("const") | Some("var")
        ) && self.peek_at(1).map_or(false, |t| t.kind == TokenKind::Identifier)
            && self.is_at(2, "of");

        if is_for_of {
            let kind = self.decl_kind().unwrap_or(DeclKind::Let);
            let name = self.expect_ident()?;
            self.expect("of")?;
            let iterable = self.assignment()?;
            self.expect(")")?;
            let body = Box::new(self.statement()?);
            return Ok(Stmt::ForOf {
                kind,
                name,
                iterable,
                body,
            });
        }

        let init = if self.is(";") {
            None
        } else if self.is("let") || self.is("const") || self.is("var") {
            Some(Box::new(self.declaration()?))
        } else {
            Some(Box::new(Stmt::Expr(self.expression()?)))
        };
        self.expect(";")?;
        let test = if self.is(";") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(";")?;
        let update = if self.is(")") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(")")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::For {
            init,
            test,
            update,
            body,
        })
    }

    fn try_statement(&mut self) -> Result<Stmt, ExecutionError> {
        self.bump();
        let block = self.block()?;
        let mut param = None;
        let mut handler = None;
        if self.eat("catch") {
            if self.eat("(") {
                param = Some(self.expect_ident()?);
                self.expect(")")?;
            }
            handler = Some(self.block()?);
        }
        let finalizer = if self.eat("finally") {
            Some(self.block()?)
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(self.error_here("Missing catch or finally after try"));
        }
        Ok(Stmt::Try {
            block,
            param,
            handler,
            finalizer,
        })
    }

    /// Parameter list and block body, after `function name`
    fn function_rest(&mut self, name: Option<String>) -> Result<FunctionDef, ExecutionError> {
        let params = self.params()?;
        let body = FunctionBody::Block(self.block()?);
        Ok(FunctionDef { name, params, body })
    }

    fn params(&mut self) -> Result<Vec<String>, ExecutionError> {
        self.expect("(")?;
        let mut params = Vec::new();
        while !self.eat(")") {
            if self.is("...") || self.is("{") || self.is("[") {
                return Err(self.error_here("Rest and destructured parameters are not supported"));
            }
            params.push(self.expect_ident()?);
            if self.is("=") {
                return Err(self.error_here("Default parameters are not supported"));
            }
            if !self.eat(",") && !self.is(")") {
                return Err(match self.peek() {
                    Some(tok) => self.unexpected(tok),
                    None => self.unexpected_end(),
                });
            }
        }
        Ok(params)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expression(&mut self) -> Result<Expr, ExecutionError> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr, ExecutionError> {
        self.enter()?;
        let result = self.assignment_inner();
        self.leave();
        result
    }

    fn assignment_inner(&mut self) -> Result<Expr, ExecutionError> {
        if self.arrow_ahead() {
            return self.arrow_function();
        }

        let left = self.conditional()?;
        let op = match self.peek().filter(|t| t.kind == TokenKind::Operator).map(|t| t.text.as_str()) {
            Some("=") => Some(None),
            Some("+=") => Some(Some(BinaryOp::Add)),
            Some("-=") => Some(Some(BinaryOp::Sub)),
            Some("*=") => Some(Some(BinaryOp::Mul)),
            Some("/=") => Some(Some(BinaryOp::Div)),
            Some("%=") => Some(Some(BinaryOp::Rem)),
            Some("**=") => Some(Some(BinaryOp::Pow)),
            _ => None,
        };

        match op {
            Some(op) => {
                if !left.is_assignable() {
                    return Err(self.error_here("Invalid left-hand side in assignment"));
                }
                self.bump();
                let value = self.assignment()?;
                Ok(Expr::Assign {
                    op,
                    target: Box::new(left),
                    value: Box::new(value),
                })
            }
            None => Ok(left),
        }
    }

    /// `x => ...` or `(a, b) => ...` starts here
    fn arrow_ahead(&self) -> bool {
        match self.peek() {
            Some(tok) if tok.kind == TokenKind::Identifier => self.is_at(1, "=>"),
            Some(_) if self.is("(") => {
                let mut depth = 0usize;
                let mut i = self.pos;
                while let Some(tok) = self.tokens.get(i) {
                    if tok.kind == TokenKind::Punctuation {
                        match tok.text.as_str() {
                            "(" | "[" | "{" => depth += 1,
                            ")" | "]" | "}" => {
                                depth -= 1;
                                if depth == 0 {
                                    return self
                                        .tokens
                                        .get(i + 1)
                                        .map_or(false, |t| t.kind == TokenKind::Operator && t.text == "=>");
                                }
                            }
                            _ => {}
                        }
                    }
                    i += 1;
                }
                false
            }
            _ => false,
        }
    }

    fn arrow_function(&mut self) -> Result<Expr, ExecutionError> {
        let params = if self.is("(") {
            self.params()?
        } else {
            vec![self.expect_ident()?]
        };
        self.expect("=>")?;
        let body = if self.is("{") {
            FunctionBody::Block(self.block()?)
        } else {
            FunctionBody::Expr(Box::new(self.assignment()?))
        };
        Ok(Expr::Function(Rc::new(FunctionDef {
            name: None,
            params,
            body,
        })))
    }

    fn conditional(&mut self) -> Result<Expr, ExecutionError> {
        let test = self.binary(1)?;
        if !self.eat("?") {
            return Ok(test);
        }
        let consequent = self.assignment()?;
        self.expect(":")?;
        let alternate = self.assignment()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        })
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, ExecutionError> {
        let mut left = self.unary()?;

        loop {
            let (prec, op) = match self.peek().filter(|t| t.kind == TokenKind::Operator) {
                Some(tok) => match binary_operator(&tok.text) {
                    Some(info) => info,
                    None => break,
                },
                None => break,
            };
            if prec < min_prec {
                break;
            }
            self.bump();

            // `**` is right-associative, everything else binds left
            let next_min = if matches!(op, Operator::Binary(BinaryOp::Pow)) {
                prec
            } else {
                prec + 1
            };
            let right = self.binary(next_min)?;

            left = match op {
                Operator::Binary(op) => Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                Operator::Logical(op) => Expr::Logical {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
        }

        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExecutionError> {
        self.enter()?;
        let result = self.unary_inner();
        self.leave();
        result
    }

    fn unary_inner(&mut self) -> Result<Expr, ExecutionError> {
        let op = match self.peek().map(|t| (t.kind, t.text.as_str())) {
            Some((TokenKind::Operator, "!")) => Some(UnaryOp::Not),
            Some((TokenKind::Operator, "-")) => Some(UnaryOp::Neg),
            Some((TokenKind::Operator, "+")) => Some(UnaryOp::Plus),
            Some((TokenKind::Operator, "~")) => Some(UnaryOp::BitNot),
            Some((TokenKind::Keyword, "typeof")) => Some(UnaryOp::TypeOf),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let argument = self.unary()?;
            return Ok(Expr::Unary {
                op,
                argument: Box::new(argument),
            });
        }

        if self.is("++") || self.is("--") {
            let increment = self.is("++");
            self.bump();
            let target = self.unary()?;
            if !target.is_assignable() {
                return Err(self.error_here("Invalid left-hand side expression in prefix operation"));
            }
            return Ok(Expr::Update {
                increment,
                prefix: true,
                target: Box::new(target),
            });
        }

        let expr = self.call_member()?;
        let postfix = self
            .peek()
            .filter(|t| !t.newline_before && t.kind == TokenKind::Operator)
            .and_then(|t| match t.text.as_str() {
                "++" => Some(true),
                "--" => Some(false),
                _ => None,
            });
        if let Some(increment) = postfix {
            if !expr.is_assignable() {
                return Err(self.error_here("Invalid left-hand side expression in postfix operation"));
            }
            self.bump();
            return Ok(Expr::Update {
                increment,
                prefix: false,
                target: Box::new(expr),
            });
        }
        Ok(expr)
    }

    fn call_member(&mut self) -> Result<Expr, ExecutionError> {
        let mut expr = self.primary()?;

        loop {
            if self.eat(".") {
                let property = self.property_name()?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property,
                    optional: false,
                };
            } else if self.eat("?.") {
                if self.is("(") {
                    let args = self.arguments()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        optional: true,
                    };
                } else if self.eat("[") {
                    let index = self.expression()?;
                    self.expect("]")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                        optional: true,
                    };
                } else {
                    let property = self.property_name()?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                        optional: true,
                    };
                }
            } else if self.eat("[") {
                let index = self.expression()?;
                self.expect("]")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                    optional: false,
                };
            } else if self.is("(") {
                let args = self.arguments()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    optional: false,
                };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn property_name(&mut self) -> Result<String, ExecutionError> {
        match self.peek() {
            Some(tok) if matches!(tok.kind, TokenKind::Identifier | TokenKind::Keyword) => {
                let name = tok.text.clone();
                self.pos += 1;
                Ok(name)
            }
            Some(tok) => Err(self.unexpected(tok)),
            None => Err(self.unexpected_end()),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ExecutionError> {
        self.expect("(")?;
        let mut args = Vec::new();
        while !self.eat(")") {
            if self.is("...") {
                return Err(self.error_here("Spread arguments are not supported"));
            }
            args.push(self.assignment()?);
            if !self.eat(",") && !self.is(")") {
                return Err(match self.peek() {
                    Some(tok) => self.unexpected(tok),
                    None => self.unexpected_end(),
                });
            }
        }
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, ExecutionError> {
        let tok = match self.peek() {
            Some(tok) => tok.clone(),
            None => return Err(self.unexpected_end()),
        };

        match tok.kind {
            TokenKind::Number => {
                self.bump();
                parse_number(&tok.text)
                    .map(Expr::Number)
                    .ok_or_else(|| ExecutionError::syntax("Invalid number", tok.offset))
            }
            TokenKind::String => {
                self.bump();
                let body = &tok.text[1..tok.text.len() - 1];
                Ok(Expr::Str(lexer::unescape(body)))
            }
            TokenKind::Template => {
                self.bump();
                parse_template(&tok.text, tok.offset)
            }
            TokenKind::Identifier => {
                self.bump();
                Ok(Expr::Ident(tok.text))
            }
            TokenKind::Keyword => match tok.text.as_str() {
                "true" => {
                    self.bump();
                    Ok(Expr::Bool(true))
                }
                "false" => {
                    self.bump();
                    Ok(Expr::Bool(false))
                }
                "null" => {
                    self.bump();
                    Ok(Expr::Null)
                }
                "undefined" => {
                    self.bump();
                    Ok(Expr::Undefined)
                }
                "function" => {
                    self.bump();
                    let name = match self.peek() {
                        Some(t) if t.kind == TokenKind::Identifier => Some(self.expect_ident()?),
                        _ => None,
                    };
                    Ok(Expr::Function(Rc::new(self.function_rest(name)?)))
                }
                "new" | "class" | "import" => Err(ExecutionError::syntax(
                    format!("'{}' is not supported in the sandbox", tok.text),
                    tok.offset,
                )),
                _ => Err(self.unexpected(&tok)),
            },
            TokenKind::Punctuation => match tok.text.as_str() {
                "(" => {
                    self.bump();
                    let expr = self.expression()?;
                    self.expect(")")?;
                    Ok(expr)
                }
                "[" => self.array_literal(),
                "{" => self.object_literal(),
                _ => Err(self.unexpected(&tok)),
            },
            _ => Err(self.unexpected(&tok)),
        }
    }

    fn array_literal(&mut self) -> Result<Expr, ExecutionError> {
        self.expect("[")?;
        let mut elements = Vec::new();
        while !self.eat("]") {
            if self.is("...") {
                return Err(self.error_here("Spread elements are not supported"));
            }
            elements.push(self.assignment()?);
            if !self.eat(",") && !self.is("]") {
                return Err(match self.peek() {
                    Some(tok) => self.unexpected(tok),
                    None => self.unexpected_end(),
                });
            }
        }
        Ok(Expr::Array(elements))
    }

    fn object_literal(&mut self) -> Result<Expr, ExecutionError> {
        self.expect("{")?;
        let mut entries = Vec::new();
        while !self.eat("}") {
            let tok = match self.bump() {
                Some(tok) => tok,
                None => return Err(self.unexpected_end()),
            };
            let key = match tok.kind {
                TokenKind::Identifier | TokenKind::Keyword => tok.text.clone(),
                TokenKind::String => lexer::unescape(&tok.text[1..tok.text.len() - 1]),
                TokenKind::Number => match parse_number(&tok.text) {
                    Some(n) => super::value::format_number(n),
                    None => return Err(ExecutionError::syntax("Invalid number", tok.offset)),
                },
                _ => return Err(self.unexpected(&tok)),
            };

            let value = if self.eat(":") {
                self.assignment()?
            } else if self.is("(") {
                Expr::Function(Rc::new(self.function_rest(Some(key.clone()))?))
            } else if tok.kind == TokenKind::Identifier {
                Expr::Ident(key.clone())
            } else {
                return Err(self.error_here("Expected ':' in object literal"));
            };
            entries.push((key, value));

            if !self.eat(",") && !self.is("}") {
                return Err(match self.peek() {
                    Some(tok) => self.unexpected(tok),
                    None => self.unexpected_end(),
                });
            }
        }
        Ok(Expr::Object(entries))
    }
}

fn is_symbolic(tok: &Sig) -> bool {
    matches!(
        tok.kind,
        TokenKind::Operator | TokenKind::Punctuation | TokenKind::Keyword
    )
}

enum Operator {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

fn binary_operator(text: &str) -> Option<(u8, Operator)> {
    use BinaryOp::*;
    let info = match text {
        "??" => (1, Operator::Logical(LogicalOp::Nullish)),
        "||" => (2, Operator::Logical(LogicalOp::Or)),
        "&&" => (3, Operator::Logical(LogicalOp::And)),
        "|" => (4, Operator::Binary(BitOr)),
        "^" => (5, Operator::Binary(BitXor)),
        "&" => (6, Operator::Binary(BitAnd)),
        "==" => (7, Operator::Binary(Eq)),
        "!=" => (7, Operator::Binary(NotEq)),
        "===" => (7, Operator::Binary(StrictEq)),
        "!==" => (7, Operator::Binary(StrictNotEq)),
        "<" => (8, Operator::Binary(Lt)),
        ">" => (8, Operator::Binary(Gt)),
        "<=" => (8, Operator::Binary(LtEq)),
        ">=" => (8, Operator::Binary(GtEq)),
        "<<" => (9, Operator::Binary(Shl)),
        ">>" => (9, Operator::Binary(Shr)),
        ">>>" => (9, Operator::Binary(UShr)),
        "+" => (10, Operator::Binary(Add)),
        "-" => (10, Operator::Binary(Sub)),
        "*" => (11, Operator::Binary(Mul)),
        "/" => (11, Operator::Binary(Div)),
        "%" => (11, Operator::Binary(Rem)),
        "**" => (12, Operator::Binary(Pow)),
        _ => return None,
    };
    Some(info)
}

fn parse_number(text: &str) -> Option<f64> {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    let lower = cleaned.to_ascii_lowercase();
    let radix = if lower.starts_with("0x") {
        16
    } else if lower.starts_with("0b") {
        2
    } else if lower.starts_with("0o") {
        8
    } else {
        return cleaned.parse::<f64>().ok();
    };
    u64::from_str_radix(&lower[2..], radix).ok().map(|n| n as f64)
}

fn parse_template(text: &str, offset: usize) -> Result<Expr, ExecutionError> {
    let body = &text[1..text.len() - 1];
    let mut quasis = Vec::new();
    let mut exprs = Vec::new();
    let mut raw = String::new();
    let mut chars = body.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                raw.push('\\');
                if let Some((_, next)) = chars.next() {
                    raw.push(next);
                }
            }
            '$' if chars.peek().map(|(_, c)| *c) == Some('{') => {
                chars.next();
                let start = i + 2;
                let mut depth = 1usize;
                let mut end = None;
                for (j, ch) in chars.by_ref() {
                    match ch {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                end = Some(j);
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                let end = end.ok_or_else(|| ExecutionError::syntax("Unterminated template literal", offset))?;
                quasis.push(lexer::unescape(&std::mem::take(&mut raw)));
                // +1 for the opening backtick
                exprs.push(parse_expression(&body[start..end], offset + 1 + start)?);
            }
            _ => raw.push(c),
        }
    }
    quasis.push(lexer::unescape(&raw));

    Ok(Expr::Template { quasis, exprs })
}

fn shift_offset(err: ExecutionError, base: usize) -> ExecutionError {
    match err {
        ExecutionError::Syntax { message, offset } => ExecutionError::Syntax {
            message,
            offset: offset + base,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_expr(src: &str) -> Expr {
        let mut program = parse_program(src).unwrap();
        assert_eq!(program.body.len(), 1);
        match program.body.remove(0) {
            Stmt::Expr(expr) => expr,
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        match single_expr("1 + 2 * 3") {
            Expr::Binary { op: BinaryOp::Add, right, .. } => {
                assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pow_is_right_associative() {
        match single_expr("2 ** 3 ** 2") {
            Expr::Binary { op: BinaryOp::Pow, left, right } => {
                assert!(matches!(*left, Expr::Number(n) if n == 2.0));
                assert!(matches!(*right, Expr::Binary { op: BinaryOp::Pow, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_arrow_functions() {
        assert!(matches!(single_expr("x => x * 2"), Expr::Function(_)));
        assert!(matches!(single_expr("(a, b) => { return a + b }"), Expr::Function(_)));
        // A parenthesised expression is not an arrow
        assert!(matches!(single_expr("(a + b) * 2"), Expr::Binary { .. }));
    }

    #[test]
    fn test_semicolon_insertion() {
        let program = parse_program("let a = 1\nlet b = 2\na + b").unwrap();
        assert_eq!(program.body.len(), 3);
        assert!(parse_program("let a = 1 let b = 2").is_err());
    }

    #[test]
    fn test_return_newline_ends_statement() {
        let program = parse_program("function f() { return\n 5 }").unwrap();
        match &program.body[0] {
            Stmt::Function(def) => match &def.body {
                FunctionBody::Block(body) => {
                    assert!(matches!(body[0], Stmt::Return(None)));
                }
                _ => panic!("expected block body"),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_template_literal_parts() {
        match single_expr("`a${1 + 1}b${x}`") {
            Expr::Template { quasis, exprs } => {
                assert_eq!(quasis, vec!["a", "b", ""]);
                assert_eq!(exprs.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_markup_is_a_syntax_error() {
        let err = parse_program("<div>Hello</div>").unwrap_err();
        assert!(err.is_syntax());
    }

    #[test]
    fn test_unsupported_constructs_are_rejected() {
        assert!(parse_program("new Date()").is_err());
        assert!(parse_program("class A {}").is_err());
        assert!(parse_program("const { a } = obj").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let src = format!("{}1{}", "(".repeat(500), ")".repeat(500));
        let err = parse_program(&src).unwrap_err();
        assert!(err.message().contains("nested too deeply"));
    }

    #[test]
    fn test_for_of_and_classic_for() {
        let program = parse_program("for (const x of [1, 2]) {}\nfor (let i = 0; i < 3; i++) {}").unwrap();
        assert!(matches!(program.body[0], Stmt::ForOf { .. }));
        assert!(matches!(program.body[1], Stmt::For { .. }));
    }
}
