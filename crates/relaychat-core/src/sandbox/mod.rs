//! Capability-free execution of code fragments found in model replies.
//!
//! A fragment is classified with real parsers: a program in the sandbox
//! language is evaluated by the interpreter, JSX-style markup becomes a
//! static preview, and anything else is reported as an error. Every call
//! gets a fresh interpreter which is dropped when the call returns.

pub mod error;
pub mod interp;
pub mod lexer;
pub mod markup;
pub mod parser;
pub mod value;

use tracing::debug;

pub use error::{ExecutionError, RuntimeErrorKind};
pub use interp::{evaluate, Evaluation, SandboxLimits};
pub use lexer::{tokenize, Token, TokenKind};
pub use markup::{find_markup, Attribute, AttributeValue, MarkupNode};
pub use parser::{parse_program, Program};

/// Stack for the evaluation thread; parsing and evaluation both recurse
pub(crate) const EVAL_STACK_SIZE: usize = 32 * 1024 * 1024;

/// What a fragment turned out to be
#[derive(Debug)]
pub enum FragmentKind {
    Expression(Program),
    Markup(MarkupNode),
    /// Neither parser accepted it; carries the program parse error
    Unrecognized(ExecutionError),
}

pub fn classify(source: &str) -> FragmentKind {
    match parse_program(source) {
        Ok(program) => FragmentKind::Expression(program),
        Err(err) => match find_markup(source) {
            Some(Ok(node)) => FragmentKind::Markup(node),
            Some(Err(markup_err)) => {
                debug!("fragment is neither a program ({}) nor markup ({})", err, markup_err);
                FragmentKind::Unrecognized(err)
            }
            None => FragmentKind::Unrecognized(err),
        },
    }
}

/// Displayable outcome of executing a fragment
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionView {
    Output { console: Vec<String>, value: String },
    Preview { root: MarkupNode },
    Error { console: Vec<String>, error: ExecutionError },
}

impl ExecutionView {
    pub fn is_error(&self) -> bool {
        matches!(self, ExecutionView::Error { .. })
    }

    /// Lines as they should be shown under the code block
    pub fn lines(&self) -> Vec<String> {
        match self {
            ExecutionView::Output { console, value } => {
                let mut lines = console.clone();
                if console.is_empty() || value != "undefined" {
                    lines.push(format!("Output: {}", value));
                }
                lines
            }
            ExecutionView::Preview { root } => {
                let mut lines = vec!["Preview:".to_string()];
                lines.extend(root.outline());
                lines
            }
            ExecutionView::Error { console, error } => {
                let mut lines = console.clone();
                lines.push(format!("Error: {}", error.message()));
                lines
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Executor {
    limits: SandboxLimits,
}

impl Executor {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Classify and run a fragment on a dedicated thread.
    ///
    /// Never panics: a failure to start the thread or a panic inside it is
    /// reported as an error view like any other.
    pub fn execute(&self, source: &str) -> ExecutionView {
        let source = source.to_string();
        let limits = self.limits.clone();

        let spawned = std::thread::Builder::new()
            .name("sandbox".to_string())
            .stack_size(EVAL_STACK_SIZE)
            .spawn(move || run_fragment(&source, &limits));

        match spawned {
            Ok(handle) => handle.join().unwrap_or_else(|_| ExecutionView::Error {
                console: Vec::new(),
                error: ExecutionError::Limit("Evaluation aborted".to_string()),
            }),
            Err(e) => ExecutionView::Error {
                console: Vec::new(),
                error: ExecutionError::runtime(
                    RuntimeErrorKind::Error,
                    format!("Could not start the sandbox: {}", e),
                ),
            },
        }
    }
}

/// Execute with the default limits
pub fn execute(source: &str) -> ExecutionView {
    Executor::default().execute(source)
}

fn run_fragment(source: &str, limits: &SandboxLimits) -> ExecutionView {
    match classify(source) {
        FragmentKind::Expression(program) => {
            let evaluation = evaluate(&program, limits);
            match evaluation.result {
                Ok(value) => ExecutionView::Output {
                    console: evaluation.console,
                    value,
                },
                Err(error) => {
                    debug!("fragment failed: {}", error);
                    ExecutionView::Error {
                        console: evaluation.console,
                        error,
                    }
                }
            }
        }
        FragmentKind::Markup(root) => ExecutionView::Preview { root },
        FragmentKind::Unrecognized(error) => ExecutionView::Error {
            console: Vec::new(),
            error,
        },
    }
}
