use crate::lexer::{self, LexingError, Token, WordPart};
use thiserror::Error;

/// A shell word, either a simple literal or a compound (with substitutions)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Word {
    Literal(String),
    Compound(Vec<WordPart>),
}

impl Word {
    pub fn literal(s: impl Into<String>) -> Self {
        Word::Literal(s.into())
    }

    fn from_parts(mut parts: Vec<WordPart>) -> Self {
        if parts.len() == 1 {
            if let WordPart::Literal(s) = &mut parts[0] {
                return Word::Literal(std::mem::take(s));
            }
        }
        Word::Compound(parts)
    }

    /// The literal text, if this word needs no expansion.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Word::Literal(s) => Some(s),
            Word::Compound(_) => None,
        }
    }
}

/// Items separated by `;`, `&` or newlines. Result of the last item is the result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sequence {
    pub items: Vec<SeqItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqItem {
    pub logical: Logical,
    /// Terminated by `&`.
    pub background: bool,
}

/// Operands joined by `&&` and `||`, evaluated left to right with short-circuiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logical {
    pub first: Operand,
    pub rest: Vec<(LogicalOp, Operand)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Pipe(Pipeline),
    /// A parenthesized sequence standing on its own.
    Subshell(Subshell),
    If(Box<IfClause>),
}

/// Stages connected stdout-to-stdin by `|`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Cmd(SimpleCommand),
    Subshell(Subshell),
    Script(ScriptBlock),
}

/// A **simple command** unit, which includes the command name and its arguments,
/// variable assignments preceding the command, and I/O redirections.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SimpleCommand {
    /// `NAME=value` words before the command name; they only apply to this command.
    pub assignments: Vec<Assignment>,
    /// The command name and its arguments (`argv[0]`, `argv[1]`, etc.).
    pub words: Vec<Word>,
    /// Flat operator/operand pairs, in source order.
    pub redirections: Vec<RedirWord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub name: String,
    pub value: Word,
}

/// One element of a redirection token array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirWord {
    Operator(String),
    Target(Word),
    Descriptor(i32),
}

/// `( ... )`, or the body of `$(...)` when `capture` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subshell {
    pub body: Sequence,
    pub capture: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfClause {
    /// `if`/`elif` conditions with their bodies, in order.
    pub branches: Vec<(Sequence, Sequence)>,
    pub otherwise: Option<Sequence>,
}

/// How an embedded script block produces its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptMode {
    /// `{ ... }`: the value of the block is the result.
    Return,
    /// `{* ... }`: the block emits values one by one.
    Iterable,
    /// `{& ... }`: the block drives its streams and settles explicitly.
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptBlock {
    pub source: String,
    pub mode: ScriptMode,
    pub args: Vec<Word>,
    pub redirections: Vec<RedirWord>,
}

/// Errors that can occur during the AST construction (parsing) phase.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParsingError {
    #[error("syntax error: {0}")]
    Lexing(#[from] LexingError),
    /// Encountered a token that was not expected at the current position according to the grammar.
    #[error("syntax error near unexpected token `{0}'")]
    UnexpectedToken(Token),
    /// Reached the end of the token stream prematurely, indicating an incomplete command or structure.
    #[error("syntax error: unexpected end of input")]
    UnexpectedEnd,
    /// A redirection operator without a file or descriptor after it.
    #[error("syntax error: expected a target after `{0}'")]
    ExpectedWord(String),
    /// A command, subshell or branch body with nothing in it.
    #[error("syntax error: empty command")]
    EmptyCommand,
    #[error("syntax error: `&{fd}' cannot follow `{op}'")]
    DescriptorNotAllowed { op: String, fd: i32 },
}

const KEYWORDS: [&str; 5] = ["then", "elif", "else", "fi", "if"];

fn is_keyword(token: &Token, keyword: &str) -> bool {
    matches!(token, Token::Word(parts)
        if matches!(parts.as_slice(), [WordPart::Literal(s)] if s == keyword))
}

fn is_name(s: &str) -> bool {
    crate::expand::is_name(s)
}

struct AstBuilder {
    tokens: Vec<Token>,
    pos: usize,
}

impl AstBuilder {
    fn from(tokens: Vec<Token>) -> Self {
        AstBuilder { tokens, pos: 0 }
    }

    fn build_ast(mut self) -> Result<Sequence, ParsingError> {
        let seq = self.parse_sequence(|_| false)?;

        // Ensure we consumed all tokens
        if let Some(token) = self.peek() {
            return Err(ParsingError::UnexpectedToken(token.clone()));
        }

        Ok(seq)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParsingError> {
        match self.consume() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ParsingError::UnexpectedToken(token)),
            None => Err(ParsingError::UnexpectedEnd),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParsingError> {
        match self.consume() {
            Some(token) if is_keyword(&token, keyword) => Ok(()),
            Some(token) => Err(ParsingError::UnexpectedToken(token)),
            None => Err(ParsingError::UnexpectedEnd),
        }
    }

    fn skip_newlines(&mut self) {
        while let Some(Token::Newline) = self.peek() {
            self.consume();
        }
    }

    /// Parse items until end of input or a token accepted by `is_end`.
    fn parse_sequence(&mut self, is_end: fn(&Token) -> bool) -> Result<Sequence, ParsingError> {
        let mut items = Vec::new();
        loop {
            while let Some(Token::Newline | Token::Semi) = self.peek() {
                self.consume();
            }
            match self.peek() {
                None => break,
                Some(token) if is_end(token) => break,
                _ => {}
            }

            let logical = self.parse_logical()?;
            let background = matches!(self.peek(), Some(Token::Amp));
            items.push(SeqItem {
                logical,
                background,
            });

            match self.peek() {
                Some(Token::Amp | Token::Semi | Token::Newline) => {
                    self.consume();
                }
                Some(token) if is_end(token) => break,
                None => break,
                Some(token) => return Err(ParsingError::UnexpectedToken(token.clone())),
            }
        }
        Ok(Sequence { items })
    }

    /// Like [`Self::parse_sequence`], but at least one item is required.
    fn parse_body(&mut self, is_end: fn(&Token) -> bool) -> Result<Sequence, ParsingError> {
        let seq = self.parse_sequence(is_end)?;
        if seq.items.is_empty() {
            return match self.peek() {
                Some(token) => Err(ParsingError::UnexpectedToken(token.clone())),
                None => Err(ParsingError::UnexpectedEnd),
            };
        }
        Ok(seq)
    }

    fn parse_logical(&mut self) -> Result<Logical, ParsingError> {
        let first = self.parse_operand()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::And) => LogicalOp::And,
                Some(Token::Or) => LogicalOp::Or,
                _ => break,
            };
            self.consume();
            self.skip_newlines();
            rest.push((op, self.parse_operand()?));
        }
        Ok(Logical { first, rest })
    }

    fn parse_operand(&mut self) -> Result<Operand, ParsingError> {
        if self.peek().is_some_and(|t| is_keyword(t, "if")) {
            return Ok(Operand::If(Box::new(self.parse_if()?)));
        }
        let mut pipeline = self.parse_pipeline()?;
        if pipeline.stages.len() == 1 && matches!(pipeline.stages[0], Stage::Subshell(_)) {
            if let Some(Stage::Subshell(subshell)) = pipeline.stages.pop() {
                return Ok(Operand::Subshell(subshell));
            }
        }
        Ok(Operand::Pipe(pipeline))
    }

    fn parse_if(&mut self) -> Result<IfClause, ParsingError> {
        self.expect_keyword("if")?;
        let mut branches = Vec::new();
        let mut otherwise = None;
        loop {
            let condition = self.parse_body(|t| is_keyword(t, "then"))?;
            self.expect_keyword("then")?;
            let body = self.parse_body(|t| {
                is_keyword(t, "elif") || is_keyword(t, "else") || is_keyword(t, "fi")
            })?;
            branches.push((condition, body));

            match self.consume() {
                Some(t) if is_keyword(&t, "elif") => continue,
                Some(t) if is_keyword(&t, "else") => {
                    otherwise = Some(self.parse_body(|t| is_keyword(t, "fi"))?);
                    self.expect_keyword("fi")?;
                    break;
                }
                Some(t) if is_keyword(&t, "fi") => break,
                Some(t) => return Err(ParsingError::UnexpectedToken(t)),
                None => return Err(ParsingError::UnexpectedEnd),
            }
        }
        Ok(IfClause {
            branches,
            otherwise,
        })
    }

    /// Parse a pipeline: stage ('|' stage)*
    fn parse_pipeline(&mut self) -> Result<Pipeline, ParsingError> {
        let mut stages = vec![self.parse_stage()?];
        while let Some(Token::PipeOp) = self.peek() {
            self.consume();
            self.skip_newlines();
            stages.push(self.parse_stage()?);
        }
        Ok(Pipeline { stages })
    }

    fn parse_stage(&mut self) -> Result<Stage, ParsingError> {
        match self.peek() {
            Some(Token::LParen) => {
                self.consume();
                let body = self.parse_body(|t| *t == Token::RParen)?;
                self.expect(Token::RParen)?;
                Ok(Stage::Subshell(Subshell {
                    body,
                    capture: false,
                }))
            }
            Some(Token::Script { .. }) => {
                let Some(Token::Script { mode, body }) = self.consume() else {
                    return Err(ParsingError::UnexpectedEnd);
                };
                let mut args = Vec::new();
                let mut redirections = Vec::new();
                loop {
                    match self.peek() {
                        Some(Token::Word(_)) => args.push(self.parse_word()?),
                        Some(Token::Redirect(_)) => self.parse_redirect(&mut redirections)?,
                        _ => break,
                    }
                }
                Ok(Stage::Script(ScriptBlock {
                    source: body,
                    mode,
                    args,
                    redirections,
                }))
            }
            _ => Ok(Stage::Cmd(self.parse_command()?)),
        }
    }

    /// Parse a command: (assignment* (word | redirect)+)
    fn parse_command(&mut self) -> Result<SimpleCommand, ParsingError> {
        let mut cmd = SimpleCommand::default();

        loop {
            match self.peek() {
                Some(Token::Word(parts)) => {
                    if cmd.words.is_empty() {
                        if let Some(assignment) = Self::as_assignment(parts) {
                            cmd.assignments.push(assignment);
                            self.consume();
                            continue;
                        }
                        if matches!(parts.as_slice(), [WordPart::Literal(s)] if KEYWORDS.contains(&s.as_str())) {
                            return Err(ParsingError::UnexpectedToken(Token::Word(parts.clone())));
                        }
                    }
                    let word = self.parse_word()?;
                    cmd.words.push(word);
                }
                Some(Token::Redirect(_)) => self.parse_redirect(&mut cmd.redirections)?,
                _ => break,
            }
        }

        // A command must have at least something (words, assignment, or redirect)
        if cmd.assignments.is_empty() && cmd.words.is_empty() && cmd.redirections.is_empty() {
            return match self.peek() {
                Some(token) => Err(ParsingError::UnexpectedToken(token.clone())),
                None => Err(ParsingError::EmptyCommand),
            };
        }

        Ok(cmd)
    }

    /// `NAME=value` where the name part is unquoted literal text.
    fn as_assignment(parts: &[WordPart]) -> Option<Assignment> {
        let Some(WordPart::Literal(first)) = parts.first() else {
            return None;
        };
        let (name, value) = first.split_once('=')?;
        if !is_name(name) {
            return None;
        }
        let mut value_parts = Vec::with_capacity(parts.len());
        if !value.is_empty() {
            value_parts.push(WordPart::Literal(value.to_string()));
        }
        value_parts.extend(parts[1..].iter().cloned());
        Some(Assignment {
            name: name.to_string(),
            value: Word::from_parts(value_parts),
        })
    }

    /// Parse an operator and its operand into the flat redirection array.
    fn parse_redirect(&mut self, out: &mut Vec<RedirWord>) -> Result<(), ParsingError> {
        let op = match self.consume() {
            Some(Token::Redirect(op)) => op,
            Some(token) => return Err(ParsingError::UnexpectedToken(token)),
            None => return Err(ParsingError::UnexpectedEnd),
        };
        match self.consume() {
            Some(Token::FdTarget(fd)) => {
                if op.starts_with('&') || op.ends_with("<>") {
                    return Err(ParsingError::DescriptorNotAllowed { op, fd });
                }
                out.push(RedirWord::Operator(op));
                out.push(RedirWord::Descriptor(fd));
            }
            Some(Token::Word(parts)) => {
                out.push(RedirWord::Operator(op));
                out.push(RedirWord::Target(Word::from_parts(parts)));
            }
            _ => return Err(ParsingError::ExpectedWord(op)),
        }
        Ok(())
    }

    fn parse_word(&mut self) -> Result<Word, ParsingError> {
        match self.consume() {
            Some(Token::Word(parts)) => Ok(Word::from_parts(parts)),
            Some(token) => Err(ParsingError::UnexpectedToken(token)),
            None => Err(ParsingError::UnexpectedEnd),
        }
    }
}

/// Constructs the syntax tree of one input line from its tokens.
pub fn construct_ast(tokens: Vec<Token>) -> Result<Sequence, ParsingError> {
    let builder = AstBuilder::from(tokens);
    builder.build_ast()
}

/// Tokenize and parse `text`.
pub fn parse(text: &str) -> Result<Sequence, ParsingError> {
    construct_ast(lexer::split_into_tokens(text)?)
}
