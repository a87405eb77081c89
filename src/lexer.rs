//! A module implementing lexical analysis (tokenization) for the shell language.

use crate::parser::ScriptMode;
use std::fmt;
use thiserror::Error;

/// A part of a word: literal text or something expanded at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WordPart {
    /// Literal text that requires no further processing.
    Literal(String),
    /// Command substitution in the format `$(...)`. Contains the text inside the parentheses.
    CmdSubst(String),
    /// Parameter substitution `$NAME` or `${NAME}`. Contains the name.
    ParamSubst(String),
    /// `$?`, the status of the last pipeline.
    LastStatus,
}

/// Represents a token resulting from lexical analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// A word token, which may be composed of multiple parts (`WordPart`).
    Word(Vec<WordPart>),
    /// `|`
    PipeOp,
    /// `&&`
    And,
    /// `||`
    Or,
    /// `;`
    Semi,
    /// `&`
    Amp,
    Newline,
    LParen,
    RParen,
    /// A redirection operator such as `>`, `2>>`, `&>` or `<>`.
    Redirect(String),
    /// `&n` operand directly following a redirection operator.
    FdTarget(i32),
    /// Embedded script block, braces stripped.
    Script { mode: ScriptMode, body: String },
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(parts) => {
                for part in parts {
                    match part {
                        WordPart::Literal(s) => f.write_str(s)?,
                        WordPart::CmdSubst(s) => write!(f, "$({s})")?,
                        WordPart::ParamSubst(s) => write!(f, "${{{s}}}")?,
                        WordPart::LastStatus => f.write_str("$?")?,
                    }
                }
                Ok(())
            }
            Token::PipeOp => f.write_str("|"),
            Token::And => f.write_str("&&"),
            Token::Or => f.write_str("||"),
            Token::Semi => f.write_str(";"),
            Token::Amp => f.write_str("&"),
            Token::Newline => f.write_str("newline"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Redirect(op) => f.write_str(op),
            Token::FdTarget(fd) => write!(f, "&{fd}"),
            Token::Script { .. } => f.write_str("{"),
        }
    }
}

/// Errors that can occur during the lexical analysis process.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LexingError {
    #[error("unterminated quote")]
    UnfinishedQuote,
    #[error("unterminated `$(`")]
    UnfinishedCmdSubst,
    #[error("unterminated `${{`")]
    UnfinishedParamSubst,
    #[error("unterminated script block")]
    UnfinishedScript,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexingState {
    Start,
    ReadingWord,
    ReadingSingleQuote,
    ReadingDoubleQuote,
}

struct LexingFSM {
    input: Vec<char>,
    pos: usize,
    state: LexingState,
    current_word: Vec<WordPart>,
    buffer: String,
    in_word: bool,
}

impl LexingFSM {
    fn new(line: &str) -> Self {
        LexingFSM {
            input: line.chars().collect(),
            pos: 0,
            state: LexingState::Start,
            current_word: Vec::new(),
            buffer: String::new(),
            in_word: false,
        }
    }

    /// Performs lexical analysis on the input string and returns a vector of tokens.
    ///
    /// The method iterates through the input, updating the FSM's state and accumulating
    /// tokens based on the shell's tokenization rules, including handling quotes and substitutions.
    fn make_tokens(&mut self) -> Result<Vec<Token>, LexingError> {
        let mut out = Vec::new();

        while let Some(ch) = self.read_char() {
            match self.state {
                LexingState::Start => self.handle_start(ch, &mut out)?,
                LexingState::ReadingWord => self.handle_word(ch, &mut out)?,
                LexingState::ReadingSingleQuote => self.handle_single_quote(ch),
                LexingState::ReadingDoubleQuote => self.handle_double_quote(ch)?,
            }
        }

        if matches!(
            self.state,
            LexingState::ReadingSingleQuote | LexingState::ReadingDoubleQuote
        ) {
            return Err(LexingError::UnfinishedQuote);
        }

        self.finish_word(&mut out);
        Ok(out)
    }

    fn read_char(&mut self) -> Option<char> {
        let ch = self.input.get(self.pos).copied();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn peek_char(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.input.get(self.pos + n).copied()
    }

    /// Consume the next char if it is `expected`.
    fn eat(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn handle_start(&mut self, ch: char, out: &mut Vec<Token>) -> Result<(), LexingError> {
        match ch {
            ' ' | '\t' => {}
            '#' => {
                while self.peek_char().is_some_and(|c| c != '\n') {
                    self.read_char();
                }
            }
            '{' if matches!(self.peek_char(), Some('*' | '&' | '}' | ' ' | '\t' | '\n')) => {
                let mode = if self.eat('*') {
                    ScriptMode::Iterable
                } else if self.eat('&') {
                    ScriptMode::Stream
                } else {
                    ScriptMode::Return
                };
                let body = self.collect_script()?;
                out.push(Token::Script { mode, body });
            }
            c => self.handle_word(c, out)?,
        }
        Ok(())
    }

    fn handle_word(&mut self, ch: char, out: &mut Vec<Token>) -> Result<(), LexingError> {
        match ch {
            ' ' | '\t' => self.finish_word(out),
            '\n' => {
                self.finish_word(out);
                out.push(Token::Newline);
            }
            ';' => {
                self.finish_word(out);
                out.push(Token::Semi);
            }
            '(' => {
                self.finish_word(out);
                out.push(Token::LParen);
            }
            ')' => {
                self.finish_word(out);
                out.push(Token::RParen);
            }
            '|' => {
                self.finish_word(out);
                out.push(if self.eat('|') { Token::Or } else { Token::PipeOp });
            }
            '&' => {
                self.finish_word(out);
                if self.eat('&') {
                    out.push(Token::And);
                } else if self.eat('>') {
                    let op = if self.eat('>') { "&>>" } else { "&>" };
                    self.push_redirect(op.to_string(), out);
                } else {
                    out.push(Token::Amp);
                }
            }
            '<' | '>' => {
                let mut op = match self.take_fd_prefix() {
                    Some(fd) => fd,
                    None => {
                        self.finish_word(out);
                        String::new()
                    }
                };
                op.push(ch);
                if (ch == '<' && self.eat('>')) || (ch == '>' && self.eat('>')) {
                    op.push('>');
                }
                self.push_redirect(op, out);
            }
            '\'' => {
                self.start_word();
                self.state = LexingState::ReadingSingleQuote;
            }
            '"' => {
                self.start_word();
                self.state = LexingState::ReadingDoubleQuote;
            }
            '\\' => {
                self.start_word();
                if let Some(c) = self.read_char() {
                    if c != '\n' {
                        self.buffer.push(c);
                    }
                }
            }
            '$' => {
                self.start_word();
                self.handle_dollar()?;
            }
            c => {
                self.start_word();
                self.buffer.push(c);
            }
        }
        Ok(())
    }

    fn handle_single_quote(&mut self, ch: char) {
        match ch {
            '\'' => self.state = LexingState::ReadingWord,
            c => self.buffer.push(c),
        }
    }

    fn handle_double_quote(&mut self, ch: char) -> Result<(), LexingError> {
        match ch {
            '"' => self.state = LexingState::ReadingWord,
            '\\' => match self.peek_char() {
                Some(c @ ('"' | '\\' | '$' | '`')) => {
                    self.read_char();
                    self.buffer.push(c);
                }
                Some('\n') => {
                    self.read_char();
                }
                _ => self.buffer.push('\\'),
            },
            '$' => self.handle_dollar()?,
            c => self.buffer.push(c),
        }
        Ok(())
    }

    /// Called right after a `$`.
    fn handle_dollar(&mut self) -> Result<(), LexingError> {
        let part = match self.peek_char() {
            Some('(') => {
                self.read_char();
                WordPart::CmdSubst(self.collect_cmdsubst()?)
            }
            Some('{') => {
                self.read_char();
                WordPart::ParamSubst(self.collect_paramsubst()?)
            }
            Some('?') => {
                self.read_char();
                WordPart::LastStatus
            }
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(c) = self.peek_char() {
                    if !(c.is_ascii_alphanumeric() || c == '_') {
                        break;
                    }
                    name.push(c);
                    self.read_char();
                }
                WordPart::ParamSubst(name)
            }
            _ => {
                self.buffer.push('$');
                return Ok(());
            }
        };
        self.flush_literal();
        self.current_word.push(part);
        Ok(())
    }

    /// Characters within `$(...)`, respecting nested parentheses and quotes.
    fn collect_cmdsubst(&mut self) -> Result<String, LexingError> {
        let mut depth = 1;
        let mut quote: Option<char> = None;
        let mut s = String::new();
        while let Some(ch) = self.read_char() {
            match (quote, ch) {
                (Some(q), c) if c == q => {
                    quote = None;
                    s.push(c);
                }
                (Some('"'), '\\') => {
                    s.push('\\');
                    if let Some(next) = self.read_char() {
                        s.push(next);
                    }
                }
                (Some(_), c) => s.push(c),
                (None, '\'' | '"') => {
                    quote = Some(ch);
                    s.push(ch);
                }
                (None, '(') => {
                    depth += 1;
                    s.push(ch);
                }
                (None, ')') => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(s);
                    }
                    s.push(ch);
                }
                (None, c) => s.push(c),
            }
        }
        Err(LexingError::UnfinishedCmdSubst)
    }

    /// Characters within `${...}`.
    fn collect_paramsubst(&mut self) -> Result<String, LexingError> {
        let mut s = String::new();
        while let Some(ch) = self.read_char() {
            if ch == '}' {
                return Ok(s);
            }
            s.push(ch);
        }
        Err(LexingError::UnfinishedParamSubst)
    }

    /// Script body up to the matching `}`. Nested braces and quoted strings
    /// are kept verbatim.
    fn collect_script(&mut self) -> Result<String, LexingError> {
        let mut depth = 1;
        let mut quote: Option<char> = None;
        let mut s = String::new();
        while let Some(ch) = self.read_char() {
            match (quote, ch) {
                (Some(_), '\\') => {
                    s.push('\\');
                    if let Some(next) = self.read_char() {
                        s.push(next);
                    }
                }
                (Some(q), c) if c == q => {
                    quote = None;
                    s.push(c);
                }
                (Some(_), c) => s.push(c),
                (None, '\'' | '"' | '`') => {
                    quote = Some(ch);
                    s.push(ch);
                }
                (None, '{') => {
                    depth += 1;
                    s.push(ch);
                }
                (None, '}') => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(s.trim().to_string());
                    }
                    s.push(ch);
                }
                (None, c) => s.push(c),
            }
        }
        Err(LexingError::UnfinishedScript)
    }

    /// Unquoted digits immediately before `<` or `>` name the descriptor.
    fn take_fd_prefix(&mut self) -> Option<String> {
        let is_fd = self.in_word
            && self.current_word.is_empty()
            && !self.buffer.is_empty()
            && self.buffer.chars().all(|c| c.is_ascii_digit());
        if !is_fd {
            return None;
        }
        self.in_word = false;
        self.state = LexingState::Start;
        Some(std::mem::take(&mut self.buffer))
    }

    /// Emit a redirection operator and an `&n` operand if one follows.
    fn push_redirect(&mut self, op: String, out: &mut Vec<Token>) {
        out.push(Token::Redirect(op));
        while matches!(self.peek_char(), Some(' ' | '\t')) {
            self.read_char();
        }
        if self.peek_char() == Some('&') && self.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) {
            self.read_char();
            let mut digits = String::new();
            while let Some(c) = self.peek_char().filter(char::is_ascii_digit) {
                digits.push(c);
                self.read_char();
            }
            if let Ok(fd) = digits.parse() {
                out.push(Token::FdTarget(fd));
            }
        }
        self.state = LexingState::Start;
    }

    fn start_word(&mut self) {
        self.in_word = true;
        self.state = LexingState::ReadingWord;
    }

    fn flush_literal(&mut self) {
        if !self.buffer.is_empty() {
            self.current_word
                .push(WordPart::Literal(std::mem::take(&mut self.buffer)));
        }
    }

    fn finish_word(&mut self, out: &mut Vec<Token>) {
        self.flush_literal();
        if self.in_word {
            out.push(Token::Word(std::mem::take(&mut self.current_word)));
        }
        self.in_word = false;
        self.state = LexingState::Start;
    }
}

/// The main entry point function to perform lexical analysis.
///
/// Creates and runs the finite state machine to tokenize the input line.
pub fn split_into_tokens(line: &str) -> Result<Vec<Token>, LexingError> {
    let mut lexer = LexingFSM::new(line);
    lexer.make_tokens()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(s: &str) -> Token {
        Token::Word(vec![WordPart::Literal(s.to_string())])
    }

    #[test]
    fn splits_words_and_operators() {
        let tokens = split_into_tokens("a|b && c || d; e &").unwrap();
        assert_eq!(
            tokens,
            vec![
                word("a"),
                Token::PipeOp,
                word("b"),
                Token::And,
                word("c"),
                Token::Or,
                word("d"),
                Token::Semi,
                word("e"),
                Token::Amp,
            ]
        );
    }

    #[test]
    fn quotes_join_into_one_word() {
        let tokens = split_into_tokens(r#"echo 'a b'"c $X" """#).unwrap();
        assert_eq!(
            tokens,
            vec![
                word("echo"),
                Token::Word(vec![
                    WordPart::Literal("a bc ".to_string()),
                    WordPart::ParamSubst("X".to_string()),
                ]),
                Token::Word(vec![]),
            ]
        );
    }

    #[test]
    fn substitutions() {
        let tokens = split_into_tokens("x$HOME/${USER}$? $(echo \")\")").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Word(vec![
                    WordPart::Literal("x".to_string()),
                    WordPart::ParamSubst("HOME".to_string()),
                    WordPart::Literal("/".to_string()),
                    WordPart::ParamSubst("USER".to_string()),
                    WordPart::LastStatus,
                ]),
                Token::Word(vec![WordPart::CmdSubst("echo \")\"".to_string())]),
            ]
        );
    }

    #[test]
    fn redirection_operators_with_descriptors() {
        let tokens = split_into_tokens("cmd 2>&1 >>out 3<> f &> all <in").unwrap();
        assert_eq!(
            tokens,
            vec![
                word("cmd"),
                Token::Redirect("2>".into()),
                Token::FdTarget(1),
                Token::Redirect(">>".into()),
                word("out"),
                Token::Redirect("3<>".into()),
                word("f"),
                Token::Redirect("&>".into()),
                word("all"),
                Token::Redirect("<".into()),
                word("in"),
            ]
        );
    }

    #[test]
    fn digits_inside_a_word_are_not_a_descriptor() {
        let tokens = split_into_tokens("a2>x").unwrap();
        assert_eq!(tokens, vec![word("a2"), Token::Redirect(">".into()), word("x")]);
    }

    #[test]
    fn script_blocks_keep_their_body() {
        let tokens = split_into_tokens(r#"{* emit("}"); if true { emit(1) } } a"#).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Script {
                    mode: ScriptMode::Iterable,
                    body: r#"emit("}"); if true { emit(1) }"#.to_string(),
                },
                word("a"),
            ]
        );
        let tokens = split_into_tokens("{& resolve(0) }").unwrap();
        assert!(matches!(&tokens[0], Token::Script { mode: ScriptMode::Stream, .. }));
        assert_eq!(split_into_tokens("{a,b}").unwrap(), vec![word("{a,b}")]);
    }

    #[test]
    fn unfinished_constructs_are_errors() {
        assert_eq!(split_into_tokens("echo 'x"), Err(LexingError::UnfinishedQuote));
        assert_eq!(split_into_tokens("echo $(ls"), Err(LexingError::UnfinishedCmdSubst));
        assert_eq!(split_into_tokens("echo ${X"), Err(LexingError::UnfinishedParamSubst));
        assert_eq!(split_into_tokens("{ 1 + 1"), Err(LexingError::UnfinishedScript));
    }

    #[test]
    fn comments_and_newlines() {
        let tokens = split_into_tokens("a # note\nb").unwrap();
        assert_eq!(tokens, vec![word("a"), Token::Newline, word("b")]);
    }
}
