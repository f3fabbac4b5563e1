//! Charter tokenizer — converts contract source into a token stream
//!
//! Handles: keywords, identifiers, string literals (single or double
//! quoted), integer/float literals, operators and punctuation.
//! Comments (`//` and `/* */`) are discarded.
//!
//! Guarantees:
//! - Deterministic: same input always produces same token stream
//! - Every token and every error carries a line:column position

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Token types for Charter syntax
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    Contract,
    Collection,
    Function,
    Let,
    If,
    Else,
    While,
    For,
    Break,
    Continue,
    Return,
    Throw,
    True,
    False,
    Null,
    This,

    // Literals
    StringLiteral(String),
    IntegerLiteral(i64),
    FloatLiteral(f64),

    // Punctuation
    LBrace,    // {
    RBrace,    // }
    LParen,    // (
    RParen,    // )
    LBracket,  // [
    RBracket,  // ]
    Comma,     // ,
    Semicolon, // ;
    Colon,     // :
    Dot,       // .
    Question,  // ?
    At,        // @

    // Operators
    Assign,       // =
    PlusAssign,   // +=
    MinusAssign,  // -=
    StarAssign,   // *=
    SlashAssign,  // /=
    EqualEqual,   // ==
    BangEqual,    // !=
    Less,         // <
    LessEqual,    // <=
    Greater,      // >
    GreaterEqual, // >=
    Plus,         // +
    Minus,        // -
    Star,         // *
    StarStar,     // **
    Slash,        // /
    Percent,      // %
    Bang,         // !
    AndAnd,       // &&
    OrOr,         // ||

    // Other
    Identifier(String),
    Eof,
}

impl Token {
    /// Reserved words may not name contracts, fields, functions or locals
    pub fn is_reserved(&self) -> bool {
        matches!(
            self,
            Token::Contract
                | Token::Collection
                | Token::Function
                | Token::Let
                | Token::If
                | Token::Else
                | Token::While
                | Token::For
                | Token::Break
                | Token::Continue
                | Token::Return
                | Token::Throw
                | Token::True
                | Token::False
                | Token::Null
                | Token::This
        )
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let text = match self {
            Token::Contract => "contract",
            Token::Collection => "collection",
            Token::Function => "function",
            Token::Let => "let",
            Token::If => "if",
            Token::Else => "else",
            Token::While => "while",
            Token::For => "for",
            Token::Break => "break",
            Token::Continue => "continue",
            Token::Return => "return",
            Token::Throw => "throw",
            Token::True => "true",
            Token::False => "false",
            Token::Null => "null",
            Token::This => "this",
            Token::StringLiteral(s) => return write!(f, "string \"{}\"", s),
            Token::IntegerLiteral(i) => return write!(f, "number {}", i),
            Token::FloatLiteral(v) => return write!(f, "number {}", v),
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Comma => ",",
            Token::Semicolon => ";",
            Token::Colon => ":",
            Token::Dot => ".",
            Token::Question => "?",
            Token::At => "@",
            Token::Assign => "=",
            Token::PlusAssign => "+=",
            Token::MinusAssign => "-=",
            Token::StarAssign => "*=",
            Token::SlashAssign => "/=",
            Token::EqualEqual => "==",
            Token::BangEqual => "!=",
            Token::Less => "<",
            Token::LessEqual => "<=",
            Token::Greater => ">",
            Token::GreaterEqual => ">=",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::StarStar => "**",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Bang => "!",
            Token::AndAnd => "&&",
            Token::OrOr => "||",
            Token::Identifier(name) => return write!(f, "identifier `{}`", name),
            Token::Eof => "end of input",
        };
        write!(f, "`{}`", text)
    }
}

/// Position in source text for error reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub line: usize,
    pub column: usize,
    /// Optional in the interchange form; reads as 0 when absent
    #[serde(default)]
    pub offset: usize,
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Token with source position
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

/// Tokenizer for Charter source text
pub struct Tokenizer {
    input: Vec<char>,
    position: usize,
    line: usize,
    column: usize,
}

impl Tokenizer {
    /// Create a new tokenizer for the given input text
    pub fn new(text: &str) -> Self {
        Tokenizer {
            input: text.chars().collect(),
            position: 0,
            line: 1,
            column: 1,
        }
    }

    /// Tokenize the entire input into a stream of spanned tokens
    pub fn tokenize(&mut self) -> Result<Vec<SpannedToken>, ParseError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace_and_comments()?;

            if self.is_at_end() {
                tokens.push(SpannedToken {
                    token: Token::Eof,
                    span: self.current_span(),
                });
                break;
            }

            let token = self.next_token()?;
            tokens.push(token);
        }

        Ok(tokens)
    }

    // ── Character helpers ──────────────────────────────────

    fn is_at_end(&self) -> bool {
        self.position >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek_ahead(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.input.get(self.position).copied();
        if let Some(c) = ch {
            self.position += 1;
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        ch
    }

    /// Consume `next` if it is the upcoming character
    fn eat(&mut self, next: char) -> bool {
        if self.peek() == Some(next) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn current_span(&self) -> Span {
        Span {
            line: self.line,
            column: self.column,
            offset: self.position,
        }
    }

    // ── Whitespace & Comments ──────────────────────────────

    fn skip_whitespace_and_comments(&mut self) -> Result<(), ParseError> {
        loop {
            while let Some(ch) = self.peek() {
                if ch.is_whitespace() {
                    self.advance();
                } else {
                    break;
                }
            }

            // Line comment: //
            if self.peek() == Some('/') && self.peek_ahead(1) == Some('/') {
                while let Some(ch) = self.peek() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
                continue;
            }

            // Block comment: /* ... */
            if self.peek() == Some('/') && self.peek_ahead(1) == Some('*') {
                let start = self.current_span();
                self.advance();
                self.advance();
                loop {
                    match self.advance() {
                        None => {
                            return Err(ParseError::at(&start, "Unterminated block comment"));
                        }
                        Some('*') if self.peek() == Some('/') => {
                            self.advance();
                            break;
                        }
                        Some(_) => {}
                    }
                }
                continue;
            }

            return Ok(());
        }
    }

    // ── Main dispatch ──────────────────────────────────────

    fn next_token(&mut self) -> Result<SpannedToken, ParseError> {
        let span = self.current_span();
        let ch = match self.advance() {
            Some(c) => c,
            None => {
                return Ok(SpannedToken {
                    token: Token::Eof,
                    span,
                })
            }
        };

        let token = match ch {
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ',' => Token::Comma,
            ';' => Token::Semicolon,
            ':' => Token::Colon,
            '.' => Token::Dot,
            '?' => Token::Question,
            '@' => Token::At,
            '%' => Token::Percent,
            '=' if self.eat('=') => Token::EqualEqual,
            '=' => Token::Assign,
            '!' if self.eat('=') => Token::BangEqual,
            '!' => Token::Bang,
            '<' if self.eat('=') => Token::LessEqual,
            '<' => Token::Less,
            '>' if self.eat('=') => Token::GreaterEqual,
            '>' => Token::Greater,
            '+' if self.eat('=') => Token::PlusAssign,
            '+' => Token::Plus,
            '-' if self.eat('=') => Token::MinusAssign,
            '-' => Token::Minus,
            '*' if self.eat('*') => Token::StarStar,
            '*' if self.eat('=') => Token::StarAssign,
            '*' => Token::Star,
            '/' if self.eat('=') => Token::SlashAssign,
            '/' => Token::Slash,
            '&' if self.eat('&') => Token::AndAnd,
            '|' if self.eat('|') => Token::OrOr,
            '"' | '\'' => return self.read_string(ch, span),
            c if c.is_ascii_digit() => return self.read_number(span),
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                return Ok(self.read_identifier_or_keyword(span))
            }
            _ => {
                return Err(ParseError::at(
                    &span,
                    format!("Unexpected character '{}'", ch),
                ))
            }
        };

        Ok(SpannedToken { token, span })
    }

    // ── String literals ────────────────────────────────────

    /// Called with the opening quote already consumed
    fn read_string(&mut self, quote: char, span: Span) -> Result<SpannedToken, ParseError> {
        let mut value = String::new();

        loop {
            let escape_span = self.current_span();
            match self.advance() {
                None | Some('\n') => {
                    return Err(ParseError::at(&span, "Unterminated string literal"));
                }
                Some(c) if c == quote => break,
                Some('\\') => match self.advance() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some('0') => value.push('\0'),
                    Some('\\') => value.push('\\'),
                    Some('"') => value.push('"'),
                    Some('\'') => value.push('\''),
                    Some(c) => {
                        return Err(ParseError::at(
                            &escape_span,
                            format!("Invalid escape sequence '\\{}'", c),
                        ));
                    }
                    None => {
                        return Err(ParseError::at(&span, "Unterminated string literal"));
                    }
                },
                Some(c) => value.push(c),
            }
        }

        Ok(SpannedToken {
            token: Token::StringLiteral(value),
            span,
        })
    }

    // ── Numbers ────────────────────────────────────────────

    /// Called with the first digit already consumed
    fn read_number(&mut self, span: Span) -> Result<SpannedToken, ParseError> {
        let start = self.position - 1;
        let mut has_dot = false;

        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                self.advance();
            } else if ch == '.'
                && !has_dot
                && self.peek_ahead(1).is_some_and(|c| c.is_ascii_digit())
            {
                has_dot = true;
                self.advance();
            } else {
                break;
            }
        }

        if self
            .peek()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        {
            return Err(ParseError::at(
                &self.current_span(),
                "Identifier cannot start immediately after a number",
            ));
        }

        let text: String = self.input[start..self.position].iter().collect();

        let token = if has_dot {
            let val: f64 = text
                .parse()
                .map_err(|_| ParseError::at(&span, format!("Invalid number '{}'", text)))?;
            if !val.is_finite() {
                return Err(ParseError::at(&span, "Number literal is too large"));
            }
            Token::FloatLiteral(val)
        } else {
            let val: i64 = text.parse().map_err(|_| {
                ParseError::at(&span, format!("Integer literal '{}' is out of range", text))
            })?;
            Token::IntegerLiteral(val)
        };

        Ok(SpannedToken { token, span })
    }

    // ── Identifiers & Keywords ─────────────────────────────

    /// Called with the first character already consumed
    fn read_identifier_or_keyword(&mut self, span: Span) -> SpannedToken {
        let start = self.position - 1;

        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '$' {
                self.advance();
            } else {
                break;
            }
        }

        let text: String = self.input[start..self.position].iter().collect();

        let token = match text.as_str() {
            "contract" => Token::Contract,
            "collection" => Token::Collection,
            "function" => Token::Function,
            "let" => Token::Let,
            "if" => Token::If,
            "else" => Token::Else,
            "while" => Token::While,
            "for" => Token::For,
            "break" => Token::Break,
            "continue" => Token::Continue,
            "return" => Token::Return,
            "throw" => Token::Throw,
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "this" => Token::This,
            _ => Token::Identifier(text),
        };

        SpannedToken { token, span }
    }
}
