use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LexError {
    #[error("unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal starting at position {0}")]
    UnterminatedString(usize),
    #[error("invalid duration literal \"{0}\"")]
    InvalidDuration(String),
    #[error("invalid number literal \"{0}\"")]
    InvalidNumber(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Duration(Duration),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    Bang,
    Minus,
    Plus,
    Star,
    Slash,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Eof,
}

/// Turns a condition string into a flat token stream. A single pass,
/// hand-rolled rather than generated — the grammar is small enough that a
/// lexer-generator crate would be net overhead.
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let done = tok == Token::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
            self.pos += 1;
        }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();
        let start = self.pos;
        let c = match self.peek() {
            None => return Ok(Token::Eof),
            Some(c) => c,
        };

        match c {
            b'(' => {
                self.pos += 1;
                Ok(Token::LParen)
            }
            b')' => {
                self.pos += 1;
                Ok(Token::RParen)
            }
            b'.' => {
                self.pos += 1;
                Ok(Token::Dot)
            }
            b',' => {
                self.pos += 1;
                Ok(Token::Comma)
            }
            b'+' => {
                self.pos += 1;
                Ok(Token::Plus)
            }
            b'-' => {
                self.pos += 1;
                Ok(Token::Minus)
            }
            b'*' => {
                self.pos += 1;
                Ok(Token::Star)
            }
            b'/' => {
                self.pos += 1;
                Ok(Token::Slash)
            }
            b'!' => {
                self.pos += 1;
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    Ok(Token::NotEq)
                } else {
                    Ok(Token::Bang)
                }
            }
            b'=' => {
                self.pos += 1;
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    Ok(Token::EqEq)
                } else {
                    Err(LexError::UnexpectedChar('=', start))
                }
            }
            b'<' => {
                self.pos += 1;
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    Ok(Token::Le)
                } else {
                    Ok(Token::Lt)
                }
            }
            b'>' => {
                self.pos += 1;
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    Ok(Token::Ge)
                } else {
                    Ok(Token::Gt)
                }
            }
            b'&' => {
                self.pos += 1;
                if self.peek() == Some(b'&') {
                    self.pos += 1;
                    Ok(Token::AndAnd)
                } else {
                    Err(LexError::UnexpectedChar('&', start))
                }
            }
            b'|' => {
                self.pos += 1;
                if self.peek() == Some(b'|') {
                    self.pos += 1;
                    Ok(Token::OrOr)
                } else {
                    Err(LexError::UnexpectedChar('|', start))
                }
            }
            b'"' => self.lex_string(start),
            b'0'..=b'9' => self.lex_number_or_duration(start),
            c if c.is_ascii_alphabetic() || c == b'_' => Ok(self.lex_ident()),
            other => Err(LexError::UnexpectedChar(other as char, start)),
        }
    }

    fn lex_string(&mut self, start: usize) -> Result<Token, LexError> {
        self.pos += 1; // opening quote
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return Err(LexError::UnterminatedString(start)),
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(b'"') => s.push('"'),
                    Some(b'\\') => s.push('\\'),
                    Some(b'n') => s.push('\n'),
                    Some(other) => s.push(other as char),
                    None => return Err(LexError::UnterminatedString(start)),
                },
                Some(c) => s.push(c as char),
            }
        }
        Ok(Token::Str(s))
    }

    fn lex_ident(&mut self) -> Token {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.pos += 1;
        }
        let word = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        match word {
            "true" => Token::Bool(true),
            "false" => Token::Bool(false),
            _ => Token::Ident(word.to_string()),
        }
    }

    fn lex_number_or_duration(&mut self, start: usize) -> Result<Token, LexError> {
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') {
            is_float = true;
            self.pos += 1;
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        // Trailing unit letter(s) mean this was a duration literal, not a
        // bare number — these only ever appear unquoted in practice, though
        // the grammar also accepts `"60s"` string-literal durations, parsed
        // at AST-build time instead (see parser).
        if matches!(self.peek(), Some(b's') | Some(b'm') | Some(b'h') | Some(b'd')) {
            let unit_start = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_alphabetic()) {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
            let _ = unit_start;
            return parse_duration(text)
                .map(Token::Duration)
                .ok_or_else(|| LexError::InvalidDuration(text.to_string()));
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| LexError::InvalidNumber(text.to_string()))
        } else {
            text.parse::<i64>()
                .map(Token::Int)
                .map_err(|_| LexError::InvalidNumber(text.to_string()))
        }
    }
}

/// Parses `"60s"`, `"5m"`, `"1h"`, `"1d"` style duration literals. Shared
/// between the lexer (for unquoted durations written directly in a
/// condition) and the policy config loader (for quoted window strings).
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let (num, unit) = text.split_at(text.find(|c: char| c.is_ascii_alphabetic())?);
    let n: u64 = num.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(n)),
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3600)),
        "d" => Some(Duration::from_secs(n * 86400)),
        _ => None,
    }
}
