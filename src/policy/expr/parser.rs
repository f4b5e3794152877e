use thiserror::Error;

use super::ast::{BinaryOp, Expr, Literal, UnaryOp};
use super::lexer::{LexError, Lexer, Token};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("lex error: {0}")]
    Lex(#[from] LexError),
    #[error("unexpected token {0:?}, expected {1}")]
    Unexpected(Token, &'static str),
    #[error("unexpected end of expression")]
    Eof,
    #[error("trailing tokens after expression: {0:?}")]
    Trailing(Vec<Token>),
}

/// Recursive-descent Pratt parser over the token stream. Precedence climbs
/// `||` < `&&` < comparison < additive < multiplicative < unary < primary,
/// matching ordinary C-family expression grammars.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn parse(src: &str) -> Result<Expr, ParseError> {
        let tokens = Lexer::new(src).tokenize()?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        match parser.peek() {
            Token::Eof => Ok(expr),
            _ => Err(ParseError::Trailing(parser.tokens[parser.pos..].to_vec())),
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn bump(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: &Token, what: &'static str) -> Result<(), ParseError> {
        if self.peek() == tok {
            self.bump();
            Ok(())
        } else {
            Err(ParseError::Unexpected(self.peek().clone(), what))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while *self.peek() == Token::OrOr {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_comparison()?;
        while *self.peek() == Token::AndAnd {
            self.bump();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_additive()?;
        let op = match self.peek() {
            Token::EqEq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.bump();
        let rhs = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Token::Bang => {
                self.bump();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            Token::Minus => {
                self.bump();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.bump() {
            Token::Bool(b) => Ok(Expr::Lit(Literal::Bool(b))),
            Token::Int(n) => Ok(Expr::Lit(Literal::Int(n))),
            Token::Float(f) => Ok(Expr::Lit(Literal::Float(f))),
            Token::Str(s) => Ok(Expr::Lit(Literal::Str(s))),
            Token::Duration(d) => Ok(Expr::Lit(Literal::Duration(d))),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if *self.peek() == Token::LParen {
                    self.bump();
                    let mut args = Vec::new();
                    if *self.peek() != Token::RParen {
                        args.push(self.parse_or()?);
                        while *self.peek() == Token::Comma {
                            self.bump();
                            args.push(self.parse_or()?);
                        }
                    }
                    self.expect(&Token::RParen, "')'")?;
                    Ok(Expr::Call(name, args))
                } else {
                    let mut path = vec![name];
                    while *self.peek() == Token::Dot {
                        self.bump();
                        match self.bump() {
                            Token::Ident(seg) => path.push(seg),
                            other => return Err(ParseError::Unexpected(other, "identifier")),
                        }
                    }
                    Ok(Expr::Field(path))
                }
            }
            other => Err(ParseError::Unexpected(other, "expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_field_comparison() {
        let e = Parser::parse("session.cost > 0.50").unwrap();
        assert_eq!(
            e,
            Expr::Binary(
                BinaryOp::Gt,
                Box::new(Expr::Field(vec!["session".into(), "cost".into()])),
                Box::new(Expr::Lit(Literal::Float(0.50))),
            )
        );
    }

    #[test]
    fn parses_call_with_string_window() {
        let e = Parser::parse(r#"action_count_in_window("tool.call", "5m") >= 3"#).unwrap();
        match e {
            Expr::Binary(BinaryOp::Ge, lhs, _) => match *lhs {
                Expr::Call(name, args) => {
                    assert_eq!(name, "action_count_in_window");
                    assert_eq!(args.len(), 2);
                }
                other => panic!("unexpected lhs {other:?}"),
            },
            other => panic!("unexpected expr {other:?}"),
        }
    }

    #[test]
    fn parses_and_or_precedence() {
        let e = Parser::parse("a.x == 1 && b.y == 2 || c.z == 3").unwrap();
        assert!(matches!(e, Expr::Binary(BinaryOp::Or, _, _)));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(Parser::parse("true true").is_err());
    }
}
