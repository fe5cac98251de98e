//! Session property filters.
//!
//! ```text
//! filter  := or
//! or      := and ( "or" and )*
//! and     := unary ( "and" unary )*
//! unary   := "not" unary | primary
//! primary := "(" filter ")" | "all" | "has" NAME
//!          | NAME ( "is" | "eq" | "=" ) VALUE
//!          | NAME ( "ne" | "!=" ) VALUE
//!          | NAME "in" "[" VALUE ( "," VALUE )* "]"
//! ```
//!
//! Keywords are case-insensitive. Values are single- or double-quoted.

use super::SessionProperties;
use crate::error::{EngineError, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    All,
    Has(String),
    Eq(String, String),
    Ne(String, String),
    In(String, Vec<String>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
}

impl Node {
    fn eval(&self, properties: &SessionProperties) -> bool {
        match self {
            Node::All => true,
            Node::Has(name) => properties.contains_key(name),
            Node::Eq(name, value) => properties.get(name) == Some(value),
            Node::Ne(name, value) => properties.get(name) != Some(value),
            Node::In(name, values) => properties
                .get(name)
                .map(|v| values.iter().any(|candidate| candidate == v))
                .unwrap_or(false),
            Node::And(left, right) => left.eval(properties) && right.eval(properties),
            Node::Or(left, right) => left.eval(properties) || right.eval(properties),
            Node::Not(inner) => !inner.eval(properties),
        }
    }
}

/// A compiled session filter.
#[derive(Debug, Clone)]
pub struct SessionFilter {
    expression: String,
    root: Node,
}

impl PartialEq for SessionFilter {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
    }
}

impl SessionFilter {
    pub fn parse(expression: &str) -> Result<Self> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            expression,
            tokens,
            position: 0,
        };
        let root = parser.parse_or()?;
        if parser.position != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            expression: expression.to_string(),
            root,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn matches(&self, properties: &SessionProperties) -> bool {
        self.root.eval(properties)
    }
}

impl fmt::Display for SessionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for SessionFilter {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Open,
    Close,
    OpenBracket,
    CloseBracket,
    Comma,
    Equals,
    NotEquals,
}

fn invalid(expression: &str, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidFilter {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | '[' | ']' | ',' | '=' => {
                chars.next();
                tokens.push(match c {
                    '(' => Token::Open,
                    ')' => Token::Close,
                    '[' => Token::OpenBracket,
                    ']' => Token::CloseBracket,
                    ',' => Token::Comma,
                    _ => Token::Equals,
                });
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(invalid(expression, "expected '=' after '!'"));
                }
                tokens.push(Token::NotEquals);
            }
            '\'' | '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some(next) = chars.next() {
                    if next == '\\' {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    } else if next == c {
                        closed = true;
                        break;
                    } else {
                        value.push(next);
                    }
                }
                if !closed {
                    return Err(invalid(expression, "unterminated string"));
                }
                tokens.push(Token::Quoted(value));
            }
            c if c.is_alphanumeric() || c == '$' || c == '_' || c == '.' || c == '-' => {
                let mut word = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_alphanumeric() || matches!(next, '$' | '_' | '.' | '-') {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            other => {
                return Err(invalid(expression, format!("unexpected character '{}'", other)));
            }
        }
    }
    if tokens.is_empty() {
        return Err(invalid(expression, "empty filter"));
    }
    Ok(tokens)
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    position: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> EngineError {
        invalid(
            self.expression,
            format!("{} at token {}", reason, self.position),
        )
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.tokens.get(self.position), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            _ => Err(self.error(&format!("expected {:?}", expected))),
        }
    }

    fn parse_or(&mut self) -> Result<Node> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.position += 1;
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node> {
        let mut left = self.parse_unary()?;
        while self.peek_keyword("and") {
            self.position += 1;
            let right = self.parse_unary()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node> {
        if self.peek_keyword("not") {
            self.position += 1;
            return Ok(Node::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node> {
        match self.next() {
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                self.expect(Token::Close)?;
                Ok(inner)
            }
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("all") => Ok(Node::All),
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("has") => match self.next() {
                Some(Token::Word(name)) => Ok(Node::Has(name)),
                _ => Err(self.error("expected property name after 'has'")),
            },
            Some(Token::Word(name)) => self.parse_comparison(name),
            _ => Err(self.error("expected a clause")),
        }
    }

    fn parse_comparison(&mut self, name: String) -> Result<Node> {
        match self.next() {
            Some(Token::Equals) => Ok(Node::Eq(name, self.parse_value()?)),
            Some(Token::NotEquals) => Ok(Node::Ne(name, self.parse_value()?)),
            Some(Token::Word(op)) if op.eq_ignore_ascii_case("is") || op.eq_ignore_ascii_case("eq") => {
                Ok(Node::Eq(name, self.parse_value()?))
            }
            Some(Token::Word(op)) if op.eq_ignore_ascii_case("ne") => {
                Ok(Node::Ne(name, self.parse_value()?))
            }
            Some(Token::Word(op)) if op.eq_ignore_ascii_case("in") => {
                self.expect(Token::OpenBracket)?;
                let mut values = vec![self.parse_value()?];
                loop {
                    match self.next() {
                        Some(Token::Comma) => values.push(self.parse_value()?),
                        Some(Token::CloseBracket) => break,
                        _ => return Err(self.error("expected ',' or ']'")),
                    }
                }
                Ok(Node::In(name, values))
            }
            _ => Err(self.error(&format!("expected an operator after '{}'", name))),
        }
    }

    fn parse_value(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Quoted(value)) => Ok(value),
            _ => Err(self.error("expected a quoted value")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> SessionProperties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_equality_and_inequality() {
        let p = props(&[("Department", "FX"), ("$Principal", "alice")]);
        assert!(SessionFilter::parse("Department is 'FX'").unwrap().matches(&p));
        assert!(SessionFilter::parse("Department = \"FX\"").unwrap().matches(&p));
        assert!(SessionFilter::parse("$Principal ne 'bob'").unwrap().matches(&p));
        assert!(!SessionFilter::parse("Department != 'FX'").unwrap().matches(&p));
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        let p = props(&[("a", "1"), ("b", "2")]);
        // and binds tighter than or
        let f = SessionFilter::parse("a is '9' or a is '1' and b is '2'").unwrap();
        assert!(f.matches(&p));
        let f = SessionFilter::parse("(a is '9' or a is '1') and not b is '2'").unwrap();
        assert!(!f.matches(&p));
        assert!(SessionFilter::parse("NOT has c AND all").unwrap().matches(&p));
    }

    #[test]
    fn test_in_list() {
        let p = props(&[("Country", "UK")]);
        assert!(SessionFilter::parse("Country in ['FR', 'UK']").unwrap().matches(&p));
        assert!(!SessionFilter::parse("Country in ['FR']").unwrap().matches(&p));
        assert!(!SessionFilter::parse("Missing in ['x']").unwrap().matches(&p));
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "a is", "a is 'x", "(a is 'x'", "a in ['x'", "a ~ 'x'", "a is 'x' b"] {
            assert!(
                matches!(SessionFilter::parse(bad), Err(EngineError::InvalidFilter { .. })),
                "{} should fail",
                bad
            );
        }
    }
}
