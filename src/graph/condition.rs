//! # Condition Expressions
//!
//! Small boolean language for decision steps and `OnCondition` joins:
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | "(" expr ")" | compare
//! compare := path ( op literal )?
//! op      := "==" | "!=" | ">" | ">=" | "<" | "<="
//! literal := number | 'text' | "text" | true | false | null
//! ```
//!
//! Paths are dot-separated lookups into a JSON context; a bare path is
//! truthy unless it is missing, `null`, `false`, `0` or `""`.

use std::cmp::Ordering;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid condition '{expression}': {message}")]
pub struct ConditionError {
    pub expression: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Or(Box<Node>, Box<Node>),
    And(Box<Node>, Box<Node>),
    Not(Box<Node>),
    Truthy(Vec<String>),
    Compare(Vec<String>, CompareOp, Value),
    Literal(bool),
}

/// A parsed, reusable condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    root: Node,
}

impl Condition {
    pub fn parse(expression: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(expression).map_err(|message| ConditionError {
            expression: expression.to_string(),
            message,
        })?;
        let mut parser = Parser { tokens, position: 0 };
        let root = parser.expression().map_err(|message| ConditionError {
            expression: expression.to_string(),
            message,
        })?;
        if parser.position != parser.tokens.len() {
            return Err(ConditionError {
                expression: expression.to_string(),
                message: format!("unexpected trailing token {:?}", parser.tokens[parser.position]),
            });
        }
        Ok(Self {
            source: expression.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, context: &Value) -> bool {
        eval(&self.root, context)
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(expression: &str, context: &Value) -> Result<bool, ConditionError> {
    Ok(Condition::parse(expression)?.evaluate(context))
}

fn eval(node: &Node, context: &Value) -> bool {
    match node {
        Node::Or(left, right) => eval(left, context) || eval(right, context),
        Node::And(left, right) => eval(left, context) && eval(right, context),
        Node::Not(inner) => !eval(inner, context),
        Node::Literal(value) => *value,
        Node::Truthy(path) => is_truthy(lookup(context, path)),
        Node::Compare(path, op, literal) => compare(lookup(context, path), *op, literal),
    }
}

fn lookup<'a>(context: &'a Value, path: &[String]) -> &'a Value {
    path.iter()
        .try_fold(context, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
            _ => None,
        })
        .unwrap_or(&Value::Null)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn compare(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    let ordering = match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    };

    match (op, ordering) {
        (CompareOp::Eq, Some(ordering)) => ordering == Ordering::Equal,
        (CompareOp::Ne, Some(ordering)) => ordering != Ordering::Equal,
        (CompareOp::Ne, None) => true,
        (CompareOp::Gt, Some(ordering)) => ordering == Ordering::Greater,
        (CompareOp::Ge, Some(ordering)) => ordering != Ordering::Less,
        (CompareOp::Lt, Some(ordering)) => ordering == Ordering::Less,
        (CompareOp::Le, Some(ordering)) => ordering != Ordering::Greater,
        (_, None) => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Text(String),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let inclusive = next == Some('=');
                let op = match (c, inclusive) {
                    ('>', true) => CompareOp::Ge,
                    ('>', false) => CompareOp::Gt,
                    ('<', true) => CompareOp::Le,
                    _ => CompareOp::Lt,
                };
                tokens.push(Token::Op(op));
                i += if inclusive { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                tokens.push(Token::Text(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn expression(&mut self) -> Result<Node, String> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Node, String> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.unary()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Node, String> {
        match self.advance() {
            Some(Token::Not) => Ok(Node::Not(Box::new(self.unary()?))),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Ident(name)) => self.compare(name),
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn compare(&mut self, name: String) -> Result<Node, String> {
        match name.as_str() {
            "true" => return Ok(Node::Literal(true)),
            "false" => return Ok(Node::Literal(false)),
            _ => {}
        }
        let path: Vec<String> = name.split('.').map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            return Err(format!("invalid path '{name}'"));
        }

        let Some(Token::Op(op)) = self.peek().cloned() else {
            return Ok(Node::Truthy(path));
        };
        self.advance();

        let literal = match self.advance() {
            Some(Token::Number(number)) => serde_json::Number::from_f64(number)
                .map(Value::Number)
                .ok_or_else(|| format!("invalid number {number}"))?,
            Some(Token::Text(text)) => Value::String(text),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                "null" => Value::Null,
                other => Value::String(other.to_string()),
            },
            Some(token) => return Err(format!("expected literal, found {token:?}")),
            None => return Err("expected literal after operator".to_string()),
        };

        Ok(Node::Compare(path, op, literal))
    }
}
