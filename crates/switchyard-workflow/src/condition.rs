//! Restricted conditional expression evaluation.
//!
//! Workflow conditionals get key lookups, string equality, numeric
//! comparison, and boolean combinators over the execution context. No
//! arbitrary code, no function calls, no side effects.
//!
//! Grammar:
//!
//! ```text
//! expr       := and ( "||" and )*
//! and        := unary ( "&&" unary )*
//! unary      := "!" unary | comparison
//! comparison := operand ( ("==" | "!=" | "<=" | ">=" | "<" | ">") operand )?
//! operand    := literal | path | "(" expr ")"
//! literal    := number | 'string' | "string" | true | false
//! path       := ident ( "." ident )*
//! ```

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("condition parse error: {0}")]
    Parse(String),
    #[error("condition evaluation error: {0}")]
    Eval(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    AndAnd,
    OrOr,
    Not,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
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
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(ConditionError::Parse("single '&' is not an operator".into()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(ConditionError::Parse("single '|' is not an operator".into()));
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(ConditionError::Parse("assignment is not supported".into()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    value.push(chars[i]);
                    i += 1;
                }
                if !closed {
                    return Err(ConditionError::Parse("unterminated string literal".into()));
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ConditionError::Parse(format!("bad number `{}`", text)))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.' || chars[i] == '-')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                match text.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    _ => tokens.push(Token::Ident(text)),
                }
            }
            other => {
                return Err(ConditionError::Parse(format!(
                    "unexpected character `{}`",
                    other
                )));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    scope: &'a Value,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<Value, ConditionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let right = self.and()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Value, ConditionError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let right = self.unary()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let value = self.unary()?;
            return Ok(Value::Bool(!truthy(&value)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Value, ConditionError> {
        let left = self.operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => Token::Eq,
            Some(Token::Ne) => Token::Ne,
            Some(Token::Le) => Token::Le,
            Some(Token::Ge) => Token::Ge,
            Some(Token::Lt) => Token::Lt,
            Some(Token::Gt) => Token::Gt,
            _ => return Ok(left),
        };
        self.next();
        let right = self.operand()?;
        let result = match op {
            Token::Eq => values_equal(&left, &right),
            Token::Ne => !values_equal(&left, &right),
            Token::Le | Token::Ge | Token::Lt | Token::Gt => {
                let (a, b) = numeric_pair(&left, &right)?;
                match op {
                    Token::Le => a <= b,
                    Token::Ge => a >= b,
                    Token::Lt => a < b,
                    Token::Gt => a > b,
                    _ => unreachable!(),
                }
            }
            _ => unreachable!(),
        };
        Ok(Value::Bool(result))
    }

    fn operand(&mut self) -> Result<Value, ConditionError> {
        match self.next().cloned() {
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(ConditionError::Parse("expected `)`".into())),
                }
            }
            Some(Token::Number(n)) => Ok(serde_json::json!(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Ident(path)) => Ok(lookup(self.scope, &path)),
            other => Err(ConditionError::Parse(format!(
                "unexpected token {:?}",
                other
            ))),
        }
    }
}

/// Dotted key lookup into the evaluation scope. Missing keys resolve to
/// null rather than erroring, so absent context reads as false.
pub(crate) fn lookup(scope: &Value, path: &str) -> Value {
    let mut current = scope;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn numeric_pair(a: &Value, b: &Value) -> Result<(f64, f64), ConditionError> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(ConditionError::Eval(format!(
            "ordering comparison needs numbers, got {} and {}",
            a, b
        ))),
    }
}

/// Evaluate `expression` against `scope` and reduce to a boolean.
pub fn evaluate_condition(expression: &str, scope: &Value) -> Result<bool, ConditionError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(ConditionError::Parse("empty condition".into()));
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        scope,
    };
    let value = parser.expr()?;
    if parser.pos != tokens.len() {
        return Err(ConditionError::Parse("trailing tokens".into()));
    }
    Ok(truthy(&value))
}
