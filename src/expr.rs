//! The restricted expression DSL used by rule guards, state-machine guards,
//! workflow conditions and webhook conditions (spec §4.6, §9 "Expressions
//! as data"). This is a purpose-built tagged AST and evaluator — it never
//! shares memory or environment with host code, and never `eval`s a string
//! against the Rust runtime.

use std::fmt;

use chrono::Utc;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    Dot,
    LParen,
    RParen,
    Comma,
    Op(String),
    Bang,
    End,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ExprError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            let Some(&ch) = self.chars.peek() else {
                tokens.push(Token::End);
                break;
            };
            match ch {
                '.' => {
                    self.chars.next();
                    tokens.push(Token::Dot);
                }
                '(' => {
                    self.chars.next();
                    tokens.push(Token::LParen);
                }
                ')' => {
                    self.chars.next();
                    tokens.push(Token::RParen);
                }
                ',' => {
                    self.chars.next();
                    tokens.push(Token::Comma);
                }
                '"' | '\'' => tokens.push(self.read_string(ch)?),
                '0'..='9' => tokens.push(self.read_number()),
                '=' | '!' | '<' | '>' | '&' | '|' | '+' | '-' | '*' | '/' | '%' => {
                    tokens.push(self.read_operator()?)
                }
                c if c.is_alphabetic() || c == '_' => tokens.push(self.read_ident()),
                other => return Err(ExprError::Syntax(format!("unexpected character '{other}'"))),
            }
        }
        Ok(tokens)
    }

    fn skip_whitespace(&mut self) {
        while let Some(&ch) = self.chars.peek() {
            if ch.is_whitespace() {
                self.chars.next();
            } else {
                break;
            }
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, ExprError> {
        self.chars.next();
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some(c) if c == quote => break,
                Some(c) => value.push(c),
                None => return Err(ExprError::Syntax("unterminated string literal".to_string())),
            }
        }
        Ok(Token::Str(value))
    }

    fn read_number(&mut self) -> Token {
        let mut raw = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                raw.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        Token::Num(raw.parse().unwrap_or(0.0))
    }

    fn read_ident(&mut self) -> Token {
        let mut raw = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                raw.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        match raw.as_str() {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            _ => Token::Ident(raw),
        }
    }

    fn read_operator(&mut self) -> Result<Token, ExprError> {
        let first = self.chars.next().unwrap();
        let second = self.chars.peek().copied();
        let op = match (first, second) {
            ('=', Some('=')) => {
                self.chars.next();
                "==".to_string()
            }
            ('!', Some('=')) => {
                self.chars.next();
                "!=".to_string()
            }
            ('<', Some('=')) => {
                self.chars.next();
                "<=".to_string()
            }
            ('>', Some('=')) => {
                self.chars.next();
                ">=".to_string()
            }
            ('&', Some('&')) => {
                self.chars.next();
                "&&".to_string()
            }
            ('|', Some('|')) => {
                self.chars.next();
                "||".to_string()
            }
            ('!', _) => return Ok(Token::Bang),
            (c, _) if "<>+-*/%".contains(c) => c.to_string(),
            (c, _) => return Err(ExprError::Syntax(format!("unexpected operator start '{c}'"))),
        };
        Ok(Token::Op(op))
    }
}

/// Tagged AST (spec §9: "a purpose-built tagged AST + evaluator").
#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ident(String),
    Member(Box<Expr>, String),
    Call(String, Vec<Expr>),
    Unary(String, Box<Expr>),
    Binary(String, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExprError> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(ExprError::Syntax(format!(
                "expected {expected:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn parse(mut self) -> Result<Expr, ExprError> {
        let expr = self.parse_or()?;
        self.expect(&Token::End)?;
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Token::Op(op) if op == "||") {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary("||".to_string(), Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_comparison()?;
        while matches!(self.peek(), Token::Op(op) if op == "&&") {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary("&&".to_string(), Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_additive()?;
        if let Token::Op(op) = self.peek().clone() {
            if ["==", "!=", "<", "<=", ">", ">="].contains(&op.as_str()) {
                self.advance();
                let right = self.parse_additive()?;
                return Ok(Expr::Binary(op, Box::new(left), Box::new(right)));
            }
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            if let Token::Op(op) = self.peek().clone() {
                if op == "+" || op == "-" {
                    self.advance();
                    let right = self.parse_multiplicative()?;
                    left = Expr::Binary(op, Box::new(left), Box::new(right));
                    continue;
                }
            }
            break;
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            if let Token::Op(op) = self.peek().clone() {
                if op == "*" || op == "/" || op == "%" {
                    self.advance();
                    let right = self.parse_unary()?;
                    left = Expr::Binary(op, Box::new(left), Box::new(right));
                    continue;
                }
            }
            break;
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Token::Bang => {
                self.advance();
                Ok(Expr::Unary("!".to_string(), Box::new(self.parse_unary()?)))
            }
            Token::Op(op) if op == "-" => {
                self.advance();
                Ok(Expr::Unary("-".to_string(), Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let Token::Ident(name) = self.advance() else {
                        return Err(ExprError::Syntax("expected field name after '.'".to_string()));
                    };
                    expr = Expr::Member(Box::new(expr), name);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Token::Num(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if matches!(self.peek(), Token::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if matches!(self.peek(), Token::Comma) {
                                self.advance();
                                continue;
                            }
                            break;
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            other => Err(ExprError::Syntax(format!("unexpected token {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExprError {
    Syntax(String),
    Evaluation(String),
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprError::Syntax(message) | ExprError::Evaluation(message) => write!(f, "{message}"),
        }
    }
}

/// The value-environment an expression is evaluated against: `record`,
/// `old`, `context`, `action`, `now` (spec §4.6).
#[derive(Debug, Clone, Default)]
pub struct Env {
    pub record: Value,
    pub old: Value,
    pub context: Value,
    pub action: Value,
}

impl Env {
    fn root(&self, name: &str) -> Value {
        match name {
            "record" => self.record.clone(),
            "old" => self.old.clone(),
            "context" => self.context.clone(),
            "action" => self.action.clone(),
            "now" => Value::String(Utc::now().to_rfc3339()),
            _ => Value::Null,
        }
    }
}

/// A compiled expression; parse once, evaluate many times.
pub struct CompiledExpr {
    ast: Expr,
}

const WHITELISTED_FUNCTIONS: &[&str] = &[
    "len",
    "lower",
    "upper",
    "now",
    "contains",
    "startsWith",
    "endsWith",
    "regex_match",
];

pub fn compile(source: &str) -> Result<CompiledExpr, ExprError> {
    let tokens = Lexer::new(source).tokenize()?;
    let ast = Parser::new(tokens).parse()?;
    validate_functions(&ast)?;
    Ok(CompiledExpr { ast })
}

fn validate_functions(expr: &Expr) -> Result<(), ExprError> {
    match expr {
        Expr::Call(name, args) => {
            if !WHITELISTED_FUNCTIONS.contains(&name.as_str()) {
                return Err(ExprError::Syntax(format!("function '{name}' is not whitelisted")));
            }
            for arg in args {
                validate_functions(arg)?;
            }
            Ok(())
        }
        Expr::Member(inner, _) | Expr::Unary(_, inner) => validate_functions(inner),
        Expr::Binary(_, left, right) => {
            validate_functions(left)?;
            validate_functions(right)
        }
        Expr::Literal(_) | Expr::Ident(_) => Ok(()),
    }
}

impl CompiledExpr {
    pub fn eval(&self, env: &Env) -> Result<Value, ExprError> {
        eval_node(&self.ast, env)
    }

    /// Evaluates and coerces the result to a bool; non-bool results are
    /// falsy unless the value is a non-empty string/non-zero number, so
    /// guards written loosely still behave predictably.
    pub fn eval_bool(&self, env: &Env) -> Result<bool, ExprError> {
        Ok(truthy(&self.eval(env)?))
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn eval_node(expr: &Expr, env: &Env) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => Ok(env.root(name)),
        Expr::Member(inner, field) => {
            let base = eval_node(inner, env)?;
            Ok(base.get(field).cloned().unwrap_or(Value::Null))
        }
        Expr::Unary(op, inner) => {
            let value = eval_node(inner, env)?;
            match op.as_str() {
                "!" => Ok(Value::Bool(!truthy(&value))),
                "-" => Ok(as_number(&value).map(|n| json_number(-n)).unwrap_or(Value::Null)),
                other => Err(ExprError::Evaluation(format!("unknown unary operator '{other}'"))),
            }
        }
        Expr::Binary(op, left, right) => eval_binary(op, left, right, env),
        Expr::Call(name, args) => {
            let values = args
                .iter()
                .map(|arg| eval_node(arg, env))
                .collect::<Result<Vec<_>, _>>()?;
            call_function(name, &values)
        }
    }
}

fn eval_binary(op: &str, left: &Expr, right: &Expr, env: &Env) -> Result<Value, ExprError> {
    if op == "&&" {
        let left = eval_node(left, env)?;
        if !truthy(&left) {
            return Ok(Value::Bool(false));
        }
        return Ok(Value::Bool(truthy(&eval_node(right, env)?)));
    }
    if op == "||" {
        let left = eval_node(left, env)?;
        if truthy(&left) {
            return Ok(Value::Bool(true));
        }
        return Ok(Value::Bool(truthy(&eval_node(right, env)?)));
    }

    let left = eval_node(left, env)?;
    let right = eval_node(right, env)?;

    match op {
        "==" => Ok(Value::Bool(values_equal(&left, &right))),
        "!=" => Ok(Value::Bool(!values_equal(&left, &right))),
        "<" | "<=" | ">" | ">=" => {
            let (Some(a), Some(b)) = (as_number(&left), as_number(&right)) else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(match op {
                "<" => a < b,
                "<=" => a <= b,
                ">" => a > b,
                ">=" => a >= b,
                _ => unreachable!(),
            }))
        }
        "+" | "-" | "*" | "/" | "%" => {
            let (Some(a), Some(b)) = (as_number(&left), as_number(&right)) else {
                return Ok(Value::Null);
            };
            let result = match op {
                "+" => a + b,
                "-" => a - b,
                "*" => a * b,
                "/" => {
                    if b == 0.0 {
                        return Ok(Value::Null);
                    }
                    a / b
                }
                "%" => {
                    if b == 0.0 {
                        return Ok(Value::Null);
                    }
                    a % b
                }
                _ => unreachable!(),
            };
            Ok(json_number(result))
        }
        other => Err(ExprError::Evaluation(format!("unknown operator '{other}'"))),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a == b;
    }
    left == right
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn call_function(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match name {
        "len" => Ok(match args.first() {
            Some(Value::String(s)) => json_number(s.chars().count() as f64),
            Some(Value::Array(items)) => json_number(items.len() as f64),
            Some(Value::Object(map)) => json_number(map.len() as f64),
            _ => Value::Null,
        }),
        "lower" => Ok(Value::String(as_string(args.first().unwrap_or(&Value::Null)).to_lowercase())),
        "upper" => Ok(Value::String(as_string(args.first().unwrap_or(&Value::Null)).to_uppercase())),
        "now" => Ok(Value::String(Utc::now().to_rfc3339())),
        "contains" => {
            let haystack = as_string(args.first().unwrap_or(&Value::Null));
            let needle = as_string(args.get(1).unwrap_or(&Value::Null));
            Ok(Value::Bool(haystack.contains(&needle)))
        }
        "startsWith" => {
            let haystack = as_string(args.first().unwrap_or(&Value::Null));
            let prefix = as_string(args.get(1).unwrap_or(&Value::Null));
            Ok(Value::Bool(haystack.starts_with(&prefix)))
        }
        "endsWith" => {
            let haystack = as_string(args.first().unwrap_or(&Value::Null));
            let suffix = as_string(args.get(1).unwrap_or(&Value::Null));
            Ok(Value::Bool(haystack.ends_with(&suffix)))
        }
        "regex_match" => {
            let haystack = as_string(args.first().unwrap_or(&Value::Null));
            let pattern = as_string(args.get(1).unwrap_or(&Value::Null));
            let regex = regex::Regex::new(&pattern)
                .map_err(|error| ExprError::Evaluation(format!("invalid regex: {error}")))?;
            Ok(Value::Bool(regex.is_match(&haystack)))
        }
        other => Err(ExprError::Evaluation(format!("function '{other}' is not whitelisted"))),
    }
}

/// Convenience for callers that only need a one-shot boolean evaluation
/// (rule/guard/condition call sites) without holding onto a `CompiledExpr`.
pub fn eval_bool(source: &str, env: &Env) -> Result<bool, ExprError> {
    compile(source)?.eval_bool(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with_record(record: Value) -> Env {
        Env {
            record,
            old: Value::Null,
            context: Value::Null,
            action: Value::Null,
        }
    }

    #[test]
    fn compares_numeric_field() {
        let env = env_with_record(serde_json::json!({ "total": 10 }));
        assert!(eval_bool("record.total > 0", &env).unwrap());
        assert!(!eval_bool("record.total > 100", &env).unwrap());
    }

    #[test]
    fn unknown_identifiers_are_null_not_errors() {
        let env = env_with_record(serde_json::json!({}));
        assert!(!eval_bool("record.missing == true", &env).unwrap());
    }

    #[test]
    fn logical_operators_short_circuit() {
        let env = env_with_record(serde_json::json!({ "a": 1, "b": 0 }));
        assert!(eval_bool("record.a > 0 && record.b == 0", &env).unwrap());
        assert!(eval_bool("record.a == 0 || record.b == 0", &env).unwrap());
    }

    #[test]
    fn whitelisted_functions_work() {
        let env = env_with_record(serde_json::json!({ "name": "Acme Corp" }));
        assert!(eval_bool("contains(record.name, \"Acme\")", &env).unwrap());
        assert!(eval_bool("lower(record.name) == \"acme corp\"", &env).unwrap());
    }

    #[test]
    fn non_whitelisted_function_rejected_at_compile_time() {
        let result = compile("eval(record.name)");
        assert!(result.is_err());
    }

    #[test]
    fn string_literal_and_not_operator() {
        let env = env_with_record(serde_json::json!({ "status": "draft" }));
        assert!(eval_bool("!(record.status == \"sent\")", &env).unwrap());
    }
}
