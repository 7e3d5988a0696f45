//! Small expression language used by condition and transform nodes.
//!
//! Accepts the JavaScript-flavoured operators the editor emits (`===`,
//! `!==`, `&&`, `||`, `.includes(x)`) alongside `and`/`or`/`not`/`contains`.
//! Identifiers are namespace paths looked up through a [`Resolver`].

use crate::resolver::Resolver;
use crate::value::Value;
use crate::NodeError;

/// Evaluate an expression to a value
pub fn evaluate(expression: &str, resolver: &Resolver<'_>) -> Result<Value, NodeError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_expression()?;
    if let Some(token) = parser.peek() {
        return Err(NodeError::Expression(format!("unexpected token {:?} in '{}'", token, expression)));
    }
    eval(&ast, resolver)
}

/// Evaluate an expression and apply truthiness
pub fn evaluate_bool(expression: &str, resolver: &Resolver<'_>) -> Result<bool, NodeError> {
    evaluate(expression, resolver).map(|v| v.is_truthy())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Value),
    Str(String),
    Path(String),
    Method(String),
    True,
    False,
    Null,
    Op(&'static str),
    LParen,
    RParen,
}

const METHODS: &[&str] = &["includes", "contains", "startsWith", "endsWith"];

fn tokenize(input: &str) -> Result<Vec<Token>, NodeError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '{' if chars.get(i + 1) == Some(&'{') => {
                let start = i + 2;
                let mut end = start;
                while end + 1 < chars.len() && !(chars[end] == '}' && chars[end + 1] == '}') {
                    end += 1;
                }
                if end + 1 >= chars.len() {
                    return Err(NodeError::Expression(format!("unterminated placeholder in '{}'", input)));
                }
                let path: String = chars[start..end].iter().collect();
                tokens.push(Token::Path(path.trim().to_string()));
                i = end + 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        i += 1;
                    }
                    text.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(NodeError::Expression(format!("unterminated string in '{}'", input)));
                }
                tokens.push(Token::Str(text));
                i += 1;
            }
            '.' if chars.get(i + 1).is_some_and(|n| n.is_alphabetic()) => {
                let (name, next) = read_word(&chars, i + 1);
                if !METHODS.contains(&name.as_str()) {
                    return Err(NodeError::Expression(format!("unknown method '{}'", name)));
                }
                tokens.push(Token::Method(name));
                i = next;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = Value::parse_number(&text)
                    .ok_or_else(|| NodeError::Expression(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let (path, next) = read_path(&chars, i);
                i = next;
                push_path(&mut tokens, path, chars.get(skip_ws(&chars, i)) == Some(&'('));
            }
            _ => {
                let op = read_operator(&chars, i)
                    .ok_or_else(|| NodeError::Expression(format!("unexpected character '{}' in '{}'", c, input)))?;
                i += op.len();
                tokens.push(Token::Op(op));
            }
        }
    }
    Ok(tokens)
}

fn read_word(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

fn read_path(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() {
        let c = chars[end];
        let continues_path = c.is_alphanumeric()
            || c == '_'
            || c == '$'
            || c == '['
            || c == ']'
            || (c == '.' && chars.get(end + 1).is_some_and(|n| n.is_alphanumeric() || *n == '_'));
        if !continues_path {
            break;
        }
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

fn skip_ws(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

/// Split `a.b.includes` into a path plus a trailing method call
fn push_path(tokens: &mut Vec<Token>, path: String, followed_by_call: bool) {
    if followed_by_call {
        if let Some((prefix, method)) = path.rsplit_once('.') {
            if METHODS.contains(&method) {
                tokens.push(Token::Path(prefix.to_string()));
                tokens.push(Token::Method(method.to_string()));
                return;
            }
        }
    }
    let token = match path.as_str() {
        "true" => Token::True,
        "false" => Token::False,
        "null" | "undefined" => Token::Null,
        "and" => Token::Op("&&"),
        "or" => Token::Op("||"),
        "not" => Token::Op("!"),
        "contains" => Token::Op("contains"),
        _ => Token::Path(path),
    };
    tokens.push(token);
}

fn read_operator(chars: &[char], i: usize) -> Option<&'static str> {
    const OPERATORS: &[&str] = &[
        "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/", "%", ",",
    ];
    OPERATORS.iter().copied().find(|op| {
        op.chars()
            .enumerate()
            .all(|(offset, expected)| chars.get(i + offset) == Some(&expected))
    })
}

#[derive(Debug)]
enum Expr {
    Literal(Value),
    Path(String),
    Unary(&'static str, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    Call(Box<Expr>, String, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, NodeError> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, level: usize) -> Result<Expr, NodeError> {
        const LEVELS: &[&[&str]] = &[
            &["||"],
            &["&&"],
            &["==", "!=", "===", "!==", "contains"],
            &["<", "<=", ">", ">="],
            &["+", "-"],
            &["*", "/", "%"],
        ];
        if level >= LEVELS.len() {
            return self.parse_unary();
        }
        let mut left = self.parse_binary(level + 1)?;
        while let Some(op) = self.eat_op(LEVELS[level]) {
            let right = self.parse_binary(level + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, NodeError> {
        if let Some(op) = self.eat_op(&["!", "-"]) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary(op, Box::new(operand)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, NodeError> {
        let mut expr = self.parse_primary()?;
        while let Some(Token::Method(_)) = self.peek() {
            let Some(Token::Method(name)) = self.next() else {
                break;
            };
            self.expect(Token::LParen)?;
            let argument = self.parse_expression()?;
            self.expect(Token::RParen)?;
            expr = Expr::Call(Box::new(expr), name, Box::new(argument));
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, NodeError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(n)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Path(path)) => Ok(Expr::Path(path)),
            Some(Token::LParen) => {
                let inner = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(token) => Err(NodeError::Expression(format!("unexpected token {:?}", token))),
            None => Err(NodeError::Expression("unexpected end of expression".to_string())),
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), NodeError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => Err(NodeError::Expression(format!("expected {:?}, found {:?}", expected, other))),
        }
    }
}

fn eval(expr: &Expr, resolver: &Resolver<'_>) -> Result<Value, NodeError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => Ok(resolver.lookup(path)),
        Expr::Unary("!", operand) => Ok(Value::Bool(!eval(operand, resolver)?.is_truthy())),
        Expr::Unary(_, operand) => {
            let value = eval(operand, resolver)?;
            match value {
                Value::Int(n) => Ok(n.checked_neg().map(Value::Int).unwrap_or(Value::Float(-(n as f64)))),
                other => number(&other, "-").map(|n| Value::Float(-n)),
            }
        }
        Expr::Binary("&&", left, right) => {
            Ok(Value::Bool(eval(left, resolver)?.is_truthy() && eval(right, resolver)?.is_truthy()))
        }
        Expr::Binary("||", left, right) => {
            Ok(Value::Bool(eval(left, resolver)?.is_truthy() || eval(right, resolver)?.is_truthy()))
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, resolver)?;
            let right = eval(right, resolver)?;
            binary(op, &left, &right)
        }
        Expr::Call(target, method, argument) => {
            let target = eval(target, resolver)?;
            let argument = eval(argument, resolver)?;
            let result = match method.as_str() {
                "includes" | "contains" => contains(&target, &argument),
                "startsWith" => target.to_string().starts_with(&argument.to_string()),
                "endsWith" => target.to_string().ends_with(&argument.to_string()),
                other => return Err(NodeError::Expression(format!("unknown method '{}'", other))),
            };
            Ok(Value::Bool(result))
        }
    }
}

fn binary(op: &str, left: &Value, right: &Value) -> Result<Value, NodeError> {
    let result = match op {
        "==" | "===" => Value::Bool(loose_eq(left, right)),
        "!=" | "!==" => Value::Bool(!loose_eq(left, right)),
        "contains" => Value::Bool(contains(left, right)),
        "<" | "<=" | ">" | ">=" => Value::Bool(compare(op, left, right)),
        "+" => match (left, right) {
            (Value::String(_), _) | (_, Value::String(_)) => Value::String(format!("{}{}", left, right)),
            (Value::Array(a), Value::Array(b)) => Value::Array(a.iter().chain(b).cloned().collect()),
            _ => arithmetic(op, left, right)?,
        },
        "-" | "*" => arithmetic(op, left, right)?,
        "/" | "%" => {
            let divisor = number(right, op)?;
            if divisor == 0.0 {
                return Err(NodeError::Expression("division by zero".to_string()));
            }
            let dividend = number(left, op)?;
            match (left, right, op) {
                (Value::Int(a), Value::Int(b), "%") if a.checked_rem(*b).is_some() => Value::Int(a % b),
                (Value::Int(a), Value::Int(b), "/") if a.checked_rem(*b) == Some(0) => Value::Int(a / b),
                _ => Value::Float(if op == "/" { dividend / divisor } else { dividend % divisor }),
            }
        }
        other => return Err(NodeError::Expression(format!("unsupported operator '{}'", other))),
    };
    Ok(result)
}

/// `+ - *`, staying in integers while both sides are integers and the
/// result fits
fn arithmetic(op: &str, left: &Value, right: &Value) -> Result<Value, NodeError> {
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let exact = match op {
            "+" => a.checked_add(*b),
            "-" => a.checked_sub(*b),
            _ => a.checked_mul(*b),
        };
        if let Some(n) = exact {
            return Ok(Value::Int(n));
        }
    }
    let (a, b) = (number(left, op)?, number(right, op)?);
    Ok(Value::Float(match op {
        "+" => a + b,
        "-" => a - b,
        _ => a * b,
    }))
}

fn number(value: &Value, op: &str) -> Result<f64, NodeError> {
    value.to_number().ok_or_else(|| {
        NodeError::Expression(format!("operator '{}' needs a number, got {}", op, value.type_name()))
    })
}

/// Equality that treats numeric strings and numbers alike
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (left, right) {
        (Value::Int(_), Value::Int(_)) => false,
        (number @ (Value::Int(_) | Value::Float(_)), other) | (other, number @ (Value::Int(_) | Value::Float(_))) => {
            match (number.to_number(), other.to_number()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s.eq_ignore_ascii_case(if *b { "true" } else { "false" })
        }
        _ => false,
    }
}

fn compare(op: &str, left: &Value, right: &Value) -> bool {
    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => match (a.parse::<f64>(), b.parse::<f64>()) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y),
            _ => Some(a.cmp(b)),
        },
        _ => match (left.to_number(), right.to_number()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        ">" => ordering.is_gt(),
        _ => ordering.is_ge(),
    }
}

/// Substring, array membership or object key test
pub fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => s.contains(&needle.to_string()),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(map) => map.contains_key(&needle.to_string()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::value::Map;
    use crate::workflow::Graph;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn context() -> ExecutionContext {
        let inputs = match Value::from(json!({"x": 5, "name": "Ada Lovelace", "tags": ["vip", "beta"]})) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let mut ctx = ExecutionContext::new(Uuid::new_v4(), "f", Arc::new(Graph::new()), inputs);
        ctx.set_node_output("score", Value::from(json!({"value": "42"})));
        ctx
    }

    fn eval_str(expression: &str) -> Value {
        let ctx = context();
        evaluate(expression, &ctx.resolver()).unwrap()
    }

    #[test]
    fn arithmetic_respects_precedence() {
        assert_eq!(eval_str("input.x * 2"), Value::from(10));
        assert_eq!(eval_str("1 + 2 * 3 - (4 / 2)"), Value::from(5));
        assert_eq!(eval_str("-input.x + 1"), Value::from(-4));
        assert_eq!(eval_str("'n=' + input.x"), Value::from("n=5"));
    }

    #[test]
    fn integer_arithmetic_stays_exact() {
        assert_eq!(eval_str("9007199254740992 + 1"), Value::Int(9_007_199_254_740_993));
        assert_eq!(eval_str("7 / 2"), Value::from(3.5));
        assert_eq!(eval_str("8 / 2"), Value::Int(4));
        assert_eq!(eval_str("9007199254740993 == 9007199254740992"), Value::from(false));
    }

    #[test]
    fn js_operators_are_accepted() {
        assert_eq!(eval_str("input.x === 5 && input.name !== 'x'"), Value::from(true));
        assert_eq!(eval_str("input.x > 10 || input.tags.includes('vip')"), Value::from(true));
        assert_eq!(eval_str("input.name.startsWith(\"Ada\")"), Value::from(true));
        assert_eq!(eval_str("!(input.x >= 5)"), Value::from(false));
    }

    #[test]
    fn keyword_operators_are_accepted() {
        assert_eq!(eval_str("input.name contains 'Love' and not false"), Value::from(true));
        assert_eq!(eval_str("{{nodes.score.value}} == 42 or false"), Value::from(true));
    }

    #[test]
    fn numeric_strings_compare_numerically() {
        assert_eq!(eval_str("nodes.score.value > 9"), Value::from(true));
        assert_eq!(eval_str("input.tags.length == 2"), Value::from(true));
    }

    #[test]
    fn missing_paths_are_falsy() {
        assert_eq!(eval_str("input.missing"), Value::Null);
        assert!(!evaluate_bool("input.missing", &context().resolver()).unwrap());
    }

    #[test]
    fn malformed_expressions_error() {
        let ctx = context();
        assert!(evaluate("input.x +", &ctx.resolver()).is_err());
        assert!(evaluate("(1 + 2", &ctx.resolver()).is_err());
        assert!(evaluate("1 / 0", &ctx.resolver()).is_err());
        assert!(evaluate("'open", &ctx.resolver()).is_err());
    }

    #[test]
    fn locals_are_visible() {
        let ctx = context();
        let locals = Map::from([("item".to_string(), Value::from(3))]);
        let resolver = ctx.resolver().with_locals(&locals);
        assert_eq!(evaluate("item * input.x", &resolver).unwrap(), Value::from(15));
    }
}
