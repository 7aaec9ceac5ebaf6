//! Field template engine for cloud-init content and resource names
//!
//! Supports the action subset node templates are written in:
//!
//! - `{{.Compute.HostName}}` field paths, matched case-insensitively against
//!   the record's keys; `$` is the root, `$name` a declared variable
//! - `{{if}}` / `{{else if}}` / `{{else}}` / `{{end}}`, `{{with}}`
//! - `{{range $i, $e := .List}}` over arrays and maps
//! - `{{define "user-data"}}` sections and `{{template "name" .}}`
//! - `{{/* comments */}}` and `{{-` / `-}}` whitespace trimming
//! - functions `index`, `len`, `eq`, `ne`, `not`, `and`, `or`
//!
//! A missing field renders as an empty string.

use crate::domain::ports::ContentRenderer;
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Maximum nesting of `{{template}}` invocations
const MAX_TEMPLATE_DEPTH: usize = 32;

// =============================================================================
// Syntax Tree
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    /// Field path relative to dot; empty path is dot itself
    Dot(Vec<String>),
    /// Variable (`$` for root) with a field path
    Var(String, Vec<String>),
    Literal(Value),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Output(Expr),
    Assign(String, Expr),
    If {
        cond: Expr,
        body: Vec<Node>,
        else_body: Vec<Node>,
    },
    With {
        expr: Expr,
        body: Vec<Node>,
        else_body: Vec<Node>,
    },
    Range {
        vars: Vec<String>,
        expr: Expr,
        body: Vec<Node>,
        else_body: Vec<Node>,
    },
    Template(String, Option<Expr>),
}

/// Parsed template: top-level body plus named sections
#[derive(Debug, Default)]
struct Parsed {
    body: Vec<Node>,
    sections: HashMap<String, Vec<Node>>,
}

// =============================================================================
// Lexer
// =============================================================================

#[derive(Debug)]
enum Token {
    Text(String),
    Action(String),
}

fn lex(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut rest = src;
    let mut trim_next = false;

    while let Some(start) = rest.find("{{") {
        let mut text = &rest[..start];
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| Error::Template("unclosed action".into()))?;
        let mut inner = &after[..end];

        let mut trim_left = false;
        if let Some(stripped) = inner.strip_prefix('-') {
            if stripped.starts_with(char::is_whitespace) {
                trim_left = true;
                inner = stripped;
            }
        }
        let mut trim_right = false;
        if let Some(stripped) = inner.strip_suffix('-') {
            if stripped.ends_with(char::is_whitespace) {
                trim_right = true;
                inner = stripped;
            }
        }

        if trim_next {
            text = text.trim_start();
        }
        if trim_left {
            text = text.trim_end();
        }
        if !text.is_empty() {
            tokens.push(Token::Text(text.to_string()));
        }

        let inner = inner.trim();
        let is_comment = inner.starts_with("/*") && inner.ends_with("*/");
        if !is_comment {
            tokens.push(Token::Action(inner.to_string()));
        }

        trim_next = trim_right;
        rest = &after[end + 2..];
    }

    let text = if trim_next { rest.trim_start() } else { rest };
    if !text.is_empty() {
        tokens.push(Token::Text(text.to_string()));
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Word {
    Open,
    Close,
    Str(String),
    Raw(String),
}

fn lex_words(src: &str) -> Result<Vec<Word>> {
    let mut words = Vec::new();
    let mut chars = src.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                words.push(Word::Open);
            }
            ')' => {
                chars.next();
                words.push(Word::Close);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => return Err(Error::Template("unterminated string".into())),
                        },
                        Some(other) => s.push(other),
                        None => return Err(Error::Template("unterminated string".into())),
                    }
                }
                words.push(Word::Str(s));
            }
            '`' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('`') => break,
                        Some(other) => s.push(other),
                        None => return Err(Error::Template("unterminated raw string".into())),
                    }
                }
                words.push(Word::Str(s));
            }
            _ => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' {
                        break;
                    }
                    s.push(c);
                    chars.next();
                }
                words.push(Word::Raw(s));
            }
        }
    }
    Ok(words)
}

// =============================================================================
// Parser
// =============================================================================

fn split_path(path: &str) -> Vec<String> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

enum Term {
    Expr(Expr),
    Ident(String),
}

fn parse_term(words: &[Word], pos: &mut usize) -> Result<Term> {
    let word = words
        .get(*pos)
        .ok_or_else(|| Error::Template("missing operand".into()))?;
    *pos += 1;
    match word {
        Word::Open => {
            let expr = parse_command(words, pos)?;
            match words.get(*pos) {
                Some(Word::Close) => {
                    *pos += 1;
                    Ok(Term::Expr(expr))
                }
                _ => Err(Error::Template("unclosed parenthesis".into())),
            }
        }
        Word::Close => Err(Error::Template("unexpected \")\"".into())),
        Word::Str(s) => Ok(Term::Expr(Expr::Literal(Value::String(s.clone())))),
        Word::Raw(raw) => {
            if raw == "|" {
                return Err(Error::Template("pipelines are not supported".into()));
            }
            if let Some(path) = raw.strip_prefix('.') {
                return Ok(Term::Expr(Expr::Dot(split_path(path))));
            }
            if raw.starts_with('$') {
                let (name, path) = match raw.split_once('.') {
                    Some((name, path)) => (name, split_path(path)),
                    None => (raw.as_str(), Vec::new()),
                };
                return Ok(Term::Expr(Expr::Var(name.to_string(), path)));
            }
            match raw.as_str() {
                "true" => return Ok(Term::Expr(Expr::Literal(Value::Bool(true)))),
                "false" => return Ok(Term::Expr(Expr::Literal(Value::Bool(false)))),
                "nil" => return Ok(Term::Expr(Expr::Literal(Value::Null))),
                _ => {}
            }
            if let Ok(n) = raw.parse::<i64>() {
                return Ok(Term::Expr(Expr::Literal(Value::from(n))));
            }
            if let Ok(f) = raw.parse::<f64>() {
                return Ok(Term::Expr(Expr::Literal(Value::from(f))));
            }
            if raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Ok(Term::Ident(raw.clone()));
            }
            Err(Error::Template(format!("unexpected \"{}\" in operand", raw)))
        }
    }
}

/// Parse one command up to the end of input or a closing parenthesis
fn parse_command(words: &[Word], pos: &mut usize) -> Result<Expr> {
    let mut terms = Vec::new();
    while *pos < words.len() && words[*pos] != Word::Close {
        terms.push(parse_term(words, pos)?);
    }
    let mut terms = terms.into_iter();
    match terms.next() {
        None => Err(Error::Template("empty command".into())),
        Some(Term::Ident(name)) => {
            let args = terms
                .map(|t| match t {
                    Term::Expr(e) => Ok(e),
                    Term::Ident(i) => Ok(Expr::Call(i, Vec::new())),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Expr::Call(name, args))
        }
        Some(Term::Expr(expr)) => {
            if terms.next().is_some() {
                return Err(Error::Template("can't give argument to non-function".into()));
            }
            Ok(expr)
        }
    }
}

fn parse_expr(src: &str) -> Result<Expr> {
    let words = lex_words(src)?;
    let mut pos = 0;
    let expr = parse_command(&words, &mut pos)?;
    if pos != words.len() {
        return Err(Error::Template(format!("unexpected \")\" in \"{}\"", src)));
    }
    Ok(expr)
}

fn parse_string_literal(src: &str) -> Result<(String, &str)> {
    let src = src.trim_start();
    let body = src
        .strip_prefix('"')
        .ok_or_else(|| Error::Template(format!("expected quoted name, got \"{}\"", src)))?;
    let end = body
        .find('"')
        .ok_or_else(|| Error::Template("unterminated name".into()))?;
    Ok((body[..end].to_string(), &body[end + 1..]))
}

/// Split `$a, $b := expr` into variable names and the expression
fn split_declaration(src: &str) -> (Vec<String>, &str) {
    match src.split_once(":=") {
        Some((lhs, rhs)) if lhs.trim_start().starts_with('$') => (
            lhs.split(',').map(|v| v.trim().to_string()).collect(),
            rhs,
        ),
        _ => (Vec::new(), src),
    }
}

enum Stop {
    End,
    Else(String),
}

struct Parser {
    tokens: std::vec::IntoIter<Token>,
    sections: HashMap<String, Vec<Node>>,
}

impl Parser {
    fn parse(src: &str) -> Result<Parsed> {
        let mut parser = Parser {
            tokens: lex(src)?.into_iter(),
            sections: HashMap::new(),
        };
        let (body, stop) = parser.parse_list()?;
        if stop.is_some() {
            return Err(Error::Template("unexpected {{end}} or {{else}}".into()));
        }
        Ok(Parsed {
            body,
            sections: parser.sections,
        })
    }

    fn parse_list(&mut self) -> Result<(Vec<Node>, Option<Stop>)> {
        let mut nodes = Vec::new();
        while let Some(token) = self.tokens.next() {
            let action = match token {
                Token::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Token::Action(action) => action,
            };
            let (keyword, rest) = match action.split_once(char::is_whitespace) {
                Some((k, r)) => (k, r.trim()),
                None => (action.as_str(), ""),
            };
            match keyword {
                "end" => return Ok((nodes, Some(Stop::End))),
                "else" => return Ok((nodes, Some(Stop::Else(rest.to_string())))),
                "if" => nodes.push(self.parse_if(rest)?),
                "with" => {
                    let expr = parse_expr(rest)?;
                    let (body, else_body) = self.parse_branches("with")?;
                    nodes.push(Node::With {
                        expr,
                        body,
                        else_body,
                    });
                }
                "range" => {
                    let (vars, src) = split_declaration(rest);
                    if vars.len() > 2 {
                        return Err(Error::Template("too many range variables".into()));
                    }
                    let expr = parse_expr(src)?;
                    let (body, else_body) = self.parse_branches("range")?;
                    nodes.push(Node::Range {
                        vars,
                        expr,
                        body,
                        else_body,
                    });
                }
                "define" => {
                    let (name, _) = parse_string_literal(rest)?;
                    let (body, stop) = self.parse_list()?;
                    match stop {
                        Some(Stop::End) => {
                            self.sections.insert(name, body);
                        }
                        _ => return Err(Error::Template(format!("unterminated define \"{}\"", name))),
                    }
                }
                "template" => {
                    let (name, arg) = parse_string_literal(rest)?;
                    let arg = if arg.trim().is_empty() {
                        None
                    } else {
                        Some(parse_expr(arg)?)
                    };
                    nodes.push(Node::Template(name, arg));
                }
                _ => nodes.push(parse_output(&action)?),
            }
        }
        Ok((nodes, None))
    }

    fn parse_if(&mut self, cond_src: &str) -> Result<Node> {
        let cond = parse_expr(cond_src)?;
        let (body, stop) = self.parse_list()?;
        let else_body = match stop {
            Some(Stop::End) => Vec::new(),
            Some(Stop::Else(rest)) if rest.is_empty() => self.parse_else_body("if")?,
            Some(Stop::Else(rest)) => match rest.strip_prefix("if") {
                // `else if` shares the closing `end` of the outer `if`
                Some(cond) if cond.starts_with(char::is_whitespace) => vec![self.parse_if(cond.trim())?],
                _ => return Err(Error::Template(format!("unexpected \"else {}\"", rest))),
            },
            None => return Err(Error::Template("unterminated if".into())),
        };
        Ok(Node::If {
            cond,
            body,
            else_body,
        })
    }

    fn parse_branches(&mut self, keyword: &str) -> Result<(Vec<Node>, Vec<Node>)> {
        let (body, stop) = self.parse_list()?;
        match stop {
            Some(Stop::End) => Ok((body, Vec::new())),
            Some(Stop::Else(rest)) if rest.is_empty() => Ok((body, self.parse_else_body(keyword)?)),
            _ => Err(Error::Template(format!("unterminated {}", keyword))),
        }
    }

    fn parse_else_body(&mut self, keyword: &str) -> Result<Vec<Node>> {
        match self.parse_list()? {
            (body, Some(Stop::End)) => Ok(body),
            _ => Err(Error::Template(format!("unterminated {} else", keyword))),
        }
    }
}

fn parse_output(action: &str) -> Result<Node> {
    let words = lex_words(action)?;
    if let [Word::Raw(var), Word::Raw(op), ..] = words.as_slice() {
        if var.starts_with('$') && (op == ":=" || op == "=") {
            let (_, rhs) = action
                .split_once(op.as_str())
                .ok_or_else(|| Error::Template(format!("bad assignment \"{}\"", action)))?;
            return Ok(Node::Assign(var.clone(), parse_expr(rhs)?));
        }
    }
    Ok(Node::Output(parse_expr(action)?))
}

// =============================================================================
// Evaluation
// =============================================================================

fn field<'v>(value: &'v Value, key: &str) -> Option<&'v Value> {
    let map = value.as_object()?;
    map.get(key).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

fn lookup_path(value: &Value, path: &[String]) -> Value {
    let mut current = value;
    for key in path {
        match field(current, key) {
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
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn print(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(print).collect();
            format!("[{}]", items.join(" "))
        }
        Value::Object(map) => {
            let items: Vec<String> = map.iter().map(|(k, v)| format!("{}:{}", k, print(v))).collect();
            format!("map[{}]", items.join(" "))
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

struct Exec<'a> {
    root: &'a Value,
    sections: &'a HashMap<String, Vec<Node>>,
    vars: Vec<(String, Value)>,
    depth: usize,
}

impl Exec<'_> {
    fn eval(&self, expr: &Expr, dot: &Value) -> Result<Value> {
        match expr {
            Expr::Dot(path) => Ok(lookup_path(dot, path)),
            Expr::Var(name, path) => {
                if name == "$" {
                    return Ok(lookup_path(self.root, path));
                }
                let (_, value) = self
                    .vars
                    .iter()
                    .rev()
                    .find(|(n, _)| n == name)
                    .ok_or_else(|| Error::Template(format!("undefined variable \"{}\"", name)))?;
                Ok(lookup_path(value, path))
            }
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a, dot))
                    .collect::<Result<Vec<_>>>()?;
                call(name, args)
            }
        }
    }

    fn render(&mut self, nodes: &[Node], dot: &Value, out: &mut String) -> Result<()> {
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Output(expr) => out.push_str(&print(&self.eval(expr, dot)?)),
                Node::Assign(name, expr) => {
                    let value = self.eval(expr, dot)?;
                    match self.vars.iter_mut().rev().find(|(n, _)| n == name) {
                        Some(slot) => slot.1 = value,
                        None => self.vars.push((name.clone(), value)),
                    }
                }
                Node::If {
                    cond,
                    body,
                    else_body,
                } => {
                    let branch = if truthy(&self.eval(cond, dot)?) { body } else { else_body };
                    self.render_scoped(branch, dot, out)?;
                }
                Node::With {
                    expr,
                    body,
                    else_body,
                } => {
                    let value = self.eval(expr, dot)?;
                    if truthy(&value) {
                        self.render_scoped(body, &value, out)?;
                    } else {
                        self.render_scoped(else_body, dot, out)?;
                    }
                }
                Node::Range {
                    vars,
                    expr,
                    body,
                    else_body,
                } => {
                    let items: Vec<(Value, Value)> = match self.eval(expr, dot)? {
                        Value::Null => Vec::new(),
                        Value::Array(items) => items
                            .into_iter()
                            .enumerate()
                            .map(|(i, v)| (Value::from(i), v))
                            .collect(),
                        Value::Object(map) => {
                            map.into_iter().map(|(k, v)| (Value::String(k), v)).collect()
                        }
                        other => {
                            return Err(Error::Template(format!("range can't iterate over {}", other)))
                        }
                    };
                    if items.is_empty() {
                        self.render_scoped(else_body, dot, out)?;
                        continue;
                    }
                    for (key, elem) in items {
                        let mark = self.vars.len();
                        match vars.as_slice() {
                            [value_var] => self.vars.push((value_var.clone(), elem.clone())),
                            [key_var, value_var] => {
                                self.vars.push((key_var.clone(), key));
                                self.vars.push((value_var.clone(), elem.clone()));
                            }
                            _ => {}
                        }
                        self.render(body, &elem, out)?;
                        self.vars.truncate(mark);
                    }
                }
                Node::Template(name, arg) => {
                    let sections = self.sections;
                    let section = sections
                        .get(name)
                        .ok_or_else(|| Error::Template(format!("no such template \"{}\"", name)))?;
                    if self.depth >= MAX_TEMPLATE_DEPTH {
                        return Err(Error::Template(format!("template \"{}\" nests too deeply", name)));
                    }
                    let data = match arg {
                        Some(expr) => self.eval(expr, dot)?,
                        None => Value::Null,
                    };
                    let saved = std::mem::take(&mut self.vars);
                    self.depth += 1;
                    let result = self.render(section, &data, out);
                    self.depth -= 1;
                    self.vars = saved;
                    result?;
                }
            }
        }
        Ok(())
    }

    fn render_scoped(&mut self, nodes: &[Node], dot: &Value, out: &mut String) -> Result<()> {
        let mark = self.vars.len();
        let result = self.render(nodes, dot, out);
        self.vars.truncate(mark);
        result
    }
}

fn call(name: &str, args: Vec<Value>) -> Result<Value> {
    let arity = |n: usize| -> Result<()> {
        if args.len() < n {
            Err(Error::Template(format!("{} needs at least {} arguments", name, n)))
        } else {
            Ok(())
        }
    };
    match name {
        "index" => {
            arity(1)?;
            let mut current = args[0].clone();
            for key in &args[1..] {
                current = match (&current, key) {
                    (Value::Array(items), Value::Number(n)) => {
                        let i = n
                            .as_u64()
                            .ok_or_else(|| Error::Template(format!("bad index {}", n)))?;
                        items
                            .get(i as usize)
                            .cloned()
                            .ok_or_else(|| Error::Template(format!("index {} out of range", i)))?
                    }
                    (Value::Object(_), Value::String(k)) => field(&current, k).cloned().unwrap_or(Value::Null),
                    (Value::Null, _) => Value::Null,
                    (other, key) => {
                        return Err(Error::Template(format!("can't index {} with {}", other, key)))
                    }
                };
            }
            Ok(current)
        }
        "len" => {
            arity(1)?;
            let n = match &args[0] {
                Value::String(s) => s.len(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                Value::Null => 0,
                other => return Err(Error::Template(format!("len of {}", other))),
            };
            Ok(Value::from(n))
        }
        "eq" => {
            arity(2)?;
            Ok(Value::Bool(args[1..].iter().any(|b| values_equal(&args[0], b))))
        }
        "ne" => {
            arity(2)?;
            Ok(Value::Bool(!values_equal(&args[0], &args[1])))
        }
        "not" => {
            arity(1)?;
            Ok(Value::Bool(!truthy(&args[0])))
        }
        "and" => {
            arity(1)?;
            let last = args.len() - 1;
            Ok(args
                .iter()
                .position(|v| !truthy(v))
                .map(|i| args[i].clone())
                .unwrap_or_else(|| args[last].clone()))
        }
        "or" => {
            arity(1)?;
            let last = args.len() - 1;
            Ok(args
                .iter()
                .position(truthy)
                .map(|i| args[i].clone())
                .unwrap_or_else(|| args[last].clone()))
        }
        other => Err(Error::Template(format!("function \"{}\" not defined", other))),
    }
}

// =============================================================================
// Renderer
// =============================================================================

/// Template renderer over a JSON data context
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldTemplate;

impl FieldTemplate {
    pub fn new() -> Self {
        Self
    }

    /// Render the top-level text of `template`
    pub fn render_str(&self, template: &str, context: &Value) -> Result<String> {
        let parsed = Parser::parse(template)?;
        Self::execute(&parsed, &parsed.body, context)
    }

    /// Render section `section`, or the top-level text when no such section
    /// is defined
    pub fn render_section(&self, template: &str, section: &str, context: &Value) -> Result<String> {
        let parsed = Parser::parse(template)?;
        let nodes = parsed.sections.get(section).unwrap_or(&parsed.body);
        Self::execute(&parsed, nodes, context)
            .map_err(|e| Error::Template(format!("{}: {}", section, e)))
    }

    fn execute(parsed: &Parsed, nodes: &[Node], context: &Value) -> Result<String> {
        let mut exec = Exec {
            root: context,
            sections: &parsed.sections,
            vars: Vec::new(),
            depth: 0,
        };
        let mut out = String::new();
        exec.render(nodes, context, &mut out)?;
        Ok(out)
    }
}

impl ContentRenderer for FieldTemplate {
    fn render(&self, template: &str, section: &str, context: &Value) -> Result<Vec<u8>> {
        Ok(self.render_section(template, section, context)?.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "compute": { "hostName": "node-1" },
            "network": {
                "iscsiInitiator": [
                    { "name": "iscsi0", "ip": "10.0.0.5", "netlen": "24" },
                    { "name": "iscsi1", "ip": "10.0.1.5", "netlen": "24" }
                ]
            },
            "cloudArgs": { "ssh_key": "ssh-ed25519 AAAA" }
        })
    }

    fn render(src: &str) -> String {
        FieldTemplate::new().render_str(src, &context()).unwrap()
    }

    #[test]
    fn test_fields_are_case_insensitive() {
        assert_eq!(render("host={{.Compute.HostName}}"), "host=node-1");
        assert_eq!(render("{{ .compute.hostName }}"), "node-1");
    }

    #[test]
    fn test_missing_field_renders_empty() {
        assert_eq!(render("[{{.Compute.Domain}}]"), "[]");
        assert_eq!(render("[{{.Nope.Deeper.Still}}]"), "[]");
    }

    #[test]
    fn test_range_with_variables_and_root() {
        let out = render(
            "{{range $i, $iface := .Network.IscsiInitiator}}{{$i}}:{{$iface.Name}}@{{$.Compute.HostName}} {{end}}",
        );
        assert_eq!(out, "0:iscsi0@node-1 1:iscsi1@node-1 ");

        let out = render("{{range .Network.IscsiInitiator}}{{.Ip}}/{{.Netlen}};{{end}}");
        assert_eq!(out, "10.0.0.5/24;10.0.1.5/24;");
    }

    #[test]
    fn test_range_else_on_empty() {
        assert_eq!(render("{{range .Network.NvmeHost}}x{{else}}none{{end}}"), "none");
    }

    #[test]
    fn test_if_else_chain() {
        let src = r#"{{if eq .Compute.HostName "node-2"}}two{{else if eq .Compute.HostName "node-1"}}one{{else}}other{{end}}"#;
        assert_eq!(render(src), "one");
        assert_eq!(render("{{if .CloudArgs.missing}}yes{{else}}no{{end}}"), "no");
        assert_eq!(render("{{if not .CloudArgs.missing}}yes{{end}}"), "yes");
    }

    #[test]
    fn test_trim_markers_and_comments() {
        let src = "a  {{- /* comment */ -}}  b\n{{- .Compute.HostName }}";
        assert_eq!(render(src), "abnode-1");
    }

    #[test]
    fn test_index_and_len() {
        assert_eq!(render(r#"{{index .CloudArgs "ssh_key"}}"#), "ssh-ed25519 AAAA");
        assert_eq!(render("{{index (index .Network.IscsiInitiator 1) \"name\"}}"), "iscsi1");
        assert_eq!(render("{{len .Network.IscsiInitiator}}"), "2");
        assert_eq!(render("{{$first := index .Network.IscsiInitiator 0}}{{$first.Name}}"), "iscsi0");
    }

    #[test]
    fn test_sections_select_block_or_fall_back() {
        let src = r#"{{define "meta-data"}}instance-id: {{.Compute.HostName}}{{end}}
{{- define "user-data"}}#cloud-config
hostname: {{.Compute.HostName}}{{end}}default"#;
        let tmpl = FieldTemplate::new();
        let ctx = context();
        assert_eq!(tmpl.render_section(src, "meta-data", &ctx).unwrap(), "instance-id: node-1");
        assert_eq!(
            tmpl.render_section(src, "user-data", &ctx).unwrap(),
            "#cloud-config\nhostname: node-1"
        );
        assert_eq!(tmpl.render_section(src, "network-config", &ctx).unwrap(), "default");
    }

    #[test]
    fn test_template_invocation() {
        let src = r#"{{define "host"}}h={{.HostName}}{{end}}{{template "host" .Compute}}"#;
        assert_eq!(render(src), "h=node-1");
    }

    #[test]
    fn test_parse_errors() {
        let tmpl = FieldTemplate::new();
        let ctx = context();
        assert_matches!(tmpl.render_str("{{.Compute.HostName", &ctx), Err(Error::Template(_)));
        assert_matches!(tmpl.render_str("{{if .X}}open", &ctx), Err(Error::Template(_)));
        assert_matches!(tmpl.render_str("{{end}}", &ctx), Err(Error::Template(_)));
        assert_matches!(tmpl.render_str("{{upper .X}}", &ctx), Err(Error::Template(_)));
    }
}
