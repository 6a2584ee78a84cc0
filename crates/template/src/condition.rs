//! Condition expressions for `if` plan nodes.
//!
//! Fields are source references resolved through the registry scope, so a
//! condition can test context data as well as the current loop item:
//!
//! ```text
//! persona.greeting
//! NOT history
//! item.role == "assistant"
//! settings.mode MATCHES "^(story|chat)$" AND turns.length > 0
//! item.text NOT CONTAINS "ooc"
//! ```
//!
//! Grammar (informal):
//! ```text
//! expr     = clause (("AND" | "OR") clause)*
//! clause   = ["NOT" | "!"] (predicate | "(" expr ")")
//! predicate = field [check]
//! check    = ["NOT"] ("CONTAINS" | "MATCHES" | "STARTS_WITH" | "ENDS_WITH") value
//!          | ("==" | "!=" | ">" | "<" | ">=" | "<=") value
//! value    = QUOTED_STRING | NUMBER | "true" | "false" | WORD
//! ```
//!
//! AND and OR share one precedence level below NOT, and fold left to right.
//! A bare field tests truthiness. `field.length` on an array or string
//! yields its length when the value has no `length` key of its own.

use crate::text::{SourceRef, ValueLookup};
use promptloom_core::SourceResult;
use promptloom_core::value::{is_truthy, value_to_text};
use regex_lite::Regex;
use serde_json::Value;

/// A parsed condition tree.
#[derive(Debug, Clone)]
pub enum Condition {
    Predicate(Predicate),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    /// Empty input.
    Always,
}

/// A field, optionally compared against a literal.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub field: SourceRef,
    pub check: Option<Check>,
}

#[derive(Debug, Clone)]
pub struct Check {
    pub op: Op,
    /// `NOT CONTAINS`, `!=` and friends.
    pub negated: bool,
    pub value: Literal,
    pattern: Option<Regex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Contains,
    Matches,
    StartsWith,
    EndsWith,
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
}

impl Op {
    fn keyword(word: &str) -> Option<Op> {
        const KEYWORDS: [(&str, Op); 4] = [
            ("CONTAINS", Op::Contains),
            ("MATCHES", Op::Matches),
            ("STARTS_WITH", Op::StartsWith),
            ("ENDS_WITH", Op::EndsWith),
        ];
        KEYWORDS
            .iter()
            .find(|(kw, _)| word.eq_ignore_ascii_case(kw))
            .map(|(_, op)| *op)
    }
}

/// A literal on the right-hand side of a check.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl Literal {
    fn as_text(&self) -> String {
        match self {
            Literal::Str(s) => s.clone(),
            Literal::Num(n) => n.to_string(),
            Literal::Bool(b) => b.to_string(),
        }
    }
}

impl Condition {
    /// Evaluate this condition. Resolver errors propagate; `AND`/`OR`
    /// short-circuit, so the right side may never be resolved.
    pub fn evaluate(&self, lookup: &dyn ValueLookup) -> SourceResult<bool> {
        Ok(match self {
            Condition::Always => true,
            Condition::Predicate(p) => p.evaluate(lookup)?,
            Condition::And(a, b) => a.evaluate(lookup)? && b.evaluate(lookup)?,
            Condition::Or(a, b) => a.evaluate(lookup)? || b.evaluate(lookup)?,
            Condition::Not(inner) => !inner.evaluate(lookup)?,
        })
    }
}

impl Predicate {
    fn evaluate(&self, lookup: &dyn ValueLookup) -> SourceResult<bool> {
        let resolved = resolve_field(&self.field, lookup)?;
        Ok(match &self.check {
            None => is_truthy(resolved.as_ref()),
            Some(check) => check.holds(resolved.as_ref()) != check.negated,
        })
    }
}

impl Check {
    /// The un-negated outcome. A missing field satisfies no operator.
    fn holds(&self, resolved: Option<&Value>) -> bool {
        let Some(text) = resolved.and_then(value_to_text) else {
            return false;
        };
        let number = || text.parse::<f64>().ok();
        match (self.op, &self.value) {
            (Op::Matches, _) => self.pattern.as_ref().is_some_and(|re| re.is_match(&text)),
            (Op::Contains, lit) => text.contains(&lit.as_text()),
            (Op::StartsWith, lit) => text.starts_with(&lit.as_text()),
            (Op::EndsWith, lit) => text.ends_with(&lit.as_text()),
            (Op::Eq, Literal::Bool(b)) => resolved.and_then(Value::as_bool) == Some(*b),
            (Op::Eq, Literal::Num(n)) => number().is_some_and(|x| (x - n).abs() < f64::EPSILON),
            (Op::Eq, Literal::Str(s)) => text == *s,
            (Op::Gt, Literal::Num(n)) => number().is_some_and(|x| x > *n),
            (Op::Lt, Literal::Num(n)) => number().is_some_and(|x| x < *n),
            (Op::Ge, Literal::Num(n)) => number().is_some_and(|x| x >= *n),
            (Op::Le, Literal::Num(n)) => number().is_some_and(|x| x <= *n),
            (Op::Gt | Op::Lt | Op::Ge | Op::Le, _) => false,
        }
    }
}

/// Resolve a field, falling back to `.length` on arrays and strings.
fn resolve_field(field: &SourceRef, lookup: &dyn ValueLookup) -> SourceResult<Option<Value>> {
    if let Some(found) = lookup.lookup(field)? {
        return Ok(Some(found));
    }
    if field.path.last().map(String::as_str) != Some("length") {
        return Ok(None);
    }
    let mut parent = field.clone();
    parent.path.pop();
    Ok(match lookup.lookup(&parent)? {
        Some(Value::Array(items)) => Some(Value::from(items.len())),
        Some(Value::String(s)) => Some(Value::from(s.chars().count())),
        _ => None,
    })
}

// ─── Lexer ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Field names and keywords; keywords are recognised by the parser.
    Word(String),
    Str(String),
    Num(f64),
    /// Symbolic comparison, with its negation flag (`!=`).
    Cmp(Op, bool),
    Bang,
    Open,
    Close,
}

static SYMBOLS: [(&str, Token); 8] = [
    (">=", Token::Cmp(Op::Ge, false)),
    ("<=", Token::Cmp(Op::Le, false)),
    ("==", Token::Cmp(Op::Eq, false)),
    ("!=", Token::Cmp(Op::Eq, true)),
    (">", Token::Cmp(Op::Gt, false)),
    ("<", Token::Cmp(Op::Lt, false)),
    ("=", Token::Cmp(Op::Eq, false)),
    ("!", Token::Bang),
];

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}

fn lex(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut rest = input.trim_start();

    while let Some(c) = rest.chars().next() {
        let (token, len) = if c == '(' {
            (Token::Open, 1)
        } else if c == ')' {
            (Token::Close, 1)
        } else if c == '"' || c == '\'' {
            lex_string(rest, c)?
        } else if let Some((sym, token)) = SYMBOLS.iter().find(|(sym, _)| rest.starts_with(sym)) {
            (token.clone(), sym.len())
        } else if c.is_ascii_digit()
            || (c == '-' && rest[1..].starts_with(|d: char| d.is_ascii_digit()))
        {
            let len = 1 + rest[1..]
                .find(|d: char| !(d.is_ascii_digit() || d == '.'))
                .unwrap_or(rest.len() - 1);
            let num = rest[..len]
                .parse::<f64>()
                .map_err(|_| format!("invalid number: {}", &rest[..len]))?;
            (Token::Num(num), len)
        } else if is_word_char(c) {
            let len = rest.find(|w: char| !is_word_char(w)).unwrap_or(rest.len());
            (Token::Word(rest[..len].to_string()), len)
        } else {
            return Err(format!("unexpected character: {c}"));
        };
        tokens.push(token);
        rest = rest[len..].trim_start();
    }
    Ok(tokens)
}

/// Lex a quoted string starting at `input[0]`; backslash escapes the next char.
fn lex_string(input: &str, quote: char) -> Result<(Token, usize), String> {
    let mut out = String::new();
    let mut escaped = false;
    for (i, c) in input.char_indices().skip(1) {
        match c {
            _ if escaped => {
                out.push(c);
                escaped = false;
            }
            '\\' => escaped = true,
            _ if c == quote => return Ok((Token::Str(out), i + c.len_utf8())),
            _ => out.push(c),
        }
    }
    Err("unterminated string literal".into())
}

// ─── Parser ──────────────────────────────────────────────────────────

/// Parse a condition expression. Empty input yields [`Condition::Always`].
pub fn parse_condition(input: &str) -> Result<Condition, String> {
    if input.trim().is_empty() {
        return Ok(Condition::Always);
    }
    let mut parser = Parser {
        tokens: lex(input)?,
        pos: 0,
    };
    let condition = parser.expr()?;
    match parser.peek() {
        None => Ok(condition),
        Some(extra) => Err(format!("unexpected {extra:?} after expression")),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += usize::from(token.is_some());
        token
    }

    fn is_keyword(&self, offset: usize, keyword: &str) -> bool {
        matches!(self.tokens.get(self.pos + offset), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn expr(&mut self) -> Result<Condition, String> {
        let mut left = self.clause()?;
        loop {
            if self.is_keyword(0, "AND") {
                self.pos += 1;
                left = Condition::And(Box::new(left), Box::new(self.clause()?));
            } else if self.is_keyword(0, "OR") {
                self.pos += 1;
                left = Condition::Or(Box::new(left), Box::new(self.clause()?));
            } else {
                return Ok(left);
            }
        }
    }

    fn clause(&mut self) -> Result<Condition, String> {
        if self.is_keyword(0, "NOT") || self.peek() == Some(&Token::Bang) {
            self.pos += 1;
            return Ok(Condition::Not(Box::new(self.clause()?)));
        }
        if self.peek() == Some(&Token::Open) {
            self.pos += 1;
            let inner = self.expr()?;
            return match self.bump() {
                Some(Token::Close) => Ok(inner),
                _ => Err("expected closing parenthesis".into()),
            };
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Condition, String> {
        let field = match self.bump() {
            Some(Token::Word(w)) if !is_reserved(&w) => SourceRef::parse(&w)?,
            other => return Err(format!("expected field name, got {other:?}")),
        };
        let check = self.check()?;
        Ok(Condition::Predicate(Predicate { field, check }))
    }

    fn check(&mut self) -> Result<Option<Check>, String> {
        let negated_keyword = self.is_keyword(0, "NOT")
            && matches!(self.tokens.get(self.pos + 1), Some(Token::Word(w)) if Op::keyword(w).is_some());
        let offset = usize::from(negated_keyword);

        let (op, negated) = match self.tokens.get(self.pos + offset) {
            Some(Token::Cmp(op, negated)) if !negated_keyword => (*op, *negated),
            Some(Token::Word(w)) => match Op::keyword(w) {
                Some(op) => (op, negated_keyword),
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
        self.pos += offset + 1;

        let value = self.literal()?;
        let pattern = match op {
            Op::Matches => {
                let source = value.as_text();
                Some(Regex::new(&source).map_err(|e| format!("invalid pattern '{source}': {e}"))?)
            }
            _ => None,
        };
        Ok(Some(Check {
            op,
            negated,
            value,
            pattern,
        }))
    }

    fn literal(&mut self) -> Result<Literal, String> {
        match self.bump() {
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Num(n)) => Ok(Literal::Num(n)),
            Some(Token::Word(w)) if w == "true" => Ok(Literal::Bool(true)),
            Some(Token::Word(w)) if w == "false" => Ok(Literal::Bool(false)),
            Some(Token::Word(w)) if !is_reserved(&w) => Ok(Literal::Str(w)),
            other => Err(format!("expected a string, number or boolean, got {other:?}")),
        }
    }
}

fn is_reserved(word: &str) -> bool {
    ["AND", "OR", "NOT"].iter().any(|kw| word.eq_ignore_ascii_case(kw)) || Op::keyword(word).is_some()
}
