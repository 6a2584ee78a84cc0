//! Leaf text templates and data references.
//!
//! Text uses `{{ source.path }}` placeholders:
//!
//! ```text
//! You are {{ persona.name }}. Today is {{clock}}.
//! Turn {{index}}: {{item.text}}
//! ```
//!
//! Templates are parsed once at compile time into literal and placeholder
//! segments; rendering only resolves placeholders through a [`ValueLookup`].

use promptloom_core::SourceResult;
use promptloom_core::value::value_to_text;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A reference to a named source, with optional resolver arguments and a
/// path into the resolved value.
///
/// Deserializes from either the shorthand string `"turns.0.text"` or a
/// table `{ source = "turns", args = {...}, path = "0.text" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SourceRefRepr", into = "SourceRefRepr")]
pub struct SourceRef {
    pub source: String,
    pub args: Value,
    pub path: Vec<String>,
}

impl SourceRef {
    /// Parse the dotted shorthand `source.seg.seg`.
    pub fn parse(dotted: &str) -> Result<Self, String> {
        let dotted = dotted.trim();
        let mut parts = dotted.split('.');
        let source = parts.next().unwrap_or_default();
        if source.is_empty() {
            return Err(format!("invalid source reference '{dotted}'"));
        }
        let path: Vec<String> = parts.map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            return Err(format!("empty path segment in '{dotted}'"));
        }
        Ok(Self {
            source: source.to_string(),
            args: Value::Null,
            path,
        })
    }

    /// A bare reference to a source with no arguments or path.
    pub fn named(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            args: Value::Null,
            path: Vec::new(),
        }
    }

    /// Attach resolver arguments.
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// The dotted form, without arguments.
    pub fn dotted(&self) -> String {
        if self.path.is_empty() {
            self.source.clone()
        } else {
            format!("{}.{}", self.source, self.path.join("."))
        }
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.dotted())
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum SourceRefRepr {
    Short(String),
    Full {
        source: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        args: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
}

impl TryFrom<SourceRefRepr> for SourceRef {
    type Error = String;

    fn try_from(repr: SourceRefRepr) -> Result<Self, Self::Error> {
        match repr {
            SourceRefRepr::Short(s) => SourceRef::parse(&s),
            SourceRefRepr::Full { source, args, path } => {
                let mut parsed = SourceRef::parse(&source)?;
                if let Some(path) = path.filter(|p| !p.is_empty()) {
                    parsed.path.extend(path.split('.').map(str::to_string));
                }
                parsed.args = args;
                Ok(parsed)
            }
        }
    }
}

impl From<SourceRef> for SourceRefRepr {
    fn from(r: SourceRef) -> Self {
        if r.args.is_null() {
            SourceRefRepr::Short(r.dotted())
        } else {
            SourceRefRepr::Full {
                source: r.source,
                args: r.args,
                path: (!r.path.is_empty()).then(|| r.path.join(".")),
            }
        }
    }
}

/// Anything that can resolve a [`SourceRef`] to a value.
///
/// The render engine implements this over its registry scope chain.
pub trait ValueLookup {
    fn lookup(&self, reference: &SourceRef) -> SourceResult<Option<Value>>;
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder(SourceRef),
}

/// A pre-parsed text template.
#[derive(Debug, Clone, PartialEq)]
pub struct TextTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl TextTemplate {
    /// Parse template text into segments.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut rest = raw;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| format!("unterminated placeholder at byte {}", raw.len() - rest.len() + start))?;
            let inner = after[..end].trim();
            if inner.is_empty() {
                return Err("empty placeholder '{{}}'".into());
            }
            if inner.contains("{{") {
                return Err(format!("nested placeholder in '{{{{{inner}}}}}'"));
            }
            segments.push(Segment::Placeholder(SourceRef::parse(inner)?));
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The original template text.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// True when the template has no placeholders.
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// All placeholder references, in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &SourceRef> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(r) => Some(r),
            Segment::Literal(_) => None,
        })
    }

    /// Render against a lookup. Missing values render as the empty string.
    pub fn render(&self, lookup: &dyn ValueLookup) -> SourceResult<String> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(reference) => {
                    if let Some(text) = lookup.lookup(reference)?.as_ref().and_then(value_to_text) {
                        out.push_str(&text);
                    }
                }
            }
        }
        Ok(out)
    }
}
