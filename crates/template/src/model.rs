//! Template data model: the declarative, serializable form of a prompt.
//!
//! Templates are authored in TOML or JSON. Node variants are tagged with a
//! `kind` field:
//!
//! ```toml
//! id = "chat"
//! task = "chat"
//!
//! [[layout]]
//! kind = "message"
//! role = "system"
//! content = "You are {{persona.name}}."
//!
//! [[layout]]
//! kind = "slot"
//! name = "history"
//!
//! [slots.history]
//! budget = 800
//!
//! [[slots.history.plan]]
//! kind = "for_each"
//! source = "turns"
//! order = "asc"
//!
//! [[slots.history.plan.plan]]
//! kind = "message"
//! role = "user"
//! content = "{{item.text}}"
//! ```

use crate::CompileError;
use crate::text::SourceRef;
use promptloom_core::Role;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Named values carried by lanes, groups and injection requests.
pub type Payload = Map<String, Value>;

/// A prompt template before compilation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Template {
    /// Unique template id.
    pub id: String,

    /// The generation task this template targets (e.g. "chat", "summary").
    #[serde(default)]
    pub task: String,

    #[serde(default = "default_version")]
    pub version: u32,

    /// Top-level message structure, in order.
    #[serde(default)]
    pub layout: Vec<LayoutNode>,

    /// Named slots referenced from the layout.
    #[serde(default)]
    pub slots: BTreeMap<String, Slot>,

    /// Attachment lanes available to the injection pass.
    #[serde(default, alias = "attachments")]
    pub lanes: Vec<Lane>,
}

fn default_version() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_item() -> String {
    "item".into()
}
fn default_index() -> String {
    "index".into()
}

impl Template {
    /// Load a template from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, CompileError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Load a template from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self, CompileError> {
        Ok(serde_json::from_str(json_str)?)
    }
}

/// One entry of the top-level layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayoutNode {
    /// A single message, literal or data-bound.
    Message(MessageSpec),
    /// The output of a named slot, optionally wrapped.
    Slot(SlotRef),
    /// Records the current tail position under a key.
    Anchor(AnchorSpec),
}

/// A message leaf. Exactly one of `content` and `source` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageSpec {
    #[serde(default)]
    pub role: Role,

    /// Literal text template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Data reference whose resolved value becomes the content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,

    /// Continue the current turn rather than start a new one.
    #[serde(default)]
    pub prefix: bool,

    /// Local token ceiling for this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<usize>,
}

impl MessageSpec {
    /// A literal message.
    pub fn literal(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// A data-bound message.
    pub fn from_source(role: Role, source: SourceRef) -> Self {
        Self {
            role,
            source: Some(source),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotRef {
    /// Name of the slot in [`Template::slots`].
    pub name: String,

    #[serde(default)]
    pub header: Vec<MessageSpec>,

    #[serde(default)]
    pub footer: Vec<MessageSpec>,

    /// Skip header/footer when the slot renders nothing.
    #[serde(default = "default_true", alias = "omitIfEmpty")]
    pub omit_if_empty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorSpec {
    /// Anchor key; may contain placeholders such as `turn_{{index}}`.
    pub key: String,
}

/// A named, independently planned and budgeted sub-sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Slot {
    /// Ordering hint for consumers.  Ties broken by name.
    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<usize>,

    #[serde(default)]
    pub plan: Vec<PlanNode>,
}

/// One instruction of a slot plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanNode {
    Message(MessageSpec),
    #[serde(alias = "forEach")]
    ForEach(ForEach),
    If(IfNode),
    Anchor(AnchorSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForEach {
    /// Source resolving to an array.
    pub source: SourceRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<SortOrder>,

    /// Keep at most this many items after ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Text emitted as a user message between items.
    #[serde(default, alias = "interleave", skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<usize>,

    #[serde(default = "default_true", alias = "stopWhenOutOfBudget")]
    pub stop_when_out_of_budget: bool,

    /// Binding name for the current item.
    #[serde(default = "default_item", rename = "as")]
    pub item_as: String,

    /// Binding name for the current index.
    #[serde(default = "default_index", alias = "indexAs")]
    pub index_as: String,

    /// Nodes executed once per item.
    #[serde(default)]
    pub plan: Vec<PlanNode>,
}

impl ForEach {
    pub fn over(source: SourceRef, plan: Vec<PlanNode>) -> Self {
        Self {
            source,
            order: None,
            limit: None,
            separator: None,
            budget: None,
            stop_when_out_of_budget: true,
            item_as: default_item(),
            index_as: default_index(),
            plan,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfNode {
    /// Condition expression, see [`crate::condition`].
    pub condition: String,

    #[serde(default)]
    pub then: Vec<PlanNode>,

    #[serde(default, rename = "else")]
    pub otherwise: Vec<PlanNode>,
}

/// An independent channel of injected content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lane {
    pub id: String,

    /// Lanes run in ascending order.
    #[serde(default)]
    pub order: i32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    /// Default text template for requests in this lane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Payload,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<usize>,

    /// Tokens held back from the main render for this lane.
    #[serde(default, alias = "reserveTokens", skip_serializing_if = "Option::is_none")]
    pub reserve_tokens: Option<usize>,

    #[serde(default)]
    pub groups: Vec<Group>,
}

impl Lane {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            order: 0,
            enabled: true,
            role: None,
            template: None,
            payload: Payload::new(),
            budget: None,
            reserve_tokens: None,
            groups: Vec::new(),
        }
    }
}

/// A sub-partition of a lane whose insertions are wrapped by open/close
/// markers. Matched by exact `id`, then by `pattern` (a regular expression).
/// A group with neither is the lane's default group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Group {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Payload,
}

/// A request to inject one message into a lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Injection {
    pub lane: String,

    /// One target, or fallbacks tried in order.
    pub target: Targets,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Payload,

    /// Lower runs first. Ties keep submission order.
    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl Injection {
    pub fn new(lane: impl Into<String>, target: impl Into<Targets>) -> Self {
        Self {
            lane: lane.into(),
            target: target.into(),
            payload: Payload::new(),
            priority: 0,
            group: None,
            template: None,
            role: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.payload
            .insert("content".into(), Value::String(content.into()));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Targets {
    One(TargetSpec),
    Many(Vec<TargetSpec>),
}

impl Targets {
    /// Candidates in the order they should be tried.
    pub fn candidates(&self) -> &[TargetSpec] {
        match self {
            Targets::One(spec) => std::slice::from_ref(spec),
            Targets::Many(specs) => specs,
        }
    }
}

impl From<TargetSpec> for Targets {
    fn from(spec: TargetSpec) -> Self {
        Targets::One(spec)
    }
}

impl From<Vec<TargetSpec>> for Targets {
    fn from(specs: Vec<TargetSpec>) -> Self {
        Targets::Many(specs)
    }
}

/// Where an injected message lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetSpec {
    /// At a recorded anchor position.
    At {
        key: String,
        #[serde(default)]
        occurrence: Occurrence,
    },
    /// The last recorded position for `key`, shifted by `delta`.
    Offset {
        key: String,
        #[serde(default)]
        delta: i64,
    },
    /// The top or bottom of the message list, shifted by `delta`.
    Boundary {
        edge: Edge,
        #[serde(default)]
        delta: i64,
    },
}

impl TargetSpec {
    pub fn at(key: impl Into<String>) -> Self {
        TargetSpec::At {
            key: key.into(),
            occurrence: Occurrence::Last,
        }
    }

    pub fn offset(key: impl Into<String>, delta: i64) -> Self {
        TargetSpec::Offset {
            key: key.into(),
            delta,
        }
    }

    pub fn top() -> Self {
        TargetSpec::Boundary {
            edge: Edge::Top,
            delta: 0,
        }
    }

    pub fn bottom() -> Self {
        TargetSpec::Boundary {
            edge: Edge::Bottom,
            delta: 0,
        }
    }
}

/// Which recorded position of an anchor key to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Occurrence {
    First,
    #[default]
    Last,
    /// 0-based.
    Nth(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Top,
    Bottom,
}
