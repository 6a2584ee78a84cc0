//! Template compiler: validates a [`Template`] and lowers it into an
//! immutable [`CompiledTemplate`].
//!
//! Every leaf text template, condition and group pattern is parsed here so
//! that renders never re-parse text. A compiled template is read-only and can
//! be shared across concurrent renders.

use crate::condition::{Condition, parse_condition};
use crate::model::{
    ForEach, Group, LayoutNode, Lane, MessageSpec, Payload, PlanNode, SlotRef, SortOrder,
    Template,
};
use crate::text::{SourceRef, TextTemplate};
use crate::CompileError;
use promptloom_core::Role;
use regex_lite::Regex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Content of a compiled message leaf.
#[derive(Debug, Clone)]
pub enum Content {
    Literal(TextTemplate),
    Source(SourceRef),
}

#[derive(Debug, Clone)]
pub struct CompiledMessage {
    pub role: Role,
    pub content: Content,
    pub prefix: bool,
    pub budget: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum CompiledLayoutNode {
    Message(CompiledMessage),
    Slot(CompiledSlotRef),
    Anchor(TextTemplate),
}

#[derive(Debug, Clone)]
pub struct CompiledSlotRef {
    pub name: String,
    pub header: Vec<CompiledMessage>,
    pub footer: Vec<CompiledMessage>,
    pub omit_if_empty: bool,
}

#[derive(Debug, Clone)]
pub struct CompiledSlot {
    pub name: String,
    pub priority: i32,
    pub budget: Option<usize>,
    pub plan: Vec<CompiledPlanNode>,
}

#[derive(Debug, Clone)]
pub enum CompiledPlanNode {
    Message(CompiledMessage),
    ForEach(CompiledForEach),
    If(CompiledIf),
    Anchor(TextTemplate),
}

#[derive(Debug, Clone)]
pub struct CompiledForEach {
    pub source: SourceRef,
    pub order: Option<SortOrder>,
    pub limit: Option<usize>,
    pub separator: Option<TextTemplate>,
    pub budget: Option<usize>,
    pub stop_when_out_of_budget: bool,
    pub item_as: String,
    pub index_as: String,
    pub plan: Vec<CompiledPlanNode>,
}

#[derive(Debug, Clone)]
pub struct CompiledIf {
    pub condition: Condition,
    pub then: Vec<CompiledPlanNode>,
    pub otherwise: Vec<CompiledPlanNode>,
}

#[derive(Debug, Clone)]
pub struct CompiledLane {
    pub id: String,
    pub order: i32,
    pub enabled: bool,
    pub role: Option<Role>,
    pub template: Option<TextTemplate>,
    pub payload: Payload,
    pub budget: Option<usize>,
    pub reserve_tokens: Option<usize>,
    pub groups: Vec<CompiledGroup>,
}

#[derive(Debug, Clone)]
pub struct CompiledGroup {
    pub id: Option<String>,
    pub pattern: Option<Regex>,
    pub open: Option<TextTemplate>,
    pub close: Option<TextTemplate>,
    pub role: Option<Role>,
    pub payload: Payload,
}

impl CompiledGroup {
    /// The catch-all group: no id and no pattern.
    pub fn is_default(&self) -> bool {
        self.id.is_none() && self.pattern.is_none()
    }
}

/// Non-fatal findings from compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lint {
    /// A slot is declared but never referenced by the layout.
    UnreferencedSlot { slot: String },
}

impl std::fmt::Display for Lint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lint::UnreferencedSlot { slot } => {
                write!(f, "slot '{slot}' is declared but never referenced by the layout")
            }
        }
    }
}

/// The executable form of a [`Template`].
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    pub id: String,
    pub task: String,
    pub version: u32,
    pub layout: Vec<CompiledLayoutNode>,
    pub slots: BTreeMap<String, CompiledSlot>,
    pub lanes: Vec<CompiledLane>,
    lints: Vec<Lint>,
}

impl CompiledTemplate {
    /// Lints collected during compilation.
    pub fn lints(&self) -> &[Lint] {
        &self.lints
    }

    pub fn slot(&self, name: &str) -> Option<&CompiledSlot> {
        self.slots.get(name)
    }

    /// Slots in consumer order: ascending priority, then name.
    pub fn slots_by_priority(&self) -> Vec<&CompiledSlot> {
        let mut slots: Vec<&CompiledSlot> = self.slots.values().collect();
        slots.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        slots
    }
}

impl Template {
    /// Compile this template. See [`compile`].
    pub fn compile(&self) -> Result<CompiledTemplate, CompileError> {
        compile(self)
    }
}

/// Validate and lower a template.
///
/// Fails when a message node declares both literal content and a data
/// reference (or neither), when the layout references an undeclared slot,
/// or when any text template, condition or group pattern fails to parse.
/// Declared slots never referenced by the layout are reported as lints.
pub fn compile(template: &Template) -> Result<CompiledTemplate, CompileError> {
    if template.id.trim().is_empty() {
        return Err(CompileError::InvalidTemplate {
            reason: "template id cannot be empty".into(),
        });
    }

    let mut referenced = BTreeSet::new();
    let mut layout = Vec::with_capacity(template.layout.len());
    for (i, node) in template.layout.iter().enumerate() {
        let path = format!("layout[{i}]");
        layout.push(match node {
            LayoutNode::Message(spec) => CompiledLayoutNode::Message(compile_message(spec, &path)?),
            LayoutNode::Slot(slot_ref) => {
                if !template.slots.contains_key(&slot_ref.name) {
                    return Err(CompileError::UnknownSlot {
                        slot: slot_ref.name.clone(),
                    });
                }
                referenced.insert(slot_ref.name.clone());
                CompiledLayoutNode::Slot(compile_slot_ref(slot_ref, &path)?)
            }
            LayoutNode::Anchor(anchor) => {
                CompiledLayoutNode::Anchor(compile_text(&anchor.key, &format!("{path}.key"))?)
            }
        });
    }

    let mut slots = BTreeMap::new();
    for (name, slot) in &template.slots {
        let path = format!("slots.{name}");
        slots.insert(
            name.clone(),
            CompiledSlot {
                name: name.clone(),
                priority: slot.priority,
                budget: slot.budget,
                plan: compile_plan(&slot.plan, &format!("{path}.plan"))?,
            },
        );
    }

    let lints: Vec<Lint> = template
        .slots
        .keys()
        .filter(|name| !referenced.contains(*name))
        .map(|name| Lint::UnreferencedSlot { slot: name.clone() })
        .collect();
    for lint in &lints {
        warn!(template = %template.id, "{lint}");
    }

    let mut lane_ids = BTreeSet::new();
    let mut lanes = Vec::with_capacity(template.lanes.len());
    for lane in &template.lanes {
        if !lane_ids.insert(lane.id.as_str()) {
            return Err(CompileError::InvalidTemplate {
                reason: format!("duplicate lane id '{}'", lane.id),
            });
        }
        lanes.push(compile_lane(lane)?);
    }

    info!(
        template = %template.id,
        slots = slots.len(),
        lanes = lanes.len(),
        lints = lints.len(),
        "Template compiled"
    );

    Ok(CompiledTemplate {
        id: template.id.clone(),
        task: template.task.clone(),
        version: template.version,
        layout,
        slots,
        lanes,
        lints,
    })
}

/// Compile a lane definition on its own.
///
/// Used for lanes supplied by the caller at render time.
pub fn compile_lane(lane: &Lane) -> Result<CompiledLane, CompileError> {
    if lane.id.trim().is_empty() {
        return Err(CompileError::InvalidTemplate {
            reason: "lane id cannot be empty".into(),
        });
    }
    let path = format!("lanes.{}", lane.id);
    let template = lane
        .template
        .as_deref()
        .map(|t| compile_text(t, &format!("{path}.template")))
        .transpose()?;

    let mut groups = Vec::with_capacity(lane.groups.len());
    for (i, group) in lane.groups.iter().enumerate() {
        groups.push(compile_group(group, &lane.id, &format!("{path}.groups[{i}]"))?);
    }

    Ok(CompiledLane {
        id: lane.id.clone(),
        order: lane.order,
        enabled: lane.enabled,
        role: lane.role,
        template,
        payload: lane.payload.clone(),
        budget: lane.budget,
        reserve_tokens: lane.reserve_tokens,
        groups,
    })
}

fn compile_group(group: &Group, lane_id: &str, path: &str) -> Result<CompiledGroup, CompileError> {
    let pattern = group
        .pattern
        .as_deref()
        .map(|p| {
            Regex::new(p).map_err(|e| CompileError::InvalidPattern {
                lane: lane_id.to_string(),
                pattern: p.to_string(),
                detail: e.to_string(),
            })
        })
        .transpose()?;

    Ok(CompiledGroup {
        id: group.id.clone(),
        pattern,
        open: group
            .open
            .as_deref()
            .map(|t| compile_text(t, &format!("{path}.open")))
            .transpose()?,
        close: group
            .close
            .as_deref()
            .map(|t| compile_text(t, &format!("{path}.close")))
            .transpose()?,
        role: group.role,
        payload: group.payload.clone(),
    })
}

fn compile_slot_ref(slot_ref: &SlotRef, path: &str) -> Result<CompiledSlotRef, CompileError> {
    let header = slot_ref
        .header
        .iter()
        .enumerate()
        .map(|(i, m)| compile_message(m, &format!("{path}.header[{i}]")))
        .collect::<Result<Vec<_>, _>>()?;
    let footer = slot_ref
        .footer
        .iter()
        .enumerate()
        .map(|(i, m)| compile_message(m, &format!("{path}.footer[{i}]")))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompiledSlotRef {
        name: slot_ref.name.clone(),
        header,
        footer,
        omit_if_empty: slot_ref.omit_if_empty,
    })
}

fn compile_message(spec: &MessageSpec, path: &str) -> Result<CompiledMessage, CompileError> {
    let content = match (&spec.content, &spec.source) {
        (Some(_), Some(_)) => {
            return Err(CompileError::ConflictingContent {
                node: path.to_string(),
            });
        }
        (Some(text), None) => Content::Literal(compile_text(text, path)?),
        (None, Some(source)) => Content::Source(source.clone()),
        (None, None) => {
            return Err(CompileError::MissingContent {
                node: path.to_string(),
            });
        }
    };

    Ok(CompiledMessage {
        role: spec.role,
        content,
        prefix: spec.prefix,
        budget: spec.budget,
    })
}

fn compile_plan(nodes: &[PlanNode], path: &str) -> Result<Vec<CompiledPlanNode>, CompileError> {
    nodes
        .iter()
        .enumerate()
        .map(|(i, node)| compile_plan_node(node, &format!("{path}[{i}]")))
        .collect()
}

fn compile_plan_node(node: &PlanNode, path: &str) -> Result<CompiledPlanNode, CompileError> {
    Ok(match node {
        PlanNode::Message(spec) => CompiledPlanNode::Message(compile_message(spec, path)?),
        PlanNode::ForEach(each) => CompiledPlanNode::ForEach(compile_for_each(each, path)?),
        PlanNode::If(node) => {
            let condition =
                parse_condition(&node.condition).map_err(|detail| CompileError::InvalidCondition {
                    node: path.to_string(),
                    detail,
                })?;
            CompiledPlanNode::If(CompiledIf {
                condition,
                then: compile_plan(&node.then, &format!("{path}.then"))?,
                otherwise: compile_plan(&node.otherwise, &format!("{path}.else"))?,
            })
        }
        PlanNode::Anchor(anchor) => {
            CompiledPlanNode::Anchor(compile_text(&anchor.key, &format!("{path}.key"))?)
        }
    })
}

fn compile_for_each(each: &ForEach, path: &str) -> Result<CompiledForEach, CompileError> {
    if each.item_as.is_empty() || each.index_as.is_empty() || each.item_as == each.index_as {
        return Err(CompileError::InvalidTemplate {
            reason: format!("{path}: loop bindings must be distinct non-empty names"),
        });
    }
    Ok(CompiledForEach {
        source: each.source.clone(),
        order: each.order,
        limit: each.limit,
        separator: each
            .separator
            .as_deref()
            .map(|s| compile_text(s, &format!("{path}.separator")))
            .transpose()?,
        budget: each.budget,
        stop_when_out_of_budget: each.stop_when_out_of_budget,
        item_as: each.item_as.clone(),
        index_as: each.index_as.clone(),
        plan: compile_plan(&each.plan, &format!("{path}.plan"))?,
    })
}

fn compile_text(text: &str, path: &str) -> Result<TextTemplate, CompileError> {
    TextTemplate::parse(text).map_err(|detail| CompileError::InvalidText {
        node: path.to_string(),
        detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnchorSpec, IfNode, Slot};

    fn base_template() -> Template {
        Template::from_toml(
            r#"
id = "chat"

[[layout]]
kind = "message"
role = "system"
content = "You are {{persona.name}}."

[[layout]]
kind = "slot"
name = "history"

[[layout.header]]
role = "system"
content = "[History]"

[slots.history]
[[slots.history.plan]]
kind = "message"
role = "user"
source = "last_message"
"#,
        )
        .unwrap()
    }

    #[test]
    fn compiles_valid_template() {
        let compiled = compile(&base_template()).unwrap();
        assert_eq!(compiled.id, "chat");
        assert_eq!(compiled.layout.len(), 2);
        assert!(compiled.lints().is_empty());
        match &compiled.layout[0] {
            CompiledLayoutNode::Message(m) => match &m.content {
                Content::Literal(t) => assert_eq!(t.raw(), "You are {{persona.name}}."),
                Content::Source(_) => panic!("expected literal"),
            },
            other => panic!("unexpected node {other:?}"),
        }
        match &compiled.layout[1] {
            CompiledLayoutNode::Slot(s) => assert_eq!(s.header.len(), 1),
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn undeclared_slot_is_an_error_naming_the_slot() {
        let mut template = base_template();
        template.layout.push(LayoutNode::Slot(SlotRef {
            name: "lorebook".into(),
            header: vec![],
            footer: vec![],
            omit_if_empty: true,
        }));
        let err = compile(&template).unwrap_err();
        assert!(matches!(&err, CompileError::UnknownSlot { slot } if slot == "lorebook"));
        assert!(err.to_string().contains("lorebook"));
    }

    #[test]
    fn layout_message_with_content_and_source_rejects() {
        let mut template = base_template();
        template.layout.push(LayoutNode::Message(MessageSpec {
            role: Role::User,
            content: Some("literal".into()),
            source: Some(SourceRef::named("data")),
            ..MessageSpec::default()
        }));
        let err = compile(&template).unwrap_err();
        assert!(matches!(&err, CompileError::ConflictingContent { node } if node == "layout[2]"));
        assert!(err.to_string().contains("both literal content and a data reference"));
    }

    #[test]
    fn slot_header_with_content_and_source_rejects() {
        let mut template = base_template();
        if let LayoutNode::Slot(slot_ref) = &mut template.layout[1] {
            slot_ref.footer.push(MessageSpec {
                content: Some("x".into()),
                source: Some(SourceRef::named("y")),
                ..MessageSpec::default()
            });
        }
        let err = compile(&template).unwrap_err();
        assert!(
            matches!(&err, CompileError::ConflictingContent { node } if node == "layout[1].footer[0]")
        );
    }

    #[test]
    fn message_without_content_rejects() {
        let mut template = base_template();
        template
            .layout
            .push(LayoutNode::Message(MessageSpec::default()));
        assert!(matches!(
            compile(&template),
            Err(CompileError::MissingContent { .. })
        ));
    }

    #[test]
    fn unreferenced_slot_is_a_lint() {
        let mut template = base_template();
        template.slots.insert("orphan".into(), Slot::default());
        let compiled = compile(&template).unwrap();
        assert_eq!(
            compiled.lints(),
            &[Lint::UnreferencedSlot {
                slot: "orphan".into()
            }]
        );
    }

    #[test]
    fn invalid_condition_names_node() {
        let mut template = base_template();
        template.slots.get_mut("history").unwrap().plan.push(PlanNode::If(IfNode {
            condition: "a ==".into(),
            then: vec![],
            otherwise: vec![],
        }));
        let err = compile(&template).unwrap_err();
        assert!(
            matches!(&err, CompileError::InvalidCondition { node, .. } if node == "slots.history.plan[1]")
        );
    }

    #[test]
    fn invalid_anchor_text_rejects() {
        let mut template = base_template();
        template.layout.push(LayoutNode::Anchor(AnchorSpec {
            key: "turn_{{index".into(),
        }));
        assert!(matches!(
            compile(&template),
            Err(CompileError::InvalidText { .. })
        ));
    }

    #[test]
    fn invalid_group_pattern_rejects() {
        let mut template = base_template();
        let mut lane = Lane::new("lore");
        lane.groups.push(Group {
            pattern: Some("(".into()),
            ..Group::default()
        });
        template.lanes.push(lane);
        assert!(matches!(
            compile(&template),
            Err(CompileError::InvalidPattern { lane, .. }) if lane == "lore"
        ));
    }

    #[test]
    fn duplicate_lane_ids_reject() {
        let mut template = base_template();
        template.lanes.push(Lane::new("lore"));
        template.lanes.push(Lane::new("lore"));
        assert!(compile(&template).is_err());
    }

    #[test]
    fn slots_by_priority_orders_with_name_tiebreak() {
        let mut template = base_template();
        template.slots.get_mut("history").unwrap().priority = 5;
        template.slots.insert("b".into(), Slot { priority: 1, ..Slot::default() });
        template.slots.insert("a".into(), Slot { priority: 1, ..Slot::default() });
        let compiled = compile(&template).unwrap();
        let names: Vec<&str> = compiled
            .slots_by_priority()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "history"]);
    }

    #[test]
    fn default_group_detection() {
        let compiled = compile_lane(&Lane {
            groups: vec![
                Group::default(),
                Group {
                    id: Some("x".into()),
                    ..Group::default()
                },
            ],
            ..Lane::new("l")
        })
        .unwrap();
        assert!(compiled.groups[0].is_default());
        assert!(!compiled.groups[1].is_default());
    }
}
