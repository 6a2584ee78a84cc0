//! Plan executor: walks compiled plan nodes against the registry scope and
//! the budget, producing a slot's messages and slot-relative anchors.

use crate::RenderError;
use crate::budget::BudgetManager;
use crate::registry::{ScopeLookup, Sources, with_additional_frame};
use crate::report::{OmissionReason, Omissions, Stage};
use promptloom_core::ChatMessage;
use promptloom_core::value::value_to_text;
use promptloom_template::{
    CompiledForEach, CompiledIf, CompiledMessage, CompiledPlanNode, Content, SortOrder,
    TextTemplate, ValueLookup,
};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Output of a plan: messages plus anchors recorded relative to them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub messages: Vec<ChatMessage>,
    pub anchors: Vec<(String, usize)>,
}

impl Fragment {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append `other`, rebasing its anchors onto the current tail.
    pub fn append(&mut self, other: Fragment) {
        let base = self.messages.len();
        self.anchors
            .extend(other.anchors.into_iter().map(|(key, at)| (key, base + at)));
        self.messages.extend(other.messages);
    }
}

pub(crate) struct Executor<'a, C> {
    ctx: &'a C,
    omissions: &'a mut Omissions,
}

impl<'a, C> Executor<'a, C> {
    pub(crate) fn new(ctx: &'a C, omissions: &'a mut Omissions) -> Self {
        Self { ctx, omissions }
    }

    pub(crate) fn omissions(&mut self) -> &mut Omissions {
        self.omissions
    }

    pub(crate) fn execute_plan(
        &mut self,
        nodes: &[CompiledPlanNode],
        sources: &dyn Sources<C>,
        budget: &mut BudgetManager,
        out: &mut Fragment,
    ) -> Result<(), RenderError> {
        for node in nodes {
            self.execute_node(node, sources, budget, out)?;
        }
        Ok(())
    }

    pub(crate) fn execute_node(
        &mut self,
        node: &CompiledPlanNode,
        sources: &dyn Sources<C>,
        budget: &mut BudgetManager,
        out: &mut Fragment,
    ) -> Result<(), RenderError> {
        match node {
            CompiledPlanNode::Message(message) => {
                if let Some(m) = self.render_message(Stage::Plan, message, sources, budget)? {
                    out.messages.push(m);
                }
            }
            CompiledPlanNode::ForEach(each) => self.execute_for_each(each, sources, budget, out)?,
            CompiledPlanNode::If(branch) => self.execute_if(branch, sources, budget, out)?,
            CompiledPlanNode::Anchor(key) => {
                let key = self.render_text(key, sources)?;
                out.anchors.push((key, out.messages.len()));
            }
        }
        Ok(())
    }

    /// Resolve and budget-check one message leaf. All or nothing.
    pub(crate) fn render_message(
        &mut self,
        stage: Stage,
        message: &CompiledMessage,
        sources: &dyn Sources<C>,
        budget: &mut BudgetManager,
    ) -> Result<Option<ChatMessage>, RenderError> {
        let Some(rendered) = self.resolve_message(stage, message, sources)? else {
            return Ok(None);
        };

        let mut scoped = budget.scope(message.budget);
        if !scoped.can_fit_token_estimate(&rendered.content) {
            self.omissions.record(
                stage,
                OmissionReason::OverBudget,
                format!(
                    "{} message needs {} tokens, {} available",
                    message.role,
                    scoped.estimate_tokens(&rendered.content),
                    scoped.available()
                ),
            );
            return Ok(None);
        }
        scoped.consume(&rendered.content);
        Ok(Some(rendered))
    }

    /// Resolve a message leaf without touching the budget. Null data is
    /// recorded and yields `None`.
    pub(crate) fn resolve_message(
        &mut self,
        stage: Stage,
        message: &CompiledMessage,
        sources: &dyn Sources<C>,
    ) -> Result<Option<ChatMessage>, RenderError> {
        let text = match &message.content {
            Content::Literal(template) => self.render_text(template, sources)?,
            Content::Source(reference) => {
                let resolved = ScopeLookup::new(sources, self.ctx).lookup(reference)?;
                match resolved.as_ref().and_then(value_to_text) {
                    Some(text) => text,
                    None => {
                        self.omissions
                            .record(stage, OmissionReason::NullData, reference.dotted());
                        return Ok(None);
                    }
                }
            }
        };
        Ok(Some(
            ChatMessage::new(message.role, text).with_prefix(message.prefix),
        ))
    }

    pub(crate) fn render_text(
        &self,
        template: &TextTemplate,
        sources: &dyn Sources<C>,
    ) -> Result<String, RenderError> {
        Ok(template.render(&ScopeLookup::new(sources, self.ctx))?)
    }

    fn execute_for_each(
        &mut self,
        each: &CompiledForEach,
        sources: &dyn Sources<C>,
        budget: &mut BudgetManager,
        out: &mut Fragment,
    ) -> Result<(), RenderError> {
        let items = match ScopeLookup::new(sources, self.ctx).lookup(&each.source)? {
            Some(Value::Array(items)) => items,
            None | Some(Value::Null) => {
                self.omissions
                    .record(Stage::Plan, OmissionReason::NullData, each.source.dotted());
                return Ok(());
            }
            Some(_) => {
                self.omissions
                    .record(Stage::Plan, OmissionReason::NotAnArray, each.source.dotted());
                return Ok(());
            }
        };

        let mut items = order_items(items, each.order);
        if let Some(limit) = each.limit {
            items.truncate(limit);
        }
        let total = items.len();

        let mut scoped = budget.scope(each.budget);
        let mut rendered_any = false;
        for (index, item) in items.into_iter().enumerate() {
            if each.stop_when_out_of_budget && !scoped.has_any() {
                self.omissions.record(
                    Stage::Plan,
                    OmissionReason::LoopStopped,
                    format!("{}: {} of {total} items skipped", each.source, total - index),
                );
                break;
            }

            let mut bindings = BTreeMap::new();
            bindings.insert(each.item_as.clone(), item);
            bindings.insert(each.index_as.clone(), Value::from(index));
            let frame = with_additional_frame(sources, bindings);
            let mut body = Fragment::default();
            self.execute_plan(&each.plan, &frame, &mut scoped, &mut body)?;

            // Separators only sit between two rendered items.
            if rendered_any
                && !body.is_empty()
                && let Some(separator) = &each.separator
            {
                let text = self.render_text(separator, sources)?;
                if scoped.can_fit_token_estimate(&text) {
                    scoped.consume(&text);
                    out.messages.push(ChatMessage::user(text));
                } else {
                    self.omissions.record(
                        Stage::Plan,
                        OmissionReason::OverBudget,
                        format!("{} separator", each.source),
                    );
                }
            }
            rendered_any |= !body.is_empty();
            out.append(body);
        }
        Ok(())
    }

    fn execute_if(
        &mut self,
        branch: &CompiledIf,
        sources: &dyn Sources<C>,
        budget: &mut BudgetManager,
        out: &mut Fragment,
    ) -> Result<(), RenderError> {
        let taken = branch
            .condition
            .evaluate(&ScopeLookup::new(sources, self.ctx))?;
        let nodes = if taken { &branch.then } else { &branch.otherwise };
        self.execute_plan(nodes, sources, budget, out)
    }
}

/// `asc`/`desc` sort all-number or all-string arrays; anything else keeps
/// its order.
fn order_items(mut items: Vec<Value>, order: Option<SortOrder>) -> Vec<Value> {
    let Some(order) = order else {
        return items;
    };
    let compare: fn(&Value, &Value) -> Ordering = if items.iter().all(Value::is_number) {
        |a, b| {
            let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            a.total_cmp(&b)
        }
    } else if items.iter().all(Value::is_string) {
        |a, b| a.as_str().cmp(&b.as_str())
    } else {
        return items;
    };

    match order {
        SortOrder::Asc => items.sort_by(compare),
        SortOrder::Desc => items.sort_by(|a, b| compare(b, a)),
    }
    items
}
