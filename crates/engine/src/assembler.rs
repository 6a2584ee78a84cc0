//! Layout assembler: walks the top-level layout and builds the message list
//! and anchor map that the injection pass works on.

use crate::RenderError;
use crate::anchors::AnchorMap;
use crate::budget::BudgetManager;
use crate::executor::{Executor, Fragment};
use crate::registry::Sources;
use crate::report::{OmissionReason, Stage};
use promptloom_core::ChatMessage;
use promptloom_template::{CompileError, CompiledLayoutNode, CompiledSlotRef, CompiledTemplate};
use tracing::debug;

#[derive(Debug, Default)]
pub(crate) struct Assembled {
    pub messages: Vec<ChatMessage>,
    pub anchors: AnchorMap,
}

pub(crate) fn assemble<C>(
    template: &CompiledTemplate,
    exec: &mut Executor<'_, C>,
    sources: &dyn Sources<C>,
    budget: &mut BudgetManager,
) -> Result<Assembled, RenderError> {
    let mut out = Assembled::default();

    for node in &template.layout {
        match node {
            CompiledLayoutNode::Message(message) => {
                if let Some(m) = exec.render_message(Stage::Layout, message, sources, budget)? {
                    out.messages.push(m);
                }
            }
            CompiledLayoutNode::Slot(slot_ref) => {
                assemble_slot(template, slot_ref, exec, sources, budget, &mut out)?;
            }
            CompiledLayoutNode::Anchor(key) => {
                let key = exec.render_text(key, sources)?;
                out.anchors.record(key, out.messages.len());
            }
        }
    }
    Ok(out)
}

fn assemble_slot<C>(
    template: &CompiledTemplate,
    slot_ref: &CompiledSlotRef,
    exec: &mut Executor<'_, C>,
    sources: &dyn Sources<C>,
    budget: &mut BudgetManager,
    out: &mut Assembled,
) -> Result<(), RenderError> {
    let slot = template
        .slot(&slot_ref.name)
        .ok_or_else(|| CompileError::UnknownSlot {
            slot: slot_ref.name.clone(),
        })?;

    let mut body = Fragment::default();
    {
        let mut scoped = budget.scope(slot.budget);
        exec.execute_plan(&slot.plan, sources, &mut scoped, &mut body)?;
    }

    let wrap = !body.is_empty() || !slot_ref.omit_if_empty;
    let (header, footer) = if wrap {
        wrappers(slot_ref, exec, sources, budget)?
    } else {
        (Vec::new(), Vec::new())
    };

    debug!(
        slot = %slot.name,
        messages = body.messages.len(),
        header = header.len(),
        footer = footer.len(),
        "Slot rendered"
    );

    out.messages.extend(header);
    let base = out.messages.len();
    for (key, offset) in body.anchors {
        out.anchors.record(key, base + offset);
    }
    out.messages.extend(body.messages);
    out.messages.extend(footer);
    Ok(())
}

/// Header and footer go in together or not at all.
fn wrappers<C>(
    slot_ref: &CompiledSlotRef,
    exec: &mut Executor<'_, C>,
    sources: &dyn Sources<C>,
    budget: &mut BudgetManager,
) -> Result<(Vec<ChatMessage>, Vec<ChatMessage>), RenderError> {
    let mut resolved = Vec::new();
    for (is_header, message) in slot_ref
        .header
        .iter()
        .map(|m| (true, m))
        .chain(slot_ref.footer.iter().map(|m| (false, m)))
    {
        if let Some(rendered) = exec.resolve_message(Stage::Slot, message, sources)? {
            resolved.push((is_header, message.budget, rendered));
        }
    }
    if resolved.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let within_own = resolved.iter().all(|(_, own, m)| {
        own.is_none_or(|limit| limit > 0 && budget.estimate_tokens(&m.content) <= limit)
    });
    if !within_own || !budget.can_fit_all(resolved.iter().map(|(_, _, m)| m.content.as_str())) {
        exec.omissions().record(
            Stage::Slot,
            OmissionReason::OverBudget,
            format!("slot '{}' header and footer", slot_ref.name),
        );
        return Ok((Vec::new(), Vec::new()));
    }

    let (mut header, mut footer) = (Vec::new(), Vec::new());
    for (is_header, _, message) in resolved {
        budget.consume(&message.content);
        if is_header {
            header.push(message);
        } else {
            footer.push(message);
        }
    }
    Ok((header, footer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SourceRegistry;
    use crate::report::Omissions;
    use promptloom_template::{Template, compile};
    use serde_json::{Value, json};

    fn assemble_toml(toml: &str, ctx: &Value, max_tokens: usize) -> Assembled {
        let compiled = compile(&Template::from_toml(toml).unwrap()).unwrap();
        let registry = SourceRegistry::from_context_keys(ctx);
        let mut budget = BudgetManager::new(max_tokens);
        let mut omissions = Omissions::default();
        let mut exec = Executor::new(ctx, &mut omissions);
        assemble(&compiled, &mut exec, &registry, &mut budget).unwrap()
    }

    fn texts(a: &Assembled) -> Vec<&str> {
        a.messages.iter().map(|m| m.content.as_str()).collect()
    }

    const CHAT: &str = r#"
id = "chat"

[[layout]]
kind = "message"
role = "system"
content = "sys"

[[layout]]
kind = "anchor"
key = "after_system"

[[layout]]
kind = "slot"
name = "history"

[[layout.header]]
role = "system"
content = "[start]"

[[layout.footer]]
role = "system"
content = "[end]"

[[layout]]
kind = "anchor"
key = "end"

[slots.history]
[[slots.history.plan]]
kind = "for_each"
source = "turns"

[[slots.history.plan.plan]]
kind = "anchor"
key = "turn_{{index}}"

[[slots.history.plan.plan]]
kind = "message"
role = "user"
content = "{{item}}"
"#;

    #[test]
    fn layout_with_wrapped_slot_and_anchors() {
        let out = assemble_toml(CHAT, &json!({"turns": ["a", "b"]}), 100);
        assert_eq!(texts(&out), vec!["sys", "[start]", "a", "b", "[end]"]);
        assert_eq!(out.anchors.get("after_system"), &[1]);
        assert_eq!(out.anchors.get("turn_0"), &[2]);
        assert_eq!(out.anchors.get("turn_1"), &[3]);
        assert_eq!(out.anchors.get("end"), &[5]);
    }

    #[test]
    fn empty_slot_omits_wrappers() {
        let out = assemble_toml(CHAT, &json!({"turns": []}), 100);
        assert_eq!(texts(&out), vec!["sys"]);
        assert_eq!(out.anchors.get("end"), &[1]);
    }

    #[test]
    fn empty_slot_keeps_wrappers_when_asked() {
        let toml = CHAT.replace(
            "[[layout.header]]",
            "omit_if_empty = false\n\n[[layout.header]]",
        );
        let out = assemble_toml(&toml, &json!({"turns": []}), 100);
        assert_eq!(texts(&out), vec!["sys", "[start]", "[end]"]);
    }

    #[test]
    fn slot_budget_bounds_the_plan() {
        let toml = CHAT.replace("[slots.history]", "[slots.history]\nbudget = 1");
        let out = assemble_toml(&toml, &json!({"turns": ["abcd", "efgh"]}), 100);
        assert_eq!(texts(&out), vec!["sys", "[start]", "abcd", "[end]"]);
    }

    #[test]
    fn footer_not_emitted_without_its_header() {
        let long_header = format!("content = \"[start {}]\"", "h".repeat(32));
        let toml = CHAT.replace("content = \"[start]\"", &long_header);
        let out = assemble_toml(&toml, &json!({"turns": ["a"]}), 6);
        assert_eq!(texts(&out), vec!["sys", "a"]);
        assert_eq!(out.anchors.get("turn_0"), &[1]);
        assert_eq!(out.anchors.get("end"), &[2]);
    }

    #[test]
    fn header_and_footer_fit_together_or_not_at_all() {
        // "[start]" and "[end]" cost 2 tokens each; 3 remain after the body.
        let out = assemble_toml(CHAT, &json!({"turns": ["a"]}), 5);
        assert_eq!(texts(&out), vec!["sys", "a"]);

        let out = assemble_toml(CHAT, &json!({"turns": ["a"]}), 6);
        assert_eq!(texts(&out), vec!["sys", "[start]", "a", "[end]"]);
    }

    #[test]
    fn layout_messages_are_budget_gated() {
        let out = assemble_toml(CHAT, &json!({"turns": []}), 0);
        assert!(out.messages.is_empty());
        assert_eq!(out.anchors.get("end"), &[0]);
    }
}
