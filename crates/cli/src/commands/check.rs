//! `promptloom check`: compile a template and summarise it.

use promptloom_config::AppConfig;
use promptloom_template::CompiledLayoutNode;
use std::path::Path;

pub fn run(path: &Path, config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let compiled = match super::load_compiled(path, config) {
        Ok(compiled) => compiled,
        Err(e) => {
            println!("❌ {}: {e}", path.display());
            return Err(e);
        }
    };

    println!(
        "✅ Template '{}' compiled (task: {}, version {})",
        compiled.id,
        if compiled.task.is_empty() { "-" } else { &compiled.task },
        compiled.version
    );

    println!("\n   Layout:");
    for (i, node) in compiled.layout.iter().enumerate() {
        let line = match node {
            CompiledLayoutNode::Message(m) => format!("message ({})", m.role),
            CompiledLayoutNode::Slot(s) => format!(
                "slot '{}' (header {}, footer {})",
                s.name,
                s.header.len(),
                s.footer.len()
            ),
            CompiledLayoutNode::Anchor(key) => format!("anchor '{}'", key.raw()),
        };
        println!("   {i:>3}. {line}");
    }

    if !compiled.slots.is_empty() {
        println!("\n   Slots:");
        for slot in compiled.slots_by_priority() {
            let budget = slot
                .budget
                .map_or_else(|| "shared".to_string(), |b| format!("{b} tokens"));
            println!(
                "   - {} (priority {}, budget {}, {} plan nodes)",
                slot.name,
                slot.priority,
                budget,
                slot.plan.len()
            );
        }
    }

    if !compiled.lanes.is_empty() {
        println!("\n   Lanes:");
        for lane in &compiled.lanes {
            let status = if lane.enabled { "ON " } else { "OFF" };
            println!(
                "   - [{status}] {} (order {}, reserve {}, {} groups)",
                lane.id,
                lane.order,
                lane.reserve_tokens.unwrap_or(0),
                lane.groups.len()
            );
        }
    }

    if !compiled.lints().is_empty() {
        println!();
        for lint in compiled.lints() {
            println!("   ⚠️  {lint}");
        }
    }
    Ok(())
}
