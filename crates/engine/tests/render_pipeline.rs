//! End-to-end render tests: template source text in, message list out.

use promptloom_config::BudgetConfig;
use promptloom_core::{ChatMessage, Role};
use promptloom_engine::{
    OmissionReason, RenderError, RenderOptions, SourceRegistry, render, render_with_report,
};
use promptloom_template::{CompileError, Injection, TargetSpec, Template, compile};
use serde_json::{Value, json};
use std::sync::Arc;

fn compile_toml(toml: &str) -> Result<promptloom_template::CompiledTemplate, CompileError> {
    compile(&Template::from_toml(toml)?)
}

fn texts(messages: &[ChatMessage]) -> Vec<&str> {
    messages.iter().map(|m| m.content.as_str()).collect()
}

const HISTORY: &str = r#"
id = "history"
task = "chat"

[[layout]]
kind = "message"
role = "system"
content = "sys"

[[layout]]
kind = "slot"
name = "history"

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

[[lanes]]
id = "lore"
"#;

// ── Compilation ───────────────────────────────────────────────────────────

#[test]
fn undeclared_slot_fails_naming_the_slot() {
    let err = compile_toml(
        r#"
id = "t"

[[layout]]
kind = "slot"
name = "memories"
"#,
    )
    .unwrap_err();
    assert!(matches!(&err, CompileError::UnknownSlot { slot } if slot == "memories"));
    assert!(err.to_string().contains("memories"));
}

#[test]
fn content_and_source_together_fail() {
    let layout = compile_toml(
        r#"
id = "t"

[[layout]]
kind = "message"
content = "hello"
source = "greeting"
"#,
    )
    .unwrap_err();
    assert!(matches!(layout, CompileError::ConflictingContent { .. }));

    let header = compile_toml(
        r#"
id = "t"

[[layout]]
kind = "slot"
name = "s"

[[layout.header]]
content = "hello"
source = "greeting"

[slots.s]
"#,
    )
    .unwrap_err();
    assert!(matches!(&header, CompileError::ConflictingContent { node } if node.contains("header")));
    assert!(
        header
            .to_string()
            .contains("both literal content and a data reference")
    );
}

// ── Budget ───────────────────────────────────────────────────────────────

#[test]
fn loop_renders_two_of_three_items_under_five_tokens() {
    let template = compile_toml(
        r#"
id = "t"

[[layout]]
kind = "slot"
name = "items"

[slots.items]
[[slots.items.plan]]
kind = "for_each"
source = "items"
stop_when_out_of_budget = true

[[slots.items.plan.plan]]
kind = "message"
role = "user"
content = "{{item}}"
"#,
    )
    .unwrap();
    // 8 chars = 2 tokens each
    let ctx = json!({"items": ["aaaaaaaa", "bbbbbbbb", "cccccccc"]});
    let registry = SourceRegistry::from_context_keys(&ctx);
    let messages = render(
        &template,
        &ctx,
        &BudgetConfig::with_max_tokens(5),
        &registry,
        &RenderOptions::default(),
    )
    .unwrap();
    assert_eq!(texts(&messages), vec!["aaaaaaaa", "bbbbbbbb"]);
    assert!(!messages.iter().any(|m| m.content.contains('c')));
}

#[test]
fn released_floor_lets_later_lane_fit() {
    let template = compile_toml(
        r#"
id = "t"

[[layout]]
kind = "message"
role = "system"
content = "{{intro}}"

[[layout]]
kind = "anchor"
key = "end"

[[lanes]]
id = "reserved"
order = 0
reserve_tokens = 160

[[lanes]]
id = "later"
order = 1
"#,
    )
    .unwrap();
    // 40 tokens of layout text
    let ctx = json!({"intro": "i".repeat(160)});
    let registry = SourceRegistry::from_context_keys(&ctx);
    let options = RenderOptions::default().with_injections(vec![
        // 40 tokens from the 160 reserved
        Injection::new("reserved", TargetSpec::at("end")).with_content("r".repeat(160)),
        // 120 tokens: only fits if the unused 120 came back
        Injection::new("later", TargetSpec::bottom()).with_content("l".repeat(480)),
    ]);

    let output = render_with_report(
        &template,
        &ctx,
        &BudgetConfig::with_max_tokens(200),
        &registry,
        &options,
    )
    .unwrap();
    assert_eq!(output.messages.len(), 3);
    assert!(output.messages[2].content.starts_with('l'));
    assert_eq!(output.report.tokens_used, 200);
    assert_eq!(output.report.budget.remaining, 0);
    assert_eq!(output.report.budget.reserved, 160);
    assert!(output.report.omissions.is_empty());
}

#[test]
fn layout_reservation_shrinks_main_pass() {
    let template = compile_toml(
        r#"
id = "t"

[[layout]]
kind = "message"
content = "12345678"

[[lanes]]
id = "held"
reserve_tokens = 9
"#,
    )
    .unwrap();
    let ctx = json!({});
    let registry = SourceRegistry::from_context_keys(&ctx);
    let output = render_with_report(
        &template,
        &ctx,
        &BudgetConfig::with_max_tokens(10),
        &registry,
        &RenderOptions::default(),
    )
    .unwrap();
    assert!(output.messages.is_empty());
    assert_eq!(output.report.count(OmissionReason::OverBudget), 1);
    // idle lane handed its floor back
    assert_eq!(output.report.budget.remaining, 10);
}

// ── Determinism ─────────────────────────────────────────────────────────

#[test]
fn repeated_renders_are_byte_identical() {
    let template = compile_toml(HISTORY).unwrap();
    let ctx = json!({"turns": ["hi", "hello", "how are you?"]});
    let registry = SourceRegistry::from_context_keys(&ctx);
    let options = RenderOptions::default().with_injections(vec![
        Injection::new("lore", TargetSpec::at("turn_1")).with_content("lore"),
    ]);
    let budget = BudgetConfig::with_max_tokens(64);

    let first = render(&template, &ctx, &budget, &registry, &options).unwrap();
    let second = render(&template, &ctx, &budget, &registry, &options).unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn compiled_template_is_shared_across_threads() {
    let template = Arc::new(compile_toml(HISTORY).unwrap());
    let ctx = Arc::new(json!({"turns": ["a", "b"]}));
    let registry = Arc::new(SourceRegistry::from_context_keys(&ctx));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let (template, ctx, registry) = (template.clone(), ctx.clone(), registry.clone());
            std::thread::spawn(move || {
                render(
                    &template,
                    &*ctx,
                    &BudgetConfig::default(),
                    &*registry,
                    &RenderOptions::default(),
                )
                .unwrap()
            })
        })
        .collect();
    let results: Vec<Vec<ChatMessage>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(texts(&results[0]), vec!["sys", "a", "b"]);
}

// ── Injection ─────────────────────────────────────────────────────────────

#[test]
fn priority_zero_lands_before_priority_one_at_anchor() {
    let template = compile_toml(HISTORY).unwrap();
    let ctx = json!({"turns": ["t0", "t1", "t2", "t3"]});
    let registry = SourceRegistry::from_context_keys(&ctx);
    let options = RenderOptions::default().with_injections(vec![
        Injection::new("lore", TargetSpec::at("turn_2"))
            .with_content("p1")
            .with_priority(1),
        Injection::new("lore", TargetSpec::at("turn_2"))
            .with_content("p0")
            .with_priority(0),
    ]);
    let messages = render(
        &template,
        &ctx,
        &BudgetConfig::default(),
        &registry,
        &options,
    )
    .unwrap();
    assert_eq!(
        texts(&messages),
        vec!["sys", "t0", "t1", "p0", "p1", "t2", "t3"]
    );
}

#[test]
fn fallback_target_resolves_second_key() {
    let template = compile_toml(HISTORY).unwrap();
    let ctx = json!({"turns": ["t0", "t1"]});
    let registry = SourceRegistry::from_context_keys(&ctx);
    let options = RenderOptions::default().with_injections(vec![
        Injection::new(
            "lore",
            vec![TargetSpec::at("turn_9"), TargetSpec::at("turn_1")],
        )
        .with_content("fallback"),
    ]);
    let messages = render(
        &template,
        &ctx,
        &BudgetConfig::default(),
        &registry,
        &options,
    )
    .unwrap();
    assert_eq!(texts(&messages), vec!["sys", "t0", "fallback", "t1"]);
}

#[test]
fn injections_from_json_with_groups() {
    let template = compile_toml(
        r#"
id = "t"

[[layout]]
kind = "message"
role = "system"
content = "sys"

[[layout]]
kind = "anchor"
key = "after_sys"

[[layout]]
kind = "message"
role = "user"
content = "question"

[[lanes]]
id = "lore"
template = "- {{content}}"

[[lanes.groups]]
pattern = "^world"
open = "[{{group}}]"
close = "[/{{group}}]"
"#,
    )
    .unwrap();
    let requests: Vec<Injection> = serde_json::from_value(json!([
        {"lane": "lore", "target": {"kind": "at", "key": "after_sys"}, "group": "world.map",
         "payload": {"content": "north"}},
        {"lane": "lore", "target": {"kind": "at", "key": "after_sys"}, "group": "world.map",
         "payload": {"content": "south"}},
        {"lane": "lore", "target": {"kind": "boundary", "edge": "top"}, "payload": {"content": "loose"}}
    ]))
    .unwrap();
    let ctx = json!({});
    let registry = SourceRegistry::from_context_keys(&ctx);
    let messages = render(
        &template,
        &ctx,
        &BudgetConfig::default(),
        &registry,
        &RenderOptions::default().with_injections(requests),
    )
    .unwrap();
    assert_eq!(
        texts(&messages),
        vec![
            "- loose",
            "sys",
            "[world.map]",
            "- north",
            "- south",
            "[/world.map]",
            "question"
        ]
    );
    assert!(messages.iter().all(|m| m.role != Role::Assistant));
}

#[test]
fn unknown_lane_is_an_omission_not_an_error() {
    let template = compile_toml(HISTORY).unwrap();
    let ctx = json!({"turns": []});
    let registry = SourceRegistry::from_context_keys(&ctx);
    let output = render_with_report(
        &template,
        &ctx,
        &BudgetConfig::default(),
        &registry,
        &RenderOptions::default().with_injections(vec![
            Injection::new("missing", TargetSpec::bottom()).with_content("x"),
        ]),
    )
    .unwrap();
    assert_eq!(texts(&output.messages), vec!["sys"]);
    assert_eq!(output.report.count(OmissionReason::UnknownLane), 1);
}

// ── Sources ─────────────────────────────────────────────────────────────

struct Session {
    user: String,
    turns: Vec<(String, String)>,
}

#[test]
fn typed_context_with_custom_resolvers() {
    let template = compile_toml(
        r#"
id = "typed"

[[layout]]
kind = "slot"
name = "turns"

[slots.turns]
[[slots.turns.plan]]
kind = "if"
condition = "user.name"

[[slots.turns.plan.then]]
kind = "message"
role = "system"
content = "Talking to {{user.name}}"

[[slots.turns.plan]]
kind = "for_each"
source = { source = "turns", args = { last = 1 } }
as = "turn"

[[slots.turns.plan.plan]]
kind = "message"
role = "user"
source = "turn.0"

[[slots.turns.plan.plan]]
kind = "message"
role = "assistant"
source = "turn.1"
"#,
    )
    .unwrap();

    let registry: SourceRegistry<Session> = SourceRegistry::new()
        .with("user", |_, s: &Session| Ok(Some(json!({"name": s.user}))))
        .with("turns", |args, s: &Session| {
            let last = args.get("last").and_then(Value::as_u64).unwrap_or(0) as usize;
            let skip = s.turns.len().saturating_sub(last);
            Ok(Some(json!(s.turns[skip..])))
        });
    let session = Session {
        user: "Ada".into(),
        turns: vec![
            ("old q".into(), "old a".into()),
            ("new q".into(), "new a".into()),
        ],
    };

    let messages = render(
        &template,
        &session,
        &BudgetConfig::default(),
        &registry,
        &RenderOptions::default(),
    )
    .unwrap();
    assert_eq!(texts(&messages), vec!["Talking to Ada", "new q", "new a"]);
    assert_eq!(messages[2].role, Role::Assistant);
}

#[test]
fn resolver_failure_propagates() {
    let template = compile_toml(HISTORY).unwrap();
    let registry: SourceRegistry<()> = SourceRegistry::new().with("turns", |_, _| {
        Err(promptloom_core::SourceError::failed("turns", "store offline"))
    });
    let err = render(
        &template,
        &(),
        &BudgetConfig::default(),
        &registry,
        &RenderOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, RenderError::Source(_)));
    assert!(err.to_string().contains("store offline"));
}
