//! Render entry points.

use crate::RenderError;
use crate::assembler::assemble;
use crate::budget::{BudgetManager, CharEstimator, TokenEstimator};
use crate::executor::Executor;
use crate::injection::inject;
use crate::registry::Sources;
use crate::report::{Omissions, RenderReport};
use promptloom_config::BudgetConfig;
use promptloom_core::ChatMessage;
use promptloom_template::{CompiledLane, CompiledTemplate, Injection, Lane, compile_lane};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Per-call extras: lanes and requests supplied by the caller, and an
/// optional estimator overriding the one derived from [`BudgetConfig`].
#[derive(Clone, Default)]
pub struct RenderOptions {
    /// Replace template lanes with the same id, or add new ones.
    pub lanes: Vec<Lane>,
    pub injections: Vec<Injection>,
    pub estimator: Option<Arc<dyn TokenEstimator>>,
}

impl std::fmt::Debug for RenderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderOptions")
            .field("lanes", &self.lanes)
            .field("injections", &self.injections)
            .field("estimator", &self.estimator.is_some())
            .finish()
    }
}

impl RenderOptions {
    pub fn with_injections(mut self, injections: Vec<Injection>) -> Self {
        self.injections = injections;
        self
    }

    pub fn with_lanes(mut self, lanes: Vec<Lane>) -> Self {
        self.lanes = lanes;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderOutput {
    pub messages: Vec<ChatMessage>,
    pub report: RenderReport,
}

/// Render a compiled template to its final message list.
///
/// Content that is missing, over budget or unplaceable is left out silently.
/// Resolver failures are returned as [`RenderError::Source`].
pub fn render<C>(
    template: &CompiledTemplate,
    ctx: &C,
    budget: &BudgetConfig,
    sources: &dyn Sources<C>,
    options: &RenderOptions,
) -> Result<Vec<ChatMessage>, RenderError> {
    Ok(render_with_report(template, ctx, budget, sources, options)?.messages)
}

/// [`render`], plus counters and the list of omissions.
pub fn render_with_report<C>(
    template: &CompiledTemplate,
    ctx: &C,
    config: &BudgetConfig,
    sources: &dyn Sources<C>,
    options: &RenderOptions,
) -> Result<RenderOutput, RenderError> {
    let estimator = options
        .estimator
        .clone()
        .unwrap_or_else(|| Arc::new(CharEstimator::new(config.chars_per_token)));
    let mut budget = BudgetManager::with_estimator(config.max_tokens, estimator);

    let caller_lanes = options
        .lanes
        .iter()
        .map(compile_lane)
        .collect::<Result<Vec<_>, _>>()?;
    let mut lanes: Vec<&CompiledLane> = template
        .lanes
        .iter()
        .filter(|lane| !caller_lanes.iter().any(|c| c.id == lane.id))
        .chain(caller_lanes.iter())
        .collect();
    lanes.sort_by_key(|lane| lane.order);

    for lane in lanes.iter().filter(|l| l.enabled) {
        if let Some(tokens) = lane.reserve_tokens {
            budget.reserve_floor(&lane.id, tokens);
        }
    }

    let mut omissions = Omissions::default();
    let mut exec = Executor::new(ctx, &mut omissions);
    let mut doc = assemble(template, &mut exec, sources, &mut budget)?;
    inject(
        &mut exec,
        sources,
        &mut budget,
        &lanes,
        &options.injections,
        &mut doc,
    )?;

    let omitted = omissions.len();
    info!(
        template = %template.id,
        messages = doc.messages.len(),
        tokens_used = budget.tokens_used(),
        omitted,
        "Render complete"
    );

    Ok(RenderOutput {
        messages: doc.messages,
        report: RenderReport {
            budget: budget.snapshot(),
            tokens_used: budget.tokens_used(),
            omissions: omissions.into_vec(),
        },
    })
}
