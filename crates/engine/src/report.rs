//! What a render produced besides messages: budget counters and the list of
//! silent omissions.
//!
//! Omissions are not errors. They are collected so callers can see why a
//! piece of content is missing without turning best-effort assembly into a
//! failure.

use crate::budget::BudgetSnapshot;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Layout,
    Slot,
    Plan,
    Injection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OmissionReason {
    /// A data reference resolved to nothing.
    NullData,
    /// A loop source resolved to something other than an array.
    NotAnArray,
    /// Content did not fit the applicable budget.
    OverBudget,
    /// A loop stopped early on an exhausted budget.
    LoopStopped,
    /// No target candidate resolved to a position.
    UnresolvedTarget,
    /// The request names a lane that does not exist.
    UnknownLane,
    /// The request names a disabled lane.
    DisabledLane,
    /// A per-request template failed to parse.
    InvalidTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Omission {
    pub stage: Stage,
    pub reason: OmissionReason,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderReport {
    pub budget: BudgetSnapshot,
    pub tokens_used: usize,
    pub omissions: Vec<Omission>,
}

impl RenderReport {
    pub fn count(&self, reason: OmissionReason) -> usize {
        self.omissions.iter().filter(|o| o.reason == reason).count()
    }
}

/// Collector shared by the executor, assembler and injection pass.
#[derive(Debug, Default)]
pub(crate) struct Omissions(Vec<Omission>);

impl Omissions {
    pub(crate) fn record(&mut self, stage: Stage, reason: OmissionReason, detail: impl Into<String>) {
        let detail = detail.into();
        debug!(?stage, ?reason, %detail, "Omitted");
        self.0.push(Omission {
            stage,
            reason,
            detail,
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn into_vec(self) -> Vec<Omission> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_reason() {
        let mut omissions = Omissions::default();
        omissions.record(Stage::Plan, OmissionReason::OverBudget, "a");
        omissions.record(Stage::Injection, OmissionReason::OverBudget, "b");
        omissions.record(Stage::Injection, OmissionReason::UnknownLane, "c");
        assert_eq!(omissions.len(), 3);

        let report = RenderReport {
            budget: BudgetSnapshot {
                max_tokens: 10,
                remaining: 0,
                used: 10,
                reserved: 0,
            },
            tokens_used: 10,
            omissions: omissions.into_vec(),
        };
        assert_eq!(report.count(OmissionReason::OverBudget), 2);
        assert_eq!(report.count(OmissionReason::NullData), 0);
    }

    #[test]
    fn serializes_snake_case() {
        let omission = Omission {
            stage: Stage::Injection,
            reason: OmissionReason::UnresolvedTarget,
            detail: "lore".into(),
        };
        let json = serde_json::to_value(&omission).unwrap();
        assert_eq!(json["stage"], "injection");
        assert_eq!(json["reason"], "unresolved_target");
    }
}
