//! Token budget accounting for a single render.
//!
//! One global remaining-token counter plus a stack of nested local ceilings.
//! Fit checks run against `min(innermost local, global)`; consumption is
//! charged to every active local scope and to the global counter.
//!
//! Lanes may hold a floor reservation: the reserved tokens leave the global
//! counter up front and are only spendable while that lane is active. Whatever
//! the lane does not use is handed back with [`BudgetManager::release_floor`].

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Cost function standing in for real tokenization.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharEstimator {
    chars_per_token: usize,
}

impl CharEstimator {
    /// A zero ratio is treated as 1.
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

impl<F> TokenEstimator for F
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn estimate(&self, text: &str) -> usize {
        self(text)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Floor {
    reserved: usize,
    remaining: usize,
}

/// Point-in-time view of the counters, reported after a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BudgetSnapshot {
    pub max_tokens: usize,
    pub remaining: usize,
    pub used: usize,
    pub reserved: usize,
}

/// Per-render budget state. Never shared between renders.
pub struct BudgetManager {
    max_tokens: usize,
    global: usize,
    locals: Vec<usize>,
    floors: BTreeMap<String, Floor>,
    active_lane: Option<String>,
    used: usize,
    estimator: Arc<dyn TokenEstimator>,
}

impl std::fmt::Debug for BudgetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetManager")
            .field("max_tokens", &self.max_tokens)
            .field("global", &self.global)
            .field("locals", &self.locals)
            .field("active_lane", &self.active_lane)
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}

impl BudgetManager {
    /// A manager using the default 4-chars-per-token estimate.
    pub fn new(max_tokens: usize) -> Self {
        Self::with_estimator(max_tokens, Arc::new(CharEstimator::default()))
    }

    pub fn with_estimator(max_tokens: usize, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            max_tokens,
            global: max_tokens,
            locals: Vec::new(),
            floors: BTreeMap::new(),
            active_lane: None,
            used: 0,
            estimator,
        }
    }

    pub fn estimate_tokens(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    /// Tokens that the next piece of content may use.
    pub fn available(&self) -> usize {
        let global = self.global.saturating_add(self.active_floor_remaining());
        match self.locals.last() {
            Some(local) => (*local).min(global),
            None => global,
        }
    }

    pub fn has_any(&self) -> bool {
        self.available() > 0
    }

    /// Whether `text` fits. Nothing fits, not even the empty string, once
    /// the applicable ceiling is zero.
    pub fn can_fit_token_estimate(&self, text: &str) -> bool {
        let available = self.available();
        available > 0 && self.estimate_tokens(text) <= available
    }

    /// Whether all of `texts` fit together.
    pub fn can_fit_all<'t>(&self, texts: impl IntoIterator<Item = &'t str>) -> bool {
        let available = self.available();
        let needed = texts
            .into_iter()
            .map(|text| self.estimate_tokens(text))
            .fold(0usize, usize::saturating_add);
        available > 0 && needed <= available
    }

    /// Charge `text` against every active scope. Returns the tokens charged.
    ///
    /// Overspending saturates at zero.
    pub fn consume(&mut self, text: &str) -> usize {
        let tokens = self.estimate_tokens(text);
        for local in &mut self.locals {
            *local = local.saturating_sub(tokens);
        }

        let mut rest = tokens;
        if let Some(floor) = self
            .active_lane
            .as_ref()
            .and_then(|lane| self.floors.get_mut(lane))
        {
            let drained = floor.remaining.min(rest);
            floor.remaining -= drained;
            rest -= drained;
        }
        self.global = self.global.saturating_sub(rest);
        self.used = self.used.saturating_add(tokens);
        tokens
    }

    /// Enter a local ceiling. `None` is a passthrough.
    ///
    /// The returned guard pops the scope when dropped, including during
    /// unwinding. A nested ceiling never exceeds what its parent has left.
    pub fn scope(&mut self, local: Option<usize>) -> BudgetScope<'_> {
        let pushed = match local {
            Some(limit) => {
                let parent = self.locals.last().copied().unwrap_or(usize::MAX);
                self.locals.push(limit.min(parent));
                true
            }
            None => false,
        };
        BudgetScope {
            manager: self,
            pushed,
        }
    }

    /// Run `f` under a local ceiling.
    pub fn with_node_budget<R>(
        &mut self,
        local: Option<usize>,
        f: impl FnOnce(&mut BudgetManager) -> R,
    ) -> R {
        let mut scope = self.scope(local);
        f(&mut scope)
    }

    /// Make `lane_id` the active lane until the guard drops.
    pub fn lane(&mut self, lane_id: &str) -> LaneScope<'_> {
        let previous = self.active_lane.replace(lane_id.to_string());
        LaneScope {
            manager: self,
            previous,
        }
    }

    /// Run `f` with `lane_id` active so its floor reservation is spendable.
    pub fn with_lane<R>(&mut self, lane_id: &str, f: impl FnOnce(&mut BudgetManager) -> R) -> R {
        let mut scope = self.lane(lane_id);
        f(&mut scope)
    }

    /// Hold up to `tokens` back from the global counter for `lane_id`.
    /// Returns the amount actually reserved.
    pub fn reserve_floor(&mut self, lane_id: &str, tokens: usize) -> usize {
        let reserved = tokens.min(self.global);
        self.global -= reserved;
        let floor = self.floors.entry(lane_id.to_string()).or_default();
        floor.reserved += reserved;
        floor.remaining += reserved;
        reserved
    }

    /// Unconsumed part of a lane's reservation.
    pub fn unused_floor(&self, lane_id: &str) -> usize {
        self.floors.get(lane_id).map_or(0, |f| f.remaining)
    }

    /// Return up to `amount` of the lane's unconsumed reservation to the
    /// global counter. Returns the amount released.
    pub fn release_floor(&mut self, lane_id: &str, amount: usize) -> usize {
        let Some(floor) = self.floors.get_mut(lane_id) else {
            return 0;
        };
        let released = floor.remaining.min(amount);
        floor.remaining -= released;
        self.global = self.global.saturating_add(released);
        released
    }

    pub fn remaining_global(&self) -> usize {
        self.global
    }

    pub fn tokens_used(&self) -> usize {
        self.used
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            max_tokens: self.max_tokens,
            remaining: self.global,
            used: self.used,
            reserved: self.floors.values().map(|f| f.reserved).sum(),
        }
    }

    fn active_floor_remaining(&self) -> usize {
        self.active_lane
            .as_ref()
            .and_then(|lane| self.floors.get(lane))
            .map_or(0, |f| f.remaining)
    }
}

/// Guard for a local ceiling. Derefs to the manager.
pub struct BudgetScope<'a> {
    manager: &'a mut BudgetManager,
    pushed: bool,
}

impl Deref for BudgetScope<'_> {
    type Target = BudgetManager;

    fn deref(&self) -> &BudgetManager {
        self.manager
    }
}

impl DerefMut for BudgetScope<'_> {
    fn deref_mut(&mut self) -> &mut BudgetManager {
        self.manager
    }
}

impl Drop for BudgetScope<'_> {
    fn drop(&mut self) {
        if self.pushed {
            self.manager.locals.pop();
        }
    }
}

/// Guard for the active lane. Derefs to the manager.
pub struct LaneScope<'a> {
    manager: &'a mut BudgetManager,
    previous: Option<String>,
}

impl Deref for LaneScope<'_> {
    type Target = BudgetManager;

    fn deref(&self) -> &BudgetManager {
        self.manager
    }
}

impl DerefMut for LaneScope<'_> {
    fn deref_mut(&mut self) -> &mut BudgetManager {
        self.manager
    }
}

impl Drop for LaneScope<'_> {
    fn drop(&mut self) {
        self.manager.active_lane = self.previous.take();
    }
}
