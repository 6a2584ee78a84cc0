//! Injection pass: splices lane requests into the assembled message list at
//! anchor-resolved positions.
//!
//! Lanes run in ascending order. Inside a lane, requests run by ascending
//! priority with submission order breaking ties. Every splice shifts the
//! anchor map and the tracked group positions before the next request
//! resolves its target.

use crate::RenderError;
use crate::anchors::AnchorMap;
use crate::assembler::Assembled;
use crate::budget::BudgetManager;
use crate::executor::Executor;
use crate::registry::{Frame, Sources, with_additional_frame};
use crate::report::{OmissionReason, Stage};
use promptloom_core::value::value_to_text;
use promptloom_core::ChatMessage;
use promptloom_template::{
    CompiledLane, Edge, Injection, Occurrence, Payload, TargetSpec, TextTemplate,
};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Run every enabled lane over `doc`. `lanes` must already be in lane order.
pub(crate) fn inject<C>(
    exec: &mut Executor<'_, C>,
    sources: &dyn Sources<C>,
    budget: &mut BudgetManager,
    lanes: &[&CompiledLane],
    requests: &[Injection],
    doc: &mut Assembled,
) -> Result<(), RenderError> {
    for request in requests {
        match lanes.iter().find(|l| l.id == request.lane) {
            None => exec.omissions().record(
                Stage::Injection,
                OmissionReason::UnknownLane,
                request.lane.clone(),
            ),
            Some(lane) if !lane.enabled => exec.omissions().record(
                Stage::Injection,
                OmissionReason::DisabledLane,
                request.lane.clone(),
            ),
            Some(_) => {}
        }
    }

    let mut queues: Vec<(&CompiledLane, Vec<&Injection>)> = Vec::new();
    for lane in lanes.iter().copied().filter(|l| l.enabled) {
        let mut queue: Vec<&Injection> = requests.iter().filter(|r| r.lane == lane.id).collect();
        if queue.is_empty() {
            release_unused(budget, &lane.id);
            continue;
        }
        queue.sort_by_key(|r| r.priority);
        queues.push((lane, queue));
    }

    for (lane, queue) in queues {
        {
            let mut lane_scope = budget.lane(&lane.id);
            let mut scoped = lane_scope.scope(lane.budget);
            LaneRun {
                lane,
                exec: &mut *exec,
                sources,
                buckets: Vec::new(),
            }
            .run(&queue, &mut scoped, doc)?;
        }
        release_unused(budget, &lane.id);
    }
    Ok(())
}

fn release_unused(budget: &mut BudgetManager, lane_id: &str) {
    let unused = budget.unused_floor(lane_id);
    if unused > 0 {
        let released = budget.release_floor(lane_id, unused);
        debug!(lane = %lane_id, released, "Released unused floor");
    }
}

/// Insertions that share one open/close wrapper pair.
struct Bucket {
    group: usize,
    key: Option<String>,
    last: usize,
    /// Already charged; `None` when the group has no close or the pair
    /// did not fit.
    close: Option<ChatMessage>,
}

struct LaneRun<'l, 'e, 'c, C> {
    lane: &'l CompiledLane,
    exec: &'e mut Executor<'c, C>,
    sources: &'l dyn Sources<C>,
    buckets: Vec<Bucket>,
}

impl<C> LaneRun<'_, '_, '_, C> {
    fn run(
        mut self,
        queue: &[&Injection],
        budget: &mut BudgetManager,
        doc: &mut Assembled,
    ) -> Result<(), RenderError> {
        for request in queue {
            self.apply(request, budget, doc)?;
        }
        self.close_groups(doc);
        Ok(())
    }

    fn apply(
        &mut self,
        request: &Injection,
        budget: &mut BudgetManager,
        doc: &mut Assembled,
    ) -> Result<(), RenderError> {
        let lane = self.lane;
        let group_index = resolve_group(lane, request.group.as_deref());
        let group = group_index.map(|i| &lane.groups[i]);
        let group_name = request
            .group
            .clone()
            .or_else(|| group.and_then(|g| g.id.clone()));

        let mut payload = lane.payload.clone();
        if let Some(g) = group {
            payload.extend(g.payload.clone());
        }
        payload.extend(request.payload.clone());
        let role = request
            .role
            .or_else(|| group.and_then(|g| g.role))
            .or(lane.role)
            .unwrap_or_default();

        let text = match (&request.template, &lane.template) {
            (Some(raw), _) => {
                let template = match TextTemplate::parse(raw) {
                    Ok(template) => template,
                    Err(detail) => {
                        self.omit(OmissionReason::InvalidTemplate, format!("request template: {detail}"));
                        return Ok(());
                    }
                };
                let frame = self.frame(&payload, group_name.as_deref());
                self.exec.render_text(&template, &frame)?
            }
            (None, Some(template)) => {
                let frame = self.frame(&payload, group_name.as_deref());
                self.exec.render_text(template, &frame)?
            }
            (None, None) => payload
                .get("content")
                .and_then(value_to_text)
                .unwrap_or_default(),
        };
        if text.is_empty() {
            self.omit(OmissionReason::NullData, "empty injection content");
            return Ok(());
        }

        let Some(index) = request
            .target
            .candidates()
            .iter()
            .find_map(|spec| resolve_target(spec, &doc.anchors, doc.messages.len()))
        else {
            self.omit(OmissionReason::UnresolvedTarget, "no target candidate resolved");
            return Ok(());
        };

        if !budget.can_fit_token_estimate(&text) {
            self.omit(OmissionReason::OverBudget, format!("request at index {index}"));
            return Ok(());
        }
        budget.consume(&text);
        self.splice(doc, index, ChatMessage::new(role, text));
        debug!(lane = %lane.id, index, priority = request.priority, "Injected");

        let Some(group_index) = group_index else {
            return Ok(());
        };
        let key = request.group.clone();
        if let Some(bucket) = self
            .buckets
            .iter_mut()
            .find(|b| b.group == group_index && b.key == key)
        {
            bucket.last = bucket.last.max(index);
            return Ok(());
        }

        let group = &lane.groups[group_index];
        let mut wrapper_payload = lane.payload.clone();
        wrapper_payload.extend(group.payload.clone());
        let frame = with_additional_frame(
            self.sources,
            bindings(&wrapper_payload, &lane.id, group_name.as_deref()),
        );
        let wrapper_role = group.role.or(lane.role).unwrap_or_default();
        let open = match &group.open {
            Some(template) => Some(self.exec.render_text(template, &frame)?),
            None => None,
        };
        let close = match &group.close {
            Some(template) => Some(self.exec.render_text(template, &frame)?),
            None => None,
        };

        // Open and close are charged as a pair.
        let mut message_index = index;
        let mut close_message = None;
        if open.is_some() || close.is_some() {
            if budget.can_fit_all(open.iter().chain(close.iter()).map(String::as_str)) {
                if let Some(text) = open {
                    budget.consume(&text);
                    self.splice(doc, index, ChatMessage::new(wrapper_role, text));
                    message_index += 1;
                }
                if let Some(text) = close {
                    budget.consume(&text);
                    close_message = Some(ChatMessage::new(wrapper_role, text));
                }
            } else {
                self.omit(OmissionReason::OverBudget, "group wrappers");
            }
        }

        self.buckets.push(Bucket {
            group: group_index,
            key,
            last: message_index,
            close: close_message,
        });
        Ok(())
    }

    /// Close wrappers go in from the highest position down so earlier
    /// positions stay valid.
    fn close_groups(&mut self, doc: &mut Assembled) {
        let mut buckets = std::mem::take(&mut self.buckets);
        buckets.sort_by(|a, b| b.last.cmp(&a.last));
        for bucket in buckets {
            let Some(close) = bucket.close else {
                continue;
            };
            let at = bucket.last + 1;
            doc.messages.insert(at, close);
            doc.anchors.shift_from(at);
        }
    }

    fn splice(&mut self, doc: &mut Assembled, index: usize, message: ChatMessage) {
        doc.messages.insert(index, message);
        doc.anchors.shift_from(index);
        for bucket in &mut self.buckets {
            if bucket.last >= index {
                bucket.last += 1;
            }
        }
    }

    fn frame(&self, payload: &Payload, group: Option<&str>) -> Frame<'_, C> {
        with_additional_frame(self.sources, bindings(payload, &self.lane.id, group))
    }

    fn omit(&mut self, reason: OmissionReason, detail: impl Into<String>) {
        let detail = format!("lane '{}': {}", self.lane.id, detail.into());
        self.exec.omissions().record(Stage::Injection, reason, detail);
    }
}

fn bindings(payload: &Payload, lane: &str, group: Option<&str>) -> BTreeMap<String, Value> {
    let mut bound: BTreeMap<String, Value> = payload
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    bound.insert("lane".into(), Value::from(lane));
    if let Some(group) = group {
        bound.insert("group".into(), Value::from(group));
    }
    bound
}

/// Exact id, then pattern, then the lane's single default group.
fn resolve_group(lane: &CompiledLane, group: Option<&str>) -> Option<usize> {
    if let Some(id) = group {
        if let Some(i) = lane.groups.iter().position(|g| g.id.as_deref() == Some(id)) {
            return Some(i);
        }
        if let Some(i) = lane
            .groups
            .iter()
            .position(|g| g.pattern.as_ref().is_some_and(|re| re.is_match(id)))
        {
            return Some(i);
        }
    }
    let mut defaults = lane
        .groups
        .iter()
        .enumerate()
        .filter(|(_, g)| g.is_default());
    match (defaults.next(), defaults.next()) {
        (Some((i, _)), None) => Some(i),
        _ => None,
    }
}

/// Resolve one target candidate to an insertion index in `[0, len]`.
pub(crate) fn resolve_target(spec: &TargetSpec, anchors: &AnchorMap, len: usize) -> Option<usize> {
    match spec {
        TargetSpec::At { key, occurrence } => match occurrence {
            Occurrence::First => anchors.first(key),
            Occurrence::Last => anchors.last(key),
            Occurrence::Nth(n) => anchors.nth(key, *n),
        }
        .map(|i| i.min(len)),
        TargetSpec::Offset { key, delta } => anchors.last(key).map(|i| shifted(i, *delta, len)),
        TargetSpec::Boundary { edge, delta } => {
            let base = match edge {
                Edge::Top => 0,
                Edge::Bottom => len,
            };
            Some(shifted(base, *delta, len))
        }
    }
}

fn shifted(base: usize, delta: i64, len: usize) -> usize {
    let target = i64::try_from(base).unwrap_or(i64::MAX).saturating_add(delta);
    let max = i64::try_from(len).unwrap_or(i64::MAX);
    usize::try_from(target.clamp(0, max)).unwrap_or(len)
}
