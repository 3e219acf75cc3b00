//! Context brief rendering.
//!
//! A pure function of the working set (plus optional ledger tail and
//! memory results) to markdown. Section order is fixed; identical inputs
//! yield identical bytes: no wall-clock reads, no map iteration.

use crate::types::{LedgerEvent, MemoryHit, WorkingSet};

/// Memory hits below this confidence are omitted from the brief.
pub const BRIEF_MIN_CONFIDENCE: f64 = 0.8;

fn bullet_list(lines: &mut Vec<String>, entries: &[String]) {
    if entries.is_empty() {
        lines.push("- (none)".to_string());
    } else {
        for entry in entries {
            lines.push(format!("- {entry}"));
        }
    }
}

/// Render the context brief for a working set.
///
/// Sections, in order: Objective, Acceptance Criteria, Constraints,
/// Current Stage, Pinned Context, Sliding Context, then Recent Ledger and
/// Long-Term Memory when those inputs are provided.
#[must_use]
pub fn render_context_brief(
    ws: &WorkingSet,
    ledger_tail: Option<&[LedgerEvent]>,
    memory: Option<&[MemoryHit]>,
) -> String {
    let mut lines: Vec<String> = Vec::new();

    lines.push("# CONTEXT BRIEF".to_string());
    lines.push(String::new());

    lines.push("## Objective".to_string());
    let objective = ws.objective.trim();
    lines.push(if objective.is_empty() { "(unset)".to_string() } else { objective.to_string() });
    lines.push(String::new());

    lines.push("## Acceptance Criteria".to_string());
    bullet_list(&mut lines, &ws.acceptance_criteria);
    lines.push(String::new());

    lines.push("## Constraints".to_string());
    bullet_list(&mut lines, &ws.constraints);
    lines.push(String::new());

    lines.push("## Current Stage".to_string());
    lines.push(format!("- status: {}", ws.status.as_str()));
    lines.push(format!("- stage: {}", ws.current_stage));
    lines.push(format!("- next_action: {}", ws.next_action));
    lines.push(String::new());

    lines.push("## Pinned Context".to_string());
    let pinned: Vec<String> = ws
        .pinned_context
        .iter()
        .map(|item| format!("{} (id={})", item.content.trim(), item.id))
        .collect();
    bullet_list(&mut lines, &pinned);
    lines.push(String::new());

    lines.push("## Sliding Context".to_string());
    let sliding: Vec<String> = ws
        .sliding_context
        .iter()
        .map(|item| {
            format!(
                "{} (pri={} ts={})",
                item.content.trim(),
                item.priority,
                item.timestamp
            )
        })
        .collect();
    bullet_list(&mut lines, &sliding);

    if let Some(tail) = ledger_tail {
        lines.push(String::new());
        lines.push("## Recent Ledger".to_string());
        let entries: Vec<String> = tail
            .iter()
            .map(|event| {
                format!(
                    "[{}] {} @ {}",
                    event.sequence_id,
                    event.event_type.as_str(),
                    event.timestamp
                )
            })
            .collect();
        bullet_list(&mut lines, &entries);
    }

    if let Some(hits) = memory {
        lines.push(String::new());
        lines.push("## Long-Term Memory".to_string());
        let entries: Vec<String> = hits
            .iter()
            .filter(|hit| hit.item.confidence >= BRIEF_MIN_CONFIDENCE)
            .map(|hit| {
                format!(
                    "{} (id={} conf={:.2})",
                    hit.item.content.trim(),
                    hit.item.id,
                    hit.item.confidence
                )
            })
            .collect();
        bullet_list(&mut lines, &entries);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
