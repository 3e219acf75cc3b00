//! Deterministic token estimation.
//!
//! The estimator is `ceil(len / 4)` over UTF-8 bytes. It is intentionally
//! crude; what matters is that the same formula drives pinning, eviction,
//! and the context brief, so budget decisions are reproducible.

use crate::types::{ContextItem, WorkingSet};

/// Estimate tokens for a piece of text: `ceil(len / 4)`, 0 for empty.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Tokens for one context item.
///
/// A precomputed `tokens` value wins over re-estimation.
#[must_use]
pub fn item_tokens(item: &ContextItem) -> u64 {
    item.tokens.unwrap_or_else(|| estimate_tokens(&item.content))
}

/// Tokens for all context carried by a working set (pinned + sliding).
#[must_use]
pub fn context_tokens(ws: &WorkingSet) -> u64 {
    ws.pinned_context
        .iter()
        .chain(ws.sliding_context.iter())
        .map(item_tokens)
        .sum()
}

/// Tokens the task envelope and execution state contribute regardless of
/// context: objective, acceptance criteria, constraints, status strings.
/// Eviction can never reclaim these.
#[must_use]
pub fn base_tokens(ws: &WorkingSet) -> u64 {
    estimate_tokens(&ws.objective)
        + ws.acceptance_criteria
            .iter()
            .map(|s| estimate_tokens(s))
            .sum::<u64>()
        + ws.constraints.iter().map(|s| estimate_tokens(s)).sum::<u64>()
        + estimate_tokens(ws.status.as_str())
        + estimate_tokens(&ws.current_stage)
        + estimate_tokens(&ws.next_action)
}

/// Total estimated tokens for a working set: base load plus all context.
/// This is the number compared against `token_budget`.
#[must_use]
pub fn document_tokens(ws: &WorkingSet) -> u64 {
    base_tokens(ws) + context_tokens(ws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{RunId, TaskId, ThreadId};

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn rounds_up() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(20)), 5);
    }

    #[test]
    fn precomputed_tokens_win() {
        let item = ContextItem {
            id: "a".to_string(),
            content: "x".repeat(400),
            timestamp: String::new(),
            priority: 0,
            tokens: Some(3),
        };
        assert_eq!(item_tokens(&item), 3);
    }

    #[test]
    fn document_tokens_cover_envelope_and_context() {
        let mut ws = WorkingSet::initial(
            RunId::from("run_1"),
            TaskId::from("task_1"),
            ThreadId::from("thread_1"),
            "abcdabcd".to_string(), // 2 tokens
            vec!["abcd".to_string()], // 1 token
            vec![],
        );
        // status BOOT (1) + stage BOOT (1) + empty next_action (0)
        assert_eq!(base_tokens(&ws), 2 + 1 + 1 + 1);
        ws.sliding_context.push(ContextItem {
            id: "s1".to_string(),
            content: "x".repeat(8), // 2 tokens
            timestamp: String::new(),
            priority: 0,
            tokens: None,
        });
        assert_eq!(document_tokens(&ws), 5 + 2);
    }
}
