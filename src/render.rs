//! Plain-text rendering of prover replies.

use crate::protocol::{self, GoalSet};
use crate::xml::Element;

/// Goal markers are truncated to a fixed width so columns line up across
/// single- and double-digit indices.
const MARKER_WIDTH: usize = 15;

/// Error text with an `"Error: "` prefix, unless the prover already
/// included one.
pub(crate) fn error_text(payload: &Element) -> String {
    let content = payload.text();
    let prefix = "Error: ";
    if content.starts_with(prefix) {
        content
    } else {
        format!("{prefix}{content}")
    }
}

/// Diagnostic text with a capitalized level prefix. Notice-level messages
/// are left bare; other levels get e.g. `"Warning: "` unless the body
/// already carries it. `None` if the element has no level or body.
pub(crate) fn message_text(message: &Element) -> Option<String> {
    let (level, body) = protocol::message_parts(message)?;
    let prefix = format!("{}: ", capitalize(level));
    if level == "notice" || body.starts_with(&prefix) {
        Some(body)
    } else {
        Some(format!("{prefix}{body}"))
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Render a goal state block.
///
/// Header, the focused goal's hypotheses, and the per-goal conclusion
/// blocks form three sections joined by blank lines; empty sections are
/// omitted. Within the last section each goal contributes a fixed-width
/// `i/n -----------` marker line followed by its conclusion.
pub(crate) fn goals_text(set: &GoalSet) -> String {
    let total = set.goals.len();
    if total == 0 {
        return "No more subgoals".to_string();
    }

    let header = if total == 1 {
        "1 subgoal".to_string()
    } else {
        format!("{total} subgoals")
    };

    let hypotheses = set.goals[0].hypotheses.join("\n");

    let conclusions = set
        .goals
        .iter()
        .enumerate()
        .map(|(index, goal)| format!("{}\n{}", marker(index + 1, total), goal.conclusion))
        .collect::<Vec<_>>()
        .join("\n");

    [header, hypotheses, conclusions]
        .into_iter()
        .filter(|section| !section.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn marker(index: usize, total: usize) -> String {
    format!("{index}/{total} -----------")
        .chars()
        .take(MARKER_WIDTH)
        .collect()
}
