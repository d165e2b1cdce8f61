//! Pane Selection
//!
//! Chooses the pane a step's prompt goes to and isolates the text an agent
//! wrote in response.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::debug;

use super::config::ExecutorConfig;
use super::engine::Collaborators;
use crate::agents::{RoutingContext, ScoredAgent};
use crate::workflow::{normalize_agent_type, Step};

/// Pane ids taken by the sub-steps of one parallel group.
pub(crate) type ClaimSet = Arc<Mutex<HashSet<String>>>;

/// Placeholder target used in dry-run mode.
pub const DRY_RUN_PANE: &str = "dry-run-pane";
pub const DRY_RUN_AGENT: &str = "dry-run-agent";

/// Characters of the previous capture used to find where new output begins.
const OVERLAP_SIZE: usize = 100;

/// The pane chosen for a step.
#[derive(Debug, Clone, PartialEq)]
pub struct PaneSelection {
    pub pane_id: String,
    pub agent_type: String,
}

/// Picks a pane for `step`.
///
/// An explicit pane index is looked up directly and bypasses exclusion.
/// Otherwise agents are scored, filtered by the requested agent type and
/// exclusion, and routed. With `claims`, panes already claimed by the
/// group are avoided when possible and the chosen pane is claimed.
pub(crate) async fn select_pane(
    config: &ExecutorConfig,
    collaborators: &Collaborators,
    step: &Step,
    prompt: &str,
    claims: Option<&ClaimSet>,
) -> Result<PaneSelection, String> {
    if config.dry_run {
        return Ok(PaneSelection {
            pane_id: DRY_RUN_PANE.to_string(),
            agent_type: DRY_RUN_AGENT.to_string(),
        });
    }

    if let Some(index) = step.pane {
        let panes = collaborators
            .terminal
            .list_panes(&config.session)
            .await
            .map_err(|e| format!("failed to get panes: {}", e))?;
        let pane = panes
            .into_iter()
            .find(|p| p.index == index)
            .ok_or_else(|| format!("pane {} not found", index))?;
        if let Some(claims) = claims {
            lock_claims(claims).insert(pane.id.clone());
        }
        return Ok(PaneSelection {
            pane_id: pane.id,
            agent_type: pane.agent_type.unwrap_or_default(),
        });
    }

    let mut agents = collaborators
        .scorer
        .score_agents(&config.session, prompt)
        .await
        .map_err(|e| format!("failed to score agents: {}", e))?;

    if let Some(requested) = &step.agent {
        let target = normalize_agent_type(requested);
        agents.retain(|a| a.agent_type == target);
    }

    let context = RoutingContext {
        step_id: step.id.clone(),
        prompt: prompt.to_string(),
    };
    route_and_claim(collaborators, step, &agents, &context, claims)
}

/// Filters, routes and claims under one lock so concurrent sub-steps
/// cannot pick the same pane.
fn route_and_claim(
    collaborators: &Collaborators,
    step: &Step,
    agents: &[ScoredAgent],
    context: &RoutingContext,
    claims: Option<&ClaimSet>,
) -> Result<PaneSelection, String> {
    let mut claimed = claims.map(lock_claims);

    let mut available: Vec<ScoredAgent> = agents
        .iter()
        .filter(|a| !a.excluded)
        .filter(|a| claimed.as_ref().map_or(true, |c| !c.contains(&a.pane_id)))
        .cloned()
        .collect();

    if available.is_empty() && claimed.is_some() {
        debug!("All eligible agents claimed for '{}', allowing reuse", step.id);
        available = agents.iter().filter(|a| !a.excluded).cloned().collect();
    }

    if available.is_empty() {
        return Err("no suitable agents found".to_string());
    }

    let strategy = step.route.unwrap_or_default();
    let decision = collaborators.router.route(&available, strategy, context);
    let selected = decision
        .selected
        .ok_or_else(|| format!("routing failed: {}", decision.reason))?;

    debug!(
        "Step '{}' routed to {} ({}): {}",
        step.id, selected.pane_id, selected.agent_type, decision.reason
    );

    if let Some(claimed) = claimed.as_mut() {
        claimed.insert(selected.pane_id.clone());
    }

    Ok(PaneSelection {
        pane_id: selected.pane_id,
        agent_type: selected.agent_type,
    })
}

fn lock_claims(claims: &ClaimSet) -> std::sync::MutexGuard<'_, HashSet<String>> {
    claims.lock().unwrap_or_else(|e| e.into_inner())
}

/// Returns the part of `after` that was not already present in `before`.
///
/// Usually `before` is a prefix of `after`. When the pane's history scrolled,
/// the tail of `before` is searched for in `after` instead. If neither works
/// the whole of `after` is returned.
pub fn extract_new_output(before: &str, after: &str) -> String {
    if before.is_empty() {
        return after.to_string();
    }
    if after.is_empty() {
        return String::new();
    }
    if let Some(rest) = after.strip_prefix(before) {
        return rest.to_string();
    }

    let mut tail_start = before.len().saturating_sub(OVERLAP_SIZE);
    while !before.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let tail = &before[tail_start..];

    let mut search_from = 0;
    while let Some(offset) = after[search_from..].find(tail) {
        let found = search_from + offset;
        let match_end = found + tail.len();
        if before.ends_with(&after[..match_end]) {
            return after[match_end..].to_string();
        }
        search_from = found + after[found..].chars().next().map_or(1, char::len_utf8);
    }

    after.to_string()
}

/// Shortens a prompt for single-line display.
pub fn truncate_prompt(prompt: &str, max_chars: usize) -> String {
    let flat: String = prompt
        .chars()
        .map(|c| if c == '\n' || c == '\t' { ' ' } else { c })
        .collect();
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let kept: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_appended_output() {
        assert_eq!(extract_new_output("$ ", "$ hello\nworld"), "hello\nworld");
        assert_eq!(extract_new_output("", "all new"), "all new");
        assert_eq!(extract_new_output("old", ""), "");
    }

    #[test]
    fn test_extract_without_overlap_returns_everything() {
        assert_eq!(extract_new_output("abc", "xyz"), "xyz");
    }

    #[test]
    fn test_extract_after_scroll() {
        // The first rows scrolled out of the capture window
        let history: String = (0..50).map(|i| format!("row {}\n", i)).collect();
        let scrolled: String = history.lines().skip(10).map(|l| format!("{}\n", l)).collect();
        let after = format!("{}reply", scrolled);
        assert_eq!(extract_new_output(&history, &after), "reply");
    }

    #[test]
    fn test_truncate_prompt() {
        assert_eq!(truncate_prompt("short\nprompt", 100), "short prompt");
        let long = "x".repeat(120);
        let truncated = truncate_prompt(&long, 100);
        assert_eq!(truncated.len(), 100);
        assert!(truncated.ends_with("..."));
    }
}
