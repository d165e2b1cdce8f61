//! Strategy Router
//!
//! Picks one agent among scored candidates:
//! - least-loaded: highest score wins (ties keep list order)
//! - first-available: first idle agent
//! - round-robin: rotates through candidates across calls
//!
//! When the requested strategy finds nothing, the fallback chain
//! (least-loaded, then first-available) is tried before giving up.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

use super::{AgentRouter, AgentState, RoutingContext, RoutingDecision, ScoredAgent};
use crate::workflow::RoutingStrategy;

const FALLBACK_ORDER: &[RoutingStrategy] =
    &[RoutingStrategy::LeastLoaded, RoutingStrategy::FirstAvailable];

/// Default router implementing all routing strategies.
#[derive(Debug, Default)]
pub struct StrategyRouter {
    cursor: AtomicUsize,
}

impl StrategyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn select<'a>(&self, agents: &[&'a ScoredAgent], strategy: RoutingStrategy) -> Option<&'a ScoredAgent> {
        match strategy {
            RoutingStrategy::LeastLoaded => agents.iter().copied().fold(None, |best, agent| match best {
                Some(b) if b.score >= agent.score => Some(b),
                _ => Some(agent),
            }),
            RoutingStrategy::FirstAvailable => agents
                .iter()
                .copied()
                .find(|agent| agent.state == AgentState::Idle),
            RoutingStrategy::RoundRobin => {
                if agents.is_empty() {
                    return None;
                }
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % agents.len();
                Some(agents[index])
            }
        }
    }
}

impl AgentRouter for StrategyRouter {
    fn route(
        &self,
        candidates: &[ScoredAgent],
        strategy: RoutingStrategy,
        context: &RoutingContext,
    ) -> RoutingDecision {
        let eligible: Vec<&ScoredAgent> = candidates.iter().filter(|a| !a.excluded).collect();

        if let Some(agent) = self.select(&eligible, strategy) {
            debug!(
                "Routed step '{}' to {} via {}",
                context.step_id, agent.pane_id, strategy
            );
            return RoutingDecision {
                selected: Some(agent.clone()),
                reason: format!("{} strategy selected pane {}", strategy, agent.pane_id),
                fallback_used: false,
            };
        }

        for fallback in FALLBACK_ORDER.iter().filter(|s| **s != strategy) {
            if let Some(agent) = self.select(&eligible, *fallback) {
                debug!(
                    "Routed step '{}' to {} via fallback {}",
                    context.step_id, agent.pane_id, fallback
                );
                return RoutingDecision {
                    selected: Some(agent.clone()),
                    reason: format!("fallback to {}", fallback),
                    fallback_used: true,
                };
            }
        }

        RoutingDecision {
            selected: None,
            reason: format!(
                "no suitable agent found among {} candidate(s)",
                candidates.len()
            ),
            fallback_used: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, state: AgentState, score: f64, excluded: bool) -> ScoredAgent {
        ScoredAgent {
            pane_id: id.to_string(),
            agent_type: "claude".to_string(),
            pane_index: 0,
            state,
            score,
            excluded,
            exclude_reason: None,
        }
    }

    #[test]
    fn test_least_loaded_picks_highest_score() {
        let router = StrategyRouter::new();
        let candidates = vec![
            agent("%1", AgentState::Busy, 10.0, false),
            agent("%2", AgentState::Idle, 100.0, false),
            agent("%3", AgentState::Idle, 100.0, false),
            agent("%4", AgentState::Idle, 500.0, true),
        ];

        let decision = router.route(&candidates, RoutingStrategy::LeastLoaded, &RoutingContext::default());
        assert_eq!(decision.selected.unwrap().pane_id, "%2");
        assert!(!decision.fallback_used);
    }

    #[test]
    fn test_first_available_falls_back() {
        let router = StrategyRouter::new();
        let candidates = vec![
            agent("%1", AgentState::Busy, 10.0, false),
            agent("%2", AgentState::Busy, 20.0, false),
        ];

        let decision =
            router.route(&candidates, RoutingStrategy::FirstAvailable, &RoutingContext::default());
        assert_eq!(decision.selected.unwrap().pane_id, "%2");
        assert!(decision.fallback_used);
        assert!(decision.reason.contains("least-loaded"));
    }

    #[test]
    fn test_round_robin_rotates() {
        let router = StrategyRouter::new();
        let candidates = vec![
            agent("%1", AgentState::Idle, 1.0, false),
            agent("%2", AgentState::Idle, 1.0, false),
        ];
        let ctx = RoutingContext::default();

        let picks: Vec<String> = (0..3)
            .map(|_| {
                router
                    .route(&candidates, RoutingStrategy::RoundRobin, &ctx)
                    .selected
                    .unwrap()
                    .pane_id
            })
            .collect();
        assert_eq!(picks, vec!["%1", "%2", "%1"]);
    }

    #[test]
    fn test_nothing_eligible() {
        let router = StrategyRouter::new();
        let candidates = vec![agent("%1", AgentState::Idle, 100.0, true)];

        let decision = router.route(&candidates, RoutingStrategy::LeastLoaded, &RoutingContext::default());
        assert!(decision.selected.is_none());
        assert!(decision.reason.contains("no suitable agent"));
    }
}
