//! Admission/quota control for Agents
//!
//! The active-Task count is recomputed from an authoritative cluster-wide
//! list on every check; nothing is reserved in memory, so the accounting
//! survives controller restarts. Two Tasks racing for the last slot may both
//! observe capacity and both be admitted transiently: the quota is an
//! advisory bound under race, and the overshoot self-corrects on the next
//! reconcile pass.

use crate::crds::{Agent, Task};
use crate::tasks::types::Result;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use regex::Regex;
use tracing::debug;

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Capacity available; the Task may transition to Admitted
    Admit,
    /// The Agent is at its ceiling; retry with backoff
    Defer { active: usize, limit: i64 },
    /// The Task's namespace is outside the Agent's allow-list; terminal
    NotAllowed,
}

/// Compile one namespace glob into an anchored regex. Only `*` is a
/// metacharacter; everything else matches literally.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).ok()
}

/// Whether `namespace` matches the Agent's allow-list. An empty list allows
/// every namespace.
pub fn namespace_allowed(patterns: &[String], namespace: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns
        .iter()
        .filter_map(|p| glob_to_regex(p))
        .any(|re| re.is_match(namespace))
}

/// Whether `candidate` holds a slot on the Agent identified by
/// `(agent_name, agent_namespace)`. Pending Tasks hold no slot: they are the
/// ones waiting for one.
fn holds_slot_on(candidate: &Task, agent_name: &str, agent_namespace: &str) -> bool {
    let Some(candidate_ns) = candidate.namespace() else {
        return false;
    };
    candidate.spec.agent_ref.name == agent_name
        && candidate.spec.agent_ref.namespace_or(&candidate_ns) == agent_namespace
        && candidate.phase().holds_slot()
}

/// Pure admission check over an already-listed Task set.
///
/// `tasks` is the cluster-wide list; the requesting `task` itself is skipped
/// by uid so a re-entrant check never counts the requester against its own
/// quota.
pub fn evaluate(agent: &Agent, agent_namespace: &str, task: &Task, tasks: &[Task]) -> AdmissionDecision {
    let task_namespace = task.namespace().unwrap_or_default();

    if !namespace_allowed(&agent.spec.allowed_namespaces, &task_namespace) {
        return AdmissionDecision::NotAllowed;
    }

    let Some(limit) = agent.spec.quota_limit() else {
        return AdmissionDecision::Admit;
    };

    let active = tasks
        .iter()
        .filter(|candidate| candidate.metadata.uid != task.metadata.uid)
        .filter(|candidate| holds_slot_on(candidate, &agent.name_any(), agent_namespace))
        .count();

    if (active as i64) < limit {
        AdmissionDecision::Admit
    } else {
        AdmissionDecision::Defer { active, limit }
    }
}

/// List referencing Tasks cluster-wide and evaluate admission for `task`.
pub async fn check_admission(
    client: &Client,
    agent: &Agent,
    agent_namespace: &str,
    task: &Task,
) -> Result<AdmissionDecision> {
    let tasks: Api<Task> = Api::all(client.clone());
    let list = tasks.list(&ListParams::default()).await?;
    let decision = evaluate(agent, agent_namespace, task, &list.items);
    debug!(
        task = %task.name_any(),
        agent = %agent.name_any(),
        ?decision,
        "admission check"
    );
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{AgentRef, AgentSpec, TaskPhase, TaskSpec, TaskStatus};

    fn agent(max: Option<i64>, allowed: &[&str]) -> Agent {
        let mut agent = Agent::new(
            "builder",
            AgentSpec {
                max_concurrent_tasks: max,
                allowed_namespaces: allowed.iter().map(|s| (*s).to_string()).collect(),
                ..serde_json::from_value(serde_json::json!({})).unwrap()
            },
        );
        agent.metadata.namespace = Some("agents".into());
        agent
    }

    fn task(name: &str, namespace: &str, phase: Option<TaskPhase>) -> Task {
        let mut task = Task::new(
            name,
            TaskSpec {
                agent_ref: AgentRef {
                    name: "builder".into(),
                    namespace: Some("agents".into()),
                },
                template_ref: None,
                description: String::new(),
                context: Vec::new(),
            },
        );
        task.metadata.namespace = Some(namespace.into());
        task.metadata.uid = Some(format!("uid-{name}"));
        task.status = phase.map(|p| TaskStatus {
            phase: Some(p),
            ..TaskStatus::default()
        });
        task
    }

    #[test]
    fn test_namespace_globs() {
        assert!(namespace_allowed(&[], "anything"));
        assert!(namespace_allowed(&["team-*".into()], "team-a"));
        assert!(namespace_allowed(&["*".into()], "anything"));
        assert!(!namespace_allowed(&["team-*".into()], "ops"));
        // literal dots are not wildcards
        assert!(!namespace_allowed(&["team.a".into()], "teamxa"));
        assert!(namespace_allowed(&["team.a".into()], "team.a"));
    }

    #[test]
    fn test_unbounded_agent_always_admits() {
        let agent = agent(None, &[]);
        let requester = task("t1", "team-a", Some(TaskPhase::Pending));
        let peers: Vec<Task> = (0..20)
            .map(|i| task(&format!("p{i}"), "team-a", Some(TaskPhase::Running)))
            .collect();
        assert_eq!(
            evaluate(&agent, "agents", &requester, &peers),
            AdmissionDecision::Admit
        );
    }

    #[test]
    fn test_quota_ceiling_defers() {
        let agent = agent(Some(1), &[]);
        let requester = task("t2", "team-a", Some(TaskPhase::Pending));
        let peers = vec![task("t1", "team-a", Some(TaskPhase::Running))];
        assert_eq!(
            evaluate(&agent, "agents", &requester, &peers),
            AdmissionDecision::Defer {
                active: 1,
                limit: 1
            }
        );
    }

    #[test]
    fn test_pending_peers_do_not_consume_slots() {
        // Two Pending Tasks racing for a single slot must not deadlock each
        // other: neither holds the slot yet.
        let agent = agent(Some(1), &[]);
        let t1 = task("t1", "team-a", Some(TaskPhase::Pending));
        let t2 = task("t2", "team-a", Some(TaskPhase::Pending));
        let all = vec![t1.clone(), t2.clone()];
        assert_eq!(evaluate(&agent, "agents", &t1, &all), AdmissionDecision::Admit);
        assert_eq!(evaluate(&agent, "agents", &t2, &all), AdmissionDecision::Admit);
    }

    #[test]
    fn test_terminal_peers_free_their_slot() {
        let agent = agent(Some(1), &[]);
        let requester = task("t2", "team-a", Some(TaskPhase::Pending));
        for done in [TaskPhase::Succeeded, TaskPhase::Failed, TaskPhase::Stopped] {
            let peers = vec![task("t1", "team-a", Some(done))];
            assert_eq!(
                evaluate(&agent, "agents", &requester, &peers),
                AdmissionDecision::Admit,
                "peer in {done} should not hold a slot"
            );
        }
    }

    #[test]
    fn test_requester_does_not_count_itself() {
        let agent = agent(Some(1), &[]);
        // Re-entrant check after a crash: the requester was already Admitted.
        let requester = task("t1", "team-a", Some(TaskPhase::Admitted));
        let all = vec![requester.clone()];
        assert_eq!(
            evaluate(&agent, "agents", &requester, &all),
            AdmissionDecision::Admit
        );
    }

    #[test]
    fn test_disallowed_namespace_is_not_a_deferral() {
        let agent = agent(Some(1), &["team-*"]);
        let requester = task("t1", "ops", Some(TaskPhase::Pending));
        assert_eq!(
            evaluate(&agent, "agents", &requester, &[]),
            AdmissionDecision::NotAllowed
        );
    }

    #[test]
    fn test_tasks_for_other_agents_are_ignored() {
        let agent = agent(Some(1), &[]);
        let requester = task("t1", "team-a", Some(TaskPhase::Pending));
        let mut other = task("o1", "team-a", Some(TaskPhase::Running));
        other.spec.agent_ref.name = "reviewer".into();
        let mut other_ns = task("o2", "team-a", Some(TaskPhase::Running));
        other_ns.spec.agent_ref.namespace = Some("elsewhere".into());
        assert_eq!(
            evaluate(&agent, "agents", &requester, &[other, other_ns]),
            AdmissionDecision::Admit
        );
    }
}
