//! TaskTemplate expansion
//!
//! A Task that names a `templateRef` has the template's fields value-merged
//! under its own before reconciliation. Task-level fields always win;
//! template context items are prepended so the Task's own items can shadow
//! the template's paths.

use crate::crds::{Task, TaskSpec, TaskTemplate};
use crate::tasks::types::{Error, Result};
use kube::{Api, Client, ResourceExt};

/// Merge `template` under `spec`, returning the effective spec.
pub fn merge_template(spec: &TaskSpec, template: &TaskTemplate) -> TaskSpec {
    let mut merged = spec.clone();

    // The CRD requires agentRef on the Task, but an empty name means
    // "take it from the template".
    if merged.agent_ref.name.is_empty() {
        if let Some(agent_ref) = &template.spec.agent_ref {
            merged.agent_ref = agent_ref.clone();
        }
    }

    if merged.description.is_empty() {
        if let Some(description) = &template.spec.description {
            merged.description = description.clone();
        }
    }

    if !template.spec.context.is_empty() {
        let mut context = template.spec.context.clone();
        context.extend(merged.context);
        merged.context = context;
    }

    merged
}

/// Fetch the referenced template (same namespace as the Task) and return the
/// effective spec. A Task without `templateRef` passes through unchanged; a
/// dangling reference is a configuration error surfaced on the Task.
pub async fn effective_spec(client: &Client, task: &Task) -> Result<TaskSpec> {
    let Some(template_name) = &task.spec.template_ref else {
        return Ok(task.spec.clone());
    };
    let namespace = task.namespace().ok_or(Error::MissingObjectKey)?;
    let templates: Api<TaskTemplate> = Api::namespaced(client.clone(), &namespace);
    match templates.get(template_name).await {
        Ok(template) => Ok(merge_template(&task.spec, &template)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::ResolutionError(format!(
            "TaskTemplate '{template_name}' not found in namespace '{namespace}'"
        ))),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{AgentRef, ContextItem, TaskTemplateSpec};

    fn template() -> TaskTemplate {
        TaskTemplate::new(
            "deploy",
            TaskTemplateSpec {
                agent_ref: Some(AgentRef {
                    name: "deployer".into(),
                    namespace: Some("agents".into()),
                }),
                description: Some("template description".into()),
                context: vec![ContextItem::Text {
                    path: "policy.md".into(),
                    content: "from template".into(),
                }],
            },
        )
    }

    fn spec(agent: &str, description: &str) -> TaskSpec {
        TaskSpec {
            agent_ref: AgentRef {
                name: agent.into(),
                namespace: None,
            },
            template_ref: Some("deploy".into()),
            description: description.into(),
            context: vec![ContextItem::Text {
                path: "notes.md".into(),
                content: "from task".into(),
            }],
        }
    }

    #[test]
    fn test_task_fields_win() {
        let merged = merge_template(&spec("builder", "task description"), &template());
        assert_eq!(merged.agent_ref.name, "builder");
        assert_eq!(merged.description, "task description");
    }

    #[test]
    fn test_template_fills_unset_fields() {
        let merged = merge_template(&spec("", ""), &template());
        assert_eq!(merged.agent_ref.name, "deployer");
        assert_eq!(merged.agent_ref.namespace.as_deref(), Some("agents"));
        assert_eq!(merged.description, "template description");
    }

    #[test]
    fn test_template_context_is_prepended() {
        let merged = merge_template(&spec("builder", "d"), &template());
        assert_eq!(merged.context.len(), 2);
        assert_eq!(merged.context[0].declared_path(), "policy.md");
        assert_eq!(merged.context[1].declared_path(), "notes.md");
    }
}
