//! Execution plans and their local recovery cache.

mod cache;

pub use cache::{CacheError, WorkflowSessionCache};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One step of a backend-produced execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

/// Ordered steps the backend intends to run. Display-only on this side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
}

/// Step as the backend sends it; ids may be numeric and the label goes by
/// several names.
#[derive(Deserialize)]
struct WireStep {
    #[serde(default)]
    id: Option<Value>,
    title: Option<String>,
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    tool: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WirePlan {
    Steps(Vec<WireStep>),
    Object { steps: Vec<WireStep> },
}

impl ExecutionPlan {
    /// Accepts either a bare step list or `{"steps": [...]}`.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let wire = match serde_json::from_value::<WirePlan>(value)? {
            WirePlan::Steps(steps) | WirePlan::Object { steps } => steps,
        };

        let steps = wire
            .into_iter()
            .enumerate()
            .map(|(index, step)| {
                let title = step
                    .title
                    .or(step.name)
                    .or(step.description)
                    .ok_or_else(|| {
                        <serde_json::Error as serde::de::Error>::custom(format!(
                            "plan step {index} has no title"
                        ))
                    })?;
                let id = step.id.map(|id| match id {
                    Value::String(s) => s,
                    other => other.to_string(),
                });
                Ok(PlanStep {
                    id,
                    title,
                    status: step.status,
                    tool: step.tool,
                })
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        Ok(Self { steps })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_from_step_list() {
        let plan = ExecutionPlan::from_value(json!([
            {"id": "1", "title": "Read inbox", "tool": "gmail"},
            {"name": "Post summary", "status": "pending"}
        ]))
        .unwrap();

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].tool.as_deref(), Some("gmail"));
        assert_eq!(plan.steps[1].title, "Post summary");
    }

    #[test]
    fn test_plan_from_object() {
        let plan = ExecutionPlan::from_value(json!({"steps": [{"description": "Send"}]})).unwrap();
        assert_eq!(plan.steps[0].title, "Send");
    }

    #[test]
    fn test_plan_prefers_title_and_stringifies_ids() {
        let plan = ExecutionPlan::from_value(json!([
            {"id": 3, "title": "Draft", "description": "Write the draft email"}
        ]))
        .unwrap();
        assert_eq!(plan.steps[0].title, "Draft");
        assert_eq!(plan.steps[0].id.as_deref(), Some("3"));
    }

    #[test]
    fn test_plan_rejects_untitled_step() {
        assert!(ExecutionPlan::from_value(json!([{"id": "1"}])).is_err());
    }
}
