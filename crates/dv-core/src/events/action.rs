use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dispatch priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// An action dispatched through the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Dispatch-scoped identifier
    pub id: String,

    /// Action type used to route to handlers
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub payload: Value,

    #[serde(default)]
    pub priority: Priority,
}

impl Action {
    /// Create an action with a generated id and no payload
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload: Value::Null,
            priority: Priority::Normal,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Outcome of a dispatched action. Produced exactly once per dispatch.
#[derive(Debug, Clone, Default)]
pub struct ActionResult {
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<Arc<anyhow::Error>>,
    pub cancelled: bool,

    /// No handler was registered for the action type
    pub unhandled: bool,
}

impl ActionResult {
    pub fn succeeded(value: Value) -> Self {
        Self {
            success: true,
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn failed(error: anyhow::Error) -> Self {
        Self {
            error: Some(Arc::new(error)),
            ..Default::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Default::default()
        }
    }

    pub fn unhandled() -> Self {
        Self {
            unhandled: true,
            ..Default::default()
        }
    }

    /// Combine the outcomes of every handler registered for a type.
    ///
    /// Success requires all handlers to succeed. The value is the first
    /// handler's, the error the first failure in registration order.
    pub(crate) fn from_outcomes(outcomes: Vec<anyhow::Result<Value>>) -> Self {
        let mut value = None;
        let mut error = None;
        for outcome in outcomes {
            match outcome {
                Ok(v) => {
                    if value.is_none() {
                        value = Some(v);
                    }
                }
                Err(e) => {
                    if error.is_none() {
                        error = Some(Arc::new(e));
                    }
                }
            }
        }

        match error {
            Some(error) => Self {
                value,
                error: Some(error),
                ..Default::default()
            },
            None => Self {
                success: true,
                value,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_action_deserializes_from_wire_shape() {
        let action: Action = serde_json::from_value(json!({
            "id": "a1",
            "type": "APPLY_FILTER",
            "payload": {"loja": "bdn"},
            "priority": "HIGH"
        }))
        .unwrap();

        assert_eq!(action.kind, "APPLY_FILTER");
        assert_eq!(action.priority, Priority::High);
        assert_eq!(action.payload["loja"], "bdn");
    }

    #[test]
    fn test_from_outcomes_first_failure_wins() {
        let result = ActionResult::from_outcomes(vec![
            Ok(json!(1)),
            Err(anyhow::anyhow!("first")),
            Err(anyhow::anyhow!("second")),
        ]);

        assert!(!result.success);
        assert_eq!(result.value, Some(json!(1)));
        assert_eq!(result.error.unwrap().to_string(), "first");
    }
}
