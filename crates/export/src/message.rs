use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalised export request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportMessage {
    pub task_id: String,
    pub actor_id: String,
    pub entities: Vec<String>,
    pub window_from: Option<DateTime<Utc>>,
    pub window_to: Option<DateTime<Utc>>,
    pub idempotency_key: String,
    pub queued_at: Option<DateTime<Utc>>,
}

impl ExportMessage {
    /// Trim identifiers and entity names, dropping blank entities.
    pub fn normalized(self) -> Self {
        Self {
            task_id: self.task_id.trim().to_string(),
            actor_id: self.actor_id.trim().to_string(),
            entities: self
                .entities
                .iter()
                .map(|entity| entity.trim())
                .filter(|entity| !entity.is_empty())
                .map(str::to_string)
                .collect(),
            idempotency_key: self.idempotency_key.trim().to_string(),
            ..self
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.task_id.is_empty() && !self.actor_id.is_empty() && !self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_drops_blank_entities() {
        let message: ExportMessage = serde_json::from_str(
            r#"{"taskId":" task_1 ","actorId":"staff_1","entities":[" orders ","", "  ","users"],
                "windowFrom":"2024-05-01T00:00:00Z","idempotencyKey":" k1 ",
                "queuedAt":"2024-05-02T09:30:00Z"}"#,
        )
        .unwrap();
        let message = message.normalized();

        assert_eq!(message.task_id, "task_1");
        assert_eq!(message.entities, vec!["orders", "users"]);
        assert_eq!(message.idempotency_key, "k1");
        assert!(message.window_from.is_some());
        assert_eq!(message.window_to, None);
        assert!(message.is_valid());
    }

    #[test]
    fn requires_task_actor_and_entities() {
        let base = ExportMessage {
            task_id: "task_1".to_string(),
            actor_id: "staff_1".to_string(),
            entities: vec!["orders".to_string()],
            ..Default::default()
        };
        assert!(base.is_valid());
        assert!(!ExportMessage { task_id: String::new(), ..base.clone() }.is_valid());
        assert!(!ExportMessage { actor_id: String::new(), ..base.clone() }.is_valid());
        assert!(
            !ExportMessage { entities: vec![" ".to_string()], ..base }
                .normalized()
                .is_valid()
        );
    }
}
