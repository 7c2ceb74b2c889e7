use serde::{Deserialize, Serialize};

/// Payload of an AI suggestion job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SuggestionJobMessage {
    pub job_id: String,
    pub suggestion_id: String,
}

impl SuggestionJobMessage {
    /// Trim both identifiers in place.
    pub fn normalize(&mut self) {
        self.job_id = self.job_id.trim().to_string();
        self.suggestion_id = self.suggestion_id.trim().to_string();
    }

    pub fn is_complete(&self) -> bool {
        !self.job_id.is_empty() && !self.suggestion_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_camel_case_and_trims() {
        let mut job: SuggestionJobMessage =
            serde_json::from_str(r#"{"jobId":" aj_1 ","suggestionId":"as_1\n"}"#).unwrap();
        job.normalize();
        assert_eq!(job.job_id, "aj_1");
        assert_eq!(job.suggestion_id, "as_1");
        assert!(job.is_complete());
    }

    #[test]
    fn blank_identifiers_are_incomplete() {
        let mut job: SuggestionJobMessage = serde_json::from_str(r#"{"jobId":"aj_1"}"#).unwrap();
        job.normalize();
        assert!(!job.is_complete());
    }
}
