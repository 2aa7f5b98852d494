use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orchestrator::Job;

/// Body of `/execute` and `/iterate` (and their async variants).
/// `maxIterations` is only meaningful for the iterate routes; the async
/// routes require `callbackUrl`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub prompt: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub definition_of_done: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

impl ExecuteRequest {
    pub fn into_job(self, request_id: String) -> Job {
        Job {
            request_id,
            prompt: self.prompt,
            repository: self.repository,
            branch_name: self.branch_name,
            conversation_id: self.conversation_id,
            definition_of_done: self.definition_of_done,
            max_iterations: self.max_iterations,
            cancel: None,
        }
    }
}

/// Immediate reply of the async routes; the Result follows on the webhook.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub accepted: bool,
    pub request_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationResponse {
    pub conversation_id: Uuid,
}
