use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use crate::error::DroverError;
use crate::orchestrator::RunResult;

/// Total budget for one webhook delivery, independent of Job timeouts.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// The shared secret travels under two redundant header names for receiver
/// compatibility.
const SECRET_HEADERS: [&str; 2] = ["x-webhook-secret", "x-drover-secret"];

const USER_AGENT: &str = concat!("drover/", env!("CARGO_PKG_VERSION"));

/// Delivers a Result to exactly one destination: the synchronous HTTP
/// response, or a signed POST to a caller-supplied webhook.
pub struct ResultDispatcher {
    client: reqwest::Client,
    webhook_secret: Option<String>,
}

impl ResultDispatcher {
    pub fn new(webhook_secret: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .expect("reqwest client construction is infallible with these options");
        Self {
            client,
            webhook_secret,
        }
    }

    /// Synchronous path: map an orchestrator outcome to `(status, body)`.
    ///
    /// 200 on success, 422 when the iterate loop stopped without completion
    /// (escalation, review failure, exhausted budget), 400/404 for
    /// validation failures, 500 otherwise. The body always carries both the
    /// (possibly partial) output and the error.
    pub fn respond(
        &self,
        request_id: &str,
        outcome: &Result<RunResult, DroverError>,
    ) -> (StatusCode, serde_json::Value) {
        match outcome {
            Ok(result) => {
                let status = if result.success {
                    StatusCode::OK
                } else if result.iterations.is_some() {
                    StatusCode::UNPROCESSABLE_ENTITY
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                let body = serde_json::to_value(result)
                    .unwrap_or_else(|_| json!({ "success": false, "requestId": request_id }));
                (status, body)
            }
            Err(e) => {
                let status = match e {
                    DroverError::EmptyPrompt => StatusCode::BAD_REQUEST,
                    DroverError::RepositoryNotFound(_) => StatusCode::NOT_FOUND,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let output = e
                    .partial_output()
                    .map(|p| p.combined())
                    .unwrap_or_default();
                let body = json!({
                    "success": false,
                    "requestId": request_id,
                    "output": output,
                    "error": e.user_message(),
                });
                (status, body)
            }
        }
    }

    /// Webhook path: POST the JSON body to the callback URL. Non-2xx and
    /// transport failures are logged and swallowed; delivery must never
    /// fail the Job.
    pub async fn deliver_webhook(&self, callback_url: &str, body: &serde_json::Value) {
        let url = match reqwest::Url::parse(callback_url) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("webhook: invalid callback url: {e}");
                return;
            }
        };
        // A secret embedded in the URL query wins only when none is
        // configured. Never log the URL with the secret still in it.
        let url_secret = url
            .query_pairs()
            .find(|(k, _)| k == "secret")
            .map(|(_, v)| v.to_string());
        let secret = self.webhook_secret.clone().or(url_secret);
        let log_url = redact_secret_param(&url);

        let mut request = self.client.post(url).json(body);
        if let Some(ref secret) = secret {
            for header in SECRET_HEADERS {
                request = request.header(header, secret);
            }
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(url = %log_url, status = %response.status(), "webhook delivered");
            }
            Ok(response) => {
                tracing::warn!(
                    url = %log_url,
                    status = %response.status(),
                    "webhook delivery rejected"
                );
            }
            Err(e) => {
                tracing::warn!(url = %log_url, "webhook delivery failed: {e}");
            }
        }
    }
}

/// Copy of the URL with any `secret` query parameter removed, safe to log.
pub fn redact_secret_param(url: &reqwest::Url) -> String {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "secret")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut clean = url.clone();
    clean.set_query(None);
    if !kept.is_empty() {
        clean.query_pairs_mut().extend_pairs(kept);
    }
    clean.to_string()
}
