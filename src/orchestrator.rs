use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::DroverError;
use crate::memory::{ConversationMemory, Role, compose_prompt, render_messages};
use crate::reviewer::{ReviewReport, Reviewer};
use crate::runner::{CommandRunner, Invocation, InvocationOutcome};

/// Fixed resume text when the reviewer supplied no continuation prompt.
const FALLBACK_RESUME_PROMPT: &str =
    "Continue the previous task. Debug and resolve the remaining issues, then \
     finish the work described earlier.";

/// Tag under which the reviewer verdict enters conversation memory. This is
/// the only reviewer text that ever does.
const REVIEW_VERDICT_TAG: &str = "[Review Agent Response]";

/// Context-window-overflow signatures: ordered word sequences matched
/// case-insensitively with arbitrary gaps between the words.
const OVERFLOW_PATTERNS: &[&[&str]] = &[
    &["context", "window", "too", "large"],
    &["context", "length", "exceeded"],
    &["token", "limit", "exceeded"],
    &["maximum", "context", "length"],
    &["context", "too", "long"],
];

/// Worker output fragments that indicate credential problems worth a
/// dedicated log event.
const API_KEY_ERROR_PATTERNS: &[&str] = &[
    "invalid api key",
    "api key not found",
    "authentication failed",
    "not logged in",
    "unauthorized",
];

/// One client request, created at HTTP ingress and destroyed when its
/// result is dispatched.
#[derive(Debug, Clone)]
pub struct Job {
    pub request_id: String,
    pub prompt: String,
    pub repository: Option<String>,
    /// Accepted for observability only; branch switching is the caller's
    /// business.
    pub branch_name: Option<String>,
    pub conversation_id: Option<Uuid>,
    pub definition_of_done: Option<String>,
    pub max_iterations: Option<u32>,
    pub cancel: Option<CancellationToken>,
}

/// Final result of a Job, returned exactly once.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub success: bool,
    pub request_id: String,
    pub conversation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_justification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_output: Option<String>,
}

/// Drives Jobs to a Result: execute-once and iterate-to-completion.
///
/// Owns live Job state exclusively; the runner, memory, and reviewer below
/// it never hold references back.
pub struct ExecutionOrchestrator {
    runner: Arc<CommandRunner>,
    memory: Arc<ConversationMemory>,
    reviewer: Reviewer,
    config: Arc<Config>,
}

impl ExecutionOrchestrator {
    pub fn new(
        runner: Arc<CommandRunner>,
        memory: Arc<ConversationMemory>,
        reviewer: Reviewer,
        config: Arc<Config>,
    ) -> Self {
        Self {
            runner,
            memory,
            reviewer,
            config,
        }
    }

    /// Single worker invocation with memory context, no review loop.
    pub async fn execute_once(&self, job: &Job) -> Result<RunResult, DroverError> {
        let start = Instant::now();
        let repo = self.resolve_repository(job).await?;
        if let Some(ref branch) = job.branch_name {
            tracing::info!(branch = %branch, request_id = %job.request_id, "branch noted (not acted on)");
        }

        let conversation_id = self
            .memory
            .resolve_conversation_id(job.conversation_id)
            .await;
        let context = render_messages(&self.memory.render_context(conversation_id).await);
        let full_prompt = compose_prompt(&context, &job.prompt);
        // The plain request goes to memory, never the rendered full prompt:
        // context is recomputed each turn and must not be duplicated in
        // storage.
        self.memory
            .append(conversation_id, Role::User, &job.prompt)
            .await;

        let (outcome, invocation_error) = self
            .run_worker(full_prompt, &repo, job.cancel.clone())
            .await?;
        self.record_assistant_turn(conversation_id, &outcome, &repo)
            .await;

        Ok(RunResult {
            success: outcome.success() && invocation_error.is_none(),
            request_id: job.request_id.clone(),
            conversation_id,
            exit_code: outcome.exit_code,
            output: assistant_view(&outcome),
            error: invocation_error,
            duration_ms: start.elapsed().as_millis() as u64,
            iterations: None,
            review_justification: None,
            original_output: None,
        })
    }

    /// Review-and-iterate loop: run the worker, review the output, resume
    /// with a continuation prompt until complete, escalated, or the
    /// iteration budget is spent.
    pub async fn iterate_to_completion(&self, job: &Job) -> Result<RunResult, DroverError> {
        let start = Instant::now();
        let repo = self.resolve_repository(job).await?;
        let max_iterations = job.max_iterations.unwrap_or(self.config.max_iterations);

        let conversation_id = self
            .memory
            .resolve_conversation_id(job.conversation_id)
            .await;
        let context = render_messages(&self.memory.render_context(conversation_id).await);
        let full_prompt = compose_prompt(&context, &job.prompt);
        self.memory
            .append(conversation_id, Role::User, &job.prompt)
            .await;

        let (mut outcome, mut invocation_error) = self
            .run_worker(full_prompt, &repo, job.cancel.clone())
            .await?;

        if max_iterations == 0 {
            // The initial result verbatim; the reviewer is never consulted.
            self.record_assistant_turn(conversation_id, &outcome, &repo)
                .await;
            return Ok(RunResult {
                success: outcome.success() && invocation_error.is_none(),
                request_id: job.request_id.clone(),
                conversation_id,
                exit_code: outcome.exit_code,
                output: assistant_view(&outcome),
                error: invocation_error,
                duration_ms: start.elapsed().as_millis() as u64,
                iterations: Some(0),
                review_justification: None,
                original_output: None,
            });
        }

        let mut iterations = 0u32;
        let mut iteration_error: Option<String> = None;
        let mut review_justification: Option<String> = None;
        let mut original_output: Option<String> = None;
        let mut code_complete = false;
        // The latest outcome's assistant turn is appended exactly once, at
        // the top of the pass that reviews it (or after the loop when the
        // budget ran out right after a respawn).
        let mut recorded = false;

        for i in 1..=max_iterations {
            iterations = i;

            if !recorded {
                self.record_assistant_turn(conversation_id, &outcome, &repo)
                    .await;
                recorded = true;
            }
            original_output = Some(outcome.stdout.clone());

            let review_input = assistant_view(&outcome);
            let report = match self
                .reviewer
                .review(
                    &review_input,
                    &repo,
                    Some(&job.prompt),
                    job.definition_of_done.as_deref(),
                    self.config.iterate_timeout,
                )
                .await
            {
                Ok(review) => match review.report {
                    Some(report) => report,
                    None => fallback_report(&outcome, &review.raw_output),
                },
                Err(e) => {
                    tracing::warn!(iteration = i, "review call failed: {e}");
                    fallback_report(&outcome, &e.to_string())
                }
            };
            tracing::info!(
                iteration = i,
                code_complete = report.code_complete,
                break_iteration = report.break_iteration,
                "review verdict"
            );

            // The verdict JSON is the only reviewer output that enters
            // memory; its free-form reasoning never does.
            let verdict_json =
                serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_string());
            self.memory
                .append(
                    conversation_id,
                    Role::Assistant,
                    &format!("{REVIEW_VERDICT_TAG} {verdict_json}"),
                )
                .await;

            // Escalation wins over completion when both flags are set.
            if report.break_iteration {
                iteration_error = Some(report.justification.clone());
                review_justification = Some(report.justification);
                break;
            }
            if report.code_complete {
                code_complete = true;
                break;
            }

            let resume_text = report
                .continuation_prompt
                .clone()
                .unwrap_or_else(|| FALLBACK_RESUME_PROMPT.to_string());
            // Context is rendered before the resume text is stored, same as
            // the initial turn, so the current request is never duplicated
            // inside its own context. Only the new resume text is stored.
            let context = render_messages(&self.memory.render_context(conversation_id).await);
            self.memory
                .append(conversation_id, Role::User, &resume_text)
                .await;
            let full_prompt = compose_prompt(&context, &resume_text);
            match self
                .run_worker(full_prompt, &repo, job.cancel.clone())
                .await
            {
                Ok((next, err)) => {
                    outcome = next;
                    recorded = false;
                    invocation_error = err;
                }
                Err(e) => {
                    // Spawn failure or a timeout that left nothing behind:
                    // there is nothing for the reviewer to look at.
                    iteration_error = Some(e.user_message());
                    tracing::warn!(iteration = i, "worker respawn failed: {e}");
                    break;
                }
            }
        }

        if !recorded {
            self.record_assistant_turn(conversation_id, &outcome, &repo)
                .await;
        }

        let error = iteration_error.clone().or_else(|| {
            if code_complete {
                invocation_error.clone()
            } else {
                Some(format!(
                    "exhausted {max_iterations} iterations without completion"
                ))
            }
        });
        let success = code_complete && outcome.success() && iteration_error.is_none();
        let stopped_on_review = review_justification.is_some();

        Ok(RunResult {
            success,
            request_id: job.request_id.clone(),
            conversation_id,
            exit_code: outcome.exit_code,
            output: assistant_view(&outcome),
            error,
            duration_ms: start.elapsed().as_millis() as u64,
            iterations: Some(iterations),
            review_justification,
            original_output: if stopped_on_review {
                original_output
            } else {
                None
            },
        })
    }

    /// Current gate occupancy, surfaced by the health endpoint.
    pub fn queue_status(&self) -> crate::runner::QueueStatus {
        self.runner.queue_status()
    }

    async fn resolve_repository(&self, job: &Job) -> Result<PathBuf, DroverError> {
        if job.prompt.trim().is_empty() {
            return Err(DroverError::EmptyPrompt);
        }
        let Some(ref name) = job.repository else {
            return Ok(self.config.repositories_root.clone());
        };

        // Canonicalize both sides so a symlinked or `..`-laden name cannot
        // escape the repositories root.
        let root = tokio::fs::canonicalize(&self.config.repositories_root)
            .await
            .map_err(|_| DroverError::RepositoryNotFound(name.clone()))?;
        let path = tokio::fs::canonicalize(root.join(name))
            .await
            .map_err(|_| DroverError::RepositoryNotFound(name.clone()))?;
        if !path.starts_with(&root) || !path.is_dir() {
            return Err(DroverError::RepositoryNotFound(name.clone()));
        }
        Ok(path)
    }

    /// Invoke the worker. Invocation failures that carried partial output
    /// are folded into a synthetic outcome so the caller can feed the
    /// partial text onward; failures with nothing captured propagate.
    async fn run_worker(
        &self,
        prompt: String,
        repo: &Path,
        cancel: Option<CancellationToken>,
    ) -> Result<(InvocationOutcome, Option<String>), DroverError> {
        let invocation = Invocation {
            program: self.config.worker_cli_path.clone(),
            args: vec![
                "--model".to_string(),
                "auto".to_string(),
                "--print".to_string(),
                "--force".to_string(),
                prompt,
            ],
            working_directory: repo.to_path_buf(),
            hard_timeout: self.config.hard_timeout,
            idle_timeout: self.config.idle_timeout,
            cancel,
        };
        match self.runner.execute(invocation).await {
            Ok(outcome) => Ok((outcome, None)),
            Err(e @ DroverError::Spawn { .. }) => Err(e),
            // Cancellation short-circuits the loop instead of feeding the
            // reviewer.
            Err(e @ DroverError::Cancelled { .. }) => Err(e),
            Err(e) => match e.partial_output() {
                Some(partial) if !partial.is_empty() => {
                    let outcome = InvocationOutcome {
                        exit_code: None,
                        stdout: partial.stdout.clone(),
                        stderr: partial.stderr.clone(),
                    };
                    Ok((outcome, Some(e.to_string())))
                }
                _ => Err(e),
            },
        }
    }

    /// Append the assistant turn (unless empty), then scan the combined
    /// output for context-window overflow and credential diagnostics.
    async fn record_assistant_turn(
        &self,
        conversation_id: Uuid,
        outcome: &InvocationOutcome,
        repo: &Path,
    ) {
        let text = assistant_view(outcome);
        if !text.is_empty() {
            self.memory
                .append(conversation_id, Role::Assistant, &text)
                .await;
        }

        let combined = combined_output(outcome);
        if detects_context_overflow(&combined) {
            tracing::warn!(%conversation_id, "context window overflow detected — summarizing");
            self.summarize_conversation(conversation_id, repo).await;
        }
        let lower = combined.to_lowercase();
        if let Some(pattern) = API_KEY_ERROR_PATTERNS.iter().find(|p| lower.contains(**p)) {
            tracing::error!(pattern, "worker output reports a credential problem");
        }
    }

    /// Compress the conversation in place. Failures are logged and
    /// swallowed: the next turn may still overflow, but the loop must not
    /// break.
    async fn summarize_conversation(&self, conversation_id: Uuid, repo: &Path) {
        let runner = self.runner.clone();
        let program = self.config.worker_cli_path.clone();
        let working_directory = repo.to_path_buf();
        let timeout = self.config.iterate_timeout;

        let result = self
            .memory
            .summarize(conversation_id, |context_text| async move {
                let prompt = format!(
                    "Summarize the conversation below to about one third of its \
                     length. Preserve every decision, requirement, file reference, \
                     and open item; drop pleasantries and redundant output. Reply \
                     with the summary text only.\n\n{context_text}"
                );
                let outcome = runner
                    .execute(Invocation {
                        program,
                        args: vec![
                            "--model".to_string(),
                            "auto".to_string(),
                            "--print".to_string(),
                            prompt,
                        ],
                        working_directory,
                        hard_timeout: timeout,
                        idle_timeout: timeout,
                        cancel: None,
                    })
                    .await?;
                if outcome.success() && !outcome.stdout.trim().is_empty() {
                    Ok(outcome.stdout.trim().to_string())
                } else {
                    Err(DroverError::Other(
                        "summarizer returned no usable text".to_string(),
                    ))
                }
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(%conversation_id, "summarization failed (continuing): {e}");
        }
    }
}

/// Anti-livelock fallback when no verdict could be parsed or the review
/// call failed: a successful worker run with output is inferred complete;
/// anything else escalates with the raw reviewer output as justification.
pub fn fallback_report(outcome: &InvocationOutcome, raw: &str) -> ReviewReport {
    if outcome.success() && !assistant_view(outcome).is_empty() {
        ReviewReport {
            code_complete: true,
            break_iteration: false,
            justification: "review verdict unavailable; inferred completion from a \
                            successful worker run"
                .to_string(),
            continuation_prompt: None,
        }
    } else {
        ReviewReport {
            code_complete: false,
            break_iteration: true,
            justification: raw.to_string(),
            continuation_prompt: None,
        }
    }
}

/// The assistant turn as memory and the caller see it: stdout when
/// non-empty, else the combined output so diagnostic traces survive.
pub fn assistant_view(outcome: &InvocationOutcome) -> String {
    if outcome.stdout.is_empty() {
        outcome.stderr.clone()
    } else {
        outcome.stdout.clone()
    }
}

fn combined_output(outcome: &InvocationOutcome) -> String {
    if outcome.stderr.is_empty() {
        outcome.stdout.clone()
    } else if outcome.stdout.is_empty() {
        outcome.stderr.clone()
    } else {
        format!("{}\n{}", outcome.stdout, outcome.stderr)
    }
}

/// True when the output matches any overflow signature: every word of a
/// pattern present, in order, any gap between them.
pub fn detects_context_overflow(output: &str) -> bool {
    let lower = output.to_lowercase();
    OVERFLOW_PATTERNS.iter().any(|words| {
        let mut pos = 0usize;
        words.iter().all(|word| match lower[pos..].find(word) {
            Some(idx) => {
                pos += idx + word.len();
                true
            }
            None => false,
        })
    })
}
