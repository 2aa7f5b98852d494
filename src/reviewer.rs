use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DroverError;
use crate::runner::{CommandRunner, Invocation};

/// Most of the previous worker output shipped to the continuation call, as a
/// tail. Keeps the synthesis prompt bounded.
pub const CONTINUATION_TAIL_BYTES: usize = 5 * 1024;

/// Parsed reviewer verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewReport {
    pub code_complete: bool,
    pub break_iteration: bool,
    pub justification: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_prompt: Option<String>,
}

/// A review call always yields the raw reviewer output; the report is absent
/// when JSON extraction failed and the caller must synthesize a fallback.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub report: Option<ReviewReport>,
    pub raw_output: String,
}

/// Wire shape of the verdict JSON. Accepts snake_case and camelCase keys;
/// a non-boolean `code_complete` fails the parse, `break_iteration`
/// defaults to false.
#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(alias = "codeComplete")]
    code_complete: bool,
    #[serde(default, alias = "breakIteration")]
    break_iteration: bool,
    #[serde(default)]
    justification: String,
    #[serde(default, alias = "continuationPrompt")]
    continuation_prompt: Option<String>,
}

/// Classifies a worker run as complete / incomplete / escalate by invoking
/// the same CLI with a fixed JSON-only prompt, and synthesizes a
/// continuation prompt for incomplete runs.
///
/// Reviewer invocations are ephemeral: they go straight to the runner and
/// are never appended to conversation memory.
pub struct Reviewer {
    runner: Arc<CommandRunner>,
    worker_cli: PathBuf,
}

impl Reviewer {
    pub fn new(runner: Arc<CommandRunner>, worker_cli: PathBuf) -> Self {
        Self { runner, worker_cli }
    }

    /// Classify `worker_output` against the task. On incomplete (and not
    /// escalated) runs with a known task prompt, a second CLI call attaches
    /// a continuation prompt.
    pub async fn review(
        &self,
        worker_output: &str,
        working_directory: &Path,
        task_prompt: Option<&str>,
        definition_of_done: Option<&str>,
        timeout: Duration,
    ) -> Result<ReviewOutcome, DroverError> {
        let prompt = classification_prompt(worker_output, task_prompt, definition_of_done);
        let outcome = self
            .runner
            .execute(self.invocation(prompt, working_directory, timeout))
            .await?;

        let raw_output = if outcome.stdout.is_empty() {
            outcome.stderr.clone()
        } else {
            outcome.stdout.clone()
        };

        let Some(mut report) = parse_review_verdict(&raw_output) else {
            tracing::warn!("reviewer output did not contain a valid verdict");
            return Ok(ReviewOutcome {
                report: None,
                raw_output,
            });
        };

        if !report.code_complete
            && !report.break_iteration
            && report.continuation_prompt.is_none()
            && let Some(task) = task_prompt
        {
            report.continuation_prompt = self
                .synthesize_continuation(
                    task,
                    definition_of_done,
                    worker_output,
                    working_directory,
                    timeout,
                )
                .await;
        }

        Ok(ReviewOutcome {
            report: Some(report),
            raw_output,
        })
    }

    /// Second CLI call asking for plain-text continuation instructions.
    /// Failures are logged and reported as absence, never as an error.
    async fn synthesize_continuation(
        &self,
        task_prompt: &str,
        definition_of_done: Option<&str>,
        worker_output: &str,
        working_directory: &Path,
        timeout: Duration,
    ) -> Option<String> {
        let prompt = continuation_prompt(task_prompt, definition_of_done, worker_output);
        match self
            .runner
            .execute(self.invocation(prompt, working_directory, timeout))
            .await
        {
            Ok(outcome) if outcome.success() && !outcome.stdout.trim().is_empty() => {
                Some(outcome.stdout.trim().to_string())
            }
            Ok(outcome) => {
                tracing::warn!(
                    code = outcome.exit_code,
                    "continuation synthesis returned nothing usable"
                );
                None
            }
            Err(e) => {
                tracing::warn!("continuation synthesis failed: {e}");
                None
            }
        }
    }

    /// Reviewer calls classify, they never modify files: no `--force`.
    fn invocation(&self, prompt: String, working_directory: &Path, timeout: Duration) -> Invocation {
        Invocation {
            program: self.worker_cli.clone(),
            args: vec![
                "--model".to_string(),
                "auto".to_string(),
                "--print".to_string(),
                prompt,
            ],
            working_directory: working_directory.to_path_buf(),
            hard_timeout: timeout,
            idle_timeout: timeout,
            cancel: None,
        }
    }
}

fn classification_prompt(
    worker_output: &str,
    task_prompt: Option<&str>,
    definition_of_done: Option<&str>,
) -> String {
    let done_rules = match definition_of_done {
        Some(dod) => format!("Definition of done (authoritative, supplied by the caller):\n{dod}"),
        None => "Decide the task type and apply its definition of done:\n\
                 - Code-writing task: done when the requested code change exists and the \
                 output reports it was applied, with no unresolved errors.\n\
                 - Environment-operation task (install, run, configure): done when the \
                 operation ran and its effect is visible in the output.\n\
                 - Simple question: done when the question is answered directly."
            .to_string(),
    };
    let task = task_prompt.unwrap_or("(not available)");

    format!(
        "You are the completion reviewer for an automated coding agent. Judge only \
         whether the task below is finished, based on the agent output.\n\n\
         {done_rules}\n\n\
         If the agent is blocked on permissions, workspace trust, an interactive \
         prompt, or an access error, report break_iteration true: further attempts \
         cannot make progress.\n\n\
         Respond with ONLY a JSON object, no prose before or after:\n\
         {{\"code_complete\": <bool>, \"break_iteration\": <bool>, \
         \"justification\": \"<one short sentence>\"}}\n\n\
         [Task]: {task}\n\n\
         [Agent Output]:\n{worker_output}"
    )
}

fn continuation_prompt(
    task_prompt: &str,
    definition_of_done: Option<&str>,
    worker_output: &str,
) -> String {
    let dod = definition_of_done.unwrap_or("the task as described is fully carried out");
    let tail = tail_bytes(worker_output, CONTINUATION_TAIL_BYTES);
    format!(
        "An automated coding agent stopped before finishing the task below. Write \
         the instructions it should be resumed with. Plain text only, no JSON, no \
         preamble; be specific about what remains to reach the definition of done.\n\n\
         [Task]: {task_prompt}\n\n\
         [Definition of done]: {dod}\n\n\
         [Last agent output (tail)]:\n{tail}"
    )
}

/// Last `max_bytes` of `input`, cut at a char boundary.
pub fn tail_bytes(input: &str, max_bytes: usize) -> &str {
    if input.len() <= max_bytes {
        return input;
    }
    let mut start = input.len() - max_bytes;
    while start < input.len() && !input.is_char_boundary(start) {
        start += 1;
    }
    &input[start..]
}

/// Full verdict extraction pipeline: ANSI strip and CRLF normalization,
/// transcript-line removal, balanced-brace extraction, JSON parse.
pub fn parse_review_verdict(raw: &str) -> Option<ReviewReport> {
    let cleaned = strip_ansi(raw);
    let cleaned = strip_transcript_lines(&cleaned);
    let json = extract_json_object(&cleaned)?;
    let verdict = serde_json::from_str::<RawVerdict>(json).ok()?;
    Some(ReviewReport {
        code_complete: verdict.code_complete,
        break_iteration: verdict.break_iteration,
        justification: verdict.justification,
        continuation_prompt: verdict.continuation_prompt,
    })
}

/// Remove ANSI escape sequences and normalize line endings to `\n`.
/// CRLF collapses to LF; a bare CR is dropped.
pub fn strip_ansi(input: &str) -> String {
    let clean = strip_ansi_escapes::strip(input.as_bytes());
    String::from_utf8_lossy(&clean).replace('\r', "")
}

/// Turn prefixes the worker CLI uses when it echoes recorded conversation
/// turns back into its output. `cursor:` is the CLI's own name for its side
/// of the transcript; `assistant:` is the rendered-context form.
const TRANSCRIPT_PREFIXES: [&str; 3] = ["user:", "cursor:", "assistant:"];

/// Drop lines that look like recorded conversation turns, up to the first
/// line containing a `{`.
pub fn strip_transcript_lines(input: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut before_json = true;
    for line in input.lines() {
        if before_json {
            if line.contains('{') {
                before_json = false;
            } else {
                let trimmed = line.trim_start();
                if TRANSCRIPT_PREFIXES.iter().any(|p| trimmed.starts_with(p)) {
                    continue;
                }
            }
        }
        kept.push(line);
    }
    kept.join("\n")
}

/// Outermost balanced `{...}` substring, found by counting braces. Braces
/// inside JSON string literals do not count.
pub fn extract_json_object(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in input[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&input[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
