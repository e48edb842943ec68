//! Prompts handed to agents and how they are delivered.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::automaton::detect::ACCEPT_EDITS_ON;
use crate::automaton::Automaton;
use crate::core::plan::Plan;
use crate::core::task::Task;
use crate::util::shell_escape;
use crate::{Error, Result};

/// Printed by a merge agent, alone on its line, once it is finished.
pub const MERGE_DONE_MARKER: &str = "FOREMAN_MERGE_COMPLETE";

/// Status-line text of an agent UI ready for input.
pub const AGENT_READY_PATTERN: &str =
    r"(?i)(for shortcuts|shift\+tab to cycle|accept edits on|plan mode on|bypass permissions)";

pub fn merge_done_pattern() -> String {
    format!(r"(?m)^\W*{}\W*$", MERGE_DONE_MARKER)
}

fn plan_header(plan: &Plan) -> String {
    let mut out = format!("Plan: {}\n", plan.title);
    if let Some(description) = plan.description.as_deref().filter(|d| !d.trim().is_empty()) {
        out.push_str(&format!("\n{}\n", description.trim()));
    }
    out
}

pub fn discussion_prompt(plan: &Plan) -> String {
    format!(
        "{}\nLet's discuss this plan before any work starts. Ask me about anything \
         unclear, point out risks and propose how to split the work. Do not change \
         any files yet.",
        plan_header(plan)
    )
}

pub fn orchestrator_prompt(plan: &Plan, store_root: &Path, ready_label: &str) -> String {
    let mut out = plan_header(plan);
    if let Some(summary) = plan.discussion.as_ref().and_then(|d| d.summary.as_deref()) {
        out.push_str(&format!("\nAgreed approach:\n{}\n", summary.trim()));
    }
    out.push_str(&format!(
        "\nYou coordinate this plan. Its task store lives in {}; run `bd` from there. \
         Watch progress with `bd list`, answer questions from the planner and keep \
         the tasks accurate. Tasks labeled `{}` are picked up automatically.",
        store_root.display(),
        ready_label
    ));
    out
}

pub fn planner_prompt(plan: &Plan, store_root: &Path, ready_label: &str, repos: &[String]) -> String {
    format!(
        "{}\nBreak this plan into tasks in the task store at {root} (run `bd` from \
         there). For every task:\n\
         - add a `repo:<name>` label naming one of: {repos}\n\
         - add a `worktree:<name>` label naming the workspace it runs in\n\
         - record blockers with `bd dep add <blocked> <blocker>`\n\
         - add the `{ready}` label once it can be started\n",
        plan_header(plan),
        root = store_root.display(),
        repos = repos.join(", "),
        ready = ready_label,
    )
}

pub fn task_prompt(task: &Task, branch: &str, store_root: &Path) -> String {
    let mut out = format!("Task {}: {}\n", task.id, task.title);
    if let Some(description) = task.description.as_deref().filter(|d| !d.trim().is_empty()) {
        out.push_str(&format!("\n{}\n", description.trim()));
    }
    out.push_str(&format!(
        "\nYou are on branch `{branch}` in a dedicated worktree. Commit your work on \
         this branch. When the task is done, close it from {root} with \
         `bd close {id} --reason \"<summary>\"`.",
        branch = branch,
        root = store_root.display(),
        id = task.id,
    ));
    out
}

pub fn merge_prompt(feature_branch: &str, branches: &[String]) -> String {
    format!(
        "Merge these branches into `{feature}`, which is checked out here:\n{list}\n\n\
         Resolve any conflicts, keep both sides' intent and commit each merge. \
         When every branch is merged, print {marker} on a line by itself.",
        feature = feature_branch,
        list = branches
            .iter()
            .map(|b| format!("- {}", b))
            .collect::<Vec<_>>()
            .join("\n"),
        marker = MERGE_DONE_MARKER,
    )
}

/// Fill the headless command template.
pub fn render_headless_command(template: &str, token: &str, workdir: &Path, prompt: &str) -> String {
    template
        .replace("{token}", &shell_escape(token))
        .replace("{workdir}", &shell_escape(&workdir.display().to_string()))
        .replace("{prompt}", &shell_escape(prompt))
}

/// Wait for the agent UI, then hand it `text`.
///
/// Multi-line text goes in as one paste, anything else is typed. The text is
/// delivered even when the ready pattern never shows up.
pub async fn deliver(automaton: &Automaton, text: &str, ready: &str, timeout: Duration) -> Result<()> {
    if !automaton.wait_until_shown(ready, timeout).await {
        if !automaton.is_alive() {
            return Err(Error::Spawn(format!(
                "{} exited before its prompt was delivered",
                automaton.name
            )));
        }
        warn!("{}: agent not ready after {:?}, sending prompt anyway", automaton.name, timeout);
    }
    debug!("{}: delivering {} bytes", automaton.name, text.len());
    if text.contains('\n') {
        automaton.paste_text(text).await?;
    } else {
        automaton.type_text(text).await?;
    }
    Ok(())
}

/// Ready pattern for an agent, stricter when it must reach accept-edits mode.
pub fn ready_pattern(accept_edits: bool) -> String {
    if accept_edits {
        format!("(?i){}", regex::escape(ACCEPT_EDITS_ON))
    } else {
        AGENT_READY_PATTERN.to_string()
    }
}
