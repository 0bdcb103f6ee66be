//! Repair prompt rendering.
//!
//! The prompt is deterministic for a given input and bounded by a byte budget.
//! Hints are the only droppable part: they are removed from the end until the
//! prompt fits. The failure summary is never dropped.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::{debug, warn};

const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");

/// Inputs for one repair request.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub repo_path: &'a str,
    /// Where the repository appears inside the sandbox.
    pub repo_mount: &'a str,
    pub summary: &'a str,
    pub hints: &'a [String],
}

/// A rendered prompt ready to send to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPack {
    pub content: String,
    pub dropped_hints: usize,
}

/// Builds size-bounded repair prompts.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, input: &PromptInputs<'_>) -> Result<PromptPack> {
        let mut env = Environment::new();
        env.add_template("repair", REPAIR_TEMPLATE)
            .context("load repair template")?;
        let template = env.get_template("repair").context("get repair template")?;

        let mut kept = input.hints.len();
        loop {
            let hints: Vec<&str> = input.hints[..kept]
                .iter()
                .map(|h| h.trim())
                .filter(|h| !h.is_empty())
                .collect();
            let content = template
                .render(context! {
                    repo_path => input.repo_path,
                    repo_mount => input.repo_mount,
                    summary => input.summary.trim_end(),
                    hints => hints,
                })
                .context("render repair prompt")?;

            if content.len() <= self.budget_bytes || kept == 0 {
                let dropped_hints = input.hints.len() - kept;
                if content.len() > self.budget_bytes {
                    warn!(
                        bytes = content.len(),
                        budget = self.budget_bytes,
                        "repair prompt exceeds budget without hints"
                    );
                } else if dropped_hints > 0 {
                    debug!(dropped_hints, "hints dropped to fit prompt budget");
                }
                return Ok(PromptPack {
                    content,
                    dropped_hints,
                });
            }
            kept -= 1;
        }
    }
}
