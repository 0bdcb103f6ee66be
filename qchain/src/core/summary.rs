//! Failure summarizer and output tail helpers.

use std::time::Duration;

use crate::core::types::{FailureSummary, StepSpec};

/// Characters of step output kept in a failure summary.
pub const SUMMARY_TAIL_CHARS: usize = 4000;
/// Characters of a step's description or command kept in a failure summary.
pub const SUMMARY_FIELD_CHARS: usize = 500;

/// Return the first `max_chars` characters of `text` (char-boundary safe).
pub fn head_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Return the last `max_chars` characters of `text` (char-boundary safe).
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Return the last `max_lines` lines of `text`.
pub fn tail_lines(text: &str, max_lines: usize) -> &str {
    if max_lines == 0 {
        return "";
    }
    let body = text.strip_suffix('\n').unwrap_or(text);
    match body.match_indices('\n').rev().nth(max_lines - 1) {
        Some((idx, _)) => &text[idx + 1..],
        None => text,
    }
}

/// `text` cut to `max_chars`, with a marker saying how much was cut.
fn clip(text: &str, max_chars: usize) -> String {
    let head = head_chars(text, max_chars);
    if head.len() == text.len() {
        return text.to_string();
    }
    let cut = text[head.len()..].chars().count();
    format!("{head} [... {cut} more chars]")
}

/// Whole seconds as `Ns`, anything finer as `Duration`'s own `Debug` (`300ms`).
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{duration:?}")
    }
}

/// Condense a failed attempt into the report handed to the repair agent.
///
/// Every part is bounded, so the report never outgrows the prompt budget.
pub fn summarize_failure(step: &StepSpec, output: &str) -> FailureSummary {
    let tail = tail_chars(output, SUMMARY_TAIL_CHARS).to_string();
    let text = format!(
        "Step '{}' failed: {}\nCommand: {}\nLast output (tail):\n{}\n",
        step.id,
        clip(&step.desc, SUMMARY_FIELD_CHARS),
        clip(&step.command, SUMMARY_FIELD_CHARS),
        tail
    );
    FailureSummary {
        step_id: step.id.clone(),
        tail,
        text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_chars_respects_multibyte_boundaries() {
        assert_eq!(tail_chars("héllo", 4), "éllo");
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("abc", 0), "");
    }

    #[test]
    fn tail_lines_keeps_last_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc\n");
        assert_eq!(tail_lines("a\nb\nc", 2), "b\nc");
        assert_eq!(tail_lines("a\nb", 5), "a\nb");
    }

    #[test]
    fn head_chars_respects_multibyte_boundaries() {
        assert_eq!(head_chars("héllo", 2), "hé");
        assert_eq!(head_chars("abc", 10), "abc");
        assert_eq!(head_chars("abc", 0), "");
    }

    #[test]
    fn durations_print_whole_seconds_or_exact_fractions() {
        assert_eq!(format_duration(Duration::from_secs(180)), "180s");
        assert_eq!(format_duration(Duration::from_millis(300)), "300ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
    }

    #[test]
    fn long_desc_and_command_are_clipped() {
        let mut step = StepSpec::new("lint", format!("run-lint {}", "--flag ".repeat(5_000)));
        step.desc = "d".repeat(2_000);
        let output = "y".repeat(10_000);

        let summary = summarize_failure(&step, &output);
        let bound = SUMMARY_TAIL_CHARS + 2 * (SUMMARY_FIELD_CHARS + 40) + 100;
        assert!(summary.text.len() <= bound, "{} bytes", summary.text.len());
        assert!(summary.text.contains("Command: run-lint --flag"));
        assert!(summary.text.contains(" [... 1500 more chars]\nCommand: "));
        assert!(summary.tail.ends_with('y'));
    }

    #[test]
    fn summary_embeds_step_and_bounded_tail() {
        let mut step = StepSpec::new("test", "cargo test");
        step.desc = "unit tests".to_string();
        let output = format!("{}FAILED: boom", "x".repeat(10_000));

        let summary = summarize_failure(&step, &output);
        assert_eq!(summary.step_id, "test");
        assert_eq!(summary.tail.chars().count(), SUMMARY_TAIL_CHARS);
        assert!(summary.tail.ends_with("FAILED: boom"));
        assert!(
            summary
                .text
                .starts_with("Step 'test' failed: unit tests\nCommand: cargo test\n")
        );
    }
}
