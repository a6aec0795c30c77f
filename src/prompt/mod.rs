//! Agent prompts for milestone work and check fixes, plus learning
//! extraction from failure output.
//!
//! Every prompt carries the same execution principles, the learnings
//! accumulated so far and the session's rule text (git isolation + safety),
//! computed once per session by the plan executor.

use std::sync::LazyLock;

use regex::Regex;

use crate::checks::{CheckResult, format_failure_feedback};
use crate::session::Milestone;

/// Fixed principles embedded in every milestone prompt.
pub const EXECUTION_PRINCIPLES: &str = "## Execution Principles\n\
- If something is ambiguous, stop and ask rather than guess.\n\
- Make minimal, surgical changes; do not refactor unrelated code.\n\
- Keep working until every success criterion is met and verified.\n\
- Run the project's build and tests yourself before you finish.\n";

/// Marker line added when a milestone is retried.
pub const RETRY_MARKER: &str = "NOTE: The previous attempt at this milestone failed.";

/// Build the prompt for one attempt at a milestone.
pub fn milestone_prompt(
    milestone: &Milestone,
    goal: &str,
    learnings: &[String],
    session_rules: &str,
    attempt: u32,
) -> String {
    let mut prompt = String::new();
    if attempt > 1 {
        prompt.push_str(&format!(
            "{RETRY_MARKER} This is attempt {attempt}. Review what went wrong before changing more code.\n\n"
        ));
    }
    prompt.push_str(&format!("# Milestone: {}\n\n", milestone.title));
    if !goal.trim().is_empty() {
        prompt.push_str(&format!("Overall goal: {}\n\n", goal.trim()));
    }
    if !milestone.description.trim().is_empty() {
        prompt.push_str(&format!("{}\n\n", milestone.description.trim()));
    }
    if !milestone.success_criteria.is_empty() {
        prompt.push_str("## Success Criteria\n");
        for c in &milestone.success_criteria {
            prompt.push_str(&format!("- {c}\n"));
        }
        prompt.push('\n');
    }
    prompt.push_str(EXECUTION_PRINCIPLES);
    prompt.push('\n');
    push_learnings(&mut prompt, learnings);
    if !session_rules.trim().is_empty() {
        prompt.push_str(session_rules.trim_end());
        prompt.push('\n');
    }
    prompt
}

/// Build a fix prompt covering only the failing checks.
pub fn fix_prompt(milestone: &Milestone, results: &[CheckResult], session_rules: &str) -> String {
    let mut prompt = format!(
        "The automated checks failed after your work on \"{}\". Fix ONLY the failures below; \
         do not start new work.\n\n",
        milestone.title
    );
    prompt.push_str(&format_failure_feedback(results));
    prompt.push_str("Re-run the failing commands yourself to confirm they pass.\n\n");
    if !session_rules.trim().is_empty() {
        prompt.push_str(session_rules.trim_end());
        prompt.push('\n');
    }
    prompt
}

fn push_learnings(prompt: &mut String, learnings: &[String]) {
    if learnings.is_empty() {
        return;
    }
    prompt.push_str("## Learnings From Earlier Failures\n");
    for l in learnings {
        prompt.push_str(&format!("- {l}\n"));
    }
    prompt.push('\n');
}

/// Failure signatures mapped to a generalised rule.
static LEARNING_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)(cannot find module|module not found|unresolved import|could not resolve|no module named|failed to resolve import|use of undeclared (?:crate|module))").unwrap(),
            "Always verify imports and module paths exist before using them.",
        ),
        (
            Regex::new(r"(?i)(error TS\d+|type error|mismatched types|is not assignable to|expected type|cannot find type)").unwrap(),
            "Check types carefully; run the type checker after every change.",
        ),
        (
            Regex::new(r"(?i)(syntaxerror|unexpected token|expected one of|unterminated|parse error)").unwrap(),
            "Re-read edited files for syntax errors before finishing.",
        ),
        (
            Regex::new(r"(?i)(cannot find (?:value|function|name)|is not defined|not found in this scope|undefined reference|has no attribute)").unwrap(),
            "Confirm every referenced function and variable is defined and exported.",
        ),
        (
            Regex::new(r"(?i)(\d+ (?:tests? )?failed|test failed|assertion(?:error)? failed|assert(?:ion)?error|panicked at)").unwrap(),
            "Run the test suite and read the failing assertions before declaring success.",
        ),
        (
            Regex::new(r"(?i)(eslint|clippy|lint(?:ing)? (?:error|failed)|prettier)").unwrap(),
            "Follow the project's lint rules; run the linter before finishing.",
        ),
        (
            Regex::new(r"(?i)(enoent|no such file or directory|file not found)").unwrap(),
            "Verify file paths exist before reading or importing them.",
        ),
        (
            Regex::new(r"(?i)(dependency|package) .*not (?:found|installed)|missing dependency").unwrap(),
            "Install or declare new dependencies in the manifest before using them.",
        ),
    ]
});

/// Derive a short general rule from failure output, if one applies.
pub fn derive_learning(failure_output: &str) -> Option<&'static str> {
    LEARNING_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(failure_output))
        .map(|(_, learning)| *learning)
}
