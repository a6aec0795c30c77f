//! Secret redaction for agent and tool output.
//!
//! Every line that leaves the agent process (stream events, final output,
//! check output, log entries) passes through [`redact_secrets`] before it is
//! shown, logged or persisted.

use std::sync::LazyLock;

use regex::Regex;

/// Marker substituted for every recognised credential.
pub const REDACTED: &str = "[REDACTED]";

/// Ordered credential shapes. Earlier entries win when shapes overlap.
static SECRET_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // PEM private key blocks
        (
            Regex::new(r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----")
                .unwrap(),
            REDACTED,
        ),
        // Anthropic / OpenAI keys: sk-..., sk-ant-..., sk-proj-...
        (
            Regex::new(r"\bsk-[A-Za-z0-9_-]{20,}").unwrap(),
            REDACTED,
        ),
        // Google API keys
        (Regex::new(r"\bAIza[0-9A-Za-z_-]{35}").unwrap(), REDACTED),
        // Other vendor prefixes (xAI, Groq, Perplexity, Replicate, HuggingFace)
        (
            Regex::new(r"\b(?:xai-|gsk_|pplx-|r8_|hf_)[A-Za-z0-9_-]{20,}").unwrap(),
            REDACTED,
        ),
        // GitHub tokens
        (
            Regex::new(r"\b(?:gh[pousr]_[A-Za-z0-9]{36,}|github_pat_[A-Za-z0-9_]{22,})").unwrap(),
            REDACTED,
        ),
        // GitLab tokens
        (Regex::new(r"\bglpat-[A-Za-z0-9_-]{20,}").unwrap(), REDACTED),
        // Slack tokens
        (
            Regex::new(r"\bxox[abposr]-[A-Za-z0-9-]{10,}").unwrap(),
            REDACTED,
        ),
        // AWS access key ids
        (Regex::new(r"\b(?:AKIA|ASIA)[A-Z0-9]{16}\b").unwrap(), REDACTED),
        // JWTs
        (
            Regex::new(r"\beyJ[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}").unwrap(),
            REDACTED,
        ),
        // Bearer tokens in headers
        (
            Regex::new(r"(?i)(\bbearer\s+)[A-Za-z0-9._~+/-]{20,}=*").unwrap(),
            "${1}[REDACTED]",
        ),
        // JSON fields: "password": "..."
        (
            Regex::new(
                r#"(?i)("[a-z0-9_-]*(?:password|passwd|secret|token|api_?key|private_?key|access_?key)[a-z0-9_-]*"\s*:\s*)"[^"]*""#,
            )
            .unwrap(),
            "${1}\"[REDACTED]\"",
        ),
        // KEY=value / SECRET=value / password=value assignments; an
        // unterminated opening quote is swallowed with the value
        (
            Regex::new(
                r#"(?i)(\b(?:[a-z0-9_]*(?:api_?key|_key|secret|token|password|passwd|credential)[a-z0-9_]*|key)\s*=\s*)(\[REDACTED\]|"[^"]*"|'[^']*'|["']?[^\s"']+)"#,
            )
            .unwrap(),
            "${1}[REDACTED]",
        ),
        // Generic 32-64 char hex strings
        (Regex::new(r"\b[0-9a-fA-F]{32,64}\b").unwrap(), REDACTED),
    ]
});

/// Replace every recognised credential in `input` with [`REDACTED`].
///
/// Idempotent: the marker itself matches none of the patterns.
pub fn redact_secrets(input: &str) -> String {
    let mut output = input.to_string();
    for (pattern, replacement) in SECRET_PATTERNS.iter() {
        if pattern.is_match(&output) {
            output = pattern.replace_all(&output, *replacement).into_owned();
        }
    }
    output
}

/// Redact a multi-line blob line by line, preserving line structure.
pub fn redact_lines(input: &str) -> String {
    if input.contains("PRIVATE KEY-----") {
        return redact_secrets(input);
    }
    input
        .split('\n')
        .map(redact_secrets)
        .collect::<Vec<_>>()
        .join("\n")
}
