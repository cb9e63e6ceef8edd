//! Duration estimation and token cost accounting.
//!
//! Both are advisory: the estimate never gates dispatch, and cost is
//! informational only.

use crate::types::TokenUsage;

/// Base latency estimate for a fresh session (milliseconds).
const NEW_SESSION_BASE_MS: u64 = 2000;
/// Per-word increment for a fresh session.
const NEW_SESSION_PER_WORD_MS: u64 = 10;
/// Base latency estimate for a continuation.
const CONTINUATION_BASE_MS: u64 = 1500;
/// Per-word increment for a continuation.
const CONTINUATION_PER_WORD_MS: u64 = 8;

/// Estimate execution duration for a prompt.
#[must_use]
pub fn estimate_duration_ms(prompt: &str, continuation: bool) -> u64 {
    let words = prompt.split_whitespace().count() as u64;
    if continuation {
        CONTINUATION_BASE_MS + CONTINUATION_PER_WORD_MS * words
    } else {
        NEW_SESSION_BASE_MS + NEW_SESSION_PER_WORD_MS * words
    }
}

/// Cost rate per million tokens, USD.
#[derive(Debug, Clone, Copy)]
struct ModelRate {
    input:  f64,
    output: f64,
}

fn rate_for(model: &str) -> ModelRate {
    // Substring match so dated identifiers resolve to their family.
    if model.contains("opus") {
        ModelRate {
            input:  15.0,
            output: 75.0,
        }
    } else if model.contains("haiku") {
        ModelRate {
            input:  0.8,
            output: 4.0,
        }
    } else {
        // Sonnet-class default.
        ModelRate {
            input:  3.0,
            output: 15.0,
        }
    }
}

/// Fold one interaction's usage into a session's cumulative counters.
#[must_use]
pub fn accumulate(usage: TokenUsage, model: &str, input_tokens: u64, output_tokens: u64) -> TokenUsage {
    let rate = rate_for(model);
    let added_cost = (input_tokens as f64 * rate.input + output_tokens as f64 * rate.output)
        / 1_000_000.0;
    TokenUsage {
        input_tokens:       usage.input_tokens + input_tokens,
        output_tokens:      usage.output_tokens + output_tokens,
        estimated_cost_usd: usage.estimated_cost_usd + added_cost,
    }
}

/// Rough token count for text the CLI did not meter (about 4 chars per
/// token).
#[must_use]
pub fn rough_token_estimate(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_scales_with_words() {
        assert_eq!(estimate_duration_ms("", false), 2000);
        assert_eq!(estimate_duration_ms("one two three", false), 2030);
        assert_eq!(estimate_duration_ms("one two three", true), 1524);
    }

    #[test]
    fn test_continuation_is_cheaper() {
        let prompt = "explain the failing test in detail";
        assert!(estimate_duration_ms(prompt, true) < estimate_duration_ms(prompt, false));
    }

    #[test]
    fn test_accumulate_adds_and_costs() {
        let usage = accumulate(TokenUsage::default(), "sonnet-4", 1000, 2000);
        assert_eq!(usage.input_tokens, 1000);
        assert_eq!(usage.output_tokens, 2000);
        // 1000 in at $3/M + 2000 out at $15/M.
        assert!((usage.estimated_cost_usd - 0.033).abs() < 1e-9);

        let usage = accumulate(usage, "sonnet-4", 1000, 0);
        assert_eq!(usage.input_tokens, 2000);
    }

    #[test]
    fn test_model_families() {
        let opus = accumulate(TokenUsage::default(), "claude-opus-4", 1_000_000, 0);
        assert!((opus.estimated_cost_usd - 15.0).abs() < 1e-9);
        let haiku = accumulate(TokenUsage::default(), "claude-haiku-3-5", 1_000_000, 0);
        assert!((haiku.estimated_cost_usd - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_rough_tokens() {
        assert_eq!(rough_token_estimate(""), 0);
        assert_eq!(rough_token_estimate("abcd"), 1);
        assert_eq!(rough_token_estimate("abcde"), 2);
    }
}
