//! Shared guardrails for submission size, sandbox limits and fact volume.

// Submission and configuration guards
pub const MAX_SOURCE_BYTES: usize = 50_000;
pub const MAX_QUESTIONS_LIMIT: i64 = 50;
pub const MAX_DYNAMIC_TIMEOUT_MS: u64 = 60_000;
pub const MAX_STACK_DEPTH_LIMIT: usize = 1_000;
pub const MAX_SYNTAX_DEPTH: usize = 100;

// Sandbox guards
pub const MAX_STEPS_LIMIT: u64 = 50_000_000;
pub const MAX_COLLECTION_LEN: usize = 1_000_000;
pub const MAX_INT_BITS: u64 = 1_000_000;
pub const MAX_STDOUT_BYTES: usize = 64 * 1024;
pub const MAX_RENDER_BYTES: usize = MAX_COLLECTION_LEN;
pub const POLL_INTERVAL: usize = 1_024;
pub const SANDBOX_STACK_BYTES: usize = 256 * 1024 * 1024;

// Fact volume guards
pub const MAX_SNAPSHOTS: usize = 5_000;
pub const MAX_CALL_EVENTS: usize = 5_000;
pub const MAX_FLOW_EVENTS: usize = 10_000;
pub const MAX_SNAPSHOT_DEPTH: usize = 16;
pub const MAX_SNAPSHOT_ITEMS: usize = 200;

// Template guards
pub const MAX_TRACING_QUESTIONS_PER_TEMPLATE: usize = 12;
pub const MAX_ANSWER_CHOICES: usize = 6;

/// Questions a single request may return: 1 up to [`MAX_QUESTIONS_LIMIT`].
pub fn clamp_question_limit(value: i64) -> usize {
    usize::try_from(value.clamp(1, MAX_QUESTIONS_LIMIT)).unwrap_or(1)
}

/// Effective stack ceiling: at least 1, never above the hard limit.
pub fn clamp_stack_depth(value: usize) -> usize {
    value.clamp(1, MAX_STACK_DEPTH_LIMIT)
}

pub fn clamp_timeout_ms(value: u64) -> u64 {
    value.clamp(1, MAX_DYNAMIC_TIMEOUT_MS)
}

pub fn clamp_steps(value: u64) -> u64 {
    value.clamp(1, MAX_STEPS_LIMIT)
}

/// Truncate `text` to at most `max_bytes`, respecting char boundaries.
/// Returns whether anything was cut.
pub fn truncate_utf8(text: &mut String, max_bytes: usize) -> bool {
    if text.len() <= max_bytes {
        return false;
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_helpers() {
        assert_eq!(clamp_question_limit(0), 1);
        assert_eq!(clamp_question_limit(-3), 1);
        assert_eq!(clamp_question_limit(500), 50);
        assert_eq!(clamp_stack_depth(0), 1);
        assert_eq!(clamp_stack_depth(5_000), MAX_STACK_DEPTH_LIMIT);
        assert_eq!(clamp_timeout_ms(0), 1);
    }

    #[test]
    fn test_truncate_utf8_respects_boundaries() {
        let mut s = "héllo".to_string();
        assert!(truncate_utf8(&mut s, 2));
        assert_eq!(s, "h");
        let mut t = "abc".to_string();
        assert!(!truncate_utf8(&mut t, 10));
    }
}
