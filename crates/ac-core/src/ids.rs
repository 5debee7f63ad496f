//! Entity identifier generation.
//!
//! Every long-lived entity carries a string id of the form
//! `<prefix>-<base36 millis>-<6 random base36 chars>`. Sub-tasks append a
//! zero-padded 3-digit sequence to their parent id instead.

use chrono::Utc;
use uuid::Uuid;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Encode `n` as lowercase base36.
fn base36(mut n: u128) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 output is ascii")
}

/// Six base36 characters of fresh randomness, drawn from a v4 UUID.
fn random_suffix() -> String {
    let raw = base36(Uuid::new_v4().as_u128());
    // A v4 UUID has 122 random bits; the low end of its base36 form is
    // uniformly distributed, so take the tail and left-pad if short.
    let tail: String = raw.chars().rev().take(6).collect::<Vec<_>>().into_iter().rev().collect();
    format!("{:0>6}", tail)
}

fn tagged(prefix: &str) -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u128;
    format!("{}-{}-{}", prefix, base36(millis), random_suffix())
}

/// Fresh parent-task id (`task-<base36>-<rand>`).
pub fn task_id() -> String {
    tagged("task")
}

/// Fresh worker id (`worker-<base36>-<rand>`).
pub fn worker_id() -> String {
    tagged("worker")
}

/// Fresh pull-request id (`pr-<base36>-<rand>`).
pub fn pr_id() -> String {
    tagged("pr")
}

/// Fresh run id (`run-<base36>-<rand>`).
pub fn run_id() -> String {
    tagged("run")
}

/// Sub-task id: parent id plus a 1-based, zero-padded 3-digit sequence.
pub fn sub_task_id(parent_id: &str, seq: usize) -> String {
    format!("{}-{:03}", parent_id, seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_known_values() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(36 * 36), "100");
    }

    #[test]
    fn tagged_ids_have_prefix_and_suffix() {
        let id = task_id();
        assert!(id.starts_with("task-"));
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(worker_id()));
        }
    }

    #[test]
    fn sub_task_ids_are_zero_padded() {
        assert_eq!(sub_task_id("task-abc-def123", 1), "task-abc-def123-001");
        assert_eq!(sub_task_id("task-abc-def123", 42), "task-abc-def123-042");
        assert_eq!(sub_task_id("task-abc-def123", 100), "task-abc-def123-100");
    }

    #[test]
    fn distinct_prefixes() {
        assert!(worker_id().starts_with("worker-"));
        assert!(pr_id().starts_with("pr-"));
        assert!(run_id().starts_with("run-"));
    }
}
