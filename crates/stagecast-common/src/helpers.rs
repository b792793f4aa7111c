//! Common helper functions for Stagecast.

use rand::{distributions::Alphanumeric, Rng};

/// Read a boolean flag from the environment (`1`, `true`, `yes`, `on`).
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Short random transaction id attached to publish requests.
pub fn transaction_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(char::from)
        .collect::<String>()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_truthy() {
        assert!(parse_bool("1"));
        assert!(parse_bool(" TRUE "));
        assert!(parse_bool("on"));
    }

    #[test]
    fn test_parse_bool_falsy() {
        assert!(!parse_bool("0"));
        assert!(!parse_bool(""));
        assert!(!parse_bool("nope"));
    }

    #[test]
    fn test_transaction_id_shape() {
        let tid = transaction_id();
        assert_eq!(tid.len(), 7);
        assert!(tid.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
