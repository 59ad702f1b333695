use rand::RngCore;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Generate a short opaque identifier: 8 uppercase hex characters.
pub fn generate_uid() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes).to_uppercase()
}

pub fn new_node_id() -> String {
    format!("N-{}", generate_uid())
}

pub fn new_comp_id() -> String {
    format!("COMP-{}", generate_uid())
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Absolute deadline in unix milliseconds, `seconds` from now.
pub fn deadline_ms_from_now(seconds: u64) -> u64 {
    now_ms() + seconds * 1_000
}

/// Remaining time until an absolute unix-ms deadline, zero if already past.
pub fn until_ms(deadline_ms: u64) -> Duration {
    Duration::from_millis(deadline_ms.saturating_sub(now_ms()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_shape() {
        let uid = generate_uid();
        assert_eq!(uid.len(), 8);
        assert!(uid
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert!(new_comp_id().starts_with("COMP-"));
        assert!(new_node_id().starts_with("N-"));
    }

    #[test]
    fn deadlines_move_forward() {
        let d = deadline_ms_from_now(2);
        assert!(d > now_ms());
        assert!(until_ms(d) <= Duration::from_secs(2));
        assert_eq!(until_ms(now_ms().saturating_sub(5_000)), Duration::ZERO);
    }
}
