//! Small stateless helpers shared across components.

pub mod backoff;
pub mod naming;
pub mod recurrence;

use std::time::Duration;

/// Clamps a transfer-wide timeout:
/// `max(configured, 60s) + 60s * ceil(size / 100 MiB)`, capped at 30 min.
pub fn transfer_timeout(configured: Duration, file_size: u64) -> Duration {
    const HUNDRED_MIB: u64 = 100 * 1024 * 1024;
    const THIRTY_MIN: Duration = Duration::from_secs(30 * 60);

    let base = configured.max(Duration::from_secs(60));
    let chunks_of_100mib = (file_size + HUNDRED_MIB - 1) / HUNDRED_MIB;
    let size_component = Duration::from_secs(60 * chunks_of_100mib.max(1));
    (base + size_component).min(THIRTY_MIN)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timeout_is_capped() {
        let t = transfer_timeout(Duration::from_secs(10), 10 * 1024 * 1024 * 1024);
        assert_eq!(t, Duration::from_secs(30 * 60));
    }

    #[test]
    fn timeout_scales_with_size() {
        let small = transfer_timeout(Duration::from_secs(60), 1024);
        assert_eq!(small, Duration::from_secs(120));
    }
}
