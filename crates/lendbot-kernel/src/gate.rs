//! Fixed-window rate arithmetic and card freshness.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateConfig {
    pub max_requests: u64,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny { retry_after_ms: u64 },
}

pub fn window_bucket(now_ms: i64, window_ms: u64) -> i64 {
    now_ms.div_euclid(window_ms.max(1) as i64)
}

pub fn rate_key(user_id: &str, interaction: &str) -> String {
    format!("{user_id}:{interaction}")
}

/// `count` is the number of hits in the current window including this one.
pub fn evaluate_rate(count: u64, now_ms: i64, cfg: &RateConfig) -> GateDecision {
    if count <= cfg.max_requests {
        return GateDecision::Allow;
    }
    let window = cfg.window_ms.max(1) as i64;
    let retry_after_ms = (window - now_ms.rem_euclid(window)) as u64;
    GateDecision::Deny { retry_after_ms }
}

pub fn is_fresh(created_ms: i64, now_ms: i64, freshness_secs: u64) -> bool {
    let age = now_ms.saturating_sub(created_ms).max(0) as u64;
    age < freshness_secs.saturating_mul(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: RateConfig = RateConfig {
        max_requests: 1,
        window_ms: 3_000,
    };

    #[test]
    fn second_hit_in_window_is_denied() {
        assert_eq!(evaluate_rate(1, 10_000, &CFG), GateDecision::Allow);
        assert_eq!(
            evaluate_rate(2, 10_500, &CFG),
            GateDecision::Deny {
                retry_after_ms: 1_500
            }
        );
    }

    #[test]
    fn buckets_roll_over_at_window_edges() {
        assert_eq!(window_bucket(8_999, 3_000), 2);
        assert_eq!(window_bucket(9_000, 3_000), 3);
        assert_eq!(rate_key("u1", "card.action.trigger"), "u1:card.action.trigger");
    }

    #[test]
    fn card_expires_after_freshness_window() {
        let twelve_days = 1_036_800;
        assert!(is_fresh(0, 1_000, twelve_days));
        assert!(!is_fresh(0, twelve_days as i64 * 1000, twelve_days));
        assert!(is_fresh(5_000, 1_000, twelve_days));
    }
}
