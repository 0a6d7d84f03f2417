use serde::{Deserialize, Serialize};

/// Plan usage as reported by the quota source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub current_usage: u64,
    pub limit: u64,
    pub plan_name: String,
}

impl QuotaState {
    pub fn new(plan_name: impl Into<String>, current_usage: u64, limit: u64) -> Self {
        Self {
            current_usage,
            limit,
            plan_name: plan_name.into(),
        }
    }

    pub fn can_use_ai(&self) -> bool {
        self.current_usage < self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.current_usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_at_limit_is_not_admitted() {
        assert!(QuotaState::new("Free", 5, 50).can_use_ai());
        assert!(!QuotaState::new("Free", 50, 50).can_use_ai());
        assert!(!QuotaState::new("Free", 51, 50).can_use_ai());
        assert_eq!(QuotaState::new("Free", 51, 50).remaining(), 0);
    }
}
