use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactorConfig {
    /// Deadline for a get/pend/commit call (milliseconds).
    pub operation_timeout_ms: u64,
    /// Deadline for cancel fan-out; usually smaller than the operation
    /// timeout (milliseconds).
    pub abort_or_cancel_timeout_ms: u64,
}

impl TransactorConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn abort_or_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_or_cancel_timeout_ms)
    }

    pub fn for_tests() -> Self {
        Self {
            operation_timeout_ms: 2_000,
            abort_or_cancel_timeout_ms: 500,
        }
    }
}

impl Default for TransactorConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 10_000,
            abort_or_cancel_timeout_ms: 2_000,
        }
    }
}
