/// What to do with a job after one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Succeed,
    /// Back to `pending`; the next poll cycle picks it up again.
    Retry { retry_count: u32 },
    /// Retry budget spent; the job becomes `failed`.
    Exhaust { retry_count: u32 },
}

/// Bounded retry budget shared by every webhook job.
///
/// Client errors (4xx) spend the budget exactly like transport errors and 5xx.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Global ceiling; a job's own `max_retries` can only lower it.
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn effective_max(&self, job_max_retries: u32) -> u32 {
        job_max_retries.min(self.max_retries)
    }

    pub fn decide(&self, succeeded: bool, retry_count: u32, job_max_retries: u32) -> RetryDecision {
        if succeeded {
            return RetryDecision::Succeed;
        }

        let retry_count = retry_count.saturating_add(1);
        if retry_count >= self.effective_max(job_max_retries) {
            RetryDecision::Exhaust { retry_count }
        } else {
            RetryDecision::Retry { retry_count }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3)
    }

    #[test]
    fn test_success_ignores_retry_count() {
        assert_eq!(policy().decide(true, 2, 3), RetryDecision::Succeed);
    }

    #[test]
    fn test_failure_below_budget_retries() {
        for count in 0..2 {
            assert_eq!(
                policy().decide(false, count, 3),
                RetryDecision::Retry {
                    retry_count: count + 1
                }
            );
        }
    }

    #[test]
    fn test_last_allowed_failure_exhausts() {
        assert_eq!(
            policy().decide(false, 2, 3),
            RetryDecision::Exhaust { retry_count: 3 }
        );
    }

    #[test]
    fn test_job_budget_lowers_global_ceiling() {
        assert_eq!(
            policy().decide(false, 0, 1),
            RetryDecision::Exhaust { retry_count: 1 }
        );
        // A job asking for more than the ceiling is still capped.
        assert_eq!(
            policy().decide(false, 2, 10),
            RetryDecision::Exhaust { retry_count: 3 }
        );
    }
}
