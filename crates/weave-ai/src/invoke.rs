//! Retry & budget wrapper around agent invocations.
//!
//! Applies at most `retries + 1` attempts with the runtime's backoff
//! schedule, retries only transient kinds, and charges every successful
//! attempt against the shared token meter before the caller sees it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngExt;
use tracing::warn;

use weave_models::spec::{BackoffKind, RuntimeSpec};
use weave_models::TokenTotals;

use crate::agent::Agent;
use crate::error::{AiError, Result};

/// Minimum and maximum wait between attempts.
const MIN_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Shared cumulative token counter for one run.
#[derive(Debug, Default)]
pub struct TokenMeter {
    input: AtomicU64,
    output: AtomicU64,
    by_agent: Mutex<HashMap<String, u64>>,
}

impl TokenMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record usage and return the cumulative total after the add.
    pub fn add(&self, agent_id: &str, input: u64, output: u64) -> u64 {
        self.input.fetch_add(input, Ordering::SeqCst);
        let out_total = self.output.fetch_add(output, Ordering::SeqCst) + output;
        *self
            .by_agent
            .lock()
            .entry(agent_id.to_string())
            .or_insert(0) += input + output;
        self.input.load(Ordering::SeqCst) + out_total
    }

    pub fn total(&self) -> u64 {
        self.input.load(Ordering::SeqCst) + self.output.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> TokenTotals {
        let by_agent = self.by_agent.lock();
        let mut totals = TokenTotals {
            total_input: self.input.load(Ordering::SeqCst),
            total_output: self.output.load(Ordering::SeqCst),
            by_agent: Default::default(),
        };
        for (agent, tokens) in by_agent.iter() {
            totals.by_agent.insert(agent.clone(), *tokens);
        }
        totals
    }

    /// Seed the meter from a resumed session's totals.
    pub fn restore(&self, totals: &TokenTotals) {
        self.input.store(totals.total_input, Ordering::SeqCst);
        self.output.store(totals.total_output, Ordering::SeqCst);
        let mut by_agent = self.by_agent.lock();
        by_agent.clear();
        for (agent, tokens) in &totals.by_agent {
            by_agent.insert(agent.clone(), *tokens);
        }
    }
}

/// Backoff schedule derived from the runtime spec.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: BackoffKind,
    base: Duration,
}

impl RetryPolicy {
    pub fn from_runtime(runtime: &RuntimeSpec) -> Self {
        Self {
            retries: runtime.retries,
            backoff: runtime.backoff,
            base: MIN_DELAY,
        }
    }

    /// Wait before attempt `attempt` (1-based), clamped to [1s, 60s].
    /// A provider-supplied retry-after overrides the schedule.
    pub fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        if let Some(seconds) = retry_after_secs {
            return Duration::from_secs(seconds).clamp(MIN_DELAY, MAX_DELAY);
        }

        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = self.base.as_secs_f64() * f64::from(1u32 << exponent);
        let seconds = match self.backoff {
            BackoffKind::Constant => self.base.as_secs_f64(),
            BackoffKind::Exponential => scaled,
            BackoffKind::Jittered => {
                let factor: f64 = rand::rng().random_range(0.5..1.5);
                scaled * factor
            }
        };
        Duration::from_secs_f64(seconds).clamp(MIN_DELAY, MAX_DELAY)
    }
}

/// Result of a retried, budget-checked invocation.
#[derive(Debug, Clone)]
pub struct InvokeRecord {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub step_duration_s: f64,
    pub attempts: u32,
}

impl InvokeRecord {
    pub fn tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Invoke an agent with retry and budget accounting.
///
/// `on_retry` observes each transient failure before the backoff sleep.
/// Budget semantics: the attempt that crosses `max_tokens` is charged,
/// then the call fails with `BudgetExceeded`; one over-budget attempt
/// is an accepted race.
pub async fn invoke_with_retry(
    agent: &Agent,
    prompt: &str,
    policy: &RetryPolicy,
    meter: &TokenMeter,
    max_tokens: Option<u64>,
    mut on_retry: impl FnMut(u32, &AiError),
) -> Result<InvokeRecord> {
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match agent.complete_once(prompt).await {
            Ok(response) => {
                let total = meter.add(agent.agent_id(), response.input_tokens, response.output_tokens);
                if let Some(budget) = max_tokens {
                    if total >= budget {
                        return Err(AiError::BudgetExceeded(format!(
                            "cumulative tokens {total} reached max_tokens {budget}"
                        )));
                    }
                }
                agent.commit_turn(prompt, &response.text).await?;
                return Ok(InvokeRecord {
                    text: response.text,
                    input_tokens: response.input_tokens,
                    output_tokens: response.output_tokens,
                    step_duration_s: started.elapsed().as_secs_f64(),
                    attempts,
                });
            }
            Err(error) => {
                if !error.is_retryable() || attempts > policy.retries {
                    return Err(error);
                }
                let delay = policy.delay_for(attempts, error.retry_after());
                warn!(
                    agent_id = agent.agent_id(),
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying agent invocation"
                );
                on_retry(attempts, &error);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::llm::{MockClient, MockStep};
    use std::sync::Arc;

    fn agent_with(steps: Vec<MockStep>) -> (Agent, Arc<MockClient>) {
        let client = Arc::new(MockClient::from_steps("mock-1", steps));
        let agent = Agent::builder("writer", client.clone()).build();
        (agent, client)
    }

    fn policy(retries: u32, backoff: BackoffKind) -> RetryPolicy {
        let mut runtime = RuntimeSpec::default();
        runtime.retries = retries;
        runtime.backoff = backoff;
        RetryPolicy::from_runtime(&runtime)
    }

    #[test]
    fn delay_schedules() {
        let constant = policy(3, BackoffKind::Constant);
        assert_eq!(constant.delay_for(3, None), Duration::from_secs(1));

        let exponential = policy(3, BackoffKind::Exponential);
        assert_eq!(exponential.delay_for(1, None), Duration::from_secs(1));
        assert_eq!(exponential.delay_for(2, None), Duration::from_secs(2));
        assert_eq!(exponential.delay_for(3, None), Duration::from_secs(4));
        // Clamped at the 60s ceiling.
        assert_eq!(exponential.delay_for(10, None), Duration::from_secs(60));

        let jittered = policy(3, BackoffKind::Jittered);
        let d = jittered.delay_for(3, None);
        assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(6));
    }

    #[test]
    fn retry_after_wins_over_schedule() {
        let p = policy(3, BackoffKind::Exponential);
        assert_eq!(p.delay_for(1, Some(30)), Duration::from_secs(30));
        assert_eq!(p.delay_for(1, Some(600)), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let (agent, client) = agent_with(vec![
            MockStep::error("request timed out"),
            MockStep::error("server overloaded"),
            MockStep::text("ok"),
        ]);
        let meter = TokenMeter::new();
        let mut retries_seen = 0u32;

        let record = invoke_with_retry(
            &agent,
            "go",
            &policy(2, BackoffKind::Exponential),
            &meter,
            None,
            |_, _| retries_seen += 1,
        )
        .await
        .unwrap();

        assert_eq!(record.text, "ok");
        assert_eq!(record.attempts, 3);
        assert_eq!(retries_seen, 2);
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let (agent, client) = agent_with(vec![MockStep::error("invalid api key")]);
        let meter = TokenMeter::new();

        let err = invoke_with_retry(
            &agent,
            "go",
            &policy(3, BackoffKind::Constant),
            &meter,
            None,
            |_, _| {},
        )
        .await
        .unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_surfaces_last_error() {
        let (agent, client) = agent_with(vec![
            MockStep::error("request timed out"),
            MockStep::error("request timed out"),
            MockStep::error("request timed out"),
        ]);
        let meter = TokenMeter::new();

        let err = invoke_with_retry(
            &agent,
            "go",
            &policy(2, BackoffKind::Constant),
            &meter,
            None,
            |_, _| {},
        )
        .await
        .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn budget_crossing_attempt_fails_after_charging() {
        let (agent, _client) =
            agent_with(vec![MockStep::text("big").with_tokens(50, 60)]);
        let meter = TokenMeter::new();

        let err = invoke_with_retry(
            &agent,
            "go",
            &policy(0, BackoffKind::Constant),
            &meter,
            Some(100),
            |_, _| {},
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AiError::BudgetExceeded(_)));
        // The crossing attempt is still charged.
        assert_eq!(meter.total(), 110);
    }

    #[tokio::test]
    async fn meter_tracks_per_agent_usage() {
        let (agent, _client) = agent_with(vec![MockStep::text("hi").with_tokens(3, 4)]);
        let meter = TokenMeter::new();

        invoke_with_retry(
            &agent,
            "go",
            &policy(0, BackoffKind::Constant),
            &meter,
            None,
            |_, _| {},
        )
        .await
        .unwrap();

        let snapshot = meter.snapshot();
        assert_eq!(snapshot.total_input, 3);
        assert_eq!(snapshot.total_output, 4);
        assert_eq!(snapshot.by_agent["writer"], 7);
    }
}
