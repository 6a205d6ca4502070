//! Settlement outcome decision
//!
//! The worker asks a `SettlementDecider` for the final status of a pending
//! payment. Production uses `SimulatedDecider`, which stands in for a
//! settlement network; tests inject deterministic doubles.

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

use crate::models::{PaymentId, TerminalStatus};

pub const DEFAULT_SETTLEMENT_LATENCY: Duration = Duration::from_secs(2);
pub const DEFAULT_FAILURE_RATE: f64 = 0.3;

#[async_trait]
pub trait SettlementDecider: Send + Sync {
    /// Decide the terminal status of a payment that is still pending
    async fn decide(&self, payment_id: PaymentId) -> TerminalStatus;
}

/// Simulated settlement network: fixed latency, random outcome
#[derive(Debug, Clone)]
pub struct SimulatedDecider {
    latency: Duration,
    failure_rate: f64,
}

impl SimulatedDecider {
    /// `failure_rate` is clamped into `0.0..=1.0`
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        let failure_rate = if failure_rate.is_nan() {
            DEFAULT_FAILURE_RATE
        } else {
            failure_rate.clamp(0.0, 1.0)
        };
        Self {
            latency,
            failure_rate,
        }
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn failure_rate(&self) -> f64 {
        self.failure_rate
    }

    // Kept out of the async fn: ThreadRng is not Send
    fn draw(&self) -> TerminalStatus {
        if rand::thread_rng().gen_bool(self.failure_rate) {
            TerminalStatus::Failed
        } else {
            TerminalStatus::Success
        }
    }
}

impl Default for SimulatedDecider {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLEMENT_LATENCY, DEFAULT_FAILURE_RATE)
    }
}

#[async_trait]
impl SettlementDecider for SimulatedDecider {
    async fn decide(&self, payment_id: PaymentId) -> TerminalStatus {
        tokio::time::sleep(self.latency).await;
        let outcome = self.draw();
        tracing::debug!(payment_id = payment_id, outcome = %outcome, "Settlement decided");
        outcome
    }
}

/// Always returns the same outcome, without delay
#[derive(Debug, Clone, Copy)]
pub struct FixedDecider(pub TerminalStatus);

#[async_trait]
impl SettlementDecider for FixedDecider {
    async fn decide(&self, _payment_id: PaymentId) -> TerminalStatus {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_rate_is_clamped() {
        assert_eq!(SimulatedDecider::new(Duration::ZERO, 1.7).failure_rate(), 1.0);
        assert_eq!(SimulatedDecider::new(Duration::ZERO, -0.2).failure_rate(), 0.0);
        assert_eq!(
            SimulatedDecider::new(Duration::ZERO, f64::NAN).failure_rate(),
            DEFAULT_FAILURE_RATE
        );
    }

    #[test]
    fn test_defaults() {
        let decider = SimulatedDecider::default();
        assert_eq!(decider.latency(), Duration::from_secs(2));
        assert_eq!(decider.failure_rate(), 0.3);
    }

    #[tokio::test]
    async fn test_extreme_rates_are_deterministic() {
        let always_fail = SimulatedDecider::new(Duration::ZERO, 1.0);
        let never_fail = SimulatedDecider::new(Duration::ZERO, 0.0);

        for id in 1..=20 {
            assert_eq!(always_fail.decide(id).await, TerminalStatus::Failed);
            assert_eq!(never_fail.decide(id).await, TerminalStatus::Success);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_applied() {
        let decider = SimulatedDecider::new(Duration::from_secs(2), 0.0);
        let start = tokio::time::Instant::now();
        decider.decide(1).await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_fixed_decider() {
        assert_eq!(FixedDecider(TerminalStatus::Failed).decide(9).await, TerminalStatus::Failed);
    }
}
