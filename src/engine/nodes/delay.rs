//! Pause node: wait a fixed duration or until an absolute instant,
//! with optional jitter. The per-node timeout still bounds the wait.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::registry::{NodeContext, NodeError, NodeHandler};

#[derive(Debug, Default, Deserialize)]
pub struct DelayParams {
    #[serde(default)]
    pub seconds: Option<u64>,
    #[serde(default)]
    pub minutes: Option<u64>,
    #[serde(default)]
    pub hours: Option<u64>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub jitter_seconds: Option<u64>,
}

pub fn compute_delay(
    params: &DelayParams,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> Result<Duration, NodeError> {
    let mut fixed: u64 = 0;
    fixed += params.seconds.unwrap_or(0);
    fixed = fixed
        .checked_add(params.minutes.unwrap_or(0).saturating_mul(60))
        .ok_or_else(|| NodeError::new("delay duration overflow"))?;
    fixed = fixed
        .checked_add(params.hours.unwrap_or(0).saturating_mul(3600))
        .ok_or_else(|| NodeError::new("delay duration overflow"))?;

    let until_delay = match params.until {
        Some(target) if target > now => (target - now)
            .to_std()
            .map_err(|_| NodeError::new("delay target out of range"))?,
        _ => Duration::ZERO,
    };

    if fixed == 0 && params.until.is_none() {
        return Err(NodeError::new(
            "delay requires a duration or an absolute target",
        ));
    }

    let base = Duration::from_secs(fixed).max(until_delay);
    let jitter = match params.jitter_seconds {
        Some(range) if range > 0 && !base.is_zero() => {
            Duration::from_secs(rng.random_range(0..=range))
        }
        _ => Duration::ZERO,
    };
    Ok(base + jitter)
}

pub struct DelayNode;

#[async_trait]
impl NodeHandler for DelayNode {
    async fn execute(&self, ctx: NodeContext) -> Result<Value, NodeError> {
        let params: DelayParams = serde_json::from_value(ctx.parameters.clone())
            .map_err(|_| NodeError::new("invalid delay configuration"))?;
        let total = compute_delay(&params, Utc::now(), &mut rand::rng())?;

        if !total.is_zero() {
            tokio::time::sleep(total).await;
        }

        Ok(json!({
            "waited_ms": total.as_millis() as u64,
            "resumed_at": Utc::now().to_rfc3339(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn fixed_components_sum() {
        let params = DelayParams {
            seconds: Some(30),
            minutes: Some(2),
            hours: Some(1),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let delay = compute_delay(&params, Utc::now(), &mut rng).unwrap();
        assert_eq!(delay.as_secs(), 3600 + 120 + 30);
    }

    #[test]
    fn past_target_is_immediate() {
        let now = Utc::now();
        let params = DelayParams {
            until: Some(now - chrono::Duration::minutes(5)),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(2);
        let delay = compute_delay(&params, now, &mut rng).unwrap();
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn future_target_waits_until_then() {
        let now = Utc::now();
        let params = DelayParams {
            until: Some(now + chrono::Duration::seconds(90)),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let delay = compute_delay(&params, now, &mut rng).unwrap();
        assert_eq!(delay.as_secs(), 90);
    }

    #[test]
    fn jitter_stays_within_range() {
        let params = DelayParams {
            seconds: Some(60),
            jitter_seconds: Some(5),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(4);
        let delay = compute_delay(&params, Utc::now(), &mut rng).unwrap();
        assert!(delay.as_secs() >= 60 && delay.as_secs() <= 65);
    }

    #[test]
    fn missing_configuration_errors() {
        let params = DelayParams::default();
        let mut rng = StdRng::seed_from_u64(5);
        let err = compute_delay(&params, Utc::now(), &mut rng).unwrap_err();
        assert!(err.message.contains("requires a duration"));
    }
}
