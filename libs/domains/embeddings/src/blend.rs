//! Interest blending.
//!
//! ```text
//! decay  = 0.5 ^ (elapsed / half_life)
//! result = normalize(decay * prior + weight(event_type) * event)
//! ```
//!
//! `elapsed` runs from the prior's `last_updated_at` to the event's
//! `occurred_at` and is clamped at zero. Without a prior the result is the
//! normalized event vector.

use crate::config::EventWeights;
use crate::math::{normalize, random_unit_vector};
use crate::models::{EmbeddingVector, EventType};
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blender {
    weights: EventWeights,
    half_life: Duration,
}

impl Blender {
    pub fn new(weights: EventWeights, half_life: Duration) -> Self {
        Self { weights, half_life }
    }

    /// Multiplier applied to a prior that is `elapsed` old.
    pub fn decay(&self, elapsed: chrono::Duration) -> f32 {
        let half_life = self.half_life.as_secs_f64();
        if half_life <= 0.0 {
            return 0.0;
        }
        let elapsed = elapsed.num_milliseconds().max(0) as f64 / 1000.0;
        0.5_f64.powf(elapsed / half_life) as f32
    }

    /// New unit-length interest vector after one event.
    pub fn blend(
        &self,
        prior: Option<&EmbeddingVector>,
        event_vector: &[f32],
        event_type: EventType,
        occurred_at: DateTime<Utc>,
    ) -> Vec<f32> {
        let weight = self.weights.weight(event_type);

        let combined: Vec<f32> = match prior {
            Some(prior) if prior.vector.len() == event_vector.len() => {
                let decay = self.decay(occurred_at - prior.last_updated_at);
                prior
                    .vector
                    .iter()
                    .zip(event_vector)
                    .map(|(p, e)| decay * p + weight * e)
                    .collect()
            }
            _ => event_vector.to_vec(),
        };

        // Exact cancellation leaves no direction; keep the event's
        normalize(&combined)
            .or_else(|| normalize(event_vector))
            .unwrap_or_else(|| random_unit_vector(event_vector.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{cosine_similarity, magnitude};
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn blender() -> Blender {
        Blender::new(EventWeights::default(), Duration::from_secs(72 * 3600))
    }

    fn prior(vector: Vec<f32>, at: DateTime<Utc>) -> EmbeddingVector {
        EmbeddingVector::first(Uuid::new_v4(), vector, at)
    }

    #[test]
    fn test_decay_halves_each_half_life() {
        let b = blender();
        assert!((b.decay(ChronoDuration::zero()) - 1.0).abs() < 1e-6);
        assert!((b.decay(ChronoDuration::hours(72)) - 0.5).abs() < 1e-6);
        assert!((b.decay(ChronoDuration::hours(144)) - 0.25).abs() < 1e-6);
        // Events older than the prior do not amplify it
        assert!((b.decay(ChronoDuration::hours(-10)) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_first_event_is_normalized_event_vector() {
        let result = blender().blend(None, &[3.0, 4.0], EventType::View, Utc::now());
        assert!((result[0] - 0.6).abs() < 1e-6);
        assert!((result[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_result_is_unit_length() {
        let now = Utc::now();
        let p = prior(vec![1.0, 0.0, 0.0], now - ChronoDuration::hours(5));
        let result = blender().blend(Some(&p), &[0.0, 1.0, 0.0], EventType::Click, now);
        assert!((magnitude(&result) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_purchase_moves_further_than_search() {
        let now = Utc::now();
        let p = prior(vec![1.0, 0.0], now);
        let event = [0.0, 1.0];

        let after_purchase = blender().blend(Some(&p), &event, EventType::Purchase, now);
        let after_search = blender().blend(Some(&p), &event, EventType::Search, now);

        assert!(
            cosine_similarity(&after_purchase, &event) > cosine_similarity(&after_search, &event)
        );
    }

    #[test]
    fn test_old_prior_counts_less() {
        let now = Utc::now();
        let event = [0.0, 1.0];
        let fresh = prior(vec![1.0, 0.0], now);
        let stale = prior(vec![1.0, 0.0], now - ChronoDuration::days(30));

        let from_fresh = blender().blend(Some(&fresh), &event, EventType::View, now);
        let from_stale = blender().blend(Some(&stale), &event, EventType::View, now);

        assert!(cosine_similarity(&from_stale, &event) > cosine_similarity(&from_fresh, &event));
    }

    #[test]
    fn test_cancellation_falls_back_to_event_direction() {
        let now = Utc::now();
        let weights = EventWeights {
            purchase: 1.0,
            click: 0.5,
            view: 0.25,
            search: 0.15,
        };
        let b = Blender::new(weights, Duration::from_secs(3600));
        let p = prior(vec![-1.0, 0.0], now);
        let result = b.blend(Some(&p), &[1.0, 0.0], EventType::Purchase, now);
        assert!((result[0] - 1.0).abs() < 1e-6);
    }
}
