use http::StatusCode;
use rand::Rng;
use time::OffsetDateTime;

use crate::auth::AuthSubject;
use crate::registry::Group;

/// Move `ratio` of the cache-read tokens into cache-creation for billing.
/// Sum-preserving; the same rounding runs at both call sites (response
/// rewrite and usage recording), so the two always agree.
pub fn transfer_cache_tokens(cache_creation: i64, cache_read: i64, ratio: f64) -> (i64, i64) {
    if cache_read <= 0 || ratio <= 0.0 {
        return (cache_creation, cache_read);
    }
    let ratio = ratio.min(1.0);
    let moved = ((cache_read as f64) * ratio).round() as i64;
    let moved = moved.min(cache_read);
    (cache_creation + moved, cache_read - moved)
}

/// Probability gate for the transfer. Deterministic at the extremes so 0 and
/// 1 behave as hard switches.
pub fn should_transfer(probability: f64) -> bool {
    should_transfer_with(probability, &mut rand::rng())
}

pub fn should_transfer_with<R: Rng + ?Sized>(probability: f64, rng: &mut R) -> bool {
    if probability <= 0.0 {
        return false;
    }
    if probability >= 1.0 {
        return true;
    }
    rng.random::<f64>() < probability
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferConfig {
    pub ratio: f64,
    pub probability: f64,
}

/// Per-field user override on top of the group defaults.
pub fn effective_transfer(group: &Group, subject: &AuthSubject) -> TransferConfig {
    TransferConfig {
        ratio: subject
            .cache_read_transfer_ratio
            .unwrap_or(group.cache_read_transfer_ratio),
        probability: subject
            .cache_read_transfer_probability
            .unwrap_or(group.cache_read_transfer_probability),
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BillingError {
    #[error("Insufficient balance, please top up")]
    InsufficientBalance,
    #[error("Subscription expired, please renew")]
    SubscriptionExpired,
}

impl BillingError {
    pub fn status(&self) -> StatusCode {
        match self {
            BillingError::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,
            BillingError::SubscriptionExpired => StatusCode::FORBIDDEN,
        }
    }
}

/// Re-checked after the slot wait: a live subscription admits the request
/// outright, otherwise the prepaid balance must be positive.
pub fn check_eligibility(subject: &AuthSubject, now: OffsetDateTime) -> Result<(), BillingError> {
    if let Some(expires_at) = subject.subscription_expires_at {
        if expires_at > now {
            return Ok(());
        }
        return Err(BillingError::SubscriptionExpired);
    }
    if subject.balance_cents > 0 {
        return Ok(());
    }
    Err(BillingError::InsufficientBalance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn group(ratio: f64, probability: f64) -> Group {
        Group {
            id: 1,
            name: "pool".to_string(),
            cache_read_transfer_ratio: ratio,
            cache_read_transfer_probability: probability,
        }
    }

    fn subject(ratio: Option<f64>, probability: Option<f64>) -> AuthSubject {
        AuthSubject {
            user_id: 1,
            key_id: 1,
            group_id: 1,
            concurrency: 2,
            balance_cents: 100,
            cache_read_transfer_ratio: ratio,
            cache_read_transfer_probability: probability,
            subscription_expires_at: None,
        }
    }

    #[test]
    fn zero_ratio_moves_nothing() {
        assert_eq!(transfer_cache_tokens(100, 1000, 0.0), (100, 1000));
    }

    #[test]
    fn negative_ratio_moves_nothing() {
        assert_eq!(transfer_cache_tokens(100, 1000, -0.1), (100, 1000));
    }

    #[test]
    fn zero_cache_read_moves_nothing() {
        assert_eq!(transfer_cache_tokens(100, 0, 0.2), (100, 0));
    }

    #[test]
    fn fractional_transfers() {
        assert_eq!(transfer_cache_tokens(100, 1000, 0.1), (200, 900));
        assert_eq!(transfer_cache_tokens(50, 2000, 0.15), (350, 1700));
        assert_eq!(transfer_cache_tokens(0, 5000, 0.2), (1000, 4000));
        assert_eq!(transfer_cache_tokens(200, 800, 0.3), (440, 560));
    }

    #[test]
    fn full_transfer_drains_cache_read() {
        assert_eq!(transfer_cache_tokens(200, 800, 1.0), (1000, 0));
    }

    #[test]
    fn over_one_ratio_is_clamped() {
        assert_eq!(transfer_cache_tokens(100, 500, 1.5), (600, 0));
    }

    #[test]
    fn sum_is_preserved() {
        let cases = [
            (0, 1000, 0.1),
            (100, 900, 0.2),
            (500, 500, 0.5),
            (1000, 0, 0.3),
            (123, 456, 0.15),
            (1_000_000, 5_000_000, 0.3),
        ];
        for (creation, read, ratio) in cases {
            let (new_creation, new_read) = transfer_cache_tokens(creation, read, ratio);
            assert_eq!(new_creation + new_read, creation + read, "ratio {ratio}");
            assert!(new_creation >= creation);
            assert!(new_read >= 0);
        }
    }

    #[test]
    fn tiny_ratio_rounds_to_about_one_token() {
        let (creation, read) = transfer_cache_tokens(200, 800, 0.001);
        assert_eq!(creation + read, 1000);
        assert!(creation == 200 || creation == 201);
    }

    #[test]
    fn gate_is_deterministic_at_extremes() {
        for _ in 0..100 {
            assert!(!should_transfer(0.0));
            assert!(!should_transfer(-0.5));
            assert!(should_transfer(1.0));
            assert!(should_transfer(1.5));
        }
    }

    #[test]
    fn gate_distribution_tracks_probability() {
        let iterations = 10_000;
        for p in [0.1, 0.3, 0.5, 0.7, 0.9] {
            let hits = (0..iterations).filter(|_| should_transfer(p)).count();
            let ratio = hits as f64 / iterations as f64;
            assert!(
                (ratio - p).abs() <= 0.05,
                "probability {p}: observed {ratio}"
            );
        }
    }

    #[test]
    fn gate_accepts_injected_rng() {
        struct ZeroRng;
        impl rand::RngCore for ZeroRng {
            fn next_u32(&mut self) -> u32 {
                0
            }
            fn next_u64(&mut self) -> u64 {
                0
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                dest.fill(0);
            }
        }
        // A zero sample always lands below any positive probability.
        assert!(should_transfer_with(0.5, &mut ZeroRng));
        assert!(!should_transfer_with(0.0, &mut ZeroRng));
    }

    #[test]
    fn user_overrides_group_per_field() {
        let g = group(0.5, 1.0);
        assert_eq!(
            effective_transfer(&g, &subject(Some(0.3), Some(0.5))),
            TransferConfig {
                ratio: 0.3,
                probability: 0.5
            }
        );
        assert_eq!(
            effective_transfer(&g, &subject(None, None)),
            TransferConfig {
                ratio: 0.5,
                probability: 1.0
            }
        );
        assert_eq!(
            effective_transfer(&g, &subject(Some(0.3), None)),
            TransferConfig {
                ratio: 0.3,
                probability: 1.0
            }
        );
    }

    #[test]
    fn eligibility_checks_subscription_then_balance() {
        let now = OffsetDateTime::now_utc();
        let mut s = subject(None, None);
        assert_eq!(check_eligibility(&s, now), Ok(()));

        s.balance_cents = 0;
        assert_eq!(
            check_eligibility(&s, now),
            Err(BillingError::InsufficientBalance)
        );

        s.subscription_expires_at = Some(now + Duration::days(1));
        assert_eq!(check_eligibility(&s, now), Ok(()));

        s.subscription_expires_at = Some(now - Duration::days(1));
        assert_eq!(
            check_eligibility(&s, now),
            Err(BillingError::SubscriptionExpired)
        );
    }
}
