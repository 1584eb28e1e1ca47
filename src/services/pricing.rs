// services/pricing.rs
//
// Pure price computation for stacked discounts. No I/O: the orchestrator
// gathers the inputs (offering, reserved slot, promo) and this module turns
// them into a final chargeable amount plus the breakdown persisted on the
// Purchase row.
use chrono::{DateTime, Utc};

use crate::models::offering::Offering;
use crate::models::promo_code::{PromoCode, PromoCodeType};
use crate::models::purchase::{AppliedDiscount, DiscountKind};

/// Smallest amount the gateway will charge, in minor currency units.
pub const MINIMUM_CHARGE_MINOR: i64 = 50;

/// Result of a pricing run: the final amount and everything needed to
/// persist and display the receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub full_price: i64,
    pub fixed_discounts: Vec<AppliedDiscount>,
    pub percent_discount: Option<u32>,
    pub final_price: i64,
    pub is_early_bird: bool,
}

impl Quote {
    pub fn is_free(&self) -> bool {
        self.final_price == 0
    }

    pub fn is_below_minimum(&self) -> bool {
        self.final_price > 0 && self.final_price < MINIMUM_CHARGE_MINOR
    }
}

/// Fixed discounts first, clamped at zero, then the percent discount on the
/// remainder, rounded to the nearest minor unit and clamped again.
pub fn compute_price(base: i64, fixed: &[AppliedDiscount], percent: Option<u32>) -> i64 {
    let fixed_total: i64 = fixed.iter().map(|d| d.amount).sum();
    let mut remainder = (base - fixed_total).max(0);

    if let Some(pct) = percent {
        let pct = i64::from(pct.min(100));
        // integer half-up rounding
        remainder = ((remainder * (100 - pct)) + 50) / 100;
        remainder = remainder.max(0);
    }

    remainder
}

/// Build the full quote for one checkout attempt.
///
/// `limited_slot_granted` must reflect an actual reservation (or a
/// discount the offering hands out without a counter); this function does
/// not check capacity. Early-bird eligibility is decided here against
/// `now` — two calls straddling the deadline can disagree, which is the
/// documented point-in-time semantics, not a bug.
pub fn quote(
    offering: &Offering,
    limited_slot_granted: bool,
    promo: Option<&PromoCode>,
    now: DateTime<Utc>,
) -> Quote {
    let mut fixed = Vec::new();

    if limited_slot_granted {
        if let Some(amount) = offering.limited_slot_discount {
            if amount > 0 {
                fixed.push(AppliedDiscount {
                    kind: DiscountKind::LimitedSlot,
                    amount,
                });
            }
        }
    }

    let is_early_bird = offering.is_early_bird_open(now);
    if is_early_bird {
        if let Some(amount) = offering.early_bird_discount {
            fixed.push(AppliedDiscount {
                kind: DiscountKind::EarlyBird,
                amount,
            });
        }
    }

    let mut percent = None;
    if let Some(code) = promo {
        match code.code_type {
            PromoCodeType::FixedBundle => {
                if let Some(amount) = code.discount_amount {
                    fixed.push(AppliedDiscount {
                        kind: DiscountKind::Promo,
                        amount,
                    });
                }
            }
            PromoCodeType::PercentStaff => {
                percent = code.discount_percent;
            }
        }
    }

    let final_price = compute_price(offering.full_price, &fixed, percent);

    Quote {
        full_price: offering.full_price,
        fixed_discounts: fixed,
        percent_discount: percent,
        final_price,
        is_early_bird,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mongodb::bson;

    fn offering(full_price: i64) -> Offering {
        Offering {
            id: None,
            name: "Discipleship Intensive".to_string(),
            full_price,
            limited_slot_limit: None,
            limited_slot_discount: None,
            limited_slot_count: 0,
            early_bird_deadline: None,
            early_bird_discount: None,
            created_at: Utc::now(),
        }
    }

    fn percent_promo(pct: u32) -> PromoCode {
        PromoCode {
            id: None,
            code: "STAFF10".to_string(),
            code_type: PromoCodeType::PercentStaff,
            discount_amount: None,
            discount_percent: Some(pct),
            owner_user_id: None,
            eligible_offering_ids: None,
            used: false,
            used_by: None,
            used_at: None,
            created_at: Utc::now(),
        }
    }

    fn fixed_promo(amount: i64) -> PromoCode {
        PromoCode {
            id: None,
            code: "BUNDLE".to_string(),
            code_type: PromoCodeType::FixedBundle,
            discount_amount: Some(amount),
            discount_percent: None,
            owner_user_id: Some("u1".to_string()),
            eligible_offering_ids: None,
            used: false,
            used_by: None,
            used_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn stacked_discounts_fixed_then_percent() {
        // 10000 - 2000 - 1000 = 7000, then 10% off -> 6300
        let mut off = offering(10_000);
        off.limited_slot_discount = Some(2_000);
        off.early_bird_discount = Some(1_000);
        off.early_bird_deadline =
            Some(bson::DateTime::from_chrono(Utc::now() + Duration::days(7)));

        let q = quote(&off, true, Some(&percent_promo(10)), Utc::now());

        assert_eq!(q.final_price, 6_300);
        assert_eq!(q.fixed_discounts.len(), 2);
        assert_eq!(q.percent_discount, Some(10));
        assert!(q.is_early_bird);
    }

    #[test]
    fn fixed_discounts_clamp_at_zero() {
        let q = quote(&offering(10_000), false, Some(&fixed_promo(10_000)), Utc::now());
        assert_eq!(q.final_price, 0);
        assert!(q.is_free());

        let q = quote(&offering(10_000), false, Some(&fixed_promo(25_000)), Utc::now());
        assert_eq!(q.final_price, 0);
    }

    #[test]
    fn percent_applies_to_clamped_remainder() {
        // remainder already 0, percent cannot go negative
        assert_eq!(
            compute_price(
                5_000,
                &[AppliedDiscount { kind: DiscountKind::Promo, amount: 6_000 }],
                Some(50)
            ),
            0
        );
    }

    #[test]
    fn percent_rounds_to_nearest_minor_unit() {
        // 999 * 0.9 = 899.1 -> 899
        assert_eq!(compute_price(999, &[], Some(10)), 899);
        // 995 * 0.5 = 497.5 -> 498 (half up)
        assert_eq!(compute_price(995, &[], Some(50)), 498);
    }

    #[test]
    fn early_bird_closes_at_deadline() {
        let mut off = offering(10_000);
        off.early_bird_discount = Some(1_000);
        off.early_bird_deadline =
            Some(bson::DateTime::from_chrono(Utc::now() - Duration::seconds(1)));

        let q = quote(&off, false, None, Utc::now());
        assert!(!q.is_early_bird);
        assert_eq!(q.final_price, 10_000);
    }

    #[test]
    fn minimum_charge_floor() {
        let q = quote(&offering(49), false, None, Utc::now());
        assert!(q.is_below_minimum());

        let q = quote(&offering(50), false, None, Utc::now());
        assert!(!q.is_below_minimum());

        // exactly zero is free, not below-minimum
        let q = quote(&offering(100), false, Some(&fixed_promo(100)), Utc::now());
        assert!(q.is_free());
        assert!(!q.is_below_minimum());
    }

    #[test]
    fn limited_slot_discount_requires_grant() {
        let mut off = offering(10_000);
        off.limited_slot_discount = Some(2_000);
        off.limited_slot_limit = Some(5);

        let q = quote(&off, false, None, Utc::now());
        assert_eq!(q.final_price, 10_000);
        assert!(q.fixed_discounts.is_empty());
    }
}
