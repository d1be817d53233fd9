//! Earning-rule condition evaluation.

use common::geo::Coord;
use common::money::Xaf;
use common::trip::PaymentMethod;
use serde::Serialize;
use store::models::RuleCondition;

/// Everything a rule condition may key on, assembled once per settlement.
#[derive(Clone, Debug)]
pub struct RuleContext {
    pub fare: Xaf,
    pub city: Option<String>,
    /// Local hour of the trip's completion, 0-23.
    pub hour: u8,
    /// ISO weekday, Monday = 1.
    pub weekday: u8,
    pub distance_m: u32,
    pub payment_method: PaymentMethod,
    pub driver_tier: Option<String>,
    pub pickup: Coord,
}

/// A required condition against an absent context attribute does not match.
pub fn matches(condition: &RuleCondition, ctx: &RuleContext) -> bool {
    if let Some(city) = &condition.city {
        match &ctx.city {
            Some(trip_city) if trip_city.eq_ignore_ascii_case(city) => (),
            _ => return false,
        }
    }

    // Inclusive hour window; start > end means it wraps past midnight
    // (22..=5 covers the night shift).
    if let (Some(start), Some(end)) =
        (condition.hour_start, condition.hour_end)
    {
        let inside = if start <= end {
            (start..=end).contains(&ctx.hour)
        } else {
            ctx.hour >= start || ctx.hour <= end
        };
        if !inside {
            return false;
        }
    }

    if let Some(days) = &condition.days_of_week {
        if !days.contains(&ctx.weekday) {
            return false;
        }
    }

    if let Some(min_fare) = condition.min_fare {
        if ctx.fare < min_fare {
            return false;
        }
    }
    if let Some(max_fare) = condition.max_fare {
        if ctx.fare > max_fare {
            return false;
        }
    }

    if let Some(min_m) = condition.min_distance_m {
        if ctx.distance_m < min_m {
            return false;
        }
    }
    if let Some(max_m) = condition.max_distance_m {
        if ctx.distance_m > max_m {
            return false;
        }
    }

    if let Some(methods) = &condition.payment_methods {
        if !methods.contains(&ctx.payment_method) {
            return false;
        }
    }

    if let Some(tiers) = &condition.driver_tiers {
        match &ctx.driver_tier {
            Some(tier)
                if tiers
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(tier)) => {}
            _ => return false,
        }
    }

    if let Some(zone) = &condition.pickup_zone {
        if !zone.contains(&ctx.pickup) {
            return false;
        }
    }

    true
}

/// One evaluated rule in the receipt's audit snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct AppliedRule {
    pub rule_id: common::ids::RuleId,
    pub name: String,
    pub rule_type: store::models::RuleType,
    pub priority: i32,
    pub matched: bool,
    /// Set on the rule that decided the commission.
    pub selected: bool,
    /// Signed XAF this rule added to the bonus total.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contribution_xaf: Option<i64>,
}

#[cfg(test)]
mod test {
    use super::*;
    use common::trip::PaymentMethod;
    use store::models::ZoneBox;

    fn ctx() -> RuleContext {
        RuleContext {
            fare: Xaf::new(3000),
            city: Some("Douala".to_string()),
            hour: 19,
            weekday: 5,
            distance_m: 4200,
            payment_method: PaymentMethod::Cash,
            driver_tier: Some("gold".to_string()),
            pickup: Coord::new(4.0511, 9.7679).unwrap(),
        }
    }

    #[test]
    fn empty_condition_matches_everything() {
        assert!(matches(&RuleCondition::default(), &ctx()));
    }

    #[test]
    fn city_is_case_insensitive() {
        let condition = RuleCondition {
            city: Some("douala".to_string()),
            ..Default::default()
        };
        assert!(matches(&condition, &ctx()));

        let other = RuleCondition {
            city: Some("Yaounde".to_string()),
            ..Default::default()
        };
        assert!(!matches(&other, &ctx()));
    }

    #[test]
    fn hour_window_wraps_midnight() {
        let night = RuleCondition {
            hour_start: Some(22),
            hour_end: Some(5),
            ..Default::default()
        };
        let mut late = ctx();
        late.hour = 23;
        assert!(matches(&night, &late));
        late.hour = 2;
        assert!(matches(&night, &late));
        late.hour = 12;
        assert!(!matches(&night, &late));
    }

    #[test]
    fn fare_bounds_inclusive() {
        let condition = RuleCondition {
            min_fare: Some(Xaf::new(3000)),
            max_fare: Some(Xaf::new(3000)),
            ..Default::default()
        };
        assert!(matches(&condition, &ctx()));

        let above = RuleCondition {
            min_fare: Some(Xaf::new(3001)),
            ..Default::default()
        };
        assert!(!matches(&above, &ctx()));
    }

    #[test]
    fn tier_required_but_unknown_does_not_match() {
        let condition = RuleCondition {
            driver_tiers: Some(vec!["gold".to_string()]),
            ..Default::default()
        };
        let mut anonymous = ctx();
        anonymous.driver_tier = None;
        assert!(!matches(&condition, &anonymous));
        assert!(matches(&condition, &ctx()));
    }

    #[test]
    fn pickup_zone_bounding_box() {
        let condition = RuleCondition {
            pickup_zone: Some(ZoneBox {
                name: "akwa".to_string(),
                min_lat: 4.04,
                max_lat: 4.06,
                min_lng: 9.76,
                max_lng: 9.78,
            }),
            ..Default::default()
        };
        assert!(matches(&condition, &ctx()));

        let mut elsewhere = ctx();
        elsewhere.pickup = Coord::new(4.20, 9.90).unwrap();
        assert!(!matches(&condition, &elsewhere));
    }

    #[test]
    fn payment_method_filter() {
        let momo_only = RuleCondition {
            payment_methods: Some(vec![PaymentMethod::Momo]),
            ..Default::default()
        };
        assert!(!matches(&momo_only, &ctx()));
    }
}
