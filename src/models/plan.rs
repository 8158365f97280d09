use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Subscription,
    OneTime,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::Subscription => "subscription",
            PlanKind::OneTime => "one_time",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plan {
    pub id: &'static str,
    /// Credits shown to the user.
    pub display_credits: f64,
    /// Amount added to the key limit, in the key service's native unit.
    pub native_credits: f64,
    pub kind: PlanKind,
}

impl Plan {
    pub fn is_subscription(&self) -> bool {
        self.kind == PlanKind::Subscription
    }

    /// Environment variable holding the Stripe price id, e.g. `STRIPE_PRICE_MONTHLY_BASIC`.
    pub fn price_env_var(&self) -> String {
        format!(
            "STRIPE_PRICE_{}",
            self.id.replace('-', "_").to_ascii_uppercase()
        )
    }
}

// Checkout pricing and webhook fulfilment both read this table.
pub const PLANS: [Plan; 6] = [
    Plan {
        id: "monthly-basic",
        display_credits: 1000.0,
        native_credits: 300.0,
        kind: PlanKind::Subscription,
    },
    Plan {
        id: "monthly-pro",
        display_credits: 2000.0,
        native_credits: 600.0,
        kind: PlanKind::Subscription,
    },
    Plan {
        id: "monthly-enterprise",
        display_credits: 3000.0,
        native_credits: 900.0,
        kind: PlanKind::Subscription,
    },
    Plan {
        id: "credits-1500",
        display_credits: 1500.0,
        native_credits: 450.0,
        kind: PlanKind::OneTime,
    },
    Plan {
        id: "credits-6000",
        display_credits: 6000.0,
        native_credits: 1800.0,
        kind: PlanKind::OneTime,
    },
    Plan {
        id: "credits-15000",
        display_credits: 15000.0,
        native_credits: 4500.0,
        kind: PlanKind::OneTime,
    },
];

pub fn find_plan(plan_id: &str) -> Option<&'static Plan> {
    let wanted = plan_id.trim();
    PLANS.iter().find(|plan| plan.id == wanted)
}
