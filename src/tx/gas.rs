//! Gas policies and EIP-1559 fee math for submissions and replacements

use ethers::types::U256;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Multipliers are applied in basis points so fee math stays in integers
const BASIS_POINTS: u64 = 10_000;

/// How aggressively an account pushes transactions
#[derive(Debug, Clone, PartialEq)]
pub struct GasPolicy {
    pub name: &'static str,
    /// Maximum transactions an account keeps in flight
    pub max_pending_transactions: usize,
    /// How long a transaction may stay unmined before it is replaced
    pub resend_timeout: Duration,
    /// Tip multiplier applied on every replacement
    pub fee_multiplier: f64,
}

impl GasPolicy {
    /// Policy for the funding account: many transfers in flight, gentle bumps
    pub fn president() -> Self {
        Self {
            name: "President",
            max_pending_transactions: 1000,
            resend_timeout: Duration::from_secs(10),
            fee_multiplier: 1.1,
        }
    }
}

/// Named aggressiveness levels for fans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CrazedLevel {
    /// Pick a concrete level at random for every fan
    Mixed,
    Indifferent,
    Curious,
    Interested,
    Obsessed,
    Manic,
}

impl CrazedLevel {
    pub const CONCRETE: [CrazedLevel; 5] = [
        CrazedLevel::Indifferent,
        CrazedLevel::Curious,
        CrazedLevel::Interested,
        CrazedLevel::Obsessed,
        CrazedLevel::Manic,
    ];

    /// Resolve `Mixed` to a random concrete level
    pub fn resolve(self) -> CrazedLevel {
        match self {
            CrazedLevel::Mixed => {
                let idx = rand::thread_rng().gen_range(0..Self::CONCRETE.len());
                Self::CONCRETE[idx]
            }
            level => level,
        }
    }

    /// Gas policy for this level. `Mixed` is resolved first.
    pub fn policy(self) -> GasPolicy {
        match self.resolve() {
            CrazedLevel::Indifferent => GasPolicy {
                name: "Indifferent",
                max_pending_transactions: 1,
                resend_timeout: Duration::from_secs(5 * 60),
                fee_multiplier: 1.1,
            },
            CrazedLevel::Curious => GasPolicy {
                name: "Curious",
                max_pending_transactions: 2,
                resend_timeout: Duration::from_secs(2 * 60),
                fee_multiplier: 1.25,
            },
            CrazedLevel::Interested => GasPolicy {
                name: "Interested",
                max_pending_transactions: 3,
                resend_timeout: Duration::from_secs(60),
                fee_multiplier: 1.5,
            },
            CrazedLevel::Obsessed => GasPolicy {
                name: "Obsessed",
                max_pending_transactions: 5,
                resend_timeout: Duration::from_secs(30),
                fee_multiplier: 1.75,
            },
            CrazedLevel::Manic | CrazedLevel::Mixed => GasPolicy {
                name: "Manic",
                max_pending_transactions: 10,
                resend_timeout: Duration::from_secs(10),
                fee_multiplier: 2.0,
            },
        }
    }
}

impl fmt::Display for CrazedLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CrazedLevel::Mixed => "Mixed",
            CrazedLevel::Indifferent => "Indifferent",
            CrazedLevel::Curious => "Curious",
            CrazedLevel::Interested => "Interested",
            CrazedLevel::Obsessed => "Obsessed",
            CrazedLevel::Manic => "Manic",
        };
        f.write_str(name)
    }
}

impl FromStr for CrazedLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mixed" => Ok(CrazedLevel::Mixed),
            "indifferent" => Ok(CrazedLevel::Indifferent),
            "curious" => Ok(CrazedLevel::Curious),
            "interested" => Ok(CrazedLevel::Interested),
            "obsessed" => Ok(CrazedLevel::Obsessed),
            "manic" => Ok(CrazedLevel::Manic),
            other => Err(format!("unknown crazed level '{}'", other)),
        }
    }
}

/// Fee cap that survives a doubling of the base fee before inclusion
pub fn fee_cap(base_fee: U256, tip_cap: U256) -> U256 {
    base_fee.saturating_mul(U256::from(2)).saturating_add(tip_cap)
}

/// Multiply `value` by `multiplier`, rounding up, and never return less than `value + 1`
pub fn bump(value: U256, multiplier: f64) -> U256 {
    let bps = (multiplier.max(0.0) * BASIS_POINTS as f64).round() as u64;
    let scaled = value
        .saturating_mul(U256::from(bps))
        .saturating_add(U256::from(BASIS_POINTS - 1))
        / U256::from(BASIS_POINTS);
    std::cmp::max(scaled, value.saturating_add(U256::one()))
}

/// Fee caps for a replacement of a transaction priced at `old_tip` / `old_fee_cap`
pub fn replacement_fees(
    base_fee: U256,
    old_tip: U256,
    old_fee_cap: U256,
    multiplier: f64,
) -> (U256, U256) {
    let tip = bump(old_tip, multiplier);
    let cap = std::cmp::max(fee_cap(base_fee, tip), bump(old_fee_cap, multiplier));
    (tip, cap)
}
