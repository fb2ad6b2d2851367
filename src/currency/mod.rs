//! Currency limits and rate helpers.

use std::collections::HashMap;

/// Rolling daily USD budget for payments per owner.
pub const MAX_DAILY_USD_LIMIT: f64 = 250.0;

/// Per-transaction send limit, localized to a currency.
#[derive(Debug, Clone, Copy)]
pub struct SendLimit {
    pub per_transaction: f64,
}

/// Per-transaction caps in the currencies clients may denominate sends in.
/// Roughly value-equivalent across currencies; reviewed manually.
pub fn send_limits() -> HashMap<&'static str, SendLimit> {
    HashMap::from([
        ("usd", SendLimit { per_transaction: 250.0 }),
        ("eur", SendLimit { per_transaction: 250.0 }),
        ("gbp", SendLimit { per_transaction: 200.0 }),
        ("jpy", SendLimit { per_transaction: 40_000.0 }),
        ("cad", SendLimit { per_transaction: 350.0 }),
        ("aud", SendLimit { per_transaction: 400.0 }),
    ])
}

/// Computed limits for one currency, as returned by the limits query.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ComputedSendLimit {
    pub next_transaction: f64,
    pub max_per_transaction: f64,
    pub max_per_day: f64,
}

/// Computes per-currency send limits from the owner's consumed USD value.
///
/// For each currency: `min(per-transaction cap, remaining daily USD * rate)`.
pub fn compute_send_limits(
    rates: &HashMap<String, f64>,
    usd_rate: f64,
    consumed_usd: f64,
) -> HashMap<String, ComputedSendLimit> {
    let usd_left = (MAX_DAILY_USD_LIMIT - consumed_usd).max(0.0);

    let mut limits = HashMap::new();
    for (currency, send_limit) in send_limits() {
        let Some(rate) = rates.get(currency) else {
            continue;
        };

        let left_in_currency = usd_left * rate / usd_rate;
        limits.insert(
            currency.to_string(),
            ComputedSendLimit {
                next_transaction: send_limit.per_transaction.min(left_in_currency),
                max_per_transaction: send_limit.per_transaction,
                max_per_day: MAX_DAILY_USD_LIMIT * rate / usd_rate,
            },
        );
    }
    limits
}
