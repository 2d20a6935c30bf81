/// Money arithmetic
///
/// All amounts are integer cents. Nothing in here touches the database, so
/// checkout, the discount preview endpoint, and payment plans share one set of
/// rounding rules.

use serde::{Deserialize, Serialize};

/// Outcome of applying a per-user discount cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountCap {
    /// Discount actually granted
    pub applied_cents: i64,

    /// The cap reduced the discount below its face value
    pub partially_applied: bool,

    /// Nothing left of the allowance
    pub limit_reached: bool,
}

/// Percentage discount, rounded down to the cent
///
/// A percentage outside 1..=100 grants nothing.
pub fn apply_percent_discount(price_cents: i64, percent_off: i32) -> i64 {
    if price_cents <= 0 || !(1..=100).contains(&percent_off) {
        return 0;
    }

    (price_cents * i64::from(percent_off) / 100).min(price_cents)
}

/// Limits a discount to what remains of the member's seasonal allowance
///
/// `cap_cents` of `None` means the category is uncapped.
pub fn cap_discount(discount_cents: i64, cap_cents: Option<i64>, already_used_cents: i64) -> DiscountCap {
    let discount_cents = discount_cents.max(0);

    let Some(cap) = cap_cents else {
        return DiscountCap {
            applied_cents: discount_cents,
            partially_applied: false,
            limit_reached: false,
        };
    };

    let remaining = (cap - already_used_cents.max(0)).max(0);
    let applied = discount_cents.min(remaining);

    DiscountCap {
        applied_cents: applied,
        partially_applied: applied < discount_cents && applied > 0,
        limit_reached: remaining == 0,
    }
}

/// Splits a total into `count` installments
///
/// Installments are equal except the first, which carries the remainder, so the
/// parts always add back up to the total. A count below one is treated as one.
pub fn split_installments(total_cents: i64, count: i32) -> Vec<i64> {
    let count = count.max(1) as i64;
    let total_cents = total_cents.max(0);
    let base = total_cents / count;
    let remainder = total_cents % count;

    (0..count)
        .map(|i| if i == 0 { base + remainder } else { base })
        .collect()
}

/// Formats cents as a plain decimal string, e.g. `-12.05`
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Cents as a decimal number for vendor APIs that take major units
pub fn cents_to_decimal(cents: i64) -> f64 {
    (cents as f64) / 100.0
}
