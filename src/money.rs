//! Currency amounts are carried as integer cents everywhere inside the
//! daemon; JSON params and results use currency units. Conversion only
//! happens at the IPC boundary, so the ledger equalities stay exact.

/// Largest amount accepted from params, in currency units. Anything past
/// this is a typo, not a course fee.
const MAX_AMOUNT: f64 = 1_000_000_000.0;

/// Parses a JSON currency number into cents, rounding half away from
/// zero. Returns `None` for non-finite or absurdly large values.
pub fn to_cents(amount: f64) -> Option<i64> {
    if !amount.is_finite() || amount.abs() > MAX_AMOUNT {
        return None;
    }
    Some((amount * 100.0).round() as i64)
}

pub fn from_cents(cents: i64) -> f64 {
    cents as f64 / 100.0
}

pub fn format_voucher_number(seq: u64) -> String {
    format!("PAY-{:06}", seq)
}
