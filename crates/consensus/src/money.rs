//! Monetary units and money range rules.

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const CENT: Amount = 1_000_000;

/// No amount larger than this (in base units) is valid.
pub const MAX_MONEY: Amount = 2_000_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Render an amount as a decimal coin string, trimming trailing zeros down to
/// two fractional digits.
pub fn format_money(value: Amount) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    let units = abs / COIN as u64;
    let fraction = abs % COIN as u64;
    let mut out = format!("{sign}{units}.{fraction:08}");
    // Keep at least two fractional digits.
    let min_len = out.len() - 6;
    while out.len() > min_len && out.ends_with('0') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_bounds() {
        assert!(money_range(0));
        assert!(money_range(MAX_MONEY));
        assert!(!money_range(MAX_MONEY + 1));
        assert!(!money_range(-1));
    }

    #[test]
    fn formats_whole_and_fractional_amounts() {
        assert_eq!(format_money(0), "0.00");
        assert_eq!(format_money(COIN), "1.00");
        assert_eq!(format_money(COIN + CENT), "1.01");
        assert_eq!(format_money(123_456_789), "1.23456789");
        assert_eq!(format_money(-COIN / 2), "-0.50");
    }
}
