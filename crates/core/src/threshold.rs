//! Usage threshold crossing detection.

/// Percentage thresholds at which a principal is notified, ascending.
pub const THRESHOLD_LADDER: [u8; 5] = [50, 80, 90, 95, 100];

/// Return the lowest threshold in `thresholds` that the update from
/// `prev_usage` to `new_usage` just crossed.
///
/// A threshold `t` is crossed when `new_usage / limit * 100 >= t` and
/// `prev_usage / limit * 100 < t`. Thresholds are scanned in the order given,
/// so callers pass them ascending. Skipped thresholds never fire later: going
/// from 40% to 96% reports only 50.
///
/// A zero `limit` never crosses anything.
#[must_use]
pub fn crossed(prev_usage: u64, new_usage: u64, limit: u64, thresholds: &[u8]) -> Option<u8> {
    if limit == 0 {
        return None;
    }
    let prev = u128::from(prev_usage) * 100;
    let new = u128::from(new_usage) * 100;
    let limit = u128::from(limit);
    thresholds.iter().copied().find(|&t| {
        let boundary = u128::from(t) * limit;
        new >= boundary && prev < boundary
    })
}
