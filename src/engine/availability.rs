use crate::model::*;

// ── Open-range algorithm ──────────────────────────────────────────

/// Free stays inside `window` once every confirmed reservation of the
/// property is taken out. Requested and cancelled reservations leave the
/// nights open.
pub fn open_ranges(property: &PropertyState, window: &StayRange) -> Vec<StayRange> {
    let mut blocked: Vec<StayRange> = property
        .overlapping(window)
        .filter(|r| r.is_confirmed())
        .map(|r| r.stay)
        .collect();
    if blocked.is_empty() {
        return vec![*window];
    }
    blocked.sort_by_key(|s| s.check_in);
    let blocked = merge_adjacent(&blocked);
    subtract_ranges(std::slice::from_ref(window), &blocked)
}

/// Merge sorted overlapping/adjacent ranges into disjoint ranges.
pub fn merge_adjacent(sorted: &[StayRange]) -> Vec<StayRange> {
    let mut merged: Vec<StayRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.check_in <= last.check_out {
                last.check_out = last.check_out.max(range.check_out);
                continue;
            }
        merged.push(range);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by check-in; `to_remove`
/// disjoint.
pub fn subtract_ranges(base: &[StayRange], to_remove: &[StayRange]) -> Vec<StayRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.check_in;
        let current_end = b.check_out;

        while ri < to_remove.len() && to_remove[ri].check_out <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].check_in < current_end {
            let r = &to_remove[j];
            if r.check_in > current_start {
                result.push(StayRange::new(current_start, r.check_in));
            }
            current_start = current_start.max(r.check_out);
            j += 1;
        }

        if current_start < current_end {
            result.push(StayRange::new(current_start, current_end));
        }
    }

    result
}
