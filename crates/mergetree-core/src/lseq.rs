//! Dense fractional positions for ordering array children.
//!
//! A position is a sequence of digits below [`BASE`], compared
//! lexicographically (a shorter matching prefix sorts first). The generator
//! returns a position strictly between its two anchors, so sibling order is
//! total and stable under merges.

use rand::rngs::OsRng;
use rand::Rng;

/// Positional digit base.
pub const BASE: u32 = 256;

/// Ordered digit sequence locating an edge among its siblings.
pub type Position = Vec<u32>;

/// Generates a fresh position strictly between `left` and `right`.
///
/// An empty `left` means "before everything"; `[BASE]` as `right` means
/// "after everything". The walk shares the anchors' common prefix until a
/// digit gap appears, then picks a random digit inside the gap; when no gap
/// exists at the current depth the position is extended with a digit above
/// the left anchor's next digit.
pub fn position_between(left: &[u32], right: &[u32]) -> Position {
    let mut out = Position::new();
    let mut depth = 0usize;
    // Once the generated prefix falls strictly below the right anchor, the
    // right bound no longer constrains deeper digits.
    let mut right_active = true;
    loop {
        let low = left.get(depth).copied().unwrap_or(0);
        let high = if right_active {
            right.get(depth).copied().unwrap_or(BASE)
        } else {
            BASE
        };
        if high > low + 1 {
            out.push(random_digit_between(low, high));
            return out;
        }
        out.push(low);
        if high != low {
            right_active = false;
        }
        depth += 1;
    }
}

fn random_digit_between(low: u32, high: u32) -> u32 {
    OsRng.gen_range(low + 1..high)
}

/// Lexicographic comparison; a shorter matching prefix sorts first.
pub fn compare(a: &[u32], b: &[u32]) -> std::cmp::Ordering {
    a.cmp(b)
}
