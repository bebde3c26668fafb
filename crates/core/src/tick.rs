pub type Tick = u32;

const WRAP_THRESHOLD: u32 = u32::MAX / 2;

/// Wrapping "newer than" comparison shared by ticks and packet sequences.
#[inline]
pub fn wrapping_greater_than(a: u32, b: u32) -> bool {
    ((a > b) && (a - b <= WRAP_THRESHOLD)) || ((a < b) && (b - a > WRAP_THRESHOLD))
}

#[inline]
pub fn tick_greater_than(a: Tick, b: Tick) -> bool {
    wrapping_greater_than(a, b)
}

#[inline]
pub fn tick_at_least(a: Tick, b: Tick) -> bool {
    a == b || tick_greater_than(a, b)
}

/// Ticks elapsed from `older` to `newer`, zero when `older` is not actually older.
#[inline]
pub fn ticks_since(older: Tick, newer: Tick) -> u32 {
    if tick_greater_than(newer, older) {
        newer.wrapping_sub(older)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_comparison() {
        assert!(tick_greater_than(2, 1));
        assert!(!tick_greater_than(1, 2));
        assert!(tick_greater_than(0, u32::MAX));
        assert!(!tick_greater_than(u32::MAX, 0));
        assert!(!tick_greater_than(7, 7));
    }

    #[test]
    fn test_ticks_since_wraps() {
        assert_eq!(ticks_since(100, 150), 50);
        assert_eq!(ticks_since(u32::MAX - 1, 3), 5);
        assert_eq!(ticks_since(150, 100), 0);
    }
}
