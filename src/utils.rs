use std::cmp::Ordering;
use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Compare two frame sequence numbers, tolerating wraparound of the counter.
///
/// `a` is considered newer than `b` when it is ahead by less than half the
/// sequence space.
pub fn seq_cmp(a: u32, b: u32) -> Ordering {
    (a.wrapping_sub(b) as i32).cmp(&0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_cmp_plain() {
        assert_eq!(seq_cmp(5, 3), Ordering::Greater);
        assert_eq!(seq_cmp(3, 5), Ordering::Less);
        assert_eq!(seq_cmp(7, 7), Ordering::Equal);
    }

    #[test]
    fn test_seq_cmp_rollover() {
        // 2 follows u32::MAX after a wrap
        assert_eq!(seq_cmp(2, u32::MAX), Ordering::Greater);
        assert_eq!(seq_cmp(u32::MAX - 1, 1), Ordering::Less);
    }
}
