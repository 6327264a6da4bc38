//! Chunk partitioner.
//!
//! Splits the deduplicated record list into at most `target` contiguous
//! partitions for parallel processing. Every partition but the last has
//! `⌊N / target⌋` records; the last one also takes the remainder.

/// Partition `items` into `min(target, N)` contiguous chunks.
///
/// - `N = 0` yields no partitions.
/// - `target >= N` yields one record per partition.
/// - `target = 0` is treated as 1.
///
/// Order inside a partition follows input order.
pub fn partition<T>(items: Vec<T>, target: usize) -> Vec<Vec<T>> {
    let n = items.len();
    if n == 0 {
        return Vec::new();
    }

    let count = target.max(1).min(n);
    let size = n / count;

    let mut partitions = Vec::with_capacity(count);
    let mut iter = items.into_iter();
    for _ in 0..count - 1 {
        partitions.push(iter.by_ref().take(size).collect());
    }
    // Remainder lands in the final partition.
    partitions.push(iter.collect());
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        let parts: Vec<Vec<u32>> = partition(Vec::new(), 20);
        assert!(parts.is_empty());
    }

    #[test]
    fn test_target_exceeds_len() {
        let parts = partition(vec![1, 2, 3], 20);
        assert_eq!(parts, vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_remainder_goes_to_last() {
        let parts = partition((0..45).collect(), 20);
        assert_eq!(parts.len(), 20);
        for p in &parts[..19] {
            assert_eq!(p.len(), 2);
        }
        assert_eq!(parts[19].len(), 7);
    }

    #[test]
    fn test_zero_target_is_single_partition() {
        let parts = partition(vec!['a', 'b'], 0);
        assert_eq!(parts, vec![vec!['a', 'b']]);
    }

    #[test]
    fn test_coverage_and_order() {
        for n in 0..60usize {
            for k in 1..25usize {
                let input: Vec<usize> = (0..n).collect();
                let parts = partition(input.clone(), k);
                assert_eq!(parts.len(), k.min(n), "n={} k={}", n, k);
                assert!(parts.iter().all(|p| !p.is_empty()));
                let flat: Vec<usize> = parts.into_iter().flatten().collect();
                assert_eq!(flat, input, "n={} k={}", n, k);
            }
        }
    }
}
