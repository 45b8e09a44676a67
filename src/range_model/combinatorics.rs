//! Combination counting, k-subset enumeration and lexicographic subset rank.
//!
//! Subsets are sorted index lists over `0..n`. Rank 0 is `[0, 1, .., k-1]`.

/// Binomial coefficient C(n, k); 0 when k > n.
pub fn comb(n: usize, k: usize) -> u64 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut acc: u64 = 1;
    for i in 0..k {
        // exact at every step: acc * (n - i) is divisible by (i + 1)
        acc = acc * (n - i) as u64 / (i + 1) as u64;
    }
    acc
}

/// Lexicographic rank of a sorted subset of `0..n`.
pub fn rank_of_subset(n: usize, subset: &[usize]) -> u64 {
    let k = subset.len();
    let mut rank = 0;
    let mut start = 0;
    for (slot, &element) in subset.iter().enumerate() {
        let still_needed = k - slot - 1;
        for skipped in start..element {
            rank += comb(n - skipped - 1, still_needed);
        }
        start = element + 1;
    }
    rank
}

/// All k-subsets of `0..n` in rank order.
pub fn subsets(n: usize, k: usize) -> Vec<Vec<usize>> {
    if k > n {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(comb(n, k) as usize);
    let mut current: Vec<usize> = (0..k).collect();
    loop {
        out.push(current.clone());
        // advance the rightmost slot that still has room
        let mut slot = k;
        while slot > 0 && current[slot - 1] == n - k + slot - 1 {
            slot -= 1;
        }
        if slot == 0 {
            break;
        }
        current[slot - 1] += 1;
        for j in slot..k {
            current[j] = current[j - 1] + 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(5, 0, 1)]
    #[case(5, 2, 10)]
    #[case(6, 3, 20)]
    #[case(10, 10, 1)]
    #[case(3, 4, 0)]
    #[case(40, 20, 137846528820)]
    fn test_comb(#[case] n: usize, #[case] k: usize, #[case] expected: u64) {
        assert_eq!(comb(n, k), expected);
    }

    #[test]
    fn test_subsets_lexicographic() {
        let all = subsets(4, 2);
        assert_eq!(
            all,
            vec![
                vec![0, 1],
                vec![0, 2],
                vec![0, 3],
                vec![1, 2],
                vec![1, 3],
                vec![2, 3]
            ]
        );
        assert_eq!(subsets(3, 0), vec![Vec::<usize>::new()]);
        assert!(subsets(2, 3).is_empty());
    }

    #[test]
    fn test_rank_follows_enumeration_order() {
        for k in 0..=6 {
            for (rank, subset) in subsets(6, k).iter().enumerate() {
                assert_eq!(rank_of_subset(6, subset), rank as u64);
            }
        }
        assert_eq!(rank_of_subset(6, &[4, 5]), comb(6, 2) - 1);
    }
}
