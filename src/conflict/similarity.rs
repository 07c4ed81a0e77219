//! Normalized edit-distance similarity.

/// Levenshtein distance over Unicode scalar values.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j - 1] + cost).min(prev[j] + 1).min(curr[j - 1] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Distance if it is at most `max`, otherwise `None`.
///
/// Only the diagonal band of width `2 * max + 1` is filled, so the cost is
/// O(n * max), and the scan stops as soon as a whole row exceeds `max`.
pub fn bounded_levenshtein(a: &str, b: &str, max: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (n, m) = (a.len(), b.len());
    if n.abs_diff(m) > max {
        return None;
    }
    if n == 0 || m == 0 {
        return Some(n.max(m));
    }

    let inf = max + 1;
    let mut prev: Vec<usize> = (0..=m).map(|j| if j <= max { j } else { inf }).collect();
    let mut curr = vec![inf; m + 1];
    for i in 1..=n {
        curr[0] = if i <= max { i } else { inf };
        let mut row_min = curr[0];
        let lo = i.saturating_sub(max).max(1);
        let hi = (i + max).min(m);
        // The band only moves right: the cell left of it still holds a value
        // from two rows up, and cells right of it have never been written.
        if lo > 1 {
            curr[lo - 1] = inf;
        }
        for j in lo..=hi {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            let value = (prev[j - 1] + cost)
                .min(prev[j] + 1)
                .min(curr[j - 1] + 1)
                .min(inf);
            curr[j] = value;
            row_min = row_min.min(value);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let distance = prev[m];
    (distance <= max).then_some(distance)
}

/// `1 - distance / longer_length`; identical strings score 1.0.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

/// `similarity(a, b) >= threshold`, without computing the full matrix.
pub fn is_similar(a: &str, b: &str, threshold: f64) -> bool {
    if a == b {
        return true;
    }
    if threshold <= 0.0 {
        return true;
    }
    let longest = a.chars().count().max(b.chars().count());
    let allowed = ((1.0 - threshold) * longest as f64 + 1e-9).floor().max(0.0) as usize;
    bounded_levenshtein(a, b, allowed).is_some()
}
