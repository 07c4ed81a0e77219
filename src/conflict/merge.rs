//! Line-level union merge for concurrent text edits.
//!
//! Both versions are aligned on their longest common subsequence of lines.
//! Between two consecutive shared lines each side has a (possibly empty) gap.
//! A gap filled on one side only is taken as an addition; gaps filled on both
//! sides overlap and make the merge irreconcilable.
//!
//! Common leading and trailing lines are matched directly; only the differing
//! middle goes through the quadratic table, and a middle larger than
//! [`MAX_LCS_CELLS`] is treated as irreconcilable.

/// Upper bound on the LCS table for the differing middle of two texts.
pub const MAX_LCS_CELLS: usize = 4_000_000;

/// Union of `earlier` and `later`, or `None` when their edits overlap.
pub fn merge_lines(earlier: &str, later: &str) -> Option<String> {
    if earlier == later {
        return Some(later.to_string());
    }

    let left: Vec<&str> = earlier.lines().collect();
    let right: Vec<&str> = later.lines().collect();
    let anchors = lcs_pairs(&left, &right)?;

    let mut merged: Vec<&str> = Vec::with_capacity(left.len().max(right.len()));
    let (mut i, mut j) = (0, 0);
    for (ai, bj) in anchors
        .iter()
        .copied()
        .chain(std::iter::once((left.len(), right.len())))
    {
        let left_gap = &left[i..ai];
        let right_gap = &right[j..bj];
        match (left_gap.is_empty(), right_gap.is_empty()) {
            (true, true) => {}
            (false, true) => merged.extend_from_slice(left_gap),
            (true, false) => merged.extend_from_slice(right_gap),
            (false, false) => return None,
        }
        if ai < left.len() {
            merged.push(left[ai]);
        }
        i = ai + 1;
        j = bj + 1;
    }

    let mut text = merged.join("\n");
    if later.ends_with('\n') || (later.is_empty() && earlier.ends_with('\n')) {
        text.push('\n');
    }
    Some(text)
}

/// Index pairs of one longest common subsequence, in order. `None` when the
/// differing middle exceeds [`MAX_LCS_CELLS`].
fn lcs_pairs(a: &[&str], b: &[&str]) -> Option<Vec<(usize, usize)>> {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let mid_a = &a[prefix..a.len() - suffix];
    let mid_b = &b[prefix..b.len() - suffix];
    let (n, m) = (mid_a.len(), mid_b.len());
    if n.saturating_mul(m) > MAX_LCS_CELLS {
        return None;
    }

    // table[i * width + j] = LCS length of mid_a[i..] and mid_b[j..]
    let width = m + 1;
    let mut table = vec![0usize; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if mid_a[i] == mid_b[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let mut pairs: Vec<(usize, usize)> = (0..prefix).map(|k| (k, k)).collect();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if mid_a[i] == mid_b[j] {
            pairs.push((prefix + i, prefix + j));
            i += 1;
            j += 1;
        } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs.extend((0..suffix).map(|k| (a.len() - suffix + k, b.len() - suffix + k)));
    Some(pairs)
}
