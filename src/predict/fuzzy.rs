//! Ratcliff/Obershelp string similarity.

/// Total length of matching blocks between `a` and `b`: the longest common
/// substring, then recursively the pieces to its left and right.
fn matching_chars(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    // Longest common substring by dynamic programming over one row.
    let mut best = (0usize, 0usize, 0usize); // (len, end_a, end_b)
    let mut prev = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        let mut row = vec![0usize; b.len() + 1];
        for j in 1..=b.len() {
            if a[i - 1] == b[j - 1] {
                row[j] = prev[j - 1] + 1;
                if row[j] > best.0 {
                    best = (row[j], i, j);
                }
            }
        }
        prev = row;
    }
    let (len, end_a, end_b) = best;
    if len == 0 {
        return 0;
    }
    let (sa, sb) = (end_a - len, end_b - len);
    len + matching_chars(&a[..sa], &b[..sb]) + matching_chars(&a[end_a..], &b[end_b..])
}

/// Similarity in `[0, 1]`: `2 * matches / (len(a) + len(b))`.
pub fn ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(&a, &b) as f64 / total as f64
}

/// Up to `n` candidates scoring at least `cutoff`, best first.
pub fn close_matches<'a>(
    word: &str,
    candidates: impl IntoIterator<Item = &'a str>,
    n: usize,
    cutoff: f64,
) -> Vec<String> {
    let mut scored: Vec<(f64, &str)> = candidates
        .into_iter()
        .map(|c| (ratio(word, c), c))
        .filter(|(s, _)| *s >= cutoff)
        .collect();
    scored.sort_by(|x, y| y.0.total_cmp(&x.0));
    scored.into_iter().take(n).map(|(_, c)| c.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_matches_known_values() {
        assert_eq!(ratio("abcd", "abcd"), 1.0);
        assert_eq!(ratio("abcd", "wxyz"), 0.0);
        // "abcd" vs "bcde": block "bcd" → 2*3/8.
        assert!((ratio("abcd", "bcde") - 0.75).abs() < 1e-12);
    }

    #[test]
    fn close_matches_respects_cutoff_and_order() {
        let vocab = ["apple", "apply", "ape", "banana"];
        let got = close_matches("appel", vocab, 3, 0.6);
        assert_eq!(got.first().map(String::as_str), Some("apple"));
        assert!(!got.contains(&"banana".to_string()));
    }
}
