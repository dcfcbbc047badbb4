//! Crash input minimization by chunk removal.

/// Result of one minimization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Minimized {
    pub input: Vec<u8>,
    /// Number of candidate executions spent.
    pub iterations: u64,
}

/// Shrinks `input` while `reproduces` keeps returning `true`.
///
/// Chunks of halving size are removed, ending with single bytes. `input` itself is
/// assumed to reproduce; every accepted candidate was checked, so the returned input
/// reproduces too. At most `budget` candidates are tried.
pub fn minimize<F>(input: &[u8], budget: u64, mut reproduces: F) -> Minimized
where
    F: FnMut(&[u8]) -> bool,
{
    let mut cur = input.to_vec();
    let mut iterations = 0;
    let mut chunk = (cur.len() / 2).max(1);

    'outer: while !cur.is_empty() {
        let mut i = 0;
        while i < cur.len() {
            if iterations >= budget {
                break 'outer;
            }
            let end = (i + chunk).min(cur.len());
            let mut candidate = Vec::with_capacity(cur.len() - (end - i));
            candidate.extend_from_slice(&cur[..i]);
            candidate.extend_from_slice(&cur[end..]);
            iterations += 1;
            if reproduces(&candidate) {
                cur = candidate;
            } else {
                i += chunk;
            }
        }
        if chunk == 1 {
            break;
        }
        chunk /= 2;
    }

    Minimized {
        input: cur,
        iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains(hay: &[u8], needle: &[u8]) -> bool {
        hay.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn shrinks_to_trigger() {
        let input = b"aaaaaaaaaa;rm -rfbbbbbbbbbbbbbbbbbbbb";
        let m = minimize(input, 10_000, |c| contains(c, b";rm"));
        assert_eq!(m.input, b";rm");
        assert!(m.iterations > 0);
    }

    #[test]
    fn budget_respected() {
        let input = vec![b'x'; 1024];
        let mut calls = 0;
        let m = minimize(&input, 5, |_| {
            calls += 1;
            false
        });
        assert_eq!(calls, 5);
        assert_eq!(m.iterations, 5);
        assert_eq!(m.input, input);
    }

    #[test]
    fn result_always_reproduces() {
        let input = b"k3y=v4lue&other=1";
        let check = |c: &[u8]| c.iter().filter(|b| b.is_ascii_digit()).count() >= 2;
        let m = minimize(input, 1000, check);
        assert!(check(&m.input));
        assert_eq!(m.input.len(), 2);
    }
}
