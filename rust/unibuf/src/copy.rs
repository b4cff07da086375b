//! Bisecting transfer driver.
//!
//! Backend copy primitives may reject a transfer above an implementation
//! limit (or one crossing an allocation boundary). The driver recovers by
//! splitting the rejected range at its midpoint and retrying both halves;
//! a one-byte transfer that still fails is unrecoverable. Implemented with
//! an explicit work list rather than recursion so a pathological adapter
//! cannot overflow the stack.

/// Runs `copy(offset, len)` over `[0, len)`, bisecting rejected sub-ranges
/// until every byte is transferred or a one-byte copy fails.
///
/// Sub-ranges are attempted in ascending offset order and partition the
/// whole range exactly.
pub(crate) fn run_bisecting<F>(len: usize, op: &'static str, mut copy: F) -> std::io::Result<()>
where
    F: FnMut(usize, usize) -> std::io::Result<()>,
{
    if len == 0 {
        return Ok(());
    }
    let mut work = vec![(0usize, len)];
    let mut subdivided = false;
    while let Some((offset, len)) = work.pop() {
        match copy(offset, len) {
            Ok(()) => {}
            Err(_) if len > 1 => {
                if !subdivided {
                    log::debug!("{op}: {len} byte transfer rejected, subdividing");
                    subdivided = true;
                }
                let mid = len / 2;
                work.push((offset + mid, len - mid));
                work.push((offset, mid));
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_call_when_accepted() {
        let mut calls = Vec::new();
        run_bisecting(100, "copy", |offset, len| {
            calls.push((offset, len));
            Ok(())
        })
        .expect("copy");
        assert_eq!(calls, vec![(0, 100)]);
    }

    #[test]
    fn test_bisection_partitions_exactly() {
        let limit = 10;
        let mut calls = Vec::new();
        run_bisecting(100, "copy", |offset, len| {
            if len > limit {
                return Err(std::io::Error::other("too large"));
            }
            calls.push((offset, len));
            Ok(())
        })
        .expect("copy");

        // Ascending, gapless, non-overlapping cover of [0, 100).
        let mut next = 0;
        for &(offset, len) in &calls {
            assert_eq!(offset, next);
            assert!(len <= limit && len > 0);
            next += len;
        }
        assert_eq!(next, 100);
    }

    #[test]
    fn test_one_byte_failure_is_fatal() {
        let err = run_bisecting(64, "copy", |_, _| Err(std::io::Error::other("nope")))
            .expect_err("must fail");
        assert_eq!(err.to_string(), "nope");
    }

    #[test]
    fn test_zero_len_is_noop() {
        run_bisecting(0, "copy", |_, _| panic!("must not be called")).expect("noop");
    }

    #[test]
    fn test_odd_split_sizes() {
        let mut moved = 0;
        run_bisecting(37, "copy", |_, len| {
            if len > 3 {
                return Err(std::io::Error::other("too large"));
            }
            moved += len;
            Ok(())
        })
        .expect("copy");
        assert_eq!(moved, 37);
    }
}
