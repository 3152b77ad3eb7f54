use subtle::ConstantTimeEq;

/// Compare two byte strings in time independent of where they differ.
///
/// Lengths are compared first; callers compare fixed-size digests so the
/// length check leaks nothing useful.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_match() {
        assert!(constant_time_eq(b"checksum", b"checksum"));
    }

    #[test]
    fn different_inputs_do_not_match() {
        assert!(!constant_time_eq(b"checksum", b"checksun"));
        assert!(!constant_time_eq(b"short", b"longer value"));
        assert!(!constant_time_eq(b"", b"x"));
    }
}
