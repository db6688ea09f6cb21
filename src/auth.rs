//! Shared-key checks for the worker endpoint.

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, &e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_match() {
        assert!(constant_time_eq(b"shared-secret", b"shared-secret"));
    }

    #[test]
    fn different_or_truncated_keys_do_not_match() {
        assert!(!constant_time_eq(b"shared-secret", b"shared-secreT"));
        assert!(!constant_time_eq(b"shared-secret", b"shared"));
        assert!(!constant_time_eq(b"shared", b"shared-secret"));
        assert!(!constant_time_eq(b"k", b""));
    }
}
