/// Fingerprint of an ordered list of canonical parts.
///
/// Parts are joined with a unit separator so `["ab", "c"]` and `["a", "bc"]`
/// never collide.
pub fn fingerprint<S: AsRef<str>>(parts: &[S]) -> String {
    let mut ctx = md5::Context::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            ctx.consume([0x1fu8]);
        }
        ctx.consume(part.as_ref().as_bytes());
    }
    format!("{:x}", ctx.compute())
}

/// Two independent 64-bit hashes of `input`, taken from the md5 digest halves.
/// Used for double hashing in the bitmap bloom filter.
pub fn md5_pair(input: &str) -> (u64, u64) {
    let digest = md5::compute(input.as_bytes());
    let mut lo = [0u8; 8];
    let mut hi = [0u8; 8];
    lo.copy_from_slice(&digest.0[..8]);
    hi.copy_from_slice(&digest.0[8..]);
    (u64::from_be_bytes(lo), u64::from_be_bytes(hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_part_is_plain_md5() {
        assert_eq!(fingerprint(&["hello"]), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_fingerprint_separates_parts() {
        assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
        assert_eq!(fingerprint(&["GET", "https://a.com"]), fingerprint(&["GET", "https://a.com"]));
    }

    #[test]
    fn test_md5_pair_is_stable() {
        let (a, b) = md5_pair("https://example.com");
        assert_eq!((a, b), md5_pair("https://example.com"));
        assert_ne!(a, b);
    }
}
