use rand::distributions::{Alphanumeric, Distribution, Uniform};
use rand::rngs::OsRng;

/// Random `[a-zA-Z0-9]` string from the OS generator.
pub fn random_alphanumeric(len: usize) -> String {
    Alphanumeric
        .sample_iter(&mut OsRng)
        .take(len)
        .map(char::from)
        .collect()
}

/// Random string drawn uniformly from `alphabet` (ASCII only).
pub fn random_from_alphabet(len: usize, alphabet: &[u8]) -> String {
    if alphabet.is_empty() {
        return String::new();
    }
    let dist = Uniform::from(0..alphabet.len());
    dist.sample_iter(&mut OsRng)
        .take(len)
        .map(|i| char::from(alphabet[i]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphanumeric_has_requested_length() {
        let s = random_alphanumeric(24);
        assert_eq!(s.len(), 24);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn alphabet_is_respected() {
        let s = random_from_alphabet(64, b"XYZ");
        assert!(s.chars().all(|c| "XYZ".contains(c)));
    }
}
