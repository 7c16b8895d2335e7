//! Random secrets for access keys, admin paths and credentials.

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Length used for every generated secret unless a caller needs otherwise.
pub const SECRET_LEN: usize = 32;

/// Returns `len` random ASCII alphanumerics drawn from the thread-local CSPRNG.
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A fresh [`SECRET_LEN`]-character secret.
pub fn random_secret() -> String {
    random_string(SECRET_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_random_secret_shape() {
        let secret = random_secret();
        assert_eq!(secret.len(), SECRET_LEN);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_random_secrets_do_not_repeat() {
        let secrets: HashSet<String> = (0..1000).map(|_| random_secret()).collect();
        assert_eq!(secrets.len(), 1000);
    }
}
