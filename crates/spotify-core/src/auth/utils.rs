use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Random string drawn from `A-Z a-z 0-9` using the thread-local CSPRNG.
pub fn random_alphanumeric(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
