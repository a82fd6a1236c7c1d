use branchdump_core::Secret;
use rand::Rng;
use sha1::{Digest, Sha1};

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";
pub const CLEAR_PASSWORD_PLUGIN: &str = "mysql_clear_password";

/// Authentication plugin spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMethod {
    #[default]
    NativePassword,
    ClearPassword,
}

impl AuthMethod {
    pub fn plugin_name(&self) -> &'static str {
        match self {
            AuthMethod::NativePassword => NATIVE_PASSWORD_PLUGIN,
            AuthMethod::ClearPassword => CLEAR_PASSWORD_PLUGIN,
        }
    }

    pub fn from_plugin_name(name: &str) -> Option<Self> {
        match name {
            NATIVE_PASSWORD_PLUGIN => Some(AuthMethod::NativePassword),
            CLEAR_PASSWORD_PLUGIN => Some(AuthMethod::ClearPassword),
            _ => None,
        }
    }

    /// Builds the auth response a client sends for this plugin.
    pub fn respond(&self, password: &str, salt: &[u8]) -> Vec<u8> {
        match self {
            AuthMethod::NativePassword => scramble_native_password(password.as_bytes(), salt),
            AuthMethod::ClearPassword => {
                let mut response = password.as_bytes().to_vec();
                response.push(0);
                response
            }
        }
    }
}

/// A fresh 20 byte scramble. Bytes stay in 1..=127 so the NUL terminator is unambiguous.
pub fn generate_salt() -> [u8; 20] {
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; 20];
    for b in salt.iter_mut() {
        *b = rng.gen_range(1..=127);
    }
    salt
}

/// client_response = SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))
pub fn scramble_native_password(password: &[u8], salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let hash1 = Sha1::digest(password);
    let hash2 = Sha1::digest(hash1);

    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(hash2);
    let token = hasher.finalize();

    hash1.iter().zip(token.iter()).map(|(a, b)| a ^ b).collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Checks local clients against the single user the relay accepts.
#[derive(Debug, Clone)]
pub struct Authenticator {
    method: AuthMethod,
    username: String,
    password: Secret,
}

impl Authenticator {
    pub fn new(method: AuthMethod, username: impl Into<String>, password: Secret) -> Self {
        Self {
            method,
            username: username.into(),
            password,
        }
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    pub fn verify(&self, username: &str, response: &[u8], salt: &[u8]) -> bool {
        if !constant_time_eq(username.as_bytes(), self.username.as_bytes()) {
            return false;
        }
        let password = self.password.expose().as_bytes();
        match self.method {
            AuthMethod::NativePassword => {
                if password.is_empty() {
                    return response.is_empty();
                }
                let stored = Sha1::digest(Sha1::digest(password));
                self.verify_native_password(response, salt, &stored)
            }
            AuthMethod::ClearPassword => {
                let response = response.strip_suffix(&[0]).unwrap_or(response);
                constant_time_eq(response, password)
            }
        }
    }

    /// Implement mysql_native_password check
    /// server_side: hash1 = SHA1(password)
    ///              hash2 = SHA1(hash1)
    /// client_sends = hash1 XOR SHA1(salt + hash2)
    /// verification = SHA1(salt + hash2) XOR client_sends == hash1
    /// Check if SHA1(verification) == hash2
    fn verify_native_password(&self, response: &[u8], salt: &[u8], stored_hash_sha1_sha1: &[u8]) -> bool {
        if response.len() != 20 {
            return false;
        }

        let mut hasher = Sha1::new();
        hasher.update(salt);
        hasher.update(stored_hash_sha1_sha1);
        let token = hasher.finalize();

        let mut hash1 = [0u8; 20];
        for i in 0..20 {
            hash1[i] = response[i] ^ token[i];
        }

        let check = Sha1::digest(hash1);
        constant_time_eq(check.as_slice(), stored_hash_sha1_sha1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator(method: AuthMethod) -> Authenticator {
        Authenticator::new(method, "restore", Secret::new("s3cret"))
    }

    #[test]
    fn test_native_password_roundtrip() {
        let salt = generate_salt();
        let response = AuthMethod::NativePassword.respond("s3cret", &salt);
        assert_eq!(response.len(), 20);
        assert!(authenticator(AuthMethod::NativePassword).verify("restore", &response, &salt));
    }

    #[test]
    fn test_native_password_rejects_wrong_secret_and_user() {
        let salt = generate_salt();
        let auth = authenticator(AuthMethod::NativePassword);
        let wrong = AuthMethod::NativePassword.respond("guess", &salt);
        assert!(!auth.verify("restore", &wrong, &salt));

        let right = AuthMethod::NativePassword.respond("s3cret", &salt);
        assert!(!auth.verify("nobody", &right, &salt));
        assert!(!auth.verify("restore", &right, &generate_salt()));
    }

    #[test]
    fn test_clear_password() {
        let auth = authenticator(AuthMethod::ClearPassword);
        let response = AuthMethod::ClearPassword.respond("s3cret", &[]);
        assert!(auth.verify("restore", &response, &[]));
        assert!(!auth.verify("restore", b"nope\0", &[]));
    }

    #[test]
    fn test_salt_has_no_nul() {
        assert!(generate_salt().iter().all(|&b| b != 0));
    }

    #[test]
    fn test_empty_password_and_plugin_names() {
        assert!(scramble_native_password(b"", b"12345678901234567890").is_empty());
        assert_eq!(AuthMethod::from_plugin_name("mysql_native_password"), Some(AuthMethod::NativePassword));
        assert_eq!(AuthMethod::from_plugin_name("caching_sha2_password"), None);
    }
}
