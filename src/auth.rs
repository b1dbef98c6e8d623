//! Controller authentication: salted password hashes and shared cookies.
//!
//! # Hashed Passwords
//!
//! Configured passwords are stored as an RFC 2440 iterated-and-salted S2K
//! digest, written `16:` followed by 58 hex digits:
//!
//! ```text
//!   16: │ salt (8 bytes) │ count specifier (1 byte) │ SHA-1 digest (20 bytes) │
//!
//!   count = (16 + (c & 15)) << ((c >> 4) + 6)       c = 0x60  →  65536 bytes
//!   digest = SHA1( repeat(salt ‖ secret) truncated to count bytes )
//! ```
//!
//! The same 29 bytes in base64 are also accepted.
//!
//! # Cookies
//!
//! A cookie is a random shared secret compared byte-for-byte. Every
//! comparison in this module runs over the full input regardless of where the
//! first mismatch is.
//!
//! # Example
//!
//! ```rust
//! use privcount_control::auth::{self, HashedPassword};
//!
//! let stored = HashedPassword::generate(b"hunter2");
//! let text = stored.to_string();
//! assert!(text.starts_with("16:"));
//!
//! let decoded = auth::decode_hashed_passwords(&[text.as_str()]);
//! assert!(decoded.rejected.is_empty());
//! assert!(auth::verify(b"hunter2", &decoded.accepted[0]));
//! assert!(!auth::verify(b"hunter3", &decoded.accepted[0]));
//! ```

use std::fmt;

use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};
use zeroize::{Zeroize, Zeroizing};

use crate::config::{Config, LogLevel};
use crate::error::{Error, Result};
use crate::escape;
use crate::logger::plog;

/// Salt length of an S2K specifier.
pub const S2K_SALT_LEN: usize = 8;

/// Salt plus count byte.
pub const S2K_SPECIFIER_LEN: usize = S2K_SALT_LEN + 1;

/// SHA-1 digest length.
pub const DIGEST_LEN: usize = 20;

/// Decoded length of a hashed password entry.
pub const HASHED_PASSWORD_LEN: usize = S2K_SPECIFIER_LEN + DIGEST_LEN;

/// Length of generated authentication cookies.
pub const AUTHENTICATION_COOKIE_LEN: usize = 32;

/// Count byte used when hashing new passwords.
pub const DEFAULT_S2K_COUNT_SPECIFIER: u8 = 0x60;

const EXPBIAS: u32 = 6;

const HEX_PREFIX: &str = "16:";

/// Number of bytes an S2K count specifier asks to be hashed.
pub fn s2k_count(specifier: u8) -> usize {
    (16 + usize::from(specifier & 15)) << (u32::from(specifier >> 4) + EXPBIAS)
}

/// Computes the RFC 2440 iterated-and-salted digest of `secret`.
pub fn secret_to_key(secret: &[u8], salt: &[u8; S2K_SALT_LEN], specifier: u8) -> [u8; DIGEST_LEN] {
    let mut material = Zeroizing::new(Vec::with_capacity(S2K_SALT_LEN + secret.len()));
    material.extend_from_slice(salt);
    material.extend_from_slice(secret);

    let mut hasher = Sha1::new();
    let mut remaining = s2k_count(specifier);
    while remaining > 0 {
        let n = remaining.min(material.len());
        hasher.update(&material[..n]);
        remaining -= n;
    }

    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// A configured salted password hash.
#[derive(Clone, PartialEq, Eq)]
pub struct HashedPassword {
    salt: [u8; S2K_SALT_LEN],
    specifier: u8,
    digest: [u8; DIGEST_LEN],
}

impl HashedPassword {
    /// Hashes `secret` with a fresh random salt.
    pub fn generate(secret: &[u8]) -> Self {
        let mut salt = [0u8; S2K_SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::with_salt(secret, salt, DEFAULT_S2K_COUNT_SPECIFIER)
    }

    /// Hashes `secret` with an explicit salt and count specifier.
    pub fn with_salt(secret: &[u8], salt: [u8; S2K_SALT_LEN], specifier: u8) -> Self {
        let digest = secret_to_key(secret, &salt, specifier);
        Self {
            salt,
            specifier,
            digest,
        }
    }

    /// Builds a hash from its 29-byte binary form.
    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() != HASHED_PASSWORD_LEN {
            return Err(format!(
                "expected {} bytes, got {}",
                HASHED_PASSWORD_LEN,
                bytes.len()
            ));
        }
        let mut salt = [0u8; S2K_SALT_LEN];
        salt.copy_from_slice(&bytes[..S2K_SALT_LEN]);
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes[S2K_SPECIFIER_LEN..]);
        Ok(Self {
            salt,
            specifier: bytes[S2K_SALT_LEN],
            digest,
        })
    }

    /// Parses one configured entry.
    fn parse(entry: &str) -> std::result::Result<Self, String> {
        let entry = entry.trim();
        let bytes = match entry.strip_prefix(HEX_PREFIX) {
            Some(hex_part) => {
                hex::decode(hex_part).map_err(|_| "invalid hexadecimal".to_string())?
            }
            None => base64::engine::general_purpose::STANDARD
                .decode(entry)
                .map_err(|_| "neither 16:<hex> nor base64".to_string())?,
        };
        Self::from_bytes(&bytes)
    }

    /// The salt.
    pub fn salt(&self) -> &[u8; S2K_SALT_LEN] {
        &self.salt
    }

    /// The S2K count specifier.
    pub fn specifier(&self) -> u8 {
        self.specifier
    }

    fn to_bytes(&self) -> [u8; HASHED_PASSWORD_LEN] {
        let mut out = [0u8; HASHED_PASSWORD_LEN];
        out[..S2K_SALT_LEN].copy_from_slice(&self.salt);
        out[S2K_SALT_LEN] = self.specifier;
        out[S2K_SPECIFIER_LEN..].copy_from_slice(&self.digest);
        out
    }
}

impl fmt::Display for HashedPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", HEX_PREFIX, hex::encode_upper(self.to_bytes()))
    }
}

impl fmt::Debug for HashedPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashedPassword")
            .field("specifier", &self.specifier)
            .finish_non_exhaustive()
    }
}

/// Outcome of decoding a list of configured hashed passwords.
#[derive(Debug, Default)]
pub struct DecodedPasswords {
    /// Entries that decoded cleanly, in configured order.
    pub accepted: Vec<HashedPassword>,
    /// One [`Error::InvalidHashedPassword`] per malformed entry.
    pub rejected: Vec<Error>,
}

/// Decodes configured `16:<hex>` or base64 entries.
///
/// A malformed entry is reported on its own and does not stop the rest of
/// the list from loading.
pub fn decode_hashed_passwords<S: AsRef<str>>(entries: &[S]) -> DecodedPasswords {
    let mut decoded = DecodedPasswords::default();
    for (index, entry) in entries.iter().enumerate() {
        match HashedPassword::parse(entry.as_ref()) {
            Ok(hashed) => decoded.accepted.push(hashed),
            Err(reason) => decoded
                .rejected
                .push(Error::InvalidHashedPassword { index, reason }),
        }
    }
    decoded
}

/// Checks `candidate` against one stored hash.
pub fn verify(candidate: &[u8], stored: &HashedPassword) -> bool {
    let computed = secret_to_key(candidate, &stored.salt, stored.specifier);
    constant_time_eq(&computed, &stored.digest)
}

/// Compares a presented cookie with the expected one.
///
/// Lengths are public; equal-length inputs are compared in full.
pub fn verify_cookie(candidate: &[u8], cookie: &[u8]) -> bool {
    constant_time_eq(candidate, cookie)
}

/// Equality that examines every byte of equal-length inputs.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let (diff, _) = accumulate_diff(a, b);
    diff == 0
}

fn accumulate_diff(a: &[u8], b: &[u8]) -> (u8, usize) {
    let mut diff = 0u8;
    let mut examined = 0usize;
    for (x, y) in a.iter().zip(b) {
        diff |= std::hint::black_box(x ^ y);
        examined += 1;
    }
    (diff, examined)
}

/// Byte secret that is zeroed on drop and redacted in debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecurePassword(Vec<u8>);

impl SecurePassword {
    /// Wraps secret bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The secret.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for SecurePassword {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SecurePassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecurePassword([REDACTED])")
    }
}

/// A shared authentication cookie held in memory.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthCookie(SecurePassword);

impl AuthCookie {
    /// Generates a fresh random cookie.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; AUTHENTICATION_COOKIE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(SecurePassword::new(bytes))
    }

    /// Wraps existing cookie bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(SecurePassword::new(bytes))
    }

    /// The cookie bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for AuthCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthCookie([REDACTED])")
    }
}

/// What a session presented when it tried to authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// No secret at all.
    Null,
    /// A secret that may be a password or a cookie.
    Secret(SecurePassword),
}

impl Credential {
    /// Parses an `AUTHENTICATE` argument: empty, a quoted string, or hex.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedEscapedData`] for a bad quoted string and
    /// [`Error::Validation`] for bad hex or trailing garbage.
    pub fn parse_argument(arg: &str) -> Result<Credential> {
        let arg = arg.trim();
        if arg.is_empty() {
            return Ok(Credential::Null);
        }
        if arg.starts_with('"') {
            let (value, rest) = escape::unquote(arg)?;
            if !rest.trim().is_empty() {
                return Err(Error::Validation(
                    "unexpected data after quoted secret".to_string(),
                ));
            }
            return Ok(Credential::Secret(SecurePassword::new(value.into_bytes())));
        }
        let bytes = hex::decode(arg)
            .map_err(|_| Error::Validation("secret is neither quoted nor hex".to_string()))?;
        Ok(Credential::Secret(SecurePassword::new(bytes)))
    }
}

/// Decides whether a presented credential is acceptable.
pub trait CredentialVerifier {
    /// Returns whether `credential` authenticates the session.
    fn verify(&self, credential: &Credential) -> bool;
}

/// The verifier built from configuration.
///
/// A verifier is open only when no authentication method was configured at
/// all. A configured method that yields nothing usable rejects every
/// credential instead.
#[derive(Debug, Clone)]
pub struct ConfiguredAuth {
    passwords: Vec<HashedPassword>,
    cookie: Option<AuthCookie>,
    open: bool,
}

impl Default for ConfiguredAuth {
    fn default() -> Self {
        Self::new(Vec::new(), None)
    }
}

impl ConfiguredAuth {
    /// Builds a verifier from decoded hashes and an optional cookie.
    ///
    /// With neither, the verifier is open and accepts the null credential.
    pub fn new(passwords: Vec<HashedPassword>, cookie: Option<AuthCookie>) -> Self {
        let open = passwords.is_empty() && cookie.is_none();
        Self {
            passwords,
            cookie,
            open,
        }
    }

    /// Builds a verifier from configuration, warning about bad entries.
    ///
    /// A cookie is only kept when cookie authentication is enabled. The
    /// verifier is open only if `hashed_control_passwords` is empty and
    /// `cookie_authentication` is off.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if every configured password entry is
    /// malformed, or if cookie authentication is enabled without a cookie.
    pub fn from_config(config: &Config, cookie: Option<AuthCookie>) -> Result<Self> {
        let decoded = decode_hashed_passwords(&config.hashed_control_passwords);
        for err in &decoded.rejected {
            plog(LogLevel::Warn, &format!("Ignoring control password: {}", err));
        }
        if !config.hashed_control_passwords.is_empty() && decoded.accepted.is_empty() {
            return Err(Error::Config(format!(
                "none of the {} hashed_control_passwords entries is usable",
                config.hashed_control_passwords.len()
            )));
        }

        let cookie = if config.cookie_authentication {
            Some(cookie.ok_or_else(|| {
                Error::Config("cookie_authentication is enabled but no cookie was supplied".to_string())
            })?)
        } else {
            None
        };

        Ok(Self {
            passwords: decoded.accepted,
            cookie,
            open: config.hashed_control_passwords.is_empty() && !config.cookie_authentication,
        })
    }

    /// Whether no authentication method is configured.
    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl CredentialVerifier for ConfiguredAuth {
    fn verify(&self, credential: &Credential) -> bool {
        match credential {
            Credential::Null => self.open,
            Credential::Secret(secret) => {
                let secret = secret.as_bytes();
                let cookie_ok = self
                    .cookie
                    .as_ref()
                    .map(|cookie| verify_cookie(secret, cookie.as_bytes()))
                    .unwrap_or(false);
                let password_ok = self
                    .passwords
                    .iter()
                    .fold(false, |ok, stored| verify(secret, stored) | ok);
                cookie_ok | password_ok
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

    #[test]
    fn test_s2k_count() {
        assert_eq!(s2k_count(0x60), 65536);
        assert_eq!(s2k_count(0x00), 16 << 6);
        assert_eq!(s2k_count(0x0F), 31 << 6);
    }

    #[test]
    fn test_secret_to_key_matches_manual_iteration() {
        // Specifier 0 hashes exactly 1024 bytes of repeated salt||secret.
        let secret = b"abc";
        let mut material = SALT.to_vec();
        material.extend_from_slice(secret);
        let stream: Vec<u8> = material.iter().copied().cycle().take(1024).collect();
        let mut expected = [0u8; DIGEST_LEN];
        expected.copy_from_slice(&Sha1::digest(&stream));

        assert_eq!(secret_to_key(secret, &SALT, 0), expected);
    }

    #[test]
    fn test_display_and_decode_round_trip() {
        let hashed = HashedPassword::with_salt(b"password", SALT, DEFAULT_S2K_COUNT_SPECIFIER);
        let text = hashed.to_string();
        assert!(text.starts_with("16:0102030405060708"));
        assert_eq!(text.len(), 3 + 2 * HASHED_PASSWORD_LEN);

        let decoded = decode_hashed_passwords(&[text]);
        assert_eq!(decoded.accepted, vec![hashed]);
    }

    #[test]
    fn test_base64_entries_accepted() {
        let hashed = HashedPassword::with_salt(b"pw", SALT, 0x10);
        let b64 = base64::engine::general_purpose::STANDARD.encode(hashed.to_bytes());
        let decoded = decode_hashed_passwords(&[b64]);
        assert_eq!(decoded.accepted.len(), 1);
        assert!(verify(b"pw", &decoded.accepted[0]));
    }

    #[test]
    fn test_malformed_entries_rejected_individually() {
        let good = HashedPassword::with_salt(b"pw", SALT, 0x10).to_string();
        let decoded = decode_hashed_passwords(&["16:zz", good.as_str(), "16:0102", "!!!"]);
        assert_eq!(decoded.accepted.len(), 1);
        let indexes: Vec<usize> = decoded
            .rejected
            .iter()
            .map(|e| match e {
                Error::InvalidHashedPassword { index, .. } => *index,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(indexes, vec![0, 2, 3]);
    }

    #[test]
    fn test_verify() {
        let hashed = HashedPassword::with_salt(b"correct horse", SALT, 0x10);
        assert!(verify(b"correct horse", &hashed));
        assert!(!verify(b"correct horsf", &hashed));
        assert!(!verify(b"", &hashed));
    }

    #[test]
    fn test_cookie_comparison() {
        assert!(verify_cookie(b"deadbeef", b"deadbeef"));
        assert!(!verify_cookie(b"deadbeee", b"deadbeef"));
        assert!(!verify_cookie(b"deadbee", b"deadbeef"));
    }

    #[test]
    fn test_comparison_examines_every_byte() {
        let expected = b"deadbeef";
        for position in 0..expected.len() {
            let mut candidate = *expected;
            candidate[position] ^= 0xFF;
            let (diff, examined) = accumulate_diff(&candidate, expected);
            assert_ne!(diff, 0);
            assert_eq!(examined, expected.len());
        }
    }

    #[test]
    fn test_generated_cookie_length() {
        let cookie = AuthCookie::generate();
        assert_eq!(cookie.as_bytes().len(), AUTHENTICATION_COOKIE_LEN);
        assert!(format!("{:?}", cookie).contains("REDACTED"));
    }

    #[test]
    fn test_parse_argument() {
        assert_eq!(Credential::parse_argument("").unwrap(), Credential::Null);
        assert_eq!(
            Credential::parse_argument("\"pw\"").unwrap(),
            Credential::Secret(SecurePassword::new(b"pw".to_vec()))
        );
        assert_eq!(
            Credential::parse_argument("6465616462656566").unwrap(),
            Credential::Secret(SecurePassword::new(b"deadbeef".to_vec()))
        );
        assert!(Credential::parse_argument("xyz").is_err());
        assert!(Credential::parse_argument("\"pw\" extra").is_err());
    }

    #[test]
    fn test_configured_auth() {
        let cookie = AuthCookie::from_bytes(b"deadbeef".to_vec());
        let auth = ConfiguredAuth::new(
            vec![HashedPassword::with_salt(b"pw", SALT, 0x10)],
            Some(cookie),
        );
        let secret = |b: &[u8]| Credential::Secret(SecurePassword::new(b.to_vec()));

        assert!(auth.verify(&secret(b"pw")));
        assert!(auth.verify(&secret(b"deadbeef")));
        assert!(!auth.verify(&secret(b"deadbeee")));
        assert!(!auth.verify(&Credential::Null));
        assert!(ConfiguredAuth::default().verify(&Credential::Null));
    }

    #[test]
    fn test_from_config_drops_cookie_when_disabled() {
        let mut config = Config::default();
        config.cookie_authentication = false;
        let auth = ConfiguredAuth::from_config(&config, Some(AuthCookie::generate())).unwrap();
        assert!(auth.is_open());
        assert!(auth.verify(&Credential::Null));
    }

    #[test]
    fn test_from_config_all_passwords_malformed_fails_closed() {
        let mut config = Config::default();
        config.cookie_authentication = false;
        config.hashed_control_passwords = vec!["16:DEADBEEF".to_string(), "garbage".to_string()];

        let err = ConfiguredAuth::from_config(&config, None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_config_cookie_enabled_without_cookie_fails_closed() {
        let config = Config::default();
        assert!(config.cookie_authentication);

        let err = ConfiguredAuth::from_config(&config, None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_config_partly_malformed_is_not_open() {
        let good = HashedPassword::with_salt(b"pw", SALT, 0x10).to_string();
        let mut config = Config::default();
        config.cookie_authentication = false;
        config.hashed_control_passwords = vec!["16:DEADBEEF".to_string(), good];

        let auth = ConfiguredAuth::from_config(&config, None).unwrap();
        assert!(!auth.is_open());
        assert!(!auth.verify(&Credential::Null));
        assert!(auth.verify(&Credential::Secret(SecurePassword::new(b"pw".to_vec()))));
    }

    #[test]
    fn test_from_config_cookie_only() {
        let config = Config::default();
        let cookie = AuthCookie::from_bytes(b"deadbeef".to_vec());

        let auth = ConfiguredAuth::from_config(&config, Some(cookie)).unwrap();
        assert!(!auth.is_open());
        assert!(!auth.verify(&Credential::Null));
        assert!(auth.verify(&Credential::Secret(SecurePassword::new(b"deadbeef".to_vec()))));
    }

    #[test]
    fn test_secret_debug_redacted() {
        let secret = SecurePassword::new(b"hunter2".to_vec());
        let debug = format!("{:?}", secret);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("hunter2"));
    }
}
