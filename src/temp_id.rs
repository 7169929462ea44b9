//! Deterministic temp-ID generation.
//!
//! A temp ID is `IN_` followed by the RFC 4648 Base32 encoding of the first
//! 80 bits of the BLAKE3 digest of the normalized name. BLAKE3 output is fixed
//! across platforms, so any implementation derives the same ID for the same name.

use blake3::Hasher;

use crate::mapping::CompanyId;

/// Prefix shared by every synthetic company ID.
pub const TEMP_ID_PREFIX: &str = "IN_";

/// Number of Base32 characters after the prefix.
pub const TEMP_ID_DIGEST_LEN: usize = 16;

/// Total temp-ID length (`IN_` + 16).
pub const TEMP_ID_LEN: usize = TEMP_ID_PREFIX.len() + TEMP_ID_DIGEST_LEN;

/// Hash input used for blank names. Every blank name maps to the same ID.
pub const BLANK_NAME_SENTINEL: &str = "__BLANK_COMPANY_NAME__";

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Encodes exactly 10 bytes (80 bits) into 16 Base32 characters.
fn base32_80(bytes: &[u8; 10]) -> String {
    let mut out = String::with_capacity(TEMP_ID_DIGEST_LEN);
    for chunk in bytes.chunks_exact(5) {
        let mut acc = 0u64;
        for &b in chunk {
            acc = (acc << 8) | u64::from(b);
        }
        for shift in (0..8).rev() {
            let idx = ((acc >> (shift * 5)) & 0x1F) as usize;
            out.push(char::from(BASE32_ALPHABET[idx]));
        }
    }
    out
}

fn digest_id(input: &str) -> CompanyId {
    let mut h = Hasher::new();
    h.update(input.as_bytes());
    let hash = h.finalize();

    let mut head = [0u8; 10];
    head.copy_from_slice(&hash.as_bytes()[..10]);
    CompanyId::new_unchecked(format!("{TEMP_ID_PREFIX}{}", base32_80(&head)))
}

/// Stateless temp-ID generator.
///
/// # Examples
///
/// ```
/// use company_id_resolver::TempIdGenerator;
///
/// let generator = TempIdGenerator::new();
/// let a = generator.generate("中国平安保险公司");
/// assert!(a.as_str().starts_with("IN_"));
/// assert_eq!(a.as_str().len(), 19);
/// assert_eq!(a, generator.generate("中国平安保险公司"));
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct TempIdGenerator;

impl TempIdGenerator {
    /// Creates a generator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Derives the temp ID for an already-normalized name.
    ///
    /// Blank input is replaced by `BLANK_NAME_SENTINEL` before hashing.
    #[must_use]
    pub fn generate(&self, normalized_name: &str) -> CompanyId {
        if normalized_name.trim().is_empty() {
            return digest_id(BLANK_NAME_SENTINEL);
        }
        digest_id(normalized_name)
    }

    /// Like `generate`, but a blank name is hashed together with
    /// `disambiguator` so unrelated blank-name rows do not share one ID.
    ///
    /// Non-blank names ignore the disambiguator. A blank disambiguator falls
    /// back to the shared sentinel ID.
    #[must_use]
    pub fn generate_with_disambiguator(
        &self,
        normalized_name: &str,
        disambiguator: Option<&str>,
    ) -> CompanyId {
        if !normalized_name.trim().is_empty() {
            return digest_id(normalized_name);
        }
        match disambiguator.map(str::trim).filter(|d| !d.is_empty()) {
            Some(d) => digest_id(&format!("{BLANK_NAME_SENTINEL}|{d}")),
            None => digest_id(BLANK_NAME_SENTINEL),
        }
    }
}

/// Returns true if `id` has the shape of a generated temp ID.
#[must_use]
pub fn is_temp_id(id: &str) -> bool {
    id.len() == TEMP_ID_LEN
        && id.starts_with(TEMP_ID_PREFIX)
        && id[TEMP_ID_PREFIX.len()..]
            .bytes()
            .all(|b| BASE32_ALPHABET.contains(&b))
}
