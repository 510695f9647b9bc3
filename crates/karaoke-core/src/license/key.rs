//! Activation key text format.
//!
//! Canonical form is four groups of four uppercase alphanumerics joined by
//! hyphens (`ABCD-1234-EFGH-5678`). Input is case-insensitive and may omit
//! the hyphens or contain stray whitespace.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::ValidationError;

const GROUPS: usize = 4;
const GROUP_LEN: usize = 4;

/// A normalized activation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LicenseKey(String);

impl LicenseKey {
    /// Normalize raw user input into the canonical grouping.
    ///
    /// Every non-alphanumeric character is dropped, the rest is uppercased
    /// and regrouped. Anything that does not leave exactly sixteen
    /// alphanumerics is rejected with [`ValidationError::InvalidFormat`].
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let compact: String = input
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_uppercase())
            .collect();

        // Non-ASCII alphanumerics would be silently dropped above; refuse them.
        if compact.len() != GROUPS * GROUP_LEN
            || input.chars().any(|c| c.is_alphanumeric() && !c.is_ascii())
        {
            return Err(ValidationError::InvalidFormat);
        }

        let mut canonical = String::with_capacity(GROUPS * (GROUP_LEN + 1));
        for (i, ch) in compact.chars().enumerate() {
            if i > 0 && i % GROUP_LEN == 0 {
                canonical.push('-');
            }
            canonical.push(ch);
        }
        Ok(Self(canonical))
    }

    /// Generate a fresh random key (uppercase hex groups).
    pub fn generate() -> Self {
        const HEX: &[u8] = b"0123456789ABCDEF";
        let mut rng = rand::thread_rng();
        let groups: Vec<String> = (0..GROUPS)
            .map(|_| {
                (0..GROUP_LEN)
                    .map(|_| char::from(HEX[rng.gen_range(0..HEX.len())]))
                    .collect()
            })
            .collect();
        Self(groups.join("-"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form safe for logs (first group only).
    pub fn redacted(&self) -> String {
        format!("{}-****-****-****", &self.0[..GROUP_LEN])
    }
}

impl fmt::Display for LicenseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LicenseKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for LicenseKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<LicenseKey> for String {
    fn from(key: LicenseKey) -> Self {
        key.0
    }
}
