use serde::{Deserialize, Serialize};
use std::{fmt, num::NonZeroU64, path::Path, str::FromStr};

pub const DEFAULT_EXTENSION: &str = "pak";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct ItemId(NonZeroU64);

impl ItemId {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// Parses a directory name such as `729480149`. Signs, whitespace and
    /// zero are rejected so foreign folders never alias a real id.
    pub fn parse_name(name: &str) -> Option<Self> {
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        name.parse::<u64>().ok().and_then(Self::new)
    }

    pub fn from_file_name(name: &str, ext: &PackageExtension) -> Option<Self> {
        let stem = ext.strip(name)?;
        Self::parse_name(stem)
    }

    pub fn file_name(self, ext: &PackageExtension) -> String {
        format!("{}.{}", self.get(), ext.as_str())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_name(s.trim()).ok_or_else(|| format!("not a workshop id: {s}"))
    }
}

impl TryFrom<u64> for ItemId {
    type Error = String;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| "workshop id must be positive".to_string())
    }
}

impl From<ItemId> for u64 {
    fn from(id: ItemId) -> Self {
        id.get()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageExtension(String);

impl PackageExtension {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().trim_start_matches('.').to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.strip(&name.to_string_lossy()).is_some())
            .unwrap_or(false)
    }

    fn strip<'a>(&self, name: &'a str) -> Option<&'a str> {
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || !ext.eq_ignore_ascii_case(&self.0) {
            return None;
        }
        Some(stem)
    }
}

impl Default for PackageExtension {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSION)
    }
}
