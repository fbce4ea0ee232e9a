use crate::scanner::PresenceRecord;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Absent,
    UpToDate,
    Stale,
}

impl Freshness {
    pub fn label(self) -> &'static str {
        match self {
            Freshness::Absent => "new",
            Freshness::UpToDate => "up to date",
            Freshness::Stale => "update available",
        }
    }

    pub fn needs_transfer(self) -> bool {
        matches!(self, Freshness::Absent | Freshness::Stale)
    }
}

/// Equal timestamps count as up to date; there is no tolerance window.
pub fn is_update_available(source: &PresenceRecord, target: Option<&PresenceRecord>) -> Freshness {
    match target {
        None => Freshness::Absent,
        Some(target) if source.last_modified > target.last_modified => Freshness::Stale,
        Some(_) => Freshness::UpToDate,
    }
}
