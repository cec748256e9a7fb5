use crate::error::BomError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Distributors the BOM checker can query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Supplier {
    Digikey,
    Mouser,
}

impl Supplier {
    pub const ALL: [Supplier; 2] = [Supplier::Digikey, Supplier::Mouser];

    /// Persisted name
    pub fn as_str(&self) -> &'static str {
        match self {
            Supplier::Digikey => "DIGIKEY",
            Supplier::Mouser => "MOUSER",
        }
    }

    /// Checker endpoint streaming this supplier's results
    pub fn stream_path(&self) -> &'static str {
        match self {
            Supplier::Digikey => "/api/stream-digikey-results",
            Supplier::Mouser => "/api/stream-mouser-results",
        }
    }
}

impl fmt::Display for Supplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Supplier {
    type Err = BomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DIGIKEY" => Ok(Supplier::Digikey),
            "MOUSER" => Ok(Supplier::Mouser),
            other => Err(BomError::Corrupt(format!("unknown supplier '{}'", other))),
        }
    }
}

/// Outcome of a part lookup at one supplier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LookupStatus {
    Found,
    NotFound,
    Backorder,
    Obsolete,
}

impl LookupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupStatus::Found => "FOUND",
            LookupStatus::NotFound => "NOT_FOUND",
            LookupStatus::Backorder => "BACKORDER",
            LookupStatus::Obsolete => "OBSOLETE",
        }
    }

    /// Status carried by a stream event, `None` for events that are not lookup results
    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            "found" => Some(LookupStatus::Found),
            "not_found" => Some(LookupStatus::NotFound),
            "back_order" => Some(LookupStatus::Backorder),
            "obsolete" => Some(LookupStatus::Obsolete),
            _ => None,
        }
    }
}

impl FromStr for LookupStatus {
    type Err = BomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FOUND" => Ok(LookupStatus::Found),
            "NOT_FOUND" => Ok(LookupStatus::NotFound),
            "BACKORDER" => Ok(LookupStatus::Backorder),
            "OBSOLETE" => Ok(LookupStatus::Obsolete),
            other => Err(BomError::Corrupt(format!("unknown lookup status '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(LookupStatus::from_event("back_order"), Some(LookupStatus::Backorder));
        assert_eq!(LookupStatus::from_event("progress"), None);
        assert_eq!(LookupStatus::from_event("FOUND"), None);
        assert_eq!("NOT_FOUND".parse::<LookupStatus>().unwrap(), LookupStatus::NotFound);
        assert_eq!(
            serde_json::to_string(&LookupStatus::Backorder).unwrap(),
            "\"BACKORDER\""
        );
    }

    #[test]
    fn test_supplier_names() {
        assert_eq!("MOUSER".parse::<Supplier>().unwrap(), Supplier::Mouser);
        assert!("ARROW".parse::<Supplier>().is_err());
        assert_eq!(Supplier::Digikey.stream_path(), "/api/stream-digikey-results");
    }
}
