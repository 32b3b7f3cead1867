use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Traffic Light Protocol levels, ordered by sensitivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tlp {
    White,
    Green,
    Amber,
    Red,
}

impl Tlp {
    pub const ALL: [Tlp; 4] = [Tlp::White, Tlp::Green, Tlp::Amber, Tlp::Red];

    pub fn as_str(self) -> &'static str {
        match self {
            Tlp::White => "TLP:WHITE",
            Tlp::Green => "TLP:GREEN",
            Tlp::Amber => "TLP:AMBER",
            Tlp::Red => "TLP:RED",
        }
    }

    /// Whether data marked `other` may be handled under a `self` ceiling.
    pub fn allows(self, other: Tlp) -> bool {
        other <= self
    }
}

impl fmt::Display for Tlp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tlp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Tlp::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnknownTlp(s.to_string()))
    }
}

/// Checks that `tlp` does not exceed the `max_tlp` ceiling.
///
/// An unrecognized marking is never allowed; an unrecognized ceiling is an
/// error.
pub fn check_max_tlp(tlp: &str, max_tlp: &str) -> Result<bool> {
    let ceiling: Tlp = max_tlp.parse()?;
    Ok(tlp.parse::<Tlp>().is_ok_and(|t| ceiling.allows(t)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_containment() {
        assert!(check_max_tlp("TLP:GREEN", "TLP:AMBER").unwrap());
        assert!(!check_max_tlp("TLP:RED", "TLP:GREEN").unwrap());
        assert!(check_max_tlp("TLP:WHITE", "TLP:WHITE").unwrap());
        assert!(check_max_tlp("TLP:RED", "TLP:RED").unwrap());
        assert!(!check_max_tlp("TLP:AMBER", "TLP:WHITE").unwrap());
    }

    #[test]
    fn every_level_allows_itself_and_below() {
        for ceiling in Tlp::ALL {
            for level in Tlp::ALL {
                assert_eq!(ceiling.allows(level), level <= ceiling);
            }
        }
    }

    #[test]
    fn unknown_markings() {
        assert!(!check_max_tlp("TLP:CLEAR-ISH", "TLP:RED").unwrap());
        assert!(matches!(
            check_max_tlp("TLP:GREEN", "TLP:PURPLE"),
            Err(Error::UnknownTlp(_))
        ));
        assert_eq!("tlp:amber".parse::<Tlp>().unwrap(), Tlp::Amber);
    }
}
