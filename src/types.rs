//! Core identifiers for the simulator
//!
//! The system is fixed at ten sites and twenty variables. Even-numbered
//! variables are replicated on every site; odd-numbered variables live on a
//! single home site.

use std::fmt;
use std::str::FromStr;

use crate::error::ReplikvError;

/// Transaction identifier, the `i` in `Ti`.
pub type TxnId = u32;

/// Site identifier, 1 through [`SITE_COUNT`].
pub type SiteId = u8;

/// Logical clock value. Advances by one per script operation.
pub type Tick = u64;

/// Number of sites in the cluster.
pub const SITE_COUNT: u8 = 10;

/// Number of variables in the database.
pub const VARIABLE_COUNT: u8 = 20;

/// Variable identifier, the `i` in `xi`.
///
/// Ordered numerically, so `x2` sorts before `x10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableId(u8);

impl VariableId {
    /// Create a variable id, checking the 1..=20 range.
    pub fn new(index: u8) -> Result<Self, ReplikvError> {
        if (1..=VARIABLE_COUNT).contains(&index) {
            Ok(VariableId(index))
        } else {
            Err(ReplikvError::Internal(format!(
                "variable index {} out of range 1..={}",
                index, VARIABLE_COUNT
            )))
        }
    }

    /// Numeric index of the variable.
    pub fn index(&self) -> u8 {
        self.0
    }

    /// Value every variable starts with.
    pub fn initial_value(&self) -> i64 {
        10 * i64::from(self.0)
    }

    /// Even-numbered variables are replicated on every site.
    pub fn is_replicated(&self) -> bool {
        self.0 % 2 == 0
    }

    /// Home site of a non-replicated variable, `1 + (i mod 10)`.
    /// Replicated variables have no single home.
    pub fn home_site(&self) -> Option<SiteId> {
        if self.is_replicated() {
            None
        } else {
            Some(1 + self.0 % SITE_COUNT)
        }
    }

    /// Whether the given site hosts a copy of this variable.
    pub fn hosted_on(&self, site: SiteId) -> bool {
        self.home_site().map_or(true, |home| home == site)
    }

    /// All variable ids in ascending order.
    pub fn all() -> impl Iterator<Item = VariableId> {
        (1..=VARIABLE_COUNT).map(VariableId)
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

impl FromStr for VariableId {
    type Err = ReplikvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let index = s
            .strip_prefix('x')
            .and_then(|rest| rest.parse::<u8>().ok())
            .ok_or_else(|| {
                ReplikvError::Parse(format!("'{}' is not a variable name (expected x1..x20)", s))
            })?;
        VariableId::new(index)
            .map_err(|_| ReplikvError::Parse(format!("variable '{}' out of range x1..x20", s)))
    }
}
