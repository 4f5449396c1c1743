//! Reconciliation core
//!
//! Leaves first:
//!
//! - [`address`]: CIDR and netmask canonicalization
//! - [`rule`]: the structured rule model
//! - [`codec`]: rule text rendering and parsing
//! - [`rule_constraints`]: cross-field rules a rule must obey
//! - [`desired`]: declarations expanded into the sorted desired set
//! - [`store`]: the live rule store seam and its iptables implementation
//! - [`live`]: the parsed live rule set
//! - [`reconcile`]: the engine that diffs and applies
//! - [`snapshot`]: pre-apply dumps with checksums
//! - [`error`]: error types

pub mod address;
pub mod codec;
pub mod desired;
pub mod error;
pub mod live;
pub mod reconcile;
pub mod rule;
pub mod rule_constraints;
pub mod snapshot;
pub mod store;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
