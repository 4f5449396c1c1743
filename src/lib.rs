//! iptsync - declarative iptables reconciliation
//!
//! Converges the live iptables rules onto a declared rule set with the
//! fewest inserts and deletes, leaving rules it does not manage alone.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, text codec, live/desired state and the reconciler
//! - [`audit`] - Audit logging for every mutating pass
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration loading
//! - [`facts`] - OS family and persistence command detection
//! - [`elevation`] - Privilege elevation for iptables commands
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Example
//!
//! ```no_run
//! use iptsync::core::codec::CodecOptions;
//! use iptsync::core::desired::{DesiredStateBuilder, parse_declarations};
//! use iptsync::core::reconcile::{ReconcileOptions, Reconciler};
//! use iptsync::core::store::IptablesStore;
//!
//! # async fn run() -> iptsync::Result<()> {
//! let declarations = parse_declarations(r#"[{"name": "web", "dport": 80}]"#)?;
//! let mut builder = DesiredStateBuilder::new(CodecOptions::default());
//! for declaration in &declarations {
//!     let _ = builder.push(declaration);
//! }
//! let desired = builder.finish();
//!
//! let mut store = IptablesStore::new("/sbin/iptables", "/sbin/iptables-save");
//! let report = Reconciler::new(ReconcileOptions::default())
//!     .reconcile(&desired, &mut store)
//!     .await?;
//! println!("{} inserted, {} deleted", report.inserted.len(), report.deleted.len());
//! # Ok(())
//! # }
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod facts;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::reconcile::{ReconcileReport, Reconciler};
pub use core::rule::RuleRecord;
