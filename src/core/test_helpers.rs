//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, Once};

use crate::core::codec::CodecOptions;
use crate::core::desired::{Declaration, Resolver, Scalar};
use crate::core::error::{Error, Result};
use crate::core::rule::{Chain, Table};
use crate::core::store::{MemoryStore, PersistOutcome, RuleStore};

/// Mutex for tests that need exclusive access to environment variables.
///
/// Use this when your test needs to:
/// 1. Temporarily change env vars to different values
/// 2. Restore env vars after the test
/// 3. Test behavior when env vars are absent
///
/// For tests that just need the mock iptables script, use
/// `setup_mock_iptables()` instead.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("IPTSYNC_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("IPTSYNC_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

static MOCK_IPTABLES_INIT: Once = Once::new();

/// Sets up the mock iptables script and disables elevation.
///
/// Returns the paths to use as `iptables` and `iptables-save`; the same
/// script plays both roles (`tests/mock_iptables.sh`).
pub fn setup_mock_iptables() -> (String, String) {
    let mock_path = format!("{}/tests/mock_iptables.sh", env!("CARGO_MANIFEST_DIR"));
    MOCK_IPTABLES_INIT.call_once(|| {
        // SAFETY: This is only called once due to Once, and only in test code.
        unsafe {
            std::env::set_var("IPTSYNC_TEST_NO_ELEVATION", "1");
        }
    });
    (mock_path.clone(), mock_path)
}

/// Declaration with only a name; use struct update syntax for the rest.
pub fn decl(name: &str) -> Declaration {
    Declaration {
        name: name.to_string(),
        ..Declaration::default()
    }
}

/// The canonical "web" declaration: tcp/80 ACCEPT in filter/INPUT.
pub fn web_decl() -> Declaration {
    Declaration {
        dport: vec![Scalar::Number(80)],
        ..decl("web")
    }
}

/// Resolver answering from a fixed table
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn with(mut self, host: &str, ip: &str) -> Self {
        self.hosts
            .insert(host.to_string(), ip.parse().expect("valid test address"));
        self
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, host: &str) -> Result<IpAddr> {
        self.hosts
            .get(host)
            .copied()
            .ok_or_else(|| Error::InvalidAddress(format!("{host}: unknown host")))
    }
}

/// [`MemoryStore`] with failure injection and an operation log.
///
/// - `fail_dump`: every dump fails
/// - `fail_dump_after`: dumps after the first N fail
/// - `fail_on`: insert/positional delete of a line containing one of the
///   substrings fails
/// - `fail_matching`: delete by rule match fails
/// - `ignore_deletes`: deletes report success but change nothing
/// - `persist_command` / `fail_persist`: persistence behavior
#[derive(Debug, Default)]
pub struct MockStore {
    pub inner: MemoryStore,
    pub fail_dump: bool,
    pub fail_dump_after: Option<usize>,
    pub fail_on: Vec<String>,
    pub fail_matching: bool,
    pub ignore_deletes: bool,
    pub persist_command: Option<String>,
    pub fail_persist: bool,
    /// Every successful mutation, e.g. `insert filter INPUT 1`
    pub log: Vec<String>,
    pub dumps: usize,
    pub persists: usize,
}

impl MockStore {
    /// Seeds the store from an iptables-save dump.
    pub fn from_dump(dump: &str) -> Self {
        Self {
            inner: MemoryStore::from_dump(dump, CodecOptions::default()),
            ..Self::default()
        }
    }

    pub fn inserts(&self) -> usize {
        self.log.iter().filter(|l| l.starts_with("insert")).count()
    }

    pub fn deletes(&self) -> usize {
        self.log.iter().filter(|l| l.starts_with("delete")).count()
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Rule lines of one chain, in order.
    pub fn chain_lines(&self, table: Table, chain: Chain) -> Vec<String> {
        self.inner
            .chain_lines(table, chain)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn injected(&self, operation: &str, text: &str) -> Result<()> {
        if self.fail_on.iter().any(|needle| text.contains(needle)) {
            return Err(Error::ApplyOperationFailed {
                operation: operation.to_string(),
                message: "injected failure".to_string(),
                exit_code: Some(1),
            });
        }
        Ok(())
    }
}

impl RuleStore for MockStore {
    async fn dump(&mut self) -> Result<String> {
        self.dumps += 1;
        if self.fail_dump || self.fail_dump_after.is_some_and(|n| self.dumps > n) {
            return Err(Error::DumpUnavailable("mock dump disabled".to_string()));
        }
        self.inner.dump().await
    }

    async fn insert(
        &mut self,
        table: Table,
        chain: Chain,
        ordinal: usize,
        args: &[String],
    ) -> Result<()> {
        let operation = format!("insert {table} {chain} {ordinal}");
        self.injected(&operation, &args.join(" "))?;
        self.inner.insert(table, chain, ordinal, args).await?;
        self.log.push(format!("{operation} {}", args.join(" ")));
        Ok(())
    }

    async fn delete_at(&mut self, table: Table, chain: Chain, ordinal: usize) -> Result<()> {
        let operation = format!("delete {table} {chain} {ordinal}");
        let text = ordinal
            .checked_sub(1)
            .and_then(|i| self.inner.chain_lines(table, chain).get(i).map(|l| (*l).to_string()))
            .unwrap_or_default();
        self.injected(&operation, &text)?;
        if !self.ignore_deletes {
            self.inner.delete_at(table, chain, ordinal).await?;
        }
        self.log.push(format!("{operation} {text}"));
        Ok(())
    }

    async fn delete_matching(
        &mut self,
        table: Table,
        chain: Chain,
        args: &[String],
    ) -> Result<()> {
        let operation = format!("delete {table} {chain} matching {}", args.join(" "));
        if self.fail_matching {
            return Err(Error::ApplyOperationFailed {
                operation,
                message: "injected failure".to_string(),
                exit_code: Some(1),
            });
        }
        if !self.ignore_deletes {
            self.inner.delete_matching(table, chain, args).await?;
        }
        self.log.push(operation);
        Ok(())
    }

    async fn persist(&mut self) -> Result<PersistOutcome> {
        self.persists += 1;
        match (&self.persist_command, self.fail_persist) {
            (_, true) => Err(Error::PersistUnavailable("mock persist failed".to_string())),
            (Some(command), false) => Ok(PersistOutcome::Saved {
                command: command.clone(),
            }),
            (None, false) => Ok(PersistOutcome::Unavailable {
                reason: "no persistence command for this OS family".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_store_injects_failures() {
        let mut store = MockStore::from_dump("*filter\n-A INPUT -m comment --comment \"bad\" -j DROP\n");
        store.fail_on.push("\"bad\"".to_string());
        assert!(store.delete_at(Table::Filter, Chain::Input, 1).await.is_err());
        assert_eq!(store.deletes(), 0);

        store.fail_on.clear();
        store.delete_at(Table::Filter, Chain::Input, 1).await.unwrap();
        assert_eq!(store.deletes(), 1);
        assert!(store.chain_lines(Table::Filter, Chain::Input).is_empty());
    }

    #[tokio::test]
    async fn test_mock_store_counts_dumps() {
        let mut store = MockStore::default();
        store.dump().await.unwrap();
        store.fail_dump = true;
        assert!(store.dump().await.is_err());
        assert_eq!(store.dumps, 2);
    }
}
