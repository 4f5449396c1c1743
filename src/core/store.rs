//! Access to the live kernel rule store
//!
//! [`RuleStore`] is the seam between the reconciliation engine and the
//! external commands that read and mutate the kernel rules. [`IptablesStore`]
//! drives `iptables`/`iptables-save` through [`crate::elevation`];
//! [`MemoryStore`] serves dry runs and tests.

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::core::codec::{self, CodecOptions};
use crate::core::error::{Error, IptablesErrorPattern, Result};
use crate::core::rule::{Chain, Table};
use crate::elevation;

/// Result of asking the store to make its state survive a reboot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The persistence command ran successfully
    Saved { command: String },
    /// No persistence command is known for this host
    Unavailable { reason: String },
}

/// The live rule store.
///
/// Every method takes `&mut self`: the store is one shared mutable resource
/// and a pass drives it strictly one operation at a time.
#[allow(async_fn_in_trait)]
pub trait RuleStore {
    /// Returns the full `iptables-save` style dump.
    async fn dump(&mut self) -> Result<String>;

    /// Inserts a rule at the 1-based position `ordinal` of `table`/`chain`.
    ///
    /// `args` are the rendered match and target arguments, `-t` included.
    async fn insert(
        &mut self,
        table: Table,
        chain: Chain,
        ordinal: usize,
        args: &[String],
    ) -> Result<()>;

    /// Deletes the rule at the 1-based position `ordinal`.
    async fn delete_at(&mut self, table: Table, chain: Chain, ordinal: usize) -> Result<()>;

    /// Deletes the first rule whose match and target arguments equal `args`.
    async fn delete_matching(&mut self, table: Table, chain: Chain, args: &[String])
    -> Result<()>;

    /// Makes the current rules survive a reboot.
    async fn persist(&mut self) -> Result<PersistOutcome>;
}

/// [`RuleStore`] backed by the iptables command line tools
#[derive(Debug, Clone)]
pub struct IptablesStore {
    iptables: String,
    iptables_save: String,
    wait_for_lock: bool,
    persist_command: Option<Vec<String>>,
}

impl IptablesStore {
    pub fn new(iptables: impl Into<String>, iptables_save: impl Into<String>) -> Self {
        Self {
            iptables: iptables.into(),
            iptables_save: iptables_save.into(),
            wait_for_lock: true,
            persist_command: None,
        }
    }

    /// Passes `-w` so iptables waits for the xtables lock instead of failing.
    pub fn wait_for_lock(mut self, wait: bool) -> Self {
        self.wait_for_lock = wait;
        self
    }

    pub fn with_persist_command(mut self, command: Option<Vec<String>>) -> Self {
        self.persist_command = command.filter(|argv| !argv.is_empty());
        self
    }

    fn base_args(&self) -> Vec<String> {
        if self.wait_for_lock {
            vec!["-w".to_string()]
        } else {
            Vec::new()
        }
    }

    async fn mutate(&self, operation: String, args: Vec<String>) -> Result<()> {
        debug!("{} {}", self.iptables, args.join(" "));
        let cmd = elevation::create_elevated_iptables_command(&self.iptables, &args)?;
        let output = run(cmd, &operation).await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let translation = IptablesErrorPattern::match_error(&stderr);
            error!("{operation} failed: {stderr}");
            for suggestion in &translation.suggestions {
                debug!("  hint: {suggestion}");
            }
            Err(Error::ApplyOperationFailed {
                operation,
                message: if stderr.is_empty() {
                    translation.user_message
                } else {
                    format!("{} ({stderr})", translation.user_message)
                },
                exit_code: output.status.code(),
            })
        }
    }
}

async fn run(mut cmd: Command, what: &str) -> Result<std::process::Output> {
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            error!("Failed to spawn command for {what}: {e}");
            Error::ApplyOperationFailed {
                operation: what.to_string(),
                message: format!("failed to spawn: {e}"),
                exit_code: None,
            }
        })?;
    Ok(child.wait_with_output().await?)
}

impl RuleStore for IptablesStore {
    async fn dump(&mut self) -> Result<String> {
        let cmd = elevation::create_elevated_save_command(&self.iptables_save)
            .map_err(|e| Error::DumpUnavailable(e.to_string()))?;
        let output = run(cmd, "dump")
            .await
            .map_err(|e| Error::DumpUnavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let translation = IptablesErrorPattern::match_error(&stderr);
            return Err(Error::DumpUnavailable(format!(
                "{} exited with {:?}: {}",
                self.iptables_save,
                output.status.code(),
                translation.user_message
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!("Read {} bytes of live rules", text.len());
        Ok(text)
    }

    async fn insert(
        &mut self,
        table: Table,
        chain: Chain,
        ordinal: usize,
        args: &[String],
    ) -> Result<()> {
        let mut argv = self.base_args();
        argv.extend(["-I".to_string(), chain.to_string(), ordinal.to_string()]);
        argv.extend(args.iter().cloned());
        self.mutate(format!("insert {table}/{chain}#{ordinal}"), argv)
            .await
    }

    async fn delete_at(&mut self, table: Table, chain: Chain, ordinal: usize) -> Result<()> {
        let mut argv = self.base_args();
        argv.extend([
            "-t".to_string(),
            table.to_string(),
            "-D".to_string(),
            chain.to_string(),
            ordinal.to_string(),
        ]);
        self.mutate(format!("delete {table}/{chain}#{ordinal}"), argv)
            .await
    }

    async fn delete_matching(
        &mut self,
        table: Table,
        chain: Chain,
        args: &[String],
    ) -> Result<()> {
        let mut argv = self.base_args();
        argv.extend(["-D".to_string(), chain.to_string()]);
        argv.extend(args.iter().cloned());
        self.mutate(format!("delete {table}/{chain} by rule match"), argv)
            .await
    }

    async fn persist(&mut self) -> Result<PersistOutcome> {
        let Some(argv) = self.persist_command.as_ref() else {
            warn!("No persistence command known for this host; rules will not survive a reboot");
            return Ok(PersistOutcome::Unavailable {
                reason: "no persistence command for this OS family".to_string(),
            });
        };

        let command = argv.join(" ");
        info!("Persisting rules with '{command}'");
        let cmd = elevation::create_elevated_persist_command(argv)
            .map_err(|e| Error::PersistUnavailable(e.to_string()))?;
        let output = run(cmd, "persist")
            .await
            .map_err(|e| Error::PersistUnavailable(e.to_string()))?;

        if output.status.success() {
            Ok(PersistOutcome::Saved { command })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(Error::PersistUnavailable(format!(
                "'{command}' exited with {:?}: {stderr}",
                output.status.code()
            )))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredLine {
    table: String,
    chain: String,
    line: String,
}

/// [`RuleStore`] holding rule lines in memory.
///
/// Positions behave like iptables: `insert` at `len + 1` appends, anything
/// beyond is an error. Dry runs replay a pass against a copy of the live
/// dump held here.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    lines: Vec<StoredLine>,
    options: CodecOptions,
}

impl MemoryStore {
    pub fn new(options: CodecOptions) -> Self {
        Self {
            lines: Vec::new(),
            options,
        }
    }

    /// Seeds the store from an `iptables-save` dump.
    pub fn from_dump(dump: &str, options: CodecOptions) -> Self {
        let mut store = Self::new(options);
        let mut table = Table::Filter.to_string();
        for line in dump.lines().map(str::trim) {
            if let Some(name) = line.strip_prefix('*') {
                table = name.trim().to_string();
            } else if line.starts_with("-A ") {
                let chain = line.split_whitespace().nth(1).unwrap_or_default();
                store.lines.push(StoredLine {
                    table: table.clone(),
                    chain: chain.to_string(),
                    line: line.to_string(),
                });
            }
        }
        store
    }

    /// Rule lines of one chain, in order.
    pub fn chain_lines(&self, table: Table, chain: Chain) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| l.table == table.as_str() && l.chain == chain.as_str())
            .map(|l| l.line.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn positions(&self, table: Table, chain: Chain) -> Vec<usize> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.table == table.as_str() && l.chain == chain.as_str())
            .map(|(i, _)| i)
            .collect()
    }

    /// `-A CHAIN` line for rendered arguments, quoted like iptables-save.
    fn line_from_args(chain: Chain, args: &[String]) -> String {
        let mut line = format!("-A {chain}");
        let mut free_text = false;
        for arg in args {
            line.push(' ');
            if free_text {
                line.push_str(&codec::quote_always(arg));
            } else {
                line.push_str(&codec::quote_arg(arg));
            }
            free_text = matches!(arg.as_str(), "--comment" | "--log-prefix");
        }
        line
    }

    fn refused(operation: String, message: &str) -> Error {
        Error::ApplyOperationFailed {
            operation,
            message: message.to_string(),
            exit_code: Some(1),
        }
    }
}

impl RuleStore for MemoryStore {
    async fn dump(&mut self) -> Result<String> {
        let mut tables: Vec<&str> = Vec::new();
        for line in &self.lines {
            if !tables.contains(&line.table.as_str()) {
                tables.push(&line.table);
            }
        }
        let mut out = String::new();
        for table in tables {
            out.push('*');
            out.push_str(table);
            out.push('\n');
            for line in self.lines.iter().filter(|l| l.table == table) {
                out.push_str(&line.line);
                out.push('\n');
            }
            out.push_str("COMMIT\n");
        }
        Ok(out)
    }

    async fn insert(
        &mut self,
        table: Table,
        chain: Chain,
        ordinal: usize,
        args: &[String],
    ) -> Result<()> {
        let positions = self.positions(table, chain);
        if ordinal == 0 || ordinal > positions.len() + 1 {
            return Err(Self::refused(
                format!("insert {table}/{chain}#{ordinal}"),
                "Index of insertion too big.",
            ));
        }
        let index = match (positions.get(ordinal - 1), positions.last()) {
            (Some(&at), _) => at,
            (None, Some(&last)) => last + 1,
            (None, None) => self
                .lines
                .iter()
                .rposition(|l| l.table == table.as_str())
                .map_or(self.lines.len(), |i| i + 1),
        };
        self.lines.insert(
            index,
            StoredLine {
                table: table.to_string(),
                chain: chain.to_string(),
                line: Self::line_from_args(chain, args),
            },
        );
        Ok(())
    }

    async fn delete_at(&mut self, table: Table, chain: Chain, ordinal: usize) -> Result<()> {
        let positions = self.positions(table, chain);
        let Some(&index) = ordinal.checked_sub(1).and_then(|i| positions.get(i)) else {
            return Err(Self::refused(
                format!("delete {table}/{chain}#{ordinal}"),
                "Index of deletion too big.",
            ));
        };
        self.lines.remove(index);
        Ok(())
    }

    async fn delete_matching(
        &mut self,
        table: Table,
        chain: Chain,
        args: &[String],
    ) -> Result<()> {
        let section = Some(table.as_str());
        let wanted = codec::parse_line(&Self::line_from_args(chain, args), section, &self.options)?;
        let found = self.positions(table, chain).into_iter().find(|&i| {
            codec::parse_line(&self.lines[i].line, section, &self.options)
                .is_ok_and(|parsed| parsed == wanted)
        });
        let Some(index) = found else {
            return Err(Self::refused(
                format!("delete {table}/{chain} by rule match"),
                "Bad rule (does a matching rule exist in that chain?).",
            ));
        };
        self.lines.remove(index);
        Ok(())
    }

    async fn persist(&mut self) -> Result<PersistOutcome> {
        Ok(PersistOutcome::Unavailable {
            reason: "in-memory rule store".to_string(),
        })
    }
}
