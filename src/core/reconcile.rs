//! Reconciliation engine
//!
//! One pass converges the live rules onto a [`DesiredSet`]:
//!
//! 1. **Collect** the live state; failing to read it aborts the pass.
//! 2. **Delete stale rules**: every unmarked live rule whose comment names no
//!    desired rule, highest position first, re-reading until nothing is left
//!    to delete. The loop is bounded by the number of managed rules seen on
//!    the first read.
//! 3. **Apply** the desired rules missing from the live state at their
//!    positions.
//! 4. **Delete replaced rules**: unmarked live rules that share a name with a
//!    desired rule go only once their replacement is in place.
//! 5. **Persist** when anything changed.
//!
//! A rule is *marked* when it matches a desired rule. With
//! [`KeyMode::Ordinal`] live and desired rules are matched as the longest
//! common subsequence of each chain, so a rule in the wrong order is
//! replaced. With [`KeyMode::Text`] order is ignored and each desired rule
//! marks one live copy.
//!
//! Dry runs replay the same pass against a [`MemoryStore`] seeded with the
//! live dump and report what would have been executed.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;
use similar::{Algorithm, DiffOp, capture_diff_slices};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::codec::{self, CodecOptions};
use crate::core::desired::{DesiredRule, DesiredSet, Rejection};
use crate::core::error::{Error, Result};
use crate::core::live::{ChainSlot, KeyMode, LiveRule, LiveState, LiveStateReader, UnmanagedLine};
use crate::core::rule::{Chain, Table};
use crate::core::store::{MemoryStore, PersistOutcome, RuleStore};

// ═══════════════════════════════════════════════════════════════════════════
// Report
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
}

/// One insert or delete against the live store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub table: Table,
    pub chain: Chain,
    /// 1-based position the operation was issued for
    pub ordinal: usize,
    /// Canonical rule text
    pub text: String,
    #[serde(skip)]
    pub args: Vec<String>,
}

impl Operation {
    fn insert(rule: &DesiredRule, ordinal: usize, options: &CodecOptions) -> Self {
        Self {
            kind: OperationKind::Insert,
            table: rule.record.table,
            chain: rule.record.chain,
            ordinal,
            text: rule.text.clone(),
            args: codec::render_args(&rule.record, options),
        }
    }

    fn delete(rule: &LiveRule, options: &CodecOptions) -> Self {
        Self {
            kind: OperationKind::Delete,
            table: rule.record.table,
            chain: rule.record.chain,
            ordinal: rule.ordinal(),
            text: rule.text.clone(),
            args: codec::render_args(&rule.record, options),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}/{}#{}: {}",
            self.kind, self.table, self.chain, self.ordinal, self.text
        )
    }
}

/// An operation the store refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    pub operation: Operation,
    pub message: String,
    pub exit_code: Option<i32>,
}

/// What happened to persistence at the end of a pass
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PersistStatus {
    /// Nothing changed, persistence is disabled, or this was a dry run
    #[default]
    Skipped,
    Saved { command: String },
    /// No persistence command for this host; rules will not survive a reboot
    Unavailable { reason: String },
    Failed { message: String },
}

/// Terminal state of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum PassState {
    Converged,
    Failed,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub pass_id: Uuid,
    pub dry_run: bool,
    pub deleted: Vec<Operation>,
    pub inserted: Vec<Operation>,
    pub failures: Vec<OperationFailure>,
    pub rejected: Vec<Rejection>,
    #[serde(skip)]
    pub unmanaged: Vec<UnmanagedLine>,
    /// The delete loop stopped at its bound instead of a fixed point
    pub loop_bounded: bool,
    /// Set when the live state could not be re-read mid-pass
    pub aborted: Option<String>,
    /// Desired rules still absent after the pass
    pub missing: Vec<String>,
    pub persist: PersistStatus,
    pending: Vec<Operation>,
}

impl ReconcileReport {
    fn new(dry_run: bool) -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            dry_run,
            deleted: Vec::new(),
            inserted: Vec::new(),
            failures: Vec::new(),
            rejected: Vec::new(),
            unmanaged: Vec::new(),
            loop_bounded: false,
            aborted: None,
            missing: Vec::new(),
            persist: PersistStatus::Skipped,
            pending: Vec::new(),
        }
    }

    pub fn state(&self) -> PassState {
        if self.failures.is_empty()
            && !self.loop_bounded
            && self.aborted.is_none()
            && self.missing.is_empty()
        {
            PassState::Converged
        } else {
            PassState::Failed
        }
    }

    /// Operations a dry run would have executed, in execution order.
    pub fn pending(&self) -> &[Operation] {
        &self.pending
    }

    /// Number of mutations that succeeded.
    pub fn changes(&self) -> usize {
        self.deleted.len() + self.inserted.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Matching
// ═══════════════════════════════════════════════════════════════════════════

/// Pairs live rules of one chain with desired rules.
///
/// Returns, per live rule, the index of the desired rule it satisfies.
pub fn match_chain(live: &[&str], desired: &[&str], mode: KeyMode) -> Vec<Option<usize>> {
    let mut matches = vec![None; live.len()];
    match mode {
        KeyMode::Ordinal => {
            for op in capture_diff_slices(Algorithm::Myers, live, desired) {
                if let DiffOp::Equal {
                    old_index,
                    new_index,
                    len,
                } = op
                {
                    for i in 0..len {
                        matches[old_index + i] = Some(new_index + i);
                    }
                }
            }
        }
        KeyMode::Text => {
            let mut wanted: HashMap<&str, Vec<usize>> = HashMap::new();
            for (index, text) in desired.iter().enumerate().rev() {
                wanted.entry(*text).or_default().push(index);
            }
            for (slot, text) in live.iter().enumerate() {
                matches[slot] = wanted.get_mut(text).and_then(Vec::pop);
            }
        }
    }
    matches
}

/// Which unmarked rules a delete pass may remove
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteScope {
    /// Rules whose comment names no desired rule
    Stale,
    /// Every unmarked rule
    All,
}

/// Failed positional deletes, as (table, chain, text) with a count
type Excluded = HashMap<(Table, Chain, String), usize>;

fn chains_of(live: &LiveState, desired: &DesiredSet) -> BTreeSet<(Table, Chain)> {
    live.chains
        .keys()
        .copied()
        .chain(desired.chains())
        .collect()
}

fn desired_texts(desired: &DesiredSet, table: Table, chain: Chain) -> Vec<&DesiredRule> {
    desired.chain(table, chain).collect()
}

/// Deletes for the unmarked live rules in `scope`, highest position first.
fn plan_deletes(
    live: &LiveState,
    desired: &DesiredSet,
    names: &HashSet<&str>,
    mode: KeyMode,
    scope: DeleteScope,
    excluded: &Excluded,
    options: &CodecOptions,
) -> Vec<Operation> {
    let mut ops = Vec::new();
    for (table, chain) in chains_of(live, desired) {
        let rules: Vec<&LiveRule> = live.managed(table, chain).collect();
        let live_texts: Vec<&str> = rules.iter().map(|r| r.text.as_str()).collect();
        let wanted = desired_texts(desired, table, chain);
        let wanted_texts: Vec<&str> = wanted.iter().map(|r| r.text.as_str()).collect();
        let matches = match_chain(&live_texts, &wanted_texts, mode);

        let mut skipped: HashMap<&str, usize> = HashMap::new();
        let mut chain_ops = Vec::new();
        for (rule, matched) in rules.iter().zip(&matches) {
            if matched.is_some() {
                continue;
            }
            let failed = excluded
                .get(&(table, chain, rule.text.clone()))
                .copied()
                .unwrap_or_default();
            let seen = skipped.entry(rule.text.as_str()).or_default();
            if *seen < failed {
                *seen += 1;
                continue;
            }
            let replaced = rule
                .record
                .name
                .as_deref()
                .is_some_and(|name| names.contains(name));
            if scope == DeleteScope::Stale && replaced {
                continue;
            }
            chain_ops.push(Operation::delete(rule, options));
        }
        chain_ops.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
        ops.extend(chain_ops);
    }
    ops
}

/// Inserts for the desired rules absent from `live`.
///
/// In ordinal mode each missing rule goes right after the desired rule
/// before it; in text mode missing rules are appended to the chain.
fn plan_inserts(
    live: &LiveState,
    desired: &DesiredSet,
    mode: KeyMode,
    options: &CodecOptions,
) -> Vec<Operation> {
    let mut ops = Vec::new();
    for (table, chain) in desired.chains() {
        let slots = live.chain(table, chain);
        let managed: Vec<(usize, &LiveRule)> = slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_managed().map(|rule| (i, rule)))
            .collect();
        let live_texts: Vec<&str> = managed.iter().map(|(_, r)| r.text.as_str()).collect();
        let wanted = desired_texts(desired, table, chain);
        let wanted_texts: Vec<&str> = wanted.iter().map(|r| r.text.as_str()).collect();

        let mut placed: Vec<Option<usize>> = vec![None; wanted.len()];
        for ((slot_index, _), matched) in managed
            .iter()
            .zip(match_chain(&live_texts, &wanted_texts, mode))
        {
            if let Some(d) = matched {
                placed[d] = Some(*slot_index);
            }
        }

        match mode {
            KeyMode::Ordinal => {
                let mut cursor = 0;
                let mut inserted = 0;
                for (rule, slot) in wanted.iter().zip(&placed) {
                    if let Some(slot_index) = slot {
                        cursor = slot_index + inserted + 1;
                    } else {
                        ops.push(Operation::insert(rule, cursor + 1, options));
                        cursor += 1;
                        inserted += 1;
                    }
                }
            }
            KeyMode::Text => {
                let mut len = slots.len();
                for (rule, slot) in wanted.iter().zip(&placed) {
                    if slot.is_none() {
                        len += 1;
                        ops.push(Operation::insert(rule, len, options));
                    }
                }
            }
        }
    }
    ops
}

/// Canonical text of desired rules with no live counterpart.
fn missing_rules(live: &LiveState, desired: &DesiredSet) -> Vec<String> {
    let mut present: HashMap<&str, usize> = HashMap::new();
    for text in live.chains.values().flatten().filter_map(ChainSlot::as_managed) {
        *present.entry(text.text.as_str()).or_default() += 1;
    }
    desired
        .tables
        .values()
        .flatten()
        .filter(|rule| match present.get_mut(rule.text.as_str()) {
            Some(count) if *count > 0 => {
                *count -= 1;
                false
            }
            _ => true,
        })
        .map(|rule| rule.text.clone())
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Reconciler
// ═══════════════════════════════════════════════════════════════════════════

/// Settings for one pass
#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub codec: CodecOptions,
    pub mode: KeyMode,
    /// Report the prospective operations without touching the store
    pub dry_run: bool,
    /// Run the persistence command after a pass that changed something
    pub persist: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            codec: CodecOptions::default(),
            mode: KeyMode::Ordinal,
            dry_run: false,
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    options: ReconcileOptions,
}

/// Mutable bookkeeping of one pass
struct Pass<'a> {
    options: &'a ReconcileOptions,
    desired: &'a DesiredSet,
    names: HashSet<&'a str>,
    reader: LiveStateReader,
    bound: usize,
    excluded: Excluded,
    deferred: Vec<Operation>,
    /// Successful operations in execution order
    journal: Vec<Operation>,
    report: ReconcileReport,
}

impl Reconciler {
    pub fn new(options: ReconcileOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    /// Runs one pass of `desired` against `store`.
    ///
    /// Returns `Err` only when the pass aborts before any mutation: every
    /// declaration was rejected, or the live rules cannot be read. Failures
    /// after that point are collected in the report.
    pub async fn reconcile<S: RuleStore>(
        &self,
        desired: &DesiredSet,
        store: &mut S,
    ) -> Result<ReconcileReport> {
        if desired.declared > 0 && desired.rule_count() == 0 && !desired.rejected.is_empty() {
            error!("All {} declarations were rejected; not touching the live rules", desired.declared);
            return Err(Error::NoValidDeclarations(desired.declared));
        }

        let reader = LiveStateReader::new(self.options.codec, self.options.mode);
        let live = reader.read(store).await?;

        let mut pass = Pass {
            options: &self.options,
            desired,
            names: desired
                .tables
                .values()
                .flatten()
                .filter_map(|rule| rule.record.name.as_deref())
                .collect(),
            reader,
            bound: live.managed_count(),
            excluded: Excluded::new(),
            deferred: Vec::new(),
            journal: Vec::new(),
            report: ReconcileReport::new(self.options.dry_run),
        };
        pass.report.rejected.clone_from(&desired.rejected);
        pass.report.unmanaged.clone_from(&live.unmanaged);
        info!(
            pass = %pass.report.pass_id,
            desired = desired.rule_count(),
            live = pass.bound,
            dry_run = self.options.dry_run,
            "starting reconciliation"
        );

        if self.options.dry_run {
            let mut simulated = MemoryStore::from_dump(&live.raw, self.options.codec);
            pass.run(&mut simulated, live).await;
            let mut report = pass.report;
            report.pending = pass.journal;
            report.deleted.clear();
            report.inserted.clear();
            for op in &report.pending {
                info!("would {op}");
            }
            return Ok(report);
        }

        pass.run(store, live).await;
        let mut report = pass.report;

        if self.options.persist && report.changes() > 0 {
            report.persist = match store.persist().await {
                Ok(PersistOutcome::Saved { command }) => {
                    info!("Rules persisted with '{command}'");
                    PersistStatus::Saved { command }
                }
                Ok(PersistOutcome::Unavailable { reason }) => {
                    warn!("Rules will not survive a reboot: {reason}");
                    PersistStatus::Unavailable { reason }
                }
                Err(e) => {
                    warn!("Persisting rules failed: {e}");
                    PersistStatus::Failed {
                        message: e.to_string(),
                    }
                }
            };
        }

        info!(
            pass = %report.pass_id,
            deleted = report.deleted.len(),
            inserted = report.inserted.len(),
            failures = report.failures.len(),
            state = %report.state(),
            "reconciliation finished"
        );
        Ok(report)
    }
}

impl Pass<'_> {
    async fn run<S: RuleStore>(&mut self, store: &mut S, live: LiveState) {
        let Some(live) = self.delete_loop(store, live, DeleteScope::Stale).await else {
            return;
        };

        let inserts = plan_inserts(&live, self.desired, self.options.mode, &self.options.codec);
        let live = if inserts.is_empty() {
            debug!("live rules already contain every desired rule");
            live
        } else {
            self.apply(store, inserts).await;
            let Some(live) = self.reread(store).await else {
                return;
            };
            live
        };

        let Some(live) = self.delete_loop(store, live, DeleteScope::All).await else {
            return;
        };
        if !self.deferred.is_empty() {
            self.retry_deferred(store).await;
        }
        self.report.missing = missing_rules(&live, self.desired);
        for text in &self.report.missing {
            warn!("Desired rule still missing after apply: {text}");
        }
    }

    async fn reread<S: RuleStore>(&mut self, store: &mut S) -> Option<LiveState> {
        match self.reader.read(store).await {
            Ok(live) => Some(live),
            Err(e) => {
                error!("Re-reading live rules failed mid-pass: {e}");
                self.report.aborted = Some(e.to_string());
                None
            }
        }
    }

    /// Deletes unmarked rules until a fixed point or the bound.
    async fn delete_loop<S: RuleStore>(
        &mut self,
        store: &mut S,
        mut live: LiveState,
        scope: DeleteScope,
    ) -> Option<LiveState> {
        let mut rounds = 0;
        loop {
            let deletes = plan_deletes(
                &live,
                self.desired,
                &self.names,
                self.options.mode,
                scope,
                &self.excluded,
                &self.options.codec,
            );
            if deletes.is_empty() {
                return Some(live);
            }
            if rounds >= self.bound {
                warn!(
                    "Delete loop stopped after {rounds} rounds with {} rules left; the rule store is not converging",
                    deletes.len()
                );
                self.report.loop_bounded = true;
                return Some(live);
            }
            rounds += 1;

            for op in deletes {
                match store.delete_at(op.table, op.chain, op.ordinal).await {
                    Ok(()) => {
                        info!("Deleted {op}");
                        self.journal.push(op.clone());
                        self.report.deleted.push(op);
                    }
                    Err(e) => {
                        warn!("Delete of {op} failed, retrying after apply: {e}");
                        *self
                            .excluded
                            .entry((op.table, op.chain, op.text.clone()))
                            .or_default() += 1;
                        self.deferred.push(op);
                    }
                }
            }
            live = self.reread(store).await?;
        }
    }

    async fn apply<S: RuleStore>(&mut self, store: &mut S, inserts: Vec<Operation>) {
        let mut failed_in_chain: HashMap<(Table, Chain), usize> = HashMap::new();
        for mut op in inserts {
            let shift = failed_in_chain
                .get(&(op.table, op.chain))
                .copied()
                .unwrap_or_default();
            op.ordinal -= shift;
            match store.insert(op.table, op.chain, op.ordinal, &op.args).await {
                Ok(()) => {
                    info!("Inserted {op}");
                    self.journal.push(op.clone());
                    self.report.inserted.push(op);
                }
                Err(e) => {
                    error!("Insert of {op} failed: {e}");
                    *failed_in_chain.entry((op.table, op.chain)).or_default() += 1;
                    self.fail(op, e);
                }
            }
        }
    }

    async fn retry_deferred<S: RuleStore>(&mut self, store: &mut S) {
        for op in std::mem::take(&mut self.deferred) {
            match store.delete_matching(op.table, op.chain, &op.args).await {
                Ok(()) => {
                    info!("Deleted {op} by rule match");
                    self.journal.push(op.clone());
                    self.report.deleted.push(op);
                }
                Err(e) => {
                    error!("Delete of {op} failed again: {e}");
                    self.fail(op, e);
                }
            }
        }
    }

    fn fail(&mut self, operation: Operation, err: Error) {
        let (message, exit_code) = match err {
            Error::ApplyOperationFailed {
                message, exit_code, ..
            } => (message, exit_code),
            other => (other.to_string(), None),
        };
        self.report.failures.push(OperationFailure {
            operation,
            message,
            exit_code,
        });
    }
}
