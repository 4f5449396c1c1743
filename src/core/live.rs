//! Live rule set model
//!
//! Turns an `iptables-save` dump into per-table, per-chain rule lists.
//! Every rule line keeps its position in its chain; lines iptsync does not
//! manage are kept as placeholders so positions stay exact.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace, warn};

use crate::core::codec::{self, CodecOptions, ParsedLine};
use crate::core::error::{Error, Result};
use crate::core::rule::{Chain, RuleRecord, Table};
use crate::core::store::RuleStore;

/// How live rules are keyed in [`LiveState::tables`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyMode {
    /// Canonical rule text
    Text,
    /// Position-prefixed canonical text, `"<ordinal> <text>"`
    #[default]
    Ordinal,
}

impl KeyMode {
    pub fn key(self, ordinal: usize, text: &str) -> String {
        match self {
            KeyMode::Text => text.to_string(),
            KeyMode::Ordinal => format!("{ordinal} {text}"),
        }
    }
}

/// A managed live rule with its canonical re-rendered text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRule {
    pub record: RuleRecord,
    pub text: String,
}

impl LiveRule {
    pub fn ordinal(&self) -> usize {
        self.record.rule_ordinal.unwrap_or_default()
    }
}

/// A rule line outside the managed vocabulary; never touched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmanagedLine {
    pub table: String,
    pub chain: String,
    pub ordinal: usize,
    pub line: String,
    pub reason: String,
}

/// One position in a built-in chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainSlot {
    Managed(LiveRule),
    Unmanaged(UnmanagedLine),
}

impl ChainSlot {
    pub fn ordinal(&self) -> usize {
        match self {
            ChainSlot::Managed(rule) => rule.ordinal(),
            ChainSlot::Unmanaged(line) => line.ordinal,
        }
    }

    pub fn as_managed(&self) -> Option<&LiveRule> {
        match self {
            ChainSlot::Managed(rule) => Some(rule),
            ChainSlot::Unmanaged(_) => None,
        }
    }
}

/// Parsed live state
#[derive(Debug, Clone, Default)]
pub struct LiveState {
    /// Managed rules per table, keyed per [`KeyMode`]
    pub tables: BTreeMap<Table, BTreeMap<String, RuleRecord>>,
    /// Every rule line of the built-in chains, in chain order
    pub chains: BTreeMap<(Table, Chain), Vec<ChainSlot>>,
    pub unmanaged: Vec<UnmanagedLine>,
    /// The dump this state was parsed from
    pub raw: String,
}

impl LiveState {
    /// Parses a full dump. Never fails: unreadable rule lines become
    /// unmanaged lines.
    pub fn parse(text: &str, mode: KeyMode, options: &CodecOptions) -> Self {
        let mut state = LiveState {
            raw: text.to_string(),
            ..Self::default()
        };
        let mut section: Option<String> = None;
        let mut counters: HashMap<String, usize> = HashMap::new();

        for raw_line in text.lines() {
            let line = raw_line.trim();

            if let Some(name) = line.strip_prefix('*') {
                trace!("table section {name}");
                section = Some(name.trim().to_string());
                counters.clear();
                continue;
            }
            if !line.starts_with("-A ") && !(line.starts_with('[') && line.contains("] -A ")) {
                continue;
            }

            let section_name = section.clone().unwrap_or_else(|| "filter".to_string());
            let parsed = codec::parse_line(line, Some(&section_name), options);

            let chain_name = match &parsed {
                Ok(ParsedLine::Rule(record)) => record.chain.as_str().to_string(),
                Ok(ParsedLine::Unmanaged { chain, .. }) => chain.clone(),
                Err(_) => chain_of(line).unwrap_or_default(),
            };
            let counter = counters.entry(chain_name.clone()).or_insert(0);
            *counter += 1;
            let ordinal = *counter;

            let unmanaged = |reason: String| UnmanagedLine {
                table: section_name.clone(),
                chain: chain_name.clone(),
                ordinal,
                line: line.to_string(),
                reason,
            };

            match parsed {
                Ok(ParsedLine::Rule(mut record)) => {
                    record.rule_ordinal = Some(ordinal);
                    let text = codec::render(&record, options);
                    let key = mode.key(ordinal, &text);
                    state
                        .tables
                        .entry(record.table)
                        .or_default()
                        .insert(key, record.clone());
                    state
                        .chains
                        .entry((record.table, record.chain))
                        .or_default()
                        .push(ChainSlot::Managed(LiveRule { record, text }));
                }
                Ok(ParsedLine::Unmanaged { reason, .. }) => {
                    debug!("Leaving {section_name}/{chain_name}#{ordinal} alone: {reason}");
                    state.push_unmanaged(unmanaged(reason));
                }
                Err(err) => {
                    warn!("Treating unparseable line as unmanaged: {err}");
                    state.push_unmanaged(unmanaged(err.to_string()));
                }
            }
        }
        state
    }

    fn push_unmanaged(&mut self, line: UnmanagedLine) {
        if let (Ok(table), Ok(chain)) = (line.table.parse::<Table>(), line.chain.parse::<Chain>()) {
            self.chains
                .entry((table, chain))
                .or_default()
                .push(ChainSlot::Unmanaged(line.clone()));
        }
        self.unmanaged.push(line);
    }

    /// Number of managed rules across all chains.
    pub fn managed_count(&self) -> usize {
        self.chains
            .values()
            .flatten()
            .filter(|slot| slot.as_managed().is_some())
            .count()
    }

    /// Slots of one chain, empty when the chain has no rules.
    pub fn chain(&self, table: Table, chain: Chain) -> &[ChainSlot] {
        self.chains
            .get(&(table, chain))
            .map_or(&[], Vec::as_slice)
    }

    /// Managed rules of one chain, in chain order.
    pub fn managed(&self, table: Table, chain: Chain) -> impl Iterator<Item = &LiveRule> {
        self.chain(table, chain).iter().filter_map(ChainSlot::as_managed)
    }

    /// Canonical text of every managed rule, in table then chain order.
    pub fn canonical_lines(&self) -> Vec<String> {
        self.chains
            .values()
            .flatten()
            .filter_map(ChainSlot::as_managed)
            .map(|rule| rule.text.clone())
            .collect()
    }
}

fn chain_of(line: &str) -> Option<String> {
    let mut words = line.split_whitespace().skip_while(|w| *w != "-A");
    words.next();
    words.next().map(str::to_string)
}

/// Reads the live state through a [`RuleStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveStateReader {
    pub options: CodecOptions,
    pub mode: KeyMode,
}

impl LiveStateReader {
    pub fn new(options: CodecOptions, mode: KeyMode) -> Self {
        Self { options, mode }
    }

    /// Dumps and parses the live rules.
    ///
    /// Any failure to obtain the dump is [`Error::DumpUnavailable`]. An
    /// empty dump is an empty state.
    pub async fn read<S: RuleStore>(&self, store: &mut S) -> Result<LiveState> {
        let text = store.dump().await.map_err(|e| match e {
            Error::DumpUnavailable(_) => e,
            other => Error::DumpUnavailable(other.to_string()),
        })?;
        let state = LiveState::parse(&text, self.mode, &self.options);
        debug!(
            managed = state.managed_count(),
            unmanaged = state.unmanaged.len(),
            "live state read"
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::MockStore;

    const DUMP: &str = "\
# Generated by iptables-save v1.8.10 on Sat Oct 18 10:00:00 2026
*nat
:PREROUTING ACCEPT [0:0]
:POSTROUTING ACCEPT [0:0]
-A POSTROUTING -o eth0 -m comment --comment \"masq\" -j MASQUERADE
COMMIT
*filter
:INPUT DROP [0:0]
:FORWARD DROP [0:0]
:OUTPUT ACCEPT [0:0]
:DOCKER - [0:0]
-A INPUT -p tcp -m tcp --dport 22 -m comment --comment \"ssh\" -j ACCEPT
-A INPUT -j DOCKER
-A INPUT -p tcp -m tcp --dport 80 -m comment --comment \"web\" -j ACCEPT
-A DOCKER -p tcp -j RETURN
-A OUTPUT -p udp -m udp --dport 53 -m comment --comment \"dns\" -j ACCEPT
COMMIT
";

    #[test]
    fn test_parse_tables_and_positions() {
        let state = LiveState::parse(DUMP, KeyMode::Text, &CodecOptions::default());

        let input: Vec<usize> = state
            .chain(Table::Filter, Chain::Input)
            .iter()
            .map(ChainSlot::ordinal)
            .collect();
        assert_eq!(input, vec![1, 2, 3]);
        assert!(matches!(
            state.chain(Table::Filter, Chain::Input)[1],
            ChainSlot::Unmanaged(_)
        ));
        assert_eq!(state.managed(Table::Filter, Chain::Output).count(), 1);
        assert_eq!(state.managed(Table::Nat, Chain::Postrouting).count(), 1);
        assert_eq!(state.managed_count(), 4);
        assert_eq!(state.unmanaged.len(), 2);
        assert!(state.unmanaged.iter().any(|u| u.chain == "DOCKER"));
    }

    #[test]
    fn test_text_and_ordinal_keys() {
        let text = LiveState::parse(DUMP, KeyMode::Text, &CodecOptions::default());
        let web = "-A INPUT -t filter -p tcp --dport 80 -m comment --comment \"web\" -j ACCEPT";
        assert!(text.tables[&Table::Filter].contains_key(web));

        let numbered = LiveState::parse(DUMP, KeyMode::Ordinal, &CodecOptions::default());
        let record = &numbered.tables[&Table::Filter][&format!("3 {web}")];
        assert_eq!(record.rule_ordinal, Some(3));
        assert_eq!(record.name.as_deref(), Some("web"));
    }

    #[test]
    fn test_table_marker_resets_positions() {
        let dump = "*mangle\n-A OUTPUT -j ACCEPT\n-A OUTPUT -j DROP\n*filter\n-A OUTPUT -j DROP\n";
        let state = LiveState::parse(dump, KeyMode::Ordinal, &CodecOptions::default());
        assert_eq!(state.chain(Table::Mangle, Chain::Output)[1].ordinal(), 2);
        assert_eq!(state.chain(Table::Filter, Chain::Output)[0].ordinal(), 1);
    }

    #[test]
    fn test_missing_table_marker_defaults_to_filter() {
        let state = LiveState::parse("-A INPUT -j ACCEPT\n", KeyMode::Text, &CodecOptions::default());
        assert_eq!(state.managed(Table::Filter, Chain::Input).count(), 1);
    }

    #[test]
    fn test_empty_dump_is_empty_state() {
        let state = LiveState::parse("", KeyMode::Ordinal, &CodecOptions::default());
        assert!(state.tables.is_empty());
        assert_eq!(state.managed_count(), 0);

        let state = LiveState::parse("*filter\n:INPUT ACCEPT [0:0]\nCOMMIT\n", KeyMode::Text, &CodecOptions::default());
        assert!(state.chains.is_empty());
    }

    #[test]
    fn test_unparseable_line_is_unmanaged() {
        let dump = "*filter\n-A INPUT -m comment --comment \"broken -j ACCEPT\n-A INPUT -j DROP\n";
        let state = LiveState::parse(dump, KeyMode::Text, &CodecOptions::default());
        assert_eq!(state.unmanaged.len(), 1);
        assert_eq!(state.managed(Table::Filter, Chain::Input).next().unwrap().ordinal(), 2);
    }

    #[test]
    fn test_unknown_table_is_unmanaged() {
        let dump = "*security\n-A INPUT -j ACCEPT\n";
        let state = LiveState::parse(dump, KeyMode::Text, &CodecOptions::default());
        assert_eq!(state.managed_count(), 0);
        assert_eq!(state.unmanaged[0].table, "security");
    }

    #[tokio::test]
    async fn test_reader_maps_dump_failure() {
        let mut store = MockStore::default();
        store.fail_dump = true;
        let err = LiveStateReader::default().read(&mut store).await.unwrap_err();
        assert!(matches!(err, Error::DumpUnavailable(_)));
    }

    #[tokio::test]
    async fn test_reader_reads_store() {
        let mut store = MockStore::from_dump(DUMP);
        let state = LiveStateReader::new(CodecOptions::default(), KeyMode::Ordinal)
            .read(&mut store)
            .await
            .unwrap();
        assert_eq!(state.managed_count(), 4);
    }
}
