//! Desired state: declarations in, sorted canonical rules out
//!
//! A [`Declaration`] is the loosely-typed record a front-end hands over
//! (usually JSON). [`DesiredStateBuilder`] validates each one, expands
//! multi-valued sources into one [`RuleRecord`] per address, and finally
//! sorts every table by `(chain_prio, name, source)` so the same
//! declarations always produce the same rule sequence.
//!
//! The builder is an explicit accumulator scoped to one pass: push the
//! declarations, then call [`DesiredStateBuilder::finish`].

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::core::address;
use crate::core::codec::{self, CodecOptions};
use crate::core::error::{Error, Result};
use crate::core::rule::{
    Chain, Jump, PortEntry, Protocol, RuleRecord, Table, parse_port_list,
};
use crate::core::rule_constraints;
use crate::validators;

// ═══════════════════════════════════════════════════════════════════════════
// Declaration input
// ═══════════════════════════════════════════════════════════════════════════

/// A JSON scalar that may be written as a number or a string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(u64),
    Text(String),
}

impl Scalar {
    pub fn as_text(&self) -> String {
        match self {
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s.trim().to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

/// One declared rule, as written by the user.
///
/// Enumerated fields stay strings here so a typo rejects one declaration
/// with a named constraint instead of failing the whole file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Declaration {
    pub name: String,
    pub table: Option<String>,
    pub chain: Option<String>,
    pub proto: Option<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub source: Vec<String>,
    pub destination: Option<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub sport: Vec<Scalar>,
    #[serde(deserialize_with = "one_or_many")]
    pub dport: Vec<Scalar>,
    pub iniface: Option<String>,
    pub outiface: Option<String>,
    pub jump: Option<String>,
    pub todest: Option<String>,
    pub tosource: Option<String>,
    pub toports: Option<String>,
    pub reject: Option<String>,
    pub log_level: Option<Scalar>,
    pub log_prefix: Option<String>,
    pub icmp: Option<Scalar>,
    #[serde(deserialize_with = "one_or_many")]
    pub state: Vec<String>,
    pub limit: Option<String>,
    pub burst: Option<Scalar>,
    pub redirect: Option<Scalar>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DeclarationFile {
    List(Vec<Declaration>),
    Wrapped { rules: Vec<Declaration> },
}

/// Parses declarations from JSON: an array, or an object with a `rules` array.
pub fn parse_declarations(json: &str) -> Result<Vec<Declaration>> {
    Ok(match serde_json::from_str::<DeclarationFile>(json)? {
        DeclarationFile::List(rules) | DeclarationFile::Wrapped { rules } => rules,
    })
}

/// Reads a declaration file.
pub async fn load_declarations(path: &Path) -> Result<Vec<Declaration>> {
    let json = tokio::fs::read_to_string(path).await?;
    parse_declarations(&json)
}

/// Empty and whitespace-only strings count as unset.
fn set(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

fn set_scalar(value: Option<&Scalar>) -> Option<String> {
    value.map(Scalar::as_text).filter(|v| !v.is_empty())
}

// ═══════════════════════════════════════════════════════════════════════════
// Name resolution
// ═══════════════════════════════════════════════════════════════════════════

/// Turns hostnames in source/destination into addresses.
pub trait Resolver {
    fn resolve(&self, host: &str) -> Result<IpAddr>;
}

/// Resolver backed by the system's getaddrinfo, preferring IPv4 answers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str) -> Result<IpAddr> {
        let addrs: Vec<IpAddr> = (host, 0)
            .to_socket_addrs()
            .map_err(|e| Error::InvalidAddress(format!("{host}: {e}")))?
            .map(|sa| sa.ip())
            .collect();
        addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| Error::InvalidAddress(format!("{host}: no addresses")))
    }
}

/// True when `value` needs a lookup before canonicalization.
fn is_hostname(value: &str) -> bool {
    let host = value.split_once('/').map_or(value, |(h, _)| h);
    host.parse::<IpAddr>().is_err()
        && !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
        && host.chars().any(|c| c.is_ascii_alphabetic())
}

// ═══════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════

/// A declaration that did not make it into the desired set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub rule: String,
    pub constraint: String,
    pub message: String,
}

/// One desired rule with its canonical text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRule {
    pub record: RuleRecord,
    pub text: String,
}

/// The complete, sorted desired state for one pass
#[derive(Debug, Clone, Default)]
pub struct DesiredSet {
    pub tables: BTreeMap<Table, Vec<DesiredRule>>,
    pub rejected: Vec<Rejection>,
    /// Number of declarations pushed, accepted or not
    pub declared: usize,
}

impl DesiredSet {
    pub fn rule_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// Rules of one chain, in desired order.
    pub fn chain(&self, table: Table, chain: Chain) -> impl Iterator<Item = &DesiredRule> {
        self.tables
            .get(&table)
            .into_iter()
            .flatten()
            .filter(move |rule| rule.record.chain == chain)
    }

    /// Every `(table, chain)` pair with at least one desired rule.
    pub fn chains(&self) -> Vec<(Table, Chain)> {
        let mut chains: Vec<(Table, Chain)> = self
            .tables
            .iter()
            .flat_map(|(table, rules)| rules.iter().map(move |r| (*table, r.record.chain)))
            .collect();
        chains.dedup();
        chains
    }

    /// Canonical rule text, one line per rule, in table then desired order.
    pub fn canonical_lines(&self) -> Vec<String> {
        self.tables
            .values()
            .flatten()
            .map(|rule| rule.text.clone())
            .collect()
    }
}

/// Accumulates declarations into a [`DesiredSet`].
pub struct DesiredStateBuilder<R: Resolver = SystemResolver> {
    options: CodecOptions,
    resolver: R,
    names: HashSet<String>,
    tables: BTreeMap<Table, Vec<RuleRecord>>,
    rejected: Vec<Rejection>,
    declared: usize,
}

impl DesiredStateBuilder<SystemResolver> {
    pub fn new(options: CodecOptions) -> Self {
        Self::with_resolver(options, SystemResolver)
    }
}

impl<R: Resolver> DesiredStateBuilder<R> {
    pub fn with_resolver(options: CodecOptions, resolver: R) -> Self {
        Self {
            options,
            resolver,
            names: HashSet::new(),
            tables: BTreeMap::new(),
            rejected: Vec::new(),
            declared: 0,
        }
    }

    /// Adds one declaration.
    ///
    /// Returns the number of rules it expanded to. A rejected declaration is
    /// recorded in the final set and its error is also returned.
    pub fn push(&mut self, declaration: &Declaration) -> Result<usize> {
        self.declared += 1;
        match self.expand(declaration) {
            Ok(records) => {
                self.names.insert(declaration.name.trim().to_string());
                let count = records.len();
                for record in records {
                    self.tables.entry(record.table).or_default().push(record);
                }
                debug!(rule = %declaration.name, count, "declaration accepted");
                Ok(count)
            }
            Err(err) => {
                let rejection = Rejection {
                    rule: declaration.name.clone(),
                    constraint: err.constraint().unwrap_or("declaration").to_string(),
                    message: err.to_string(),
                };
                warn!(rule = %rejection.rule, constraint = %rejection.constraint, "{}", rejection.message);
                self.rejected.push(rejection);
                Err(err)
            }
        }
    }

    /// Sorts and renders the accumulated rules.
    pub fn finish(self) -> DesiredSet {
        let options = self.options;
        let tables = self
            .tables
            .into_iter()
            .map(|(table, mut records)| {
                records.sort_by(|a, b| {
                    (a.chain_prio(), &a.name, &a.source).cmp(&(b.chain_prio(), &b.name, &b.source))
                });
                let rules = records
                    .into_iter()
                    .map(|record| DesiredRule {
                        text: codec::render(&record, &options),
                        record,
                    })
                    .collect();
                (table, rules)
            })
            .collect();

        DesiredSet {
            tables,
            rejected: self.rejected,
            declared: self.declared,
        }
    }

    /// Converts one declaration into its records, or the first violation.
    fn expand(&self, decl: &Declaration) -> Result<Vec<RuleRecord>> {
        let name = decl.name.trim().to_string();
        let invalid = |constraint: &str, message: String| Error::validation(&name, constraint, message);

        validators::validate_name(&name).map_err(|m| invalid("name", m))?;
        if self.names.contains(&name) {
            return Err(invalid("name", format!("Duplicate rule name '{name}'")));
        }

        let table = match set(decl.table.as_ref()) {
            Some(t) => t
                .parse::<Table>()
                .map_err(|_| invalid("table", format!("Unknown table '{t}'")))?,
            None => Table::Filter,
        };
        let chain = match set(decl.chain.as_ref()) {
            Some(c) => c
                .parse::<Chain>()
                .map_err(|_| invalid("chain", format!("Unknown chain '{c}'")))?,
            None => Chain::Input,
        };
        let protocol = match set(decl.proto.as_ref()) {
            Some(p) => Protocol::parse_alias(&p)
                .ok_or_else(|| invalid("proto", format!("Unknown protocol '{p}'")))?,
            None => Protocol::Tcp,
        };
        let jump = match set(decl.jump.as_ref()) {
            Some(j) => j
                .to_ascii_uppercase()
                .parse::<Jump>()
                .map_err(|_| invalid("jump", format!("Unknown jump target '{j}'")))?,
            None => Jump::Accept,
        };

        let mut record = RuleRecord {
            name: Some(name.clone()),
            protocol,
            jump,
            ..RuleRecord::new(table, chain)
        };

        record.destination = match set(decl.destination.as_ref()) {
            Some(dest) => self.canonical_address(&dest)?,
            None => None,
        };
        record.source_port = ports(&decl.sport).map_err(|m| invalid("sport", m))?;
        record.dest_port = ports(&decl.dport).map_err(|m| invalid("dport", m))?;

        if let Some(iface) = set(decl.iniface.as_ref()) {
            record.in_interface =
                Some(validators::validate_interface(&iface).map_err(|m| invalid("iniface", m))?);
        }
        if let Some(iface) = set(decl.outiface.as_ref()) {
            record.out_interface =
                Some(validators::validate_interface(&iface).map_err(|m| invalid("outiface", m))?);
        }

        if let Some(dest) = set(decl.todest.as_ref()) {
            record.to_destination =
                Some(validators::validate_nat_address(&dest).map_err(|m| invalid("todest", m))?);
        }
        if let Some(src) = set(decl.tosource.as_ref()) {
            record.to_source =
                Some(validators::validate_nat_address(&src).map_err(|m| invalid("tosource", m))?);
        }
        // `redirect` is the older spelling of `toports`
        let to_ports = set(decl.toports.as_ref()).or_else(|| set_scalar(decl.redirect.as_ref()));
        if let Some(ports) = to_ports {
            record.to_ports =
                Some(validators::validate_to_ports(&ports).map_err(|m| invalid("toports", m))?);
        }
        record.reject_with = set(decl.reject.as_ref());
        if let Some(level) = set_scalar(decl.log_level.as_ref()) {
            record.log_level =
                Some(validators::normalize_log_level(&level).map_err(|m| invalid("log_level", m))?);
        }
        if let Some(prefix) = decl.log_prefix.as_ref().filter(|p| !p.is_empty()) {
            record.log_prefix =
                Some(validators::validate_log_prefix(prefix).map_err(|m| invalid("log_prefix", m))?);
        }

        if let Some(icmp) = set_scalar(decl.icmp.as_ref()) {
            record.icmp_type = codec::icmp_type_number(&icmp)?;
        }

        let states: Vec<String> = decl
            .state
            .iter()
            .flat_map(|s| s.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        record.conn_state = codec::parse_states(&states.join(",")).map_err(|m| invalid("state", m))?;

        if let Some(limit) = set(decl.limit.as_ref()) {
            record.rate_limit =
                Some(validators::normalize_limit(&limit).map_err(|m| invalid("limit", m))?);
        }
        if let Some(burst) = set_scalar(decl.burst.as_ref()) {
            record.rate_limit_burst =
                Some(validators::validate_burst(&burst).map_err(|m| invalid("burst", m))?);
        }

        record.normalize();
        rule_constraints::check(&record).map_err(|v| invalid(v.constraint, v.message))?;

        // One record per distinct source; none at all means "any source"
        let mut sources: Vec<Option<String>> = Vec::new();
        for raw in decl.source.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let canonical = self.canonical_address(raw)?;
            if !sources.contains(&canonical) {
                sources.push(canonical);
            }
        }
        if sources.is_empty() {
            sources.push(None);
        }

        let records = sources
            .into_iter()
            .map(|source| {
                let mut expanded = record.clone();
                expanded.source = source;
                expanded
            })
            .collect::<Vec<_>>();
        for expanded in &records {
            rule_constraints::check(expanded).map_err(|v| invalid(v.constraint, v.message))?;
        }
        Ok(records)
    }

    fn canonical_address(&self, raw: &str) -> Result<Option<String>> {
        if is_hostname(raw) {
            let (host, mask) = match raw.split_once('/') {
                Some((h, m)) => (h, Some(m)),
                None => (raw, None),
            };
            let ip = self.resolver.resolve(host)?;
            debug!(host, %ip, "resolved hostname");
            let literal = match mask {
                Some(mask) => format!("{ip}/{mask}"),
                None => ip.to_string(),
            };
            return address::canonicalize(&literal, self.options.address_format);
        }
        address::canonicalize(raw, self.options.address_format)
    }
}

fn ports(values: &[Scalar]) -> std::result::Result<Vec<PortEntry>, String> {
    let mut entries = Vec::new();
    for value in values {
        entries.extend(parse_port_list(&value.as_text())?);
    }
    Ok(entries)
}

/// Builds the desired set in one go.
pub fn build<R: Resolver>(
    declarations: &[Declaration],
    options: CodecOptions,
    resolver: R,
) -> DesiredSet {
    let mut builder = DesiredStateBuilder::with_resolver(options, resolver);
    for declaration in declarations {
        // Rejections are kept in the builder
        let _ = builder.push(declaration);
    }
    builder.finish()
}
