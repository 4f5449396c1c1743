//! Structured representation of one iptables rule
//!
//! A [`RuleRecord`] is independent of how the rule is written down. The
//! [`codec`](super::codec) module maps it to and from iptables-save text, and
//! the reconciler compares records only through that canonical text.
//!
//! Every settable attribute is named by [`RuleField`], a closed enum that
//! also fixes the order switches are rendered in.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoEnumIterator};

/// Maximum entries in a port list (`-m multiport` limit)
pub const MAX_MULTIPORT_ENTRIES: usize = 15;

/// iptables table
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    #[default]
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "nat")]
    Nat,
    #[strum(serialize = "mangle")]
    Mangle,
    #[strum(serialize = "raw")]
    Raw,
}

impl Table {
    pub const fn as_str(self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Mangle => "mangle",
            Table::Raw => "raw",
        }
    }
}

/// Built-in chain.
///
/// Variants are declared in packet-traversal order, which is also the
/// sort order used for desired rules.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Chain {
    #[strum(serialize = "PREROUTING")]
    Prerouting,
    #[default]
    #[strum(serialize = "INPUT")]
    Input,
    #[strum(serialize = "FORWARD")]
    Forward,
    #[strum(serialize = "OUTPUT")]
    Output,
    #[strum(serialize = "POSTROUTING")]
    Postrouting,
}

impl Chain {
    pub const fn as_str(self) -> &'static str {
        match self {
            Chain::Prerouting => "PREROUTING",
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
            Chain::Output => "OUTPUT",
            Chain::Postrouting => "POSTROUTING",
        }
    }

    /// Sort key for desired rules: PREROUTING=1 .. POSTROUTING=5
    pub const fn prio(self) -> u8 {
        match self {
            Chain::Prerouting => 1,
            Chain::Input => 2,
            Chain::Forward => 3,
            Chain::Output => 4,
            Chain::Postrouting => 5,
        }
    }

    /// Chains where `-i` is meaningful
    pub const fn accepts_in_interface(self) -> bool {
        matches!(self, Chain::Input | Chain::Forward | Chain::Prerouting)
    }

    /// Chains where `-o` is meaningful
    pub const fn accepts_out_interface(self) -> bool {
        matches!(self, Chain::Output | Chain::Forward | Chain::Postrouting)
    }
}

/// Layer 4 protocol matched with `-p`
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "sctp")]
    Sctp,
    #[strum(serialize = "icmp")]
    Icmp,
    #[strum(serialize = "esp")]
    Esp,
    #[strum(serialize = "ah")]
    Ah,
    #[strum(serialize = "vrrp")]
    Vrrp,
    #[strum(serialize = "igmp")]
    Igmp,
    /// No `-p` switch at all
    #[default]
    #[strum(serialize = "all")]
    All,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
            Protocol::Icmp => "icmp",
            Protocol::Esp => "esp",
            Protocol::Ah => "ah",
            Protocol::Vrrp => "vrrp",
            Protocol::Igmp => "igmp",
            Protocol::All => "all",
        }
    }

    /// Parses a protocol name, its IANA number, or a known alias.
    ///
    /// Some libc builds name protocol 112 `carp` instead of `vrrp`.
    pub fn parse_alias(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "carp" | "112" => Some(Protocol::Vrrp),
            "0" => Some(Protocol::All),
            "1" => Some(Protocol::Icmp),
            "2" => Some(Protocol::Igmp),
            "6" => Some(Protocol::Tcp),
            "17" => Some(Protocol::Udp),
            "50" => Some(Protocol::Esp),
            "51" => Some(Protocol::Ah),
            "132" => Some(Protocol::Sctp),
            other => other.parse().ok(),
        }
    }

    /// Protocols that carry port numbers
    pub const fn supports_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp | Protocol::Sctp)
    }
}

/// Jump target (`-j`)
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Jump {
    #[default]
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
    #[strum(serialize = "REJECT")]
    Reject,
    #[strum(serialize = "DNAT")]
    Dnat,
    #[strum(serialize = "SNAT")]
    Snat,
    #[strum(serialize = "LOG")]
    Log,
    #[strum(serialize = "MASQUERADE")]
    Masquerade,
    #[strum(serialize = "REDIRECT")]
    Redirect,
}

impl Jump {
    pub const fn as_str(self) -> &'static str {
        match self {
            Jump::Accept => "ACCEPT",
            Jump::Drop => "DROP",
            Jump::Reject => "REJECT",
            Jump::Dnat => "DNAT",
            Jump::Snat => "SNAT",
            Jump::Log => "LOG",
            Jump::Masquerade => "MASQUERADE",
            Jump::Redirect => "REDIRECT",
        }
    }

    /// Targets that only exist in the nat table
    pub const fn requires_nat(self) -> bool {
        matches!(self, Jump::Dnat | Jump::Snat | Jump::Masquerade)
    }
}

/// Connection tracking state.
///
/// Declaration order is the canonical render order, so a `BTreeSet`
/// of states always iterates INVALID, NEW, RELATED, ESTABLISHED.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(ascii_case_insensitive)]
pub enum ConnState {
    #[strum(serialize = "INVALID")]
    Invalid,
    #[strum(serialize = "NEW")]
    New,
    #[strum(serialize = "RELATED")]
    Related,
    #[strum(serialize = "ESTABLISHED")]
    Established,
}

/// One entry of a port list: `80` or `8000:8080`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortEntry {
    Single(u16),
    Range(u16, u16),
}

impl fmt::Display for PortEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortEntry::Single(port) => write!(f, "{port}"),
            PortEntry::Range(start, end) => write!(f, "{start}:{end}"),
        }
    }
}

impl FromStr for PortEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| format!("'{p}' is not a port number"))
        };
        match s.split_once(':') {
            Some((start, end)) => {
                let (start, end) = crate::validators::validate_port_range(
                    parse_port(start)?,
                    parse_port(end)?,
                )?;
                // iptables-save prints 80:80 as 80
                if start == end {
                    Ok(PortEntry::Single(start))
                } else {
                    Ok(PortEntry::Range(start, end))
                }
            }
            None => Ok(PortEntry::Single(crate::validators::validate_port(
                parse_port(s)?,
            )?)),
        }
    }
}

/// Parses a comma separated port list such as `22,80,8000:8080`.
pub fn parse_port_list(value: &str) -> Result<Vec<PortEntry>, String> {
    value
        .split(',')
        .filter(|p| !p.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Joins a port list back into its comma separated form.
pub fn format_port_list(ports: &[PortEntry]) -> String {
    ports
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Every attribute of a [`RuleRecord`], in render order.
///
/// This is the fixed switch order of canonical rule text: iterating the
/// enum yields table, protocol, addresses and ports, interfaces, match
/// modules, comment, jump and finally the target parameters.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum RuleField {
    Table,
    Protocol,
    IcmpType,
    Source,
    SourcePort,
    Destination,
    DestPort,
    InInterface,
    OutInterface,
    ConnState,
    RateLimit,
    RateLimitBurst,
    Name,
    Jump,
    ToDestination,
    ToSource,
    ToPorts,
    RejectWith,
    LogLevel,
    LogPrefix,
}

/// One firewall rule.
///
/// Unset optional attributes are `None` (or empty), never placeholder
/// strings, so two records with the same switches compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuleRecord {
    pub table: Table,
    pub chain: Chain,
    /// Comment tag; the identity of a declared rule
    pub name: Option<String>,
    pub protocol: Protocol,
    /// Canonical address in the configured format
    pub source: Option<String>,
    pub destination: Option<String>,
    pub source_port: Vec<PortEntry>,
    pub dest_port: Vec<PortEntry>,
    /// May carry a leading `!` for negation
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub jump: Jump,
    pub to_destination: Option<String>,
    pub to_source: Option<String>,
    pub to_ports: Option<String>,
    pub reject_with: Option<String>,
    /// Numeric syslog level
    pub log_level: Option<String>,
    pub log_prefix: Option<String>,
    pub icmp_type: Option<u8>,
    pub conn_state: BTreeSet<ConnState>,
    /// Canonical `N/unit`
    pub rate_limit: Option<String>,
    pub rate_limit_burst: Option<u32>,
    /// 1-based position inside its chain; only set on live records
    pub rule_ordinal: Option<usize>,
}

/// Kernel default for `--limit-burst`
pub const DEFAULT_LIMIT_BURST: u32 = 5;
/// Kernel default for `--log-level` (warning)
pub const DEFAULT_LOG_LEVEL: &str = "4";
/// Kernel default for `--reject-with`
pub const DEFAULT_REJECT_WITH: &str = "icmp-port-unreachable";

impl RuleRecord {
    pub fn new(table: Table, chain: Chain) -> Self {
        Self {
            table,
            chain,
            ..Self::default()
        }
    }

    pub fn chain_prio(&self) -> u8 {
        self.chain.prio()
    }

    /// Ports for REDIRECT rules, which share `--to-ports` with `to_ports`.
    pub fn redirect_ports(&self) -> Option<&str> {
        match self.jump {
            Jump::Redirect => self.to_ports.as_deref(),
            _ => None,
        }
    }

    /// Folds values the kernel fills in by default back to "unset".
    ///
    /// iptables-save prints some defaults and omits others, so declared and
    /// live records both pass through here before comparison.
    pub fn normalize(&mut self) {
        if self.jump == Jump::Reject && self.reject_with.is_none() {
            self.reject_with = Some(DEFAULT_REJECT_WITH.to_string());
        }
        if self.rate_limit_burst == Some(DEFAULT_LIMIT_BURST) {
            self.rate_limit_burst = None;
        }
        if self.log_level.as_deref() == Some(DEFAULT_LOG_LEVEL) {
            self.log_level = None;
        }
        if self.source.as_deref().is_some_and(str::is_empty) {
            self.source = None;
        }
        if self.destination.as_deref().is_some_and(str::is_empty) {
            self.destination = None;
        }
    }

    /// Text value of one field, or `None` when unset.
    pub fn field_text(&self, field: RuleField) -> Option<String> {
        match field {
            RuleField::Table => Some(self.table.to_string()),
            RuleField::Protocol => (self.protocol != Protocol::All).then(|| self.protocol.to_string()),
            RuleField::IcmpType => self.icmp_type.map(|t| t.to_string()),
            RuleField::Source => self.source.clone(),
            RuleField::SourcePort => {
                (!self.source_port.is_empty()).then(|| format_port_list(&self.source_port))
            }
            RuleField::Destination => self.destination.clone(),
            RuleField::DestPort => {
                (!self.dest_port.is_empty()).then(|| format_port_list(&self.dest_port))
            }
            RuleField::InInterface => self.in_interface.clone(),
            RuleField::OutInterface => self.out_interface.clone(),
            RuleField::ConnState => (!self.conn_state.is_empty()).then(|| {
                self.conn_state
                    .iter()
                    .map(ConnState::as_ref)
                    .collect::<Vec<_>>()
                    .join(",")
            }),
            RuleField::RateLimit => self.rate_limit.clone(),
            RuleField::RateLimitBurst => self.rate_limit_burst.map(|b| b.to_string()),
            RuleField::Name => self.name.clone(),
            RuleField::Jump => Some(self.jump.to_string()),
            RuleField::ToDestination => self.to_destination.clone(),
            RuleField::ToSource => self.to_source.clone(),
            RuleField::ToPorts => self.to_ports.clone(),
            RuleField::RejectWith => self.reject_with.clone(),
            RuleField::LogLevel => self.log_level.clone(),
            RuleField::LogPrefix => self.log_prefix.clone(),
        }
    }

    /// All set fields with their text values, in render order.
    pub fn fields(&self) -> impl Iterator<Item = (RuleField, String)> + '_ {
        RuleField::iter().filter_map(|field| self.field_text(field).map(|text| (field, text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_prio_order() {
        let prios: Vec<u8> = Chain::iter().map(Chain::prio).collect();
        assert_eq!(prios, vec![1, 2, 3, 4, 5]);
        assert!(Chain::Prerouting < Chain::Postrouting);
    }

    #[test]
    fn test_protocol_aliases() {
        assert_eq!(Protocol::parse_alias("carp"), Some(Protocol::Vrrp));
        assert_eq!(Protocol::parse_alias("6"), Some(Protocol::Tcp));
        assert_eq!(Protocol::parse_alias("TCP"), Some(Protocol::Tcp));
        assert_eq!(Protocol::parse_alias("132"), Some(Protocol::Sctp));
        assert_eq!(Protocol::parse_alias("gre"), None);
    }

    #[test]
    fn test_conn_state_set_is_canonically_ordered() {
        let states: BTreeSet<ConnState> = [
            ConnState::Established,
            ConnState::New,
            ConnState::Related,
            ConnState::Invalid,
        ]
        .into_iter()
        .collect();
        let mut rule = RuleRecord::default();
        rule.conn_state = states;
        assert_eq!(
            rule.field_text(RuleField::ConnState).unwrap(),
            "INVALID,NEW,RELATED,ESTABLISHED"
        );
    }

    #[test]
    fn test_port_entry_parse() {
        assert_eq!("80".parse::<PortEntry>().unwrap(), PortEntry::Single(80));
        assert_eq!(
            "8000:8080".parse::<PortEntry>().unwrap(),
            PortEntry::Range(8000, 8080)
        );
        assert_eq!("443:443".parse::<PortEntry>().unwrap(), PortEntry::Single(443));
        assert!("0".parse::<PortEntry>().is_err());
        assert!("9000:8000".parse::<PortEntry>().is_err());
        assert!("http".parse::<PortEntry>().is_err());
        assert!("70000".parse::<PortEntry>().is_err());
    }

    #[test]
    fn test_port_list_round_trip() {
        let ports = parse_port_list("22,80,8000:8080").unwrap();
        assert_eq!(ports.len(), 3);
        assert_eq!(format_port_list(&ports), "22,80,8000:8080");
    }

    #[test]
    fn test_normalize_folds_kernel_defaults() {
        let mut rule = RuleRecord {
            jump: Jump::Reject,
            rate_limit: Some("3/min".into()),
            rate_limit_burst: Some(5),
            log_level: Some("4".into()),
            ..RuleRecord::default()
        };
        rule.normalize();
        assert_eq!(rule.reject_with.as_deref(), Some(DEFAULT_REJECT_WITH));
        assert_eq!(rule.rate_limit_burst, None);
        assert_eq!(rule.log_level, None);
    }

    #[test]
    fn test_redirect_ports_mirror_to_ports() {
        let mut rule = RuleRecord::new(Table::Nat, Chain::Prerouting);
        rule.to_ports = Some("8080".into());
        assert_eq!(rule.redirect_ports(), None);
        rule.jump = Jump::Redirect;
        assert_eq!(rule.redirect_ports(), Some("8080"));
    }

    #[test]
    fn test_fields_follow_render_order() {
        let rule = RuleRecord {
            name: Some("web".into()),
            protocol: Protocol::Tcp,
            dest_port: vec![PortEntry::Single(80)],
            ..RuleRecord::default()
        };
        let names: Vec<RuleField> = rule.fields().map(|(f, _)| f).collect();
        assert_eq!(
            names,
            vec![
                RuleField::Table,
                RuleField::Protocol,
                RuleField::DestPort,
                RuleField::Name,
                RuleField::Jump
            ]
        );
    }
}
