//! Rule text codec
//!
//! Maps [`RuleRecord`]s to iptables command arguments and to the single-line
//! `-A CHAIN ...` form used by iptables-save, and parses such lines back.
//!
//! # Rendering
//!
//! Switches are always emitted in [`RuleField`] order, whatever order the
//! record was built in. Two records with equal fields therefore render
//! byte-identical text, and that text is what the reconciler diffs on.
//!
//! # Parsing
//!
//! iptables-save reorders switches freely between versions, so parsing
//! looks options up by flag instead of by position. A line that uses a
//! chain, table, target or match this codec does not model is reported as
//! [`ParsedLine::Unmanaged`] rather than approximated.

use std::collections::BTreeSet;

use logos::Logos;
use strum::IntoEnumIterator;
use tracing::trace;

use crate::core::address::{self, AddressFormat};
use crate::core::error::{Error, Result};
use crate::core::rule::{
    Chain, ConnState, Jump, PortEntry, Protocol, RuleField, RuleRecord, Table,
    format_port_list, parse_port_list,
};
use crate::validators;

/// Rendering and parsing knobs taken from the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecOptions {
    pub address_format: AddressFormat,
    /// Emit `-m icmp` ahead of `--icmp-type`
    pub icmp_module: bool,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            address_format: AddressFormat::Cidr,
            icmp_module: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ICMP type names
// ═══════════════════════════════════════════════════════════════════════════

const ICMP_TYPES: &[(&str, u8)] = &[
    ("echo-reply", 0),
    ("destination-unreachable", 3),
    ("source-quench", 4),
    ("redirect", 6),
    ("echo-request", 8),
    ("router-advertisement", 9),
    ("router-solicitation", 10),
    ("time-exceeded", 11),
    ("parameter-problem", 12),
    ("timestamp-request", 13),
    ("timestamp-reply", 14),
    ("address-mask-request", 17),
    ("address-mask-reply", 18),
];

/// Resolves an ICMP type name or a one/two digit number.
///
/// `any` resolves to `None`. A `type/code` pair keeps only the type.
pub fn icmp_type_number(value: &str) -> Result<Option<u8>> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("any") {
        return Ok(None);
    }

    let type_part = value.split_once('/').map_or(value, |(t, _)| t);
    if (1..=2).contains(&type_part.len()) && type_part.bytes().all(|b| b.is_ascii_digit()) {
        return type_part
            .parse()
            .map(Some)
            .map_err(|_| Error::UnknownIcmpType(value.to_string()));
    }

    ICMP_TYPES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(value))
        .map(|(_, number)| Some(*number))
        .ok_or_else(|| Error::UnknownIcmpType(value.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════════
// Rendering
// ═══════════════════════════════════════════════════════════════════════════

/// Argument accumulator for [`render_args`]
#[derive(Default)]
struct Args(Vec<String>);

impl Args {
    fn push(&mut self, parts: &[&str]) {
        self.0.extend(parts.iter().map(|part| (*part).to_string()));
    }

    fn opt(&mut self, flag: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.push(&[flag, value]);
        }
    }

    fn ports(&mut self, ports: &[PortEntry], single: &str, multi: &str) {
        match ports {
            [] => {}
            [port] => self.push(&[single, &port.to_string()]),
            _ => self.push(&["-m", "multiport", multi, &format_port_list(ports)]),
        }
    }

    fn interface(&mut self, flag: &str, iface: Option<&str>) {
        if let Some(name) = iface {
            match name.strip_prefix('!') {
                Some(negated) => self.push(&["!", flag, negated]),
                None => self.push(&[flag, name]),
            }
        }
    }
}

/// Command arguments for a rule, starting with `-t <table>`.
///
/// The chain is not included; callers prefix `-I CHAIN N` or `-D CHAIN`.
pub fn render_args(record: &RuleRecord, options: &CodecOptions) -> Vec<String> {
    let mut args = Args::default();

    for field in RuleField::iter() {
        match field {
            RuleField::Table => args.push(&["-t", record.table.as_str()]),
            RuleField::Protocol => {
                if record.protocol != Protocol::All {
                    args.push(&["-p", record.protocol.as_str()]);
                }
            }
            RuleField::IcmpType => {
                if record.protocol == Protocol::Icmp {
                    if options.icmp_module {
                        args.push(&["-m", "icmp"]);
                    }
                    let value = record
                        .icmp_type
                        .map_or_else(|| "any".to_string(), |t| t.to_string());
                    args.push(&["--icmp-type", &value]);
                }
            }
            RuleField::Source => args.opt("-s", record.source.as_deref()),
            RuleField::SourcePort => args.ports(&record.source_port, "--sport", "--sports"),
            RuleField::Destination => args.opt("-d", record.destination.as_deref()),
            RuleField::DestPort => args.ports(&record.dest_port, "--dport", "--dports"),
            RuleField::InInterface => args.interface("-i", record.in_interface.as_deref()),
            RuleField::OutInterface => args.interface("-o", record.out_interface.as_deref()),
            RuleField::ConnState => {
                if let Some(states) = record.field_text(RuleField::ConnState) {
                    args.push(&["-m", "state", "--state", &states]);
                }
            }
            RuleField::RateLimit => {
                if let Some(limit) = &record.rate_limit {
                    args.push(&["-m", "limit", "--limit", limit]);
                }
            }
            RuleField::RateLimitBurst => {
                if let Some(burst) = record.rate_limit_burst {
                    args.push(&["--limit-burst", &burst.to_string()]);
                }
            }
            RuleField::Name => {
                if let Some(name) = &record.name {
                    args.push(&["-m", "comment", "--comment", name]);
                }
            }
            RuleField::Jump => args.push(&["-j", record.jump.as_str()]),
            RuleField::ToDestination => args.opt("--to-destination", record.to_destination.as_deref()),
            RuleField::ToSource => args.opt("--to-source", record.to_source.as_deref()),
            RuleField::ToPorts => args.opt("--to-ports", record.to_ports.as_deref()),
            RuleField::RejectWith => args.opt("--reject-with", record.reject_with.as_deref()),
            RuleField::LogLevel => args.opt("--log-level", record.log_level.as_deref()),
            RuleField::LogPrefix => args.opt("--log-prefix", record.log_prefix.as_deref()),
        }
    }

    args.0
}

pub fn quote_always(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Quotes an argument when it holds blanks, quotes or backslashes.
pub fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"', '\\']) {
        arg.to_string()
    } else {
        quote_always(arg)
    }
}

/// Canonical `-A CHAIN ...` text of a rule.
///
/// The comment and log prefix are always quoted; other values never
/// contain blanks.
pub fn render(record: &RuleRecord, options: &CodecOptions) -> String {
    let mut text = format!("-A {}", record.chain.as_str());
    let mut free_text = false;
    for arg in render_args(record, options) {
        text.push(' ');
        if free_text {
            text.push_str(&quote_always(&arg));
        } else {
            text.push_str(&quote_arg(&arg));
        }
        free_text = matches!(arg.as_str(), "--comment" | "--log-prefix");
    }
    text
}

// ═══════════════════════════════════════════════════════════════════════════
// Parsing
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Logos, Debug, Clone, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n\f]+")]
enum Token<'a> {
    #[regex(r#""([^"\\]|\\.)*""#, |lex| lex.slice())]
    Quoted(&'a str),

    #[regex(r#"[^ \t\r\n\f"]+"#, |lex| lex.slice())]
    Word(&'a str),
}

fn unquote(quoted: &str) -> String {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Splits a rule line into words, honoring double quotes.
pub fn tokenize(line: &str) -> Result<Vec<String>> {
    Token::lexer(line)
        .map(|token| match token {
            Ok(Token::Word(word)) => Ok(word.to_string()),
            Ok(Token::Quoted(quoted)) => Ok(unquote(quoted)),
            Err(()) => Err(Error::Parse {
                line: line.to_string(),
                message: "unterminated quote".to_string(),
            }),
        })
        .collect()
}

/// Outcome of parsing one `-A` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Rule(RuleRecord),
    /// A rule iptsync does not manage, with the chain name and reason
    Unmanaged { chain: String, reason: String },
}

/// Parses one iptables-save rule line.
///
/// `section` is the table named by the most recent `*table` header; an
/// explicit `-t` on the line wins, and `filter` is the fallback.
pub fn parse_line(line: &str, section: Option<&str>, options: &CodecOptions) -> Result<ParsedLine> {
    let tokens = tokenize(line)?;
    let parse_err = |message: String| Error::Parse {
        line: line.trim().to_string(),
        message,
    };

    let mut iter = tokens.iter().map(String::as_str).peekable();
    // iptables-save -c prefixes packet counters
    if iter.peek().is_some_and(|t| t.starts_with('[') && t.ends_with(']')) {
        iter.next();
    }
    if iter.next() != Some("-A") {
        return Err(parse_err("rule lines start with -A".to_string()));
    }
    let chain_name = iter
        .next()
        .ok_or_else(|| parse_err("missing chain name".to_string()))?
        .to_string();
    let unmanaged = |reason: String| {
        Ok(ParsedLine::Unmanaged {
            chain: chain_name.clone(),
            reason,
        })
    };

    let Ok(chain) = chain_name.parse::<Chain>() else {
        return unmanaged(format!("user-defined chain {chain_name}"));
    };

    let mut record = RuleRecord::new(Table::Filter, chain);
    let mut table_name = section.unwrap_or("filter").to_string();
    let mut jump: Option<Jump> = None;
    let mut negate = false;

    while let Some(flag) = iter.next() {
        if flag == "!" {
            negate = true;
            continue;
        }
        let mut value = || {
            iter.next()
                .map(ToString::to_string)
                .ok_or_else(|| parse_err(format!("{flag} needs a value")))
        };

        // Only interfaces can be negated in the modelled subset
        if negate && !matches!(flag, "-i" | "--in-interface" | "-o" | "--out-interface") {
            return unmanaged(format!("negated {flag}"));
        }

        match flag {
            "-t" | "--table" => table_name = value()?,
            "-p" | "--protocol" => {
                let raw = value()?;
                match Protocol::parse_alias(&raw) {
                    Some(protocol) => record.protocol = protocol,
                    None => return unmanaged(format!("protocol {raw}")),
                }
            }
            "-s" | "--source" | "--src" => {
                record.source = address::canonicalize(&value()?, options.address_format)?;
            }
            "-d" | "--destination" | "--dst" => {
                record.destination = address::canonicalize(&value()?, options.address_format)?;
            }
            "--sport" | "--sports" | "--source-port" | "--source-ports" => {
                record.source_port = parse_port_list(&value()?).map_err(parse_err)?;
            }
            "--dport" | "--dports" | "--destination-port" | "--destination-ports" => {
                record.dest_port = parse_port_list(&value()?).map_err(parse_err)?;
            }
            "-i" | "--in-interface" => {
                let name = value()?;
                record.in_interface = Some(if negate { format!("!{name}") } else { name });
                negate = false;
            }
            "-o" | "--out-interface" => {
                let name = value()?;
                record.out_interface = Some(if negate { format!("!{name}") } else { name });
                negate = false;
            }
            "-m" | "--match" => {
                let module = value()?;
                if !matches!(
                    module.as_str(),
                    "tcp" | "udp" | "sctp" | "icmp" | "multiport" | "state" | "conntrack"
                        | "limit" | "comment"
                ) {
                    return unmanaged(format!("match module {module}"));
                }
            }
            "--state" | "--ctstate" => {
                let raw = value()?;
                record.conn_state = parse_states(&raw).map_err(parse_err)?;
            }
            "--limit" => {
                let raw = value()?;
                record.rate_limit = Some(validators::normalize_limit(&raw).map_err(parse_err)?);
            }
            "--limit-burst" => {
                let raw = value()?;
                record.rate_limit_burst =
                    Some(raw.parse().map_err(|_| parse_err(format!("burst '{raw}'")))?);
            }
            "--comment" => record.name = Some(value()?),
            "-j" | "--jump" => {
                let raw = value()?;
                match raw.parse::<Jump>() {
                    Ok(target) => jump = Some(target),
                    Err(_) => return unmanaged(format!("target {raw}")),
                }
            }
            "--to-destination" => record.to_destination = Some(value()?),
            "--to-source" => record.to_source = Some(value()?),
            "--to-ports" => record.to_ports = Some(value()?),
            "--reject-with" => record.reject_with = Some(value()?),
            "--log-level" => {
                let raw = value()?;
                record.log_level = Some(validators::normalize_log_level(&raw).map_err(parse_err)?);
            }
            "--log-prefix" => record.log_prefix = Some(value()?),
            "--icmp-type" => record.icmp_type = icmp_type_number(&value()?)?,
            other => return unmanaged(format!("option {other}")),
        }
    }

    let Ok(table) = table_name.parse::<Table>() else {
        return unmanaged(format!("table {table_name}"));
    };
    let Some(jump) = jump else {
        return unmanaged("no jump target".to_string());
    };
    record.table = table;
    record.jump = jump;
    record.normalize();

    trace!(chain = %chain, table = %table, "parsed rule line");
    Ok(ParsedLine::Rule(record))
}

/// Parses a comma separated state list into the canonical set.
pub fn parse_states(raw: &str) -> std::result::Result<BTreeSet<ConnState>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<ConnState>()
                .map_err(|_| format!("unknown connection state '{s}'"))
        })
        .collect()
}
