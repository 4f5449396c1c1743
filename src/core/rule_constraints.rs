//! Rule constraint functions for iptables rules
//!
//! This module centralizes the cross-field rules a [`RuleRecord`] must obey
//! before it may be rendered into an iptables command: which chains exist
//! in which table, where interfaces can be matched, which protocols carry
//! ports and what each jump target requires.
//!
//! # Examples
//!
//! ```
//! use iptsync::core::rule::{Chain, Protocol, Table};
//! use iptsync::core::rule_constraints::*;
//!
//! assert!(table_allows_chain(Table::Nat, Chain::Prerouting));
//! assert!(!table_allows_chain(Table::Filter, Chain::Postrouting));
//! assert!(protocol_supports_ports(Protocol::Udp));
//! ```

use super::rule::{Chain, Jump, MAX_MULTIPORT_ENTRIES, Protocol, RuleRecord, Table};

/// A violated constraint: a short constraint name plus a readable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub constraint: &'static str,
    pub message: String,
}

impl Violation {
    fn new(constraint: &'static str, message: impl Into<String>) -> Self {
        Self {
            constraint,
            message: message.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Table / Chain Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if the built-in chain exists in the table.
#[inline]
pub fn table_allows_chain(table: Table, chain: Chain) -> bool {
    match table {
        Table::Filter => !matches!(chain, Chain::Prerouting | Chain::Postrouting),
        Table::Nat => !matches!(chain, Chain::Input | Chain::Forward),
        Table::Raw => matches!(chain, Chain::Prerouting | Chain::Output),
        Table::Mangle => true,
    }
}

fn check_table_chain(table: Table, chain: Chain) -> Result<(), Violation> {
    if table_allows_chain(table, chain) {
        return Ok(());
    }
    let message = match table {
        Table::Filter => "PREROUTING and POSTROUTING cannot be used in table 'filter'",
        Table::Nat => "INPUT and FORWARD cannot be used in table 'nat'",
        Table::Raw => "INPUT, FORWARD and POSTROUTING cannot be used in table 'raw'",
        Table::Mangle => "chain is not available in table 'mangle'",
    };
    Err(Violation::new("table-chain", message))
}

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if the protocol supports port filtering.
///
/// ```
/// use iptsync::core::rule::Protocol;
/// use iptsync::core::rule_constraints::protocol_supports_ports;
///
/// assert!(protocol_supports_ports(Protocol::Sctp));
/// assert!(!protocol_supports_ports(Protocol::Icmp));
/// assert!(!protocol_supports_ports(Protocol::All));
/// ```
#[inline]
pub fn protocol_supports_ports(protocol: Protocol) -> bool {
    protocol.supports_ports()
}

fn check_ports(record: &RuleRecord) -> Result<(), Violation> {
    for (constraint, ports) in [("sport", &record.source_port), ("dport", &record.dest_port)] {
        if ports.is_empty() {
            continue;
        }
        if !protocol_supports_ports(record.protocol) {
            return Err(Violation::new(
                constraint,
                format!("Parameter {constraint} only applies to udp and tcp protocols"),
            ));
        }
        if ports.len() > MAX_MULTIPORT_ENTRIES {
            return Err(Violation::new(
                constraint,
                format!("multiport module only accepts <= {MAX_MULTIPORT_ENTRIES} ports"),
            ));
        }
    }
    Ok(())
}

fn check_icmp(record: &RuleRecord) -> Result<(), Violation> {
    if record.icmp_type.is_some() && record.protocol != Protocol::Icmp {
        return Err(Violation::new(
            "icmp",
            "Parameter icmp only applies to proto => icmp",
        ));
    }
    Ok(())
}

/// iptables only takes IPv4 addresses; IPv6 belongs to ip6tables.
fn check_address_family(record: &RuleRecord) -> Result<(), Violation> {
    for (constraint, addr) in [("source", &record.source), ("destination", &record.destination)] {
        if addr.as_deref().is_some_and(|a| a.contains(':')) {
            return Err(Violation::new(
                constraint,
                format!("Parameter {constraint} is an IPv6 address; iptables only handles IPv4"),
            ));
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Chain-Interface Constraints
// ═══════════════════════════════════════════════════════════════════════════

fn check_interfaces(record: &RuleRecord) -> Result<(), Violation> {
    if record.in_interface.is_some() && !record.chain.accepts_in_interface() {
        return Err(Violation::new(
            "iniface",
            "Parameter iniface only applies to chains INPUT,FORWARD,PREROUTING",
        ));
    }
    if record.out_interface.is_some() && !record.chain.accepts_out_interface() {
        return Err(Violation::new(
            "outiface",
            "Parameter outiface only applies to chains OUTPUT,FORWARD,POSTROUTING",
        ));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Jump Target Constraints
// ═══════════════════════════════════════════════════════════════════════════

fn check_jump(record: &RuleRecord) -> Result<(), Violation> {
    let jump = record.jump;
    if jump.requires_nat() && record.table != Table::Nat {
        return Err(Violation::new(
            "jump",
            format!("Parameter jump => {jump} only applies to table => nat"),
        ));
    }

    match jump {
        Jump::Dnat if record.to_destination.is_none() => {
            return Err(Violation::new(
                "jump",
                "Parameter jump => DNAT must have todest parameter",
            ));
        }
        Jump::Snat if record.to_source.is_none() => {
            return Err(Violation::new(
                "jump",
                "Parameter jump => SNAT missing mandatory tosource parameter",
            ));
        }
        Jump::Redirect if record.to_ports.is_none() => {
            return Err(Violation::new(
                "jump",
                "Parameter jump => REDIRECT missing mandatory toports parameter",
            ));
        }
        _ => {}
    }

    // Target options on the wrong target make iptables refuse the rule
    let misplaced = [
        ("todest", record.to_destination.is_some(), jump == Jump::Dnat),
        ("tosource", record.to_source.is_some(), jump == Jump::Snat),
        (
            "toports",
            record.to_ports.is_some(),
            matches!(jump, Jump::Redirect | Jump::Masquerade),
        ),
        ("reject", record.reject_with.is_some(), jump == Jump::Reject),
        ("log_level", record.log_level.is_some(), jump == Jump::Log),
        ("log_prefix", record.log_prefix.is_some(), jump == Jump::Log),
    ];
    for (param, set, allowed) in misplaced {
        if set && !allowed {
            return Err(Violation::new(
                "jump",
                format!("Parameter {param} does not apply to jump => {jump}"),
            ));
        }
    }
    Ok(())
}

fn check_limit(record: &RuleRecord) -> Result<(), Violation> {
    if record.rate_limit_burst.is_some() && record.rate_limit.is_none() {
        return Err(Violation::new("burst", "burst makes no sense without limit"));
    }
    Ok(())
}

/// Checks every cross-field invariant, reporting the first violation.
pub fn check(record: &RuleRecord) -> Result<(), Violation> {
    check_table_chain(record.table, record.chain)?;
    check_interfaces(record)?;
    check_ports(record)?;
    check_icmp(record)?;
    check_address_family(record)?;
    check_jump(record)?;
    check_limit(record)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::PortEntry;

    fn rule(table: Table, chain: Chain) -> RuleRecord {
        RuleRecord {
            name: Some("t".into()),
            protocol: Protocol::Tcp,
            ..RuleRecord::new(table, chain)
        }
    }

    #[test]
    fn test_table_chain_matrix() {
        assert!(table_allows_chain(Table::Filter, Chain::Input));
        assert!(table_allows_chain(Table::Filter, Chain::Forward));
        assert!(!table_allows_chain(Table::Filter, Chain::Prerouting));
        assert!(table_allows_chain(Table::Nat, Chain::Output));
        assert!(!table_allows_chain(Table::Nat, Chain::Input));
        assert!(!table_allows_chain(Table::Raw, Chain::Postrouting));
        assert!(table_allows_chain(Table::Raw, Chain::Prerouting));
        assert!(table_allows_chain(Table::Mangle, Chain::Forward));
    }

    #[test]
    fn test_nat_input_is_rejected() {
        let err = check(&rule(Table::Nat, Chain::Input)).unwrap_err();
        assert_eq!(err.constraint, "table-chain");
        assert_eq!(err.message, "INPUT and FORWARD cannot be used in table 'nat'");
    }

    #[test]
    fn test_iniface_on_output_is_rejected() {
        let mut r = rule(Table::Filter, Chain::Output);
        r.in_interface = Some("eth0".into());
        let err = check(&r).unwrap_err();
        assert_eq!(err.constraint, "iniface");
        assert!(err.message.contains("iniface"));
    }

    #[test]
    fn test_outiface_on_input_is_rejected() {
        let mut r = rule(Table::Filter, Chain::Input);
        r.out_interface = Some("eth0".into());
        assert_eq!(check(&r).unwrap_err().constraint, "outiface");
    }

    #[test]
    fn test_ports_need_port_protocol() {
        let mut r = rule(Table::Filter, Chain::Input);
        r.protocol = Protocol::Icmp;
        r.dest_port = vec![PortEntry::Single(22)];
        let err = check(&r).unwrap_err();
        assert_eq!(err.constraint, "dport");
        assert_eq!(err.message, "Parameter dport only applies to udp and tcp protocols");
    }

    #[test]
    fn test_too_many_ports() {
        let mut r = rule(Table::Filter, Chain::Input);
        r.dest_port = (1..=16).map(PortEntry::Single).collect();
        let err = check(&r).unwrap_err();
        assert!(err.message.contains("<= 15"));

        r.dest_port.pop();
        assert!(check(&r).is_ok());
    }

    #[test]
    fn test_nat_targets() {
        let mut r = rule(Table::Filter, Chain::Output);
        r.jump = Jump::Dnat;
        r.to_destination = Some("10.0.0.1".into());
        assert!(check(&r).unwrap_err().message.contains("table => nat"));

        let mut r = rule(Table::Nat, Chain::Prerouting);
        r.jump = Jump::Dnat;
        assert!(check(&r).unwrap_err().message.contains("todest"));

        let mut r = rule(Table::Nat, Chain::Postrouting);
        r.jump = Jump::Snat;
        assert!(check(&r).unwrap_err().message.contains("tosource"));

        let mut r = rule(Table::Nat, Chain::Prerouting);
        r.jump = Jump::Redirect;
        assert!(check(&r).unwrap_err().message.contains("toports"));
        r.to_ports = Some("8080".into());
        assert!(check(&r).is_ok());

        let mut r = rule(Table::Filter, Chain::Forward);
        r.jump = Jump::Masquerade;
        assert_eq!(check(&r).unwrap_err().constraint, "jump");
    }

    #[test]
    fn test_misplaced_target_option() {
        let mut r = rule(Table::Filter, Chain::Input);
        r.log_prefix = Some("x".into());
        let err = check(&r).unwrap_err();
        assert!(err.message.contains("log_prefix"));
    }

    #[test]
    fn test_burst_without_limit() {
        let mut r = rule(Table::Filter, Chain::Input);
        r.rate_limit_burst = Some(10);
        assert_eq!(check(&r).unwrap_err().message, "burst makes no sense without limit");
        r.rate_limit = Some("5/min".into());
        assert!(check(&r).is_ok());
    }

    #[test]
    fn test_icmp_type_needs_icmp() {
        let mut r = rule(Table::Filter, Chain::Input);
        r.icmp_type = Some(8);
        assert_eq!(check(&r).unwrap_err().constraint, "icmp");
    }

    #[test]
    fn test_ipv6_address_rejected() {
        let mut r = rule(Table::Filter, Chain::Input);
        r.source = Some("2001:db8::/32".into());
        assert_eq!(check(&r).unwrap_err().constraint, "source");
    }
}
