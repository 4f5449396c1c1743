//! Input validation and normalization functions for iptsync
//!
//! Every declared value that ends up on an iptables command line passes
//! through here first. Validators return the canonical spelling of the
//! value, so the same function serves declared rules and parsed live rules.

use std::net::IpAddr;

/// Maximum comment length accepted by the xt_comment match
pub const MAX_NAME_LEN: usize = 256;

/// Maximum `--log-prefix` length (kernel limit, excluding the NUL)
pub const MAX_LOG_PREFIX_LEN: usize = 29;

/// Validates a rule name.
///
/// Names become the `--comment` of the rule and identify it across runs,
/// so they are restricted to ASCII letters, digits, spaces, hyphens and
/// underscores.
///
/// # Examples
///
/// ```
/// use iptsync::validators::validate_name;
///
/// assert!(validate_name("allow web 80").is_ok());
/// assert!(validate_name("bad;name").is_err());
/// ```
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Rule name is required".to_string());
    }

    if name.len() > MAX_NAME_LEN {
        return Err(format!("Rule name too long (max {MAX_NAME_LEN} characters)"));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_'))
    {
        return Err(
            "Not a valid rule name. Make sure it contains ASCII alphanumeric, spaces, hyphens or underscores"
                .to_string(),
        );
    }

    Ok(())
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates a network interface name for `-i`/`-o`.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// iptables additionally allows a trailing `+` wildcard and a leading `!`
/// for negation.
pub fn validate_interface(name: &str) -> Result<String, String> {
    let bare = name.strip_prefix('!').unwrap_or(name);
    let stem = bare.strip_suffix('+').unwrap_or(bare);

    if bare.is_empty() {
        return Err("Interface name is empty".to_string());
    }

    if bare.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if stem == "." || stem == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Normalizes a `--limit` value to the unit spelling iptables-save prints.
///
/// Accepts `N/unit` where unit is `second`, `minute`, `hour`, `day` or any
/// prefix of one of them.
///
/// ```
/// use iptsync::validators::normalize_limit;
///
/// assert_eq!(normalize_limit("40/minute").unwrap(), "40/min");
/// assert_eq!(normalize_limit("50/s").unwrap(), "50/sec");
/// ```
pub fn normalize_limit(raw: &str) -> Result<String, String> {
    let (count, unit) = raw
        .trim()
        .split_once('/')
        .ok_or_else(|| format!("Limit '{raw}' must look like N/unit, e.g. 10/min"))?;

    let count: u32 = count
        .parse()
        .map_err(|_| format!("Limit count '{count}' is not a number"))?;
    if count == 0 {
        return Err("Limit count must be at least 1".to_string());
    }

    let unit = unit.to_ascii_lowercase();
    let canonical = [
        ("second", "sec"),
        ("minute", "min"),
        ("hour", "hour"),
        ("day", "day"),
    ]
    .iter()
    .find(|(full, _)| !unit.is_empty() && full.starts_with(unit.as_str()))
    .map(|(_, short)| *short)
    .ok_or_else(|| format!("Unknown limit unit '{unit}' (use second, minute, hour or day)"))?;

    Ok(format!("{count}/{canonical}"))
}

/// Validates a `--limit-burst` value.
pub fn validate_burst(raw: &str) -> Result<u32, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err("burst accepts only numeric values".to_string());
    }
    let burst: u32 = trimmed
        .parse()
        .map_err(|_| "burst value is too large".to_string())?;
    if burst == 0 {
        return Err("burst must be at least 1".to_string());
    }
    Ok(burst)
}

/// Normalizes a syslog level name or number to its number.
pub fn normalize_log_level(raw: &str) -> Result<String, String> {
    let level = match raw.trim().to_ascii_lowercase().as_str() {
        "emerg" | "panic" | "0" => 0,
        "alert" | "1" => 1,
        "crit" | "2" => 2,
        "err" | "error" | "3" => 3,
        "warning" | "warn" | "4" => 4,
        "notice" | "5" => 5,
        "info" | "6" => 6,
        "debug" | "7" => 7,
        other => return Err(format!("Unknown log level '{other}' (use 0-7 or a syslog name)")),
    };
    Ok(level.to_string())
}

/// Validates a `--log-prefix`.
///
/// # Errors
///
/// Returns `Err` if:
/// - Prefix is empty
/// - Prefix exceeds 29 characters
/// - Prefix holds control characters
pub fn validate_log_prefix(prefix: &str) -> Result<String, String> {
    if prefix.is_empty() {
        return Err("Log prefix cannot be empty".to_string());
    }

    if prefix.len() > MAX_LOG_PREFIX_LEN {
        return Err(format!(
            "Log prefix too long (max {MAX_LOG_PREFIX_LEN} chars)"
        ));
    }

    if prefix.chars().any(char::is_control) || !prefix.is_ascii() {
        return Err("Log prefix contains invalid characters".to_string());
    }

    Ok(prefix.to_string())
}

/// Validates a NAT address for `--to-destination`/`--to-source`.
///
/// Format: `addr[-addr][:port[-port]]`. IPv6 addresses with a port must be
/// bracketed, as iptables expects.
pub fn validate_nat_address(value: &str) -> Result<String, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("NAT address cannot be empty".to_string());
    }

    let (addrs, ports) = if let Some(rest) = value.strip_prefix('[') {
        let (inner, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("Unclosed '[' in '{value}'"))?;
        (inner, tail.strip_prefix(':'))
    } else if value.matches(':').count() == 1 {
        let (a, p) = value.split_once(':').unwrap_or((value, ""));
        (a, Some(p))
    } else {
        (value, None)
    };

    for addr in addrs.split('-') {
        addr.parse::<IpAddr>()
            .map_err(|_| format!("'{addr}' is not an IP address"))?;
    }

    if let Some(ports) = ports {
        validate_to_ports(ports)?;
    }

    Ok(value.to_string())
}

/// Validates `--to-ports`: a port or `start-end` range.
pub fn validate_to_ports(value: &str) -> Result<String, String> {
    let parse = |p: &str| {
        p.trim()
            .parse::<u16>()
            .map_err(|_| format!("'{p}' is not a port number"))
    };
    match value.split_once('-') {
        Some((start, end)) => {
            validate_port_range(parse(start)?, parse(end)?)?;
        }
        None => {
            validate_port(parse(value)?)?;
        }
    }
    Ok(value.trim().to_string())
}
