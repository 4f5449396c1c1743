use thiserror::Error;

/// Core error types for iptsync
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A declared rule violates a field-combination constraint
    #[error("Rule '{rule}' rejected ({constraint}): {message}")]
    Validation {
        rule: String,
        constraint: String,
        message: String,
    },

    /// Address string is not an IP literal with a valid mask
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// ICMP type name is not in the lookup table
    #[error("Unknown ICMP type: {0}")]
    UnknownIcmpType(String),

    /// A rule-listing line could not be turned into a rule
    #[error("Cannot parse '{line}': {message}")]
    Parse { line: String, message: String },

    /// The live dump command could not be invoked or failed
    #[error("Live rule dump unavailable: {0}")]
    DumpUnavailable(String),

    /// One insert/delete against the live store failed
    #[error("{operation} failed: {message}")]
    ApplyOperationFailed {
        operation: String,
        message: String,
        exit_code: Option<i32>,
    },

    /// No persistence command is known, or it failed
    #[error("Persistence unavailable: {0}")]
    PersistUnavailable(String),

    /// Every declaration in a non-empty set was rejected
    #[error("All {0} declarations were rejected; refusing to touch the live rules")]
    NoValidDeclarations(usize),

    /// Snapshot operation failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(
        rule: impl Into<String>,
        constraint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            rule: rule.into(),
            constraint: constraint.into(),
            message: message.into(),
        }
    }

    /// True for errors scoped to one rule or one line.
    ///
    /// These are recovered by skipping the offending unit; everything else
    /// aborts the pass before any mutation.
    pub fn is_rule_local(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::InvalidAddress(_)
                | Self::UnknownIcmpType(_)
                | Self::Parse { .. }
                | Self::ApplyOperationFailed { .. }
        )
    }

    /// Name of the violated constraint, for validation errors.
    pub fn constraint(&self) -> Option<&str> {
        match self {
            Self::Validation { constraint, .. } => Some(constraint),
            Self::InvalidAddress(_) => Some("address"),
            Self::UnknownIcmpType(_) => Some("icmp"),
            _ => None,
        }
    }
}

/// Snapshot-specific errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Snapshot checksum file missing for {0}")]
    MissingChecksum(String),

    #[error("Snapshot not found: {0}")]
    NotFound(String),
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches iptables stderr against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to modify iptables rules")
                .with_suggestion("Run iptsync as root or configure sudo/pkexec")
                .with_suggestion("Set IPTSYNC_ELEVATION_METHOD to pick sudo, run0 or pkexec")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // xtables lock held by another process (iptables without -w)
        if lower.contains("xtables lock") || lower.contains("another app is currently holding") {
            return ErrorTranslation::new("The xtables lock is held by another process")
                .with_suggestion("Enable wait_for_lock in the config so iptables waits with -w")
                .with_suggestion("Check for a concurrent firewall manager: systemctl status firewalld ufw");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)")
                .with_suggestion("Or set iptables_command in the config to its path");
        }

        // Delete by rule match where the rule is already gone
        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("No matching rule to delete")
                .with_suggestion("The rule was removed by another process since the last read")
                .with_suggestion("Re-run iptsync; the next pass re-reads the live rules");
        }

        if lower.contains("index of insertion too big") || lower.contains("index of deletion too big")
        {
            return ErrorTranslation::new("Rule position is beyond the end of the chain")
                .with_suggestion("The chain changed while iptsync was applying rules")
                .with_suggestion("Re-run iptsync to recompute positions");
        }

        if lower.contains("couldn't load target") || lower.contains("unknown target") {
            return ErrorTranslation::new("Jump target is not available in this kernel")
                .with_suggestion("Load the matching xt_/ipt_ kernel module")
                .with_suggestion("DNAT, SNAT, MASQUERADE and REDIRECT only work in the nat table");
        }

        if lower.contains("couldn't load match") || lower.contains("unknown option") {
            return ErrorTranslation::new("Match module or option is not available")
                .with_suggestion("Load the module named in the message, e.g. modprobe xt_comment")
                .with_suggestion("Disable icmp_module in the config if '-m icmp' is unsupported");
        }

        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Chain, target or match does not exist")
                .with_suggestion("Verify the chain is valid for the table (e.g. nat has no INPUT)")
                .with_suggestion("Check kernel modules: lsmod | grep -E 'ip_tables|xt_'");
        }

        if lower.contains("host/network") && lower.contains("not found") {
            return ErrorTranslation::new("Address could not be resolved")
                .with_suggestion("Use an IP literal or a resolvable hostname")
                .with_suggestion("Check DNS from the host: getent hosts <name>");
        }

        if lower.contains("invalid port") || (lower.contains("port") && lower.contains("range")) {
            return ErrorTranslation::new("Invalid port or port range")
                .with_suggestion("Port numbers must be between 1 and 65535")
                .with_suggestion("For port ranges use start:end with start <= end");
        }

        if lower.contains("can't initialize iptables table") || lower.contains("table does not exist")
        {
            return ErrorTranslation::new("iptables table is not available")
                .with_suggestion("Load the table module: sudo modprobe iptable_nat")
                .with_help("https://www.netfilter.org/documentation/");
        }

        // Generic fallback
        ErrorTranslation::new(format!("iptables error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables-save")
            .with_help("https://www.netfilter.org/documentation/")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
