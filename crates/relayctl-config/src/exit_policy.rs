//! Exit-policy engine: an ordered chain of accept/reject rules.
//!
//! Each rule has the form `accept|reject addr[/mask][:port[-port]]`, where
//! `addr` is an IPv4 literal, `*`, or the alias `private`. Rules are linked
//! through their successor and the first rule matching a destination decides
//! the verdict. The alias `private` expands at construction time into one
//! rule per entry of [`PRIVATE_RANGES`], so the rendered chain shows what is
//! actually evaluated rather than the text it was built from.
//!
//! Chains are immutable once built. Owners swap in a freshly built chain
//! instead of mutating one, so a chain can be shared behind an [`Arc`].

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Address ranges substituted for the `private` alias, in evaluation order.
pub const PRIVATE_RANGES: [&str; 6] = [
    "0.0.0.0/8",
    "169.254.0.0/16",
    "127.0.0.0/8",
    "192.168.0.0/16",
    "10.0.0.0/8",
    "172.16.0.0/12",
];

/// Errors from parsing a policy rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("rule {0:?} must start with \"accept\" or \"reject\"")]
    MissingVerdict(String),

    #[error("rule {0:?} has no address")]
    MissingAddress(String),

    #[error("invalid address {address:?} in rule {rule:?}")]
    InvalidAddress { rule: String, address: String },

    #[error("invalid port {port:?} in rule {rule:?}")]
    InvalidPort { rule: String, port: String },
}

/// Whether a matching rule permits or refuses the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

impl Verdict {
    fn label(self) -> &'static str {
        match self {
            Verdict::Accept => "accept",
            Verdict::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AddressSpec {
    literal: String,
    /// Numeric form of `literal` when it is an IPv4 address.
    bits: Option<u32>,
    mask: u8,
    wildcard: bool,
}

impl AddressSpec {
    fn parse(rule: &str, text: &str) -> Result<Self, PolicyError> {
        let invalid = || PolicyError::InvalidAddress {
            rule: rule.to_string(),
            address: text.to_string(),
        };

        let (literal, mask) = match text.split_once('/') {
            Some((literal, mask)) => {
                let mask: u8 = mask.parse().map_err(|_| invalid())?;
                if mask > 32 {
                    return Err(invalid());
                }
                (literal, mask)
            }
            None => (text, 32),
        };
        if literal.is_empty() {
            return Err(invalid());
        }

        let wildcard = literal == "*" || mask == 0;
        let bits = literal.parse::<Ipv4Addr>().ok().map(u32::from);
        if !wildcard && mask != 32 && bits.is_none() {
            return Err(invalid());
        }

        Ok(Self {
            literal: literal.to_string(),
            bits,
            mask,
            wildcard,
        })
    }

    fn matches(&self, address: &str, input_bits: &mut Option<Option<u32>>) -> bool {
        if self.wildcard || self.literal == address {
            return true;
        }
        if self.mask == 32 {
            return false;
        }

        let input = *input_bits.get_or_insert_with(|| address.parse::<Ipv4Addr>().ok().map(u32::from));
        match (self.bits, input) {
            (Some(ours), Some(theirs)) => {
                let shift = 32 - u32::from(self.mask);
                (ours >> shift) == (theirs >> shift)
            }
            _ => false,
        }
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wildcard {
            f.write_str("*")
        } else if self.mask != 32 {
            write!(f, "{}/{}", self.literal, self.mask)
        } else {
            f.write_str(&self.literal)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortSpec {
    Any,
    Range(u16, u16),
}

impl PortSpec {
    fn parse(rule: &str, text: &str) -> Result<Self, PolicyError> {
        if text == "*" {
            return Ok(PortSpec::Any);
        }

        let invalid = || PolicyError::InvalidPort {
            rule: rule.to_string(),
            port: text.to_string(),
        };
        let (min, max) = match text.split_once('-') {
            Some((min, max)) => (
                min.parse().map_err(|_| invalid())?,
                max.parse().map_err(|_| invalid())?,
            ),
            None => {
                let port = text.parse().map_err(|_| invalid())?;
                (port, port)
            }
        };
        if min > max {
            return Err(invalid());
        }
        Ok(PortSpec::Range(min, max))
    }

    fn contains(self, port: u16) -> bool {
        match self {
            PortSpec::Any => true,
            PortSpec::Range(min, max) => (min..=max).contains(&port),
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Any => f.write_str("*"),
            PortSpec::Range(min, max) if min == max => write!(f, "{min}"),
            PortSpec::Range(min, max) => write!(f, "{min}-{max}"),
        }
    }
}

/// A single exit-policy rule and the rest of the chain after it.
#[derive(Debug, Clone)]
pub struct ExitPolicy {
    verdict: Verdict,
    address: AddressSpec,
    ports: PortSpec,
    next: Option<Arc<ExitPolicy>>,
}

impl ExitPolicy {
    /// Parse `entry` (for instance `"reject *:135-139"`) into a rule that
    /// defers to `next` for destinations it does not cover.
    ///
    /// A rule matching every address and port ends the chain, so `next` is
    /// dropped in that case.
    pub fn new(entry: &str, next: Option<Arc<ExitPolicy>>) -> Result<Self, PolicyError> {
        let entry = entry.replace("\\t", " ").replace(['\t', '"'], " ");
        let entry = entry.trim();

        let verdict = if entry.starts_with("accept") {
            Verdict::Accept
        } else if entry.starts_with("reject") {
            Verdict::Reject
        } else {
            return Err(PolicyError::MissingVerdict(entry.to_string()));
        };

        let target: String = entry[6..].chars().filter(|c| !c.is_whitespace()).collect();
        if target.is_empty() {
            return Err(PolicyError::MissingAddress(entry.to_string()));
        }
        let (address, port) = target.split_once(':').unwrap_or((target.as_str(), "*"));
        let ports = PortSpec::parse(entry, port)?;

        let mut next = next;
        let address = if address.eq_ignore_ascii_case("private") {
            // The remaining ranges become the successors of this rule,
            // built back to front so they keep their listed order.
            for range in PRIVATE_RANGES[1..].iter().rev() {
                let rule = format!("{} {range}:{port}", verdict.label());
                next = Some(Arc::new(ExitPolicy::new(&rule, next)?));
            }
            AddressSpec::parse(entry, PRIVATE_RANGES[0])?
        } else {
            AddressSpec::parse(entry, address)?
        };

        if address.wildcard && ports == PortSpec::Any {
            next = None;
        }

        Ok(Self {
            verdict,
            address,
            ports,
            next,
        })
    }

    /// Build a chain from rules listed in evaluation order.
    ///
    /// Returns `None` for an empty list.
    pub fn from_entries<S: AsRef<str>>(
        entries: &[S],
    ) -> Result<Option<Arc<ExitPolicy>>, PolicyError> {
        let mut head = None;
        for entry in entries.iter().rev() {
            head = Some(Arc::new(ExitPolicy::new(entry.as_ref(), head)?));
        }
        Ok(head)
    }

    /// Whether the chain permits exiting to `address` on `port`.
    ///
    /// A chain that runs out without a matching rule accepts.
    pub fn check(&self, address: &str, port: u16) -> bool {
        let mut input_bits = None;
        let mut rule = Some(self);

        while let Some(current) = rule {
            // Ports are compared first since they are cheaper than addresses.
            if current.ports.contains(port) && current.address.matches(address, &mut input_bits) {
                return current.verdict == Verdict::Accept;
            }
            rule = current.next.as_deref();
        }

        true
    }

    /// Verdict of this rule alone.
    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    /// The rule consulted when this one does not match.
    pub fn next(&self) -> Option<&ExitPolicy> {
        self.next.as_deref()
    }

    /// Iterate over this rule and all of its successors.
    pub fn rules(&self) -> impl Iterator<Item = &ExitPolicy> {
        std::iter::successors(Some(self), |rule| rule.next())
    }

    /// Canonical text of this rule without its successors.
    pub fn rule_text(&self) -> String {
        format!("{} {}:{}", self.verdict.label(), self.address, self.ports)
    }
}

impl fmt::Display for ExitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rule) in self.rules().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&rule.rule_text())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chain(entries: &[&str]) -> Arc<ExitPolicy> {
        ExitPolicy::from_entries(entries).unwrap().unwrap()
    }

    #[test]
    fn test_masked_reject_before_accept_all() {
        let policy = chain(&["reject 192.168.0.0/16:*", "accept *:*"]);

        assert!(!policy.check("192.168.1.5", 80));
        assert!(policy.check("8.8.8.8", 80));
    }

    #[test]
    fn test_private_alias_expands() {
        let policy = chain(&["reject private:*", "accept *:*"]);

        assert!(!policy.check("127.0.0.1", 9050));
        assert!(!policy.check("10.1.2.3", 443));
        assert!(!policy.check("172.31.255.1", 22));
        assert!(policy.check("172.32.0.1", 22));
        assert!(policy.check("1.1.1.1", 9050));

        assert_eq!(policy.rules().count(), PRIVATE_RANGES.len() + 1);
        assert_eq!(
            policy.to_string(),
            "reject 0.0.0.0/8:*, reject 169.254.0.0/16:*, reject 127.0.0.0/8:*, \
             reject 192.168.0.0/16:*, reject 10.0.0.0/8:*, reject 172.16.0.0/12:*, \
             accept *:*"
        );
    }

    #[test]
    fn test_private_alias_keeps_port_spec() {
        let policy = chain(&["accept private:80-81", "reject *:*"]);

        assert!(policy.check("192.168.0.9", 80));
        assert!(!policy.check("192.168.0.9", 82));
        assert!(policy.rules().all(|rule| {
            rule.verdict() == Verdict::Reject || rule.rule_text().ends_with(":80-81")
        }));
    }

    #[test]
    fn test_port_range_bounds() {
        let policy = chain(&["accept *:1-1024", "reject *:*"]);

        assert!(policy.check("203.0.113.7", 1024));
        assert!(policy.check("203.0.113.7", 1));
        assert!(!policy.check("203.0.113.7", 1025));
    }

    #[test]
    fn test_wildcard_rule_terminates_chain() {
        let tail = Some(Arc::new(ExitPolicy::new("reject *:*", None).unwrap()));
        let policy = ExitPolicy::new("accept *:*", tail).unwrap();

        assert!(policy.next().is_none());
        assert_eq!(policy.to_string(), "accept *:*");
    }

    #[test]
    fn test_zero_mask_is_wildcard() {
        let policy = ExitPolicy::new("reject 0.0.0.0/0:*", None).unwrap();
        assert_eq!(policy.to_string(), "reject *:*");
        assert!(!policy.check("8.8.4.4", 53));
    }

    #[test]
    fn test_exact_address_match() {
        let policy = chain(&["reject 198.51.100.4:25", "accept *:*"]);

        assert!(!policy.check("198.51.100.4", 25));
        assert!(policy.check("198.51.100.5", 25));
        assert!(policy.check("198.51.100.4", 26));
    }

    #[test]
    fn test_port_defaults_to_wildcard() {
        let policy = chain(&["reject 198.51.100.4", "accept *:*"]);
        assert_eq!(policy.rule_text(), "reject 198.51.100.4:*");
        assert!(!policy.check("198.51.100.4", 8080));
    }

    #[test]
    fn test_exhausted_chain_accepts() {
        let policy = chain(&["reject *:25"]);
        assert!(!policy.check("198.51.100.1", 25));
        assert!(policy.check("198.51.100.1", 80));
    }

    #[test]
    fn test_unparseable_input_misses_masked_rule() {
        let policy = chain(&["reject 10.0.0.0/8:*", "accept *:*"]);
        assert!(policy.check("relay.example.net", 80));
    }

    #[test]
    fn test_normalizes_quotes_and_tabs() {
        let policy = ExitPolicy::new("\"reject\\t 10.0.0.0/8 : 80\"", None).unwrap();
        assert_eq!(policy.rule_text(), "reject 10.0.0.0/8:80");
    }

    #[test]
    fn test_rejects_malformed_rules() {
        assert!(matches!(
            ExitPolicy::new("allow *:*", None),
            Err(PolicyError::MissingVerdict(_))
        ));
        assert!(matches!(
            ExitPolicy::new("accept", None),
            Err(PolicyError::MissingAddress(_))
        ));
        assert!(matches!(
            ExitPolicy::new("accept 10.0.0.0/33:*", None),
            Err(PolicyError::InvalidAddress { .. })
        ));
        assert!(matches!(
            ExitPolicy::new("accept host.example/8:*", None),
            Err(PolicyError::InvalidAddress { .. })
        ));
        assert!(matches!(
            ExitPolicy::new("accept *:90-80", None),
            Err(PolicyError::InvalidPort { .. })
        ));
        assert!(matches!(
            ExitPolicy::new("accept *:http", None),
            Err(PolicyError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_empty_entries_build_nothing() {
        let entries: [&str; 0] = [];
        assert!(ExitPolicy::from_entries(&entries).unwrap().is_none());
    }
}
