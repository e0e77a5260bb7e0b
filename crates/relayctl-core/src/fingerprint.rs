//! Address → relay fingerprint resolution.
//!
//! Several relays may share an address, so a lookup narrows the candidates
//! with progressively more expensive checks and stops at the first one that
//! leaves a single relay:
//!
//! 1. our own address (answered from cached parameters),
//! 2. the only relay listed at the address,
//! 3. the relay at the address whose OR port matches,
//! 4. the one relay at the address we hold a connection or circuit with,
//! 5. the one relay at the address that is not down (running, non-zero
//!    bandwidth, not hibernating), which costs a status and a descriptor
//!    lookup per candidate.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::transport::RouterStatus;

/// Result of resolving an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(String),
    /// No relay is listed for the address (and port).
    NoMatch,
    /// This many candidates remained after every heuristic.
    Ambiguous(usize),
}

impl Resolution {
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            Resolution::Found(fingerprint) => Some(fingerprint),
            _ => None,
        }
    }
}

/// Data sources consulted while resolving. Failed queries read as absent.
pub trait DirectoryLookup {
    fn own_address(&mut self) -> Option<String>;
    fn own_or_port(&mut self) -> Option<u16>;
    fn own_fingerprint(&mut self) -> Option<String>;
    fn own_nickname(&mut self) -> String;

    /// The full network status listing.
    fn network_status(&mut self) -> Vec<RouterStatus>;
    fn relay_status(&mut self, fingerprint: &str) -> Option<RouterStatus>;
    fn relay_descriptor(&mut self, fingerprint: &str) -> Option<String>;

    /// Raw `orconn-status` listing.
    fn orconn_status(&mut self) -> Option<String>;
    /// Raw `circuit-status` listing.
    fn circuit_status(&mut self) -> Option<String>;
}

/// Relays listed per address, as `(or_port, fingerprint)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintMap {
    by_address: HashMap<String, Vec<(u16, String)>>,
}

impl FingerprintMap {
    pub fn from_entries(entries: &[RouterStatus]) -> Self {
        let mut map = Self::default();
        for entry in entries {
            map.by_address
                .entry(entry.address.clone())
                .or_default()
                .push((entry.or_port, entry.fingerprint.clone()));
        }
        map
    }

    /// Record `entry`, replacing a relay at the same address and port.
    pub fn patch(&mut self, entry: &RouterStatus) {
        let relays = self.by_address.entry(entry.address.clone()).or_default();
        relays.retain(|(port, _)| *port != entry.or_port);
        relays.push((entry.or_port, entry.fingerprint.clone()));
    }

    pub fn candidates(&self, address: &str) -> &[(u16, String)] {
        self.by_address.get(address).map_or(&[], Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.by_address.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fingerprints of relays we hold OR connections or circuits through.
///
/// `orconn-status` lines look like `$<fingerprint>=<nickname> CONNECTED` and
/// `circuit-status` lines like `7 BUILT $<fp>=<nick>,$<fp>~<nick> PURPOSE=…`.
pub fn connected_relays(orconn_status: Option<&str>, circuit_status: Option<&str>) -> HashSet<String> {
    fn strip(entry: &str) -> Option<String> {
        let entry = entry.strip_prefix('$')?;
        let end = entry.find(['=', '~', ' ']).unwrap_or(entry.len());
        (end > 0).then(|| entry[..end].to_string())
    }

    let mut relays = HashSet::new();
    for line in orconn_status.unwrap_or_default().lines() {
        relays.extend(strip(line.trim()));
    }
    for line in circuit_status.unwrap_or_default().lines() {
        if let Some(path) = line.split(' ').nth(2) {
            relays.extend(path.split(',').filter_map(strip));
        }
    }
    relays
}

/// Whether a relay should be counted as down: it lost the `Running` flag,
/// reports no observed bandwidth, or is hibernating.
pub fn relay_is_down(status: &RouterStatus, descriptor: &str) -> bool {
    if !status.flags.iter().any(|flag| flag == "Running") {
        return true;
    }

    descriptor.lines().any(|line| {
        let line = line.trim().strip_prefix("opt ").unwrap_or(line.trim());
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["bandwidth", _, _, observed] => *observed == "0",
            ["hibernating", state] => *state == "1",
            _ => false,
        }
    })
}

/// Lazily built address map plus the memoized lookups that depend on it.
#[derive(Debug, Default)]
pub struct FingerprintResolver {
    mappings: Option<FingerprintMap>,
    lookups: HashMap<(String, Option<u16>), Resolution>,
    attached: Option<HashSet<String>>,
    nicknames: HashMap<String, Option<String>>,
    /// Relays with new descriptors, patched into `mappings` on next use.
    pending: Vec<String>,
}

impl FingerprintResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything (new connection).
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_materialized(&self) -> bool {
        self.mappings.is_some()
    }

    pub fn mappings(&self) -> Option<&FingerprintMap> {
        self.mappings.as_ref()
    }

    pub fn clear_lookups(&mut self) {
        self.lookups.clear();
        self.attached = None;
        self.nicknames.clear();
    }

    /// A new consensus replaces the address map wholesale.
    pub fn on_consensus(&mut self, entries: &[RouterStatus]) {
        self.clear_lookups();
        self.pending.clear();
        if self.mappings.is_some() {
            self.mappings = Some(FingerprintMap::from_entries(entries));
        }
    }

    /// New descriptors patch the address map the next time it is used.
    pub fn on_descriptors(&mut self, fingerprints: &[String]) {
        self.clear_lookups();
        if self.mappings.is_some() {
            self.pending.extend(fingerprints.iter().cloned());
        }
    }

    /// Circuits changed, so the set of relays we are attached to may have.
    pub fn on_circuit_change(&mut self) {
        self.attached = None;
    }

    /// Resolve `address` (and optionally `port`) to a fingerprint.
    pub fn resolve(
        &mut self,
        lookup: &mut dyn DirectoryLookup,
        address: &str,
        port: Option<u16>,
    ) -> Resolution {
        let key = (address.to_string(), port);
        if let Some(cached) = self.lookups.get(&key) {
            return cached.clone();
        }

        let resolution = self.resolve_uncached(lookup, address, port);
        debug!(address, ?port, ?resolution, "resolved relay fingerprint");
        self.lookups.insert(key, resolution.clone());
        resolution
    }

    /// Nickname of the relay with `fingerprint`, if it is listed.
    pub fn nickname(&mut self, lookup: &mut dyn DirectoryLookup, fingerprint: &str) -> Option<String> {
        if let Some(cached) = self.nicknames.get(fingerprint) {
            return cached.clone();
        }

        let nickname = if lookup.own_fingerprint().as_deref() == Some(fingerprint) {
            Some(lookup.own_nickname())
        } else {
            lookup.relay_status(fingerprint).map(|status| status.nickname)
        };
        self.nicknames.insert(fingerprint.to_string(), nickname.clone());
        nickname
    }

    fn resolve_uncached(
        &mut self,
        lookup: &mut dyn DirectoryLookup,
        address: &str,
        port: Option<u16>,
    ) -> Resolution {
        if lookup.own_address().as_deref() == Some(address)
            && (port.is_none() || port == lookup.own_or_port())
        {
            return lookup.own_fingerprint().map_or(Resolution::NoMatch, Resolution::Found);
        }

        let candidates = self.materialize(lookup).candidates(address).to_vec();
        match candidates.as_slice() {
            [] => return Resolution::NoMatch,
            [(entry_port, fingerprint)] => {
                return match port {
                    Some(port) if port != *entry_port => Resolution::NoMatch,
                    _ => Resolution::Found(fingerprint.clone()),
                };
            }
            _ => {}
        }

        if let Some(port) = port
            && let Some((_, fingerprint)) = candidates.iter().find(|(p, _)| *p == port)
        {
            return Resolution::Found(fingerprint.clone());
        }

        let attached = self.attached.get_or_insert_with(|| {
            connected_relays(
                lookup.orconn_status().as_deref(),
                lookup.circuit_status().as_deref(),
            )
        });
        let attached_matches: Vec<&String> = candidates
            .iter()
            .map(|(_, fingerprint)| fingerprint)
            .filter(|fingerprint| attached.contains(*fingerprint))
            .collect();
        if let [fingerprint] = attached_matches.as_slice() {
            return Resolution::Found((*fingerprint).clone());
        }

        let remaining: Vec<String> = candidates
            .into_iter()
            .map(|(_, fingerprint)| fingerprint)
            .filter(|fingerprint| {
                let status = lookup.relay_status(fingerprint);
                let descriptor = lookup.relay_descriptor(fingerprint);
                match (status, descriptor) {
                    (Some(status), Some(descriptor)) => !relay_is_down(&status, &descriptor),
                    _ => true,
                }
            })
            .collect();

        match remaining.as_slice() {
            [fingerprint] => Resolution::Found(fingerprint.clone()),
            [] => Resolution::NoMatch,
            _ => Resolution::Ambiguous(remaining.len()),
        }
    }

    fn materialize(&mut self, lookup: &mut dyn DirectoryLookup) -> &FingerprintMap {
        let pending = std::mem::take(&mut self.pending);
        let mappings = self
            .mappings
            .get_or_insert_with(|| FingerprintMap::from_entries(&lookup.network_status()));

        for fingerprint in pending {
            if let Some(status) = lookup.relay_status(&fingerprint) {
                mappings.patch(&status);
            }
        }
        mappings
    }
}
