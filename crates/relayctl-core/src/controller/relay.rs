//! Attributes of the attached relay and identity lookups for others.

use std::path::Path;
use std::time::SystemTime;

use tracing::{info, warn};

use super::{ControlError, Controller, Locked};
use crate::cache::{CachedValue, Param, Slot};
use crate::fingerprint::{DirectoryLookup, Resolution};
use crate::process;
use crate::transport::RouterStatus;

/// Authorities assumed when none are configured.
pub const DEFAULT_DIR_AUTHORITIES: [(&str, u16); 9] = [
    ("86.59.21.38", 80),
    ("128.31.0.39", 9031),
    ("216.224.124.114", 9030),
    ("212.112.245.170", 80),
    ("194.109.206.212", 80),
    ("193.23.244.244", 80),
    ("208.83.223.34", 443),
    ("213.115.239.118", 443),
    ("82.94.251.203", 80),
];

fn lines(text: String) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

/// Field following `key=` on a status entry's `w` line.
fn weight_field(entry: &[String], key: &str) -> Option<u64> {
    let line = entry.iter().find(|line| line.starts_with("w "))?;
    line.split_whitespace()
        .find_map(|field| field.strip_prefix(key)?.strip_prefix('='))?
        .parse()
        .ok()
}

/// Address component of a `DirServer`-style entry, such as
/// `moria1 orport=9101 v3ident=D586D183 128.31.0.39:9131 9695DFC3…`.
fn authority_endpoint(entry: &str) -> Option<(String, u16)> {
    let fields: Vec<&str> = entry.split_whitespace().collect();
    let endpoint = fields.len().checked_sub(2).and_then(|i| fields.get(i))?;
    let (address, port) = endpoint.split_once(':')?;
    Some((address.to_string(), port.parse().ok()?))
}

impl Locked<'_> {
    fn info_lines(&mut self, key: &str) -> Option<Vec<String>> {
        self.get_info(key).ok().flatten().map(lines)
    }

    fn option_number(&mut self, option: &str) -> Option<u64> {
        self.get_option(option).ok().flatten()?.trim().parse().ok()
    }

    fn own_fingerprint(&mut self) -> Option<String> {
        self.get_info("fingerprint").ok().flatten()
    }

    /// Cached relay attribute, derived on first use. `None` while detached.
    pub(super) fn relay_attr(&mut self, param: Param) -> Option<CachedValue> {
        self.live_transport().ok()?;
        match self.params.get(param) {
            Some(Slot::Value(value)) => return Some(value.clone()),
            Some(Slot::Unknown) => return None,
            None => {}
        }

        let value = self.derive_attr(param);
        self.params.store(param, value.clone());
        value
    }

    fn relay_lines(&mut self, param: Param) -> Option<Vec<String>> {
        match self.relay_attr(param)? {
            CachedValue::Lines(lines) => Some(lines),
            _ => None,
        }
    }

    fn derive_attr(&mut self, param: Param) -> Option<CachedValue> {
        match param {
            Param::NsEntry => {
                let fingerprint = self.own_fingerprint()?;
                self.info_lines(&format!("ns/id/{fingerprint}"))
                    .map(CachedValue::Lines)
            }
            Param::DescEntry => {
                let fingerprint = self.own_fingerprint()?;
                self.info_lines(&format!("desc/id/{fingerprint}"))
                    .map(CachedValue::Lines)
            }
            Param::BwRate => {
                let mut rate = self.option_number("BandwidthRate")?;
                if let Some(relay_rate) = self.option_number("RelayBandwidthRate")
                    && relay_rate > 0
                {
                    rate = rate.min(relay_rate);
                }
                if let Some(advertised) = self.option_number("MaxAdvertisedBandwidth") {
                    rate = rate.min(advertised);
                }
                Some(CachedValue::Number(rate))
            }
            Param::BwBurst => {
                let mut burst = self.option_number("BandwidthBurst")?;
                if let Some(relay_burst) = self.option_number("RelayBandwidthBurst")
                    && relay_burst > 0
                {
                    burst = burst.min(relay_burst);
                }
                Some(CachedValue::Number(burst))
            }
            Param::BwObserved => {
                let descriptor = self.relay_lines(Param::DescEntry)?;
                let line = descriptor
                    .iter()
                    .find(|line| line.starts_with("bandwidth "))?;
                let observed = line.split_whitespace().last()?.parse().ok()?;
                Some(CachedValue::Number(observed))
            }
            Param::BwMeasured => {
                let entry = self.relay_lines(Param::NsEntry)?;
                weight_field(&entry, "Bandwidth").map(CachedValue::Number)
            }
            Param::Flags => {
                let entry = self.relay_lines(Param::NsEntry)?;
                let line = entry.iter().find(|line| line.starts_with("s "))?;
                let flags = line[2..].split_whitespace().map(str::to_string).collect();
                Some(CachedValue::Lines(flags))
            }
            Param::Pid => {
                let pid_file = self.get_option("PidFile").ok().flatten();
                process::find_pid(pid_file.as_deref().map(Path::new), &self.shared.process_name)
                    .map(|pid| CachedValue::Number(u64::from(pid)))
            }
            Param::StartTime => {
                let pid = match self.relay_attr(Param::Pid)? {
                    CachedValue::Number(pid) => u32::try_from(pid).ok()?,
                    _ => return None,
                };
                process::process_start_time(pid).map(CachedValue::Time)
            }
            Param::PathPrefix => {
                let shared = self.shared;
                let prefix = shared.session.path_prefix.trim_end_matches('/');
                if !prefix.is_empty() && !Path::new(prefix).exists() {
                    if !self.path_prefix_warned {
                        info!(prefix, "path prefix does not exist, ignoring it");
                        self.path_prefix_warned = true;
                    }
                    return Some(CachedValue::Text(String::new()));
                }
                Some(CachedValue::Text(prefix.to_string()))
            }
            Param::Authorities => {
                let mut entries = self.get_option_list("DirServer").unwrap_or_default();
                entries.extend(
                    self.get_option_list("AlternateDirAuthority")
                        .unwrap_or_default(),
                );

                let configured: Vec<(String, u16)> = entries
                    .iter()
                    .filter_map(|entry| authority_endpoint(entry))
                    .collect();
                let authorities = if configured.is_empty() {
                    DEFAULT_DIR_AUTHORITIES
                        .iter()
                        .map(|(address, port)| (address.to_string(), *port))
                        .collect()
                } else {
                    configured
                };
                Some(CachedValue::Endpoints(authorities))
            }
            // Plain GETINFO keys are cached by `get_info` itself.
            Param::Version
            | Param::ConfigFile
            | Param::ExitPolicyDefault
            | Param::Fingerprint
            | Param::ConfigNames
            | Param::InfoNames
            | Param::FeaturesNames
            | Param::EventsNames
            | Param::Address => None,
        }
    }

    fn network_status(&mut self, filter: Option<&str>) -> Result<Vec<RouterStatus>, ControlError> {
        let transport = self.live_transport()?;
        match transport.get_network_status(filter) {
            Ok(entries) => Ok(entries),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn resolve(&mut self, address: &str, port: Option<u16>) -> Result<Resolution, ControlError> {
        self.live_transport()?;
        let mut resolver = std::mem::take(&mut self.relays);
        let resolution = resolver.resolve(&mut SessionLookup(self), address, port);
        // A lookup that found the transport closed has already reset the
        // session, so keep the fresh resolver in that case.
        if self.transport.is_some() {
            self.relays = resolver;
        }
        Ok(resolution)
    }

    fn nickname(&mut self, fingerprint: &str) -> Option<String> {
        self.live_transport().ok()?;
        let mut resolver = std::mem::take(&mut self.relays);
        let nickname = resolver.nickname(&mut SessionLookup(self), fingerprint);
        if self.transport.is_some() {
            self.relays = resolver;
        }
        nickname
    }
}

/// Directory queries answered through the locked session.
struct SessionLookup<'s, 'a>(&'s mut Locked<'a>);

impl DirectoryLookup for SessionLookup<'_, '_> {
    fn own_address(&mut self) -> Option<String> {
        self.0.get_info("address").ok().flatten()
    }

    fn own_or_port(&mut self) -> Option<u16> {
        self.0.get_option("ORPort").ok().flatten()?.trim().parse().ok()
    }

    fn own_fingerprint(&mut self) -> Option<String> {
        self.0.own_fingerprint()
    }

    fn own_nickname(&mut self) -> String {
        self.0
            .get_option("Nickname")
            .ok()
            .flatten()
            .unwrap_or_else(|| "Unnamed".to_string())
    }

    fn network_status(&mut self) -> Vec<RouterStatus> {
        self.0.network_status(None).unwrap_or_default()
    }

    fn relay_status(&mut self, fingerprint: &str) -> Option<RouterStatus> {
        let mut entries = self.0.network_status(Some(&format!("id/{fingerprint}"))).ok()?;
        if entries.len() > 1 {
            warn!(fingerprint, "multiple consensus entries for fingerprint");
            return None;
        }
        entries.pop()
    }

    fn relay_descriptor(&mut self, fingerprint: &str) -> Option<String> {
        self.0.get_info(&format!("desc/id/{fingerprint}")).ok().flatten()
    }

    fn orconn_status(&mut self) -> Option<String> {
        self.0.get_info("orconn-status").ok().flatten()
    }

    fn circuit_status(&mut self) -> Option<String> {
        self.0.get_info("circuit-status").ok().flatten()
    }
}

impl Controller {
    fn relay_number(&self, param: Param) -> Option<u64> {
        match self.shared.lock().relay_attr(param)? {
            CachedValue::Number(value) => Some(value),
            _ => None,
        }
    }

    /// Our consensus entry, line by line.
    pub fn my_network_status(&self) -> Option<Vec<String>> {
        self.shared.lock().relay_lines(Param::NsEntry)
    }

    /// Our published descriptor, line by line.
    pub fn my_descriptor(&self) -> Option<Vec<String>> {
        self.shared.lock().relay_lines(Param::DescEntry)
    }

    /// Effective relaying rate in bytes per second.
    pub fn my_bandwidth_rate(&self) -> Option<u64> {
        self.relay_number(Param::BwRate)
    }

    pub fn my_bandwidth_burst(&self) -> Option<u64> {
        self.relay_number(Param::BwBurst)
    }

    /// Observed bandwidth from our descriptor. Grows stale if descriptors
    /// are not republished.
    pub fn my_bandwidth_observed(&self) -> Option<u64> {
        self.relay_number(Param::BwObserved)
    }

    /// Bandwidth the directory authorities measured for us.
    pub fn my_bandwidth_measured(&self) -> Option<u64> {
        self.relay_number(Param::BwMeasured)
    }

    /// Flags the consensus assigns us.
    pub fn my_flags(&self) -> Option<Vec<String>> {
        self.shared.lock().relay_lines(Param::Flags)
    }

    pub fn my_pid(&self) -> Option<u32> {
        self.relay_number(Param::Pid)
            .and_then(|pid| u32::try_from(pid).ok())
    }

    /// When the daemon process started.
    pub fn start_time(&self) -> Option<SystemTime> {
        match self.shared.lock().relay_attr(Param::StartTime)? {
            CachedValue::Time(started) => Some(started),
            _ => None,
        }
    }

    /// Prefix for the daemon's file paths, without a trailing slash.
    pub fn path_prefix(&self) -> String {
        match self.shared.lock().relay_attr(Param::PathPrefix) {
            Some(CachedValue::Text(prefix)) => prefix,
            _ => String::new(),
        }
    }

    /// Directory authorities the daemon uses, as `(address, dir_port)`.
    pub fn my_dir_authorities(&self) -> Vec<(String, u16)> {
        match self.shared.lock().relay_attr(Param::Authorities) {
            Some(CachedValue::Endpoints(authorities)) => authorities,
            _ => Vec::new(),
        }
    }

    /// Fingerprint of the relay at `address` (and `port`, if given), if it
    /// can be told apart from others sharing the address.
    pub fn relay_fingerprint(&self, address: &str, port: Option<u16>) -> Option<String> {
        match self.shared.lock().resolve(address, port) {
            Ok(Resolution::Found(fingerprint)) => Some(fingerprint),
            _ => None,
        }
    }

    /// Like [`relay_fingerprint`](Self::relay_fingerprint), reporting why
    /// resolution failed.
    pub fn try_relay_fingerprint(&self, address: &str, port: Option<u16>) -> Result<String, ControlError> {
        let target = match port {
            Some(port) => format!("{address}:{port}"),
            None => address.to_string(),
        };
        match self.shared.lock().resolve(address, port)? {
            Resolution::Found(fingerprint) => Ok(fingerprint),
            Resolution::NoMatch => Err(ControlError::UnknownRelay(target)),
            Resolution::Ambiguous(candidates) => Err(ControlError::AmbiguousIdentity {
                address: target,
                candidates,
            }),
        }
    }

    /// Nickname of the relay with `fingerprint`.
    pub fn relay_nickname(&self, fingerprint: &str) -> Option<String> {
        self.shared.lock().nickname(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_authority_endpoint() {
        assert_eq!(
            authority_endpoint("moria1 orport=9101 v3ident=D586D183 128.31.0.39:9131 9695DFC35FFEB861329B9F1AB04C46397020CE31"),
            Some(("128.31.0.39".to_string(), 9131))
        );
        assert_eq!(authority_endpoint("lonely"), None);
        assert_eq!(authority_endpoint("name host:port FP"), None);
    }

    #[test]
    fn test_weight_field() {
        let entry = lines("r relay AAAA BBBB 2024-01-01 00:00:00 198.51.100.1 9001 0\ns Fast Running\nw Bandwidth=4200 Measured=1".to_string());
        assert_eq!(weight_field(&entry, "Bandwidth"), Some(4200));
        assert_eq!(weight_field(&entry, "Unmeasured"), None);
    }
}
