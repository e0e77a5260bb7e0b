//! Session-scoped caches for GETINFO-style parameters and GETCONF results.
//!
//! A parameter is either absent (never fetched, or invalidated), known to be
//! unavailable ([`Slot::Unknown`]), or cached. Caching "unknown" keeps a
//! permanently missing value from being queried again. Both caches are wiped
//! whenever the session attaches, detaches, or reloads.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

/// The closed set of cacheable parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    Version,
    ConfigFile,
    ExitPolicyDefault,
    Fingerprint,
    ConfigNames,
    InfoNames,
    FeaturesNames,
    EventsNames,
    Address,
    NsEntry,
    DescEntry,
    BwRate,
    BwBurst,
    BwObserved,
    BwMeasured,
    Flags,
    Pid,
    PathPrefix,
    StartTime,
    Authorities,
}

impl Param {
    /// Map a GETINFO key onto its cache slot, if that key is cacheable.
    pub fn from_info_key(key: &str) -> Option<Self> {
        let param = match key {
            "version" => Param::Version,
            "config-file" => Param::ConfigFile,
            "exit-policy/default" => Param::ExitPolicyDefault,
            "fingerprint" => Param::Fingerprint,
            "config/names" => Param::ConfigNames,
            "info/names" => Param::InfoNames,
            "features/names" => Param::FeaturesNames,
            "events/names" => Param::EventsNames,
            "address" => Param::Address,
            _ => return None,
        };
        Some(param)
    }
}

/// A cached parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Text(String),
    Lines(Vec<String>),
    Number(u64),
    Time(SystemTime),
    Endpoints(Vec<(String, u16)>),
}

/// State of a populated cache entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// Queried and confirmed unavailable.
    Unknown,
    Value(CachedValue),
}

/// Cache of GETINFO responses and derived relay attributes.
#[derive(Debug, Default)]
pub struct ParamCache {
    entries: HashMap<Param, Slot>,
}

impl ParamCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, param: Param) -> Option<&Slot> {
        self.entries.get(&param)
    }

    /// Store `value`, or [`Slot::Unknown`] when there is none.
    pub fn store(&mut self, param: Param, value: Option<CachedValue>) {
        let slot = value.map_or(Slot::Unknown, Slot::Value);
        self.entries.insert(param, slot);
    }

    pub fn evict(&mut self, params: &[Param]) {
        for param in params {
            self.entries.remove(param);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached text value, if the slot holds one.
    pub fn text(&self, param: Param) -> Option<&str> {
        match self.entries.get(&param) {
            Some(Slot::Value(CachedValue::Text(text))) => Some(text),
            _ => None,
        }
    }
}

/// How a GETCONF reply is presented to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionShape {
    /// First value only.
    Single,
    /// Every value of the requested option.
    List,
    /// Every returned key with its values.
    Map,
}

impl OptionShape {
    pub const ALL: [OptionShape; 3] = [OptionShape::Single, OptionShape::List, OptionShape::Map];
}

/// A GETCONF reply in one of the [`OptionShape`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Single(String),
    List(Vec<String>),
    Map(BTreeMap<String, Vec<String>>),
}

impl OptionValue {
    /// Shape a raw GETCONF reply. Returns `None` if it holds no values.
    pub fn from_reply(shape: OptionShape, reply: Vec<(String, Option<String>)>) -> Option<Self> {
        match shape {
            OptionShape::Single => reply
                .into_iter()
                .next()
                .and_then(|(_, value)| value)
                .map(OptionValue::Single),
            OptionShape::List => {
                let values: Vec<String> = reply.into_iter().filter_map(|(_, v)| v).collect();
                (!values.is_empty()).then_some(OptionValue::List(values))
            }
            OptionShape::Map => {
                let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for (key, value) in reply {
                    if let Some(value) = value {
                        map.entry(key).or_default().push(value);
                    }
                }
                (!map.is_empty()).then_some(OptionValue::Map(map))
            }
        }
    }
}

/// Cache of GETCONF results keyed by `(lowercased option, shape)`.
///
/// A key is only present after a successful query. `None` records a
/// successful query that returned nothing.
#[derive(Debug, Default)]
pub struct OptionCache {
    entries: HashMap<(String, OptionShape), Option<OptionValue>>,
}

impl OptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, option: &str, shape: OptionShape) -> Option<&Option<OptionValue>> {
        self.entries.get(&(option.to_ascii_lowercase(), shape))
    }

    pub fn store(&mut self, option: &str, shape: OptionShape, value: Option<OptionValue>) {
        self.entries.insert((option.to_ascii_lowercase(), shape), value);
    }

    /// Drop every shape cached for `option`.
    pub fn evict(&mut self, option: &str) {
        let option = option.to_ascii_lowercase();
        for shape in OptionShape::ALL {
            self.entries.remove(&(option.clone(), shape));
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
