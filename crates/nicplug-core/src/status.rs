//! Observed interface status and multi-source confirmation.
//!
//! Three subsystems report on a live interface independently and in any
//! order. Confirmation is kept as a set of source tags per interface and only
//! ever grows within an attachment episode; a report from one source never
//! clears what another source established.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A subsystem able to confirm an interface's live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InfoSource {
    /// The hypervisor domain definition.
    Domain,
    /// The agent running inside the guest.
    GuestAgent,
    /// The network attachment backend's status annotation.
    AttachmentStatus,
}

impl InfoSource {
    pub const ALL: [InfoSource; 3] = [Self::Domain, Self::GuestAgent, Self::AttachmentStatus];
}

impl std::fmt::Display for InfoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain => write!(f, "domain"),
            Self::GuestAgent => write!(f, "guest-agent"),
            Self::AttachmentStatus => write!(f, "attachment-status"),
        }
    }
}

/// Set of sources that have confirmed an interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InfoSources(BTreeSet<InfoSource>);

impl InfoSources {
    pub fn new(sources: impl IntoIterator<Item = InfoSource>) -> Self {
        Self(sources.into_iter().collect())
    }

    /// All three sources.
    pub fn all() -> Self {
        Self::new(InfoSource::ALL)
    }

    pub fn insert(&mut self, source: InfoSource) -> bool {
        self.0.insert(source)
    }

    pub fn remove(&mut self, source: InfoSource) -> bool {
        self.0.remove(&source)
    }

    pub fn contains(&self, source: InfoSource) -> bool {
        self.0.contains(&source)
    }

    pub fn is_superset(&self, required: &InfoSources) -> bool {
        self.0.is_superset(&required.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for InfoSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// One interface as reported on a running instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedInterfaceStatus {
    /// Matches the interface/network name in the spec.
    pub name: String,
    /// Guest-visible device name, e.g. "eth1".
    #[serde(default)]
    pub interface_name: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub info_source: InfoSources,
    #[serde(default)]
    pub queue_count: u32,
}

impl ObservedInterfaceStatus {
    /// Copy with the MAC cleared, for identity comparisons.
    pub fn without_mac(&self) -> Self {
        Self {
            mac: String::new(),
            ..self.clone()
        }
    }

    pub fn is_fully_reported(&self, required: &InfoSources) -> bool {
        self.info_source.is_superset(required)
    }
}

/// A single source's view of one interface.
///
/// Empty or missing fields mean "this source does not know", not "clear it".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub source: InfoSource,
    pub name: String,
    pub interface_name: Option<String>,
    pub mac: Option<String>,
    pub queue_count: Option<u32>,
}

impl SourceReport {
    pub fn new(source: InfoSource, name: &str) -> Self {
        Self {
            source,
            name: name.to_string(),
            interface_name: None,
            mac: None,
            queue_count: None,
        }
    }

    pub fn interface_name(mut self, dev: &str) -> Self {
        self.interface_name = Some(dev.to_string());
        self
    }

    pub fn mac(mut self, mac: &str) -> Self {
        self.mac = Some(mac.to_string());
        self
    }

    pub fn queue_count(mut self, n: u32) -> Self {
        self.queue_count = Some(n);
        self
    }
}

/// Merge a source report into a status list.
///
/// Adds the source tag and fills in any non-empty fields the report
/// carries. Creates the entry on first report.
pub fn merge_report(statuses: &mut Vec<ObservedInterfaceStatus>, report: &SourceReport) {
    let idx = match statuses.iter().position(|s| s.name == report.name) {
        Some(idx) => idx,
        None => {
            statuses.push(ObservedInterfaceStatus {
                name: report.name.clone(),
                ..Default::default()
            });
            statuses.len() - 1
        }
    };
    let entry = &mut statuses[idx];
    entry.info_source.insert(report.source);
    if let Some(dev) = report.interface_name.as_deref().filter(|d| !d.is_empty()) {
        entry.interface_name = dev.to_string();
    }
    if let Some(mac) = report.mac.as_deref().filter(|m| !m.is_empty()) {
        entry.mac = mac.to_string();
    }
    if let Some(q) = report.queue_count.filter(|q| *q > 0) {
        entry.queue_count = q;
    }
}

/// A source stops reporting an interface (device gone from its view).
///
/// When the last source withdraws the entry is dropped: an interface
/// nobody confirms does not exist.
pub fn withdraw_source(statuses: &mut Vec<ObservedInterfaceStatus>, name: &str, source: InfoSource) {
    if let Some(entry) = statuses.iter_mut().find(|s| s.name == name) {
        entry.info_source.remove(source);
    }
    statuses.retain(|s| !s.info_source.is_empty());
}

pub fn lookup_status<'a>(
    statuses: &'a [ObservedInterfaceStatus],
    name: &str,
) -> Option<&'a ObservedInterfaceStatus> {
    statuses.iter().find(|s| s.name == name)
}
