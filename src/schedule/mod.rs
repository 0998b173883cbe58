pub mod sync;

use std::cmp::Ordering;
use std::net::IpAddr;

use chrono::{DateTime, Utc};

/// Lifecycle state of a schedule entry, as stored in the schedule store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Handed to this agent, measurement not yet reported.
    AgentScheduled,
    /// Measurement reported; terminal for this agent.
    AgentCompleted,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentScheduled => "agent_scheduled",
            Self::AgentCompleted => "agent_completed",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "agent_scheduled" => Some(Self::AgentScheduled),
            "agent_completed" => Some(Self::AgentCompleted),
            _ => None,
        }
    }
}

/// One row of the measurement schedule, as read from the store.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    /// Unique key correlating the row to its eventual probe result.
    pub identifier: u64,
    /// Source address the probe must originate from.
    pub source: IpAddr,
    /// DSCP/TOS byte for the probe packets.
    pub traffic_class: u8,
    /// Address to probe.
    pub destination: IpAddr,
    pub state: EntryState,
    pub last_change: DateTime<Utc>,
    /// Authoritative probe send time, set when completion is reported.
    pub measured_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    /// The in-memory destination handed to a measurement service.
    pub fn destination_for_dispatch(&self) -> Destination {
        Destination {
            address: self.destination,
            traffic_class: self.traffic_class,
            identifier: self.identifier,
        }
    }
}

/// A probe target queued inside a measurement service.
///
/// Equality and ordering cover `(address, traffic_class)` only; the
/// identifier rides along for correlation and never affects dedup.
#[derive(Debug, Clone, Copy)]
pub struct Destination {
    pub address: IpAddr,
    pub traffic_class: u8,
    pub identifier: u64,
}

impl PartialEq for Destination {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.traffic_class == other.traffic_class
    }
}

impl Eq for Destination {}

impl PartialOrd for Destination {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Destination {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.address, self.traffic_class).cmp(&(other.address, other.traffic_class))
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:#04x}", self.address, self.traffic_class)
    }
}
