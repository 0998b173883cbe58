pub mod traceroute;
pub mod udp;

use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::schedule::Destination;

/// One hop probe emitted by a measurement worker.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Source address the probe left from.
    pub source: IpAddr,
    pub destination: Destination,
    /// Zero-based probe round.
    pub round: u32,
    /// TTL of the hop probe, starting at 1.
    pub hop: u8,
    /// Timestamp captured immediately before the packet send.
    pub send_time: DateTime<Utc>,
}

/// Callback invoked by a measurement worker once per hop probe.
///
/// Runs on the worker's own thread; it must not block or perform I/O.
pub type ResultHandler = Box<dyn Fn(ProbeResult) + Send + Sync>;

/// A long-running measurement worker bound to one source address.
pub trait ProbeService: Send + Sync {
    /// Source address this service probes from.
    fn source(&self) -> IpAddr;

    /// Register the result callback. Must be called before `start`.
    fn set_result_handler(&mut self, handler: ResultHandler);

    /// Spawn the worker. Fails if the probing socket cannot be set up.
    fn start(&mut self) -> Result<()>;

    /// Queue a destination for probing.
    ///
    /// Returns false when an equal destination (by address and traffic
    /// class) is already pending, or when a stop has been requested.
    fn add_destination(&self, destination: Destination) -> bool;

    /// Ask the worker to refuse new work and finish what is queued.
    fn request_stop(&self);

    /// Whether the worker has finished and can be joined without blocking.
    fn joinable(&self) -> bool;

    /// Join the finished worker thread.
    fn join(&self) -> Result<()>;
}

/// Owns one measurement service per configured source address.
///
/// Built mutably during agent startup, then shared read-only with the
/// synchronizer; services take new work through `&self`.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<IpAddr, Box<dyn ProbeService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: Box<dyn ProbeService>) {
        self.services.insert(service.source(), service);
    }

    pub fn get(&self, source: &IpAddr) -> Option<&dyn ProbeService> {
        self.services.get(source).map(Box::as_ref)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn ProbeService> {
        self.services.values().map(Box::as_ref)
    }

    /// Ask every service to stop accepting work and drain.
    pub fn request_stop_all(&self) {
        for service in self.iter() {
            service.request_stop();
        }
    }

    /// Whether every worker has finished its in-flight work.
    pub fn all_joinable(&self) -> bool {
        self.iter().all(|service| service.joinable())
    }

    /// Join every worker thread. Errors are collected, not short-circuited,
    /// so one wedged worker cannot leak the others.
    pub fn join_all(&self) -> Result<()> {
        let mut first_err = None;

        for service in self.iter() {
            if let Err(err) = service.join() {
                tracing::error!(source = %service.source(), error = %err, "joining worker");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
