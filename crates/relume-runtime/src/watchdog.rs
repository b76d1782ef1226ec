//! [`Watchdog`] – tick-driven component health monitor.
//!
//! Both loops own a watchdog and advance it by their own period, so timeouts
//! are measured in loop time and behave identically under test.  A component
//! is *timed out* once the time since its last heartbeat exceeds its
//! deadline.

use std::collections::BTreeMap;
use std::time::Duration;

/// Health state reported for a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Healthy,
    TimedOut,
}

#[derive(Debug)]
struct ComponentEntry {
    since_heartbeat: Duration,
    timeout: Duration,
}

impl ComponentEntry {
    fn health(&self) -> ComponentHealth {
        if self.since_heartbeat <= self.timeout {
            ComponentHealth::Healthy
        } else {
            ComponentHealth::TimedOut
        }
    }
}

/// Tracks heartbeats from registered components.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use relume_runtime::watchdog::{ComponentHealth, Watchdog};
///
/// let mut wd = Watchdog::new();
/// wd.register("host_commands", Duration::from_millis(500));
/// wd.advance(Duration::from_millis(400));
/// assert_eq!(wd.health("host_commands"), ComponentHealth::Healthy);
/// wd.advance(Duration::from_millis(200));
/// assert_eq!(wd.health("host_commands"), ComponentHealth::TimedOut);
/// ```
#[derive(Debug, Default)]
pub struct Watchdog {
    components: BTreeMap<String, ComponentEntry>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `component_id` with a heartbeat `timeout`.  Re-registering
    /// resets the deadline.
    pub fn register(&mut self, component_id: &str, timeout: Duration) {
        self.components.insert(
            component_id.to_string(),
            ComponentEntry {
                since_heartbeat: Duration::ZERO,
                timeout,
            },
        );
    }

    /// Record a heartbeat.  No-op for unregistered components.
    pub fn heartbeat(&mut self, component_id: &str) {
        if let Some(entry) = self.components.get_mut(component_id) {
            entry.since_heartbeat = Duration::ZERO;
        }
    }

    /// Let `dt` of loop time pass for every component.
    pub fn advance(&mut self, dt: Duration) {
        for entry in self.components.values_mut() {
            entry.since_heartbeat = entry.since_heartbeat.saturating_add(dt);
        }
    }

    /// Unknown components report [`ComponentHealth::TimedOut`].
    pub fn health(&self, component_id: &str) -> ComponentHealth {
        self.components
            .get(component_id)
            .map_or(ComponentHealth::TimedOut, ComponentEntry::health)
    }

    /// Time since the last heartbeat, for registered components.
    pub fn silence(&self, component_id: &str) -> Option<Duration> {
        self.components.get(component_id).map(|e| e.since_heartbeat)
    }

    /// IDs of every timed-out component, in name order.
    pub fn check_all(&self) -> Vec<String> {
        self.components
            .iter()
            .filter(|(_, entry)| entry.health() == ComponentHealth::TimedOut)
            .map(|(id, _)| id.clone())
            .collect()
    }
}
