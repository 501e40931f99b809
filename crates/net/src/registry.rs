//! The sensor registry: a fixed-capacity table of up to fifteen connected
//! sensors, keyed by the raw file descriptor of their socket.
//!
//! A connection is *occupied* the moment it's accepted, but it only becomes
//! a *registered* [`SensorSlot`] once it successfully completes `REQ_CONNSEN`
//! — until then it lives in the same map with no slot number assigned, so a
//! connection that never registers never consumes one of the fifteen slots.
use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::role::ServerRole;

pub const CAPACITY: usize = 15;
pub const SENSOR_ID_LEN: usize = 10;
pub const MIN_LOCATION: u8 = 1;
pub const MAX_LOCATION: u8 = 10;

pub fn valid_sensor_id(id: &str) -> bool {
    id.len() == SENSOR_ID_LEN && id.bytes().all(|b| b.is_ascii_digit())
}

pub fn valid_location(location: u8) -> bool {
    (MIN_LOCATION..=MAX_LOCATION).contains(&location)
}

/// A connection accepted on the client-listening endpoint.
///
/// Before `REQ_CONNSEN` succeeds, `slot_number` is `None` and the other
/// registration fields are meaningless; the entry is not yet a `SensorSlot`
/// in the sense of §3 and doesn't count against [`CAPACITY`].
pub struct Connection {
    pub stream: TcpStream,
    slot_number: Option<u8>,
    sensor_id: String,
    location: u8,
    risk_flag: bool,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            slot_number: None,
            sensor_id: String::new(),
            location: 0,
            risk_flag: false,
        }
    }

    /// `true` once this connection occupies a numbered slot.
    pub fn is_registered(&self) -> bool {
        self.slot_number.is_some()
    }

    pub fn slot_number(&self) -> Option<u8> {
        self.slot_number
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn location(&self) -> u8 {
        self.location
    }

    pub fn risk_flag(&self) -> bool {
        self.risk_flag
    }

    pub fn write_message(&mut self, msg: &crate::wire::Message) -> std::io::Result<()> {
        self.stream.write_all(&msg.encode())
    }
}

/// Rejection reasons for `REQ_CONNSEN`, mapped to wire error codes by the
/// dispatcher.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    /// Payload didn't parse as `<10-digit id>,<location 1..10>`.
    #[error("invalid REQ_CONNSEN payload")]
    InvalidPayload,
    /// A different, already-registered connection holds this sensor id.
    #[error("sensor id already registered")]
    AlreadyExists,
    /// All fifteen slots are already registered.
    #[error("sensor capacity exceeded")]
    LimitExceeded,
    /// This connection is already registered under a different sensor id.
    #[error("connection already registered under a different id")]
    MismatchedReregistration,
}

/// Outcome of a successful admission call, distinguishing a fresh
/// registration from an idempotent re-send of the same `REQ_CONNSEN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub slot_number: u8,
    pub is_fresh: bool,
}

/// Table of sensor connections, owned exclusively by the event loop.
pub struct SensorRegistry {
    role: ServerRole,
    connections: HashMap<RawFd, Connection>,
    slots_in_use: [bool; CAPACITY],
}

impl SensorRegistry {
    pub fn new(role: ServerRole) -> Self {
        Self {
            role,
            connections: HashMap::new(),
            slots_in_use: [false; CAPACITY],
        }
    }

    pub fn len_registered(&self) -> usize {
        self.slots_in_use.iter().filter(|used| **used).count()
    }

    /// Track a freshly-accepted, not-yet-registered connection.
    pub fn accept(&mut self, fd: RawFd, stream: TcpStream) {
        self.connections.insert(fd, Connection::new(stream));
    }

    pub fn connection_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        self.connections.get_mut(&fd)
    }

    pub fn connection(&self, fd: RawFd) -> Option<&Connection> {
        self.connections.get(&fd)
    }

    pub fn fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.connections.keys().copied()
    }

    /// Admit `fd` under `sensor_id`/`location`, per §4.3.
    ///
    /// Validation failures and a same-socket id mismatch leave the registry
    /// untouched; the caller decides whether to close the connection.
    pub fn admit(
        &mut self,
        fd: RawFd,
        sensor_id: &str,
        location: u8,
    ) -> Result<Admission, AdmitError> {
        if !valid_sensor_id(sensor_id) || !valid_location(location) {
            return Err(AdmitError::InvalidPayload);
        }

        if let Some(existing) = self.connections.get(&fd) {
            if let Some(slot_number) = existing.slot_number {
                return if existing.sensor_id == sensor_id {
                    Ok(Admission {
                        slot_number,
                        is_fresh: false,
                    })
                } else {
                    Err(AdmitError::MismatchedReregistration)
                };
            }
        } else {
            return Err(AdmitError::InvalidPayload);
        }

        if self
            .connections
            .values()
            .any(|c| c.is_registered() && c.sensor_id == sensor_id)
        {
            return Err(AdmitError::AlreadyExists);
        }

        let Some(free_index) = self.slots_in_use.iter().position(|used| !used) else {
            return Err(AdmitError::LimitExceeded);
        };

        self.slots_in_use[free_index] = true;
        let slot_number = (free_index + 1) as u8;

        let conn = self.connections.get_mut(&fd).expect("checked above");
        conn.slot_number = Some(slot_number);
        conn.sensor_id = sensor_id.to_string();
        conn.location = location;
        conn.risk_flag = false;

        Ok(Admission {
            slot_number,
            is_fresh: true,
        })
    }

    /// Handle `REQ_DISCSEN`: remove `fd` iff its registered slot number
    /// matches. Returns `true` on a match (the entry is removed and its
    /// socket closed by drop).
    pub fn disconnect(&mut self, fd: RawFd, slot_number: u8) -> bool {
        let matches = self
            .connections
            .get(&fd)
            .map(|c| c.slot_number == Some(slot_number))
            .unwrap_or(false);

        if matches {
            self.remove(fd);
        }
        matches
    }

    /// Drop a connection unconditionally: EOF, read error, or a successful
    /// disconnect. Frees the slot, if any, and closes the socket.
    pub fn remove(&mut self, fd: RawFd) {
        if let Some(conn) = self.connections.remove(&fd) {
            if let Some(slot_number) = conn.slot_number {
                self.slots_in_use[slot_number as usize - 1] = false;
            }
        }
    }

    pub fn find_by_sensor_id(&self, sensor_id: &str) -> Option<&Connection> {
        self.connections
            .values()
            .find(|c| c.is_registered() && c.sensor_id == sensor_id)
    }

    /// Update `risk_flag` for a registered sensor. STATUS role only; a
    /// no-op (returning `false`) if the sensor isn't registered here.
    pub fn set_risk(&mut self, sensor_id: &str, flag: bool) -> bool {
        debug_assert!(self.role.is_status(), "risk flag is STATUS-role state");
        match self
            .connections
            .values_mut()
            .find(|c| c.is_registered() && c.sensor_id == sensor_id)
        {
            Some(conn) => {
                conn.risk_flag = flag;
                true
            }
            None => false,
        }
    }

    /// Sensor ids registered at `location`, ordered by ascending slot number.
    pub fn sensor_ids_at_location(&self, location: u8) -> Vec<String> {
        let mut hits: Vec<(u8, String)> = self
            .connections
            .values()
            .filter(|c| c.is_registered() && c.location == location)
            .map(|c| (c.slot_number.unwrap(), c.sensor_id.clone()))
            .collect();

        hits.sort_by_key(|(slot, _)| *slot);
        hits.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn registry_with_connection(role: ServerRole) -> (SensorRegistry, RawFd, TcpStream) {
        let mut registry = SensorRegistry::new(role);
        let (keep_alive, accepted) = loopback_pair();
        let fd = accepted.as_raw_fd();
        registry.accept(fd, accepted);
        (registry, fd, keep_alive)
    }

    #[test]
    fn admits_a_valid_sensor() {
        let (mut registry, fd, _keep) = registry_with_connection(ServerRole::Status);
        let admission = registry.admit(fd, "1234567890", 3).unwrap();
        assert!(admission.is_fresh);
        assert!((1..=15).contains(&admission.slot_number));
        assert_eq!(registry.len_registered(), 1);
    }

    #[test]
    fn rejects_invalid_payload_without_mutating() {
        let (mut registry, fd, _keep) = registry_with_connection(ServerRole::Status);
        let err = registry.admit(fd, "12345", 3).unwrap_err();
        assert_eq!(err, AdmitError::InvalidPayload);
        assert_eq!(registry.len_registered(), 0);
    }

    #[test]
    fn rejects_duplicate_sensor_id() {
        let (mut registry, fd_a, _keep_a) = registry_with_connection(ServerRole::Status);
        registry.admit(fd_a, "1234567890", 3).unwrap();

        let (keep_b, accepted_b) = loopback_pair();
        let fd_b = accepted_b.as_raw_fd();
        registry.accept(fd_b, accepted_b);

        let err = registry.admit(fd_b, "1234567890", 4).unwrap_err();
        assert_eq!(err, AdmitError::AlreadyExists);
        assert_eq!(registry.len_registered(), 1);
        drop(keep_b);
    }

    #[test]
    fn reregistration_with_same_id_is_idempotent() {
        let (mut registry, fd, _keep) = registry_with_connection(ServerRole::Status);
        let first = registry.admit(fd, "1234567890", 3).unwrap();
        let second = registry.admit(fd, "1234567890", 3).unwrap();
        assert_eq!(first.slot_number, second.slot_number);
        assert!(!second.is_fresh);
        assert_eq!(registry.len_registered(), 1);
    }

    #[test]
    fn reregistration_with_different_id_is_rejected_without_mutation() {
        let (mut registry, fd, _keep) = registry_with_connection(ServerRole::Status);
        registry.admit(fd, "1234567890", 3).unwrap();
        let err = registry.admit(fd, "9999999999", 3).unwrap_err();
        assert_eq!(err, AdmitError::MismatchedReregistration);
        assert_eq!(
            registry.connection(fd).unwrap().sensor_id(),
            "1234567890"
        );
    }

    #[test]
    fn enforces_capacity() {
        let mut registry = SensorRegistry::new(ServerRole::Status);
        let mut keep_alive = Vec::new();

        for i in 0..CAPACITY {
            let (keep, accepted) = loopback_pair();
            let fd = accepted.as_raw_fd();
            registry.accept(fd, accepted);
            let id = format!("{:010}", i);
            registry.admit(fd, &id, 1).unwrap();
            keep_alive.push(keep);
        }

        let (keep, accepted) = loopback_pair();
        let fd = accepted.as_raw_fd();
        registry.accept(fd, accepted);
        let err = registry.admit(fd, "9999999999", 1).unwrap_err();
        assert_eq!(err, AdmitError::LimitExceeded);
        assert_eq!(registry.len_registered(), CAPACITY);
        keep_alive.push(keep);
    }

    #[test]
    fn disconnect_requires_matching_slot() {
        let (mut registry, fd, _keep) = registry_with_connection(ServerRole::Status);
        let admission = registry.admit(fd, "1234567890", 3).unwrap();

        assert!(!registry.disconnect(fd, admission.slot_number + 1));
        assert_eq!(registry.len_registered(), 1);

        assert!(registry.disconnect(fd, admission.slot_number));
        assert_eq!(registry.len_registered(), 0);
        assert!(registry.connection(fd).is_none());
    }

    #[test]
    fn reuses_freed_slot_numbers() {
        let (mut registry, fd_a, _keep_a) = registry_with_connection(ServerRole::Status);
        let first = registry.admit(fd_a, "1111111111", 1).unwrap();
        registry.remove(fd_a);

        let (mut keep_b, accepted_b) = loopback_pair();
        let fd_b = accepted_b.as_raw_fd();
        registry.accept(fd_b, accepted_b);
        let second = registry.admit(fd_b, "2222222222", 1).unwrap();

        assert_eq!(first.slot_number, second.slot_number);
        let _ = keep_b.write(b"noop");
    }

    #[test]
    fn sensor_ids_at_location_are_ordered_by_slot() {
        let mut registry = SensorRegistry::new(ServerRole::Location);
        let mut keep_alive = Vec::new();

        for (id, location) in [("1111111111", 5), ("2222222222", 5), ("3333333333", 7)] {
            let (keep, accepted) = loopback_pair();
            let fd = accepted.as_raw_fd();
            registry.accept(fd, accepted);
            registry.admit(fd, id, location).unwrap();
            keep_alive.push(keep);
        }

        assert_eq!(
            registry.sensor_ids_at_location(5),
            vec!["1111111111".to_string(), "2222222222".to_string()]
        );
        assert_eq!(registry.sensor_ids_at_location(9), Vec::<String>::new());
    }
}
