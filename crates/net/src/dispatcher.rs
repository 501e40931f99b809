//! Translates inbound wire messages into registry mutations and outbound
//! replies, gated by which role (`SS` or `SL`) is running.
use crate::registry::{valid_location, AdmitError, SensorRegistry};
use crate::role::ServerRole;
use crate::wire::{code, err, Message};

/// What the reactor should do after handling one message from a sensor.
#[derive(Debug)]
pub enum SensorAction {
    /// Write this message back to the sensor that sent the request.
    Reply(Message),
    /// Write this message back, then close the sensor's socket.
    ReplyAndClose(Message),
    /// A malformed frame or validation failure on `REQ_CONNSEN`: close the
    /// socket after replying, per §4.3.
    RejectAndClose(Message),
    /// `REQ_SENSSTATUS` found `risk_flag == 1`: perform the bounded
    /// synchronous CHECKALERT round trip with the peer before the sensor
    /// gets a reply. Carries the sensor id to ask the peer about.
    CheckAlert { sensor_id: String },
    /// The message is well-formed but the dispatcher has nothing to say
    /// (unrecognized code on an established connection — logged and
    /// ignored per §4.4).
    Ignore,
}

/// Result of the bounded synchronous CHECKALERT round trip with the peer,
/// fed back into the dispatcher once the reactor has it.
pub enum CheckAlertResult {
    /// Peer answered with the sensor's location.
    Location(u8),
    /// Peer answered `ERROR(10)`: it doesn't know this sensor.
    SensorNotFound,
    /// The round trip itself failed (timeout, malformed reply, EOF) — no
    /// response goes to the sensor and the P2P session is torn down.
    TransportFailure,
}

/// Handle one message received from a sensor socket.
pub fn handle_sensor_message(
    role: ServerRole,
    registry: &mut SensorRegistry,
    fd: std::os::unix::io::RawFd,
    msg: &Message,
) -> SensorAction {
    match msg.code {
        code::REQ_CONNSEN => handle_connsen(registry, fd, &msg.payload),
        code::REQ_DISCSEN => handle_discsen(registry, fd, &msg.payload),
        code::REQ_SENSSTATUS if role.is_status() => {
            handle_sensstatus(registry, fd, &msg.payload)
        }
        code::REQ_SENSLOC if role.is_location() => handle_sensloc(registry, &msg.payload),
        code::REQ_LOCLIST if role.is_location() => handle_loclist(registry, &msg.payload),
        _ => SensorAction::Ignore,
    }
}

fn parse_connsen_payload(payload: &str) -> Option<(&str, u8)> {
    let (id, location) = payload.split_once(',')?;
    let location: u8 = location.trim().parse().ok()?;
    Some((id, location))
}

fn handle_connsen(
    registry: &mut SensorRegistry,
    fd: std::os::unix::io::RawFd,
    payload: &str,
) -> SensorAction {
    let Some((sensor_id, location)) = parse_connsen_payload(payload) else {
        return SensorAction::RejectAndClose(Message::error(err::INVALID_PAYLOAD));
    };

    match registry.admit(fd, sensor_id, location) {
        Ok(admission) => SensorAction::Reply(Message::new(
            code::RES_CONNSEN,
            admission.slot_number.to_string(),
        )),
        Err(AdmitError::InvalidPayload) => {
            SensorAction::RejectAndClose(Message::error(err::INVALID_PAYLOAD))
        }
        Err(AdmitError::AlreadyExists) => {
            SensorAction::RejectAndClose(Message::error(err::SENSOR_ID_ALREADY_EXISTS))
        }
        Err(AdmitError::LimitExceeded) => {
            SensorAction::Reply(Message::error(err::SENSOR_LIMIT_EXCEEDED))
        }
        Err(AdmitError::MismatchedReregistration) => {
            SensorAction::Reply(Message::error(err::INVALID_PAYLOAD))
        }
    }
}

fn handle_discsen(
    registry: &mut SensorRegistry,
    fd: std::os::unix::io::RawFd,
    payload: &str,
) -> SensorAction {
    let Ok(slot_number) = payload.trim().parse::<u8>() else {
        return SensorAction::Reply(Message::error(err::SENSOR_NOT_FOUND));
    };

    if registry.disconnect(fd, slot_number) {
        SensorAction::ReplyAndClose(Message::ok(crate::wire::ok::DISCONNECT))
    } else {
        SensorAction::Reply(Message::error(err::SENSOR_NOT_FOUND))
    }
}

/// `REQ_SENSSTATUS(<slot_number>)`: the requesting socket must own that
/// slot. A clear risk flag answers immediately with `-1`; a set risk flag
/// needs the peer's view of the sensor's location first, so the reactor is
/// told to run the CHECKALERT round trip before replying to the sensor.
fn handle_sensstatus(
    registry: &mut SensorRegistry,
    fd: std::os::unix::io::RawFd,
    payload: &str,
) -> SensorAction {
    let Ok(slot_number) = payload.trim().parse::<u8>() else {
        return SensorAction::Reply(Message::error(err::SENSOR_NOT_FOUND));
    };

    let Some(conn) = registry.connection(fd) else {
        return SensorAction::Reply(Message::error(err::SENSOR_NOT_FOUND));
    };
    if conn.slot_number() != Some(slot_number) {
        return SensorAction::Reply(Message::error(err::SENSOR_NOT_FOUND));
    }

    if conn.risk_flag() {
        SensorAction::CheckAlert {
            sensor_id: conn.sensor_id().to_string(),
        }
    } else {
        SensorAction::Reply(Message::new(code::RES_SENSSTATUS, "-1"))
    }
}

/// `REQ_SENSLOC(<sensor_id>)`: answer with any connected sensor's location,
/// not just the requester's own.
fn handle_sensloc(registry: &mut SensorRegistry, payload: &str) -> SensorAction {
    match registry.find_by_sensor_id(payload.trim()) {
        Some(conn) => SensorAction::Reply(Message::new(code::RES_SENSLOC, conn.location().to_string())),
        None => SensorAction::Reply(Message::error(err::SENSOR_NOT_FOUND)),
    }
}

/// `REQ_LOCLIST(<requester_slot>,<location>)`.
fn handle_loclist(registry: &mut SensorRegistry, payload: &str) -> SensorAction {
    let Some((_requester_slot, location)) = payload.split_once(',') else {
        return SensorAction::Reply(Message::error(err::INVALID_PAYLOAD));
    };
    let Ok(location) = location.trim().parse::<u8>() else {
        return SensorAction::Reply(Message::error(err::INVALID_PAYLOAD));
    };
    if !valid_location(location) {
        return SensorAction::Reply(Message::error(err::INVALID_PAYLOAD));
    }

    let ids = registry.sensor_ids_at_location(location);
    if ids.is_empty() {
        return SensorAction::Reply(Message::error(err::SENSOR_NOT_FOUND));
    }
    SensorAction::Reply(Message::new(code::RES_LOCLIST, ids.join(",")))
}

/// Handle a `REQ_CHECKALERT` arriving on the established P2P link. Only the
/// Location Server answers these.
pub fn handle_peer_checkalert_request(
    role: ServerRole,
    registry: &SensorRegistry,
    sensor_id: &str,
) -> Message {
    if !role.is_location() {
        return Message::error(err::INVALID_CODE);
    }

    match registry.find_by_sensor_id(sensor_id.trim()) {
        Some(conn) if conn.location() > 0 => {
            Message::new(code::RES_CHECKALERT, conn.location().to_string())
        }
        _ => Message::error(err::SENSOR_NOT_FOUND),
    }
}

/// Parse a `RES_CHECKALERT`/`ERROR` reply received during the synchronous
/// CHECKALERT round trip into the outcome the caller cares about.
pub fn interpret_checkalert_reply(msg: &Message) -> CheckAlertResult {
    match msg.code {
        code::RES_CHECKALERT => match msg.payload.trim().parse::<u8>() {
            Ok(location) if valid_location(location) => CheckAlertResult::Location(location),
            _ => CheckAlertResult::TransportFailure,
        },
        code::ERROR if msg.payload.trim() == err::SENSOR_NOT_FOUND => {
            CheckAlertResult::SensorNotFound
        }
        _ => CheckAlertResult::TransportFailure,
    }
}

/// Admin `set_risk <sensor_id> <0|1>`, STATUS role only. Returns whether a
/// matching registered sensor was found; a miss is silently noted by the
/// caller (§4.5), not surfaced as an error to anything.
pub fn set_risk(registry: &mut SensorRegistry, sensor_id: &str, flag: bool) -> bool {
    registry.set_risk(sensor_id, flag)
}
