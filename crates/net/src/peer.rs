//! The peer-to-peer session: the single link between the Status Server and
//! the Location Server, including the startup race and its handshake.
//!
//! At most one session is ever live. At startup a server tries to dial its
//! peer; if that succeeds it is the **active** side and opens the
//! handshake. If the dial fails (the peer isn't listening yet) it falls
//! back to listening and becomes the **passive** side, waiting to accept.
use thiserror::Error;

use crate::wire::{code, Message};

/// An opaque per-session identifier one side assigns to name the other,
/// generated fresh each time a session is negotiated.
pub type Pid = u32;

/// Where the single P2P session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No socket, no listener armed yet (only true before startup runs).
    Disconnected,
    /// Listening for an inbound peer connection; no socket yet.
    PassiveListening,
    /// Active side: dialed out, sent `REQ_CONNPEER`, awaiting the reply.
    ReqSent,
    /// Passive side: accepted, received `REQ_CONNPEER`, replied, awaiting
    /// the final `RES_CONNPEER`.
    ResSentAwaitingRes,
    /// Handshake complete.
    FullyEstablished,
    /// This side sent `REQ_DISCPEER` and is waiting for `OK`/`ERROR`.
    DisconnectReqSent,
}

/// Instruction for the reactor.
#[derive(Debug)]
pub enum PeerAction {
    /// Send this message on the P2P socket.
    Send(Message),
    /// Handshake just completed.
    Established,
    /// The peer confirmed our `REQ_DISCPEER`: log, then terminate the
    /// process (§4.2 — the initiator exits on a matched disconnect).
    PeerConfirmedDisconnect,
    /// The peer rejected our `REQ_DISCPEER` (pid mismatch): stay established? —
    /// no: the initiator closes its side and keeps running, falling back
    /// to the startup race.
    PeerRejectedDisconnect,
    /// Tear the session down (parse failure, EOF, unexpected message) and
    /// re-arm the passive listener.
    TearDown,
    /// We matched an incoming `REQ_DISCPEER`: send this `OK`, then close the
    /// session and re-arm the passive listener (§4.2 — the receiver, not
    /// just the initiator, drops the link on a confirmed disconnect).
    AckDisconnectAndTearDown(Message),
    /// Message handled, nothing further to do.
    Handled,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed pid in handshake payload")]
    MalformedPid,
}

/// Owns the one allowed P2P session and its handshake bookkeeping.
pub struct PeerSessionManager {
    state: PeerState,
    /// Pid we assigned to identify the peer; sent as the `REQ_DISCPEER`
    /// payload when we initiate a disconnect.
    local_pid_for_peer: Option<Pid>,
    /// Pid the peer told us it uses to identify us; compared against an
    /// incoming `REQ_DISCPEER` payload.
    peer_pid_for_local: Option<Pid>,
    next_pid: Pid,
}

impl Default for PeerSessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSessionManager {
    pub fn new() -> Self {
        Self {
            state: PeerState::Disconnected,
            local_pid_for_peer: None,
            peer_pid_for_local: None,
            next_pid: 1,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == PeerState::FullyEstablished
    }

    fn fresh_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid = self.next_pid.wrapping_add(1).max(1);
        pid
    }

    /// Called once the active-side dial has been confirmed as connected.
    /// Returns the `REQ_CONNPEER` message to send.
    pub fn on_active_connect(&mut self) -> Message {
        self.state = PeerState::ReqSent;
        Message::code_only(code::REQ_CONNPEER)
    }

    /// Called when the dial failed and this side falls back to listening.
    pub fn on_dial_failed(&mut self) {
        self.state = PeerState::PassiveListening;
    }

    /// Called once the passive listener accepts an inbound connection.
    pub fn on_accepted(&mut self) {
        self.state = PeerState::PassiveListening;
    }

    /// Re-arm the passive listener after any teardown.
    pub fn rearm_listener(&mut self) {
        self.state = PeerState::PassiveListening;
        self.local_pid_for_peer = None;
        self.peer_pid_for_local = None;
    }

    /// Drive the handshake/session state machine for one inbound message.
    pub fn on_message(&mut self, msg: &Message) -> Result<PeerAction, HandshakeError> {
        match msg.code {
            code::REQ_CONNPEER => self.on_req_connpeer(),
            code::RES_CONNPEER => self.on_res_connpeer(msg),
            code::REQ_DISCPEER => Ok(self.on_req_discpeer(msg)),
            code::OK if self.state == PeerState::DisconnectReqSent => {
                Ok(PeerAction::PeerConfirmedDisconnect)
            }
            code::ERROR if self.state == PeerState::DisconnectReqSent => {
                Ok(PeerAction::PeerRejectedDisconnect)
            }
            _ => {
                // Unexpected message for the current state: logged by the
                // caller and otherwise ignored, per §4.2.
                Ok(PeerAction::Handled)
            }
        }
    }

    fn on_req_connpeer(&mut self) -> Result<PeerAction, HandshakeError> {
        match self.state {
            PeerState::PassiveListening => {
                let pid_for_peer = self.fresh_pid();
                self.local_pid_for_peer = Some(pid_for_peer);
                self.state = PeerState::ResSentAwaitingRes;
                Ok(PeerAction::Send(Message::new(
                    code::RES_CONNPEER,
                    pid_for_peer.to_string(),
                )))
            }
            _ => Ok(PeerAction::Handled),
        }
    }

    fn on_res_connpeer(&mut self, msg: &Message) -> Result<PeerAction, HandshakeError> {
        let pid: Pid = msg
            .payload
            .trim()
            .parse()
            .map_err(|_| HandshakeError::MalformedPid)?;

        match self.state {
            PeerState::ReqSent => {
                self.peer_pid_for_local = Some(pid);
                let pid_for_peer = self.fresh_pid();
                self.local_pid_for_peer = Some(pid_for_peer);
                self.state = PeerState::FullyEstablished;
                Ok(PeerAction::Send(Message::new(
                    code::RES_CONNPEER,
                    pid_for_peer.to_string(),
                )))
            }
            PeerState::ResSentAwaitingRes => {
                self.peer_pid_for_local = Some(pid);
                self.state = PeerState::FullyEstablished;
                Ok(PeerAction::Established)
            }
            _ => Ok(PeerAction::Handled),
        }
    }

    fn on_req_discpeer(&mut self, msg: &Message) -> PeerAction {
        if self.state != PeerState::FullyEstablished {
            return PeerAction::Handled;
        }

        let Ok(claimed_pid) = msg.payload.trim().parse::<Pid>() else {
            return PeerAction::Send(Message::error(crate::wire::err::INVALID_PAYLOAD));
        };

        if self.peer_pid_for_local == Some(claimed_pid) {
            PeerAction::AckDisconnectAndTearDown(Message::ok(crate::wire::ok::DISCONNECT))
        } else {
            PeerAction::Send(Message::error(crate::wire::err::PEER_NOT_FOUND))
        }
    }

    /// Begin an admin-initiated disconnect. Returns the `REQ_DISCPEER`
    /// message to send, or `None` if there's no established session.
    pub fn begin_disconnect(&mut self) -> Option<Message> {
        if self.state != PeerState::FullyEstablished {
            return None;
        }
        let pid = self.local_pid_for_peer?;
        self.state = PeerState::DisconnectReqSent;
        Some(Message::new(code::REQ_DISCPEER, pid.to_string()))
    }
}
