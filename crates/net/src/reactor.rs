//! The event loop: a single-threaded `popol` reactor multiplexing the
//! sensor listener, the P2P listener, the P2P session (when present), and
//! every accepted sensor socket, plus admin commands delivered over a
//! channel from the stdin-reading thread.
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use tracing::{info, warn};

use crate::admin::AdminCommand;
use crate::config::ServerConfig;
use crate::dispatcher::{self, CheckAlertResult, SensorAction};
use crate::error::Error;
use crate::peer::{PeerAction, PeerSessionManager};
use crate::registry::SensorRegistry;
use crate::wire::{code, LineDecoder, Message};

/// Keys identifying every I/O source the reactor multiplexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Source {
    SensorListener,
    P2pListener,
    Peer,
    Sensor(RawFd),
}

/// Outcome of running the event loop to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Admin `exit`, or EOF on standard input.
    AdminExit,
    /// The peer confirmed our `REQ_DISCPEER` (§4.2: the initiator exits).
    PeerDisconnectConfirmed,
}

/// The readiness bits of a `popol::Event` copied out before the borrow on
/// `events` ends, so the reactor can mutate `self` while handling them.
#[derive(Debug, Clone, Copy)]
struct EventFlags {
    readable: bool,
    hangup: bool,
    error: bool,
    invalid: bool,
}

impl From<&popol::Event> for EventFlags {
    fn from(event: &popol::Event) -> Self {
        Self {
            readable: event.is_readable(),
            hangup: event.is_hangup(),
            error: event.is_error(),
            invalid: event.is_invalid(),
        }
    }
}

impl EventFlags {
    fn is_terminal(&self) -> bool {
        self.hangup || self.error || self.invalid
    }
}

/// Owns every piece of mutable state the event loop touches.
pub struct Server {
    config: ServerConfig,
    registry: SensorRegistry,
    peers: PeerSessionManager,
    sensor_listener: TcpListener,
    p2p_listener: TcpListener,
    peer_socket: Option<TcpStream>,
    peer_decoder: LineDecoder,
    sources: popol::Sources<Source>,
    sensor_decoders: std::collections::HashMap<RawFd, LineDecoder>,
    admin_rx: flume::Receiver<AdminCommand>,
    exit: Option<ExitReason>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        admin_rx: flume::Receiver<AdminCommand>,
    ) -> Result<Self, Error> {
        let sensor_listener =
            TcpListener::bind(config.client_listen_addr).map_err(|source| Error::Bind {
                addr: config.client_listen_addr,
                source,
            })?;
        sensor_listener.set_nonblocking(true)?;

        let p2p_listener =
            TcpListener::bind(config.p2p_listen_addr).map_err(|source| Error::Bind {
                addr: config.p2p_listen_addr,
                source,
            })?;
        p2p_listener.set_nonblocking(true)?;

        let mut sources = popol::Sources::new();
        sources.register(Source::SensorListener, &sensor_listener, popol::interest::READ);

        let role = config.role;
        let mut server = Self {
            config,
            registry: SensorRegistry::new(role),
            peers: PeerSessionManager::new(),
            sensor_listener,
            p2p_listener,
            peer_socket: None,
            peer_decoder: LineDecoder::new(),
            sources,
            sensor_decoders: std::collections::HashMap::new(),
            admin_rx,
            exit: None,
        };

        server.start_p2p();
        Ok(server)
    }

    /// Startup race, §4.2: try to dial the peer; fall back to listening.
    fn start_p2p(&mut self) {
        match TcpStream::connect(self.config.peer_addr) {
            Ok(stream) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(error = %e, "failed to set peer socket nonblocking");
                    self.fall_back_to_listening();
                    return;
                }
                let req = self.peers.on_active_connect();
                self.adopt_peer_socket(stream);
                self.write_to_peer(&req);
            }
            Err(e) => {
                info!(error = %e, "no peer found, starting to listen for P2P connections");
                self.fall_back_to_listening();
            }
        }
    }

    fn fall_back_to_listening(&mut self) {
        self.peers.on_dial_failed();
        self.sources.register(Source::P2pListener, &self.p2p_listener, popol::interest::READ);
    }

    fn adopt_peer_socket(&mut self, stream: TcpStream) {
        self.sources.register(Source::Peer, &stream, popol::interest::READ);
        self.peer_decoder = LineDecoder::new();
        self.peer_socket = Some(stream);
    }

    /// Run until shutdown is requested or an unrecoverable error occurs.
    pub fn run(mut self) -> Result<ExitReason, Error> {
        let mut events = popol::Events::new();
        loop {
            if let Some(reason) = self.exit {
                info!(?reason, "shutting down");
                return Ok(reason);
            }

            match self.sources.wait_timeout(&mut events, Duration::from_millis(200)) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }

            let ready: Vec<(Source, EventFlags)> = events
                .iter()
                .map(|(key, event)| (*key, EventFlags::from(event)))
                .collect();
            for (key, flags) in ready {
                self.handle_event(key, flags);
            }

            self.drain_admin_commands();
        }
    }

    fn handle_event(&mut self, key: Source, flags: EventFlags) {
        match key {
            Source::SensorListener => self.accept_sensors(),
            Source::P2pListener => self.accept_peer(),
            Source::Peer => self.handle_peer_event(flags),
            Source::Sensor(fd) => self.handle_sensor_event(fd, flags),
        }
    }

    fn accept_sensors(&mut self) {
        loop {
            match self.sensor_listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(error = %e, "failed to set sensor socket nonblocking");
                        continue;
                    }
                    let fd = stream.as_raw_fd();
                    info!(%addr, fd, "sensor connection accepted");
                    self.sources.register(Source::Sensor(fd), &stream, popol::interest::READ);
                    self.sensor_decoders.insert(fd, LineDecoder::new());
                    self.registry.accept(fd, stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "sensor accept failed, shutting down");
                    self.exit = Some(ExitReason::AdminExit);
                    break;
                }
            }
        }
    }

    fn accept_peer(&mut self) {
        if self.peer_socket.is_some() {
            while self.p2p_listener.accept().is_ok() {}
            return;
        }

        match self.p2p_listener.accept() {
            Ok((stream, addr)) => {
                info!(%addr, "peer connection accepted");
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(error = %e, "failed to set peer socket nonblocking");
                    return;
                }
                self.sources.unregister(&Source::P2pListener);
                self.peers.on_accepted();
                self.adopt_peer_socket(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "peer accept failed"),
        }
    }

    fn handle_sensor_event(&mut self, fd: RawFd, event: EventFlags) {
        if event.is_terminal() {
            self.drop_sensor(fd);
            return;
        }
        if !event.readable {
            return;
        }

        let mut buf = [0u8; 512];
        let read = match self.registry.connection_mut(fd) {
            Some(conn) => conn.stream.read(&mut buf),
            None => return,
        };

        match read {
            Ok(0) => self.drop_sensor(fd),
            Ok(n) => {
                if let Some(decoder) = self.sensor_decoders.get_mut(&fd) {
                    decoder.input(&buf[..n]);
                }
                self.pump_sensor_messages(fd);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(error = %e, fd, "sensor read failed");
                self.drop_sensor(fd);
            }
        }
    }

    fn pump_sensor_messages(&mut self, fd: RawFd) {
        loop {
            let decoded = match self.sensor_decoders.get_mut(&fd) {
                Some(decoder) => decoder.decode_next(),
                None => return,
            };

            let msg = match decoded {
                Ok(Some(msg)) => msg,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, fd, "malformed sensor frame");
                    self.drop_sensor(fd);
                    return;
                }
            };

            let action = dispatcher::handle_sensor_message(self.config.role, &mut self.registry, fd, &msg);
            match action {
                SensorAction::Reply(reply) => self.write_to_sensor(fd, &reply),
                SensorAction::ReplyAndClose(reply) | SensorAction::RejectAndClose(reply) => {
                    self.write_to_sensor(fd, &reply);
                    self.drop_sensor(fd);
                }
                SensorAction::CheckAlert { sensor_id } => self.perform_checkalert(fd, &sensor_id),
                SensorAction::Ignore => {}
            }
        }
    }

    fn write_to_sensor(&mut self, fd: RawFd, msg: &Message) {
        if let Some(conn) = self.registry.connection_mut(fd) {
            if let Err(e) = conn.write_message(msg) {
                warn!(error = %e, fd, "sensor write failed");
                self.drop_sensor(fd);
            }
        }
    }

    fn drop_sensor(&mut self, fd: RawFd) {
        self.sources.unregister(&Source::Sensor(fd));
        self.sensor_decoders.remove(&fd);
        self.registry.remove(fd);
    }

    fn handle_peer_event(&mut self, event: EventFlags) {
        if event.is_terminal() {
            self.tear_down_peer();
            return;
        }
        if !event.readable {
            return;
        }

        let mut buf = [0u8; 512];
        let read = match self.peer_socket.as_mut() {
            Some(stream) => stream.read(&mut buf),
            None => return,
        };

        match read {
            Ok(0) => self.tear_down_peer(),
            Ok(n) => {
                self.peer_decoder.input(&buf[..n]);
                self.pump_peer_messages();
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(error = %e, "peer read failed");
                self.tear_down_peer();
            }
        }
    }

    fn pump_peer_messages(&mut self) {
        loop {
            let msg = match self.peer_decoder.decode_next() {
                Ok(Some(msg)) => msg,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "malformed peer frame");
                    self.tear_down_peer();
                    return;
                }
            };

            // REQ_CHECKALERT on an established session is answered inline;
            // everything else belongs to the handshake/session state
            // machine.
            if self.peers.is_established() && msg.code == code::REQ_CHECKALERT {
                let reply = dispatcher::handle_peer_checkalert_request(
                    self.config.role,
                    &self.registry,
                    &msg.payload,
                );
                self.write_to_peer(&reply);
                continue;
            }

            match self.peers.on_message(&msg) {
                Ok(PeerAction::Send(reply)) => self.write_to_peer(&reply),
                Ok(PeerAction::Established) => info!("P2P session established"),
                Ok(PeerAction::PeerConfirmedDisconnect) => {
                    info!("peer confirmed disconnect, shutting down");
                    self.exit = Some(ExitReason::PeerDisconnectConfirmed);
                    return;
                }
                Ok(PeerAction::PeerRejectedDisconnect) => {
                    info!("peer rejected disconnect, closing our side");
                    self.tear_down_peer();
                }
                Ok(PeerAction::TearDown) => self.tear_down_peer(),
                Ok(PeerAction::AckDisconnectAndTearDown(ack)) => {
                    self.write_to_peer(&ack);
                    info!("peer disconnected, closing our side");
                    self.tear_down_peer();
                }
                Ok(PeerAction::Handled) => {}
                Err(e) => {
                    warn!(error = %e, "malformed peer handshake message");
                    self.tear_down_peer();
                }
            }
        }
    }

    fn write_to_peer(&mut self, msg: &Message) {
        let Some(stream) = self.peer_socket.as_mut() else {
            return;
        };
        if let Err(e) = stream.write_all(&msg.encode()) {
            warn!(error = %e, "peer write failed");
            self.tear_down_peer();
        }
    }

    /// Tear the session down and re-arm the passive listener, per §4.2.
    fn tear_down_peer(&mut self) {
        self.sources.unregister(&Source::Peer);
        self.peer_socket = None;
        self.peers.rearm_listener();
        self.sources.unregister(&Source::P2pListener);
        self.sources.register(Source::P2pListener, &self.p2p_listener, popol::interest::READ);
    }

    /// Bounded synchronous CHECKALERT round trip on the P2P socket, the
    /// one place the reactor deliberately blocks (§5).
    fn perform_checkalert(&mut self, sensor_fd: RawFd, sensor_id: &str) {
        if !self.peers.is_established() {
            warn!(sensor_id, "no P2P session, cannot check alert location");
            return;
        }

        let outcome = self.checkalert_round_trip(sensor_id);

        match outcome {
            Ok(CheckAlertResult::Location(location)) => {
                self.write_to_sensor(
                    sensor_fd,
                    &Message::new(code::RES_SENSSTATUS, location.to_string()),
                );
            }
            Ok(CheckAlertResult::SensorNotFound) => {
                self.write_to_sensor(sensor_fd, &Message::error(crate::wire::err::SENSOR_NOT_FOUND));
            }
            Ok(CheckAlertResult::TransportFailure) | Err(_) => {
                warn!(sensor_id, "CHECKALERT round trip failed, no response sent to sensor");
                self.tear_down_peer();
            }
        }
    }

    fn checkalert_round_trip(&mut self, sensor_id: &str) -> Result<CheckAlertResult, std::io::Error> {
        let Some(stream) = self.peer_socket.as_mut() else {
            return Ok(CheckAlertResult::TransportFailure);
        };

        // The reactor otherwise keeps this socket nonblocking; the bounded
        // synchronous read is the one place it deliberately drops back to a
        // blocking mode so `set_read_timeout` actually bounds the wait
        // instead of returning `WouldBlock` on the first poll.
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.config.checkalert_timeout))?;
        let write_result = stream.write_all(&Message::new(code::REQ_CHECKALERT, sensor_id).encode());
        if write_result.is_err() {
            let _ = stream.set_nonblocking(true);
            return write_result.map(|_| CheckAlertResult::TransportFailure);
        }

        let mut decoder = LineDecoder::new();
        let mut buf = [0u8; 512];
        let result = loop {
            match decoder.decode_next() {
                Ok(Some(msg)) => break Ok(dispatcher::interpret_checkalert_reply(&msg)),
                Ok(None) => {}
                Err(_) => break Ok(CheckAlertResult::TransportFailure),
            }
            match stream.read(&mut buf) {
                Ok(0) => break Ok(CheckAlertResult::TransportFailure),
                Ok(n) => decoder.input(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    break Ok(CheckAlertResult::TransportFailure)
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    break Ok(CheckAlertResult::TransportFailure)
                }
                Err(e) => break Err(e),
            }
        };

        if let Some(stream) = self.peer_socket.as_mut() {
            let _ = stream.set_read_timeout(None);
            let _ = stream.set_nonblocking(true);
        }
        result
    }

    fn drain_admin_commands(&mut self) {
        while let Ok(cmd) = self.admin_rx.try_recv() {
            match cmd {
                AdminCommand::Kill => match self.peers.begin_disconnect() {
                    Some(msg) => self.write_to_peer(&msg),
                    None => info!("no peer connected to close connection"),
                },
                AdminCommand::Exit => self.exit = Some(ExitReason::AdminExit),
                AdminCommand::SetRisk { sensor_id, flag } => {
                    if self.config.role.is_status() {
                        if !dispatcher::set_risk(&mut self.registry, &sensor_id, flag) {
                            info!(sensor_id, "set_risk: no matching registered sensor");
                        }
                    } else {
                        info!("set_risk is only valid on the Status Server");
                    }
                }
            }
        }
    }
}
