//! End-to-end tests driving the reactor over real loopback TCP sockets,
//! covering the scenarios in §8 of the specification.
use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, TcpStream};
use std::thread;
use std::time::Duration;

use sentrymesh_net::admin::AdminCommand;
use sentrymesh_net::reactor::ExitReason;
use sentrymesh_net::wire::{code, err, Message};
use sentrymesh_net::{Server, ServerConfig, ServerRole};

const LOCALHOST: &str = "127.0.0.1";

fn settle() {
    thread::sleep(Duration::from_millis(300));
}

struct Sensor {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Sensor {
    fn connect(port: u16) -> Self {
        let stream = TcpStream::connect((LOCALHOST, port)).expect("connect to server");
        let reader = BufReader::new(stream.try_clone().expect("clone stream"));
        Self {
            writer: stream,
            reader,
        }
    }

    fn send(&mut self, msg: &Message) {
        self.writer.write_all(&msg.encode()).expect("write frame");
    }

    fn recv(&mut self) -> Message {
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read frame");
        Message::parse(line.trim_end_matches('\n')).expect("parse frame")
    }

    fn request(&mut self, msg: Message) -> Message {
        self.send(&msg);
        self.recv()
    }

    fn register(&mut self, sensor_id: &str, location: u8) -> Message {
        self.request(Message::new(code::REQ_CONNSEN, format!("{sensor_id},{location}")))
    }
}

/// Start a server and hand back the channel used to send it admin commands
/// plus the thread that's running its event loop.
fn spawn_server(
    role: ServerRole,
    peer_ip: &str,
    p2p_port: u16,
    client_listen_port: u16,
) -> (flume::Sender<AdminCommand>, thread::JoinHandle<ExitReason>) {
    let config = ServerConfig::new(
        role,
        peer_ip.parse::<IpAddr>().unwrap(),
        p2p_port,
        client_listen_port,
    );
    let (tx, rx) = flume::unbounded();
    let server = Server::new(config, rx).expect("server binds its listeners");
    let handle = thread::spawn(move || server.run().expect("reactor runs to completion"));
    (tx, handle)
}

#[test]
fn admission_assigns_a_slot_and_answers_later_queries() {
    let (_sl_tx, _sl_handle) = spawn_server(ServerRole::Location, LOCALHOST, 60100, 62100);
    settle();

    let mut sensor = Sensor::connect(62100);
    let reply = sensor.register("1234567890", 3);
    assert_eq!(reply.code, code::RES_CONNSEN);
    let slot: u8 = reply.payload.parse().unwrap();
    assert!((1..=15).contains(&slot));

    // A second connected sensor can query the first one's location.
    let mut other = Sensor::connect(62100);
    other.register("9999999999", 5);
    let loc = other.request(Message::new(code::REQ_SENSLOC, "1234567890"));
    assert_eq!(loc.code, code::RES_SENSLOC);
    assert_eq!(loc.payload, "3");
}

#[test]
fn duplicate_sensor_id_is_rejected() {
    let (_tx, _handle) = spawn_server(ServerRole::Status, LOCALHOST, 60101, 62101);
    settle();

    let mut first = Sensor::connect(62101);
    let reply = first.register("1234567890", 3);
    assert_eq!(reply.code, code::RES_CONNSEN);

    let mut second = Sensor::connect(62101);
    let reply = second.register("1234567890", 4);
    assert_eq!(reply.code, code::ERROR);
    assert_eq!(reply.payload, err::SENSOR_ID_ALREADY_EXISTS);
}

#[test]
fn sixteenth_sensor_is_rejected_at_capacity() {
    let (_tx, _handle) = spawn_server(ServerRole::Status, LOCALHOST, 60102, 62102);
    settle();

    let mut sensors = Vec::new();
    for i in 0..15 {
        let mut sensor = Sensor::connect(62102);
        let id = format!("{i:010}");
        let reply = sensor.register(&id, 1);
        assert_eq!(reply.code, code::RES_CONNSEN, "sensor {i} should be admitted");
        sensors.push(sensor);
    }

    let mut sixteenth = Sensor::connect(62102);
    let reply = sixteenth.register("9999999999", 1);
    assert_eq!(reply.code, code::ERROR);
    assert_eq!(reply.payload, err::SENSOR_LIMIT_EXCEEDED);
}

#[test]
fn loclist_returns_sensors_ordered_by_slot() {
    let (_tx, _handle) = spawn_server(ServerRole::Location, LOCALHOST, 60103, 62103);
    settle();

    let mut first = Sensor::connect(62103);
    first.register("1111111111", 6);
    let mut second = Sensor::connect(62103);
    second.register("2222222222", 6);

    let reply = first.request(Message::new(code::REQ_LOCLIST, "1,6"));
    assert_eq!(reply.code, code::RES_LOCLIST);
    assert_eq!(reply.payload, "1111111111,2222222222");

    let empty = first.request(Message::new(code::REQ_LOCLIST, "1,9"));
    assert_eq!(empty.code, code::ERROR);
    assert_eq!(empty.payload, err::SENSOR_NOT_FOUND);
}

#[test]
fn checkalert_round_trip_resolves_sensor_status() {
    // SL is started first so it's the passive side; SS dials in and
    // becomes active, per §8 scenario 4.
    let (_sl_tx, _sl_handle) = spawn_server(ServerRole::Location, LOCALHOST, 60104, 62204);
    settle();
    let (ss_tx, _ss_handle) = spawn_server(ServerRole::Status, LOCALHOST, 60104, 61104);
    settle();

    let mut sensor_on_ss = Sensor::connect(61104);
    let reply = sensor_on_ss.register("1234567890", 3);
    assert_eq!(reply.code, code::RES_CONNSEN);
    let ss_slot = reply.payload;

    let mut sensor_on_sl = Sensor::connect(62204);
    sensor_on_sl.register("1234567890", 3);

    // Normal status: risk flag clear, no P2P traffic needed.
    let normal = sensor_on_ss.request(Message::new(code::REQ_SENSSTATUS, ss_slot.clone()));
    assert_eq!(normal.code, code::RES_SENSSTATUS);
    assert_eq!(normal.payload, "-1");

    // Raise the risk flag from the admin console and check again.
    ss_tx
        .send(AdminCommand::SetRisk {
            sensor_id: "1234567890".to_string(),
            flag: true,
        })
        .unwrap();
    settle();

    let at_risk = sensor_on_ss.request(Message::new(code::REQ_SENSSTATUS, ss_slot));
    assert_eq!(at_risk.code, code::RES_SENSSTATUS);
    assert_eq!(at_risk.payload, "3");
}

#[test]
fn admin_kill_tears_down_the_peer_session() {
    let (_sl_tx, sl_handle) = spawn_server(ServerRole::Location, LOCALHOST, 60105, 62205);
    settle();
    let (ss_tx, ss_handle) = spawn_server(ServerRole::Status, LOCALHOST, 60105, 61105);
    settle();

    ss_tx.send(AdminCommand::Kill).unwrap();

    let reason = ss_handle.join().expect("SS thread completes");
    assert_eq!(reason, ExitReason::PeerDisconnectConfirmed);

    // SL keeps running and its passive listener is re-armed; shut it down
    // explicitly so the test process doesn't leak the thread.
    _sl_tx.send(AdminCommand::Exit).unwrap();
    let reason = sl_handle.join().expect("SL thread completes");
    assert_eq!(reason, ExitReason::AdminExit);
}
