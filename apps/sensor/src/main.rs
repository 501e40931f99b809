//! Interactive client simulating a single risk sensor. Registers with both
//! the Status Server and the Location Server, then drives a small menu of
//! requests against whichever server answers them.
use std::io::{BufRead, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};

use clap::Parser;
use eyre::{bail, Context, Result};
use sentrymesh_net::registry::{valid_location, valid_sensor_id};
use sentrymesh_net::wire::{code, err, LineDecoder, Message};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Connect a simulated sensor to its Status Server and Location Server.
///
/// Mirrors the original command line: `<ss_ip> <ss_port> <sl_ip> <sl_port>
/// <sensor_id> <location>`.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    ss_ip: IpAddr,
    ss_port: u16,
    sl_ip: IpAddr,
    sl_port: u16,
    sensor_id: String,
    location: u8,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if !valid_sensor_id(&args.sensor_id) {
        bail!("sensor id must be exactly 10 digits");
    }
    if !valid_location(args.location) {
        bail!("location must be between 1 and 10");
    }

    let mut ss = Session::connect(SocketAddr::new(args.ss_ip, args.ss_port))?;
    let mut sl = Session::connect(SocketAddr::new(args.sl_ip, args.sl_port))?;

    let ss_slot = ss.connect_sensor(&args.sensor_id, args.location)?;
    let sl_slot = sl.connect_sensor(&args.sensor_id, args.location)?;
    info!(ss_slot, sl_slot, "registered with both servers");

    if ss_slot != sl_slot {
        // Per the reference behavior: a sensor that gets two different
        // slot numbers for the same registration shuts itself down rather
        // than continue with an inconsistent view of its own identity.
        warn!(ss_slot, sl_slot, "slot numbers disagree between servers, shutting down");
        let _ = ss.disconnect(ss_slot);
        let _ = sl.disconnect(sl_slot);
        return Ok(());
    }

    run_menu(&mut ss, &mut sl, ss_slot)
}

struct Session {
    stream: TcpStream,
    decoder: LineDecoder,
}

impl Session {
    fn connect(addr: SocketAddr) -> Result<Self> {
        let stream =
            TcpStream::connect(addr).wrap_err_with(|| format!("failed to connect to {addr}"))?;
        Ok(Self {
            stream,
            decoder: LineDecoder::new(),
        })
    }

    fn send(&mut self, msg: &Message) -> Result<()> {
        self.stream.write_all(&msg.encode())?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Message> {
        let mut buf = [0u8; 512];
        loop {
            if let Some(msg) = self.decoder.decode_next()? {
                return Ok(msg);
            }
            let n = self.stream.read(&mut buf)?;
            if n == 0 {
                bail!("server closed the connection");
            }
            self.decoder.input(&buf[..n]);
        }
    }

    fn request(&mut self, msg: Message) -> Result<Message> {
        self.send(&msg)?;
        self.recv()
    }

    fn connect_sensor(&mut self, sensor_id: &str, location: u8) -> Result<u8> {
        let reply = self.request(Message::new(
            code::REQ_CONNSEN,
            format!("{sensor_id},{location}"),
        ))?;

        if reply.code != code::RES_CONNSEN {
            bail!("registration rejected: ERROR({})", reply.payload);
        }
        reply
            .payload
            .trim()
            .parse()
            .wrap_err("server returned a non-numeric slot number")
    }

    fn disconnect(&mut self, slot: u8) -> Result<()> {
        let reply = self.request(Message::new(code::REQ_DISCSEN, slot.to_string()))?;
        if reply.code != code::OK {
            warn!(code = %reply.payload, "disconnect was not acknowledged cleanly");
        }
        Ok(())
    }
}

const MENU: &str = "\
1) check this sensor's status
2) ask for another sensor's location
3) list sensors at a location
4) disconnect and quit";

fn run_menu(ss: &mut Session, sl: &mut Session, slot: u8) -> Result<()> {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        println!("{MENU}");
        let Some(Ok(line)) = lines.next() else {
            break;
        };

        match line.trim() {
            "1" => check_status(ss, slot)?,
            "2" => ask_location(sl, &mut lines)?,
            "3" => ask_location_list(sl, slot, &mut lines)?,
            "4" => {
                let _ = ss.disconnect(slot);
                let _ = sl.disconnect(slot);
                break;
            }
            other => println!("unrecognized choice `{other}`"),
        }
    }
    Ok(())
}

fn check_status(ss: &mut Session, slot: u8) -> Result<()> {
    let reply = ss.request(Message::new(code::REQ_SENSSTATUS, slot.to_string()))?;
    match reply.code {
        code::RES_SENSSTATUS if reply.payload.trim() == "-1" => println!("status: normal"),
        code::RES_SENSSTATUS => println!("status: at risk, last known location {}", reply.payload),
        _ => println!("status check failed: ERROR({})", reply.payload),
    }
    Ok(())
}

fn ask_location(sl: &mut Session, lines: &mut impl Iterator<Item = std::io::Result<String>>) -> Result<()> {
    println!("enter the sensor id to locate:");
    let Some(Ok(target_id)) = lines.next() else {
        return Ok(());
    };
    let reply = sl.request(Message::new(code::REQ_SENSLOC, target_id.trim()))?;
    match reply.code {
        code::RES_SENSLOC => println!("that sensor is at location {}", reply.payload),
        _ => println!("could not retrieve location: ERROR({})", reply.payload),
    }
    Ok(())
}

fn ask_location_list(
    sl: &mut Session,
    slot: u8,
    lines: &mut impl Iterator<Item = std::io::Result<String>>,
) -> Result<()> {
    println!("enter a location (1-10):");
    let Some(Ok(location)) = lines.next() else {
        return Ok(());
    };
    let reply = sl.request(Message::new(
        code::REQ_LOCLIST,
        format!("{slot},{}", location.trim()),
    ))?;
    match reply.code {
        code::RES_LOCLIST => println!("sensors there: {}", reply.payload),
        _ if reply.payload == err::SENSOR_NOT_FOUND => println!("no sensors at that location"),
        _ => println!("request failed: ERROR({})", reply.payload),
    }
    Ok(())
}
