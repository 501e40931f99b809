//! Keyboard admin console: a small line-oriented command language read from
//! stdin by the event loop, independent of the wire protocol.
use std::str::FromStr;

use thiserror::Error;

use crate::registry::valid_sensor_id;

/// A parsed admin command, per §4.5.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// `kill` — initiate P2P disconnect if established.
    Kill,
    /// `exit` — initiate local shutdown.
    Exit,
    /// `set_risk <sensor_id> <0|1>` — STATUS role only.
    SetRisk { sensor_id: String, flag: bool },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecognized admin command `{0}`")]
pub struct AdminCommandParseError(String);

impl FromStr for AdminCommand {
    type Err = AdminCommandParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let mut parts = line.split_whitespace();

        match parts.next() {
            Some("kill") if parts.next().is_none() => Ok(Self::Kill),
            Some("exit") if parts.next().is_none() => Ok(Self::Exit),
            Some("set_risk") => {
                let sensor_id = parts.next().ok_or_else(|| AdminCommandParseError(line.to_string()))?;
                let flag = parts.next().ok_or_else(|| AdminCommandParseError(line.to_string()))?;
                if parts.next().is_some() || !valid_sensor_id(sensor_id) {
                    return Err(AdminCommandParseError(line.to_string()));
                }
                let flag = match flag {
                    "0" => false,
                    "1" => true,
                    _ => return Err(AdminCommandParseError(line.to_string())),
                };
                Ok(Self::SetRisk {
                    sensor_id: sensor_id.to_string(),
                    flag,
                })
            }
            _ => Err(AdminCommandParseError(line.to_string())),
        }
    }
}
