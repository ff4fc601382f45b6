/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Source-measure unit reached over TCP (Keithley 2602A style).
//!
//! The instrument runs a measurement script started at prepare.  Each
//! `measure()` query answers `<ignored>\t<sensing_time>\t<energy>`; the
//! driver scales that to the wall-clock time since the previous query and
//! accumulates it into an energy trace written as `age energy` lines.

use std::fmt::Write as _;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use super::{Device, DeviceContext, DeviceError, StopSignal};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

fn default_start_script() -> String {
    "TSB_Script.run()".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PowerMeterConfig {
    pub host: String,
    pub port: u16,
    pub output_energy_file: String,
    /// Instrument command sent once the connection is up.
    #[serde(default = "default_start_script")]
    pub start_script: String,
}

/// One `measure()` reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub sensing_time: f64,
    pub energy: f64,
}

/// Parse a `measure()` reply.
pub fn parse_reading(line: &str) -> Result<Reading, DeviceError> {
    let fields: Vec<&str> = line.trim().split('\t').collect();
    let [_, sensing_time, energy] = fields[..] else {
        return Err(DeviceError::Instrument(format!(
            "expected 3 tab-separated fields, got '{}'",
            line.trim()
        )));
    };
    let num = |s: &str| {
        s.trim()
            .parse::<f64>()
            .map_err(|e| DeviceError::Instrument(format!("bad number '{s}': {e}")))
    };
    let reading = Reading {
        sensing_time: num(sensing_time)?,
        energy: num(energy)?,
    };
    if reading.sensing_time <= 0.0 {
        return Err(DeviceError::Instrument(format!(
            "non-positive sensing time {}",
            reading.sensing_time
        )));
    }
    Ok(reading)
}

/// Connection plus the trace being built.  Locked for the duration of each
/// measurement so terminate waits for the one in flight.
#[derive(Default)]
struct Session {
    conn: Option<Connection>,
    started: Option<Instant>,
    previous: Option<Instant>,
    accumulated: f64,
    trace: Vec<(f64, f64)>,
}

struct Connection {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Connection {
    fn send(&mut self, command: &str) -> std::io::Result<()> {
        self.writer.write_all(command.as_bytes())?;
        self.writer.write_all(b"\n")
    }
}

impl Session {
    fn measure(&mut self) -> Result<(), DeviceError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(DeviceError::Instrument("not connected".into()));
        };
        conn.send("measure()")?;
        let mut reply = String::new();
        if conn.reader.read_line(&mut reply)? == 0 {
            return Err(DeviceError::Instrument("connection closed".into()));
        }
        let reading = parse_reading(&reply)?;

        let now = Instant::now();
        let started = *self.started.get_or_insert(now);
        let previous = self.previous.replace(now).unwrap_or(started);
        let elapsed = now.duration_since(previous).as_secs_f64();

        self.accumulated += reading.energy / reading.sensing_time * elapsed;
        let age = now.duration_since(started).as_secs_f64();
        self.trace.push((age, self.accumulated));
        Ok(())
    }
}

pub struct PowerMeter {
    name: String,
    host: String,
    port: u16,
    start_script: String,
    energy_path: PathBuf,
    stop: StopSignal,
    session: Mutex<Session>,
}

impl PowerMeter {
    pub fn new(name: &str, config: &PowerMeterConfig, ctx: &DeviceContext) -> Self {
        Self {
            name: name.to_string(),
            host: config.host.clone(),
            port: config.port,
            start_script: config.start_script.clone(),
            energy_path: ctx.file(&config.output_energy_file),
            stop: StopSignal::new(),
            session: Mutex::new(Session::default()),
        }
    }

    fn connect(&self) -> Result<Connection, DeviceError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| DeviceError::Instrument(format!("cannot resolve {}", self.host)))?;
        let writer = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        writer.set_read_timeout(Some(REPLY_TIMEOUT))?;
        let reader = BufReader::new(writer.try_clone()?);
        Ok(Connection { writer, reader })
    }
}

impl Device for PowerMeter {
    fn on_before_execution(&self) -> Result<(), DeviceError> {
        self.stop.reset();
        let mut conn = self.connect()?;
        conn.send(&self.start_script)?;
        info!(device = %self.name, host = %self.host, port = self.port, "instrument connected");

        *self.session.lock() = Session {
            conn: Some(conn),
            ..Session::default()
        };
        Ok(())
    }

    fn on_execute(&self) -> Result<(), DeviceError> {
        while !self.stop.is_stopped() {
            let mut session = self.session.lock();
            if self.stop.is_stopped() {
                break;
            }
            session.measure()?;
        }
        Ok(())
    }

    fn on_terminate(&self) -> Result<(), DeviceError> {
        self.stop.stop();
        let session = self.session.lock();

        let mut out = String::new();
        for (age, energy) in &session.trace {
            let _ = writeln!(out, "{age:.6} {energy:.6}");
        }
        fs::write(&self.energy_path, out).map_err(|e| DeviceError::file(&self.energy_path, e))?;
        debug!(device = %self.name, samples = session.trace.len(), "energy trace written");
        Ok(())
    }

    fn on_reset_after_execution(&self) -> Result<(), DeviceError> {
        if self.session.lock().conn.take().is_some() {
            info!(device = %self.name, "instrument disconnected");
        }
        Ok(())
    }
}
