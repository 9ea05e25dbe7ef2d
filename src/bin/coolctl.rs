// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! coolctl: command-line client for the coolingd daemon.
//!
//! Sends one request per invocation and prints the reply as pretty JSON.
//! `watch` subscribes and prints events until interrupted.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::process::ExitCode;
use std::time::Duration;
use thermal_cooling_sim::bus::ReadingBatch;
use thermal_cooling_sim::config;
use thermal_cooling_sim::protocol::{self, Request, Response};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "coolctl", about = "Control client for coolingd")]
struct Cli {
    /// Path to the daemon socket.
    #[arg(short, long, default_value = config::DEFAULT_SOCKET_PATH)]
    socket: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show one fan, or all fans.
    Status { name: Option<String> },

    /// Set a duty cycle (0-100) on one fan, or on every fan.
    SetDuty {
        duty_cycle: u8,
        #[arg(short, long)]
        fan: Option<String>,
    },

    /// Set a raw PWM count on one fan.
    SetPwm { name: String, pwm: u32 },

    /// Inject a fault into a fan.
    MakeBad { name: String },

    /// Clear an injected fault.
    MakeGood { name: String },

    /// Current noise level of a fan.
    Noise { name: String },

    /// Show the cooling thresholds.
    Thresholds,

    /// Replace the cooling thresholds.
    SetThresholds {
        temp_low: f64,
        temp_high: f64,
        fan_speed_min: u8,
        fan_speed_max: u8,
    },

    /// Recent readings of one sensor, newest first.
    History {
        controller: String,
        sensor_id: u32,
        /// 0 returns everything retained.
        #[arg(short = 'n', long, default_value_t = 10)]
        max_count: usize,
    },

    /// Show the last applied cooling status.
    CoolingStatus,

    /// Publish a reading batch given as JSON.
    Publish { batch: String },

    /// Make a simulated sensor report Bad (`--clear` restores it).
    SensorFault {
        controller: String,
        sensor_id: u32,
        #[arg(long)]
        clear: bool,
    },

    /// Make a simulated sensor noisy (`--clear` restores it).
    SensorNoise {
        controller: String,
        sensor_id: u32,
        #[arg(long)]
        clear: bool,
    },

    /// Stop a simulated controller from publishing (`--clear` restores it).
    ControllerFault {
        controller: String,
        #[arg(long)]
        clear: bool,
    },

    /// Set the temperature ramp of a simulated sensor.
    Ramp {
        controller: String,
        sensor_id: u32,
        start_temp: f64,
        end_temp: f64,
        step: f64,
    },

    /// Print bus events as they happen.
    Watch,
}

impl Command {
    fn into_request(self) -> anyhow::Result<Request> {
        let req = match self {
            Command::Status { name } => Request::GetFanStatus { name },
            Command::SetDuty { duty_cycle, fan } => Request::SetDutyCycle {
                name: fan,
                duty_cycle,
            },
            Command::SetPwm { name, pwm } => Request::SetPwm { name, pwm },
            Command::MakeBad { name } => Request::MakeFanBad { name },
            Command::MakeGood { name } => Request::MakeFanGood { name },
            Command::Noise { name } => Request::GetNoise { name },
            Command::Thresholds => Request::GetThresholds,
            Command::SetThresholds {
                temp_low,
                temp_high,
                fan_speed_min,
                fan_speed_max,
            } => Request::SetThresholds {
                temp_low,
                temp_high,
                fan_speed_min,
                fan_speed_max,
            },
            Command::History {
                controller,
                sensor_id,
                max_count,
            } => Request::GetTemperatureHistory {
                controller,
                sensor_id,
                max_count,
            },
            Command::CoolingStatus => Request::GetCoolingStatus,
            Command::Publish { batch } => {
                let batch: ReadingBatch =
                    serde_json::from_str(&batch).context("Invalid reading batch")?;
                Request::PublishReadings { batch }
            }
            Command::SensorFault {
                controller,
                sensor_id,
                clear,
            } => Request::SetSensorFault {
                controller,
                sensor_id,
                faulty: !clear,
            },
            Command::SensorNoise {
                controller,
                sensor_id,
                clear,
            } => Request::SetSensorNoise {
                controller,
                sensor_id,
                noisy: !clear,
            },
            Command::ControllerFault { controller, clear } => Request::SetControllerFault {
                controller,
                faulty: !clear,
            },
            Command::Ramp {
                controller,
                sensor_id,
                start_temp,
                end_temp,
                step,
            } => Request::SetSimulationParams {
                controller,
                sensor_id,
                start_temp,
                end_temp,
                step,
            },
            Command::Watch => Request::Subscribe,
        };
        Ok(req)
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct Connection {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Connection {
    fn connect(path: &str, timeout: Option<Duration>) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_read_timeout(timeout)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }

    fn send_request(&mut self, req: &Request) -> io::Result<Response> {
        let encoded = protocol::encode(req).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Encode error: {e}"))
        })?;
        self.stream.write_all(encoded.as_bytes())?;
        self.stream.flush()?;
        self.read_response()
    }

    fn read_response(&mut self) -> io::Result<Response> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Daemon closed the connection",
            ));
        }
        protocol::decode(&line).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Decode error: {e}"))
        })
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let watch = matches!(cli.command, Command::Watch);
    let request = cli.command.into_request()?;

    let timeout = (!watch).then(|| Duration::from_secs(2));
    let mut conn = Connection::connect(&cli.socket, timeout)
        .with_context(|| format!("Cannot connect to daemon at {}", cli.socket))?;
    log::debug!("Connected to daemon at {}", cli.socket);

    let response = conn.send_request(&request)?;
    print_response(&response)?;
    if response.is_error() {
        return Ok(ExitCode::FAILURE);
    }

    if watch {
        loop {
            match conn.read_response() {
                Ok(event) => print_response(&event)?,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_response(response: &Response) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(response)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{json}")?;
    stdout.flush()?;
    Ok(())
}
