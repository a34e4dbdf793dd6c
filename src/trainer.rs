//! Trainer and shifter I/O behind a Unix-domain socket.
//!
//! The process driving the trainer hardware and reading the physical
//! shifter is a separate daemon; this module is its client. The wire is
//! newline-delimited JSON: the driver streams `status` messages carrying
//! the shifter detent position and the acknowledged incline, and accepts
//! `incline` commands in 0.01% units. A supervisor keeps the streaming
//! connection alive across driver restarts; incline commands each ride
//! their own short-lived connection so a wedged driver cannot back up
//! the control loop.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep, sleep_until, timeout, Instant};

use crate::gears::{GearController, InclineSink};

/// How often the gear controller samples the shifter position.
const SHIFTER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Spacing between heartbeats on the streaming connection.
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// Ceiling on a single one-shot incline command, connect included.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay ladder between reconnect attempts, seconds. The last rung
/// repeats.
const RETRY_LADDER: [u64; 4] = [1, 2, 5, 10];

/// Shared I/O state, updated continuously by the socket reader.
#[derive(Debug, Clone, Default)]
pub struct IoState {
    /// Latest shifter detent position as reported by the driver.
    pub shifter_position: i32,
    /// Incline the trainer last acknowledged, 0.01% units.
    pub incline_bp: i32,
    /// Whether we have an active connection to the I/O daemon.
    pub connected: bool,
}

/// Messages the driver emits, one JSON object per line. Anything that
/// does not parse into this shape is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum IoMessage {
    #[serde(rename = "status")]
    Status {
        #[serde(default)]
        shifter_position: i32,
        #[serde(default)]
        incline: i32,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
}

/// Supervise the streaming connection: connect, drive, and retry on a
/// fixed delay ladder. Runs until cancelled.
pub async fn run(state: Arc<Mutex<IoState>>, socket_path: &str) {
    let mut attempt: usize = 0;

    loop {
        if attempt > 0 {
            let rung = RETRY_LADDER[(attempt - 1).min(RETRY_LADDER.len() - 1)];
            debug!("trainer I/O retry {} in {}s", attempt, rung);
            sleep(Duration::from_secs(rung)).await;
        }
        attempt += 1;

        let stream = match UnixStream::connect(socket_path).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("trainer I/O unreachable at {}: {}", socket_path, e);
                continue;
            }
        };
        info!("trainer I/O up at {}", socket_path);
        state.lock().await.connected = true;
        attempt = 1; // a live session resets the ladder to its first rung

        match drive_session(&state, stream).await {
            Ok(()) => info!("trainer I/O hung up"),
            Err(e) => warn!("trainer I/O session failed: {}", e),
        }
        state.lock().await.connected = false;
    }
}

/// Pump one established connection: status lines in, heartbeats out on
/// a rolling deadline. Returns when the driver hangs up or the socket
/// errors.
async fn drive_session(state: &Arc<Mutex<IoState>>, stream: UnixStream) -> io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Ask for an immediate snapshot so the shifter reference seeds
    // before the first poll.
    writer.write_all(b"{\"cmd\":\"status\"}\n").await?;
    let mut heartbeat_due = Instant::now() + HEARTBEAT_PERIOD;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(()); // EOF
                };
                apply_line(state, &line).await;
            }
            _ = sleep_until(heartbeat_due) => {
                writer.write_all(b"{\"cmd\":\"heartbeat\"}\n").await?;
                heartbeat_due += HEARTBEAT_PERIOD;
            }
        }
    }
}

async fn apply_line(state: &Arc<Mutex<IoState>>, line: &str) {
    match serde_json::from_str::<IoMessage>(line) {
        Ok(IoMessage::Status { shifter_position, incline }) => {
            let mut s = state.lock().await;
            s.shifter_position = shifter_position;
            s.incline_bp = incline;
            debug!("status: shifter={} incline={} bp", shifter_position, incline);
        }
        Ok(IoMessage::Error { message }) => {
            warn!("trainer I/O error: {}", message);
        }
        Err(e) => debug!("ignoring trainer I/O line ({}): {}", e, line),
    }
}

/// Periodically feed the latest shifter position into the gear
/// controller. Runs until cancelled.
pub async fn run_shifter_poll(state: Arc<Mutex<IoState>>, controller: Arc<GearController>) {
    let mut poll = interval(SHIFTER_POLL_INTERVAL);
    loop {
        poll.tick().await;
        let position = {
            let s = state.lock().await;
            if !s.connected {
                continue;
            }
            s.shifter_position
        };
        controller.poll_shifter(position);
    }
}

/// Push an incline target to the trainer, 0.01% units. The whole
/// exchange is bounded by `COMMAND_TIMEOUT`.
pub async fn send_incline(socket_path: &str, bp: i32) -> io::Result<()> {
    let payload = format!("{{\"cmd\":\"incline\",\"value\":{}}}\n", bp);
    timeout(COMMAND_TIMEOUT, async {
        let mut stream = UnixStream::connect(socket_path).await?;
        stream.write_all(payload.as_bytes()).await?;
        stream.shutdown().await
    })
    .await
    .unwrap_or_else(|_| {
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "trainer I/O command timed out",
        ))
    })
}

/// `InclineSink` implementation over the I/O socket. Commands are
/// fire-and-forget; a failed apply is logged and superseded by the
/// next one.
pub struct SocketIncline {
    socket_path: String,
}

impl SocketIncline {
    pub fn new(socket_path: String) -> Self {
        SocketIncline { socket_path }
    }
}

impl InclineSink for SocketIncline {
    fn set_target_incline(&self, bp: i32) {
        let path = self.socket_path.clone();
        tokio::spawn(async move {
            match send_incline(&path, bp).await {
                Ok(()) => debug!("incline -> {} bp", bp),
                Err(e) => error!("incline command to {} failed: {}", path, e),
            }
        });
    }
}
