//! Pre-flight diagnostics.
//!
//! Small checks run from the CLI before (or instead of) starting the bridge:
//! is the socket port free, does the serial port open, and does the attached
//! device loop data back intact at the configured baud rate.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::debug;

use crate::core::{DEFAULT_FRAME_TIMEOUT, DiagError};
use crate::framing::{FrameParser, Framer, ParserConfig, encode_frame};

/// DZRP loopback command byte understood by the device's test firmware.
const CMD_LOOPBACK: u8 = 15;

/// Sequence number used for every loopback packet.
const LOOPBACK_SEQNO: u8 = 1;

/// Counters collected by one [`run_loopback`] run.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackReport {
    /// Payload bytes written to the device.
    pub bytes_sent: u64,
    /// Payload bytes echoed back and verified.
    pub bytes_received: u64,
    /// Packets written to the device.
    pub packets_sent: u64,
    /// Complete batches echoed back.
    pub packets_received: u64,
    /// Wall-clock time the exchange ran for.
    pub elapsed: Duration,
}

impl LoopbackReport {
    /// Verified inbound throughput in bytes per second.
    pub fn bytes_per_sec(&self) -> f64 {
        self.bytes_received as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }

    /// Complete echoed batches per second.
    pub fn packets_per_sec(&self) -> f64 {
        self.packets_received as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }
}

/// Check whether the bridge's TCP port can be bound.
///
/// Returns `Ok(false)` when something else already listens there; any other
/// bind failure is reported as the error it is.
pub async fn socket_port_available(port: u16) -> io::Result<bool> {
    match TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await {
        Ok(listener) => {
            drop(listener);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Ok(false),
        Err(e) => Err(e),
    }
}

/// Check that the serial port opens at the given baud rate.
#[cfg(feature = "serial")]
pub fn probe_serial(path: &str, baud: u32) -> Result<(), DiagError> {
    let stream = crate::link::open_serial_stream(path, baud)?;
    drop(stream);
    Ok(())
}

/// Open the serial port and run the loopback exchange against the device.
#[cfg(feature = "serial")]
pub async fn serial_loopback(
    path: &str,
    baud: u32,
    duration: Duration,
    batch_size: usize,
) -> Result<LoopbackReport, DiagError> {
    let stream = crate::link::open_serial_stream(path, baud)?;
    tracing::info!(path, baud, "serial loopback started");
    run_loopback(stream, duration, batch_size).await
}

/// Exchange loopback packets over `stream` for `duration`.
///
/// Each packet is a length-prefixed frame carrying a sequence number, the
/// loopback command, and `batch_size` bytes of an incrementing pattern. The
/// device echoes the sequence number and the pattern back; every echoed byte
/// is verified against the expected continuation. A gap longer than the
/// per-frame window aborts the run with [`DiagError::NoData`], a pattern
/// break with [`DiagError::Corrupt`].
pub async fn run_loopback<S>(
    stream: S,
    duration: Duration,
    batch_size: usize,
) -> Result<LoopbackReport, DiagError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut parser = FrameParser::new(ParserConfig::default().channel("loopback"));
    let mut report = LoopbackReport::default();

    let started = Instant::now();
    let deadline = started + duration;
    let mut last_sent: u8 = 0;
    let mut last_received: u8 = 0;
    let mut batch_received: usize = 0;
    let mut buf = vec![0u8; 4096];

    send_batch(&mut wr, batch_size, &mut last_sent, &mut report).await?;

    loop {
        let res = tokio::select! {
            _ = sleep_until(deadline) => break,
            res = timeout(DEFAULT_FRAME_TIMEOUT, rd.read(&mut buf)) => res,
        };
        let n = match res {
            Ok(io_res) => io_res?,
            Err(_) => return Err(DiagError::NoData),
        };
        if n == 0 {
            debug!("loopback stream closed");
            break;
        }
        for frame in parser.feed(&buf[..n])? {
            // The first payload byte is the echoed sequence number; the rest
            // must continue the incrementing pattern.
            for &byte in frame.iter().skip(1) {
                last_received = last_received.wrapping_add(1);
                if byte != last_received {
                    return Err(DiagError::Corrupt {
                        bytes_received: report.bytes_received,
                    });
                }
            }
            report.bytes_received += frame.len() as u64;
            batch_received += frame.len();
            if batch_received >= batch_size {
                batch_received -= batch_size;
                report.packets_received += 1;
                send_batch(&mut wr, batch_size, &mut last_sent, &mut report).await?;
            }
        }
    }

    report.elapsed = started.elapsed();
    Ok(report)
}

async fn send_batch<W>(
    wr: &mut W,
    batch_size: usize,
    last_sent: &mut u8,
    report: &mut LoopbackReport,
) -> Result<(), DiagError>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = Vec::with_capacity(2 + batch_size);
    payload.push(LOOPBACK_SEQNO);
    payload.push(CMD_LOOPBACK);
    for _ in 0..batch_size {
        *last_sent = last_sent.wrapping_add(1);
        payload.push(*last_sent);
    }
    wr.write_all(&encode_frame(&payload)).await?;
    report.bytes_sent += batch_size as u64;
    report.packets_sent += 1;
    Ok(())
}
