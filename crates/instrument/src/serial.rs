// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Async bridge onto a blocking serial port.
//!
//! `serialport` is synchronous; a dedicated OS thread owns the port and
//! services requests sent over a channel, the same shape
//! `trappitsch-instrumentRs`'s `SerialInterfaceLakeshore` uses a blocking
//! `serialport::new(...)` builder underneath. Framing (uppercase, `\n`
//! terminator, connect-before-send, disconnect-on-I/O-error) follows
//! `agent.py`'s `SerialAgent.send`/`receive`.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::Error;

enum Op {
    Send { msg: String, raw: bool, reply: oneshot::Sender<Result<(), Error>> },
    Query { msg: String, raw: bool, reply: oneshot::Sender<Result<String, Error>> },
}

/// A handle to a background thread owning one serial port.
#[derive(Clone)]
pub struct SerialChannel {
    tx: mpsc::Sender<Op>,
}

impl SerialChannel {
    /// Spawn the worker thread and open the port. Mirrors `SerialAgent`'s
    /// lazy, reconnect-on-failure connection semantics: the worker keeps
    /// retrying its own internal reconnect rather than the caller managing it.
    pub fn open(port: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        let port = port.into();
        let (tx, rx) = mpsc::channel::<Op>(32);
        std::thread::spawn(move || serial_worker(port, baud_rate, timeout, rx));
        Self { tx }
    }

    /// Send a command with no expected response (`agent.py`'s `send`).
    pub async fn send(&self, msg: &str) -> Result<(), Error> {
        self.send_inner(msg, false).await
    }

    /// Send a command and read one line back (`agent.py`'s `send` + `receive`).
    pub async fn query(&self, msg: &str) -> Result<String, Error> {
        self.query_inner(msg, false).await
    }

    /// Send a bare byte sequence as-is: no uppercasing, no `\n` terminator.
    /// `currentduinoAgent.py`'s `Currentduino.send` writes its single-character
    /// tokens (`'o'`/`'c'`/`'?'`) directly, bypassing `SerialAgent.format_msg`.
    pub async fn send_raw(&self, msg: &str) -> Result<(), Error> {
        self.send_inner(msg, true).await
    }

    /// Raw-framed query counterpart to [`Self::send_raw`].
    pub async fn query_raw(&self, msg: &str) -> Result<String, Error> {
        self.query_inner(msg, true).await
    }

    async fn send_inner(&self, msg: &str, raw: bool) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Op::Send { msg: msg.to_owned(), raw, reply: reply_tx })
            .await
            .map_err(|_| Error::WorkerGone)?;
        reply_rx.await.map_err(|_| Error::WorkerGone)?
    }

    async fn query_inner(&self, msg: &str, raw: bool) -> Result<String, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Op::Query { msg: msg.to_owned(), raw, reply: reply_tx })
            .await
            .map_err(|_| Error::WorkerGone)?;
        reply_rx.await.map_err(|_| Error::WorkerGone)?
    }
}

/// Uppercase, strip, and terminate — `SerialAgent.format_msg`/`send`.
fn format_msg(msg: &str) -> String {
    format!("{}\n", msg.trim().to_uppercase())
}

fn serial_worker(port: String, baud_rate: u32, timeout: Duration, mut rx: mpsc::Receiver<Op>) {
    let mut conn: Option<Box<dyn serialport::SerialPort>> = None;

    while let Some(op) = rx.blocking_recv() {
        if conn.is_none() {
            debug!(%port, baud_rate, "connecting to serial port");
            match serialport::new(&port, baud_rate).timeout(timeout).open() {
                Ok(c) => conn = Some(c),
                Err(source) => {
                    error!(%port, %source, "serial connect failed");
                    reply_error(op, Error::Transport { port: port.clone(), source });
                    continue;
                }
            }
        }

        let Some(device) = conn.as_deref_mut() else {
            // Unreachable: the branch above either connects or `continue`s.
            reply_error(op, Error::WorkerGone);
            continue;
        };

        let result = match &op {
            Op::Send { msg, raw, .. } => write_line(device, msg, *raw),
            Op::Query { msg, raw, .. } => write_line(device, msg, *raw).and_then(|_| read_line(device)),
        };

        if let Err(WorkerIoError::Io(_)) = result {
            debug!(%port, "serial I/O error, dropping connection for reconnect");
            conn = None;
        }

        match op {
            Op::Send { reply, .. } => {
                let _ = reply.send(result.map(|_| ()).map_err(|e| e.into_error(&port)));
            }
            Op::Query { reply, .. } => {
                let _ = reply.send(result.map_err(|e| e.into_error(&port)));
            }
        }
    }
}

fn reply_error(op: Op, err: Error) {
    match op {
        Op::Send { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Op::Query { reply, .. } => {
            let _ = reply.send(Err(err));
        }
    }
}

enum WorkerIoError {
    Io(std::io::Error),
}

impl WorkerIoError {
    fn into_error(self, port: &str) -> Error {
        match self {
            WorkerIoError::Io(source) => Error::Transport {
                port: port.to_owned(),
                source: serialport::Error::new(serialport::ErrorKind::Io(source.kind()), source.to_string()),
            },
        }
    }
}

fn write_line(port: &mut dyn serialport::SerialPort, msg: &str, raw: bool) -> Result<String, WorkerIoError> {
    use std::io::Write;
    let framed = if raw { msg.to_owned() } else { format_msg(msg) };
    debug!(msg = %framed.trim_end(), raw, "serial write");
    port.write_all(framed.as_bytes()).map_err(WorkerIoError::Io)?;
    Ok(String::new())
}

fn read_line(port: &mut dyn serialport::SerialPort) -> Result<String, WorkerIoError> {
    use std::io::{BufRead, BufReader};
    let mut reader = BufReader::new(port);
    let mut line = String::new();
    reader.read_line(&mut line).map_err(WorkerIoError::Io)?;
    Ok(line.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_uppercase_with_newline() {
        assert_eq!(format_msg(" tval? "), "TVAL?\n");
    }
}
