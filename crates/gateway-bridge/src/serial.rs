//! Line-framed serial transport. `serialport`'s API is synchronous, so the
//! read side runs on a dedicated `spawn_blocking` task and feeds complete
//! lines back over an `mpsc` channel — the same shape the teacher uses to
//! bridge a blocking USB read into the async event loop, simplified here to
//! line-at-a-time framing since the wire form is textual.

use std::io::{BufRead, BufReader, Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::SerialConfig;

const LINE_CHANNEL_CAPACITY: usize = 32;

pub struct SerialLink {
    writer: Box<dyn SerialPort>,
    pub lines: mpsc::Receiver<std::io::Result<String>>,
    reader_task: JoinHandle<()>,
}

impl SerialLink {
    pub fn open(config: &SerialConfig) -> std::io::Result<Self> {
        let port = serialport::new(&config.port, config.baudrate)
            .timeout(Duration::from_millis(config.timeout_ms as u64))
            .open()?;
        let writer = port.try_clone()?;

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let reader_task = tokio::task::spawn_blocking(move || read_loop(port, tx));

        Ok(Self {
            writer,
            lines: rx,
            reader_task,
        })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes())
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Reads lines from `port` until EOF, a hard error, or the receiver is
/// dropped. Read timeouts are expected (the port is opened with a bounded
/// timeout) and are not treated as a hang — only a genuine I/O error is.
fn read_loop<R: Read>(port: R, tx: mpsc::Sender<std::io::Result<String>>) {
    let mut reader = BufReader::new(port);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if tx.blocking_send(Ok(line)).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(err) => {
                let _ = tx.blocking_send(Err(err));
                break;
            }
        }
    }
}
