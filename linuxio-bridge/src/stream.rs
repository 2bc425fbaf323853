//! Stream-type dispatch for yamux substreams.
//!
//! Every substream begins with a `StreamFrame::StreamOpen` frame whose
//! payload is `"type\0arg1\0arg2..."`. The type selects a handler from the
//! registry below; everything after that first frame is the handler's own
//! business, framed as further `StreamFrame`s on the same substream.

use std::collections::HashMap;
use std::io::Read as _;

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use stream_proto::{BytesMut, Opcode, StreamFrame};
use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader};

use crate::error::StreamError;

pub type StreamHandler = fn(substream: yamux::Stream, args: Vec<String>) -> tokio::task::JoinHandle<()>;

#[derive(Default)]
pub struct StreamHandlerRegistry {
    handlers: HashMap<&'static str, StreamHandler>,
}

impl StreamHandlerRegistry {
    pub fn register(&mut self, stream_type: &'static str, handler: StreamHandler) {
        self.handlers.insert(stream_type, handler);
    }

    pub fn lookup(&self, stream_type: &str) -> Option<StreamHandler> {
        self.handlers.get(stream_type).copied()
    }
}

pub fn default_registry() -> StreamHandlerRegistry {
    let mut registry = StreamHandlerRegistry::default();
    registry.register("ping", spawn_ping);
    registry.register("terminal", spawn_terminal);
    registry.register("container-logs", spawn_container_logs);
    registry
}

/// Dispatches one accepted yamux substream: reads its opening
/// `StreamFrame`, looks up the handler by type, and spawns it.
pub async fn dispatch_substream(mut substream: yamux::Stream, registry: &StreamHandlerRegistry) -> Result<(), StreamError> {
    let mut header = [0u8; StreamFrame::HEADER_SIZE];
    substream.read_exact(&mut header).await?;
    let mut buf = BytesMut::from(&header[..]);

    let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    let mut payload = vec![0u8; length];
    substream.read_exact(&mut payload).await?;
    buf.extend_from_slice(&payload);

    let frame = StreamFrame::decode(&mut buf)?.expect("header plus exact payload decodes in one shot");
    if frame.opcode != Opcode::StreamOpen {
        return Err(StreamError::UnknownType(format!("expected STREAM_OPEN, got {}", frame.opcode)));
    }

    let (stream_type, args) = StreamFrame::parse_open_payload(&frame.payload)?;
    let args: Vec<String> = args.into_iter().map(str::to_owned).collect();

    let Some(handler) = registry.lookup(stream_type) else {
        return Err(StreamError::UnknownType(stream_type.to_owned()));
    };

    handler(substream, args);

    Ok(())
}

/// `ping`: echoes every `StreamData` frame back unchanged.
fn spawn_ping(mut substream: yamux::Stream, _args: Vec<String>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            let n = match substream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };

            let mut incoming = BytesMut::from(&buf[..n]);
            while let Ok(Some(frame)) = StreamFrame::decode(&mut incoming) {
                match frame.opcode {
                    Opcode::StreamData => {
                        let reply = StreamFrame::data(frame.stream_id, frame.payload);
                        let mut encoded = BytesMut::new();
                        if reply.encode(&mut encoded).is_err() || substream.write_all(&encoded).await.is_err() {
                            return;
                        }
                    }
                    Opcode::StreamClose => return,
                    _ => {}
                }
            }
        }
    })
}

/// `terminal`: spawns a PTY and relays data both ways, honoring
/// `StreamResize`.
fn spawn_terminal(mut substream: yamux::Stream, args: Vec<String>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let shell = args.first().cloned().unwrap_or_else(|| "/bin/bash".to_owned());

        let pty_system = native_pty_system();
        let pair = match pty_system.openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            Ok(pair) => pair,
            Err(error) => {
                warn!(%error, "failed to allocate pty for terminal stream");
                return;
            }
        };

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", "xterm-256color");

        let mut child = match pair.slave.spawn_command(cmd) {
            Ok(child) => child,
            Err(error) => {
                warn!(%error, "failed to spawn shell for terminal stream");
                return;
            }
        };
        drop(pair.slave);

        let mut pty_reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(_) => return,
        };
        let mut pty_writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(_) => return,
        };

        let (to_pty_tx, mut to_pty_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(64);
        let (from_pty_tx, mut from_pty_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(64);

        // portable_pty's reader/writer are blocking; run them on a
        // dedicated thread rather than the async runtime.
        std::thread::spawn(move || {
            let mut buf = [0u8; 8 * 1024];
            loop {
                match pty_reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if from_pty_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        std::thread::spawn(move || {
            use std::io::Write as _;
            while let Some(chunk) = to_pty_rx.blocking_recv() {
                if pty_writer.write_all(&chunk).is_err() {
                    break;
                }
            }
        });

        let stream_id_for_writes = 0u32;
        let mut read_buf = vec![0u8; 8 * 1024];

        loop {
            tokio::select! {
                from_pty = from_pty_rx.recv() => {
                    let Some(chunk) = from_pty else { break };
                    let frame = StreamFrame::data(stream_id_for_writes, chunk);
                    let mut encoded = BytesMut::new();
                    if frame.encode(&mut encoded).is_err() || substream.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
                read = substream.read(&mut read_buf) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut incoming = BytesMut::from(&read_buf[..n]);
                            while let Ok(Some(frame)) = StreamFrame::decode(&mut incoming) {
                                match frame.opcode {
                                    Opcode::StreamData => {
                                        if to_pty_tx.send(frame.payload.to_vec()).await.is_err() {
                                            break;
                                        }
                                    }
                                    Opcode::StreamResize => {
                                        if let Ok((cols, rows)) = StreamFrame::parse_resize_payload(&frame.payload) {
                                            let _ = pair.master.resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 });
                                        }
                                    }
                                    Opcode::StreamClose => {
                                        let _ = child.kill();
                                        return;
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                }
            }
        }

        let _ = child.kill();
    })
}

/// `container-logs`: tails lines from a path given as the stream's first
/// argument. Not a container runtime integration — a minimal stand-in that
/// exercises the registry with a second, differently-shaped stream type.
fn spawn_container_logs(mut substream: yamux::Stream, args: Vec<String>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(path) = args.first().cloned() else {
            warn!("container-logs stream opened without a path argument");
            return;
        };

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(error) => {
                warn!(%path, %error, "failed to open container-logs source");
                return;
            }
        };

        let mut lines = BufReader::new(file).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let mut payload = line.into_bytes();
                    payload.push(b'\n');
                    let frame = StreamFrame::data(0, payload);
                    let mut encoded = BytesMut::new();
                    if frame.encode(&mut encoded).is_err() || substream.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(%path, %error, "error reading container-logs source");
                    break;
                }
            }
        }

        let close = StreamFrame::close(0);
        let mut encoded = BytesMut::new();
        if close.encode(&mut encoded).is_ok() {
            let _ = substream.write_all(&encoded).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_all_three_default_stream_types() {
        let registry = default_registry();
        assert!(registry.lookup("ping").is_some());
        assert!(registry.lookup("terminal").is_some());
        assert!(registry.lookup("container-logs").is_some());
        assert!(registry.lookup("nonexistent").is_none());
    }
}
