//! Relays between a browser's WebSocket connection and the yamux-backed
//! Unix socket connection to a session's bridge process.
//!
//! Two distinct framings meet here. Over the WebSocket, every binary
//! message carries a small header — `[streamId:u32-be][flags:u8][payload]`
//! with `flags` one of `SYN`/`DATA`/`FIN`/`RST` — that this module parses
//! and nothing else; payloads are opaque and never inspected. Each `SYN`
//! lazily opens a yamux substream (cached by stream id for the life of the
//! connection) and writes a `StreamFrame::open` into it carrying the SYN
//! payload as the stream-open argument string; `DATA` frames become
//! `StreamFrame::data`; `FIN` forwards its payload then leaves the
//! substream's read half open; `RST` closes and forgets the substream
//! without telling the bridge.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{self, WebSocket};
use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use futures::{SinkExt as _, StreamExt as _};
use stream_proto::StreamFrame;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::{mpsc, Mutex};

const HEADER_SIZE: usize = 4 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    Syn,
    Data,
    Fin,
    Rst,
}

impl Flag {
    const SYN: u8 = 0x01;
    const DATA: u8 = 0x04;
    const FIN: u8 = 0x08;
    const RST: u8 = 0x10;

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            Self::SYN => Some(Flag::Syn),
            Self::DATA => Some(Flag::Data),
            Self::FIN => Some(Flag::Fin),
            Self::RST => Some(Flag::Rst),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Flag::Syn => Self::SYN,
            Flag::Data => Self::DATA,
            Flag::Fin => Self::FIN,
            Flag::Rst => Self::RST,
        }
    }
}

struct WsFrame {
    stream_id: u32,
    flag: Flag,
    payload: Bytes,
}

impl WsFrame {
    fn parse(mut buf: Bytes) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let stream_id = buf.get_u32();
        let flag = Flag::from_byte(buf.get_u8())?;
        Some(Self {
            stream_id,
            flag,
            payload: buf,
        })
    }

    fn encode(stream_id: u32, flag: Flag, payload: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        out.put_u32(stream_id);
        out.put_u8(flag.to_byte());
        out.put_slice(payload);
        out.to_vec()
    }
}

type OutboundWs = Arc<Mutex<futures::stream::SplitSink<WebSocket, ws::Message>>>;
type OpenStreams = Arc<Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>>;

/// Drives one WebSocket connection for the lifetime of the session,
/// multiplexing every logical stream it opens over `control`, a handle onto
/// the bridge's yamux connection shared with every other WebSocket for the
/// same session. `close_rx` fires once if the session store tears the
/// session down while this WebSocket is still open, in which case the
/// browser is sent a `1008` close frame instead of just being dropped.
pub async fn run_relay(socket: WebSocket, control: yamux::Control, mut close_rx: mpsc::UnboundedReceiver<()>) -> anyhow::Result<()> {
    let (ws_tx, mut ws_rx) = socket.split();
    let ws_tx: OutboundWs = Arc::new(Mutex::new(ws_tx));
    let open_streams: OpenStreams = Arc::new(Mutex::new(HashMap::new()));

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let Some(msg) = msg else { break };
                if !handle_ws_message(msg?, control.clone(), Arc::clone(&ws_tx), Arc::clone(&open_streams)).await? {
                    break;
                }
            }
            _ = close_rx.recv() => {
                let frame = ws::CloseFrame {
                    code: 1008,
                    reason: "session expired".into(),
                };
                let mut ws = ws_tx.lock().await;
                let _ = ws.send(ws::Message::Close(Some(frame))).await;
                break;
            }
        }
    }

    Ok(())
}

async fn handle_ws_message(
    msg: ws::Message,
    control: yamux::Control,
    ws_tx: OutboundWs,
    open_streams: OpenStreams,
) -> anyhow::Result<bool> {
    let raw = match msg {
        ws::Message::Binary(payload) => payload,
        ws::Message::Close(_) => return Ok(false),
        ws::Message::Ping(_) | ws::Message::Pong(_) | ws::Message::Text(_) => return Ok(true),
    };

    let Some(frame) = WsFrame::parse(Bytes::from(raw.to_vec())) else {
        return Ok(true);
    };

    match frame.flag {
        Flag::Syn => open_substream(frame.stream_id, frame.payload, control, ws_tx, open_streams).await?,
        Flag::Data | Flag::Fin => {
            let streams = open_streams.lock().await;
            if let Some(tx) = streams.get(&frame.stream_id) {
                let _ = tx.send(frame.payload.to_vec()).await;
            }
        }
        Flag::Rst => {
            open_streams.lock().await.remove(&frame.stream_id);
        }
    }

    Ok(true)
}

async fn open_substream(
    stream_id: u32,
    open_args: Bytes,
    mut control: yamux::Control,
    ws_tx: OutboundWs,
    open_streams: OpenStreams,
) -> anyhow::Result<()> {
    // A race against another SYN for the same id loses here: whichever
    // open_stream() call returns second discovers the id already taken and
    // its substream is simply dropped without a RST back to the browser.
    {
        let streams = open_streams.lock().await;
        if streams.contains_key(&stream_id) {
            return Ok(());
        }
    }

    let mut substream = control.open_stream().await?;

    let open_frame = StreamFrame::open(stream_id, open_args);
    let mut encoded = stream_proto::BytesMut::new();
    open_frame.encode(&mut encoded)?;
    substream.write_all(&encoded).await?;

    let (data_tx, mut data_rx) = mpsc::channel::<Vec<u8>>(64);
    {
        let mut streams = open_streams.lock().await;
        if streams.contains_key(&stream_id) {
            return Ok(());
        }
        streams.insert(stream_id, data_tx);
    }

    tokio::spawn(async move {
        let mut read_buf = vec![0u8; 16 * 1024];
        loop {
            tokio::select! {
                to_bridge = data_rx.recv() => {
                    let Some(payload) = to_bridge else { break };
                    let data_frame = StreamFrame::data(stream_id, payload);
                    let mut encoded = stream_proto::BytesMut::new();
                    if data_frame.encode(&mut encoded).is_err() {
                        break;
                    }
                    if substream.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
                read = substream.read(&mut read_buf) => {
                    match read {
                        Ok(0) | Err(_) => {
                            let payload = WsFrame::encode(stream_id, Flag::Fin, &[]);
                            let mut ws = ws_tx.lock().await;
                            let _ = ws.send(ws::Message::Binary(payload.into())).await;
                            break;
                        }
                        Ok(n) => {
                            let payload = WsFrame::encode(stream_id, Flag::Data, &read_buf[..n]);
                            let mut ws = ws_tx.lock().await;
                            if ws.send(ws::Message::Binary(payload.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_data_frame_header() {
        let encoded = WsFrame::encode(42, Flag::Data, b"hello");
        let frame = WsFrame::parse(Bytes::from(encoded)).expect("valid frame");
        assert_eq!(frame.stream_id, 42);
        assert_eq!(frame.flag, Flag::Data);
        assert_eq!(&frame.payload[..], b"hello");
    }

    #[test]
    fn rejects_a_frame_shorter_than_the_header() {
        assert!(WsFrame::parse(Bytes::from_static(&[0, 0])).is_none());
    }

    #[test]
    fn rejects_an_unknown_flag_byte() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0xFF);
        assert!(WsFrame::parse(buf.freeze()).is_none());
    }
}
