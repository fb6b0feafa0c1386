//! Shared fixtures: an in-memory transport, client-side framing and a
//! behaviour that records what the engine reports.

#![allow(dead_code)]

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use wsloop::{
    consume, format_message, message_frame_size, ClientState, CloseReason, DeflationStream,
    InflationStream, OpCode, ProtocolHandler, SocketId, Transport, WebSocket, WebSocketBehavior,
    ZlibContext,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ----------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct WireState {
    pub sent: Vec<u8>,
    pub writes: usize,
    /// Bytes still accepted before writes block. `None` is unlimited.
    pub budget: Option<usize>,
    pub fin: bool,
    pub dropped: bool,
}

/// Transport whose far end the test keeps a handle to.
#[derive(Debug, Default, Clone)]
pub struct Wire(pub Rc<RefCell<WireState>>);

impl Wire {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throttled(budget: usize) -> Self {
        let wire = Self::new();
        wire.set_budget(Some(budget));
        wire
    }

    pub fn set_budget(&self, budget: Option<usize>) {
        self.0.borrow_mut().budget = budget;
    }

    pub fn take_sent(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.borrow_mut().sent)
    }

    pub fn writes(&self) -> usize {
        self.0.borrow().writes
    }

    pub fn is_fin(&self) -> bool {
        self.0.borrow().fin
    }

    /// The engine let go of its end.
    pub fn is_dropped(&self) -> bool {
        self.0.borrow().dropped
    }
}

impl Transport for Wire {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.0.borrow_mut();
        state.writes += 1;
        let accepted = match state.budget {
            Some(budget) => {
                let n = budget.min(data.len());
                state.budget = Some(budget - n);
                n
            }
            None => data.len(),
        };
        if accepted == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        state.sent.extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn shutdown(&mut self) {
        self.0.borrow_mut().fin = true;
    }
}

/// Marks the shared state when the engine drops its clone. Only the clone
/// handed to the engine carries one.
#[derive(Debug)]
pub struct OwnedWire(pub Wire);

impl Transport for OwnedWire {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.write(data)
    }

    fn shutdown(&mut self) {
        self.0.shutdown()
    }
}

impl Drop for OwnedWire {
    fn drop(&mut self) {
        self.0 .0.borrow_mut().dropped = true;
    }
}

// ----------------------------------------------------------------------
// Client-side framing
// ----------------------------------------------------------------------

/// A masked frame as a client would send it.
pub fn client_frame(payload: &[u8], opcode: OpCode, fin: bool) -> Vec<u8> {
    let mut frame = vec![0u8; message_frame_size::<false>(payload.len())];
    let length = format_message::<false>(&mut frame, payload, opcode, false, fin);
    frame.truncate(length);
    frame
}

/// A masked, RSV1-flagged frame carrying `payload` deflated.
pub fn client_compressed_frame(
    payload: &[u8],
    opcode: OpCode,
    stream: &mut DeflationStream,
    zlib: &mut ZlibContext,
    reset: bool,
) -> Vec<u8> {
    let compressed = stream.deflate(zlib, payload, reset).expect("deflates").to_vec();
    let mut frame = vec![0u8; message_frame_size::<false>(compressed.len())];
    let length = format_message::<false>(&mut frame, &compressed, opcode, true, true);
    frame.truncate(length);
    frame
}

/// An unmasked frame as a server would send it.
pub fn server_frame(payload: &[u8], opcode: OpCode, fin: bool) -> Vec<u8> {
    let mut frame = vec![0u8; message_frame_size::<true>(payload.len())];
    let length = format_message::<true>(&mut frame, payload, opcode, false, fin);
    frame.truncate(length);
    frame
}

// ----------------------------------------------------------------------
// Frame collection
// ----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    pub compressed: bool,
}

/// Parser handler that reassembles messages without any policy.
#[derive(Debug, Default)]
pub struct Collector {
    pub messages: Vec<Message>,
    pub closed: Option<CloseReason>,
    /// Refuse frames longer than this.
    pub max_payload: Option<u64>,
    pub data: Vec<u8>,
    pub control: Vec<u8>,
    pub compressed: bool,
}

impl Collector {
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.messages.iter().map(|m| m.payload.clone()).collect()
    }
}

impl ProtocolHandler for Collector {
    fn refuse_payload_length(&mut self, length: u64) -> bool {
        self.max_payload.is_some_and(|max| length > max)
    }

    fn set_compressed(&mut self) -> bool {
        self.compressed = true;
        true
    }

    fn force_close(&mut self, reason: CloseReason) {
        self.closed = Some(reason);
    }

    fn handle_fragment(&mut self, data: &[u8], remaining_bytes: u32, opcode: OpCode, fin: bool) -> bool {
        let (buffer, compressed) = if opcode.is_control() {
            (&mut self.control, false)
        } else {
            (&mut self.data, self.compressed)
        };
        buffer.extend_from_slice(data);
        if remaining_bytes == 0 && fin {
            let payload = std::mem::take(buffer);
            if !opcode.is_control() {
                self.compressed = false;
            }
            self.messages.push(Message {
                opcode,
                payload,
                compressed,
            });
        }
        false
    }
}

/// Decode everything a server wrote.
pub fn decode_server_output(bytes: &[u8]) -> Collector {
    let mut input = bytes.to_vec();
    let mut state = ClientState::new();
    let mut collector = Collector::default();
    consume(&mut input, &mut state, &mut collector);
    collector
}

/// Inflate a message the server compressed with a resetting compressor.
pub fn inflate_shared(payload: &[u8]) -> Vec<u8> {
    let mut zlib = ZlibContext::new();
    let mut stream = InflationStream::new(15);
    stream
        .inflate(&mut zlib, payload, usize::MAX, true)
        .map(<[u8]>::to_vec)
        .expect("server output inflates")
}

// ----------------------------------------------------------------------
// Behaviour
// ----------------------------------------------------------------------

/// Records callbacks and runs a few text commands:
/// `sub <topic>`, `unsub <topic>`, `pub <topic> <text>`, `end`, `close`.
#[derive(Debug, Default)]
pub struct Recorder {
    pub opened: Vec<SocketId>,
    pub messages: Vec<(SocketId, OpCode, Vec<u8>)>,
    pub pings: Vec<Vec<u8>>,
    pub pongs: Vec<Vec<u8>>,
    pub drains: usize,
    /// `(id, topic, new_count, old_count)`
    pub subscriptions: Vec<(SocketId, String, usize, usize)>,
    pub closes: Vec<(SocketId, u16, Vec<u8>)>,
    /// Send every message back.
    pub echo: bool,
    /// Ask for compression on echoes.
    pub compress_echo: bool,
}

impl Recorder {
    pub fn echo() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages
            .iter()
            .map(|(_, _, m)| String::from_utf8_lossy(m).into_owned())
            .collect()
    }
}

impl<T: Transport> WebSocketBehavior<T> for Recorder {
    fn on_open(&mut self, ws: &mut WebSocket<'_, T>) {
        self.opened.push(ws.id());
    }

    fn on_message(&mut self, ws: &mut WebSocket<'_, T>, message: &[u8], opcode: OpCode) {
        self.messages.push((ws.id(), opcode, message.to_vec()));

        if opcode == OpCode::Text {
            let text = String::from_utf8_lossy(message).into_owned();
            let mut words = text.splitn(3, ' ');
            match (words.next(), words.next(), words.next()) {
                (Some("sub"), Some(topic), None) => {
                    ws.subscribe(topic);
                    return;
                }
                (Some("unsub"), Some(topic), None) => {
                    ws.unsubscribe(topic);
                    return;
                }
                (Some("pub"), Some(topic), Some(body)) => {
                    ws.publish(topic, body.as_bytes(), OpCode::Text, false);
                    return;
                }
                (Some("end"), None, None) => {
                    ws.end(4000, b"bye");
                    return;
                }
                (Some("close"), None, None) => {
                    ws.close();
                    return;
                }
                _ => {}
            }
        }

        if self.echo {
            ws.send(message, opcode, self.compress_echo);
        }
    }

    fn on_ping(&mut self, _ws: &mut WebSocket<'_, T>, payload: &[u8]) {
        self.pings.push(payload.to_vec());
    }

    fn on_pong(&mut self, _ws: &mut WebSocket<'_, T>, payload: &[u8]) {
        self.pongs.push(payload.to_vec());
    }

    fn on_drain(&mut self, _ws: &mut WebSocket<'_, T>) {
        self.drains += 1;
    }

    fn on_subscription(&mut self, id: SocketId, topic: &str, new_count: usize, old_count: usize) {
        self.subscriptions.push((id, topic.to_string(), new_count, old_count));
    }

    fn on_close(&mut self, id: SocketId, code: u16, reason: &[u8]) {
        self.closes.push((id, code, reason.to_vec()));
    }
}
