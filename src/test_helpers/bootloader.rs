use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::dfu::config::{HCI_PACKET_TYPE_ACK, SEQUENCE_MODULUS};
use crate::dfu::error::{DfuError, DfuResult};
use crate::dfu::packet::{decode_reply, HciHeader, PacketKind};
use crate::dfu::port::{MockPortConnector, SerialLink};
use crate::dfu::slip;

/// How the scripted bootloader answers one written frame.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Acknowledge with `(sequence + 1) % 8`, like real hardware.
    InOrder,
    /// Acknowledge with a fixed number.
    Ack(u8),
    /// Say nothing.
    Silent,
    /// Send these bytes verbatim.
    Raw(Vec<u8>),
}

/// A frame the host wrote, decoded.
#[derive(Debug, Clone)]
pub struct WrittenFrame {
    pub header: HciHeader,
    pub payload: Vec<u8>,
}

impl WrittenFrame {
    pub fn kind(&self) -> Option<PacketKind> {
        PacketKind::from_payload(&self.payload)
    }
}

struct State {
    inbound: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    dtr: Vec<bool>,
    script: VecDeque<Reply>,
    fallback: Reply,
    connected: bool,
    closed: bool,
    has_dtr: bool,
    connects: usize,
}

/// In-memory bootloader peer.
///
/// Every clone shares one state, so the handle kept by a test observes what
/// the transport's writer and reader handles did.
#[derive(Clone)]
pub struct ScriptedBootloader {
    state: Arc<Mutex<State>>,
}

impl ScriptedBootloader {
    /// A peer that acknowledges every frame in order.
    pub fn new() -> Self {
        Self::with_fallback(Reply::InOrder)
    }

    /// A peer that never answers.
    pub fn silent() -> Self {
        Self::with_fallback(Reply::Silent)
    }

    fn with_fallback(fallback: Reply) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                inbound: VecDeque::new(),
                writes: Vec::new(),
                dtr: Vec::new(),
                script: VecDeque::new(),
                fallback,
                connected: true,
                closed: false,
                has_dtr: true,
                connects: 0,
            })),
        }
    }

    /// Queue replies for the next frames; the fallback applies afterwards.
    pub fn script(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.lock().script.extend(replies);
        self
    }

    /// Make every DTR change fail, like adapters without the line.
    pub fn without_dtr(self) -> Self {
        self.lock().has_dtr = false;
        self
    }

    /// Connector handing out links to this peer.
    pub fn connector(&self) -> MockPortConnector {
        let device = self.clone();
        let mut connector = MockPortConnector::new();
        connector.expect_connect().returning(move |_| {
            {
                let mut state = device.lock();
                state.connects += 1;
                state.closed = false;
            }
            let link: Box<dyn SerialLink> = Box::new(device.clone());
            Ok(link)
        });
        connector
    }

    /// Simulate unplugging the device.
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    /// Plug the device back in with an empty line.
    pub fn reconnect(&self) {
        let mut state = self.lock();
        state.connected = true;
        state.inbound.clear();
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    /// Every written frame, SLIP-decoded and split into header and payload.
    pub fn frames(&self) -> Vec<WrittenFrame> {
        self.writes()
            .iter()
            .map(|wire| {
                let body = decode_reply(wire).unwrap();
                let header = HciHeader::parse(&body).unwrap();
                let end = HciHeader::LEN + usize::from(header.length);
                WrittenFrame {
                    header,
                    payload: body[HciHeader::LEN..end].to_vec(),
                }
            })
            .collect()
    }

    /// Kinds of the written frames, in order.
    pub fn kinds(&self) -> Vec<Option<PacketKind>> {
        self.frames().iter().map(WrittenFrame::kind).collect()
    }

    pub fn dtr_history(&self) -> Vec<bool> {
        self.lock().dtr.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

impl Default for ScriptedBootloader {
    fn default() -> Self {
        Self::new()
    }
}

fn ack_frame(ack: u8) -> Vec<u8> {
    let header = HciHeader {
        sequence: 0,
        ack,
        data_integrity: false,
        reliable: false,
        packet_type: HCI_PACKET_TYPE_ACK,
        length: 0,
    };
    slip::frame(&header.to_bytes())
}

fn unplugged() -> DfuError {
    DfuError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"))
}

impl SerialLink for ScriptedBootloader {
    fn write_all(&mut self, data: &[u8]) -> DfuResult<()> {
        let mut state = self.lock();
        if !state.connected {
            return Err(unplugged());
        }
        state.writes.push(data.to_vec());

        let sequence = decode_reply(data)
            .and_then(|body| HciHeader::parse(&body))
            .map(|header| header.sequence)
            .unwrap_or(0);

        let reply = state
            .script
            .pop_front()
            .unwrap_or_else(|| state.fallback.clone());
        let bytes = match reply {
            Reply::InOrder => ack_frame((sequence + 1) % SEQUENCE_MODULUS),
            Reply::Ack(n) => ack_frame(n),
            Reply::Silent => Vec::new(),
            Reply::Raw(bytes) => bytes,
        };
        state.inbound.extend(bytes);
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8]) -> DfuResult<usize> {
        {
            let mut state = self.lock();
            if !state.connected {
                return Err(unplugged());
            }
            if !state.inbound.is_empty() {
                let n = buffer.len().min(state.inbound.len());
                for (slot, byte) in buffer.iter_mut().zip(state.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }

        thread::sleep(Duration::from_millis(2));
        Ok(0)
    }

    fn set_dtr(&mut self, level: bool) -> DfuResult<()> {
        let mut state = self.lock();
        if !state.has_dtr {
            return Err(DfuError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "no DTR line",
            )));
        }
        state.dtr.push(level);
        Ok(())
    }

    fn try_clone_link(&self) -> DfuResult<Box<dyn SerialLink>> {
        Ok(Box::new(self.clone()))
    }

    fn close(&mut self) -> DfuResult<()> {
        self.lock().closed = true;
        Ok(())
    }
}
