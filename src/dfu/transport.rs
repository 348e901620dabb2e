//! Serial transport: connection lifecycle, background reader and the
//! stop-and-wait acknowledgement exchange.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::bytes::HexBytes;
use super::config::{
    TransportConfig, ACK_POLL_INTERVAL, DTR_LOW_TIME, DTR_RESET_WAIT_TIME, MAX_PACKET_ATTEMPTS,
    SEQUENCE_MODULUS, SERIAL_PORT_OPEN_WAIT_TIME,
};
use super::error::{DfuError, DfuResult};
use super::events::{DfuEvent, EventBus, EventKind};
use super::packet::{self, AckFrame, Packet, PacketKind, SequenceCounter};
use super::port::{PortConnector, SerialLink, SerialPortConnector};
use super::slip;

/// Lifecycle of the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Closing,
}

// ============================================================================
// Pacing
// ============================================================================

/// Performs the timed waits the bootloader needs (settle, reset, flash).
pub trait Pacer: Send {
    fn pause(&self, duration: Duration);
}

/// Blocks the calling thread for the requested time.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

// ============================================================================
// Receive Buffer
// ============================================================================

/// Bytes accumulated by the background reader.
#[derive(Debug, Default, Clone)]
pub(crate) struct ReceiveBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl ReceiveBuffer {
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn append(&self, data: &[u8]) {
        self.lock().extend_from_slice(data);
    }

    pub(crate) fn delimiter_count(&self) -> usize {
        slip::count_delimiters(&self.lock())
    }

    /// Drain everything buffered so far under a single lock.
    pub(crate) fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.lock())
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }
}

// ============================================================================
// Background Reader
// ============================================================================

/// Handle to the reader thread.
struct ReadLoop {
    running: Arc<AtomicBool>,
    lost: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReadLoop {
    fn spawn(link: Box<dyn SerialLink>, buffer: ReceiveBuffer) -> DfuResult<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let lost = Arc::new(AtomicBool::new(false));

        let handle = thread::Builder::new().name("dfu-reader".into()).spawn({
            let running = Arc::clone(&running);
            let lost = Arc::clone(&lost);
            move || read_loop(link, buffer, running, lost)
        })?;

        Ok(Self {
            running,
            lost,
            handle: Some(handle),
        })
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("[SERIAL] Reader thread panicked");
            }
        }
    }
}

fn read_loop(
    mut link: Box<dyn SerialLink>,
    buffer: ReceiveBuffer,
    running: Arc<AtomicBool>,
    lost: Arc<AtomicBool>,
) {
    let mut chunk = [0u8; 256];

    while running.load(Ordering::Acquire) {
        match link.read(&mut chunk) {
            Ok(0) => continue,
            Ok(n) => {
                debug!("[RECV] {} bytes: {}", n, HexBytes(&chunk[..n]));
                buffer.append(&chunk[..n]);
            }
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    error!("[SERIAL] Error reading from port: {}", e);
                    lost.store(true, Ordering::Release);
                }
                break;
            }
        }
    }

    debug!("[SERIAL] Reader stopped");
}

// ============================================================================
// Transport
// ============================================================================

/// One serial DFU connection.
///
/// Owns the port, the receive buffer, the packet sequence counter and the
/// event subscriptions. All exchanges take `&mut self`, so at most one packet
/// is ever awaiting its acknowledgement.
pub struct DfuTransport {
    config: TransportConfig,
    connector: Box<dyn PortConnector>,
    pacer: Box<dyn Pacer>,
    state: ConnectionState,
    writer: Option<Mutex<Box<dyn SerialLink>>>,
    reader: Option<ReadLoop>,
    rx: ReceiveBuffer,
    sequence: SequenceCounter,
    last_ack: Option<u8>,
    rebase_ack: bool,
    events: EventBus,
}

impl DfuTransport {
    pub fn new(config: TransportConfig, connector: impl PortConnector + 'static) -> Self {
        Self {
            config,
            connector: Box::new(connector),
            pacer: Box::new(ThreadPacer),
            state: ConnectionState::Closed,
            writer: None,
            reader: None,
            rx: ReceiveBuffer::default(),
            sequence: SequenceCounter::new(),
            last_ack: None,
            rebase_ack: false,
            events: EventBus::new(),
        }
    }

    /// Transport over a real serial port.
    pub fn serial(config: TransportConfig) -> Self {
        Self::new(config, SerialPortConnector)
    }

    /// Replace the pacer used for timed waits.
    pub fn with_pacer(mut self, pacer: impl Pacer + 'static) -> Self {
        self.pacer = Box::new(pacer);
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Sequence number of the most recently framed packet.
    pub fn sequence_number(&self) -> u8 {
        self.sequence.current()
    }

    /// Last accepted acknowledgement number, if any in this session.
    pub fn last_ack(&self) -> Option<u8> {
        self.last_ack
    }

    pub fn on<F>(&mut self, kind: EventKind, callback: F)
    where
        F: Fn(&DfuEvent) + Send + 'static,
    {
        self.events.on(kind, callback);
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn emit(&self, event: &DfuEvent) {
        self.events.emit(event);
    }

    /// Wait through the configured pacer.
    pub fn pause(&self, duration: Duration) {
        self.pacer.pause(duration);
    }

    /// Frame a command with the next sequence number of this session.
    pub fn frame_packet(&mut self, kind: PacketKind, payload: Vec<u8>) -> DfuResult<Packet> {
        Packet::with_kind(&mut self.sequence, kind, payload)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Acquire the port, reset the device into its bootloader and start the
    /// background reader.
    pub fn open(&mut self) -> DfuResult<()> {
        if self.state == ConnectionState::Open && self.link_lost() {
            warn!(
                "[SERIAL] Link to {} was lost, reconnecting",
                self.config.port_name
            );
            self.drop_lost_link();
        }

        match self.state {
            ConnectionState::Open => {
                warn!("[SERIAL] Port {} is already open", self.config.port_name);
                return Ok(());
            }
            ConnectionState::Opening => {
                warn!("[SERIAL] Port {} is already opening", self.config.port_name);
                return Ok(());
            }
            ConnectionState::Closed | ConnectionState::Closing => {}
        }

        self.state = ConnectionState::Opening;
        info!(
            "[SERIAL] Opening {} at {} baud (flow control: {})",
            self.config.port_name, self.config.baud_rate, self.config.flow_control
        );

        match self.establish() {
            Ok((writer, reader)) => {
                self.writer = Some(Mutex::new(writer));
                self.reader = Some(reader);
                self.sequence.reset();
                self.last_ack = None;
                self.rebase_ack = false;
                self.state = ConnectionState::Open;
                info!("[SERIAL] Transport open on {}", self.config.port_name);
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Closed;
                let err = match err {
                    DfuError::OpenFailed { .. } => err,
                    other => DfuError::OpenFailed {
                        port: self.config.port_name.clone(),
                        reason: other.to_string(),
                    },
                };
                error!("[SERIAL] {}", err);
                self.events.emit(&DfuEvent::Error {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn establish(&mut self) -> DfuResult<(Box<dyn SerialLink>, ReadLoop)> {
        let started = Instant::now();
        let mut link = self.connector.connect(&self.config)?;
        info!(
            "[SERIAL] Port opened in {:.3} s",
            started.elapsed().as_secs_f64()
        );

        self.pacer.pause(SERIAL_PORT_OPEN_WAIT_TIME);

        if self.config.skip_reset {
            info!("[SERIAL] Skipping DTR reset (device already in bootloader mode)");
        } else {
            self.toggle_dtr(link.as_mut());
        }

        self.rx.clear();
        let reader = ReadLoop::spawn(link.try_clone_link()?, self.rx.clone())?;
        Ok((link, reader))
    }

    /// Pulse DTR to reset the device into its bootloader.
    fn toggle_dtr(&self, link: &mut dyn SerialLink) {
        debug!("[SERIAL] Toggling DTR to reset the device");

        let result = link.set_dtr(false).and_then(|()| {
            self.pacer.pause(DTR_LOW_TIME);
            link.set_dtr(true)
        });

        match result {
            Ok(()) => self.pacer.pause(DTR_RESET_WAIT_TIME),
            Err(e) => warn!("[SERIAL] Could not toggle DTR, continuing: {}", e),
        }
    }

    /// Stop the reader and release the port. Errors are logged only.
    pub fn close(&mut self) {
        match self.state {
            ConnectionState::Closed | ConnectionState::Closing => return,
            ConnectionState::Open | ConnectionState::Opening => {}
        }

        self.state = ConnectionState::Closing;
        info!("[SERIAL] Closing {}", self.config.port_name);

        if let Some(mut reader) = self.reader.take() {
            reader.stop();
        }

        if let Some(writer) = self.writer.take() {
            let mut link = writer.into_inner().unwrap_or_else(PoisonError::into_inner);
            match link.close() {
                Ok(()) => info!("[SERIAL] Port closed"),
                Err(e) => error!("[SERIAL] Error closing port: {}", e),
            }
        }

        self.rx.clear();
        self.last_ack = None;
        self.rebase_ack = false;
        self.state = ConnectionState::Closed;
    }

    /// Tear down a connection whose device went away. The next `open()`
    /// reconnects from scratch.
    fn drop_lost_link(&mut self) {
        error!("[SERIAL] Device on {} was lost", self.config.port_name);
        self.close();
    }

    // ------------------------------------------------------------------------
    // Exchange
    // ------------------------------------------------------------------------

    /// Send a packet and wait for its acknowledgement with the default timeout.
    pub fn send_packet(&mut self, packet: &Packet) -> DfuResult<u8> {
        let timeout = self.config.ack_timeout();
        self.send_packet_within(packet, timeout)
    }

    /// Send a packet and wait up to `timeout` per attempt for its
    /// acknowledgement.
    ///
    /// Retries resend the identical frame. Returns the accepted ACK number.
    pub fn send_packet_within(&mut self, packet: &Packet, timeout: Duration) -> DfuResult<u8> {
        if !self.is_open() {
            return Err(DfuError::TransportNotOpen);
        }

        info!("[SEND] {}", packet);
        debug!("[SEND] Raw: {}", HexBytes(packet.wire_bytes()));

        // A timeout restarted the counter; the peer now acks this packet's
        // own sequence number plus one.
        if std::mem::take(&mut self.rebase_ack) && self.last_ack.is_some() {
            debug!("[SEND] Re-basing expected ACK on sequence {}", packet.sequence());
            self.last_ack = Some(packet.sequence());
        }

        let started = Instant::now();
        let mut last_failure = None;

        for attempt in 1..=MAX_PACKET_ATTEMPTS {
            debug!(
                "[SEND] Attempt {}/{}: {} bytes",
                attempt,
                MAX_PACKET_ATTEMPTS,
                packet.wire_bytes().len()
            );

            match self.exchange(packet, timeout) {
                Ok(ack) => match self.last_ack {
                    Some(last) if ack != (last + 1) % SEQUENCE_MODULUS => {
                        let expected = (last + 1) % SEQUENCE_MODULUS;
                        warn!("[SEND] Expected ACK {} but got {}", expected, ack);
                        last_failure = Some(DfuError::SequenceMismatch {
                            expected,
                            actual: ack,
                        });
                    }
                    previous => {
                        if previous.is_none() {
                            debug!("[SEND] First ACK of session, accepting {}", ack);
                        }
                        self.last_ack = Some(ack);
                        info!(
                            "[SEND] Acknowledged (ack={}) after {} attempt(s) in {:.3} s",
                            ack,
                            attempt,
                            started.elapsed().as_secs_f64()
                        );
                        return Ok(ack);
                    }
                },
                Err(err) if err.is_retriable() => {
                    warn!("[SEND] Attempt {} failed: {}", attempt, err);
                    last_failure = Some(err);
                }
                Err(err) => {
                    error!("[SEND] {} failed: {}", packet, err);
                    if matches!(err, DfuError::DeviceLost) && self.is_open() {
                        self.drop_lost_link();
                    }
                    return Err(err);
                }
            }
        }

        let last = last_failure.unwrap_or(DfuError::AckTimeout);
        error!(
            "[SEND] Giving up on {} after {} attempts: {}",
            packet, MAX_PACKET_ATTEMPTS, last
        );
        Err(DfuError::ThreeFailedAttempts {
            sequence: packet.sequence(),
            last: Box::new(last),
        })
    }

    fn exchange(&mut self, packet: &Packet, timeout: Duration) -> DfuResult<u8> {
        self.write_frame(packet.wire_bytes())?;
        self.get_ack_nr(timeout)
    }

    fn write_frame(&self, data: &[u8]) -> DfuResult<()> {
        let writer = self.writer.as_ref().ok_or(DfuError::TransportNotOpen)?;
        let result = {
            let mut link = writer.lock().unwrap_or_else(PoisonError::into_inner);
            link.write_all(data)
        };

        match result {
            Ok(()) => Ok(()),
            Err(DfuError::Io(e)) if is_disconnect(&e) => {
                error!("[SEND] Device disconnected: {}", e);
                Err(DfuError::DeviceLost)
            }
            Err(e) if self.link_lost() => {
                error!("[SEND] Write failed on a lost link: {}", e);
                Err(DfuError::DeviceLost)
            }
            Err(e) => Err(e),
        }
    }

    fn link_lost(&self) -> bool {
        self.reader.as_ref().is_some_and(ReadLoop::is_lost)
    }

    /// Wait for a complete reply frame and return its ACK number.
    pub fn get_ack_nr(&mut self, timeout: Duration) -> DfuResult<u8> {
        let started = Instant::now();

        while self.rx.delimiter_count() < 2 {
            if self.link_lost() {
                self.drop_lost_link();
                return Err(DfuError::DeviceLost);
            }
            if started.elapsed() > timeout {
                return Err(self.ack_timed_out(started));
            }
            thread::sleep(ACK_POLL_INTERVAL);
        }

        let raw = self.rx.take();
        debug!(
            "[RECV] Reply after {:.3} s: {}",
            started.elapsed().as_secs_f64(),
            HexBytes(&raw)
        );

        let reply = extract_ack(&raw)?;
        if !reply.checksum_valid {
            warn!("[RECV] Reply CRC mismatch, using ACK field anyway");
        }
        debug!(
            "[RECV] seq={} ack={} type={} len={} integrity={} reliable={}",
            reply.sequence,
            reply.ack,
            reply.packet_type,
            reply.length,
            reply.data_integrity,
            reply.reliable
        );
        Ok(reply.ack)
    }

    fn ack_timed_out(&mut self, started: Instant) -> DfuError {
        let buffered = self.rx.take();
        error!(
            "[RECV] Timed out after {:.3} s waiting for ACK",
            started.elapsed().as_secs_f64()
        );
        if buffered.is_empty() {
            error!("[RECV] Receive buffer is empty");
        } else {
            error!(
                "[RECV] Receive buffer ({} bytes): {}",
                buffered.len(),
                HexBytes(&buffered)
            );
        }

        self.sequence.reset();
        self.rebase_ack = true;
        self.events.emit(&DfuEvent::Timeout {
            message: "Timed out waiting for acknowledgement from device".to_string(),
        });

        DfuError::AckTimeout
    }
}

impl Drop for DfuTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DfuTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DfuTransport")
            .field("port", &self.config.port_name)
            .field("state", &self.state)
            .field("sequence", &self.sequence.current())
            .field("last_ack", &self.last_ack)
            .finish_non_exhaustive()
    }
}

fn extract_ack(raw: &[u8]) -> DfuResult<AckFrame> {
    let body = packet::decode_reply(raw)?;
    if body.is_empty() {
        return Err(DfuError::ShortResponse);
    }
    AckFrame::parse(&body)
}

fn is_disconnect(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::UnexpectedEof
    )
}
