//! The Ethernet controller and the abstract transport it talks
//! through.
//!
//! The controller exposes the function codes the Ethernet task's
//! microcode uses; everything that actually moves bytes is behind
//! the [`Transport`] trait, so the simulator does not care whether
//! frames ride a UDP socket or a test fixture.
use std::error::Error;
use std::fmt::{self, Display, Formatter};

use tracing::{event, Level};

use base::Task;

/// How the Ethernet reaches other machines.
pub trait Transport: Send {
    /// Discard the packet being assembled.
    fn clear_tx(&mut self);
    /// Append one word to the packet being assembled.
    fn append_tx(&mut self, data: u16) -> Result<(), TransportError>;
    /// Transmit the assembled packet.
    fn send(&mut self) -> Result<(), TransportError>;
    /// Allow or drop incoming packets.
    fn enable_rx(&mut self, enable: bool);
    /// Discard the packet being consumed.
    fn clear_rx(&mut self);
    /// The next word of the current packet (zero when exhausted).
    fn get_rx_data(&mut self) -> u16;
    /// Bytes left in the current packet.
    fn has_rx_data(&self) -> usize;
    /// Take the next packet from the receive queue; returns its
    /// byte length (zero when none is waiting).
    fn receive(&mut self) -> Result<usize, TransportError>;
}

/// Transport failures.  Protocol-level problems are logged and the
/// offending packet dropped; these are the errors the caller sees.
#[derive(Debug)]
pub enum TransportError {
    /// The packet under assembly outgrew the wire format.
    TxOverflow,
    /// A socket operation failed.
    Io(std::io::Error),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            TransportError::TxOverflow => f.write_str("transmit buffer overflow"),
            TransportError::Io(e) => write!(f, "transport I/O error: {e}"),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Cycles between polls of the transport for received frames.
pub const RX_POLL_CYCLES: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoState {
    Idle,
    Output,
    Input,
}

/// The controller proper.
pub struct Ethernet {
    /// Station address; the high byte is what RSNF serves to the
    /// emulator.
    pub address: u16,
    status: u16,
    state: IoState,
    /// Start requests posted by STARTF and not yet taken by the
    /// Ethernet task.
    pending_start: u16,
    /// One-word lookahead for the input-look function.
    looked: Option<u16>,
    transport: Option<Box<dyn Transport>>,
}

impl Ethernet {
    pub fn new() -> Ethernet {
        Ethernet {
            address: 0x2200,
            status: 0,
            state: IoState::Idle,
            pending_start: 0,
            looked: None,
            transport: None,
        }
    }

    pub fn set_transport(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
    }

    pub fn set_address(&mut self, address: u16) {
        self.address = address;
    }

    pub fn reset(&mut self) {
        self.status = 0;
        self.state = IoState::Idle;
        self.pending_start = 0;
        self.looked = None;
        if let Some(t) = self.transport.as_mut() {
            t.clear_tx();
            t.clear_rx();
            t.enable_rx(true);
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// F1=STARTF<- in the emulator task.  The low bus bits request
    /// controller starts; posting one wakes the Ethernet task.
    pub fn startf(&mut self, bus: u16) -> bool {
        self.pending_start |= bus & 0x3;
        self.pending_start != 0
    }

    /// The bus contribution of F1=RSNF<-.
    pub fn rsnf_bus(&self) -> u16 {
        self.address & 0xFF00
    }

    /// The bus contribution of F1=EPFCT (post): serve and clear the
    /// status word.
    pub fn post_bus(&mut self) -> u16 {
        let status = self.status;
        self.status = 0;
        status
    }

    /// The bus contribution of F1=EILFCT (input look): the next
    /// input word, without consuming it.
    pub fn input_look_bus(&mut self) -> u16 {
        if self.looked.is_none() {
            if let Some(t) = self.transport.as_mut() {
                self.looked = Some(t.get_rx_data());
            }
        }
        self.looked.unwrap_or(0)
    }

    /// The bus contribution of BS=EIDFCT (input data): consume the
    /// next input word.
    pub fn input_data_bus(&mut self) -> u16 {
        if let Some(word) = self.looked.take() {
            return word;
        }
        self.transport
            .as_mut()
            .map(|t| t.get_rx_data())
            .unwrap_or(0)
    }

    /// F2=EODFCT: the bus carries the next output word.
    pub fn output_data(&mut self, bus: u16) {
        if let Some(t) = self.transport.as_mut() {
            if let Err(e) = t.append_tx(bus) {
                event!(Level::WARN, "ethernet output word dropped: {e}");
            }
        }
    }

    /// F2=EOSFCT: start an output operation.
    pub fn output_start(&mut self) {
        self.state = IoState::Output;
        self.pending_start &= !0x1;
        if let Some(t) = self.transport.as_mut() {
            t.clear_tx();
        }
    }

    /// F2=EEFCT: end the current transmission.
    pub fn end_transmission(&mut self) {
        if let Some(t) = self.transport.as_mut() {
            match t.send() {
                Ok(()) => self.status |= 0x0001,
                Err(e) => {
                    event!(Level::WARN, "ethernet send failed: {e}");
                    self.status |= 0x0002;
                }
            }
        }
        self.state = IoState::Idle;
    }

    /// F2=EISFCT: start an input operation.
    pub fn input_start(&mut self) {
        self.state = IoState::Input;
        self.pending_start &= !0x2;
        self.looked = None;
        if let Some(t) = self.transport.as_mut() {
            t.enable_rx(true);
            t.clear_rx();
        }
    }

    /// F2=ERBFCT: branch on posted start requests.
    pub fn branch_on_start(&self) -> u16 {
        self.pending_start << 2
    }

    /// F2=EBFCT: branch when the controller has something to do.
    pub fn branch_on_busy(&self) -> u16 {
        u16::from(self.state != IoState::Idle || self.pending_start != 0) << 2
    }

    /// F2=ECBFCT: branch when input data is waiting.
    pub fn branch_on_rx_data(&self) -> u16 {
        let waiting = self.looked.is_some()
            || self
                .transport
                .as_ref()
                .map(|t| t.has_rx_data() > 0)
                .unwrap_or(false);
        u16::from(waiting) << 2
    }

    /// The register dump the debugger prints.
    pub fn registers_string(&self) -> String {
        format!(
            "ADDR : {:06o}   STAT : {:06o}   START: {:02o}       STATE: {:?}\n\
             RXBUF: {} bytes",
            self.address,
            self.status,
            self.pending_start,
            self.state,
            self.transport
                .as_ref()
                .map(|t| t.has_rx_data())
                .unwrap_or(0),
        )
    }

    /// Periodic poll: pull the next frame out of the transport and
    /// wake the Ethernet task when there is one (or when a start
    /// request is pending).  Returns the pending bits to raise.
    pub fn tick(&mut self) -> u16 {
        let mut wake = self.pending_start != 0;
        if let Some(t) = self.transport.as_mut() {
            if t.has_rx_data() == 0 {
                match t.receive() {
                    Ok(0) => (),
                    Ok(_) => wake = true,
                    Err(e) => event!(Level::WARN, "ethernet receive failed: {e}"),
                }
            } else {
                wake = true;
            }
        }
        if wake {
            Task::Ethernet.mask()
        } else {
            0
        }
    }
}

impl Default for Ethernet {
    fn default() -> Ethernet {
        Ethernet::new()
    }
}

impl fmt::Debug for Ethernet {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("Ethernet")
            .field("address", &self.address)
            .field("status", &self.status)
            .field("state", &self.state)
            .field("pending_start", &self.pending_start)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// An in-process transport: packets sent come straight back as
    /// receivable packets, framed like the wire format.
    #[derive(Default)]
    pub struct LoopbackTransport {
        tx: Vec<u16>,
        queue: VecDeque<Vec<u16>>,
        current: Vec<u16>,
        rx_pos: usize,
        rx_enabled: bool,
    }

    impl LoopbackTransport {
        pub fn new() -> LoopbackTransport {
            LoopbackTransport {
                rx_enabled: true,
                ..LoopbackTransport::default()
            }
        }
    }

    impl Transport for LoopbackTransport {
        fn clear_tx(&mut self) {
            self.tx.clear();
        }

        fn append_tx(&mut self, data: u16) -> Result<(), TransportError> {
            if self.tx.len() >= 510 {
                return Err(TransportError::TxOverflow);
            }
            self.tx.push(data);
            Ok(())
        }

        fn send(&mut self) -> Result<(), TransportError> {
            if self.rx_enabled {
                self.queue.push_back(std::mem::take(&mut self.tx));
            } else {
                self.tx.clear();
            }
            Ok(())
        }

        fn enable_rx(&mut self, enable: bool) {
            self.rx_enabled = enable;
            if !enable {
                self.queue.clear();
            }
        }

        fn clear_rx(&mut self) {
            self.current.clear();
            self.rx_pos = 0;
        }

        fn get_rx_data(&mut self) -> u16 {
            let word = self.current.get(self.rx_pos).copied().unwrap_or(0);
            self.rx_pos += 1;
            word
        }

        fn has_rx_data(&self) -> usize {
            2 * self.current.len().saturating_sub(self.rx_pos)
        }

        fn receive(&mut self) -> Result<usize, TransportError> {
            if self.has_rx_data() == 0 {
                match self.queue.pop_front() {
                    Some(packet) => {
                        self.rx_pos = 0;
                        self.current = packet;
                    }
                    None => {
                        self.current.clear();
                        self.rx_pos = 0;
                    }
                }
            }
            Ok(2 * self.current.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::LoopbackTransport;
    use super::*;

    fn looped() -> Ethernet {
        let mut ether = Ethernet::new();
        ether.set_transport(Box::new(LoopbackTransport::new()));
        ether
    }

    #[test]
    fn output_then_input_round_trips() {
        let mut ether = looped();
        ether.output_start();
        ether.output_data(0x1234);
        ether.output_data(0x5678);
        ether.end_transmission();

        // The poll notices the waiting frame and wakes the task.
        assert_eq!(ether.tick(), Task::Ethernet.mask());
        assert_eq!(ether.branch_on_rx_data(), 1 << 2);
        assert_eq!(ether.input_data_bus(), 0x1234);
        assert_eq!(ether.input_data_bus(), 0x5678);
    }

    #[test]
    fn look_does_not_consume() {
        let mut ether = looped();
        ether.output_start();
        ether.output_data(0xAAAA);
        ether.end_transmission();
        ether.tick();
        assert_eq!(ether.input_look_bus(), 0xAAAA);
        assert_eq!(ether.input_look_bus(), 0xAAAA);
        assert_eq!(ether.input_data_bus(), 0xAAAA);
    }

    #[test]
    fn startf_posts_and_branches() {
        let mut ether = looped();
        assert!(ether.startf(0x1));
        assert_eq!(ether.branch_on_start(), 1 << 2);
        assert_eq!(ether.tick(), Task::Ethernet.mask());
        ether.output_start();
        assert_eq!(ether.branch_on_start(), 0);
    }

    #[test]
    fn post_serves_and_clears_status() {
        let mut ether = looped();
        ether.output_start();
        ether.end_transmission();
        assert_eq!(ether.post_bus(), 0x0001);
        assert_eq!(ether.post_bus(), 0);
    }

    #[test]
    fn rsnf_serves_the_address_high_byte() {
        let mut ether = Ethernet::new();
        ether.set_address(0x4267);
        assert_eq!(ether.rsnf_bus(), 0x4200);
    }
}
