//! The UDP transport: Alto Ethernet frames carried in broadcast UDP
//! datagrams.
//!
//! Wire format: a big-endian word count, then that many big-endian
//! data words.  Two further bytes are reserved in the receive path
//! for the fake checksum the microcode expects to find after the
//! data; they are never transmitted.
//!
//! A dedicated thread drains the socket into an 8192-byte ring
//! buffer.  The ring is the only state shared between that thread and
//! the CPU thread, and one mutex guards all of it, the shutdown flag
//! included.  When the ring cannot take another maximum-size packet
//! the receiver backs off for a millisecond rather than dropping.
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{event, Level};

use super::ethernet::{Transport, TransportError};

/// The port Alto emulators talk to each other on.
pub const UDP_PORT: u16 = 42424;

/// Maximum packet size, fake-checksum allowance included.
pub const UDP_PACKET_SIZE: usize = 1024;

/// Size of the shared receive ring.
pub const UDP_RING_BUFFER_SIZE: usize = 8192;

/// Bytes reserved at the end of a received packet for the checksum
/// word that is not transmitted.
const FAKE_CHECKSUM_BYTES: usize = 2;

/// The mutex-guarded shared state: the ring plus the shutdown flag.
struct Shared {
    ring: Box<[u8; UDP_RING_BUFFER_SIZE]>,
    start: usize,
    used: usize,
    rx_enable: bool,
    running: bool,
}

impl Shared {
    fn free(&self) -> usize {
        UDP_RING_BUFFER_SIZE - self.used
    }

    fn push(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.free());
        let mut at = (self.start + self.used) % UDP_RING_BUFFER_SIZE;
        for &b in bytes {
            self.ring[at] = b;
            at = (at + 1) % UDP_RING_BUFFER_SIZE;
        }
        self.used += bytes.len();
    }

    fn pop(&mut self, dst: &mut [u8]) {
        debug_assert!(dst.len() <= self.used);
        for slot in dst.iter_mut() {
            *slot = self.ring[self.start];
            self.start = (self.start + 1) % UDP_RING_BUFFER_SIZE;
        }
        self.used -= dst.len();
    }

    fn peek_word(&self) -> u16 {
        let hi = self.ring[self.start];
        let lo = self.ring[(self.start + 1) % UDP_RING_BUFFER_SIZE];
        (u16::from(hi) << 8) | u16::from(lo)
    }
}

pub struct UdpTransport {
    socket: UdpSocket,
    dest: SocketAddr,
    tx_buf: Vec<u8>,
    rx_buf: Vec<u8>,
    rx_pos: usize,
    rx_len: usize,
    shared: Arc<Mutex<Shared>>,
    thread: Option<JoinHandle<()>>,
}

impl UdpTransport {
    /// The production configuration: bound to the well-known port,
    /// transmitting to the local broadcast address.
    pub fn new() -> Result<UdpTransport, TransportError> {
        UdpTransport::bind(
            UDP_PORT,
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, UDP_PORT)),
        )
    }

    /// A transport bound to an arbitrary port and peer, for tests
    /// and point-to-point setups.
    pub fn bind(port: u16, dest: SocketAddr) -> Result<UdpTransport, TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(TransportError::Io)?;
        socket.set_broadcast(true).map_err(TransportError::Io)?;

        let shared = Arc::new(Mutex::new(Shared {
            ring: Box::new([0; UDP_RING_BUFFER_SIZE]),
            start: 0,
            used: 0,
            rx_enable: true,
            running: true,
        }));

        let thread_socket = socket.try_clone().map_err(TransportError::Io)?;
        thread_socket
            .set_read_timeout(Some(Duration::from_millis(10)))
            .map_err(TransportError::Io)?;
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("udp-transport-rx".to_string())
            .spawn(move || receive_thread(thread_socket, thread_shared))
            .map_err(TransportError::Io)?;

        Ok(UdpTransport {
            socket,
            dest,
            tx_buf: Vec::with_capacity(UDP_PACKET_SIZE),
            rx_buf: vec![0; UDP_PACKET_SIZE],
            rx_pos: 0,
            rx_len: 0,
            shared,
            thread: Some(thread),
        })
    }
}

impl Transport for UdpTransport {
    fn clear_tx(&mut self) {
        self.tx_buf.clear();
    }

    fn append_tx(&mut self, data: u16) -> Result<(), TransportError> {
        if self.tx_buf.is_empty() {
            // Reserve the length prefix.
            self.tx_buf.extend_from_slice(&[0, 0]);
        }
        if self.tx_buf.len() + 2 + FAKE_CHECKSUM_BYTES > UDP_PACKET_SIZE {
            return Err(TransportError::TxOverflow);
        }
        self.tx_buf.push((data >> 8) as u8);
        self.tx_buf.push(data as u8);
        Ok(())
    }

    fn send(&mut self) -> Result<(), TransportError> {
        if self.tx_buf.is_empty() {
            self.tx_buf.extend_from_slice(&[0, 0]);
        }
        let count = (self.tx_buf.len() / 2 - 1) as u16;
        self.tx_buf[0] = (count >> 8) as u8;
        self.tx_buf[1] = count as u8;
        self.socket
            .send_to(&self.tx_buf, self.dest)
            .map_err(TransportError::Io)?;
        self.tx_buf.clear();
        Ok(())
    }

    fn enable_rx(&mut self, enable: bool) {
        let mut shared = self.shared.lock().expect("udp transport mutex poisoned");
        if !enable {
            shared.start = 0;
            shared.used = 0;
        }
        shared.rx_enable = enable;
    }

    fn clear_rx(&mut self) {
        self.rx_pos = 0;
        self.rx_len = 0;
    }

    fn get_rx_data(&mut self) -> u16 {
        if self.rx_pos >= self.rx_len {
            return 0;
        }
        if self.rx_pos == 0 {
            // Skip the length prefix.  `receive` resets `rx_pos` to
            // zero exactly once per packet, so this branch cannot
            // re-fire mid-packet.
            self.rx_pos = 2;
        }
        let data = (u16::from(self.rx_buf[self.rx_pos]) << 8)
            | u16::from(self.rx_buf[self.rx_pos + 1]);
        self.rx_pos += 2;
        data
    }

    fn has_rx_data(&self) -> usize {
        self.rx_len.saturating_sub(self.rx_pos)
    }

    fn receive(&mut self) -> Result<usize, TransportError> {
        if self.rx_len == 0 {
            let mut shared = self.shared.lock().expect("udp transport mutex poisoned");
            if shared.used >= 2 {
                let count = usize::from(shared.peek_word());
                // Prefix and fake-checksum words on top of the data.
                let len = 2 * (count + 2);
                if len > shared.used {
                    event!(
                        Level::WARN,
                        "ring holds a truncated packet ({len} > {}); dropping all of it",
                        shared.used
                    );
                    shared.start = 0;
                    shared.used = 0;
                } else {
                    shared.pop(&mut self.rx_buf[..len]);
                    self.rx_pos = 0;
                    self.rx_len = len;
                }
            }
        }
        Ok(self.rx_len)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.running = false;
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn receive_thread(socket: UdpSocket, shared: Arc<Mutex<Shared>>) {
    let mut pkt_buf = [0u8; UDP_PACKET_SIZE];
    loop {
        {
            let state = shared.lock().expect("udp transport mutex poisoned");
            if !state.running {
                break;
            }
            if state.free() < UDP_PACKET_SIZE {
                drop(state);
                thread::sleep(Duration::from_millis(1));
                continue;
            }
        }

        // Two bytes of the buffer stay reserved for the fake
        // checksum, which is never on the wire.
        let received = match socket.recv_from(&mut pkt_buf[..UDP_PACKET_SIZE - FAKE_CHECKSUM_BYTES])
        {
            Ok((n, _)) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                event!(Level::ERROR, "udp receive failed: {e}");
                break;
            }
        };
        if received < 2 {
            continue;
        }

        let count = usize::from((u16::from(pkt_buf[0]) << 8) | u16::from(pkt_buf[1]));
        let packet_len = 2 * count + 2;
        if packet_len > received {
            event!(
                Level::WARN,
                "dropping malformed packet: {packet_len} byte frame in {received} byte datagram"
            );
            continue;
        }
        // Anything after the frame is padding; the stored length
        // includes the fake checksum allowance.
        let stored = packet_len + FAKE_CHECKSUM_BYTES;

        let mut state = shared.lock().expect("udp transport mutex poisoned");
        if !state.rx_enable {
            continue;
        }
        if state.free() < stored {
            event!(Level::WARN, "receive ring full; dropping a packet");
            continue;
        }
        pkt_buf[packet_len..stored].fill(0);
        state.push(&pkt_buf[..stored]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(port_a: u16, port_b: u16) -> (UdpTransport, UdpTransport) {
        let local = Ipv4Addr::LOCALHOST;
        let a = UdpTransport::bind(port_a, SocketAddr::V4(SocketAddrV4::new(local, port_b)))
            .expect("bind transport a");
        let b = UdpTransport::bind(port_b, SocketAddr::V4(SocketAddrV4::new(local, port_a)))
            .expect("bind transport b");
        (a, b)
    }

    fn receive_with_patience(t: &mut UdpTransport) -> usize {
        for _ in 0..200 {
            let n = t.receive().expect("receive");
            if n > 0 {
                return n;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("no packet arrived");
    }

    #[test]
    fn loopback_round_trip() {
        let (mut a, mut b) = pair(34101, 34102);
        a.append_tx(0x1234).unwrap();
        a.append_tx(0x5678).unwrap();
        a.send().unwrap();

        // Frame: 2-word count prefix + 2 words + fake checksum.
        let len = receive_with_patience(&mut b);
        assert_eq!(len, 2 * (2 + 2));
        assert_eq!(b.has_rx_data(), len);
        assert_eq!(b.get_rx_data(), 0x1234);
        assert_eq!(b.get_rx_data(), 0x5678);
        // What remains is the fake checksum allowance.
        assert_eq!(b.has_rx_data(), FAKE_CHECKSUM_BYTES);
    }

    #[test]
    fn long_frames_round_trip_word_for_word() {
        let (mut a, mut b) = pair(34103, 34104);
        let words: Vec<u16> = (0..510u16).map(|i| i.wrapping_mul(257)).collect();
        for &w in &words {
            a.append_tx(w).unwrap();
        }
        // One more word does not fit the wire format.
        assert!(matches!(a.append_tx(0), Err(TransportError::TxOverflow)));
        a.send().unwrap();

        receive_with_patience(&mut b);
        for &w in &words {
            assert_eq!(b.get_rx_data(), w);
        }
    }

    #[test]
    fn packets_queue_in_the_ring() {
        let (mut a, mut b) = pair(34105, 34106);
        for word in [0x1111u16, 0x2222, 0x3333] {
            a.append_tx(word).unwrap();
            a.send().unwrap();
        }
        for expected in [0x1111u16, 0x2222, 0x3333] {
            receive_with_patience(&mut b);
            assert_eq!(b.get_rx_data(), expected);
            b.clear_rx();
        }
    }

    #[test]
    fn disabled_rx_drops_packets() {
        let (mut a, mut b) = pair(34107, 34108);
        b.enable_rx(false);
        a.append_tx(0xDEAD).unwrap();
        a.send().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(b.receive().unwrap(), 0);

        b.enable_rx(true);
        a.append_tx(0xBEEF).unwrap();
        a.send().unwrap();
        receive_with_patience(&mut b);
        assert_eq!(b.get_rx_data(), 0xBEEF);
    }
}
