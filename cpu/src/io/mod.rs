//! The peripheral controllers.  Each owns its registers and raises
//! pending-task bits through the simulator's poll queue; the
//! simulator routes the task-specific BS/F1/F2 codes here.
pub mod disk;
pub mod display;
pub mod ethernet;
pub mod keyboard;
pub mod mouse;
mod pollq;
pub mod udp;

pub use disk::Disk;
pub use display::Display;
pub use ethernet::{Ethernet, Transport, TransportError};
pub use keyboard::Keyboard;
pub use mouse::Mouse;
pub use pollq::PollQueue;
pub use udp::UdpTransport;
