//! UDP transport for the MAVLink adapter.
//!
//! Same wire behaviour as `mavlink`'s own `udpin`/`udpout` connections, but
//! `recv` returns a timeout error every [`RECV_POLL`] instead of blocking
//! forever, so the reader thread sees a closed adapter and lets the socket go.

use mavlink::common::MavMessage;
use mavlink::error::{MessageReadError, MessageWriteError};
use mavlink::{MavConnection, MavHeader, MavlinkVersion};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Mutex;
use std::time::Duration;

use crate::lock;

pub const RECV_POLL: Duration = Duration::from_millis(100);

struct RecvBuf {
    data: Vec<u8>,
    start: usize,
    end: usize,
}

pub struct UdpLink {
    socket: UdpSocket,
    /// Where sends go. A listening link learns it from the first datagram.
    dest: Mutex<Option<SocketAddr>>,
    listening: bool,
    rx: Mutex<RecvBuf>,
    version: MavlinkVersion,
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, format!("{} does not resolve", addr)))
}

impl UdpLink {
    /// Binds `addr` and waits for the vehicle to send first.
    pub fn listen(addr: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind(resolve(addr)?)?;
        Self::new(socket, None, true)
    }

    /// Binds an ephemeral port and sends to `addr`.
    pub fn dial(addr: &str) -> io::Result<Self> {
        let dest = resolve(addr)?;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Self::new(socket, Some(dest), false)
    }

    fn new(socket: UdpSocket, dest: Option<SocketAddr>, listening: bool) -> io::Result<Self> {
        socket.set_read_timeout(Some(RECV_POLL))?;
        Ok(Self {
            socket,
            dest: Mutex::new(dest),
            listening,
            rx: Mutex::new(RecvBuf { data: vec![0; 65536], start: 0, end: 0 }),
            version: MavlinkVersion::V2,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl MavConnection<MavMessage> for UdpLink {
    fn recv(&self) -> Result<(MavHeader, MavMessage), MessageReadError> {
        let mut guard = lock(&self.rx);
        let rx = &mut *guard;
        loop {
            if rx.start >= rx.end {
                let (len, src) = self.socket.recv_from(&mut rx.data)?;
                rx.start = 0;
                rx.end = len;
                if self.listening {
                    *lock(&self.dest) = Some(src);
                }
            }

            let mut pending = &rx.data[rx.start..rx.end];
            let before = pending.len();
            let parsed = mavlink::read_versioned_msg(&mut pending, self.version);
            let consumed = before - pending.len();
            // a frame that does not parse is dropped with the rest of its datagram
            rx.start = if consumed == 0 { rx.end } else { rx.start + consumed };
            if parsed.is_ok() {
                return parsed;
            }
        }
    }

    fn send(&self, header: &MavHeader, data: &MavMessage) -> Result<usize, MessageWriteError> {
        let Some(dest) = *lock(&self.dest) else {
            return Ok(0);
        };
        let mut buf = Vec::new();
        mavlink::write_versioned_msg(&mut buf, self.version, *header, data)?;
        Ok(self.socket.send_to(&buf, dest)?)
    }

    fn set_protocol_version(&mut self, version: MavlinkVersion) {
        self.version = version;
    }

    fn get_protocol_version(&self) -> MavlinkVersion {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{MavAutopilot, MavModeFlag, MavState, MavType, HEARTBEAT_DATA};
    use std::time::Instant;

    fn heartbeat() -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_PX4,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_STANDBY,
            mavlink_version: 3,
        })
    }

    #[test]
    fn recv_gives_up_after_the_poll_interval() {
        let link = UdpLink::listen("127.0.0.1:0").unwrap();
        let started = Instant::now();
        assert!(link.recv().is_err());
        assert!(started.elapsed() < RECV_POLL * 10);
    }

    #[test]
    fn listener_answers_the_sender() {
        let fc = UdpLink::listen("127.0.0.1:0").unwrap();
        let gcs = UdpLink::dial(&fc.local_addr().unwrap().to_string()).unwrap();
        let hdr = MavHeader { system_id: 1, component_id: 1, sequence: 7 };
        gcs.send(&hdr, &heartbeat()).unwrap();

        let (got, msg) = fc.recv().unwrap();
        assert_eq!(got.system_id, 1);
        assert!(matches!(msg, MavMessage::HEARTBEAT(_)));

        // the listener now knows where to reply
        assert!(fc.send(&hdr, &heartbeat()).unwrap() > 0);
        assert!(gcs.recv().is_ok());
    }
}
