//! Minimal synchronous route-netlink client: open a socket, send a request,
//! and block for the ack. No dump support, no async runtime — the engine is
//! clone/fork-based throughout and this keeps netif setup on the same model.

use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL,
    NLM_F_REQUEST,
};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};

use crate::error::{JailError, Result};

pub struct NetlinkSocket {
    socket: Socket,
    seq: u32,
}

impl NetlinkSocket {
    pub fn open() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| JailError::protocol(format!("opening rtnetlink socket: {}", e)))?;
        socket
            .bind_auto()
            .map_err(|e| JailError::protocol(format!("binding rtnetlink socket: {}", e)))?;
        socket
            .connect(&SocketAddr::new(0, 0))
            .map_err(|e| JailError::protocol(format!("connecting rtnetlink socket: {}", e)))?;
        Ok(Self { socket, seq: 0 })
    }

    /// Sends `payload` as a request with `NLM_F_REQUEST|NLM_F_ACK` (plus
    /// `extra_flags`, e.g. `NLM_F_CREATE|NLM_F_EXCL` for creation requests)
    /// and blocks for the kernel's ack. A nonzero `NLMSG_ERROR` code is
    /// surfaced as a `ProtocolError` carrying `strerror(-err)`.
    pub fn request(&mut self, payload: RouteNetlinkMessage, extra_flags: u16) -> Result<()> {
        self.seq += 1;

        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST | NLM_F_ACK | extra_flags;
        header.sequence_number = self.seq;

        let mut message = NetlinkMessage::new(header, NetlinkPayload::from(payload));
        message.finalize();

        let mut buf = vec![0u8; message.buffer_len()];
        message.serialize(&mut buf);

        self.socket
            .send(&buf, 0)
            .map_err(|e| JailError::protocol(format!("sending rtnetlink request: {}", e)))?;

        self.recv_ack()
    }

    pub fn create(&mut self, payload: RouteNetlinkMessage) -> Result<()> {
        self.request(payload, NLM_F_CREATE | NLM_F_EXCL)
    }

    fn recv_ack(&mut self) -> Result<()> {
        let mut buf = vec![0u8; 4096];
        loop {
            let n = self
                .socket
                .recv(&mut buf, 0)
                .map_err(|e| JailError::protocol(format!("reading rtnetlink reply: {}", e)))?;

            let parsed = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[..n])
                .map_err(|e| JailError::protocol(format!("decoding rtnetlink reply: {}", e)))?;

            match parsed.payload {
                NetlinkPayload::Error(e) => {
                    return match e.code {
                        None => Ok(()),
                        Some(_) => Err(JailError::protocol(format!(
                            "rtnetlink request failed: {}",
                            e.to_io()
                        ))),
                    };
                }
                NetlinkPayload::Done(_) | NetlinkPayload::Noop => return Ok(()),
                _ => continue,
            }
        }
    }

    /// Looks up an interface's index by name via a filtered `GETLINK`.
    fn get_link_by_name(&mut self, name: &str) -> Result<LinkMessage> {
        self.seq += 1;

        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST;
        header.sequence_number = self.seq;

        let mut link = LinkMessage::default();
        link.attributes.push(LinkAttribute::IfName(name.to_string()));

        let mut message = NetlinkMessage::new(
            header,
            NetlinkPayload::from(RouteNetlinkMessage::GetLink(link)),
        );
        message.finalize();

        let mut buf = vec![0u8; message.buffer_len()];
        message.serialize(&mut buf);

        self.socket
            .send(&buf, 0)
            .map_err(|e| JailError::protocol(format!("sending rtnetlink request: {}", e)))?;

        let mut recv_buf = vec![0u8; 4096];
        loop {
            let n = self
                .socket
                .recv(&mut recv_buf, 0)
                .map_err(|e| JailError::protocol(format!("reading rtnetlink reply: {}", e)))?;

            let parsed = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&recv_buf[..n])
                .map_err(|e| JailError::protocol(format!("decoding rtnetlink reply: {}", e)))?;

            match parsed.payload {
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                    return Ok(link)
                }
                NetlinkPayload::Error(e) => {
                    return Err(JailError::protocol(format!(
                        "looking up interface {}: {}",
                        name,
                        e.to_io()
                    )))
                }
                NetlinkPayload::Done(_) | NetlinkPayload::Noop => {
                    return Err(JailError::protocol(format!("no such interface: {}", name)))
                }
                _ => continue,
            }
        }
    }
}

/// Resolves an interface name to its kernel index.
pub fn index_of(sock: &mut NetlinkSocket, name: &str) -> Result<u32> {
    Ok(sock.get_link_by_name(name)?.header.index)
}
