//! Network interface spec parsing and the create/rename/move-into-netns
//! sequence that runs once the child's pid is known.

use netlink_packet_route::link::{
    InfoData, InfoIpVlan, InfoKind, InfoMacVlan, InfoVeth, IpVlanMode, LinkAttribute, LinkFlags,
    LinkInfo, LinkMessage, MacVlanMode,
};
use netlink_packet_route::RouteNetlinkMessage;

use crate::error::{JailError, Result};
use crate::netlink::NetlinkSocket;

/// A single `--netif` directive.
#[derive(Debug, Clone)]
pub enum NetifSpec {
    /// `DEV,NAME` — move an existing host interface into the container,
    /// renaming it on the way in.
    Existing { dev: String, name: String },
    /// `macvlan,MASTER,NAME`
    MacVlan { master: String, name: String },
    /// `ipvlan,MASTER,NAME`
    IpVlan { master: String, name: String },
    /// `veth,HOSTEND,CONTEND` — the host end stays outside, the container
    /// end is moved in.
    Veth { host_end: String, cont_end: String },
}

pub fn parse(spec: &str) -> Result<NetifSpec> {
    let parts: Vec<&str> = spec.split(',').collect();

    match parts.as_slice() {
        [kind, a, b] if *kind == "macvlan" => Ok(NetifSpec::MacVlan {
            master: a.to_string(),
            name: b.to_string(),
        }),
        [kind, a, b] if *kind == "ipvlan" => Ok(NetifSpec::IpVlan {
            master: a.to_string(),
            name: b.to_string(),
        }),
        [kind, a, b] if *kind == "veth" => Ok(NetifSpec::Veth {
            host_end: a.to_string(),
            cont_end: b.to_string(),
        }),
        [dev, name] => Ok(NetifSpec::Existing {
            dev: dev.to_string(),
            name: name.to_string(),
        }),
        _ => Err(JailError::usage(format!("unrecognized netif spec: {}", spec))),
    }
}

fn base_link(name: &str) -> LinkMessage {
    let mut msg = LinkMessage::default();
    msg.attributes.push(LinkAttribute::IfName(name.to_string()));
    msg
}

use crate::netlink::index_of;

/// Looks up the freshly created `tmp_name` link by index, then renames it to
/// `name` and moves it into `pid`'s network namespace in one `SETLINK`. Two
/// steps because the interface has to exist (and be resolvable by name)
/// before it can be renamed-and-migrated, matching how an existing host
/// interface is moved in.
fn move_and_rename(sock: &mut NetlinkSocket, tmp_name: &str, name: &str, pid: i32) -> Result<()> {
    let idx = index_of(sock, tmp_name)?;
    let mut msg = LinkMessage::default();
    msg.header.index = idx;
    msg.attributes.push(LinkAttribute::IfName(name.to_string()));
    msg.attributes.push(LinkAttribute::NetNsPid(pid as u32));
    sock.request(RouteNetlinkMessage::SetLink(msg), 0)
}

impl NetifSpec {
    /// Creates (if needed), renames, and moves the interface into `pid`'s
    /// network namespace via `IFLA_NET_NS_PID`.
    pub fn apply(&self, sock: &mut NetlinkSocket, pid: i32) -> Result<()> {
        match self {
            NetifSpec::Existing { dev, name } => {
                let idx = index_of(sock, dev)?;
                let mut msg = LinkMessage::default();
                msg.attributes.push(LinkAttribute::IfName(name.to_string()));
                msg.attributes.push(LinkAttribute::NetNsPid(pid as u32));
                msg.header.index = idx;
                sock.request(RouteNetlinkMessage::SetLink(msg), 0)
            }
            NetifSpec::MacVlan { master, name } => {
                let master_idx = index_of(sock, master)?;
                let tmp_name = format!("pflask-{}", pid);
                let mut msg = base_link(&tmp_name);
                msg.attributes.push(LinkAttribute::Link(master_idx));
                msg.attributes.push(LinkAttribute::LinkInfo(vec![
                    LinkInfo::Kind(InfoKind::MacVlan),
                    LinkInfo::Data(InfoData::MacVlan(vec![InfoMacVlan::Mode(
                        MacVlanMode::Bridge,
                    )])),
                ]));
                sock.create(RouteNetlinkMessage::NewLink(msg))?;
                move_and_rename(sock, &tmp_name, name, pid)
            }
            NetifSpec::IpVlan { master, name } => {
                let master_idx = index_of(sock, master)?;
                let tmp_name = format!("pflask-{}", pid);
                let mut msg = base_link(&tmp_name);
                msg.attributes.push(LinkAttribute::Link(master_idx));
                msg.attributes.push(LinkAttribute::LinkInfo(vec![
                    LinkInfo::Kind(InfoKind::IpVlan),
                    LinkInfo::Data(InfoData::IpVlan(vec![InfoIpVlan::Mode(IpVlanMode::L2)])),
                ]));
                sock.create(RouteNetlinkMessage::NewLink(msg))?;
                move_and_rename(sock, &tmp_name, name, pid)
            }
            NetifSpec::Veth { host_end, cont_end } => {
                let mut peer = base_link(cont_end);
                peer.attributes.push(LinkAttribute::NetNsPid(pid as u32));

                let mut msg = base_link(host_end);
                msg.attributes.push(LinkAttribute::LinkInfo(vec![
                    LinkInfo::Kind(InfoKind::Veth),
                    LinkInfo::Data(InfoData::Veth(InfoVeth::Peer(peer))),
                ]));
                sock.create(RouteNetlinkMessage::NewLink(msg))
            }
        }
    }
}

/// Brings `lo` up inside the (already-entered) network namespace. Called
/// from the child side after `unshare(CLONE_NEWNET)`/`setns`.
pub fn loopback_up() -> Result<()> {
    let mut sock = NetlinkSocket::open()?;
    let idx = index_of(&mut sock, "lo")?;

    let mut msg = LinkMessage::default();
    msg.header.index = idx;
    msg.header.flags = LinkFlags::Up;
    msg.header.change_mask = LinkFlags::Up;

    sock.request(RouteNetlinkMessage::SetLink(msg), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_existing() {
        match parse("eth0,eth0").unwrap() {
            NetifSpec::Existing { dev, name } => {
                assert_eq!(dev, "eth0");
                assert_eq!(name, "eth0");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parse_macvlan() {
        match parse("macvlan,eth0,mv0").unwrap() {
            NetifSpec::MacVlan { master, name } => {
                assert_eq!(master, "eth0");
                assert_eq!(name, "mv0");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parse_veth() {
        match parse("veth,veth0,veth1").unwrap() {
            NetifSpec::Veth { host_end, cont_end } => {
                assert_eq!(host_end, "veth0");
                assert_eq!(cont_end, "veth1");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_unrecognized() {
        assert!(parse("bogus").is_err());
    }
}
