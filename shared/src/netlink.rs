//! rtnetlink plumbing for the links, addresses and routes the reconcilers
//! manage. WireGuard device *configuration* (keys, peers) goes through the
//! generic netlink channel in `wireguard-control`; everything here is plain
//! RTM_* traffic.

use ipnet::IpNet;
use netlink_packet_core::{
    NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL,
    NLM_F_REPLACE, NLM_F_REQUEST,
};
use netlink_packet_route::{
    address::{AddressAttribute, AddressMessage, AddressScope},
    link::{InfoKind, LinkAttribute, LinkFlags, LinkInfo, LinkMessage},
    route::{
        RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteProtocol, RouteScope,
        RouteType,
    },
    AddressFamily, RouteNetlinkMessage,
};
use netlink_request::netlink_request_rtnl;
use std::{io, net::IpAddr};
use wireguard_control::InterfaceName;

fn if_nametoindex(interface: &InterfaceName) -> Result<u32, io::Error> {
    match unsafe { libc::if_nametoindex(interface.as_ptr()) } {
        0 => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("couldn't find interface '{interface}'."),
        )),
        index => Ok(index),
    }
}

fn wireguard_link_message(interface: &InterfaceName) -> LinkMessage {
    let mut message = LinkMessage::default();
    message
        .attributes
        .push(LinkAttribute::IfName(interface.as_str_lossy().to_string()));
    message
        .attributes
        .push(LinkAttribute::LinkInfo(vec![LinkInfo::Kind(
            InfoKind::Wireguard,
        )]));
    message
}

/// Create a fresh WireGuard link. Succeeds if the link already exists.
pub fn create_wireguard_link(interface: &InterfaceName) -> Result<(), io::Error> {
    let message = wireguard_link_message(interface);
    match netlink_request_rtnl(
        RouteNetlinkMessage::NewLink(message),
        Some(NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL),
    ) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            log::debug!("link {} already existed.", interface);
            Ok(())
        },
        Err(e) => Err(e),
        Ok(_) => {
            log::debug!("created wireguard link {}", interface);
            Ok(())
        },
    }
}

pub fn delete_link(interface: &InterfaceName) -> Result<(), io::Error> {
    let message = wireguard_link_message(interface);
    netlink_request_rtnl(
        RouteNetlinkMessage::DelLink(message),
        Some(NLM_F_REQUEST | NLM_F_ACK),
    )?;
    log::debug!("deleted link {}", interface);
    Ok(())
}

/// Delete-then-create, so a restart never inherits stale peer or address
/// state from a previous incarnation. Init-time only.
pub fn ensure_clean_link(interface: &InterfaceName) -> Result<(), io::Error> {
    match delete_link(interface) {
        Ok(()) => log::info!("deleted old link {}", interface),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {},
        Err(e) => return Err(e),
    }
    create_wireguard_link(interface)
}

pub fn set_up(interface: &InterfaceName) -> Result<(), io::Error> {
    let index = if_nametoindex(interface)?;
    let mut message = LinkMessage::default();
    message.header.index = index;
    message.header.flags = LinkFlags::Up;
    message.header.change_mask = LinkFlags::Up;
    netlink_request_rtnl(RouteNetlinkMessage::SetLink(message), None)?;
    log::debug!("set interface {} up", interface);
    Ok(())
}

/// Names of all WireGuard-kind links currently present.
pub fn list_wireguard_links() -> Result<Vec<String>, io::Error> {
    let responses = netlink_request_rtnl(
        RouteNetlinkMessage::GetLink(LinkMessage::default()),
        Some(NLM_F_DUMP | NLM_F_REQUEST),
    )?;

    let links = responses
        .into_iter()
        .filter_map(|response| match response {
            NetlinkMessage {
                payload: NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)),
                ..
            } => Some(link),
            _ => None,
        })
        .filter(|link| {
            link.attributes.iter().any(|attr| {
                matches!(attr, LinkAttribute::LinkInfo(infos)
                    if infos.iter().any(|info| matches!(info, LinkInfo::Kind(InfoKind::Wireguard))))
            })
        })
        .filter_map(|link| {
            link.attributes.iter().find_map(|attr| match attr {
                LinkAttribute::IfName(name) => Some(name.clone()),
                _ => None,
            })
        })
        .collect();

    Ok(links)
}

fn address_message(interface: &InterfaceName, addr: IpNet) -> Result<AddressMessage, io::Error> {
    let index = if_nametoindex(interface)?;
    let (family, attributes) = match addr {
        IpNet::V4(network) => (
            AddressFamily::Inet,
            vec![
                AddressAttribute::Local(IpAddr::V4(network.addr())),
                AddressAttribute::Address(IpAddr::V4(network.addr())),
            ],
        ),
        IpNet::V6(network) => (
            AddressFamily::Inet6,
            vec![AddressAttribute::Address(IpAddr::V6(network.addr()))],
        ),
    };
    let mut message = AddressMessage::default();
    message.header.index = index;
    message.header.family = family;
    message.header.prefix_len = addr.prefix_len();
    message.header.scope = AddressScope::Universe;
    message.attributes = attributes;
    Ok(message)
}

/// Add or overwrite an address on the interface.
pub fn replace_address(interface: &InterfaceName, addr: IpNet) -> Result<(), io::Error> {
    let message = address_message(interface, addr)?;
    netlink_request_rtnl(
        RouteNetlinkMessage::NewAddress(message),
        Some(NLM_F_REQUEST | NLM_F_ACK | NLM_F_REPLACE | NLM_F_CREATE),
    )?;
    log::debug!("set address {} on interface {}", addr, interface);
    Ok(())
}

/// Addresses currently assigned to the interface, with the raw message so a
/// caller can hand unwanted entries straight back to [`delete_address`].
pub fn list_addresses(
    interface: &InterfaceName,
) -> Result<Vec<(AddressMessage, IpNet)>, io::Error> {
    let index = if_nametoindex(interface)?;
    let responses = netlink_request_rtnl(
        RouteNetlinkMessage::GetAddress(AddressMessage::default()),
        Some(NLM_F_DUMP | NLM_F_REQUEST),
    )?;

    let mut addresses = vec![];
    for response in responses {
        let message = match response {
            NetlinkMessage {
                payload: NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewAddress(message)),
                ..
            } => message,
            _ => continue,
        };
        if message.header.index != index {
            continue;
        }
        let ip = message.attributes.iter().find_map(|attr| match attr {
            AddressAttribute::Address(ip) => Some(*ip),
            _ => None,
        });
        if let Some(ip) = ip {
            if let Ok(net) = IpNet::new(ip, message.header.prefix_len) {
                addresses.push((message, net));
            }
        }
    }
    Ok(addresses)
}

pub fn delete_address(message: AddressMessage) -> Result<(), io::Error> {
    netlink_request_rtnl(
        RouteNetlinkMessage::DelAddress(message),
        Some(NLM_F_REQUEST | NLM_F_ACK),
    )?;
    Ok(())
}

fn route_message(interface: &InterfaceName, cidr: IpNet) -> Result<RouteMessage, io::Error> {
    let index = if_nametoindex(interface)?;
    let (address_family, destination) = match cidr {
        IpNet::V4(network) => (AddressFamily::Inet, RouteAddress::Inet(network.network())),
        IpNet::V6(network) => (AddressFamily::Inet6, RouteAddress::Inet6(network.network())),
    };
    let mut message = RouteMessage::default();
    message.header.table = RouteHeader::RT_TABLE_MAIN;
    message.header.protocol = RouteProtocol::Boot;
    message.header.scope = RouteScope::Link;
    message.header.kind = RouteType::Unicast;
    message.header.destination_prefix_length = cidr.prefix_len();
    message.header.address_family = address_family;
    message.attributes = vec![
        RouteAttribute::Destination(destination),
        RouteAttribute::Oif(index),
    ];
    Ok(message)
}

/// Add a route through the interface. Returns `Ok(false)` if the route was
/// already present.
pub fn add_route(interface: &InterfaceName, cidr: IpNet) -> Result<bool, io::Error> {
    let message = route_message(interface, cidr)?;
    match netlink_request_rtnl(RouteNetlinkMessage::NewRoute(message), None) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            log::debug!("route {} already existed.", cidr);
            Ok(false)
        },
        Err(e) => Err(e),
        Ok(_) => {
            log::debug!("added route {} to interface {}", cidr, interface);
            Ok(true)
        },
    }
}

pub fn replace_route(interface: &InterfaceName, cidr: IpNet) -> Result<(), io::Error> {
    let message = route_message(interface, cidr)?;
    netlink_request_rtnl(
        RouteNetlinkMessage::NewRoute(message),
        Some(NLM_F_REQUEST | NLM_F_ACK | NLM_F_REPLACE | NLM_F_CREATE),
    )?;
    log::debug!("replaced route {} on interface {}", cidr, interface);
    Ok(())
}

/// Routes whose output interface is the given link.
pub fn list_routes(interface: &InterfaceName) -> Result<Vec<(RouteMessage, IpNet)>, io::Error> {
    let index = if_nametoindex(interface)?;
    let responses = netlink_request_rtnl(
        RouteNetlinkMessage::GetRoute(RouteMessage::default()),
        Some(NLM_F_DUMP | NLM_F_REQUEST),
    )?;

    let mut routes = vec![];
    for response in responses {
        let message = match response {
            NetlinkMessage {
                payload: NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(message)),
                ..
            } => message,
            _ => continue,
        };
        let oif = message.attributes.iter().find_map(|attr| match attr {
            RouteAttribute::Oif(oif) => Some(*oif),
            _ => None,
        });
        if oif != Some(index) {
            continue;
        }
        let destination = message.attributes.iter().find_map(|attr| match attr {
            RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            RouteAttribute::Destination(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        });
        if let Some(ip) = destination {
            if let Ok(net) = IpNet::new(ip, message.header.destination_prefix_length) {
                routes.push((message, net));
            }
        }
    }
    Ok(routes)
}

pub fn delete_route(message: RouteMessage) -> Result<(), io::Error> {
    netlink_request_rtnl(
        RouteNetlinkMessage::DelRoute(message),
        Some(NLM_F_REQUEST | NLM_F_ACK),
    )?;
    Ok(())
}
