use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    str::FromStr,
};
use url::Host;

/// An external endpoint that supports both IP and domain name hosts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    host: Host,
    port: u16,
}

impl Endpoint {
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn resolve(&self) -> Result<SocketAddr, io::Error> {
        let mut addrs = self.to_string().to_socket_addrs()?;
        addrs.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "failed to resolve address".to_string(),
            )
        })
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4addr) => Self {
                host: Host::Ipv4(*v4addr.ip()),
                port: v4addr.port(),
            },
            SocketAddr::V6(v6addr) => Self {
                host: Host::Ipv6(*v6addr.ip()),
                port: v6addr.port(),
            },
        }
    }
}

impl FromStr for Endpoint {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplitn(2, ':').collect::<Vec<&str>>().as_slice() {
            [port, host] => {
                let port = port.parse().map_err(|_| "couldn't parse port")?;
                let host = Host::parse(host).map_err(|_| "couldn't parse host")?;
                Ok(Endpoint { host, port })
            },
            _ => Err("couldn't parse in form of 'host:port'"),
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.host.fmt(f)?;
        f.write_str(":")?;
        self.port.fmt(f)
    }
}

impl Serialize for Endpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EndpointVisitor;
        impl serde::de::Visitor<'_> for EndpointVisitor {
            type Value = Endpoint;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a valid host:port endpoint")
            }

            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                s.parse().map_err(serde::de::Error::custom)
            }
        }
        deserializer.deserialize_str(EndpointVisitor)
    }
}

/// Join host and port into a dialable `host:port`, bracketing IPv6 literals
/// the way `wg` expects (`[fe80::1]:51820`).
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// The host-only network for an address: `a.b.c.d/32` or `x::y/128`.
pub fn host_net(addr: IpAddr) -> IpNet {
    let prefix = if addr.is_ipv4() { 32 } else { 128 };
    IpNet::new(addr, prefix).expect("full-length prefix is always valid")
}

/// Parse an address that may be a bare IP (full-length prefix implied) or a
/// CIDR whose host bits are kept.
pub fn parse_address(s: &str) -> Result<IpNet, &'static str> {
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(host_net(ip));
    }
    s.parse::<IpNet>().map_err(|_| "couldn't parse as IP or CIDR")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_round_trip() {
        for s in ["gw.example.com:51820", "192.0.2.7:51820", "[2001:db8::1]:51820"] {
            let endpoint: Endpoint = s.parse().unwrap();
            assert_eq!(endpoint.to_string(), s);
        }
    }

    #[test]
    fn test_endpoint_rejects_portless() {
        assert!("gw.example.com".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("gw.example.com", 51820), "gw.example.com:51820");
        assert_eq!(join_host_port("192.0.2.7", 51820), "192.0.2.7:51820");
        assert_eq!(join_host_port("fe80::1", 51820), "[fe80::1]:51820");
    }

    #[test]
    fn test_join_host_port_parses_back() {
        let endpoint: Endpoint = join_host_port("fe80::1", 51820).parse().unwrap();
        assert_eq!(endpoint.port(), 51820);
    }

    #[test]
    fn test_host_net() {
        assert_eq!(host_net("10.0.0.5".parse().unwrap()).to_string(), "10.0.0.5/32");
        assert_eq!(host_net("fd00::5".parse().unwrap()).to_string(), "fd00::5/128");
    }

    #[test]
    fn test_parse_address_keeps_host_bits() {
        assert_eq!(parse_address("10.0.0.5").unwrap().to_string(), "10.0.0.5/32");
        assert_eq!(parse_address("10.0.0.5/24").unwrap().to_string(), "10.0.0.5/24");
        assert!(parse_address("10.0.0.5/24/1").is_err());
    }
}
