//! The `wg-quick` style `.ini` representation of a client configuration.
//!
//! This is the format handed to end users by `wga peer add`, and it parses
//! its own output so configs can be inspected or re-emitted.

use crate::{Endpoint, Error};
use anyhow::{anyhow, bail};
use ipnet::IpNet;
use std::{
    fmt::{self, Display, Formatter},
    net::IpAddr,
    str::FromStr,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WgConfig {
    pub interface: WgInterface,
    pub peers: Vec<WgPeer>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WgInterface {
    /// base64 private key.
    pub private_key: String,
    pub address: Option<IpNet>,
    pub dns: Vec<IpAddr>,
    pub listen_port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WgPeer {
    pub endpoint: Endpoint,
    /// base64 public key.
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<u16>,
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Display for WgConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "[Interface]")?;
        writeln!(f, "PrivateKey = {}", self.interface.private_key)?;
        if let Some(address) = &self.interface.address {
            writeln!(f, "Address = {address}")?;
        }
        if !self.interface.dns.is_empty() {
            writeln!(f, "DNS = {}", join(&self.interface.dns))?;
        }
        if let Some(port) = self.interface.listen_port {
            writeln!(f, "ListenPort = {port}")?;
        }

        for peer in &self.peers {
            writeln!(f)?;
            writeln!(f, "[Peer]")?;
            writeln!(f, "Endpoint = {}", peer.endpoint)?;
            writeln!(f, "PublicKey = {}", peer.public_key)?;
            if let Some(psk) = &peer.preshared_key {
                writeln!(f, "PresharedKey = {psk}")?;
            }
            if !peer.allowed_ips.is_empty() {
                writeln!(f, "AllowedIPs = {}", join(&peer.allowed_ips))?;
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                writeln!(f, "PersistentKeepalive = {keepalive}")?;
            }
        }
        Ok(())
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl FromStr for WgConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        #[derive(PartialEq)]
        enum Section {
            None,
            Interface,
            Peer,
        }

        let mut interface: Option<WgInterface> = None;
        let mut peers: Vec<WgPeer> = vec![];
        let mut section = Section::None;

        for (lineno, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line {
                "[Interface]" => {
                    if interface.is_some() {
                        bail!("line {}: duplicate [Interface] section", lineno + 1);
                    }
                    interface = Some(WgInterface::default());
                    section = Section::Interface;
                    continue;
                },
                "[Peer]" => {
                    peers.push(WgPeer {
                        endpoint: "0.0.0.0:0".parse().expect("placeholder endpoint"),
                        public_key: String::new(),
                        preshared_key: None,
                        allowed_ips: vec![],
                        persistent_keepalive: None,
                    });
                    section = Section::Peer;
                    continue;
                },
                _ => {},
            }

            let (key, value) = line
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| anyhow!("line {}: expected 'Key = Value'", lineno + 1))?;

            match section {
                Section::None => bail!("line {}: key outside of a section", lineno + 1),
                Section::Interface => {
                    let interface = interface.as_mut().expect("section implies interface");
                    match key {
                        "PrivateKey" => interface.private_key = value.to_string(),
                        "Address" => {
                            interface.address = Some(crate::parse_address(value).map_err(
                                |e| anyhow!("line {}: bad Address: {}", lineno + 1, e),
                            )?)
                        },
                        "DNS" => {
                            for entry in split_list(value) {
                                interface.dns.push(entry.parse()?);
                            }
                        },
                        "ListenPort" => interface.listen_port = Some(value.parse()?),
                        _ => bail!("line {}: unknown interface key {:?}", lineno + 1, key),
                    }
                },
                Section::Peer => {
                    let peer = peers.last_mut().expect("section implies peer");
                    match key {
                        "Endpoint" => {
                            peer.endpoint = value
                                .parse()
                                .map_err(|e| anyhow!("line {}: bad Endpoint: {}", lineno + 1, e))?
                        },
                        "PublicKey" => peer.public_key = value.to_string(),
                        "PresharedKey" => peer.preshared_key = Some(value.to_string()),
                        "AllowedIPs" => {
                            for entry in split_list(value) {
                                peer.allowed_ips.push(entry.parse()?);
                            }
                        },
                        "PersistentKeepalive" => {
                            peer.persistent_keepalive = Some(value.parse()?)
                        },
                        _ => bail!("line {}: unknown peer key {:?}", lineno + 1, key),
                    }
                },
            }
        }

        let interface = interface.ok_or_else(|| anyhow!("missing [Interface] section"))?;
        for peer in &peers {
            if peer.public_key.is_empty() {
                bail!("peer section without a PublicKey");
            }
        }

        Ok(WgConfig { interface, peers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WgConfig {
        WgConfig {
            interface: WgInterface {
                private_key: "MPeNZKVZYJ/AHqDctMbxb6exa5nGXI+F4iLYOkFwtVQ=".into(),
                address: Some("2a0e:6f07:8003:1:2::2/128".parse().unwrap()),
                dns: vec!["1.1.1.1".parse().unwrap(), "2606:4700:4700::1111".parse().unwrap()],
                listen_port: None,
            },
            peers: vec![WgPeer {
                endpoint: "185.112.181.161:51820".parse().unwrap(),
                public_key: "2kYJdyRGVZOwOgJfNlFxjgqNpiI1KJx/Q50H2EIwRS0=".into(),
                preshared_key: None,
                allowed_ips: vec!["2a0e:6f07:8003:1:1::/80".parse().unwrap()],
                persistent_keepalive: Some(60),
            }],
        }
    }

    #[test]
    fn test_format() {
        let text = sample().to_string();
        assert!(text.starts_with("[Interface]\n"));
        assert!(text.contains("DNS = 1.1.1.1, 2606:4700:4700::1111\n"));
        assert!(text.contains("\n[Peer]\nEndpoint = 185.112.181.161:51820\n"));
        assert!(text.contains("PersistentKeepalive = 60\n"));
    }

    #[test]
    fn test_round_trip() {
        let text = sample().to_string();
        let parsed: WgConfig = text.parse().unwrap();
        assert_eq!(parsed, sample());
        assert_eq!(parsed.to_string(), text);
    }

    #[test]
    fn test_parse_hand_written() {
        let text = "\
            [Interface]\n\
            PrivateKey = MPeNZKVZYJ/AHqDctMbxb6exa5nGXI+F4iLYOkFwtVQ=\n\
            Address = 2a0e:6f07:8003:1:2::2/128\n\
            \n\
            [Peer]\n\
            Endpoint = 185.112.181.161:51820\n\
            PublicKey = 2kYJdyRGVZOwOgJfNlFxjgqNpiI1KJx/Q50H2EIwRS0=\n\
            AllowedIPs = 2a0e:6f07:8003:1:1::/80\n";
        let parsed: WgConfig = text.parse().unwrap();
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].allowed_ips[0].to_string(), "2a0e:6f07:8003:1:1::/80");
        assert_eq!(parsed.interface.listen_port, None);
    }

    #[test]
    fn test_parse_rejects_unknown_key() {
        let text = "[Interface]\nPrivateKey = x\nBogus = 1\n";
        assert!(text.parse::<WgConfig>().is_err());
    }

    #[test]
    fn test_parse_rejects_missing_interface() {
        assert!("[Peer]\nPublicKey = x\nEndpoint = 1.2.3.4:1\n".parse::<WgConfig>().is_err());
    }
}
