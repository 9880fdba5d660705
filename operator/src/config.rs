use crate::error::{Error, Result};
use ipnet::IpNet;
use std::{env, net::IpAddr};

/// Gateway configuration, resolved once at startup and handed to the
/// reconcilers. The sync paths never re-read the environment.
#[derive(Clone, Debug)]
pub struct EpConfig {
    /// Pool client addresses are drawn from (`WGA_CLIENT_CIDR`).
    pub client_cidr: IpNet,
    /// External host peers dial to reach the gateway (`WGA_SERVER_ADDRESS`).
    pub server_address: String,
    /// Service networks exposed through the tunnel (`WGA_ALLOWED_IPS`).
    pub service_cidrs: Vec<IpNet>,
    /// DNS servers handed to peers (`WGA_DNS`).
    pub dns_servers: Vec<IpAddr>,
}

fn required(name: &'static str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::MissingEnv(name)),
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl EpConfig {
    pub fn from_env() -> Result<Self> {
        Self::parse(
            &required("WGA_CLIENT_CIDR")?,
            required("WGA_SERVER_ADDRESS")?,
            &required("WGA_ALLOWED_IPS")?,
            env::var("WGA_DNS").ok().as_deref(),
        )
    }

    fn parse(
        client_cidr: &str,
        server_address: String,
        allowed_ips: &str,
        dns: Option<&str>,
    ) -> Result<Self> {
        let client_cidr = client_cidr
            .parse()
            .map_err(|_| Error::parse("WGA_CLIENT_CIDR", client_cidr))?;

        let service_cidrs = split_list(allowed_ips)
            .map(|entry| {
                entry
                    .parse::<IpNet>()
                    .map(|net| net.trunc())
                    .map_err(|_| Error::parse("WGA_ALLOWED_IPS", entry))
            })
            .collect::<Result<Vec<_>>>()?;
        if service_cidrs.is_empty() {
            return Err(Error::MissingEnv("WGA_ALLOWED_IPS"));
        }

        let dns_servers = dns
            .map(|value| {
                split_list(value)
                    .map(|entry| entry.parse().map_err(|_| Error::parse("WGA_DNS", entry)))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            client_cidr,
            server_address,
            service_cidrs,
            dns_servers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let config = EpConfig::parse(
            "fd00::/64",
            "gw.example.com".into(),
            "2001:db8::/64, 10.0.0.0/16",
            Some("1.1.1.1,2606:4700:4700::1111"),
        )
        .unwrap();
        assert_eq!(config.client_cidr.to_string(), "fd00::/64");
        assert_eq!(config.service_cidrs.len(), 2);
        assert_eq!(config.dns_servers.len(), 2);
    }

    #[test]
    fn test_parse_no_dns() {
        let config =
            EpConfig::parse("10.66.0.0/24", "gw".into(), "10.0.0.0/16", None).unwrap();
        assert!(config.dns_servers.is_empty());
    }

    #[test]
    fn test_parse_bad_cidr() {
        assert!(matches!(
            EpConfig::parse("not-a-cidr", "gw".into(), "10.0.0.0/16", None),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn test_parse_empty_allowed_ips() {
        assert!(EpConfig::parse("10.66.0.0/24", "gw".into(), " , ", None).is_err());
    }

    #[test]
    fn test_parse_truncates_service_cidrs() {
        let config =
            EpConfig::parse("10.66.0.0/24", "gw".into(), "10.0.0.5/16", None).unwrap();
        assert_eq!(config.service_cidrs[0].to_string(), "10.0.0.0/16");
    }
}
