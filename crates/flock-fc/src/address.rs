use std::fmt;
use std::str::FromStr;

use crate::adapter::AdapterError;

pub const DEFAULT_SERIAL_BAUD: u32 = 57600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Listen for the vehicle (`udp://` and `udpin://`)
    UdpIn,
    UdpOut,
    Tcp,
    Serial,
    /// In-process simulated flight controller
    Sim,
}

/// A parsed vehicle connection string.
///
/// For serial links `host` is the device path and `port` the baud rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAddress {
    pub scheme: Scheme,
    pub host: String,
    pub port: u32,
    raw: String,
}

impl ConnectionAddress {
    pub fn parse(s: &str) -> Result<Self, AdapterError> {
        let err = |reason: &str| AdapterError::Address { address: s.to_string(), reason: reason.to_string() };
        let (scheme, rest) = s.split_once("://").ok_or_else(|| err("expected scheme://address"))?;
        let scheme = match scheme {
            "udp" | "udpin" => Scheme::UdpIn,
            "udpout" => Scheme::UdpOut,
            "tcp" | "tcpout" => Scheme::Tcp,
            "serial" => Scheme::Serial,
            "sim" => Scheme::Sim,
            _ => return Err(err("unknown scheme")),
        };

        match scheme {
            Scheme::Sim => {
                non_empty(rest).ok_or_else(|| err("simulator label missing"))?;
                Ok(Self { scheme, host: rest.to_string(), port: 0, raw: s.to_string() })
            }
            Scheme::Serial => {
                let (dev, baud) = match rest.rsplit_once(':') {
                    Some((dev, baud)) => {
                        let baud = baud.parse::<u32>().map_err(|_| err("invalid baud rate"))?;
                        (dev, baud)
                    }
                    None => (rest, DEFAULT_SERIAL_BAUD),
                };
                non_empty(dev).ok_or_else(|| err("serial device missing"))?;
                Ok(Self { scheme, host: dev.to_string(), port: baud, raw: s.to_string() })
            }
            _ => {
                let (host, port) = rest.rsplit_once(':').ok_or_else(|| err("expected host:port"))?;
                let port = port.parse::<u16>().map_err(|_| err("invalid port"))?;
                let host = if host.is_empty() {
                    if scheme != Scheme::UdpIn {
                        return Err(err("host required"));
                    }
                    "0.0.0.0".to_string()
                } else {
                    host.to_string()
                };
                Ok(Self { scheme, host, port: port as u32, raw: s.to_string() })
            }
        }
    }

    /// Connection string understood by `mavlink::connect`, `None` for the simulator.
    pub fn to_mavlink_url(&self) -> Option<String> {
        match self.scheme {
            Scheme::UdpIn => Some(format!("udpin:{}:{}", self.host, self.port)),
            Scheme::UdpOut => Some(format!("udpout:{}:{}", self.host, self.port)),
            Scheme::Tcp => Some(format!("tcpout:{}:{}", self.host, self.port)),
            Scheme::Serial => Some(format!("serial:{}:{}", self.host, self.port)),
            Scheme::Sim => None,
        }
    }

    /// Two addresses reach the same vehicle endpoint.
    pub fn same_endpoint(&self, other: &ConnectionAddress) -> bool {
        self.host == other.host && self.port == other.port && (self.scheme == Scheme::Sim) == (other.scheme == Scheme::Sim)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.trim().is_empty()).then_some(s)
}

impl FromStr for ConnectionAddress {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_without_host_listens_on_all_interfaces() {
        let a = ConnectionAddress::parse("udp://:14540").unwrap();
        assert_eq!(a.scheme, Scheme::UdpIn);
        assert_eq!(a.host, "0.0.0.0");
        assert_eq!(a.port, 14540);
        assert_eq!(a.to_mavlink_url().as_deref(), Some("udpin:0.0.0.0:14540"));
    }

    #[test]
    fn serial_defaults_baud() {
        let a = ConnectionAddress::parse("serial:///dev/ttyUSB0").unwrap();
        assert_eq!(a.host, "/dev/ttyUSB0");
        assert_eq!(a.port, DEFAULT_SERIAL_BAUD);

        let b = ConnectionAddress::parse("serial:///dev/ttyACM0:921600").unwrap();
        assert_eq!(b.port, 921600);
        assert_eq!(b.to_mavlink_url().as_deref(), Some("serial:/dev/ttyACM0:921600"));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(ConnectionAddress::parse("14540").is_err());
        assert!(ConnectionAddress::parse("carrier://x:1").is_err());
        assert!(ConnectionAddress::parse("tcp://:5760").is_err());
        assert!(ConnectionAddress::parse("udp://127.0.0.1:notaport").is_err());
        assert!(ConnectionAddress::parse("sim://").is_err());
    }

    #[test]
    fn same_endpoint_ignores_udp_flavour() {
        let a = ConnectionAddress::parse("udp://127.0.0.1:14540").unwrap();
        let b = ConnectionAddress::parse("udpin://127.0.0.1:14540").unwrap();
        let c = ConnectionAddress::parse("udp://127.0.0.1:14541").unwrap();
        assert!(a.same_endpoint(&b));
        assert!(!a.same_endpoint(&c));
    }
}
