use std::net::TcpListener;

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Host name reported when listening on all interfaces.
const DEFAULT_HOSTNAME: &str = "localhost";

/// Where an application ended up listening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Address {
    /// `hostname:port`, with IPv6 literals in brackets.
    pub host: String,
    pub hostname: String,
    pub port: u16,
}

impl Address {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        let hostname = hostname.into();
        Self {
            host: join_host_port(&hostname, port),
            hostname,
            port,
        }
    }
}

pub fn join_host_port(hostname: &str, port: u16) -> String {
    if hostname.contains(':') {
        format!("[{}]:{}", hostname, port)
    } else {
        format!("{}:{}", hostname, port)
    }
}

/// Binds a listener synchronously so the port is known before serving.
///
/// An empty hostname binds every interface and is reported as
/// `localhost`. Port 0 picks a free port.
pub fn bind(hostname: &str, port: u16) -> Result<(TcpListener, Address)> {
    let bind_host = if hostname.is_empty() { "0.0.0.0" } else { hostname };
    let bind_err = |source| Error::Bind {
        address: join_host_port(hostname, port),
        source,
    };

    let listener = TcpListener::bind((bind_host, port)).map_err(bind_err)?;
    listener.set_nonblocking(true).map_err(bind_err)?;
    let local = listener.local_addr().map_err(bind_err)?;

    let reported = if hostname.is_empty() { DEFAULT_HOSTNAME } else { hostname };
    Ok((listener, Address::new(reported, local.port())))
}

/// Positional `listen` arguments, without the trailing callback.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ListenArgs {
    pub port: u16,
    pub hostname: String,
}

impl ListenArgs {
    /// An integer in first position is the port; a string following it
    /// (or in first position) is the hostname.
    pub fn parse(args: &[Value]) -> Result<Self> {
        let mut parsed = Self::default();
        let mut rest = args;

        if let Some(first) = rest.first() {
            if first.is_number() {
                parsed.port = port_from(first)?;
                rest = &rest[1..];
            }
        }

        if let Some(next) = rest.first() {
            match next {
                Value::String(hostname) => {
                    parsed.hostname = hostname.clone();
                    rest = &rest[1..];
                }
                Value::Null => rest = &rest[1..],
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "listen: expected hostname string, got {}",
                        other
                    )))
                }
            }
        }

        if !rest.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "listen: unexpected arguments {}",
                Value::Array(rest.to_vec())
            )));
        }

        Ok(parsed)
    }
}

fn port_from(value: &Value) -> Result<u16> {
    let port = value
        .as_u64()
        .or_else(|| {
            value
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                .map(|f| f as u64)
        })
        .ok_or_else(|| Error::InvalidArgument(format!("listen: invalid port {}", value)))?;

    u16::try_from(port).map_err(|_| Error::InvalidArgument(format!("listen: port {} out of range", port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_listen_args() {
        assert_eq!(ListenArgs::parse(&[]).unwrap(), ListenArgs::default());
        assert_eq!(
            ListenArgs::parse(&[json!(8080)]).unwrap(),
            ListenArgs { port: 8080, hostname: String::new() }
        );
        assert_eq!(
            ListenArgs::parse(&[json!("127.0.0.1")]).unwrap(),
            ListenArgs { port: 0, hostname: "127.0.0.1".to_string() }
        );
        assert_eq!(
            ListenArgs::parse(&[json!(3000.0), json!("::1")]).unwrap(),
            ListenArgs { port: 3000, hostname: "::1".to_string() }
        );
    }

    #[test]
    fn test_parse_rejects_bad_arguments() {
        assert!(ListenArgs::parse(&[json!(70000)]).is_err());
        assert!(ListenArgs::parse(&[json!(1.5)]).is_err());
        assert!(ListenArgs::parse(&[json!(true)]).is_err());
        assert!(ListenArgs::parse(&[json!("a"), json!("b")]).is_err());
        assert!(ListenArgs::parse(&[json!("a"), json!(80)]).is_err());
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("localhost", 80), "localhost:80");
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let (_listener, addr) = bind("", 0).unwrap();

        assert!(addr.port > 0);
        assert_eq!(addr.hostname, "localhost");
        assert_eq!(addr.host, format!("localhost:{}", addr.port));
    }

    #[test]
    fn test_bind_used_port() {
        let (_listener, addr) = bind("127.0.0.1", 0).unwrap();

        let err = bind("127.0.0.1", addr.port).unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
    }
}
