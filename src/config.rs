//! Process-wide runtime configuration resolved once at start, from the
//! `TGENHOSTNAME`, `TGENIP`, and `TGENSOCKS` environment variables.

use std::env;
use std::net::{IpAddr, SocketAddr};

use crate::transport::ProxyConfig;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub hostname: String,
    pub bind_ip: Option<IpAddr>,
    pub default_socks: Option<ProxyConfig>,
}

impl RuntimeConfig {
    pub fn from_env() -> RuntimeConfig {
        let hostname = env::var("TGENHOSTNAME").unwrap_or_else(|_| local_hostname());
        let bind_ip = env::var("TGENIP").ok().and_then(|s| s.parse().ok());
        let default_socks = env::var("TGENSOCKS").ok().and_then(|s| parse_socks(&s));
        RuntimeConfig { hostname, bind_ip, default_socks }
    }
}

fn parse_socks(spec: &str) -> Option<ProxyConfig> {
    let addr: SocketAddr = spec.parse().ok().or_else(|| {
        let (host, port) = spec.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        let ip: IpAddr = host.parse().ok()?;
        Some(SocketAddr::new(ip, port))
    })?;
    Some(ProxyConfig { addr, username: None, password: None })
}

fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    unsafe {
        if libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(s) = String::from_utf8(buf[..end].to_vec()) {
                return s;
            }
        }
    }
    "localhost".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_socks_spec() {
        let proxy = parse_socks("127.0.0.1:9050").unwrap();
        assert_eq!(proxy.addr.port(), 9050);
    }

    #[test]
    fn rejects_garbage_socks_spec() {
        assert!(parse_socks("not-a-proxy").is_none());
    }
}
