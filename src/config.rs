//! Config file parsing and the CLI-override precedence rule (§6, §10.3).
//!
//! Grounded on `examples/original_source/server/include/game.h`'s
//! `load_config` (a `KEY value` per line, missing file not an error) and
//! the teacher's `clap::Parser` derive style in `src/bin/server.rs`.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

pub const DEFAULT_IP: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);
pub const DEFAULT_PORT: u16 = 4545;
pub const DEFAULT_LOBBY_COUNT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub lobby_count: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { ip: DEFAULT_IP, port: DEFAULT_PORT, lobby_count: DEFAULT_LOBBY_COUNT }
    }
}

/// One `KEY value` line of a config file, already validated against its
/// own domain (IP parseable, `1..=65535`, `1..=1000`).
fn parse_line(line: &str, cfg: &mut ServerConfig) {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return;
    }
    let mut it = line.splitn(2, char::is_whitespace);
    let (Some(key), Some(value)) = (it.next(), it.next()) else { return };
    let value = value.trim();
    match key {
        "IP" => {
            if value.eq_ignore_ascii_case("localhost") {
                cfg.ip = Ipv4Addr::LOCALHOST;
            } else if let Ok(ip) = Ipv4Addr::from_str(value) {
                cfg.ip = ip;
            }
        }
        "PORT" => {
            if let Ok(port) = value.parse::<u16>() {
                if port >= 1 {
                    cfg.port = port;
                }
            }
        }
        "LOBBY_COUNT" => {
            if let Ok(n) = value.parse::<usize>() {
                if (1..=1000).contains(&n) {
                    cfg.lobby_count = n;
                }
            }
        }
        _ => {}
    }
}

/// Load a config file. A missing file is not an error — it just leaves
/// every field at its compiled default.
pub fn load_config(path: &Path) -> ServerConfig {
    let mut cfg = ServerConfig::default();
    if let Ok(text) = fs::read_to_string(path) {
        for line in text.lines() {
            parse_line(line, &mut cfg);
        }
    }
    cfg
}

/// Apply the `-i`/`-p` CLI override (§6: "Requesting override requires
/// both; invalid override falls back to config, then to compiled
/// defaults"). `ip`/`port` are the raw CLI strings, already known to be
/// present together or not at all by the `clap` arg group.
pub fn apply_override(cfg: &mut ServerConfig, ip: Option<&str>, port: Option<&str>) {
    let (Some(ip), Some(port)) = (ip, port) else { return };
    let ip = if ip.eq_ignore_ascii_case("localhost") { Ok(Ipv4Addr::LOCALHOST) } else { Ipv4Addr::from_str(ip) };
    let port = port.parse::<u16>();
    if let (Ok(ip), Ok(port)) = (ip, port) {
        if port >= 1 {
            cfg.ip = ip;
            cfg.port = port;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparseable_fields_fall_back_to_defaults() {
        let mut cfg = ServerConfig::default();
        parse_line("PORT notanumber", &mut cfg);
        parse_line("LOBBY_COUNT 99999", &mut cfg);
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn valid_fields_override_defaults() {
        let mut cfg = ServerConfig::default();
        parse_line("IP 10.0.0.5", &mut cfg);
        parse_line("PORT 9000", &mut cfg);
        parse_line("LOBBY_COUNT 3", &mut cfg);
        assert_eq!(cfg.ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.lobby_count, 3);
    }

    #[test]
    fn missing_file_yields_compiled_defaults() {
        let cfg = load_config(Path::new("/nonexistent/path/to/config.txt"));
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn override_requires_both_ip_and_port() {
        let mut cfg = ServerConfig::default();
        apply_override(&mut cfg, Some("10.0.0.1"), None);
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn invalid_override_falls_back_to_existing_config() {
        let mut cfg = ServerConfig { ip: Ipv4Addr::new(1, 2, 3, 4), port: 1234, lobby_count: 2 };
        apply_override(&mut cfg, Some("not-an-ip"), Some("9000"));
        assert_eq!(cfg.ip, Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(cfg.port, 1234);
    }
}
