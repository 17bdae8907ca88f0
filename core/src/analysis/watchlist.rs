//! Host and address watchlists.
//!
//! Used for the encrypted-DNS (DoH) resolver list: one hostname or IP
//! address per line, `#` comments allowed.

use std::collections::HashSet;
use std::net::IpAddr;

#[derive(Default)]
pub struct Watchlist {
    hosts: HashSet<String>,
    addrs: HashSet<IpAddr>,
}

impl Watchlist {
    pub fn new() -> Self {
        Watchlist::default()
    }

    pub fn process_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        match line.parse::<IpAddr>() {
            Ok(addr) => {
                self.addrs.insert(addr);
            }
            Err(_) => {
                self.hosts.insert(line.to_ascii_lowercase());
            }
        }
    }

    pub fn contains_host(&self, name: &str) -> bool {
        self.hosts.contains(&name.to_ascii_lowercase())
    }

    pub fn contains_addr_str(&self, addr: &str) -> bool {
        addr.parse::<IpAddr>()
            .map(|a| self.addrs.contains(&a))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.hosts.len() + self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.addrs.is_empty()
    }
}
