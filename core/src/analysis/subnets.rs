//! Subnet-to-ASN longest-prefix lookup.
//!
//! Loaded from `pyasn.db` lines of the form `1.0.0.0/24<TAB>13335`. The
//! structure is a map per prefix length probed longest-first; lookups are
//! a handful of hash probes, which is plenty for one probe per classified
//! event. Only IPv4 subnets are present in the data.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use log::warn;

#[derive(Default)]
pub struct SubnetData {
    /// One map per prefix length, probed longest-first.
    by_prefix: HashMap<u8, HashMap<u32, u32>>,
    /// Distinct prefix lengths, descending; fixed after `process_final`.
    prefix_lens: Vec<u8>,
}

impl SubnetData {
    pub fn new() -> Self {
        SubnetData::default()
    }

    pub fn process_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            return;
        }
        let mut fields = line.split_whitespace();
        let (Some(subnet), Some(asn)) = (fields.next(), fields.next()) else {
            warn!("could not parse subnet line '{}'", line);
            return;
        };
        let Some((addr, plen)) = subnet.split_once('/') else {
            warn!("could not parse subnet '{}'", subnet);
            return;
        };
        let (Ok(addr), Ok(plen), Ok(asn)) = (
            addr.parse::<Ipv4Addr>(),
            plen.parse::<u8>(),
            asn.parse::<u32>(),
        ) else {
            warn!("could not parse subnet line '{}'", line);
            return;
        };
        if plen > 32 {
            warn!("invalid prefix length in '{}'", line);
            return;
        }
        let base = u32::from(addr) & mask(plen);
        self.by_prefix.entry(plen).or_default().insert(base, asn);
    }

    /// Freezes the probe order after all lines are loaded.
    pub fn process_final(&mut self) {
        let mut lens: Vec<u8> = self.by_prefix.keys().copied().collect();
        lens.sort_unstable_by(|a, b| b.cmp(a));
        self.prefix_lens = lens;
    }

    /// The ASN owning the longest matching prefix, or 0.
    pub fn lookup(&self, addr: IpAddr) -> u32 {
        let IpAddr::V4(v4) = addr else { return 0 };
        let addr = u32::from(v4);
        for &plen in &self.prefix_lens {
            if let Some(table) = self.by_prefix.get(&plen) {
                if let Some(&asn) = table.get(&(addr & mask(plen))) {
                    return asn;
                }
            }
        }
        0
    }

    pub fn lookup_str(&self, addr: &str) -> u32 {
        addr.parse::<IpAddr>().map(|a| self.lookup(a)).unwrap_or(0)
    }
}

#[inline]
fn mask(plen: u8) -> u32 {
    if plen == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(plen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let mut s = SubnetData::new();
        s.process_line("; header comment");
        s.process_line("93.184.0.0/16\t15133");
        s.process_line("93.184.216.0/24\t15134");
        s.process_final();
        assert_eq!(s.lookup_str("93.184.216.34"), 15134);
        assert_eq!(s.lookup_str("93.184.1.1"), 15133);
        assert_eq!(s.lookup_str("8.8.8.8"), 0);
        assert_eq!(s.lookup_str("2001:db8::1"), 0);
    }
}
