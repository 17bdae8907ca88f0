//! Canonical protocol fingerprints.
//!
//! A fingerprint is a byte-exact string derived from a handshake, stable
//! across runs and across benign wire-format variation. It is the join key
//! between the dissectors and the classifier database, so its construction
//! rules (hex casing, parenthesization, GREASE normalization) must never
//! drift.

use crate::json::hex;

/// Hard cap on the canonical string. Anything longer is discarded rather
/// than truncated, so a partial fingerprint can never alias a real one.
pub const MAX_FINGERPRINT_LEN: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FingerprintType {
    Tcp,
    Tls,
    TlsServer,
    Dtls,
    DtlsServer,
    Http,
    HttpServer,
    Quic,
    Dhcp,
    Ssh,
    SshKex,
    Tofsee,
    Unknown,
}

impl FingerprintType {
    /// The key used in the `fingerprints` output object and as the
    /// canonical-string prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintType::Tcp => "tcp",
            FingerprintType::Tls => "tls",
            FingerprintType::TlsServer => "tls_server",
            FingerprintType::Dtls => "dtls",
            FingerprintType::DtlsServer => "dtls_server",
            FingerprintType::Http => "http",
            FingerprintType::HttpServer => "http_server",
            FingerprintType::Quic => "quic",
            FingerprintType::Dhcp => "dhcp",
            FingerprintType::Ssh => "ssh",
            FingerprintType::SshKex => "ssh_kex",
            FingerprintType::Tofsee => "tofsee",
            FingerprintType::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> FingerprintType {
        match s {
            "tcp" => FingerprintType::Tcp,
            "tls" => FingerprintType::Tls,
            "tls_server" => FingerprintType::TlsServer,
            "dtls" => FingerprintType::Dtls,
            "dtls_server" => FingerprintType::DtlsServer,
            "http" => FingerprintType::Http,
            "http_server" => FingerprintType::HttpServer,
            "quic" => FingerprintType::Quic,
            "dhcp" => FingerprintType::Dhcp,
            "ssh" => FingerprintType::Ssh,
            "ssh_kex" => FingerprintType::SshKex,
            "tofsee" => FingerprintType::Tofsee,
            _ => FingerprintType::Unknown,
        }
    }
}

/// A canonical fingerprint under construction or completed.
///
/// Dissectors append hex-encoded elements; if the cap is exceeded the
/// fingerprint degrades to `Unknown` and is dropped from output.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    fp_type: FingerprintType,
    string: String,
    overflow: bool,
}

impl Fingerprint {
    pub fn new(fp_type: FingerprintType) -> Self {
        let mut string = String::with_capacity(256);
        string.push_str(fp_type.as_str());
        string.push('/');
        Fingerprint {
            fp_type,
            string,
            overflow: false,
        }
    }

    /// Starts a fingerprint with an explicit format version segment, e.g.
    /// `tls/1/`.
    pub fn with_version(fp_type: FingerprintType, version: u32) -> Self {
        let mut fp = Fingerprint::new(fp_type);
        fp.push_str(&version.to_string());
        fp.push_char('/');
        fp
    }

    #[inline]
    pub fn fp_type(&self) -> FingerprintType {
        if self.overflow {
            FingerprintType::Unknown
        } else {
            self.fp_type
        }
    }

    /// The canonical string, or `None` if construction overflowed the cap.
    pub fn as_str(&self) -> Option<&str> {
        if self.overflow {
            None
        } else {
            Some(&self.string)
        }
    }

    pub fn push_char(&mut self, c: char) {
        if self.string.len() + 1 > MAX_FINGERPRINT_LEN {
            self.overflow = true;
            return;
        }
        self.string.push(c);
    }

    pub fn push_str(&mut self, s: &str) {
        if self.string.len() + s.len() > MAX_FINGERPRINT_LEN {
            self.overflow = true;
            return;
        }
        self.string.push_str(s);
    }

    /// Appends `(hex(data))`.
    pub fn push_hex(&mut self, data: &[u8]) {
        if self.string.len() + data.len() * 2 + 2 > MAX_FINGERPRINT_LEN {
            self.overflow = true;
            return;
        }
        self.string.push('(');
        self.string.push_str(&hex(data));
        self.string.push(')');
    }

    /// Appends a raw hex run with no parentheses.
    pub fn push_hex_raw(&mut self, data: &[u8]) {
        if self.string.len() + data.len() * 2 > MAX_FINGERPRINT_LEN {
            self.overflow = true;
            return;
        }
        self.string.push_str(&hex(data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_shape() {
        let mut fp = Fingerprint::with_version(FingerprintType::Tls, 1);
        fp.push_hex(&[0x03, 0x03]);
        assert_eq!(fp.as_str(), Some("tls/1/(0303)"));
        assert_eq!(fp.fp_type(), FingerprintType::Tls);
    }

    #[test]
    fn overflow_discards() {
        let mut fp = Fingerprint::new(FingerprintType::Http);
        fp.push_hex(&vec![0u8; MAX_FINGERPRINT_LEN]);
        assert_eq!(fp.as_str(), None);
        assert_eq!(fp.fp_type(), FingerprintType::Unknown);
    }
}
