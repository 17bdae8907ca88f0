//! QUIC Initial packet dissection (RFC 9000 / RFC 9001).
//!
//! An Initial carries the TLS ClientHello under keys derived from the
//! destination connection ID, so it can be decrypted by any observer. The
//! dissector removes header protection, opens the AEAD, stitches CRYPTO
//! frames back together, and hands the reassembled hello to the TLS
//! handshake code. A failed authentication tag downgrades the record to
//! header metadata; it never fails the packet.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use ring::aead::quic::{HeaderProtectionKey, AES_128};
use ring::hkdf::{self, KeyType, HKDF_SHA256};

use crate::fingerprint::{Fingerprint, FingerprintType};
use crate::json::JsonObject;
use crate::reader::Reader;

use super::tls::{ClientHello, Handshake, HANDSHAKE_CLIENT_HELLO};

// Initial salts, keyed by wire version (RFC 9001 and prior drafts).
const SALT_D22: [u8; 20] = [
    0x7f, 0xbc, 0xdb, 0x0e, 0x7c, 0x66, 0xbb, 0xe9, 0x19, 0x3a, 0x96, 0xcd, 0x21, 0x51, 0x9e,
    0xbd, 0x7a, 0x02, 0x64, 0x4a,
];
const SALT_D23_D28: [u8; 20] = [
    0xc3, 0xee, 0xf7, 0x12, 0xc7, 0x2e, 0xbb, 0x5a, 0x11, 0xa7, 0xd2, 0x43, 0x2b, 0xb4, 0x63,
    0x65, 0xbe, 0xf9, 0xf5, 0x02,
];
const SALT_D29_D32: [u8; 20] = [
    0xaf, 0xbf, 0xec, 0x28, 0x99, 0x93, 0xd2, 0x4c, 0x9e, 0x97, 0x86, 0xf1, 0x9c, 0x61, 0x11,
    0xe0, 0x43, 0x90, 0xa8, 0x99,
];
const SALT_D33_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Initial salt for a standard version; `None` for versions we do not
/// derive keys for.
fn initial_salt(version: u32) -> Option<&'static [u8; 20]> {
    match version {
        0xff00_0016 => Some(&SALT_D22),
        0xff00_0017..=0xff00_001c => Some(&SALT_D23_D28),
        0xff00_001d..=0xff00_0020 => Some(&SALT_D29_D32),
        0xff00_0021 | 0xff00_0022 | 0x0000_0001 => Some(&SALT_D33_V1),
        _ => None,
    }
}

/// Google QUIC versions: recognized and reported, never decrypted.
fn is_gquic(version: u32) -> bool {
    matches!(version, 0x5130_3433 | 0x5130_3436 | 0x5130_3530)
}

/// Reads a QUIC variable-length integer (RFC 9000 §16).
pub fn read_varint(r: &mut Reader) -> Option<u64> {
    let first = r.read_u8()?;
    let len = 1usize << (first >> 6);
    let mut v = u64::from(first & 0x3f);
    for _ in 1..len {
        v = (v << 8) | u64::from(r.read_u8()?);
    }
    Some(v)
}

// Packets smaller than this cannot be a conforming client Initial.
const MIN_INITIAL_LEN: usize = 1200;
// Smallest plausible packet number + payload length.
const MIN_PN_AND_PAYLOAD: u64 = 64;

/// The protected Initial packet, still ciphertext.
pub struct InitialPacket<'a> {
    pub first_byte: u8,
    pub version: u32,
    pub dcid: &'a [u8],
    pub scid: &'a [u8],
    pub token: &'a [u8],
    /// Packet number and ciphertext, together.
    pub payload: &'a [u8],
    /// Header bytes used as additional authenticated data.
    header: &'a [u8],
    pub gquic: bool,
}

impl<'a> InitialPacket<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        if r.len() < MIN_INITIAL_LEN {
            return None;
        }
        let datagram = r.remaining();

        // header form = 1, long packet type = 00 (fixed bit not enforced)
        let first_byte = r.read_u8()?;
        if first_byte & 0b1011_0000 != 0b1000_0000 {
            return None;
        }

        let version = r.read_u32()?;
        let gquic = is_gquic(version);
        if initial_salt(version).is_none() && !gquic {
            return None;
        }

        let dcid_len = usize::from(r.read_u8()?);
        if dcid_len > 20 {
            return None;
        }
        let dcid = r.take(dcid_len)?;
        let scid_len = usize::from(r.read_u8()?);
        if scid_len > 20 {
            return None;
        }
        let scid = r.take(scid_len)?;

        let token_len = read_varint(r)? as usize;
        let token = r.take(token_len)?;

        let length = read_varint(r)?;
        if length < MIN_PN_AND_PAYLOAD || length > r.len() as u64 {
            return None;
        }
        let header_len = datagram.len() - r.len();
        let header = &datagram[..header_len];
        let payload = r.take(length as usize)?;
        if dcid.is_empty() {
            return None;
        }
        Some(InitialPacket {
            first_byte,
            version,
            dcid,
            scid,
            token,
            payload,
            header,
            gquic,
        })
    }

    pub fn write_json(&self, quic: &mut JsonObject) {
        let bits: String = (0..8)
            .map(|i| if self.first_byte & (0x80 >> i) != 0 { '1' } else { '0' })
            .collect();
        quic.put_str("connection_info", &bits);
        quic.put_hex("version", &self.version.to_be_bytes());
        quic.put_hex("dcid", self.dcid);
        quic.put_hex("scid", self.scid);
        quic.put_hex("token", self.token);
    }
}

struct OkmLen(usize);

impl KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Expand-Label with a zero-length context (RFC 8446 §7.1).
fn expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) -> Option<()> {
    let mut info = Vec::with_capacity(4 + label.len());
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push(label.len() as u8);
    info.extend_from_slice(label);
    info.push(0); // empty context
    let info_ref = [info.as_slice()];
    let okm = prk.expand(&info_ref, OkmLen(out.len())).ok()?;
    okm.fill(out).ok()
}

/// Client Initial traffic material for one packet.
pub struct InitialKeys {
    pub key: [u8; 16],
    pub iv: [u8; 12],
    pub hp: [u8; 16],
}

impl InitialKeys {
    /// Derives the client Initial key, IV, and header-protection key for
    /// `dcid` under the salt of `version` (RFC 9001 §5.2).
    pub fn derive(version: u32, dcid: &[u8]) -> Option<InitialKeys> {
        let salt = initial_salt(version)?;
        let initial_secret = hkdf::Salt::new(HKDF_SHA256, salt).extract(dcid);

        let mut client_secret = [0u8; 32];
        expand_label(&initial_secret, b"tls13 client in", &mut client_secret)?;
        let client_prk = hkdf::Prk::new_less_safe(HKDF_SHA256, &client_secret);

        let mut keys = InitialKeys {
            key: [0u8; 16],
            iv: [0u8; 12],
            hp: [0u8; 16],
        };
        expand_label(&client_prk, b"tls13 quic key", &mut keys.key)?;
        expand_label(&client_prk, b"tls13 quic iv", &mut keys.iv)?;
        expand_label(&client_prk, b"tls13 quic hp", &mut keys.hp)?;
        Some(keys)
    }
}

// Header protection samples 16 bytes past an assumed 4-byte packet number.
const SAMPLE_OFFSET: usize = 4;
const SAMPLE_LEN: usize = 16;

/// Removes header protection and opens the AEAD. Returns the decrypted
/// frame bytes, or `None` when keys cannot be derived or the tag fails.
pub fn decrypt_initial(pkt: &InitialPacket) -> Option<Vec<u8>> {
    if pkt.gquic {
        return None;
    }
    let keys = InitialKeys::derive(pkt.version, pkt.dcid)?;
    if pkt.payload.len() < SAMPLE_OFFSET + SAMPLE_LEN {
        return None;
    }

    let hp_key = HeaderProtectionKey::new(&AES_128, &keys.hp).ok()?;
    let mask = hp_key
        .new_mask(&pkt.payload[SAMPLE_OFFSET..SAMPLE_OFFSET + SAMPLE_LEN])
        .ok()?;

    let first_byte = pkt.first_byte ^ (mask[0] & 0x0f);
    let pn_len = usize::from(first_byte & 0x03) + 1;

    // reconstruct the unprotected header for authentication
    let mut aad = Vec::with_capacity(pkt.header.len() + pn_len);
    aad.push(first_byte);
    aad.extend_from_slice(&pkt.header[1..]);
    let mut pn = [0u8; 4];
    for i in 0..pn_len {
        pn[i] = pkt.payload[i] ^ mask[i + 1];
        aad.push(pn[i]);
    }

    // nonce = iv xor (packet number, right-aligned)
    let mut nonce = keys.iv;
    for i in 0..pn_len {
        nonce[12 - pn_len + i] ^= pn[i];
    }

    let key = LessSafeKey::new(UnboundKey::new(&AES_128_GCM, &keys.key).ok()?);
    let mut in_out = pkt.payload[pn_len..].to_vec();
    let plaintext_len = key
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::from(&aad), &mut in_out)
        .ok()?
        .len();
    in_out.truncate(plaintext_len);
    Some(in_out)
}

const FRAME_PADDING: u8 = 0x00;
const FRAME_PING: u8 = 0x01;
const FRAME_ACK: u8 = 0x02;
const FRAME_CRYPTO: u8 = 0x06;
const FRAME_CONNECTION_CLOSE: u8 = 0x1c;

/// CRYPTO frames can appear out of order; fragments are stitched into this
/// bounded buffer, indexed by offset.
const CRYPTO_BUFFER_LEN: usize = 4096;

#[derive(Debug, Clone)]
pub struct ConnectionClose {
    pub error_code: u64,
    pub frame_type: u64,
    pub reason: Vec<u8>,
}

/// Walks the decrypted frame sequence, accumulating CRYPTO data and the
/// last CONNECTION_CLOSE. Parsing stops at the first unknown frame type:
/// its body length encoding is unknown, so nothing after it can be framed.
fn walk_frames(plaintext: &[u8]) -> (Vec<u8>, usize, Option<ConnectionClose>) {
    let mut buffer = vec![0u8; CRYPTO_BUFFER_LEN];
    let mut buf_len = 0usize;
    let mut close = None;

    let mut r = Reader::new(plaintext);
    while let Some(frame_type) = r.read_u8() {
        match frame_type {
            FRAME_PADDING | FRAME_PING => {}
            FRAME_ACK => {
                let _largest = read_varint(&mut r);
                let _delay = read_varint(&mut r);
                let Some(range_count) = read_varint(&mut r) else { break };
                let _first_range = read_varint(&mut r);
                for _ in 0..range_count {
                    let _gap = read_varint(&mut r);
                    let _len = read_varint(&mut r);
                }
            }
            FRAME_CRYPTO => {
                let Some(offset) = read_varint(&mut r) else { break };
                let Some(length) = read_varint(&mut r) else { break };
                let Some(data) = r.take(length as usize) else { break };
                let offset = offset as usize;
                if offset + data.len() <= CRYPTO_BUFFER_LEN {
                    buffer[offset..offset + data.len()].copy_from_slice(data);
                    buf_len = buf_len.max(offset + data.len());
                }
            }
            FRAME_CONNECTION_CLOSE => {
                let Some(error_code) = read_varint(&mut r) else { break };
                let Some(ft) = read_varint(&mut r) else { break };
                let Some(reason_len) = read_varint(&mut r) else { break };
                let Some(reason) = r.take(reason_len as usize) else { break };
                close = Some(ConnectionClose {
                    error_code,
                    frame_type: ft,
                    reason: reason.to_vec(),
                });
            }
            _ => break,
        }
    }
    buffer.truncate(buf_len);
    (buffer, buf_len, close)
}

/// A fully processed Initial: protected header metadata plus, when
/// decryption succeeded, the reassembled CRYPTO stream.
pub struct QuicInit<'a> {
    pub packet: InitialPacket<'a>,
    crypto: Vec<u8>,
    decrypted: bool,
    pub connection_close: Option<ConnectionClose>,
}

impl<'a> QuicInit<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let packet = InitialPacket::parse(r)?;
        let (crypto, decrypted, connection_close) = match decrypt_initial(&packet) {
            Some(plaintext) => {
                let (crypto, len, close) = walk_frames(&plaintext);
                (crypto, len > 0, close)
            }
            None => (Vec::new(), false, None),
        };
        Some(QuicInit {
            packet,
            crypto,
            decrypted,
            connection_close,
        })
    }

    /// The embedded TLS ClientHello, when one was recovered.
    pub fn client_hello(&self) -> Option<ClientHello<'_>> {
        if !self.decrypted {
            return None;
        }
        let mut r = Reader::new(&self.crypto);
        let hs = Handshake::parse(&mut r)?;
        if hs.msg_type != HANDSHAKE_CLIENT_HELLO || hs.additional_bytes_needed > 0 {
            return None;
        }
        let mut body = hs.body;
        let mut hello = ClientHello::parse(&mut body, false)?;
        hello.from_quic = true;
        Some(hello)
    }

    /// Canonical fingerprint: the hex wire version, then the embedded
    /// hello's TLS fingerprint.
    pub fn compute_fingerprint(&self, tls_format: u32) -> Option<Fingerprint> {
        let mut hello = self.client_hello()?;
        hello.from_quic = false; // embed the plain tls/ canonical form
        let tls_fp = hello.compute_fingerprint(tls_format);
        let mut fp = Fingerprint::new(FingerprintType::Quic);
        fp.push_hex(&self.packet.version.to_be_bytes());
        fp.push_char('(');
        fp.push_str(tls_fp.as_str()?);
        fp.push_char(')');
        Some(fp)
    }

    pub fn server_name(&self) -> Option<String> {
        self.client_hello()?.server_name().map(str::to_string)
    }

    pub fn write_json(&self, rec: &mut JsonObject, metadata: bool) {
        if let Some(hello) = self.client_hello() {
            hello.write_json(rec, metadata);
        }
        let mut quic = JsonObject::new();
        self.packet.write_json(&mut quic);
        if let Some(close) = &self.connection_close {
            let mut cc = JsonObject::new();
            cc.put_uint("error_code", close.error_code);
            cc.put_uint("frame_type", close.frame_type);
            cc.put_bytes_str("reason_phrase", &close.reason);
            quic.put_object("connection_close", cc);
        }
        rec.put_object("quic", quic);
    }
}
