//! DNS message dissection.
//!
//! Enough of the message is decoded for JSON reporting: the header, the
//! question section, and answer records with name decompression. When JSON
//! output for DNS is disabled, the processor emits the raw message base64
//! encoded instead, so the full packet bytes are retained here.

use crate::json::JsonObject;
use crate::reader::Reader;

const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 8;
const MAX_RECORDS: usize = 32;

pub struct Question {
    pub name: String,
    pub rr_type: u16,
    pub rr_class: u16,
}

pub struct Answer {
    pub name: String,
    pub rr_type: u16,
    pub rr_class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

pub struct DnsPacket<'a> {
    raw: &'a [u8],
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<Answer>,
}

/// Decodes a possibly-compressed domain name starting at `offset`.
/// Returns the dotted name and the offset just past its first encoding.
fn read_name(msg: &[u8], offset: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut pos = offset;
    let mut end = None; // set at the first compression pointer
    let mut hops = 0;
    loop {
        let &len = msg.get(pos)?;
        if len & 0xc0 == 0xc0 {
            // compression pointer
            let &lo = msg.get(pos + 1)?;
            if end.is_none() {
                end = Some(pos + 2);
            }
            pos = usize::from(u16::from_be_bytes([len & 0x3f, lo]));
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return None;
            }
            continue;
        }
        if len == 0 {
            pos += 1;
            break;
        }
        let len = usize::from(len);
        let label = msg.get(pos + 1..pos + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        for &b in label {
            name.push(if (0x21..0x7f).contains(&b) { b as char } else { '.' });
        }
        if name.len() > MAX_NAME_LEN {
            return None;
        }
        pos += 1 + len;
    }
    Some((name, end.unwrap_or(pos)))
}

impl<'a> DnsPacket<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let raw = r.remaining();
        let mut h = Reader::new(raw);
        let id = h.read_u16()?;
        let flags = h.read_u16()?;
        let qdcount = usize::from(h.read_u16()?);
        let ancount = usize::from(h.read_u16()?);
        let _nscount = h.read_u16()?;
        let _arcount = h.read_u16()?;
        if qdcount > MAX_RECORDS || ancount > MAX_RECORDS {
            return None;
        }

        let mut pos = 12;
        let mut questions = Vec::with_capacity(qdcount);
        for _ in 0..qdcount {
            let (name, next) = read_name(raw, pos)?;
            let mut f = Reader::new(raw.get(next..)?);
            let rr_type = f.read_u16()?;
            let rr_class = f.read_u16()?;
            questions.push(Question {
                name,
                rr_type,
                rr_class,
            });
            pos = next + 4;
        }

        let mut answers = Vec::with_capacity(ancount);
        for _ in 0..ancount {
            let (name, next) = read_name(raw, pos)?;
            let mut f = Reader::new(raw.get(next..)?);
            let rr_type = f.read_u16()?;
            let rr_class = f.read_u16()?;
            let ttl = f.read_u32()?;
            let rdlen = usize::from(f.read_u16()?);
            let rdata = f.take(rdlen)?.to_vec();
            answers.push(Answer {
                name,
                rr_type,
                rr_class,
                ttl,
                rdata,
            });
            pos = next + 10 + rdlen;
        }

        let _ = r.skip(r.len());
        Some(DnsPacket {
            raw,
            id,
            flags,
            questions,
            answers,
        })
    }

    /// The complete message, for base64 passthrough output.
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn is_response(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    pub fn write_json(&self, dns: &mut JsonObject) {
        dns.put_uint("id", u64::from(self.id));
        dns.put_str("qr", if self.is_response() { "response" } else { "query" });
        if !self.questions.is_empty() {
            let items = self
                .questions
                .iter()
                .map(|q| {
                    let mut o = JsonObject::new();
                    o.put_str("name", &q.name);
                    o.put_uint("type", u64::from(q.rr_type));
                    o.put_uint("class", u64::from(q.rr_class));
                    o.into_value()
                })
                .collect();
            dns.put_array("question", items);
        }
        if !self.answers.is_empty() {
            let items = self
                .answers
                .iter()
                .map(|a| {
                    let mut o = JsonObject::new();
                    o.put_str("name", &a.name);
                    o.put_uint("type", u64::from(a.rr_type));
                    o.put_uint("class", u64::from(a.rr_class));
                    o.put_uint("ttl", u64::from(a.ttl));
                    match (a.rr_type, a.rdata.len()) {
                        (1, 4) => o.put_str(
                            "ipv4_addr",
                            &format!("{}.{}.{}.{}", a.rdata[0], a.rdata[1], a.rdata[2], a.rdata[3]),
                        ),
                        _ => o.put_hex("rdata", &a.rdata),
                    }
                    o.into_value()
                })
                .collect();
            dns.put_array("answer", items);
        }
    }
}
