//! Bencoding dissection (BitTorrent DHT messages).
//!
//! Produces two parallel outputs: a JSON mirror of the structure and a
//! compact raw-feature string of `[key,value]` hex pairs used for
//! fingerprint-style matching. Depth and string lengths are bounded; a
//! packet that exceeds them is reported only up to the bound.

use crate::json::{hex, JsonObject};
use crate::reader::Reader;
use serde_json::Value;

const MAX_DEPTH: usize = 10;
const MAX_STRING_LEN: u64 = 256;

#[derive(Debug)]
pub enum Bencoded<'a> {
    Int(&'a [u8]),
    Bytes(&'a [u8]),
    List(Vec<Bencoded<'a>>),
    Dict(Vec<(&'a [u8], Bencoded<'a>)>),
}

impl<'a> Bencoded<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        Self::parse_depth(r, 0)
    }

    fn parse_depth(r: &mut Reader<'a>, depth: usize) -> Option<Self> {
        if depth > MAX_DEPTH {
            return None;
        }
        match r.peek_u8()? {
            b'i' => {
                r.skip(1)?;
                let digits = r.take_while(|b| b.is_ascii_digit() || b == b'-');
                if digits.is_empty() || !r.accept(b'e') {
                    return None;
                }
                Some(Bencoded::Int(digits))
            }
            b'l' => {
                r.skip(1)?;
                let mut items = Vec::new();
                while !r.accept(b'e') {
                    items.push(Self::parse_depth(r, depth + 1)?);
                }
                Some(Bencoded::List(items))
            }
            b'd' => {
                r.skip(1)?;
                let mut entries = Vec::new();
                while !r.accept(b'e') {
                    let key = Self::parse_bytes(r)?;
                    let value = Self::parse_depth(r, depth + 1)?;
                    entries.push((key, value));
                }
                Some(Bencoded::Dict(entries))
            }
            b'0'..=b'9' => Self::parse_bytes(r).map(Bencoded::Bytes),
            _ => None,
        }
    }

    fn parse_bytes(r: &mut Reader<'a>) -> Option<&'a [u8]> {
        let mut len: u64 = 0;
        loop {
            let c = r.read_u8()?;
            if c == b':' {
                break;
            }
            if !c.is_ascii_digit() {
                return None;
            }
            len = len * 10 + u64::from(c - b'0');
            if len > MAX_STRING_LEN {
                return None;
            }
        }
        r.take(len as usize)
    }

    fn is_printable(data: &[u8]) -> bool {
        data.iter().all(|&b| (0x20..0x7f).contains(&b))
    }

    /// Appends this value's raw-feature form: hex strings for scalars,
    /// `[...]` for lists, `[[k,v],...]` for dictionaries.
    pub fn raw_features(&self, out: &mut String) {
        match self {
            Bencoded::Int(digits) => {
                out.push('"');
                out.push_str(&hex(digits));
                out.push('"');
            }
            Bencoded::Bytes(data) => {
                out.push('"');
                out.push_str(&hex(data));
                out.push('"');
            }
            Bencoded::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.raw_features(out);
                }
                out.push(']');
            }
            Bencoded::Dict(entries) => {
                out.push('[');
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str("[\"");
                    out.push_str(&hex(key));
                    out.push_str("\",");
                    value.raw_features(out);
                    out.push(']');
                }
                out.push(']');
            }
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Bencoded::Int(digits) => {
                Value::from(String::from_utf8_lossy(digits).into_owned())
            }
            Bencoded::Bytes(data) => {
                if Self::is_printable(data) {
                    Value::from(String::from_utf8_lossy(data).into_owned())
                } else {
                    Value::from(hex(data))
                }
            }
            Bencoded::List(items) => Value::Array(items.iter().map(Self::to_value).collect()),
            Bencoded::Dict(entries) => {
                let mut obj = JsonObject::new();
                for (key, value) in entries {
                    let k = if Self::is_printable(key) {
                        String::from_utf8_lossy(key).into_owned()
                    } else {
                        hex(key)
                    };
                    obj.put_value(&k, value.to_value());
                }
                obj.into_value()
            }
        }
    }

    pub fn write_json(&self, rec: &mut JsonObject) {
        let mut ben = JsonObject::new();
        ben.put_value("value", self.to_value());
        let mut features = String::new();
        self.raw_features(&mut features);
        ben.put_str("raw_features", &features);
        rec.put_object("bencode", ben);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_round_trip() {
        let mut r = Reader::new(&b"d1:ad2:id4:teste1:q4:ping1:y1:qe"[..]);
        let v = Bencoded::parse(&mut r).unwrap();
        let mut features = String::new();
        v.raw_features(&mut features);
        assert!(features.starts_with("[[\"61\",[[\"6964\",\"74657374\"]]]"));

        let mut rec = JsonObject::new();
        v.write_json(&mut rec);
        let line = rec.into_line();
        let s = std::str::from_utf8(&line).unwrap();
        assert!(s.contains("\"q\":\"ping\""));
    }

    #[test]
    fn unbounded_string_rejected() {
        let mut r = Reader::new(&b"99999:x"[..]);
        assert!(Bencoded::parse(&mut r).is_none());
    }

    #[test]
    fn nesting_bounded() {
        let deep = "l".repeat(50) + &"e".repeat(50);
        let mut r = Reader::new(deep.as_bytes());
        assert!(Bencoded::parse(&mut r).is_none());
    }
}
