//! JSON record construction.
//!
//! Every output event is one JSON object per line. Records are built as
//! [`serde_json::Map`]s so that serialization happens exactly once, before
//! the bytes enter a ring slot; dissector views into the packet buffer do
//! not outlive record construction.

use serde_json::{Map, Value};

/// An in-progress JSON object with typed insertion helpers.
#[derive(Default)]
pub struct JsonObject {
    map: Map<String, Value>,
}

impl JsonObject {
    pub fn new() -> Self {
        JsonObject { map: Map::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn put_str(&mut self, key: &str, value: &str) {
        self.map.insert(key.to_string(), Value::from(value));
    }

    /// Inserts raw bytes as a JSON string, replacing non-UTF-8 and control
    /// characters so a hostile packet cannot corrupt the record.
    pub fn put_bytes_str(&mut self, key: &str, value: &[u8]) {
        let printable: String = value
            .iter()
            .map(|&b| {
                if (0x20..0x7f).contains(&b) {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        self.map.insert(key.to_string(), Value::from(printable));
    }

    pub fn put_uint(&mut self, key: &str, value: u64) {
        self.map.insert(key.to_string(), Value::from(value));
    }

    pub fn put_float(&mut self, key: &str, value: f64) {
        self.map.insert(key.to_string(), Value::from(value));
    }

    pub fn put_bool(&mut self, key: &str, value: bool) {
        self.map.insert(key.to_string(), Value::from(value));
    }

    /// Inserts `value` as a lowercase hex string.
    pub fn put_hex(&mut self, key: &str, value: &[u8]) {
        self.map.insert(key.to_string(), Value::from(hex(value)));
    }

    pub fn put_base64(&mut self, key: &str, value: &[u8]) {
        self.map.insert(key.to_string(), Value::from(base64(value)));
    }

    /// Inserts an `event_start`-style timestamp: `<sec>.<9-digit nsec>`.
    pub fn put_timestamp(&mut self, key: &str, sec: u64, nsec: u32) {
        self.map
            .insert(key.to_string(), Value::from(format!("{}.{:09}", sec, nsec)));
    }

    pub fn put_object(&mut self, key: &str, obj: JsonObject) {
        self.map.insert(key.to_string(), Value::Object(obj.map));
    }

    pub fn put_array(&mut self, key: &str, items: Vec<Value>) {
        self.map.insert(key.to_string(), Value::Array(items));
    }

    pub fn put_value(&mut self, key: &str, value: Value) {
        self.map.insert(key.to_string(), value);
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.map)
    }

    /// Serializes the record as a single line, with the trailing newline.
    pub fn into_line(self) -> Vec<u8> {
        let mut out = serde_json::to_vec(&Value::Object(self.map)).unwrap_or_default();
        out.push(b'\n');
        out
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Lowercase hex encoding.
pub fn hex(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for &b in data {
        s.push(HEX_DIGITS[usize::from(b >> 4)] as char);
        s.push(HEX_DIGITS[usize::from(b & 0x0f)] as char);
    }
    s
}

const B64_ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Standard base64 with padding.
pub fn base64(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() + 2) / 3 * 4);
    for chunk in data.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
        out.push(B64_ALPHABET[(n >> 18) as usize & 0x3f] as char);
        out.push(B64_ALPHABET[(n >> 12) as usize & 0x3f] as char);
        out.push(if chunk.len() > 1 {
            B64_ALPHABET[(n >> 6) as usize & 0x3f] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            B64_ALPHABET[n as usize & 0x3f] as char
        } else {
            '='
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encoding() {
        assert_eq!(hex(&[0x00, 0xab, 0xff]), "00abff");
    }

    #[test]
    fn base64_padding() {
        assert_eq!(base64(b"f"), "Zg==");
        assert_eq!(base64(b"fo"), "Zm8=");
        assert_eq!(base64(b"foo"), "Zm9v");
        assert_eq!(base64(b"foobar"), "Zm9vYmFy");
    }

    #[test]
    fn record_line_is_terminated() {
        let mut rec = JsonObject::new();
        rec.put_str("src_ip", "10.0.0.1");
        rec.put_timestamp("event_start", 12, 5);
        let line = rec.into_line();
        assert!(line.ends_with(b"\n"));
        let s = std::str::from_utf8(&line).unwrap();
        assert!(s.contains("\"event_start\":\"12.000000005\""));
    }
}
