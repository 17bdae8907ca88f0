//! HTTP/1.x request and response dissection.
//!
//! Parsing is line-oriented and tolerant of a missing `\r` before `\n`.
//! Header names are matched case-insensitively against two static tables:
//! one selecting headers worth reporting, one deciding which headers (and
//! whether their values) enter the canonical fingerprint.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::fingerprint::{Fingerprint, FingerprintType};
use crate::json::JsonObject;
use crate::reader::Reader;

/// Request headers whose values are reported in JSON output.
const REQUEST_HEADERS: &[(&str, &str)] = &[
    ("user-agent", "user_agent"),
    ("host", "host"),
    ("x-forwarded-for", "x_forwarded_for"),
    ("via", "via"),
    ("upgrade", "upgrade"),
    ("referer", "referer"),
];

/// Response headers whose values are reported in JSON output.
const RESPONSE_HEADERS: &[(&str, &str)] = &[
    ("content-type", "content_type"),
    ("content-length", "content_length"),
    ("server", "server"),
    ("via", "via"),
];

// Fingerprint policy: listed headers are part of the fingerprint; `true`
// includes the value, `false` the name only. Unlisted headers are omitted.
const FP_REQUEST: &[(&str, bool)] = &[
    ("accept", true),
    ("accept-encoding", true),
    ("connection", true),
    ("dnt", true),
    ("dpr", true),
    ("upgrade-insecure-requests", true),
    ("x-requested-with", true),
    ("accept-charset", false),
    ("accept-language", false),
    ("authorization", false),
    ("cache-control", false),
    ("host", false),
    ("if-modified-since", false),
    ("keep-alive", false),
    ("user-agent", false),
    ("x-flash-version", false),
    ("x-p2p-peerdist", false),
];

const FP_RESPONSE: &[(&str, bool)] = &[
    ("access-control-allow-credentials", true),
    ("access-control-allow-headers", true),
    ("access-control-allow-methods", true),
    ("access-control-expose-headers", true),
    ("cache-control", true),
    ("code", true),
    ("connection", true),
    ("content-language", true),
    ("content-transfer-encoding", true),
    ("p3p", true),
    ("pragma", true),
    ("reason", true),
    ("server", true),
    ("strict-transport-security", true),
    ("version", true),
    ("x-aspnetmvc-version", true),
    ("x-aspnet-version", true),
    ("x-cid", true),
    ("x-ms-version", true),
    ("x-xss-protection", true),
    ("appex-activity-id", false),
    ("cdnuuid", false),
    ("cf-ray", false),
    ("content-range", false),
    ("content-type", false),
    ("date", false),
    ("etag", false),
    ("expires", false),
    ("flow_context", false),
    ("ms-cv", false),
    ("msregion", false),
    ("ms-requestid", false),
    ("request-id", false),
    ("vary", false),
    ("x-amz-cf-pop", false),
    ("x-amz-request-id", false),
    ("x-azure-ref-originshield", false),
    ("x-cache", false),
    ("x-cache-hits", false),
    ("x-ccc", false),
    ("x-diagnostic-s", false),
    ("x-feserver", false),
    ("x-hw", false),
    ("x-msedge-ref", false),
    ("x-ocsp-responder-id", false),
    ("x-requestid", false),
    ("x-served-by", false),
    ("x-timer", false),
    ("x-trace-context", false),
];

lazy_static! {
    static ref FP_REQUEST_MAP: HashMap<&'static str, bool> =
        FP_REQUEST.iter().copied().collect();
    static ref FP_RESPONSE_MAP: HashMap<&'static str, bool> =
        FP_RESPONSE.iter().copied().collect();
}

fn name_eq(name: &[u8], lower: &str) -> bool {
    name.len() == lower.len()
        && name
            .iter()
            .zip(lower.as_bytes())
            .all(|(a, b)| a.to_ascii_lowercase() == *b)
}

fn fp_policy(table: &HashMap<&'static str, bool>, name: &[u8]) -> Option<bool> {
    if name.len() > 64 || !name.is_ascii() {
        return None;
    }
    let lower = String::from_utf8_lossy(name).to_ascii_lowercase();
    table.get(lower.as_str()).copied()
}

/// One header line; `line` spans from the name through the end of the
/// value, as seen on the wire.
pub struct Header<'a> {
    pub name: &'a [u8],
    pub value: &'a [u8],
    line: &'a [u8],
}

const MAX_HEADERS: usize = 20;

/// Reads one line, accepting LF or CRLF terminators.
fn read_line<'a>(r: &mut Reader<'a>) -> Option<&'a [u8]> {
    let line = r.take_until(b'\n')?;
    Some(line.strip_suffix(b"\r").unwrap_or(line))
}

fn parse_headers<'a>(r: &mut Reader<'a>) -> Vec<Header<'a>> {
    let mut headers = Vec::new();
    while headers.len() < MAX_HEADERS {
        let Some(line) = read_line(r) else { break };
        if line.is_empty() {
            break; // end of headers
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            break;
        };
        let name = &line[..colon];
        let mut value = &line[colon + 1..];
        while let Some(rest) = value.strip_prefix(b" ").or_else(|| value.strip_prefix(b"\t")) {
            value = rest;
        }
        headers.push(Header { name, value, line });
    }
    headers
}

fn find_header<'a>(headers: &[Header<'a>], lower: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| name_eq(h.name, lower))
        .map(|h| h.value)
}

fn headers_fingerprint(fp: &mut Fingerprint, headers: &[Header], table: &HashMap<&'static str, bool>) {
    fp.push_char('(');
    for h in headers {
        match fp_policy(table, h.name) {
            Some(true) => fp.push_hex(h.line),
            Some(false) => fp.push_hex(h.name),
            None => {}
        }
    }
    fp.push_char(')');
}

fn put_matching_headers(obj: &mut JsonObject, headers: &[Header], table: &[(&str, &str)]) {
    for (lower, key) in table {
        if let Some(value) = find_header(headers, lower) {
            obj.put_bytes_str(key, value);
        }
    }
}

pub struct HttpRequest<'a> {
    pub method: &'a [u8],
    pub uri: &'a [u8],
    pub protocol: &'a [u8],
    pub headers: Vec<Header<'a>>,
}

impl<'a> HttpRequest<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let line = read_line(r)?;
        let mut parts = line.split(|&b| b == b' ');
        let method = parts.next()?;
        let uri = parts.next()?;
        let protocol = parts.next()?;
        if method.is_empty() || protocol.is_empty() {
            return None;
        }
        let headers = parse_headers(r);
        Some(HttpRequest {
            method,
            uri,
            protocol,
            headers,
        })
    }

    pub fn compute_fingerprint(&self) -> Fingerprint {
        let mut fp = Fingerprint::new(FingerprintType::Http);
        fp.push_hex(self.method);
        fp.push_hex(self.protocol);
        headers_fingerprint(&mut fp, &self.headers, &FP_REQUEST_MAP);
        fp
    }

    pub fn host(&self) -> Option<&'a [u8]> {
        find_header(&self.headers, "host")
    }

    pub fn user_agent(&self) -> Option<&'a [u8]> {
        find_header(&self.headers, "user-agent")
    }

    pub fn write_json(&self, rec: &mut JsonObject, metadata: bool) {
        let mut request = JsonObject::new();
        if metadata {
            request.put_bytes_str("method", self.method);
            request.put_bytes_str("uri", self.uri);
            request.put_bytes_str("protocol", self.protocol);
            put_matching_headers(&mut request, &self.headers, REQUEST_HEADERS);
        } else if let Some(ua) = self.user_agent() {
            request.put_bytes_str("user_agent", ua);
        }
        if request.is_empty() {
            return;
        }
        let mut http = JsonObject::new();
        http.put_object("request", request);
        rec.put_object("http", http);
    }
}

pub struct HttpResponse<'a> {
    pub version: &'a [u8],
    pub status_code: &'a [u8],
    pub status_reason: &'a [u8],
    pub headers: Vec<Header<'a>>,
}

impl<'a> HttpResponse<'a> {
    pub fn parse(r: &mut Reader<'a>) -> Option<Self> {
        let line = read_line(r)?;
        let mut parts = line.splitn(3, |&b| b == b' ');
        let version = parts.next()?;
        let status_code = parts.next()?;
        let status_reason = parts.next().unwrap_or(b"");
        if !version.starts_with(b"HTTP/1") {
            return None;
        }
        let headers = parse_headers(r);
        Some(HttpResponse {
            version,
            status_code,
            status_reason,
            headers,
        })
    }

    pub fn compute_fingerprint(&self) -> Fingerprint {
        let mut fp = Fingerprint::new(FingerprintType::HttpServer);
        fp.push_hex(self.version);
        fp.push_hex(self.status_code);
        fp.push_hex(self.status_reason);
        headers_fingerprint(&mut fp, &self.headers, &FP_RESPONSE_MAP);
        fp
    }

    pub fn write_json(&self, rec: &mut JsonObject, metadata: bool) {
        if !metadata {
            return;
        }
        let mut response = JsonObject::new();
        response.put_bytes_str("version", self.version);
        response.put_bytes_str("status_code", self.status_code);
        response.put_bytes_str("status_reason", self.status_reason);
        put_matching_headers(&mut response, &self.headers, RESPONSE_HEADERS);
        let mut http = JsonObject::new();
        http.put_object("response", response);
        rec.put_object("http", http);
    }
}
