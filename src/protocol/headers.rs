//! Header set carried inside envelopes
//!
//! Common headers get their own typed slot, everything else lands in
//! `undeclared_pairs`. Names are lower-cased on the way in.

use crate::error::ProxyError;
use crate::protocol::envelope::{read_string, Envelope, FieldWriter, Fields};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

/// Tag of one `(name, value)` entry in the undeclared list
const UNDECLARED_TAG: u8 = 100;

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

macro_rules! well_known_headers {
    ($($tag:literal => $field:ident = $name:literal,)*) => {
        /// HTTP headers as carried inside envelopes
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct Headers {
            $(pub $field: Option<String>,)*
            /// Headers without a typed slot, and repeated values, in arrival order
            pub undeclared_pairs: Vec<(String, String)>,
        }

        impl Headers {
            fn slot(&self, name: &str) -> Option<&Option<String>> {
                match name {
                    $($name => Some(&self.$field),)*
                    _ => None,
                }
            }

            fn slot_mut(&mut self, name: &str) -> Option<&mut Option<String>> {
                match name {
                    $($name => Some(&mut self.$field),)*
                    _ => None,
                }
            }

            fn name_for_tag(tag: u8) -> Option<&'static str> {
                match tag {
                    $($tag => Some($name),)*
                    _ => None,
                }
            }

            fn well_known(&self) -> Vec<(u8, &'static str, &str)> {
                let mut present = Vec::new();
                $(
                    if let Some(value) = &self.$field {
                        present.push(($tag, $name, value.as_str()));
                    }
                )*
                present
            }
        }
    };
}

well_known_headers! {
    1 => accept = "accept",
    2 => accept_charset = "accept-charset",
    3 => accept_encoding = "accept-encoding",
    4 => accept_language = "accept-language",
    5 => authorization = "authorization",
    6 => cache_control = "cache-control",
    7 => connection = "connection",
    8 => content_encoding = "content-encoding",
    9 => content_length = "content-length",
    10 => content_type = "content-type",
    11 => cookie = "cookie",
    12 => date = "date",
    13 => etag = "etag",
    14 => expect = "expect",
    15 => host = "host",
    16 => if_modified_since = "if-modified-since",
    17 => if_none_match = "if-none-match",
    18 => last_modified = "last-modified",
    19 => location = "location",
    20 => origin = "origin",
    21 => pragma = "pragma",
    22 => range = "range",
    23 => referer = "referer",
    24 => server = "server",
    25 => set_cookie = "set-cookie",
    26 => transfer_encoding = "transfer-encoding",
    27 => upgrade = "upgrade",
    28 => user_agent = "user-agent",
    29 => via = "via",
    30 => x_forwarded_for = "x-forwarded-for",
}

impl Headers {
    /// Add a header. A second value for a typed slot goes to the undeclared list.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        let value = value.into();
        match self.slot_mut(&name) {
            Some(slot) if slot.is_none() => *slot = Some(value),
            _ => self.undeclared_pairs.push((name, value)),
        }
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        if let Some(Some(value)) = self.slot(&name) {
            return Some(value.as_str());
        }
        self.undeclared_pairs
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All `(name, value)` pairs, typed slots first.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.well_known()
            .into_iter()
            .map(|(_, name, value)| (name, value))
            .chain(
                self.undeclared_pairs
                    .iter()
                    .map(|(n, v)| (n.as_str(), v.as_str())),
            )
            .collect()
    }

    pub fn len(&self) -> usize {
        self.well_known().len() + self.undeclared_pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop headers that only describe the current connection.
    pub fn remove_hop_by_hop(&mut self) {
        for name in HOP_BY_HOP {
            if let Some(slot) = self.slot_mut(name) {
                *slot = None;
            }
        }
        self.undeclared_pairs
            .retain(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()));
    }

    /// Convert from `http`, skipping values that are not UTF-8 (obs-text).
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut headers = Headers::default();
        for (name, value) in map {
            match std::str::from_utf8(value.as_bytes()) {
                Ok(text) => headers.insert(name.as_str(), text),
                Err(_) => debug!("Skipping non UTF-8 header {}: {:?}", name, value),
            }
        }
        headers
    }

    /// Convert back, skipping names or values `http` refuses.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.len());
        for (name, value) in self.pairs() {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => debug!("Skipping invalid header {}: {:?}", name, value),
            }
        }
        map
    }
}

impl Envelope for Headers {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = FieldWriter::new();
        for (tag, _, value) in self.well_known() {
            writer.string(tag, value);
        }
        for (name, value) in &self.undeclared_pairs {
            let pair = FieldWriter::new().string(1, name).string(2, value).finish();
            writer.bytes(UNDECLARED_TAG, &pair);
        }
        writer.finish()
    }

    fn from_bytes(data: &[u8]) -> Result<Self, ProxyError> {
        let mut headers = Headers::default();
        for field in Fields::new(data) {
            let (tag, value) = field?;
            if tag == UNDECLARED_TAG {
                let mut name = None;
                let mut pair_value = String::new();
                for inner in Fields::new(value) {
                    let (inner_tag, inner_value) = inner?;
                    match inner_tag {
                        1 => name = Some(read_string(inner_tag, inner_value)?),
                        2 => pair_value = read_string(inner_tag, inner_value)?,
                        _ => {}
                    }
                }
                if let Some(name) = name {
                    headers.undeclared_pairs.push((name.to_ascii_lowercase(), pair_value));
                }
            } else if let Some(name) = Self::name_for_tag(tag) {
                headers.insert(name, read_string(tag, value)?);
            }
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lowercases_and_routes() {
        let mut headers = Headers::default();
        headers.insert("Content-Type", "text/html");
        headers.insert("X-Request-Id", "abc");
        assert_eq!(headers.content_type.as_deref(), Some("text/html"));
        assert_eq!(headers.undeclared_pairs, vec![("x-request-id".to_string(), "abc".to_string())]);
        assert_eq!(headers.get("x-REQUEST-id"), Some("abc"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_repeated_values_are_kept() {
        let mut headers = Headers::default();
        headers.insert("Set-Cookie", "a=1");
        headers.insert("Set-Cookie", "b=2");

        let decoded = Headers::from_bytes(&headers.to_bytes()).unwrap();
        let map = decoded.to_header_map();
        let cookies: Vec<_> = map.get_all("set-cookie").iter().collect();
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn test_header_map_roundtrip() {
        let mut map = HeaderMap::new();
        map.insert("host", HeaderValue::from_static("example.com"));
        map.insert("accept-encoding", HeaderValue::from_static("gzip"));
        map.insert("x-trace", HeaderValue::from_static("42"));

        let headers = Headers::from_header_map(&map);
        let encoded = headers.to_bytes();
        let back = Headers::from_bytes(&encoded).unwrap().to_header_map();
        assert_eq!(back, map);
    }

    #[test]
    fn test_remove_hop_by_hop() {
        let mut headers = Headers::default();
        headers.insert("Connection", "keep-alive");
        headers.insert("Transfer-Encoding", "chunked");
        headers.insert("Proxy-Authorization", "Basic abc");
        headers.insert("Keep-Alive", "timeout=5");
        headers.insert("Accept", "*/*");

        headers.remove_hop_by_hop();
        assert_eq!(headers.pairs(), vec![("accept", "*/*")]);
    }

    #[test]
    fn test_non_utf8_values_not_mangled() {
        let mut map = HeaderMap::new();
        map.insert("x-latin1", HeaderValue::from_bytes(b"caf\xe9").unwrap());
        map.insert("x-utf8", HeaderValue::from_bytes("café".as_bytes()).unwrap());

        let headers = Headers::from_header_map(&map);
        assert_eq!(headers.get("x-latin1"), None);
        assert_eq!(headers.get("x-utf8"), Some("café"));
        assert!(headers.pairs().iter().all(|(_, v)| !v.contains('\u{FFFD}')));
    }

    #[test]
    fn test_invalid_values_skipped() {
        let mut headers = Headers::default();
        headers.insert("x-bad", "line\nbreak");
        headers.insert("x-good", "ok");
        let map = headers.to_header_map();
        assert!(map.get("x-bad").is_none());
        assert_eq!(map.get("x-good").unwrap(), "ok");
    }
}
