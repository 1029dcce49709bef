pub mod algorithms;
pub mod pool;

use crate::config::{KeyExtractor, Protocol};
use std::net::{IpAddr, SocketAddr};

pub use pool::{BackendPool, Selection};

/// 路由上下文 - 包含一次选择所需的信息
#[derive(Debug, Clone)]
pub struct RoutingContext {
    /// 客户端地址
    pub client_addr: SocketAddr,
    /// 协议类型
    pub protocol: Protocol,
    /// 由键提取器得到的应用层哈希键 (uri_hash)
    pub key: Option<Vec<u8>>,
}

impl RoutingContext {
    pub fn new(client_addr: SocketAddr, protocol: Protocol) -> Self {
        Self {
            client_addr,
            protocol,
            key: None,
        }
    }

    pub fn with_key(mut self, key: Option<Vec<u8>>) -> Self {
        self.key = key;
        self
    }

    /// 获取客户端IP
    pub fn client_ip(&self) -> IpAddr {
        self.client_addr.ip()
    }
}

/// 选择失败原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("no eligible server in backend '{0}'")]
    NoEligibleServer(String),

    #[error("all eligible servers in backend '{0}' are at max connections")]
    AllServersBusy(String),
}

/// Longest request line inspected by `RequestLine`.
pub const MAX_REQUEST_LINE: usize = 2048;

impl KeyExtractor {
    /// 判断是否还需要更多数据才能提取键
    pub fn needs_more(&self, data: &[u8]) -> bool {
        match self {
            KeyExtractor::RequestLine => {
                data.len() < MAX_REQUEST_LINE && !data.contains(&b'\n')
            }
            KeyExtractor::PayloadPrefix { length } => data.len() < *length,
        }
    }

    pub fn peek_len(&self) -> usize {
        match self {
            KeyExtractor::RequestLine => MAX_REQUEST_LINE,
            KeyExtractor::PayloadPrefix { length } => *length,
        }
    }

    /// Extracts the hash key from the leading bytes of a stream or a whole
    /// datagram. Returns `None` when no key is present.
    pub fn extract(&self, data: &[u8]) -> Option<Vec<u8>> {
        match self {
            KeyExtractor::RequestLine => {
                let end = data.iter().position(|b| *b == b'\n')?;
                let line = std::str::from_utf8(&data[..end]).ok()?.trim_end_matches('\r');
                let uri = line.split_ascii_whitespace().nth(1)?;
                let path = uri.split('?').next().unwrap_or(uri);
                if path.is_empty() {
                    None
                } else {
                    Some(path.as_bytes().to_vec())
                }
            }
            KeyExtractor::PayloadPrefix { length } => {
                if data.is_empty() {
                    None
                } else {
                    Some(data[..data.len().min(*length)].to_vec())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_key() {
        let extractor = KeyExtractor::RequestLine;
        let key = extractor.extract(b"GET /videos/42?token=abc HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(key.as_deref(), Some(&b"/videos/42"[..]));

        assert!(extractor.needs_more(b"GET /partial"));
        assert_eq!(extractor.extract(b"GET /partial"), None);
        assert_eq!(extractor.extract(b"\r\n"), None);
        assert_eq!(extractor.extract(&[0xff, 0xfe, b'\n']), None);
    }

    #[test]
    fn test_payload_prefix_key() {
        let extractor = KeyExtractor::PayloadPrefix { length: 4 };
        assert!(extractor.needs_more(b"ab"));
        assert!(!extractor.needs_more(b"abcdef"));
        assert_eq!(extractor.extract(b"abcdef").as_deref(), Some(&b"abcd"[..]));
        assert_eq!(extractor.extract(b"ab").as_deref(), Some(&b"ab"[..]));
        assert_eq!(extractor.extract(b""), None);
    }
}
