// Proxy link decoding: one grammar per scheme, each returning an explicit Result

use crate::error::DecodeError;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

type Result<T> = std::result::Result<T, DecodeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scheme {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
}

impl Scheme {
    pub const ALL: [Scheme; 4] = [
        Scheme::Vless,
        Scheme::Vmess,
        Scheme::Trojan,
        Scheme::Shadowsocks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Vless => "vless",
            Scheme::Vmess => "vmess",
            Scheme::Trojan => "trojan",
            Scheme::Shadowsocks => "ss",
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Scheme::Vless => "vless://",
            Scheme::Vmess => "vmess://",
            Scheme::Trojan => "trojan://",
            Scheme::Shadowsocks => "ss://",
        }
    }

    /// Literal prefix match. Anything else is not a link we handle.
    pub fn detect(raw: &str) -> Option<Scheme> {
        Self::ALL
            .into_iter()
            .find(|scheme| raw.starts_with(scheme.prefix()))
    }

    pub fn parse(s: &str) -> Option<Scheme> {
        Self::ALL.into_iter().find(|scheme| scheme.as_str() == s)
    }

    /// Schemes whose links may carry their label as a `remark=` query key.
    pub fn supports_remark_query(&self) -> bool {
        matches!(self, Scheme::Vless | Scheme::Vmess)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A raw link string tagged with the scheme detected from its prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateLink {
    pub raw: String,
    pub scheme: Scheme,
}

impl CandidateLink {
    pub fn detect(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Scheme::detect(raw).map(|scheme| CandidateLink {
            raw: raw.to_string(),
            scheme,
        })
    }
}

/// Credentials carried by a link. The shape depends on the scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    /// VLESS user id or Trojan password.
    User(String),
    /// VMess user id taken from the JSON payload.
    Id(String),
    /// Shadowsocks credentials.
    Cipher { method: String, password: String },
}

impl Identity {
    /// Flat token used as the identity component of a canonical key.
    pub fn token(&self) -> String {
        match self {
            Identity::User(user) | Identity::Id(user) => user.clone(),
            Identity::Cipher { method, password } => format!("{}:{}", method, password),
        }
    }
}

/// Transport options recognised by the config synthesizer. Unknown query keys
/// are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportParams {
    pub network: Option<String>,
    pub security: Option<String>,
    pub sni: Option<String>,
    pub path: Option<String>,
    pub host: Option<String>,
    pub service_name: Option<String>,
    pub flow: Option<String>,
    pub public_key: Option<String>,
    pub short_id: Option<String>,
    pub fingerprint: Option<String>,
}

impl TransportParams {
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        let get = |key: &str| query.get(key).filter(|v| !v.is_empty()).cloned();
        TransportParams {
            network: get("type"),
            security: get("security"),
            sni: get("sni"),
            path: get("path"),
            host: get("host"),
            service_name: get("serviceName"),
            flow: get("flow"),
            public_key: get("pbk"),
            short_id: get("sid"),
            fingerprint: get("fp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedEndpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub identity: Identity,
    pub transport: TransportParams,
}

impl ParsedEndpoint {
    pub fn key(&self) -> CanonicalKey {
        CanonicalKey {
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port,
            identity: self.identity.token(),
        }
    }
}

/// Identity of a logical node across scan passes. Labels and query ordering
/// never take part in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalKey {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub identity: String,
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.scheme, self.host, self.port, self.identity
        )
    }
}

/// Finds links of every supported scheme in free text.
///
/// Built once at start-up and shared by reference. A single alternation is
/// used so that the `ss://` tail of a `vless://` link is never reported as a
/// link of its own.
pub struct LinkExtractor {
    pattern: Regex,
}

impl LinkExtractor {
    pub fn new() -> Self {
        let pattern = Regex::new(r#"(?:vless|vmess|trojan|ss)://[^\s<>"'`]+"#)
            .expect("link pattern is valid");
        Self { pattern }
    }

    pub fn extract(&self, text: &str) -> Vec<String> {
        self.pattern
            .find_iter(text)
            .map(|m| m.as_str().trim().to_string())
            .filter(|link| !link.is_empty())
            .collect()
    }
}

impl Default for LinkExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a raw link into an endpoint.
///
/// Either every required component is established (non-empty host, port in
/// 1..=65535, identity) or the link is rejected. Nothing is default-filled.
pub fn decode(raw: &str) -> Result<ParsedEndpoint> {
    let raw = raw.trim();
    let scheme = Scheme::detect(raw).ok_or(DecodeError::UnknownScheme)?;
    let body = &raw[scheme.prefix().len()..];

    match scheme {
        Scheme::Vless | Scheme::Trojan => decode_authority(scheme, body),
        Scheme::Vmess => decode_vmess(body),
        Scheme::Shadowsocks => decode_shadowsocks(body),
    }
}

/// The pieces of a link body: everything before `?`, the query and the fragment.
pub(crate) struct LinkParts<'a> {
    pub main: &'a str,
    pub query: Option<&'a str>,
    pub fragment: Option<&'a str>,
}

impl<'a> LinkParts<'a> {
    pub fn split(body: &'a str) -> Self {
        let (rest, fragment) = match body.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment)),
            None => (body, None),
        };
        let (main, query) = match rest.split_once('?') {
            Some((main, query)) => (main, Some(query)),
            None => (rest, None),
        };
        LinkParts {
            main,
            query,
            fragment,
        }
    }
}

/// Parse a query string into a flat map.
///
/// Pairs without `=` are dropped and the first occurrence of a key wins.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        params
            .entry(percent_decode(key))
            .or_insert_with(|| percent_decode(value));
    }
    params
}

fn percent_decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

fn decode_authority(scheme: Scheme, body: &str) -> Result<ParsedEndpoint> {
    let parts = LinkParts::split(body);
    let (user, hostport) = parts
        .main
        .rsplit_once('@')
        .ok_or(DecodeError::MissingSeparator('@'))?;

    let user = percent_decode(user);
    if user.is_empty() {
        return Err(DecodeError::MissingField("user"));
    }

    let (host, port) = split_host_port(hostport)?;
    let query = parts.query.map(parse_query).unwrap_or_default();

    Ok(ParsedEndpoint {
        scheme,
        host,
        port,
        identity: Identity::User(user),
        transport: TransportParams::from_query(&query),
    })
}

fn decode_vmess(body: &str) -> Result<ParsedEndpoint> {
    let parts = LinkParts::split(body);
    let json = decode_base64(parts.main)?;
    let payload: Value =
        serde_json::from_str(&json).map_err(|e| DecodeError::Json(e.to_string()))?;
    if !payload.is_object() {
        return Err(DecodeError::Json("payload is not an object".to_string()));
    }

    let host = json_string(&payload, "add").ok_or(DecodeError::EmptyHost)?;
    let port = json_string(&payload, "port").ok_or(DecodeError::MissingField("port"))?;
    let port = parse_port(&port)?;
    let id = json_string(&payload, "id").ok_or(DecodeError::MissingField("id"))?;

    let network = json_string(&payload, "net");
    let security = json_string(&payload, "tls").filter(|tls| tls != "none");
    let path = json_string(&payload, "path");
    let service_name = match network.as_deref() {
        Some("grpc") => path.clone(),
        _ => None,
    };

    Ok(ParsedEndpoint {
        scheme: Scheme::Vmess,
        host,
        port,
        identity: Identity::Id(id),
        transport: TransportParams {
            network,
            security,
            sni: json_string(&payload, "sni"),
            path,
            host: json_string(&payload, "host"),
            service_name,
            fingerprint: json_string(&payload, "fp"),
            ..TransportParams::default()
        },
    })
}

fn decode_shadowsocks(body: &str) -> Result<ParsedEndpoint> {
    let parts = LinkParts::split(body);

    let (method, password, host, port) = match parts.main.rsplit_once('@') {
        Some((userinfo, hostport)) => {
            let (method, password) = decode_ss_userinfo(userinfo)?;
            let (host, port) = split_host_port(hostport)?;
            (method, password, host, port)
        }
        None => {
            let decoded = decode_base64(parts.main)?;
            let (credentials, hostport) = decoded
                .rsplit_once('@')
                .ok_or(DecodeError::MissingSeparator('@'))?;
            let (method, password) = split_credentials(credentials)?;
            let (host, port) = split_host_port(hostport)?;
            (method, password, host, port)
        }
    };

    let query = parts.query.map(parse_query).unwrap_or_default();

    Ok(ParsedEndpoint {
        scheme: Scheme::Shadowsocks,
        host,
        port,
        identity: Identity::Cipher { method, password },
        transport: TransportParams::from_query(&query),
    })
}

fn decode_ss_userinfo(userinfo: &str) -> Result<(String, String)> {
    let userinfo = percent_decode(userinfo);
    match decode_base64(&userinfo) {
        Ok(decoded) => split_credentials(&decoded),
        // SIP002 allows plain `method:password` for AEAD-2022 ciphers
        Err(err) => {
            if userinfo.contains(':') {
                split_credentials(&userinfo)
            } else {
                Err(err)
            }
        }
    }
}

fn split_credentials(credentials: &str) -> Result<(String, String)> {
    let (method, password) = credentials
        .split_once(':')
        .ok_or(DecodeError::MissingSeparator(':'))?;
    if method.is_empty() {
        return Err(DecodeError::MissingField("method"));
    }
    if password.is_empty() {
        return Err(DecodeError::MissingField("password"));
    }
    Ok((method.to_string(), password.to_string()))
}

fn split_host_port(hostport: &str) -> Result<(String, u16)> {
    let hostport = hostport.trim().trim_end_matches('/');
    let (host, port) = hostport
        .rsplit_once(':')
        .ok_or(DecodeError::MissingSeparator(':'))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(DecodeError::EmptyHost);
    }
    Ok((host.to_string(), parse_port(port)?))
}

fn parse_port(port: &str) -> Result<u16> {
    port.trim()
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| DecodeError::InvalidPort(port.to_string()))
}

/// Base64 with padding correction: `=` is appended until the length is a
/// multiple of four. Standard and URL-safe alphabets are both accepted.
pub fn decode_base64(payload: &str) -> Result<String> {
    let mut padded: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if padded.is_empty() {
        return Err(DecodeError::Base64);
    }
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    let bytes = STANDARD
        .decode(&padded)
        .or_else(|_| URL_SAFE.decode(&padded))
        .map_err(|_| DecodeError::Base64)?;
    String::from_utf8(bytes).map_err(|_| DecodeError::Utf8)
}

/// Non-empty string field; numbers are accepted and rendered as text.
fn json_string(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD_NO_PAD;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    fn vmess_link(json: &Value) -> String {
        format!("vmess://{}", STANDARD_NO_PAD.encode(json.to_string()))
    }

    #[test]
    fn test_scheme_detection() {
        assert_eq!(Scheme::detect("vless://x"), Some(Scheme::Vless));
        assert_eq!(Scheme::detect("vmess://x"), Some(Scheme::Vmess));
        assert_eq!(Scheme::detect("trojan://x"), Some(Scheme::Trojan));
        assert_eq!(Scheme::detect("ss://x"), Some(Scheme::Shadowsocks));
        assert_eq!(Scheme::detect("http://x"), None);
        assert_eq!(Scheme::detect("ssr://x"), None);
        assert_eq!(decode("hysteria2://a@b:1"), Err(DecodeError::UnknownScheme));
    }

    #[test]
    fn test_decode_vless() {
        let link = format!(
            "vless://{}@edge.example.com:443?type=ws&security=tls&sni=cdn.example.com&path=%2Fws&host=cdn.example.com#node",
            UUID
        );
        let endpoint = decode(&link).unwrap();

        assert_eq!(endpoint.scheme, Scheme::Vless);
        assert_eq!(endpoint.host, "edge.example.com");
        assert_eq!(endpoint.port, 443);
        assert_eq!(endpoint.identity, Identity::User(UUID.to_string()));
        assert_eq!(endpoint.transport.network.as_deref(), Some("ws"));
        assert_eq!(endpoint.transport.security.as_deref(), Some("tls"));
        assert_eq!(endpoint.transport.sni.as_deref(), Some("cdn.example.com"));
        assert_eq!(endpoint.transport.path.as_deref(), Some("/ws"));
    }

    #[test]
    fn test_decode_vless_with_trailing_slash_and_no_query() {
        let endpoint = decode(&format!("vless://{}@1.2.3.4:8443/", UUID)).unwrap();
        assert_eq!(endpoint.host, "1.2.3.4");
        assert_eq!(endpoint.port, 8443);
        assert_eq!(endpoint.transport, TransportParams::default());
    }

    #[test]
    fn test_decode_trojan() {
        let endpoint =
            decode("trojan://s3cr%40t@tr.example.net:443?security=tls&sni=tr.example.net#t1")
                .unwrap();
        assert_eq!(endpoint.scheme, Scheme::Trojan);
        assert_eq!(endpoint.host, "tr.example.net");
        assert_eq!(endpoint.port, 443);
        assert_eq!(endpoint.identity, Identity::User("s3cr@t".to_string()));
    }

    #[test]
    fn test_identity_uses_last_at_sign() {
        let endpoint = decode("trojan://pa@ss@host.example:443").unwrap();
        assert_eq!(endpoint.identity, Identity::User("pa@ss".to_string()));
        assert_eq!(endpoint.host, "host.example");
    }

    #[test]
    fn test_decode_ipv6_host() {
        let endpoint = decode(&format!("vless://{}@[2001:db8::1]:443", UUID)).unwrap();
        assert_eq!(endpoint.host, "2001:db8::1");
        assert_eq!(endpoint.port, 443);
    }

    #[test]
    fn test_decode_vmess() {
        let json = serde_json::json!({
            "v": "2", "ps": "label", "add": "vm.example.org", "port": "8080",
            "id": UUID, "aid": "0", "net": "ws", "path": "/ray", "host": "vm.example.org",
            "tls": "tls", "sni": "vm.example.org"
        });
        let endpoint = decode(&vmess_link(&json)).unwrap();

        assert_eq!(endpoint.scheme, Scheme::Vmess);
        assert_eq!(endpoint.host, "vm.example.org");
        assert_eq!(endpoint.port, 8080);
        assert_eq!(endpoint.identity, Identity::Id(UUID.to_string()));
        assert_eq!(endpoint.transport.network.as_deref(), Some("ws"));
        assert_eq!(endpoint.transport.security.as_deref(), Some("tls"));
        assert_eq!(endpoint.transport.path.as_deref(), Some("/ray"));
    }

    #[test]
    fn test_decode_vmess_numeric_port_and_grpc() {
        let json = serde_json::json!({
            "add": "g.example.org", "port": 2053, "id": UUID, "net": "grpc", "path": "svc", "tls": "none"
        });
        let endpoint = decode(&vmess_link(&json)).unwrap();
        assert_eq!(endpoint.port, 2053);
        assert_eq!(endpoint.transport.service_name.as_deref(), Some("svc"));
        assert_eq!(endpoint.transport.security, None);
    }

    #[test]
    fn test_decode_large_vmess_payload_needing_padding() {
        // ~1.2 KB payload, encoded without padding
        let json = serde_json::json!({
            "add": "example.test", "port": 443, "id": "abc-123", "ps": "x".repeat(850)
        });
        let link = vmess_link(&json);
        assert!(link.len() > 1150, "link is {} bytes", link.len());

        let endpoint = decode(&link).unwrap();
        assert_eq!(endpoint.host, "example.test");
        assert_eq!(endpoint.port, 443);
        assert_eq!(endpoint.identity, Identity::Id("abc-123".to_string()));
    }

    #[test]
    fn test_decode_ss_userinfo_form() {
        let userinfo = STANDARD_NO_PAD.encode("aes-256-gcm:hunter2");
        let endpoint = decode(&format!("ss://{}@ss.example.com:8388#ss-node", userinfo)).unwrap();
        assert_eq!(endpoint.scheme, Scheme::Shadowsocks);
        assert_eq!(endpoint.host, "ss.example.com");
        assert_eq!(endpoint.port, 8388);
        assert_eq!(
            endpoint.identity,
            Identity::Cipher {
                method: "aes-256-gcm".to_string(),
                password: "hunter2".to_string()
            }
        );
    }

    #[test]
    fn test_decode_ss_whole_body_form() {
        let body = STANDARD.encode("chacha20-ietf-poly1305:p@ss:word@10.0.0.7:443");
        let endpoint = decode(&format!("ss://{}#legacy", body)).unwrap();
        assert_eq!(endpoint.host, "10.0.0.7");
        assert_eq!(endpoint.port, 443);
        assert_eq!(
            endpoint.identity,
            Identity::Cipher {
                method: "chacha20-ietf-poly1305".to_string(),
                password: "p@ss:word".to_string()
            }
        );
    }

    #[test]
    fn test_decode_ss_plain_userinfo() {
        let endpoint =
            decode("ss://2022-blake3-aes-128-gcm:c2VjcmV0@ss2022.example.com:443").unwrap();
        assert_eq!(
            endpoint.identity,
            Identity::Cipher {
                method: "2022-blake3-aes-128-gcm".to_string(),
                password: "c2VjcmV0".to_string()
            }
        );
    }

    #[test]
    fn test_corrupted_links_are_invalid() {
        let good_vmess = vmess_link(&serde_json::json!({"add": "a.example", "port": 1, "id": "x"}));
        let truncated = &good_vmess[..good_vmess.len() - 7];

        let cases = [
            truncated.to_string(),
            "vmess://!!!not-base64!!!".to_string(),
            format!("vmess://{}", STANDARD.encode("[1,2,3]")),
            format!("vmess://{}", STANDARD.encode(r#"{"add":"h","id":"x"}"#)),
            format!("vmess://{}", STANDARD.encode(r#"{"add":"","port":1,"id":"x"}"#)),
            format!("vless://{}host.example:443", UUID),
            format!("vless://{}@host.example", UUID),
            format!("vless://{}@host.example:https", UUID),
            format!("vless://{}@host.example:0", UUID),
            format!("vless://{}@host.example:70000", UUID),
            format!("vless://{}@:443", UUID),
            "vless://@host.example:443".to_string(),
            "trojan://pw@host.example:".to_string(),
            "ss://bm90LWJhc2U2NA@host.example:8388".to_string(),
            format!("ss://{}", STANDARD.encode("aes-256-gcm:pw-without-host")),
            "ss://%%%".to_string(),
            "ss://".to_string(),
        ];

        for case in &cases {
            assert!(decode(case).is_err(), "expected invalid: {}", case);
        }
    }

    #[test]
    fn test_parse_query_rules() {
        let params = parse_query("type=ws&flag&type=grpc&path=%2Fa%2Fb&=orphan");
        assert_eq!(params.get("type").map(String::as_str), Some("ws"));
        assert_eq!(params.get("path").map(String::as_str), Some("/a/b"));
        assert!(!params.contains_key("flag"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_canonical_key_ignores_label_and_query_order() {
        let a = decode(&format!(
            "vless://{}@h.example:443?type=ws&security=tls#first",
            UUID
        ))
        .unwrap();
        let b = decode(&format!(
            "vless://{}@h.example:443?security=tls&type=ws#second",
            UUID
        ))
        .unwrap();
        assert_eq!(a.key(), b.key());
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonical_key_display() {
        let endpoint = decode("trojan://pw@h.example:443").unwrap();
        assert_eq!(endpoint.key().to_string(), "trojan-h.example-443-pw");
    }

    #[test]
    fn test_extractor_finds_every_scheme() {
        let extractor = LinkExtractor::new();
        let text = format!(
            "today:\nvless://{}@a.example:443?type=tcp#A\n<b>trojan://pw@b.example:443</b> ss://YWVzOnB3@c.example:1 and vmess://eyJ9",
            UUID
        );
        let links = extractor.extract(&text);
        assert_eq!(links.len(), 4);
        assert!(links[0].starts_with("vless://"));
        assert_eq!(links[1], "trojan://pw@b.example:443");
        assert_eq!(links[2], "ss://YWVzOnB3@c.example:1");
        assert_eq!(links[3], "vmess://eyJ9");
    }

    #[test]
    fn test_extractor_does_not_split_vless() {
        let extractor = LinkExtractor::new();
        let links = extractor.extract(&format!("vless://{}@a.example:443", UUID));
        assert_eq!(links.len(), 1);
        assert!(links[0].starts_with("vless://"));
    }

    #[test]
    fn test_candidate_link_detection() {
        let candidate = CandidateLink::detect("  trojan://pw@h:1 \n").unwrap();
        assert_eq!(candidate.scheme, Scheme::Trojan);
        assert_eq!(candidate.raw, "trojan://pw@h:1");
        assert!(CandidateLink::detect("https://example.com").is_none());
    }
}
