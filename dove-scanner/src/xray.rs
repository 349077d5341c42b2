//! Tunneling-engine configuration documents.
//!
//! [`synthesize`] turns a decoded endpoint into the smallest document the
//! engine accepts: one loopback SOCKS inbound on the control port and one
//! outbound for the endpoint. Field names and order follow the engine's JSON
//! schema exactly, so the structs below serialize straight into a file the
//! engine can load with `run -c <path>`.

use crate::link::{Identity, ParsedEndpoint, Scheme, TransportParams};
use serde::Serialize;

pub const LOOPBACK: &str = "127.0.0.1";
const DEFAULT_NETWORK: &str = "tcp";
const DEFAULT_WS_PATH: &str = "/";
const DEFAULT_REALITY_FINGERPRINT: &str = "chrome";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub log: LogSettings,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSettings {
    pub loglevel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inbound {
    pub port: u16,
    pub listen: String,
    pub protocol: String,
    pub settings: InboundSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundSettings {
    pub udp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outbound {
    pub protocol: String,
    pub settings: OutboundSettings,
    #[serde(rename = "streamSettings")]
    pub stream_settings: StreamSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundSettings {
    Vnext { vnext: Vec<VnextServer> },
    Servers { servers: Vec<ServerEntry> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VnextServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<VnextUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VnextUser {
    pub id: String,
    pub encryption: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerEntry {
    pub address: String,
    pub port: u16,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub server_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsSettings {
    pub path: String,
    pub headers: WsHeaders,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsHeaders {
    #[serde(rename = "Host")]
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    pub service_name: String,
    pub multi_mode: bool,
}

impl EngineConfig {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Build the engine document for `endpoint`, listening on `control_port`.
pub fn synthesize(endpoint: &ParsedEndpoint, control_port: u16) -> EngineConfig {
    EngineConfig {
        log: LogSettings {
            loglevel: "warning".to_string(),
        },
        inbounds: vec![Inbound {
            port: control_port,
            listen: LOOPBACK.to_string(),
            protocol: "socks".to_string(),
            settings: InboundSettings { udp: true },
        }],
        outbounds: vec![build_outbound(endpoint)],
    }
}

fn build_outbound(endpoint: &ParsedEndpoint) -> Outbound {
    let address = endpoint.host.clone();
    let port = endpoint.port;

    let (protocol, settings) = match (&endpoint.scheme, &endpoint.identity) {
        (Scheme::Shadowsocks, Identity::Cipher { method, password }) => (
            "shadowsocks",
            OutboundSettings::Servers {
                servers: vec![ServerEntry {
                    address,
                    port,
                    password: password.clone(),
                    method: Some(method.clone()),
                }],
            },
        ),
        (Scheme::Trojan, identity) => (
            "trojan",
            OutboundSettings::Servers {
                servers: vec![ServerEntry {
                    address,
                    port,
                    password: identity.token(),
                    method: None,
                }],
            },
        ),
        (scheme, identity) => {
            let (protocol, encryption, flow) = match scheme {
                Scheme::Vless => ("vless", "none", endpoint.transport.flow.clone()),
                _ => ("vmess", "auto", None),
            };
            (
                protocol,
                OutboundSettings::Vnext {
                    vnext: vec![VnextServer {
                        address,
                        port,
                        users: vec![VnextUser {
                            id: identity.token(),
                            encryption: encryption.to_string(),
                            flow,
                        }],
                    }],
                },
            )
        }
    };

    Outbound {
        protocol: protocol.to_string(),
        settings,
        stream_settings: build_stream_settings(&endpoint.transport, &endpoint.host),
    }
}

fn build_stream_settings(params: &TransportParams, endpoint_host: &str) -> StreamSettings {
    let network = params
        .network
        .clone()
        .unwrap_or_else(|| DEFAULT_NETWORK.to_string());

    let mut stream = StreamSettings {
        network,
        security: None,
        tls_settings: None,
        reality_settings: None,
        ws_settings: None,
        grpc_settings: None,
    };

    match params.security.as_deref() {
        Some("tls") => {
            stream.security = Some("tls".to_string());
            stream.tls_settings = params.sni.clone().map(|server_name| TlsSettings { server_name });
        }
        Some("reality") => {
            stream.security = Some("reality".to_string());
            stream.reality_settings = Some(RealitySettings {
                server_name: params.sni.clone(),
                public_key: params.public_key.clone(),
                short_id: params.short_id.clone(),
                fingerprint: params
                    .fingerprint
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REALITY_FINGERPRINT.to_string()),
            });
        }
        _ => {}
    }

    match stream.network.as_str() {
        "ws" => {
            stream.ws_settings = Some(WsSettings {
                path: params
                    .path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_WS_PATH.to_string()),
                headers: WsHeaders {
                    host: params
                        .host
                        .clone()
                        .unwrap_or_else(|| endpoint_host.to_string()),
                },
            });
        }
        "grpc" => {
            stream.grpc_settings = Some(GrpcSettings {
                service_name: params.service_name.clone().unwrap_or_default(),
                multi_mode: false,
            });
        }
        _ => {}
    }

    stream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::decode;
    use serde_json::json;

    fn to_value(config: &EngineConfig) -> serde_json::Value {
        serde_json::to_value(config).unwrap()
    }

    #[test]
    fn test_vless_ws_tls_document() {
        let endpoint = decode(
            "vless://uid@v.example:443?type=ws&security=tls&sni=s.example&path=%2Fpath#n",
        )
        .unwrap();
        let config = synthesize(&endpoint, 12345);

        assert_eq!(
            to_value(&config),
            json!({
                "log": {"loglevel": "warning"},
                "inbounds": [{
                    "port": 12345, "listen": "127.0.0.1", "protocol": "socks",
                    "settings": {"udp": true}
                }],
                "outbounds": [{
                    "protocol": "vless",
                    "settings": {"vnext": [{
                        "address": "v.example", "port": 443,
                        "users": [{"id": "uid", "encryption": "none"}]
                    }]},
                    "streamSettings": {
                        "network": "ws",
                        "security": "tls",
                        "tlsSettings": {"serverName": "s.example"},
                        "wsSettings": {"path": "/path", "headers": {"Host": "v.example"}}
                    }
                }]
            })
        );
    }

    #[test]
    fn test_inbound_key_order_is_stable() {
        let endpoint = decode("trojan://pw@t.example:443").unwrap();
        let text = synthesize(&endpoint, 10001).to_json().unwrap();
        assert!(text.starts_with(
            r#"{"log":{"loglevel":"warning"},"inbounds":[{"port":10001,"listen":"127.0.0.1","protocol":"socks","settings":{"udp":true}}]"#
        ));
    }

    #[test]
    fn test_vmess_defaults_to_tcp() {
        use base64::Engine;
        let payload = base64::engine::general_purpose::STANDARD
            .encode(json!({"add": "m.example", "port": 80, "id": "vid"}).to_string());
        let endpoint = decode(&format!("vmess://{}", payload)).unwrap();
        let value = to_value(&synthesize(&endpoint, 20000));

        assert_eq!(value["outbounds"][0]["protocol"], "vmess");
        assert_eq!(
            value["outbounds"][0]["settings"]["vnext"][0]["users"][0],
            json!({"id": "vid", "encryption": "auto"})
        );
        assert_eq!(value["outbounds"][0]["streamSettings"], json!({"network": "tcp"}));
    }

    #[test]
    fn test_trojan_password_entry() {
        let endpoint = decode("trojan://secret@t.example:8443?security=tls").unwrap();
        let value = to_value(&synthesize(&endpoint, 10000));

        assert_eq!(value["outbounds"][0]["protocol"], "trojan");
        assert_eq!(
            value["outbounds"][0]["settings"],
            json!({"servers": [{"address": "t.example", "port": 8443, "password": "secret"}]})
        );
        // tls without sni: security flag, no tlsSettings
        assert_eq!(
            value["outbounds"][0]["streamSettings"],
            json!({"network": "tcp", "security": "tls"})
        );
    }

    #[test]
    fn test_shadowsocks_cipher_entry() {
        let endpoint = decode("ss://YWVzLTI1Ni1nY206cHc@s.example:8388").unwrap();
        let value = to_value(&synthesize(&endpoint, 10000));

        assert_eq!(value["outbounds"][0]["protocol"], "shadowsocks");
        assert_eq!(
            value["outbounds"][0]["settings"],
            json!({"servers": [{
                "address": "s.example", "port": 8388, "password": "pw", "method": "aes-256-gcm"
            }]})
        );
    }

    #[test]
    fn test_ws_defaults() {
        let endpoint = decode("vless://uid@v.example:80?type=ws").unwrap();
        let value = to_value(&synthesize(&endpoint, 10000));
        assert_eq!(
            value["outbounds"][0]["streamSettings"]["wsSettings"],
            json!({"path": "/", "headers": {"Host": "v.example"}})
        );
    }

    #[test]
    fn test_grpc_block() {
        let endpoint = decode("vless://uid@v.example:443?type=grpc&serviceName=tun").unwrap();
        let value = to_value(&synthesize(&endpoint, 10000));
        assert_eq!(
            value["outbounds"][0]["streamSettings"]["grpcSettings"],
            json!({"serviceName": "tun", "multiMode": false})
        );

        let endpoint = decode("vless://uid@v.example:443?type=grpc").unwrap();
        let value = to_value(&synthesize(&endpoint, 10000));
        assert_eq!(
            value["outbounds"][0]["streamSettings"]["grpcSettings"]["serviceName"],
            ""
        );
    }

    #[test]
    fn test_reality_block_and_flow() {
        let endpoint = decode(
            "vless://uid@r.example:443?security=reality&sni=www.example.com&pbk=KEY&sid=ab&flow=xtls-rprx-vision",
        )
        .unwrap();
        let value = to_value(&synthesize(&endpoint, 10000));

        assert_eq!(
            value["outbounds"][0]["settings"]["vnext"][0]["users"][0]["flow"],
            "xtls-rprx-vision"
        );
        assert_eq!(
            value["outbounds"][0]["streamSettings"],
            json!({
                "network": "tcp",
                "security": "reality",
                "realitySettings": {
                    "serverName": "www.example.com", "publicKey": "KEY",
                    "shortId": "ab", "fingerprint": "chrome"
                }
            })
        );
    }

    #[test]
    fn test_unknown_network_passes_through() {
        let endpoint = decode("vless://uid@v.example:443?type=h2&security=none").unwrap();
        let value = to_value(&synthesize(&endpoint, 10000));
        assert_eq!(value["outbounds"][0]["streamSettings"], json!({"network": "h2"}));
    }
}
