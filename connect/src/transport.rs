use percent_encoding::percent_decode_str;
use registry::{Protocol, Server, Transport, User};
use serde::Serialize;

#[derive(Serialize, Debug, PartialEq)]
pub struct ConnectDocument {
    pub transport: TcpUdp,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct TcpUdp {
    #[serde(rename = "$type")]
    kind: &'static str,
    pub tcp: Shadowsocks,
    pub udp: Shadowsocks,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct Shadowsocks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(rename = "$type")]
    kind: &'static str,
    pub endpoint: Endpoint,
    pub cipher: String,
    pub secret: String,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct Endpoint {
    #[serde(rename = "$type")]
    kind: &'static str,
    pub url: String,
}

impl ConnectDocument {
    pub fn build(server: &Server, user: &User, domain: &str, cipher: &str, secret: &str) -> Self {
        let leg = |transport: Transport| {
            let protocol = server.transports.get(transport);
            Shadowsocks {
                prefix: user_prefix(protocol, user),
                kind: "shadowsocks",
                endpoint: Endpoint {
                    kind: "websocket",
                    url: websocket_url(domain, protocol),
                },
                cipher: cipher.to_string(),
                secret: secret.to_string(),
            }
        };

        ConnectDocument {
            transport: TcpUdp {
                kind: "tcpudp",
                tcp: leg(Transport::Tcp),
                udp: leg(Transport::Udp),
            },
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

fn user_prefix(protocol: &Protocol, user: &User) -> Option<String> {
    match protocol.prefix.as_deref() {
        Some(raw) if !raw.is_empty() && user.prefix_enabled => Some(decode_prefix(raw)),
        _ => None,
    }
}

/// `wss://` URL of one transport. Port 443 and an unset port are left out.
pub fn websocket_url(domain: &str, protocol: &Protocol) -> String {
    let path = protocol.path.trim_start_matches('/');
    match protocol.port {
        0 | 443 => format!("wss://{domain}/{path}"),
        port => format!("wss://{domain}:{port}/{path}"),
    }
}

/// Decodes a percent-encoded connection prefix.
///
/// Clients read the prefix as a string whose code points are the raw bytes,
/// so each decoded byte becomes the character U+00XX.
pub fn decode_prefix(raw: &str) -> String {
    percent_decode_str(raw).map(char::from).collect()
}
