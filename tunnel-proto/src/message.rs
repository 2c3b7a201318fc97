use serde::{Deserialize, Serialize};

/// Protocol version string negotiated during `Auth`. Both sides must agree
/// byte-for-byte or the server rejects the session in its `AuthResp`.
pub const PROTO_VERSION: &str = "2";
pub const MM_VERSION: &str = "0.3";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Auth {
    pub version: String,
    pub mm_version: String,
    pub user: String,
    pub password: String,
    #[serde(rename = "OS")]
    pub os: String,
    pub arch: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct AuthResp {
    pub version: String,
    pub mm_version: String,
    pub client_id: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ReqTunnel {
    pub req_id: String,
    pub protocol: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub http_auth: String,
    #[serde(default)]
    pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct NewTunnel {
    pub req_id: String,
    #[serde(default)]
    pub url: String,
    pub protocol: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReqProxy {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct RegProxy {
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct StartProxy {
    pub url: String,
    pub client_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Ping {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Pong {}

/// Every message type that can cross the wire. `serde`'s internally tagged
/// representation mirrors the `{"Type": ..., "Payload": ...}` envelope
/// without requiring a hand-written tag match on encode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "Type", content = "Payload")]
pub enum Message {
    Auth(Auth),
    AuthResp(AuthResp),
    ReqTunnel(ReqTunnel),
    NewTunnel(NewTunnel),
    ReqProxy(ReqProxy),
    RegProxy(RegProxy),
    StartProxy(StartProxy),
    Ping(Ping),
    Pong(Pong),
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Auth(_) => "Auth",
            Message::AuthResp(_) => "AuthResp",
            Message::ReqTunnel(_) => "ReqTunnel",
            Message::NewTunnel(_) => "NewTunnel",
            Message::ReqProxy(_) => "ReqProxy",
            Message::RegProxy(_) => "RegProxy",
            Message::StartProxy(_) => "StartProxy",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
        }
    }
}

/// Alias kept for readers coming from the wire-format description in
/// external docs; `Message` already carries its own tag/payload.
pub type Envelope = Message;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant_through_json() {
        let msgs = vec![
            Message::Auth(Auth {
                version: PROTO_VERSION.into(),
                mm_version: MM_VERSION.into(),
                user: "tok".into(),
                password: String::new(),
                os: "linux".into(),
                arch: "x86_64".into(),
                client_id: String::new(),
            }),
            Message::AuthResp(AuthResp {
                version: PROTO_VERSION.into(),
                mm_version: MM_VERSION.into(),
                client_id: "abcd1234".into(),
                error: String::new(),
            }),
            Message::ReqTunnel(ReqTunnel {
                req_id: "ff00".into(),
                protocol: "http+https".into(),
                hostname: String::new(),
                subdomain: "foo".into(),
                http_auth: String::new(),
                remote_port: 0,
            }),
            Message::NewTunnel(NewTunnel {
                req_id: "ff00".into(),
                url: "http://foo.example.com".into(),
                protocol: "http".into(),
                error: String::new(),
            }),
            Message::ReqProxy(ReqProxy {}),
            Message::RegProxy(RegProxy {
                client_id: "abcd1234".into(),
            }),
            Message::StartProxy(StartProxy {
                url: "http://foo.example.com".into(),
                client_addr: "1.2.3.4:5555".into(),
            }),
            Message::Ping(Ping {}),
            Message::Pong(Pong {}),
        ];

        for m in msgs {
            let encoded = serde_json::to_vec(&m).unwrap();
            let decoded: Message = serde_json::from_slice(&encoded).unwrap();
            assert_eq!(m, decoded);
        }
    }

    #[test]
    fn envelope_shape_matches_wire_contract() {
        let m = Message::Ping(Ping {});
        let v: serde_json::Value = serde_json::to_value(&m).unwrap();
        assert_eq!(v["Type"], "Ping");
        assert!(v["Payload"].is_object());
    }

    /// The wire payload field names are the literal PascalCase identifiers
    /// the spec's external interface table gives, not Rust-side field names.
    #[test]
    fn auth_payload_uses_literal_wire_field_names() {
        let m = Message::Auth(Auth {
            version: "2".into(),
            mm_version: "0.3".into(),
            user: "tok".into(),
            password: String::new(),
            os: "linux".into(),
            arch: "x86_64".into(),
            client_id: String::new(),
        });
        let v = serde_json::to_value(&m).unwrap();
        let payload = &v["Payload"];
        assert_eq!(payload["Version"], "2");
        assert_eq!(payload["MmVersion"], "0.3");
        assert_eq!(payload["User"], "tok");
        assert_eq!(payload["Password"], "");
        assert_eq!(payload["OS"], "linux");
        assert_eq!(payload["Arch"], "x86_64");
        assert_eq!(payload["ClientId"], "");
    }

    #[test]
    fn auth_resp_payload_uses_literal_wire_field_names() {
        let m = Message::AuthResp(AuthResp {
            version: "2".into(),
            mm_version: "0.3".into(),
            client_id: "abcd1234".into(),
            error: "bad version".into(),
        });
        let v = serde_json::to_value(&m).unwrap();
        let payload = &v["Payload"];
        assert_eq!(payload["Version"], "2");
        assert_eq!(payload["MmVersion"], "0.3");
        assert_eq!(payload["ClientId"], "abcd1234");
        assert_eq!(payload["Error"], "bad version");
    }

    #[test]
    fn req_tunnel_payload_uses_literal_wire_field_names() {
        let m = Message::ReqTunnel(ReqTunnel {
            req_id: "ff00".into(),
            protocol: "http".into(),
            hostname: String::new(),
            subdomain: "foo".into(),
            http_auth: "Basic dXNlcjpwYXNz".into(),
            remote_port: 9000,
        });
        let v = serde_json::to_value(&m).unwrap();
        let payload = &v["Payload"];
        assert_eq!(payload["ReqId"], "ff00");
        assert_eq!(payload["Protocol"], "http");
        assert_eq!(payload["Subdomain"], "foo");
        assert_eq!(payload["HttpAuth"], "Basic dXNlcjpwYXNz");
        assert_eq!(payload["RemotePort"], 9000);
    }

    #[test]
    fn new_tunnel_payload_uses_literal_wire_field_names() {
        let m = Message::NewTunnel(NewTunnel {
            req_id: "ff00".into(),
            url: "http://foo.example.com".into(),
            protocol: "http".into(),
            error: String::new(),
        });
        let v = serde_json::to_value(&m).unwrap();
        let payload = &v["Payload"];
        assert_eq!(payload["ReqId"], "ff00");
        assert_eq!(payload["Url"], "http://foo.example.com");
        assert_eq!(payload["Protocol"], "http");
        assert_eq!(payload["Error"], "");
    }

    #[test]
    fn reg_proxy_and_start_proxy_payloads_use_literal_wire_field_names() {
        let reg = Message::RegProxy(RegProxy {
            client_id: "abcd1234".into(),
        });
        let v = serde_json::to_value(&reg).unwrap();
        assert_eq!(v["Payload"]["ClientId"], "abcd1234");

        let start = Message::StartProxy(StartProxy {
            url: "http://foo.example.com".into(),
            client_addr: "1.2.3.4:5555".into(),
        });
        let v = serde_json::to_value(&start).unwrap();
        assert_eq!(v["Payload"]["Url"], "http://foo.example.com");
        assert_eq!(v["Payload"]["ClientAddr"], "1.2.3.4:5555");
    }
}
