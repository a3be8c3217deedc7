//! Share-link import. Parses `vless://`, `vmess://`, `trojan://` and
//! `ss://` links into stored profiles. Subscription bodies reuse the same
//! parsers after an optional whole-body base64 decode.

use std::collections::HashMap;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use percent_encoding::percent_decode_str;
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};
use crate::model::{now_unix, Profile, ProfileConfig, ServerConfig};

pub fn parse(link: &str) -> Result<Profile> {
    let trimmed = link.trim();
    let server = if trimmed.starts_with("vless://") {
        parse_vless(trimmed)?
    } else if trimmed.starts_with("vmess://") {
        parse_vmess(trimmed)?
    } else if trimmed.starts_with("trojan://") {
        parse_trojan(trimmed)?
    } else if trimmed.starts_with("ss://") {
        parse_ss(trimmed)?
    } else {
        return Err(Error::Link("unsupported scheme".to_string()));
    };
    Ok(into_profile(server))
}

/// Parses a subscription body: either newline-separated share links or the
/// same list base64-encoded as a whole. Unparseable lines are collected as
/// errors instead of aborting the batch.
pub fn parse_list(body: &str) -> (Vec<Profile>, Vec<String>) {
    let text = match decode_base64_loose(body.trim()) {
        Ok(decoded) if decoded.contains("://") => decoded,
        _ => body.to_string(),
    };

    let mut profiles = Vec::new();
    let mut errors = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse(line) {
            Ok(profile) => profiles.push(profile),
            Err(err) => errors.push(format!("{line}: {err}")),
        }
    }
    (profiles, errors)
}

fn into_profile(server: ServerConfig) -> Profile {
    let name = server
        .extra
        .get("name")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("{}-{}:{}", server.protocol, server.address, server.port));
    let mut server = server;
    server.extra.remove("name");
    Profile {
        id: String::new(),
        name,
        config: ProfileConfig {
            outbounds: vec![server],
            ..ProfileConfig::default()
        },
        created_at: now_unix(),
    }
}

fn add_padding(value: &str) -> String {
    match value.len() % 4 {
        0 => value.to_string(),
        rem => format!("{value}{}", "=".repeat(4 - rem)),
    }
}

/// Tolerant base64 decode tried against standard and url-safe alphabets,
/// padded and unpadded.
pub fn decode_base64_loose(input: &str) -> Result<String> {
    let cleaned = input.trim();
    let candidates = [cleaned.to_string(), cleaned.replace('-', "+").replace('_', "/")];
    for candidate in candidates {
        let padded = add_padding(&candidate);
        for engine in [URL_SAFE_NO_PAD, URL_SAFE, STANDARD_NO_PAD, STANDARD] {
            for attempt in [candidate.as_str(), padded.as_str()] {
                if let Ok(bytes) = engine.decode(attempt.as_bytes()) {
                    if let Ok(value) = String::from_utf8(bytes) {
                        return Ok(value);
                    }
                }
            }
        }
    }
    Err(Error::Link("base64 decode failed".to_string()))
}

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs()
        .map(|(k, v)| (k.to_lowercase(), v.to_string()))
        .collect()
}

fn name_from_fragment(url: &Url) -> Option<String> {
    url.fragment()
        .map(|f| percent_decode_str(f).decode_utf8_lossy().into_owned())
        .filter(|f| !f.trim().is_empty())
}

fn apply_transport(server: &mut ServerConfig, params: &HashMap<String, String>) {
    if let Some(network) = params.get("type") {
        match network.as_str() {
            "ws" | "grpc" | "h2" | "tcp" => server.network = network.clone(),
            "http" => server.network = "h2".to_string(),
            _ => {}
        }
    }
    if let Some(path) = params.get("path") {
        server.path = Some(path.clone());
    }
    if let Some(host) = params.get("host") {
        server.host = Some(host.clone());
    }
    if let Some(service) = params
        .get("servicename")
        .or_else(|| params.get("service_name"))
    {
        server.service_name = Some(service.clone());
    }
    if let Some(security) = params.get("security") {
        if security == "tls" {
            server.tls = "tls".to_string();
        }
    }
    if let Some(sni) = params.get("sni") {
        server.sni = Some(sni.clone());
    }
    if let Some(insecure) = params.get("allowinsecure").or_else(|| params.get("insecure")) {
        server.allow_insecure = insecure == "1" || insecure.eq_ignore_ascii_case("true");
    }
}

fn set_name(server: &mut ServerConfig, name: Option<String>) {
    if let Some(name) = name {
        server.extra.insert("name".to_string(), Value::String(name));
    }
}

fn parse_vless(link: &str) -> Result<ServerConfig> {
    let url = Url::parse(link).map_err(|e| Error::Link(e.to_string()))?;
    let uuid = url.username();
    if uuid.is_empty() {
        return Err(Error::Link("vless link missing uuid".to_string()));
    }
    let address = url
        .host_str()
        .ok_or_else(|| Error::Link("vless link missing server".to_string()))?;
    let port = url
        .port()
        .ok_or_else(|| Error::Link("vless link missing port".to_string()))?;

    let params = query_map(&url);
    let mut server = ServerConfig::new("vless", address, port);
    server.uuid = Some(uuid.to_string());
    server.encryption = Some(
        params
            .get("encryption")
            .cloned()
            .unwrap_or_else(|| "none".to_string()),
    );
    if let Some(flow) = params.get("flow") {
        server.flow = Some(flow.clone());
    }
    apply_transport(&mut server, &params);
    set_name(&mut server, name_from_fragment(&url));
    Ok(server)
}

fn parse_vmess(link: &str) -> Result<ServerConfig> {
    let encoded = link.trim().trim_start_matches("vmess://");
    let decoded = decode_base64_loose(encoded)?;
    let raw: Value = serde_json::from_str(&decoded).map_err(|e| Error::Link(e.to_string()))?;
    let obj = raw
        .as_object()
        .ok_or_else(|| Error::Link("vmess payload is not an object".to_string()))?;

    let address = obj
        .get("add")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Link("vmess link missing server".to_string()))?;
    let port = obj
        .get("port")
        .and_then(|v| {
            v.as_str()
                .and_then(|s| s.parse::<u16>().ok())
                .or_else(|| v.as_u64().and_then(|p| u16::try_from(p).ok()))
        })
        .ok_or_else(|| Error::Link("vmess link has a missing or invalid port".to_string()))?;
    let uuid = obj
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Link("vmess link missing uuid".to_string()))?;

    let mut server = ServerConfig::new("vmess", address, port);
    server.uuid = Some(uuid.to_string());
    server.alter_id = obj.get("aid").and_then(|v| {
        v.as_str()
            .and_then(|s| s.parse::<u32>().ok())
            .or_else(|| v.as_u64().and_then(|a| u32::try_from(a).ok()))
    });
    server.security = obj
        .get("scy")
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    let mut params = HashMap::new();
    for (from, to) in [("net", "type"), ("host", "host"), ("path", "path"), ("sni", "sni")] {
        if let Some(value) = obj.get(from).and_then(Value::as_str) {
            params.insert(to.to_string(), value.to_string());
        }
    }
    if obj.get("tls").and_then(Value::as_str) == Some("tls") {
        params.insert("security".to_string(), "tls".to_string());
    }
    apply_transport(&mut server, &params);
    set_name(
        &mut server,
        obj.get("ps")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.to_string()),
    );
    Ok(server)
}

fn parse_trojan(link: &str) -> Result<ServerConfig> {
    let url = Url::parse(link).map_err(|e| Error::Link(e.to_string()))?;
    let password = url.username();
    if password.is_empty() {
        return Err(Error::Link("trojan link missing password".to_string()));
    }
    let address = url
        .host_str()
        .ok_or_else(|| Error::Link("trojan link missing server".to_string()))?;
    let port = url
        .port()
        .ok_or_else(|| Error::Link("trojan link missing port".to_string()))?;

    let params = query_map(&url);
    let mut server = ServerConfig::new("trojan", address, port);
    server.password = Some(
        percent_decode_str(password)
            .decode_utf8_lossy()
            .into_owned(),
    );
    // Trojan links default to TLS unless the link says otherwise.
    if params.get("security").map(String::as_str) != Some("none") {
        server.tls = "tls".to_string();
    }
    apply_transport(&mut server, &params);
    set_name(&mut server, name_from_fragment(&url));
    Ok(server)
}

fn parse_ss(link: &str) -> Result<ServerConfig> {
    let raw = link.trim().trim_start_matches("ss://");
    let (payload, fragment) = raw.split_once('#').unwrap_or((raw, ""));
    let (payload, _query) = payload.split_once('?').unwrap_or((payload, ""));

    let (userinfo, hostpart) = match payload.rsplit_once('@') {
        Some((user, host)) => (user.to_string(), host.to_string()),
        None => {
            let decoded = decode_base64_loose(payload)?;
            let (user, host) = decoded
                .rsplit_once('@')
                .ok_or_else(|| Error::Link("ss link missing server".to_string()))?;
            (user.to_string(), host.to_string())
        }
    };

    let creds = if userinfo.contains(':') {
        userinfo
    } else {
        decode_base64_loose(&userinfo)?
    };
    let (method, password) = creds
        .split_once(':')
        .ok_or_else(|| Error::Link("ss link missing method/password".to_string()))?;

    let (address, port_str) = hostpart
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| Error::Link("ss link missing port".to_string()))?;
    let port = port_str
        .parse::<u16>()
        .map_err(|_| Error::Link("ss link has an invalid port".to_string()))?;
    if address.is_empty() {
        return Err(Error::Link("ss link missing server".to_string()));
    }

    let mut server = ServerConfig::new("shadowsocks", address, port);
    server.method = Some(method.to_string());
    server.password = Some(password.to_string());
    let name = if fragment.trim().is_empty() {
        None
    } else {
        Some(
            percent_decode_str(fragment)
                .decode_utf8_lossy()
                .into_owned(),
        )
    };
    set_name(&mut server, name);
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vless_with_transport_and_tls() {
        let profile = parse(
            "vless://123e4567-e89b-12d3-a456-426614174000@example.com:443?type=ws&security=tls&sni=cdn.example.com&path=%2Fws#Edge",
        )
        .unwrap();
        assert_eq!(profile.name, "Edge");
        let server = &profile.config.outbounds[0];
        assert_eq!(server.protocol, "vless");
        assert_eq!(server.address, "example.com");
        assert_eq!(server.port, 443);
        assert_eq!(server.network, "ws");
        assert_eq!(server.tls, "tls");
        assert_eq!(server.sni.as_deref(), Some("cdn.example.com"));
        assert_eq!(server.path.as_deref(), Some("/ws"));
    }

    #[test]
    fn parses_vmess_base64_json() {
        let payload = serde_json::json!({
            "ps": "Tokyo",
            "add": "v.example.com",
            "port": "8443",
            "id": "123e4567-e89b-12d3-a456-426614174000",
            "aid": "0",
            "net": "ws",
            "tls": "tls",
            "host": "v.example.com",
            "path": "/vm"
        });
        let link = format!("vmess://{}", STANDARD.encode(payload.to_string()));
        let profile = parse(&link).unwrap();
        assert_eq!(profile.name, "Tokyo");
        let server = &profile.config.outbounds[0];
        assert_eq!(server.protocol, "vmess");
        assert_eq!(server.port, 8443);
        assert_eq!(server.alter_id, Some(0));
        assert_eq!(server.network, "ws");
        assert_eq!(server.tls, "tls");
    }

    #[test]
    fn parses_trojan_defaults_to_tls() {
        let profile = parse("trojan://secret@t.example.com:443#Home").unwrap();
        let server = &profile.config.outbounds[0];
        assert_eq!(server.protocol, "trojan");
        assert_eq!(server.password.as_deref(), Some("secret"));
        assert_eq!(server.tls, "tls");
    }

    #[test]
    fn parses_ss_with_base64_userinfo() {
        let userinfo = STANDARD.encode("chacha20-ietf-poly1305:pw");
        let link = format!("ss://{userinfo}@s.example.com:8388#SS");
        let profile = parse(&link).unwrap();
        let server = &profile.config.outbounds[0];
        assert_eq!(server.protocol, "shadowsocks");
        assert_eq!(server.method.as_deref(), Some("chacha20-ietf-poly1305"));
        assert_eq!(server.password.as_deref(), Some("pw"));
        assert_eq!(server.port, 8388);
    }

    #[test]
    fn rejects_vmess_port_out_of_range() {
        let payload = serde_json::json!({
            "add": "v.example.com",
            "port": 65536,
            "id": "123e4567-e89b-12d3-a456-426614174000"
        });
        let link = format!("vmess://{}", STANDARD.encode(payload.to_string()));
        assert!(matches!(parse(&link), Err(Error::Link(_))));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse("socks5://example.com:1080").is_err());
    }

    #[test]
    fn parse_list_collects_errors_and_profiles() {
        let body = "trojan://pw@a.example.com:443#A\n\nnot-a-link\n";
        let (profiles, errors) = parse_list(body);
        assert_eq!(profiles.len(), 1);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn parse_list_accepts_base64_body() {
        let body = STANDARD.encode("trojan://pw@a.example.com:443#A\n");
        let (profiles, errors) = parse_list(&body);
        assert_eq!(profiles.len(), 1);
        assert!(errors.is_empty());
    }
}
