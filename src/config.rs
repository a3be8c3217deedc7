//! Backend wire-config generation. A stored server definition is mapped
//! deterministically to a complete process config: one inbound from global
//! settings, one `proxy` outbound plus a fixed `direct` freedom outbound,
//! stream settings per transport, and a routing block. Generation never
//! touches disk or network.

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::model::{DnsEntry, RoutingRules, RoutingToggles, ServerConfig};

/// Global inbound settings, sourced from persisted preferences rather than
/// the server record.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSettings {
    pub protocol: String,
    pub listen: String,
    pub port: u16,
    pub auth: String,
}

impl Default for InboundSettings {
    fn default() -> Self {
        InboundSettings {
            protocol: "socks".to_string(),
            listen: "127.0.0.1".to_string(),
            port: 2080,
            auth: "noauth".to_string(),
        }
    }
}

/// Routing and DNS inputs for generation. The default carries only the
/// built-in private-IP bypass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOptions {
    pub rules: RoutingRules,
    pub toggles: RoutingToggles,
    pub dns: Vec<DnsEntry>,
}

pub fn build(server: &ServerConfig, inbound: &InboundSettings, opts: &BuildOptions) -> Result<Value> {
    let outbounds = vec![proxy_outbound(server, "proxy")?, direct_outbound()];
    assemble(outbounds, inbound, opts)
}

/// Multi-hop assembly. Every non-terminal outbound gets a
/// `streamSettings.sockopt.dialerProxy` pointing at the next hop; the entry
/// hop keeps the `proxy` tag so routing stays unchanged.
pub fn build_chain(servers: &[ServerConfig], inbound: &InboundSettings, opts: &BuildOptions) -> Result<Value> {
    if servers.is_empty() {
        return Err(Error::validation("chain build needs at least one server"));
    }
    let mut outbounds = Vec::with_capacity(servers.len() + 1);
    for (index, server) in servers.iter().enumerate() {
        let tag = if index == 0 {
            "proxy".to_string()
        } else {
            format!("hop-{}", index + 1)
        };
        let mut outbound = proxy_outbound(server, &tag)?;
        if index + 1 < servers.len() {
            let next_tag = format!("hop-{}", index + 2);
            outbound["streamSettings"]["sockopt"] = json!({ "dialerProxy": next_tag });
        }
        outbounds.push(outbound);
    }
    outbounds.push(direct_outbound());
    assemble(outbounds, inbound, opts)
}

fn assemble(outbounds: Vec<Value>, inbound: &InboundSettings, opts: &BuildOptions) -> Result<Value> {
    let mut config = Map::new();
    config.insert("log".to_string(), json!({ "loglevel": "warning" }));
    config.insert(
        "inbounds".to_string(),
        json!([{
            "tag": "inbound",
            "listen": inbound.listen,
            "port": inbound.port,
            "protocol": inbound.protocol,
            "settings": { "auth": inbound.auth, "udp": true },
            "sniffing": { "enabled": true, "destOverride": ["http", "tls"] }
        }]),
    );
    let mut all_outbounds = outbounds;
    let routing = routing_block(opts, &mut all_outbounds);
    config.insert("outbounds".to_string(), Value::Array(all_outbounds));
    config.insert("routing".to_string(), routing);
    if !opts.dns.is_empty() {
        config.insert("dns".to_string(), dns_block(&opts.dns));
    }
    Ok(Value::Object(config))
}

fn direct_outbound() -> Value {
    json!({
        "tag": "direct",
        "protocol": "freedom",
        "settings": {}
    })
}

fn block_outbound() -> Value {
    json!({
        "tag": "block",
        "protocol": "blackhole",
        "settings": {}
    })
}

fn proxy_outbound(server: &ServerConfig, tag: &str) -> Result<Value> {
    let settings = match server.protocol.as_str() {
        "vless" => vless_settings(server),
        "vmess" => vmess_settings(server),
        "trojan" => trojan_settings(server),
        "shadowsocks" => shadowsocks_settings(server),
        other => return Err(Error::Unsupported(other.to_string())),
    };

    Ok(json!({
        "tag": tag,
        "protocol": server.protocol,
        "settings": settings,
        "streamSettings": stream_settings(server)
    }))
}

fn vless_settings(server: &ServerConfig) -> Value {
    json!({
        "vnext": [{
            "address": server.address,
            "port": server.port,
            "users": [{
                "id": server.uuid.clone().unwrap_or_default(),
                "encryption": server.encryption.clone().unwrap_or_else(|| "none".to_string()),
                "flow": server.flow.clone().unwrap_or_default()
            }]
        }]
    })
}

fn vmess_settings(server: &ServerConfig) -> Value {
    json!({
        "vnext": [{
            "address": server.address,
            "port": server.port,
            "users": [{
                "id": server.uuid.clone().unwrap_or_default(),
                "alterId": server.alter_id.unwrap_or(0),
                "security": server.security.clone().unwrap_or_else(|| "auto".to_string())
            }]
        }]
    })
}

fn trojan_settings(server: &ServerConfig) -> Value {
    json!({
        "servers": [{
            "address": server.address,
            "port": server.port,
            "password": server.password.clone().unwrap_or_default()
        }]
    })
}

fn shadowsocks_settings(server: &ServerConfig) -> Value {
    json!({
        "servers": [{
            "address": server.address,
            "port": server.port,
            "method": server.method.clone().unwrap_or_else(|| "aes-128-gcm".to_string()),
            "password": server.password.clone().unwrap_or_default()
        }]
    })
}

fn stream_settings(server: &ServerConfig) -> Value {
    let security = if server.tls == "tls" { "tls" } else { "none" };
    let mut stream = json!({
        "network": server.network,
        "security": security
    });

    if security == "tls" {
        stream["tlsSettings"] = json!({
            "serverName": server.sni.clone().unwrap_or_else(|| server.address.clone()),
            "allowInsecure": server.allow_insecure
        });
    }

    match server.network.as_str() {
        "ws" => {
            let mut ws = json!({
                "path": server.path.clone().unwrap_or_else(|| "/".to_string())
            });
            let mut headers = server.headers.clone();
            if let Some(host) = &server.host {
                headers
                    .entry("Host".to_string())
                    .or_insert_with(|| host.clone());
            }
            if !headers.is_empty() {
                ws["headers"] = json!(headers);
            }
            stream["wsSettings"] = ws;
        }
        "grpc" => {
            stream["grpcSettings"] = json!({
                "serviceName": server.service_name.clone().unwrap_or_default()
            });
        }
        "h2" => {
            stream["httpSettings"] = json!({
                "path": server.path.clone().unwrap_or_else(|| "/".to_string()),
                "host": server.host.clone().map(|h| vec![h]).unwrap_or_default()
            });
        }
        _ => {}
    }

    stream
}

fn routing_block(opts: &BuildOptions, outbounds: &mut Vec<Value>) -> Value {
    let mut rules = Vec::new();

    if opts.toggles.block_udp_443 {
        rules.push(json!({
            "type": "field",
            "network": "udp",
            "port": 443,
            "outboundTag": "block"
        }));
    }
    if opts.toggles.block_ads {
        rules.push(json!({
            "type": "field",
            "domain": ["geosite:category-ads-all"],
            "outboundTag": "block"
        }));
    }
    if !opts.rules.block.is_empty() {
        rules.push(json!({
            "type": "field",
            "domain": opts.rules.block,
            "outboundTag": "block"
        }));
    }
    if opts.toggles.direct_private_ips {
        rules.push(json!({
            "type": "field",
            "ip": ["geoip:private"],
            "outboundTag": "direct"
        }));
    }
    if opts.toggles.direct_local_domains {
        rules.push(json!({
            "type": "field",
            "domain": ["localhost", "domain:local"],
            "outboundTag": "direct"
        }));
    }
    if !opts.rules.direct.is_empty() {
        rules.push(json!({
            "type": "field",
            "domain": opts.rules.direct,
            "outboundTag": "direct"
        }));
    }
    if !opts.rules.proxy.is_empty() {
        rules.push(json!({
            "type": "field",
            "domain": opts.rules.proxy,
            "outboundTag": "proxy"
        }));
    }

    let needs_block = rules
        .iter()
        .any(|rule| rule.get("outboundTag").and_then(Value::as_str) == Some("block"));
    if needs_block {
        outbounds.push(block_outbound());
    }

    json!({
        "domainStrategy": "IPIfNonMatch",
        "rules": rules
    })
}

fn dns_block(entries: &[DnsEntry]) -> Value {
    let servers: Vec<Value> = entries
        .iter()
        .map(|entry| {
            if entry.domains.is_empty() {
                json!(entry.address)
            } else {
                json!({
                    "address": entry.address,
                    "domains": entry.domains
                })
            }
        })
        .collect();
    json!({ "servers": servers })
}
