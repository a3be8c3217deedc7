//! Pure validation over already-loaded data. No I/O happens here; callers
//! hand in resolvers for anything that lives in a repository.

use crate::error::{Error, Result};
use crate::model::{Profile, ProfileConfig};

/// Protocols that may appear inside a chain.
pub const CHAINABLE_PROTOCOLS: [&str; 4] = ["vless", "vmess", "trojan", "shadowsocks"];

/// Built-in outbounds that must never appear inside a chain.
pub const BLOCKED_PROTOCOLS: [&str; 4] = ["freedom", "blackhole", "dns", "loopback"];

/// Resolves a profile id for validation purposes. Implemented by the
/// profile repository; `None` means the id is dangling.
pub trait ProfileResolver {
    fn resolve_for_validation(&self, id: &str) -> Option<Profile>;
}

pub fn port(value: i64) -> Result<u16> {
    if !(1024..=65535).contains(&value) {
        return Err(Error::validation(format!(
            "port must be between 1024 and 65535, got {value}"
        )));
    }
    Ok(value as u16)
}

pub fn profile_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("profile name must not be empty"));
    }
    Ok(())
}

pub fn profile_config(config: &ProfileConfig) -> Result<()> {
    if config.outbounds.is_empty() {
        return Err(Error::validation("profile config has no outbounds"));
    }
    for outbound in &config.outbounds {
        if outbound.protocol.trim().is_empty() {
            return Err(Error::validation("outbound protocol must not be empty"));
        }
        if outbound.address.trim().is_empty() {
            return Err(Error::validation("outbound address must not be empty"));
        }
    }
    Ok(())
}

/// Validates the composition of a chain. Checks run in a fixed order and
/// short-circuit on the first violation, iterating items in array order:
/// size, duplicates, then per item: nested chain, unresolvable id, missing
/// outbound, blocked protocol, non-chainable protocol, and for the terminal
/// item a pre-existing forwarding directive.
pub fn chain_items<F>(items: &[String], is_chain: F, resolver: &dyn ProfileResolver) -> Result<()>
where
    F: Fn(&str) -> bool,
{
    if items.is_empty() {
        return Err(Error::validation("chain items must not be empty"));
    }
    if items.len() < 2 {
        return Err(Error::validation("a chain needs at least 2 items"));
    }
    for (index, id) in items.iter().enumerate() {
        if items[..index].contains(id) {
            return Err(Error::validation(format!("duplicate chain item: {id}")));
        }
    }

    let last = items.len() - 1;
    for (index, id) in items.iter().enumerate() {
        if is_chain(id) {
            return Err(Error::validation(format!(
                "chain item {id} is itself a chain"
            )));
        }
        let profile = resolver
            .resolve_for_validation(id)
            .ok_or_else(|| Error::validation(format!("chain item {id} does not resolve")))?;
        let outbound = profile.config.selected_outbound().ok_or_else(|| {
            Error::validation(format!("chain item {id} has no chainable outbound"))
        })?;
        let protocol = outbound.protocol.as_str();
        if BLOCKED_PROTOCOLS.contains(&protocol) {
            return Err(Error::validation(format!(
                "chain item {id} uses blocked protocol {protocol}"
            )));
        }
        if !CHAINABLE_PROTOCOLS.contains(&protocol) {
            return Err(Error::validation(format!(
                "chain item {id} uses non-chainable protocol {protocol}"
            )));
        }
        if index == last && outbound.dialer_proxy.is_some() {
            return Err(Error::validation(format!(
                "terminal chain item {id} already carries a forwarding directive"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProfileConfig, ServerConfig};
    use std::collections::HashMap;

    struct MapResolver(HashMap<String, Profile>);

    impl ProfileResolver for MapResolver {
        fn resolve_for_validation(&self, id: &str) -> Option<Profile> {
            self.0.get(id).cloned()
        }
    }

    fn profile(id: &str, protocol: &str) -> Profile {
        Profile {
            id: id.to_string(),
            name: id.to_string(),
            config: ProfileConfig {
                outbounds: vec![ServerConfig::new(protocol, "a.example.com", 443)],
                ..ProfileConfig::default()
            },
            created_at: 0,
        }
    }

    fn resolver(profiles: &[Profile]) -> MapResolver {
        MapResolver(
            profiles
                .iter()
                .map(|p| (p.id.clone(), p.clone()))
                .collect(),
        )
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn port_accepts_registered_range() {
        assert_eq!(port(1024).unwrap(), 1024);
        assert_eq!(port(65535).unwrap(), 65535);
        assert_eq!(port(8080).unwrap(), 8080);
    }

    #[test]
    fn port_rejects_out_of_range() {
        assert!(port(80).is_err());
        assert!(port(0).is_err());
        assert!(port(1023).is_err());
        assert!(port(70000).is_err());
        assert!(port(-1).is_err());
    }

    #[test]
    fn chain_rejects_short_chains() {
        let p = profile("p1", "vless");
        let r = resolver(&[p]);
        assert!(chain_items(&[], |_| false, &r).is_err());
        assert!(chain_items(&ids(&["p1"]), |_| false, &r).is_err());
    }

    #[test]
    fn chain_rejects_duplicates_regardless_of_protocols() {
        let r = resolver(&[profile("p1", "vless"), profile("p2", "vmess")]);
        let err = chain_items(&ids(&["p1", "p2", "p1"]), |_| false, &r).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn chain_rejects_nested_chain() {
        let r = resolver(&[profile("p1", "vless"), profile("p2", "vmess")]);
        let err = chain_items(&ids(&["p1", "c1"]), |id| id == "c1", &r).unwrap_err();
        assert!(err.to_string().contains("itself a chain"));
    }

    #[test]
    fn chain_rejects_dangling_reference() {
        let r = resolver(&[profile("p1", "vless")]);
        assert!(chain_items(&ids(&["p1", "missing"]), |_| false, &r).is_err());
    }

    #[test]
    fn chain_rejects_blocked_and_unknown_protocols() {
        let r = resolver(&[
            profile("p1", "vless"),
            profile("bh", "blackhole"),
            profile("wg", "wireguard"),
        ]);
        let err = chain_items(&ids(&["p1", "bh"]), |_| false, &r).unwrap_err();
        assert!(err.to_string().contains("blocked protocol"));
        let err = chain_items(&ids(&["p1", "wg"]), |_| false, &r).unwrap_err();
        assert!(err.to_string().contains("non-chainable"));
    }

    #[test]
    fn chain_rejects_terminal_forwarding_directive() {
        let mut tail = profile("p2", "trojan");
        tail.config.outbounds[0].password = Some("secret".to_string());
        tail.config.outbounds[0].dialer_proxy = Some("hop-3".to_string());
        let r = resolver(&[profile("p1", "vless"), tail]);
        let err = chain_items(&ids(&["p1", "p2"]), |_| false, &r).unwrap_err();
        assert!(err.to_string().contains("forwarding directive"));
    }

    #[test]
    fn chain_accepts_valid_two_hop() {
        let r = resolver(&[profile("p1", "vless"), profile("p2", "shadowsocks")]);
        assert!(chain_items(&ids(&["p1", "p2"]), |_| false, &r).is_ok());
    }
}
