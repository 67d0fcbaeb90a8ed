use base64::{Engine, engine::general_purpose::STANDARD};
use uuid::Uuid;

use crate::nautica::{
    accounts::{Account, AccountConfigs},
    proxylist::ProxyRecord,
};

/// Every generated link points at the bridge's TLS front on this port.
pub const PUBLIC_PORT: u16 = 443;

/// Tunnel path for a proxy, as understood by the upgrade router.
pub fn tunnel_path(proxy: &ProxyRecord) -> String {
    format!("/{}-{}", proxy.proxy_ip, proxy.proxy_port)
}

/// Regional indicator pair for a two-letter country code; a globe for anything else.
pub fn flag_emoji(country: &str) -> String {
    let chars: Vec<char> = country.chars().collect();
    if chars.len() != 2 {
        return "🌍".to_string();
    }
    chars
        .iter()
        .map(|c| {
            let up = c.to_ascii_uppercase() as u32;
            char::from_u32(127397 + up).unwrap_or('?')
        })
        .collect()
}

/// Percent-encodes everything except `A-Z a-z 0-9 - _ . ! ~ * ' ( )`, the way
/// browsers' `encodeURIComponent` does.
pub fn encode_uri_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Builds a multi-protocol account for `proxy` under a fresh UUID.
pub fn generate_account(proxy: &ProxyRecord, name: &str, domain: &str) -> Account {
    build_account(proxy, name, domain, Uuid::new_v4())
}

pub fn build_account(proxy: &ProxyRecord, name: &str, domain: &str, id: Uuid) -> Account {
    let flag = flag_emoji(&proxy.country);
    let path = encode_uri_component(&tunnel_path(proxy));
    let port = PUBLIC_PORT;

    let vless = format!(
        "vless://{id}@{domain}:{port}?encryption=none&type=ws&host={domain}&security=tls&sni={domain}&path={path}#{flag} VLESS WS TLS [{name}]"
    );
    let trojan = format!(
        "trojan://{id}@{domain}:{port}?security=tls&type=ws&host={domain}&path={path}#{flag} Trojan WS TLS [{name}]"
    );
    let userinfo = STANDARD.encode(format!("none:{id}"));
    let shadowsocks = format!(
        "ss://{userinfo}@{domain}:{port}?plugin=v2ray-plugin;tls;mux=0;mode=websocket;path={path};host={domain}#{flag} SS WS TLS [{name}]"
    );

    Account {
        id: id.to_string(),
        name: name.to_string(),
        proxy_name: format!("{}:{}", proxy.proxy_ip, proxy.proxy_port),
        proxy_country: proxy.country.clone(),
        proxy_org: proxy.org.clone(),
        kind: "multi".to_string(),
        subscription: vless.clone(),
        configs: AccountConfigs {
            vless,
            trojan,
            shadowsocks,
        },
    }
}
