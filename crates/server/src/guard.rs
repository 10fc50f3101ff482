//! Outbound fetch target validation (SSRF defense).
//!
//! Rivet makes the server fetch URLs on a client's behalf, which would
//! otherwise make it an open proxy into whatever network it sits on.
//! Before any outbound call — including every redirect hop — the target
//! port must be legal and every resolved address must be a public one.

use crate::fetch::FetchError;
use std::net::IpAddr;
use tokio::net::lookup_host;

/// Ports outbound requests may never use. The restricted-port list from
/// Chromium's net stack.
const ILLEGAL_PORTS: &[u16] = &[
    1,    // tcpmux
    7,    // echo
    9,    // discard
    11,   // systat
    13,   // daytime
    15,   // netstat
    17,   // qotd
    19,   // chargen
    20,   // ftp data
    21,   // ftp access
    22,   // ssh
    23,   // telnet
    25,   // smtp
    37,   // time
    42,   // name
    43,   // nicname
    53,   // domain
    77,   // priv-rjs
    79,   // finger
    87,   // ttylink
    95,   // supdup
    101,  // hostriame
    102,  // iso-tsap
    103,  // gppitnp
    104,  // acr-nema
    109,  // pop2
    110,  // pop3
    111,  // sunrpc
    113,  // auth
    115,  // sftp
    117,  // uucp-path
    119,  // nntp
    123,  // NTP
    135,  // loc-srv / epmap
    139,  // netbios
    143,  // imap2
    179,  // BGP
    389,  // ldap
    465,  // smtp+ssl
    512,  // print / exec
    513,  // login
    514,  // shell
    515,  // printer
    526,  // tempo
    530,  // courier
    531,  // chat
    532,  // netnews
    540,  // uucp
    556,  // remotefs
    563,  // nntp+ssl
    587,  // smtp submission
    601,  // syslog-conn
    636,  // ldap+ssl
    993,  // imap+ssl
    995,  // pop3+ssl
    2049, // nfs
    3659, // apple-sasl / PasswordServer
    4045, // lockd
    6000, // X11
    6665, // alternate IRC
    6666, // alternate IRC
    6667, // standard IRC
    6668, // alternate IRC
    6669, // alternate IRC
];

/// Validates outbound fetch targets.
pub struct FetchGuard {
    allow_private_networks: bool,
}

impl FetchGuard {
    pub fn new(allow_private_networks: bool) -> Self {
        Self {
            allow_private_networks,
        }
    }

    /// Check a URL before any request is issued to it. Resolves the host
    /// and rejects the call if the port is reserved or any resolved
    /// address is non-public.
    pub async fn check_url(&self, url: &reqwest::Url) -> Result<(), FetchError> {
        let port = url
            .port_or_known_default()
            .ok_or_else(|| FetchError::IllegalHost(format!("no port for scheme {}", url.scheme())))?;
        if ILLEGAL_PORTS.contains(&port) {
            return Err(FetchError::IllegalHost(format!("Illegal port {port}")));
        }

        if self.allow_private_networks {
            return Ok(());
        }

        let host = url
            .host_str()
            .ok_or_else(|| FetchError::IllegalHost("missing host".to_string()))?;

        // A literal address short-circuits resolution.
        if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            return check_addr(ip, host);
        }

        let addrs = lookup_host((host, port))
            .await
            .map_err(|_| FetchError::UpstreamConnect)?;
        for addr in addrs {
            check_addr(addr.ip(), host)?;
        }
        Ok(())
    }
}

fn check_addr(ip: IpAddr, host: &str) -> Result<(), FetchError> {
    if is_forbidden_addr(ip) {
        return Err(FetchError::IllegalHost(format!(
            "Illegal address {ip} ({host})"
        )));
    }
    Ok(())
}

/// Loopback, link-local, site-local/private, multicast and unspecified
/// addresses are all off limits.
fn is_forbidden_addr(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_multicast()
                || v4.is_link_local()
                || v4.is_private()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                // fe80::/10 link-local and fc00::/7 unique-local; the std
                // helpers for these are not stable, so match the prefixes.
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> reqwest::Url {
        reqwest::Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_reserved_port_rejected() {
        let guard = FetchGuard::new(false);
        let err = guard.check_url(&url("http://example.com:22/x")).await.unwrap_err();
        assert!(matches!(err, FetchError::IllegalHost(_)));
    }

    #[tokio::test]
    async fn test_reserved_port_rejected_even_when_private_allowed() {
        let guard = FetchGuard::new(true);
        let err = guard.check_url(&url("http://127.0.0.1:6667/x")).await.unwrap_err();
        assert!(matches!(err, FetchError::IllegalHost(_)));
    }

    #[tokio::test]
    async fn test_loopback_rejected() {
        let guard = FetchGuard::new(false);
        for target in [
            "http://127.0.0.1/x",
            "http://127.8.9.10:8080/x",
            "http://[::1]/x",
        ] {
            let err = guard.check_url(&url(target)).await.unwrap_err();
            assert!(matches!(err, FetchError::IllegalHost(_)), "{target}");
        }
    }

    #[tokio::test]
    async fn test_private_ranges_rejected() {
        let guard = FetchGuard::new(false);
        for target in [
            "http://10.0.0.1/x",
            "http://172.16.3.4/x",
            "http://192.168.1.1/x",
            "http://169.254.169.254/latest/meta-data",
            "http://[fe80::1]/x",
            "http://[fd00::2]/x",
            "http://0.0.0.0/x",
            "http://224.0.0.1/x",
        ] {
            let err = guard.check_url(&url(target)).await.unwrap_err();
            assert!(matches!(err, FetchError::IllegalHost(_)), "{target}");
        }
    }

    #[tokio::test]
    async fn test_private_allowed_in_dev_mode() {
        let guard = FetchGuard::new(true);
        guard.check_url(&url("http://127.0.0.1:8080/x")).await.unwrap();
    }

    #[test]
    fn test_forbidden_addr_classes() {
        assert!(is_forbidden_addr("127.0.0.1".parse().unwrap()));
        assert!(is_forbidden_addr("10.1.2.3".parse().unwrap()));
        assert!(is_forbidden_addr("fe80::1".parse().unwrap()));
        assert!(is_forbidden_addr("fc00::1".parse().unwrap()));
        assert!(!is_forbidden_addr("93.184.216.34".parse().unwrap()));
        assert!(!is_forbidden_addr("2606:2800:220:1::1".parse().unwrap()));
    }
}
