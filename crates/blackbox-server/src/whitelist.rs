use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use blackbox_protocol::DiscoveryRequest;
use blackbox_timing::Duration;
use blackbox_utils::spawn_named;
use tracing::{debug, warn};

use crate::config::WhitelistEntryConfig;

/// One resolved whitelist line. Address and mask are always the same family;
/// IPv4 entries resolved over IPv6 carry the mask shifted into the mapped
/// range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedWhitelistEntry {
    pub addr: IpAddr,
    pub subnet_mask: IpAddr,
    pub application_name: String,
    pub allow: bool,
    pub delay: Duration,
}

pub type ResolvedWhitelist = Vec<ResolvedWhitelistEntry>;

fn mask_v4(bits: u32) -> Ipv4Addr {
    let raw = if bits == 0 {
        0
    } else if bits >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - bits)
    };
    Ipv4Addr::from(raw)
}

fn mask_v6(bits: u32) -> Ipv6Addr {
    let raw = if bits == 0 {
        0
    } else if bits >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - bits)
    };
    Ipv6Addr::from(raw)
}

fn is_v4_mapped(addr: Ipv6Addr) -> bool {
    matches!(addr.octets(), [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, ..])
}

/// Builds an entry for one resolved address, widening IPv4 masks that ended
/// up on a v4-mapped IPv6 address by the 96 mapped bits.
pub fn resolved_entry(
    addr: IpAddr,
    mask_bits: u32,
    application_name: &str,
    allow: bool,
    delay: Duration,
) -> ResolvedWhitelistEntry {
    let subnet_mask = match addr {
        IpAddr::V4(_) => IpAddr::V4(mask_v4(mask_bits)),
        IpAddr::V6(v6) => {
            let bits =
                if is_v4_mapped(v6) && mask_bits <= 32 { mask_bits + 96 } else { mask_bits };
            IpAddr::V6(mask_v6(bits))
        }
    };
    ResolvedWhitelistEntry {
        addr,
        subnet_mask,
        application_name: application_name.to_string(),
        allow,
        delay,
    }
}

fn masked_v4(addr: Ipv4Addr, mask: Ipv4Addr) -> u32 {
    u32::from(addr) & u32::from(mask)
}

fn masked_v6(addr: Ipv6Addr, mask: Ipv6Addr) -> u128 {
    u128::from(addr) & u128::from(mask)
}

/// First entry whose mask-normalized address equals the request's
/// mask-normalized source and whose application filter is empty or matches.
/// The request's embedded source ip (when nonzero) overrides the datagram's
/// origin, letting relays answer for devices behind them.
pub fn find_match<'a>(
    whitelist: &'a [ResolvedWhitelistEntry],
    from: SocketAddr,
    request: &DiscoveryRequest,
) -> Option<&'a ResolvedWhitelistEntry> {
    let application_name = if request.source_application_name.is_empty() {
        request.application_name.as_str()
    } else {
        request.source_application_name.as_str()
    };

    match from.ip() {
        IpAddr::V4(from_v4) => {
            let incoming = if request.source_ip == 0 {
                from_v4
            } else {
                Ipv4Addr::from(request.source_ip)
            };
            whitelist.iter().find(|entry| {
                let (IpAddr::V4(addr), IpAddr::V4(mask)) = (entry.addr, entry.subnet_mask) else {
                    return false;
                };
                masked_v4(incoming, mask) == masked_v4(addr, mask)
                    && (entry.application_name.is_empty()
                        || entry.application_name == application_name)
            })
        }
        IpAddr::V6(from_v6) => {
            let incoming = if request.source_ip == 0 {
                from_v6
            } else {
                Ipv4Addr::from(request.source_ip).to_ipv6_mapped()
            };
            whitelist.iter().find(|entry| {
                let (IpAddr::V6(addr), IpAddr::V6(mask)) = (entry.addr, entry.subnet_mask) else {
                    return false;
                };
                masked_v6(incoming, mask) == masked_v6(addr, mask)
                    && (entry.application_name.is_empty()
                        || entry.application_name == application_name)
            })
        }
    }
}

/// The published whitelist, shared between the resolver (writer) and the
/// discovery thread (reader). The swap happens under a short lock.
#[derive(Clone, Default)]
pub struct SharedWhitelist {
    inner: Arc<Mutex<ResolvedWhitelist>>,
}

impl SharedWhitelist {
    pub fn publish(&self, resolved: ResolvedWhitelist) {
        debug!(entries = resolved.len(), "whitelist published");
        for (i, entry) in resolved.iter().enumerate() {
            debug!(
                i,
                allow = entry.allow,
                addr = %entry.addr,
                mask = %entry.subnet_mask,
                application = %entry.application_name,
                "whitelist entry"
            );
        }
        *self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = resolved;
    }

    pub fn with<R>(&self, f: impl FnOnce(&ResolvedWhitelist) -> R) -> R {
        f(&self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
    }
}

fn local_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if ret != 0 {
        return None;
    }
    let len = buf.iter().position(|b| *b == 0)?;
    Some(String::from_utf8_lossy(&buf[..len]).into_owned())
}

fn parse_address_plus_mask(raw: &str) -> (String, u32) {
    match raw.split_once('/') {
        Some((host, mask)) => {
            let bits = mask.parse::<i64>().unwrap_or(128).clamp(0, 128) as u32;
            (host.to_string(), bits)
        }
        None => (raw.to_string(), 128),
    }
}

fn resolve_host(host: &str) -> Vec<IpAddr> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return vec![addr];
    }
    match (host, 0u16).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(err) => {
            warn!(?err, host, "whitelist lookup failed");
            Vec::new()
        }
    }
}

/// Resolves configured whitelist entries on a worker thread and publishes
/// the result. Results from a superseded resolve are discarded.
pub struct WhitelistResolver {
    shared: SharedWhitelist,
    generation: Arc<AtomicU64>,
}

impl WhitelistResolver {
    pub fn new(shared: SharedWhitelist) -> Self {
        Self { shared, generation: Arc::new(AtomicU64::new(0)) }
    }

    /// Kicks off resolution of `entries`; any in-flight older resolution
    /// loses the race and its result is dropped.
    pub fn push(&self, entries: Vec<WhitelistEntryConfig>) -> std::thread::JoinHandle<()> {
        let my_generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let generation = Arc::clone(&self.generation);
        let shared = self.shared.clone();
        spawn_named("whitelist-resolve", move || {
            let mut resolved: ResolvedWhitelist = Vec::new();
            for entry in &entries {
                let (host, mask_bits) = parse_address_plus_mask(&entry.address_plus_mask);
                let mut hosts = vec![host.clone()];
                if host == "localhost" {
                    // match the machine's own addresses too
                    if let Some(hostname) = local_hostname() {
                        hosts.push(hostname);
                    }
                }
                for host in &hosts {
                    debug!(host, "whitelist lookup");
                    for addr in resolve_host(host) {
                        let candidate = resolved_entry(
                            addr,
                            mask_bits,
                            &entry.application_name,
                            entry.allow,
                            entry.delay,
                        );
                        if !resolved.contains(&candidate) {
                            resolved.push(candidate);
                        }
                    }
                }
            }
            if generation.load(Ordering::Acquire) == my_generation {
                shared.publish(resolved);
            } else {
                warn!(
                    generation = my_generation,
                    "ignored whitelist in favor of a newer pending whitelist"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(app: &str) -> DiscoveryRequest {
        DiscoveryRequest { application_name: app.to_string(), ..DiscoveryRequest::default() }
    }

    fn from(ip: [u8; 4]) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::from(ip), 9999))
    }

    #[test]
    fn subnet_and_application_filters_apply() {
        let whitelist = vec![resolved_entry(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)),
            8,
            "foo",
            true,
            Duration::ZERO,
        )];

        let hit = find_match(&whitelist, from([10, 1, 2, 3]), &request("foo"));
        assert!(hit.is_some_and(|entry| entry.allow));
        assert!(find_match(&whitelist, from([11, 0, 0, 1]), &request("foo")).is_none());
        assert!(find_match(&whitelist, from([10, 1, 2, 3]), &request("bar")).is_none());
    }

    #[test]
    fn first_match_wins_including_deny() {
        let whitelist = vec![
            resolved_entry(
                IpAddr::V4(Ipv4Addr::new(192, 168, 0, 0)),
                16,
                "",
                false,
                Duration::ZERO,
            ),
            resolved_entry(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, "", true, Duration::ZERO),
        ];
        let denied = find_match(&whitelist, from([192, 168, 5, 1]), &request("demo")).unwrap();
        assert!(!denied.allow);
        let allowed = find_match(&whitelist, from([10, 1, 1, 1]), &request("demo")).unwrap();
        assert!(allowed.allow);
    }

    #[test]
    fn embedded_source_ip_overrides_datagram_origin() {
        let whitelist = vec![resolved_entry(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)),
            8,
            "",
            true,
            Duration::ZERO,
        )];
        let mut req = request("demo");
        req.source_ip = u32::from(Ipv4Addr::new(10, 9, 9, 9));
        // datagram comes from outside the subnet but claims a source inside
        assert!(find_match(&whitelist, from([172, 16, 0, 1]), &req).is_some());
    }

    #[test]
    fn source_application_name_is_preferred() {
        let whitelist = vec![resolved_entry(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)),
            8,
            "editor",
            true,
            Duration::ZERO,
        )];
        let mut req = request("game");
        req.source_application_name = "editor".to_string();
        assert!(find_match(&whitelist, from([10, 0, 0, 5]), &req).is_some());
    }

    #[test]
    fn v4_mapped_masks_shift_by_96_bits() {
        let mapped = Ipv4Addr::new(10, 0, 0, 0).to_ipv6_mapped();
        let entry = resolved_entry(IpAddr::V6(mapped), 8, "", true, Duration::ZERO);
        let IpAddr::V6(mask) = entry.subnet_mask else { panic!("expected a v6 mask") };
        assert_eq!(u128::from(mask).leading_ones(), 104);

        let whitelist = vec![entry];
        let inside = SocketAddr::from((Ipv4Addr::new(10, 4, 4, 4).to_ipv6_mapped(), 9999));
        assert!(find_match(&whitelist, inside, &request("demo")).is_some());
        let outside = SocketAddr::from((Ipv4Addr::new(11, 0, 0, 1).to_ipv6_mapped(), 9999));
        assert!(find_match(&whitelist, outside, &request("demo")).is_none());
    }

    #[test]
    fn resolver_publishes_literals_without_dns() {
        let shared = SharedWhitelist::default();
        let resolver = WhitelistResolver::new(shared.clone());
        let handle = resolver.push(vec![
            crate::config::WhitelistEntryConfig::allow("127.0.0.1/8"),
            crate::config::WhitelistEntryConfig::deny("10.0.0.0/8"),
        ]);
        handle.join().unwrap();
        shared.with(|whitelist| {
            assert_eq!(whitelist.len(), 2);
            assert!(whitelist[0].allow);
            assert_eq!(whitelist[0].addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
            assert!(!whitelist[1].allow);
        });
    }
}
