use std::net::{IpAddr, SocketAddr};

use local_ip_address::list_afinet_netifas;
use str0m::net::Protocol;
use str0m::Candidate;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Host candidates for a socket bound to `local`.
///
/// A socket bound to a concrete address yields exactly that address. A socket
/// bound to the unspecified address is expanded over the interfaces reported by
/// `local-ip-address`, skipping loopback, link-local and IPv6 addresses, with
/// every candidate sharing the socket's port.
///
/// ## Returns
///
/// * `Vec<Candidate>`: UDP host candidates, in interface order. Empty if no
///   interface is usable or the interfaces cannot be listed; both cases are
///   logged at `warn` rather than treated as errors.
pub fn get_candidates(local: SocketAddr) -> Vec<Candidate> {
    let addrs: Vec<SocketAddr> = if local.ip().is_unspecified() {
        match list_afinet_netifas() {
            Ok(interfaces) => interfaces
                .into_iter()
                .filter_map(|(name, ip)| {
                    debug!("iface: {} / {:?}", name, ip);
                    match ip {
                        IpAddr::V4(ip4) if !ip4.is_loopback() && !ip4.is_link_local() => {
                            Some(SocketAddr::new(ip, local.port()))
                        }
                        _ => None,
                    }
                })
                .collect(),
            Err(e) => {
                warn!("Listing network interfaces failed: {}", e);
                vec![]
            }
        }
    } else {
        vec![local]
    };

    addrs
        .into_iter()
        .filter_map(|addr| match Candidate::host(addr, Protocol::Udp) {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                warn!("Skipping host candidate {}: {:?}", addr, e);
                None
            }
        })
        .collect()
}
