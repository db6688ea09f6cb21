//! Host metadata reported with every connect notification.

use std::path::Path;

const ZERO_MAC: &str = "00:00:00:00:00:00";

/// This machine's hostname, or `"unknown"`.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// MAC address of the first non-loopback interface with a real address.
pub fn mac_address() -> String {
    mac_from_sysfs(Path::new("/sys/class/net")).unwrap_or_else(|| ZERO_MAC.to_string())
}

fn mac_from_sysfs(root: &Path) -> Option<String> {
    let mut interfaces: Vec<_> = std::fs::read_dir(root)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.file_name().is_some_and(|n| n != "lo"))
        .collect();
    interfaces.sort();

    interfaces.iter().find_map(|iface| {
        let raw = std::fs::read_to_string(iface.join("address")).ok()?;
        normalize_mac(&raw)
    })
}

/// Lower-case, colon-separated form of `raw`; `None` for all-zero or
/// malformed addresses.
fn normalize_mac(raw: &str) -> Option<String> {
    let mac = raw.trim().to_ascii_lowercase();
    let octets: Vec<&str> = mac.split(':').collect();
    let well_formed = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    (well_formed && mac != ZERO_MAC).then_some(mac)
}
