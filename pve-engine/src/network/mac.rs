//! Hardware address generation.

use crate::config_parser::is_mac_address;

/// Generate a random MAC address in the KVM OUI (`52:54:00`).
pub fn generate_mac() -> String {
    let bytes: [u8; 3] = rand::random();
    format!(
        "52:54:00:{:02X}:{:02X}:{:02X}",
        bytes[0] & 0x3f,
        bytes[1],
        bytes[2]
    )
}

/// Canonical form used for comparisons: uppercase, `:` separated.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let mac = mac.trim();
    if !is_mac_address(mac) {
        return None;
    }
    Some(mac.replace('-', ":").to_ascii_uppercase())
}
