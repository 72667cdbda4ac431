//! Static key used by the tunnel server for packet authentication

use rand::RngCore;

use crate::models::SealedKey;

const KEY_BYTES: usize = 256;
const HEX_PER_LINE: usize = 32;

pub const STATIC_KEY_HEADER: &str = "-----BEGIN OpenVPN Static key V1-----";
pub const STATIC_KEY_FOOTER: &str = "-----END OpenVPN Static key V1-----";

/// Generate a 2048-bit static key in the tunnel server's "Static key V1" framing
pub fn generate_static_key() -> SealedKey {
    let mut bytes = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let encoded = hex::encode(bytes);

    let mut out = String::with_capacity(encoded.len() + 128);
    out.push_str(STATIC_KEY_HEADER);
    out.push('\n');
    for line in encoded.as_bytes().chunks(HEX_PER_LINE) {
        // hex output is ASCII
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str(STATIC_KEY_FOOTER);
    out.push('\n');

    SealedKey::new(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_key_framing() {
        let key = generate_static_key();
        let lines: Vec<&str> = key.expose().lines().collect();

        assert_eq!(lines.first(), Some(&STATIC_KEY_HEADER));
        assert_eq!(lines.last(), Some(&STATIC_KEY_FOOTER));
        assert_eq!(lines.len(), 16 + 2);
        for line in &lines[1..lines.len() - 1] {
            assert_eq!(line.len(), HEX_PER_LINE);
            assert!(line.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_static_keys_are_random() {
        assert_ne!(
            generate_static_key().expose(),
            generate_static_key().expose()
        );
    }
}
