//! Per-domain frame handlers: inbound dispatch targets and the outbound
//! command implementations that mirror them.

pub mod file;
pub mod game;
pub mod group;
pub mod messaging;
pub mod presence;

/// Eight hex chars of randomness — message, post, transfer, and game ids.
pub fn new_id() -> String {
    hex::encode(rand::random::<[u8; 4]>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_eight_hex_chars() {
        let id = new_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_are_distinct_enough() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
    }
}
