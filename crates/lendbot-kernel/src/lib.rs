//! I/O-free core of the lending bot: id arithmetic, card state, views,
//! action decoding and approval form handling.

use sha2::{Digest, Sha256};

pub mod action;
pub mod approval;
pub mod card;
pub mod codec;
pub mod gate;
pub mod ids;
pub mod useable;
pub mod view;

pub use action::{decode_action, ActionError, CardCommand, DecodedAction};
pub use codec::{CardState, CodecError, SelectedItem, Selection};
pub use gate::{GateDecision, RateConfig};
pub use ids::{CategoryId, IdTier, ItemId, ListId};
pub use useable::Useable;
pub use view::{RenderedView, Row, ViewKind};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn hash_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}_{short}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_lowercase_hex() {
        let hex = sha256_hex(b"lendbot");
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn hash_id_separates_parts() {
        assert_ne!(hash_id("x", &["ab", "c"]), hash_id("x", &["a", "bc"]));
    }
}
