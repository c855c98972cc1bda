//! # Peer Identities and Contacts
//!
//! - [`Keypair`]: Ed25519 signing keypair owned by the local node
//! - [`Identity`]: 32-byte public key serving as the PeerID
//! - [`Contact`]: an identity plus the socket addresses it can be reached on
//!
//! Identities live in the same 256-bit space as DHT keys, so the XOR metric
//! in [`Identity::xor_distance`] ranks both peers and topic keys.
//!
//! ## Invariants
//!
//! - `Identity::from_bytes(bytes).as_bytes() == bytes`
//! - XOR distance is symmetric and zero only for identical identities
//! - Two contacts are equal iff their identities are equal

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Identity) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Whether the bytes decode to an Ed25519 public key.
    ///
    /// All-zero and all-0xFF identities are rejected up front.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) || self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }

    /// Short hex prefix used in log fields.
    pub(crate) fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

/// Compare two XOR distances as big-endian 256-bit integers.
///
/// ```ignore
/// let da = a.xor_distance(&target);
/// let db = b.xor_distance(&target);
/// if distance_cmp(&da, &db) == Ordering::Less {
///     // a is closer to target than b
/// }
/// ```
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    for i in 0..32 {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; 32] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A peer identity together with the addresses it listens on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub identity: Identity,
    pub addrs: Vec<String>,
}

impl Contact {
    pub fn new(identity: Identity, addrs: Vec<String>) -> Self {
        Self { identity, addrs }
    }

    pub fn single(identity: Identity, addr: impl Into<String>) -> Self {
        Self::new(identity, vec![addr.into()])
    }

    /// First address in the list; dials go here.
    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(|s| s.as_str())
    }

    /// Append any addresses from `addrs` not already present, preserving order.
    ///
    /// Returns `true` if at least one address was added.
    pub fn merge_addrs<'a>(&mut self, addrs: impl IntoIterator<Item = &'a String>) -> bool {
        let mut added = false;
        for addr in addrs {
            if !self.addrs.contains(addr) {
                self.addrs.push(addr.clone());
                added = true;
            }
        }
        added
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn keypair_generation_yields_distinct_identities() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        assert_ne!(kp1.identity(), kp2.identity());
        assert!(kp1.identity().is_valid());
    }

    #[test]
    fn keypair_from_secret_is_deterministic() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&kp.secret_key_bytes());
        assert_eq!(kp.identity(), restored.identity());
    }

    #[test]
    fn xor_distance_is_symmetric() {
        let a = Identity::from_bytes([0xFF; 32]);
        let b = Identity::from_bytes([0x00; 32]);
        let c = Identity::from_bytes([0xFF; 32]);

        assert_eq!(a.xor_distance(&a), [0u8; 32]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&b), [0xFF; 32]);
        assert_eq!(a.xor_distance(&c), [0u8; 32]);
    }

    #[test]
    fn distance_cmp_orders_lexicographically() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        b[31] = 1;
        assert_eq!(distance_cmp(&a, &b), Ordering::Less);
        assert_eq!(distance_cmp(&b, &a), Ordering::Greater);
        assert_eq!(distance_cmp(&a, &a), Ordering::Equal);

        a[0] = 1;
        assert_eq!(distance_cmp(&a, &b), Ordering::Greater);
    }

    #[test]
    fn hex_roundtrip_and_length_check() {
        let id = Keypair::generate().identity();
        assert_eq!(Identity::from_hex(&id.to_hex()).unwrap(), id);
        assert!(Identity::from_hex("abcd").is_err());
        assert!(Identity::from_hex("zz").is_err());
    }

    #[test]
    fn trivially_invalid_identities_rejected() {
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
        assert!(!Identity::from_bytes([0xFF; 32]).is_valid());
    }

    #[test]
    fn debug_shows_prefix_display_shows_full_hex() {
        let id = Identity::from_bytes([0xAB; 32]);
        assert_eq!(format!("{:?}", id), "Identity(abababababababab)");
        assert_eq!(format!("{}", id).len(), 64);
    }

    #[test]
    fn contact_equality_uses_identity_only() {
        let id = Identity::from_bytes([7u8; 32]);
        let a = Contact::single(id, "127.0.0.1:1");
        let b = Contact::single(id, "127.0.0.1:2");
        assert_eq!(a, b);
    }

    #[test]
    fn merge_addrs_is_a_union() {
        let id = Identity::from_bytes([7u8; 32]);
        let mut contact = Contact::single(id, "127.0.0.1:1");
        let incoming = vec!["127.0.0.1:2".to_string(), "127.0.0.1:1".to_string()];

        assert!(contact.merge_addrs(&incoming));
        assert_eq!(contact.addrs, vec!["127.0.0.1:1", "127.0.0.1:2"]);
        assert!(!contact.merge_addrs(&incoming));
    }
}
