//! Diffie-Hellman key exchange for calls.
//!
//! Both parties raise a generator to a private 2048-bit exponent, exchange the
//! results through the relay, and raise the peer's value to their own exponent
//! to get the shared auth key. The originator commits to `g_a` by sending its
//! SHA-256 hash before revealing the value itself.
//!
//! The padding of the auth key and the fingerprint derivation are bit-exact:
//! both peers must reproduce them identically or fingerprint checks fail.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the private exponent in bytes.
pub const RANDOM_POWER_SIZE: usize = 256;

/// Size of the derived auth key in bytes.
pub const AUTH_KEY_SIZE: usize = 256;

/// Size of the `g_a` commitment (SHA-256).
pub const G_A_HASH_SIZE: usize = 32;

const MAX_MOD_EXP_SIZE: usize = 256;

/// DH parameters, snapshotted once per call.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhConfig {
    pub version: i32,
    pub g: i32,
    /// Big-endian prime modulus.
    pub p: Vec<u8>,
}

impl std::fmt::Debug for DhConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhConfig")
            .field("version", &self.version)
            .field("g", &self.g)
            .field("p_len", &self.p.len())
            .finish()
    }
}

/// Private DH exponent. Generated once per call and never exposed.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RandomPower([u8; RANDOM_POWER_SIZE]);

impl RandomPower {
    /// Draw a fresh exponent from the OS RNG and xor in caller-supplied entropy.
    ///
    /// # Panics
    ///
    /// Panics if `seed` is not exactly [`RANDOM_POWER_SIZE`] bytes long.
    pub fn generate(seed: &[u8]) -> Self {
        use rand::RngCore;
        assert_eq!(
            seed.len(),
            RANDOM_POWER_SIZE,
            "random power seed must be {RANDOM_POWER_SIZE} bytes"
        );
        let mut power = [0u8; RANDOM_POWER_SIZE];
        rand::rng().fill_bytes(&mut power);
        for (byte, mix) in power.iter_mut().zip(seed) {
            *byte ^= mix;
        }
        Self(power)
    }

    /// Use an exact exponent. Meant for fixed test vectors.
    pub fn from_bytes(bytes: [u8; RANDOM_POWER_SIZE]) -> Self {
        Self(bytes)
    }

    fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }
}

impl std::fmt::Debug for RandomPower {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RandomPower(..)")
    }
}

/// Shared secret derived from the DH exchange, left-padded with zeros.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AuthKey([u8; AUTH_KEY_SIZE]);

impl AuthKey {
    /// Build the key from a raw mod-exp result.
    ///
    /// # Panics
    ///
    /// Panics if `computed` is longer than [`AUTH_KEY_SIZE`].
    pub fn from_computed(computed: &[u8]) -> Self {
        assert!(
            computed.len() <= AUTH_KEY_SIZE,
            "computed auth key is {} bytes, limit is {AUTH_KEY_SIZE}",
            computed.len()
        );
        let mut key = [0u8; AUTH_KEY_SIZE];
        key[AUTH_KEY_SIZE - computed.len()..].copy_from_slice(computed);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; AUTH_KEY_SIZE] {
        &self.0
    }

    pub fn fingerprint(&self) -> u64 {
        compute_fingerprint(self)
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey(fingerprint={:016x})", self.fingerprint())
    }
}

/// `base ^ power mod p`, big-endian.
///
/// Returns an empty vector when the result cannot be used: a zero result or
/// one wider than the largest expected modulus.
pub fn compute_mod_exp(config: &DhConfig, base: &BigUint, power: &RandomPower) -> Vec<u8> {
    let modulus = BigUint::from_bytes_be(&config.p);
    if modulus.bits() == 0 {
        return Vec::new();
    }
    let result = base.modpow(&power.to_biguint(), &modulus);
    if result.bits() == 0 {
        return Vec::new();
    }
    let bytes = result.to_bytes_be();
    if bytes.len() > MAX_MOD_EXP_SIZE {
        return Vec::new();
    }
    bytes
}

/// Our public value: `g ^ power mod p`.
pub fn compute_mod_exp_first(config: &DhConfig, power: &RandomPower) -> Vec<u8> {
    let Ok(g) = u32::try_from(config.g) else {
        return Vec::new();
    };
    compute_mod_exp(config, &BigUint::from(g), power)
}

/// The raw shared value: `peer ^ power mod p`.
pub fn compute_mod_exp_final(config: &DhConfig, peer: &[u8], power: &RandomPower) -> Vec<u8> {
    compute_mod_exp(config, &BigUint::from_bytes_be(peer), power)
}

/// Derive the auth key from the peer's public value.
///
/// Returns `None` if the mod-exp fails.
pub fn compute_shared_secret(
    config: &DhConfig,
    peer: &[u8],
    power: &RandomPower,
) -> Option<AuthKey> {
    let computed = compute_mod_exp_final(config, peer, power);
    if computed.is_empty() {
        return None;
    }
    Some(AuthKey::from_computed(&computed))
}

/// SHA-1 of the key, bytes 12..20 packed with byte 19 as the most significant.
pub fn compute_fingerprint(key: &AuthKey) -> u64 {
    let hash = Sha1::digest(key.as_bytes());
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&hash[12..20]);
    u64::from_le_bytes(tail)
}

/// Commitment sent by the originator before `g_a` is revealed.
pub fn compute_g_a_hash(g_a: &[u8]) -> [u8; G_A_HASH_SIZE] {
    Sha256::digest(g_a).into()
}

/// Range check for a peer's public value: `1 < value < p - 1`.
pub fn is_good_ga_gb(value: &[u8], config: &DhConfig) -> bool {
    let p = BigUint::from_bytes_be(&config.p);
    let one = BigUint::from(1u32);
    if p <= BigUint::from(2u32) {
        return false;
    }
    let value = BigUint::from_bytes_be(value);
    value > one && value < p - one
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 3526 group 14.
    const MODP_2048: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3BE39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF6955817183995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

    fn modp_config() -> DhConfig {
        DhConfig {
            version: 1,
            g: 2,
            p: hex::decode(MODP_2048).unwrap(),
        }
    }

    fn small_config() -> DhConfig {
        DhConfig {
            version: 1,
            g: 5,
            p: vec![23],
        }
    }

    fn small_power(value: u8) -> RandomPower {
        let mut bytes = [0u8; RANDOM_POWER_SIZE];
        bytes[RANDOM_POWER_SIZE - 1] = value;
        RandomPower::from_bytes(bytes)
    }

    #[test]
    fn test_shared_secret_agrees_on_both_sides() {
        let config = modp_config();
        let a = RandomPower::generate(&[0x5a; RANDOM_POWER_SIZE]);
        let b = RandomPower::generate(&[0xa5; RANDOM_POWER_SIZE]);

        let g_a = compute_mod_exp_first(&config, &a);
        let g_b = compute_mod_exp_first(&config, &b);
        assert!(!g_a.is_empty() && g_a.len() <= AUTH_KEY_SIZE);
        assert!(is_good_ga_gb(&g_a, &config));
        assert!(is_good_ga_gb(&g_b, &config));

        let key_a = compute_shared_secret(&config, &g_b, &a).unwrap();
        let key_b = compute_shared_secret(&config, &g_a, &b).unwrap();
        assert_eq!(key_a.as_bytes(), key_b.as_bytes());
        assert_eq!(key_a.fingerprint(), key_b.fingerprint());
    }

    #[test]
    fn test_small_group_vector_and_left_padding() {
        let config = small_config();
        let a = small_power(6);
        let b = small_power(15);

        assert_eq!(compute_mod_exp_first(&config, &a), vec![8]);
        assert_eq!(compute_mod_exp_first(&config, &b), vec![19]);

        let key = compute_shared_secret(&config, &[19], &a).unwrap();
        let mut expected = [0u8; AUTH_KEY_SIZE];
        expected[AUTH_KEY_SIZE - 1] = 2;
        assert_eq!(key.as_bytes(), &expected);
        assert_eq!(compute_shared_secret(&config, &[8], &b).unwrap(), key);
    }

    #[test]
    fn test_zero_result_is_a_failure() {
        let config = small_config();
        assert!(compute_mod_exp_final(&config, &[23], &small_power(3)).is_empty());
        assert!(compute_shared_secret(&config, &[0], &small_power(3)).is_none());
    }

    #[test]
    fn test_empty_modulus_is_a_failure() {
        let config = DhConfig {
            version: 0,
            g: 3,
            p: Vec::new(),
        };
        assert!(compute_mod_exp_first(&config, &small_power(2)).is_empty());
    }

    #[test]
    fn test_full_width_key_is_used_as_is() {
        let computed = [0xabu8; AUTH_KEY_SIZE];
        let key = AuthKey::from_computed(&computed);
        assert_eq!(key.as_bytes(), &computed);
    }

    #[test]
    #[should_panic(expected = "computed auth key")]
    fn test_oversized_key_is_a_contract_violation() {
        AuthKey::from_computed(&[1u8; AUTH_KEY_SIZE + 1]);
    }

    #[test]
    #[should_panic(expected = "random power seed")]
    fn test_short_seed_is_a_contract_violation() {
        RandomPower::generate(&[0u8; 16]);
    }

    #[test]
    fn test_seed_is_mixed_with_os_randomness() {
        let seed = [0u8; RANDOM_POWER_SIZE];
        let first = RandomPower::generate(&seed);
        let second = RandomPower::generate(&seed);
        assert_ne!(first.0, second.0);
    }

    #[test]
    fn test_fingerprint_vectors() {
        let zero = AuthKey::from_computed(&[]);
        assert_eq!(compute_fingerprint(&zero), 10491994428448377009);

        let counting: Vec<u8> = (0..=255u8).collect();
        let counting = AuthKey::from_computed(&counting);
        assert_eq!(compute_fingerprint(&counting), 14474384091129631026);

        let one = AuthKey::from_computed(&[1]);
        assert_eq!(compute_fingerprint(&one), 18214477864362137066);

        // Stable across calls.
        assert_eq!(compute_fingerprint(&one), compute_fingerprint(&one));
    }

    #[test]
    fn test_g_a_hash_is_sha256() {
        let hash = compute_g_a_hash(b"abc");
        assert_eq!(
            hex::encode(hash),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_dh_value_range() {
        let config = small_config();
        assert!(!is_good_ga_gb(&[], &config));
        assert!(!is_good_ga_gb(&[1], &config));
        assert!(is_good_ga_gb(&[2], &config));
        assert!(is_good_ga_gb(&[21], &config));
        assert!(!is_good_ga_gb(&[22], &config));
        assert!(!is_good_ga_gb(&[23], &config));
        assert!(!is_good_ga_gb(&[0xff, 0xff], &config));
    }
}
