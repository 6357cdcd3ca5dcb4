//! Key derivation (TR-03110 part 3, A.2.3)

use sha1::Sha1;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::SymmetricAlgorithm;

/// Counter for the encryption key
pub const KDF_ENC: u32 = 1;
/// Counter for the MAC key
pub const KDF_MAC: u32 = 2;
/// Counter for the password key
pub const KDF_PI: u32 = 3;

/// `H(secret || [nonce] || counter)` truncated to the key size of `algorithm`
///
/// SHA-1 derives 3DES and AES-128 keys, SHA-256 derives AES-192 and AES-256 keys.
pub fn derive_key(
    algorithm: SymmetricAlgorithm,
    secret: &[u8],
    nonce: Option<&[u8]>,
    counter: u32,
) -> Zeroizing<Vec<u8>> {
    let nonce = nonce.unwrap_or_default();
    let digest: Zeroizing<Vec<u8>> = match algorithm {
        SymmetricAlgorithm::TripleDes | SymmetricAlgorithm::Aes128 => Zeroizing::new(
            Sha1::new()
                .chain_update(secret)
                .chain_update(nonce)
                .chain_update(counter.to_be_bytes())
                .finalize()
                .to_vec(),
        ),
        SymmetricAlgorithm::Aes192 | SymmetricAlgorithm::Aes256 => Zeroizing::new(
            Sha256::new()
                .chain_update(secret)
                .chain_update(nonce)
                .chain_update(counter.to_be_bytes())
                .finalize()
                .to_vec(),
        ),
    };
    Zeroizing::new(digest[..algorithm.key_len()].to_vec())
}

/// Derive `K_pi` from a PACE password
pub fn derive_password_key(algorithm: SymmetricAlgorithm, password: &[u8]) -> Zeroizing<Vec<u8>> {
    derive_key(algorithm, password, None, KDF_PI)
}

/// Session keys of a secure messaging channel
#[derive(Clone)]
pub struct SessionKeys {
    /// Encryption key
    pub enc: Zeroizing<Vec<u8>>,
    /// MAC key
    pub mac: Zeroizing<Vec<u8>>,
}

impl SessionKeys {
    /// Derive both session keys from a shared secret and an optional nonce
    pub fn derive(algorithm: SymmetricAlgorithm, secret: &[u8], nonce: Option<&[u8]>) -> Self {
        Self {
            enc: derive_key(algorithm, secret, nonce, KDF_ENC),
            mac: derive_key(algorithm, secret, nonce, KDF_MAC),
        }
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // ICAO 9303-11 appendix G.2
    #[test]
    fn derive_aes_128_session_keys() {
        let secret = hex!(
            "
            6BABC7B3 A72BCD7E A385E4C6 2DB2625B
            D8613B24 149E146A 629311C4 CA6698E3
            8B834B6A 9E9CD718 4BA8834A FF5043D4
            36950C4C 1E783236 7C10CB8C 314D40E5
            990B0DF7 013E64B4 549E2270 923D06F0
            8CFF6BD3 E977DDE6 ABE4C31D 55C0FA2E
            465E553E 77BDF75E 3193D383 4FC26E8E
            B1EE2FA1 E4FC97C1 8C3F6CFF FE2607FD
            "
        );
        let keys = SessionKeys::derive(SymmetricAlgorithm::Aes128, &secret, None);
        assert_eq!(*keys.enc, hex!("2F7F46AD CC9E7E52 1B45D192 FAFA9126"));
        assert_eq!(*keys.mac, hex!("805A1D27 D45A5116 F73C5446 9462B7D8"));
    }

    // ICAO 9303-11 appendix G.1, K = SHA-1 of the MRZ information
    #[test]
    fn derive_password_key_from_mrz_seed() {
        let seed = hex!("7E2D2A41 C74EA0B3 8CD36F86 3939BFA8 E9032AAD");
        let key = derive_password_key(SymmetricAlgorithm::Aes128, &seed);
        assert_eq!(*key, hex!("89DED1B2 6624EC1E 634C1989 302849DD"));
    }

    #[test]
    fn key_sizes_follow_algorithm() {
        assert_eq!(derive_key(SymmetricAlgorithm::Aes192, b"secret", None, KDF_ENC).len(), 24);
        assert_eq!(derive_key(SymmetricAlgorithm::Aes256, b"secret", None, KDF_ENC).len(), 32);

        // the nonce is part of the hash input
        let plain = derive_key(SymmetricAlgorithm::Aes128, b"secret", None, KDF_MAC);
        let salted = derive_key(SymmetricAlgorithm::Aes128, b"secret", Some(&[1; 8]), KDF_MAC);
        assert_ne!(plain, salted);
    }
}
