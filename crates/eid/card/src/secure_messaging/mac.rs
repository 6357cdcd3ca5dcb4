use aes::{Aes128, Aes192, Aes256};
use cmac::{Cmac, Mac};
use zeroize::Zeroizing;

use super::{SecureMessagingError, SymmetricAlgorithm};

/// Length of a truncated MAC
pub const MAC_LEN: usize = 8;

/// AES-CMAC truncated to eight bytes
#[derive(Clone)]
pub struct CipherMac {
    algorithm: SymmetricAlgorithm,
    key: Zeroizing<Vec<u8>>,
}

fn cmac<M: Mac + cmac::digest::KeyInit>(key: &[u8], message: &[u8]) -> Result<[u8; MAC_LEN], SecureMessagingError> {
    let mut mac = <M as Mac>::new_from_slice(key).map_err(|_| SecureMessagingError::InvalidKeyLength {
        expected: 0,
        actual: key.len(),
    })?;
    mac.update(message);
    let tag = mac.finalize().into_bytes();

    let mut truncated = [0; MAC_LEN];
    truncated.copy_from_slice(&tag[..MAC_LEN]);
    Ok(truncated)
}

impl CipherMac {
    /// Create a MAC, checking the key against the algorithm's key size
    pub fn new(algorithm: SymmetricAlgorithm, key: &[u8]) -> Result<Self, SecureMessagingError> {
        let algorithm = algorithm.ensure_supported()?;
        if key.len() != algorithm.key_len() {
            return Err(SecureMessagingError::InvalidKeyLength {
                expected: algorithm.key_len(),
                actual: key.len(),
            });
        }
        Ok(Self {
            algorithm,
            key: Zeroizing::new(key.to_vec()),
        })
    }

    /// MAC over `message`, which the caller has padded where the protocol requires it
    pub fn generate(&self, message: &[u8]) -> Result<[u8; MAC_LEN], SecureMessagingError> {
        match self.algorithm {
            SymmetricAlgorithm::Aes128 => cmac::<Cmac<Aes128>>(&self.key, message),
            SymmetricAlgorithm::Aes192 => cmac::<Cmac<Aes192>>(&self.key, message),
            SymmetricAlgorithm::Aes256 => cmac::<Cmac<Aes256>>(&self.key, message),
            SymmetricAlgorithm::TripleDes => Err(SecureMessagingError::UnsupportedAlgorithm("3DES secure messaging")),
        }
    }

    /// Whether `mac` is the MAC over `message`
    pub fn verify(&self, message: &[u8], mac: &[u8]) -> Result<bool, SecureMessagingError> {
        let expected = self.generate(message)?;
        // compare without short-circuiting
        let diff = expected
            .iter()
            .zip(mac)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        Ok(mac.len() == MAC_LEN && diff == 0)
    }
}

impl std::fmt::Debug for CipherMac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherMac")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    // NIST SP 800-38B, AES-128 example 2
    #[test]
    fn truncated_cmac() {
        let mac = CipherMac::new(SymmetricAlgorithm::Aes128, &hex!("2b7e151628aed2a6abf7158809cf4f3c")).unwrap();
        let tag = mac.generate(&hex!("6bc1bee22e409f96e93d7e117393172a")).unwrap();
        assert_eq!(tag, hex!("070a16b46b4d4144"));
        assert_eq!(tag.len(), MAC_LEN);

        assert!(mac.verify(&hex!("6bc1bee22e409f96e93d7e117393172a"), &tag).unwrap());
        assert!(!mac.verify(&hex!("6bc1bee22e409f96e93d7e117393172b"), &tag).unwrap());
        assert!(!mac.verify(&hex!("6bc1bee22e409f96e93d7e117393172a"), &tag[..4]).unwrap());
    }

    // NIST SP 800-38B, AES-256 example 1
    #[test]
    fn cmac_256_empty_message() {
        let key = hex!("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4");
        let mac = CipherMac::new(SymmetricAlgorithm::Aes256, &key).unwrap();
        assert_eq!(mac.generate(&[]).unwrap(), hex!("028962f61b7bf89e"));
    }

    #[test]
    fn key_length_must_match() {
        assert_eq!(
            CipherMac::new(SymmetricAlgorithm::Aes128, &[0; 32]).unwrap_err(),
            SecureMessagingError::InvalidKeyLength { expected: 16, actual: 32 }
        );
    }
}
