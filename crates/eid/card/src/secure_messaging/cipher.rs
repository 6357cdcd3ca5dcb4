use aes::{Aes128, Aes192, Aes256};
use cbc::{Decryptor, Encryptor};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use zeroize::Zeroizing;

use super::{SecureMessagingError, SymmetricAlgorithm};

/// AES block size, the IV size of every supported cipher
pub const BLOCK_LEN: usize = 16;

/// AES in CBC mode without padding
///
/// Callers pad their input to the block size.
#[derive(Clone)]
pub struct SymmetricCipher {
    algorithm: SymmetricAlgorithm,
    key: Zeroizing<Vec<u8>>,
}

fn encrypt_with<C>(key: &[u8], iv: &[u8], buffer: &mut [u8]) -> Result<(), SecureMessagingError>
where
    C: BlockEncryptMut + KeyIvInit,
{
    let len = buffer.len();
    C::new_from_slices(key, iv)
        .map_err(|_| SecureMessagingError::Malformed("initialisation vector length"))?
        .encrypt_padded_mut::<NoPadding>(buffer, len)
        .map_err(|_| SecureMessagingError::Malformed("input is not block aligned"))?;
    Ok(())
}

fn decrypt_with<C>(key: &[u8], iv: &[u8], buffer: &mut [u8]) -> Result<(), SecureMessagingError>
where
    C: BlockDecryptMut + KeyIvInit,
{
    C::new_from_slices(key, iv)
        .map_err(|_| SecureMessagingError::Malformed("initialisation vector length"))?
        .decrypt_padded_mut::<NoPadding>(buffer)
        .map_err(|_| SecureMessagingError::Decryption("input is not block aligned"))?;
    Ok(())
}

impl SymmetricCipher {
    /// Create a cipher, checking the key against the algorithm's key size
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

    /// The algorithm this cipher runs
    pub const fn algorithm(&self) -> SymmetricAlgorithm {
        self.algorithm
    }

    /// Encrypt block aligned data
    pub fn encrypt(&self, iv: &[u8], data: &[u8]) -> Result<Vec<u8>, SecureMessagingError> {
        let mut buffer = data.to_vec();
        match self.algorithm {
            SymmetricAlgorithm::Aes128 => encrypt_with::<Encryptor<Aes128>>(&self.key, iv, &mut buffer)?,
            SymmetricAlgorithm::Aes192 => encrypt_with::<Encryptor<Aes192>>(&self.key, iv, &mut buffer)?,
            SymmetricAlgorithm::Aes256 => encrypt_with::<Encryptor<Aes256>>(&self.key, iv, &mut buffer)?,
            SymmetricAlgorithm::TripleDes => {
                return Err(SecureMessagingError::UnsupportedAlgorithm("3DES secure messaging"));
            }
        }
        Ok(buffer)
    }

    /// Decrypt block aligned data
    pub fn decrypt(&self, iv: &[u8], data: &[u8]) -> Result<Vec<u8>, SecureMessagingError> {
        let mut buffer = data.to_vec();
        match self.algorithm {
            SymmetricAlgorithm::Aes128 => decrypt_with::<Decryptor<Aes128>>(&self.key, iv, &mut buffer)?,
            SymmetricAlgorithm::Aes192 => decrypt_with::<Decryptor<Aes192>>(&self.key, iv, &mut buffer)?,
            SymmetricAlgorithm::Aes256 => decrypt_with::<Decryptor<Aes256>>(&self.key, iv, &mut buffer)?,
            SymmetricAlgorithm::TripleDes => {
                return Err(SecureMessagingError::UnsupportedAlgorithm("3DES secure messaging"));
            }
        }
        Ok(buffer)
    }

    /// Encrypt a single block with a zero IV
    pub fn encrypt_block(&self, block: &[u8; BLOCK_LEN]) -> Result<[u8; BLOCK_LEN], SecureMessagingError> {
        let encrypted = self.encrypt(&[0; BLOCK_LEN], block)?;
        let mut output = [0; BLOCK_LEN];
        output.copy_from_slice(&encrypted);
        Ok(output)
    }
}

impl std::fmt::Debug for SymmetricCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricCipher")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Append ISO/IEC 9797-1 padding method 2 (`80 00 ..`)
pub fn pad(data: &[u8]) -> Vec<u8> {
    let padded_len = (data.len() / BLOCK_LEN + 1) * BLOCK_LEN;
    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(data);
    padded.push(0x80);
    padded.resize(padded_len, 0x00);
    padded
}

/// Remove ISO/IEC 9797-1 padding method 2
pub fn unpad(data: &[u8]) -> Result<&[u8], SecureMessagingError> {
    let end = data
        .iter()
        .rposition(|byte| *byte != 0x00)
        .ok_or(SecureMessagingError::Decryption("missing padding"))?;
    if data[end] != 0x80 || data.len() - end > BLOCK_LEN {
        return Err(SecureMessagingError::Decryption("invalid padding"));
    }
    Ok(&data[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn padding() {
        assert_eq!(pad(&[]), hex!("80000000000000000000000000000000"));
        assert_eq!(pad(&[0x01; 15]).len(), 16);
        assert_eq!(pad(&[0x01; 16]).len(), 32);
        assert_eq!(unpad(&pad(b"data")).unwrap(), b"data");

        assert!(unpad(&[0x00; 16]).is_err());
        assert!(unpad(&hex!("01020304050607080910111213141516")).is_err());
    }

    // FIPS 197 appendix C.1
    #[test]
    fn aes_128_block() {
        let cipher = SymmetricCipher::new(SymmetricAlgorithm::Aes128, &hex!("000102030405060708090a0b0c0d0e0f")).unwrap();
        let block = cipher.encrypt_block(&hex!("00112233445566778899aabbccddeeff")).unwrap();
        assert_eq!(block, hex!("69c4e0d86a7b0430d8cdb78070b4c55a"));
    }

    #[test]
    fn cbc_round_trip() {
        let cipher = SymmetricCipher::new(SymmetricAlgorithm::Aes256, &[0x42; 32]).unwrap();
        let iv = [0x24; 16];
        let plain = pad(b"secure messaging");
        let encrypted = cipher.encrypt(&iv, &plain).unwrap();
        assert_ne!(encrypted, plain);
        assert_eq!(cipher.decrypt(&iv, &encrypted).unwrap(), plain);

        assert!(cipher.encrypt(&iv, b"unaligned").is_err());
    }

    #[test]
    fn key_length_must_match() {
        assert_eq!(
            SymmetricCipher::new(SymmetricAlgorithm::Aes192, &[0; 16]).unwrap_err(),
            SecureMessagingError::InvalidKeyLength { expected: 24, actual: 16 }
        );
        assert!(SymmetricCipher::new(SymmetricAlgorithm::TripleDes, &[0; 16]).is_err());
    }
}
