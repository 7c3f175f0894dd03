use crate::constants::credentials::{NONCE_LEN, SALT_LEN};
use crate::error::{BackupError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretBox, SecretString};
use sha2::Sha256;
use std::sync::Arc;

const TAG_LEN: usize = 16;

/// 由主密码派生的 AES-256-GCM 密钥
///
/// 密文格式: nonce (12 字节) || 密文+tag
///
/// 密钥放在 [`SecretBox`] 中，最后一个克隆释放时清零。
#[derive(Clone)]
pub struct SecretCipher {
    key: Arc<SecretBox<[u8; 32]>>,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCipher([REDACTED])")
    }
}

impl SecretCipher {
    /// PBKDF2-HMAC-SHA256 派生密钥
    pub fn derive(master: &SecretString, salt: &[u8], iterations: u32) -> Self {
        let key = SecretBox::init_with_mut(|key: &mut [u8; 32]| {
            pbkdf2_hmac::<Sha256>(master.expose_secret().as_bytes(), salt, iterations, key);
        });
        Self { key: Arc::new(key) }
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.key.expose_secret()).map_err(|e| BackupError::crypto(e.to_string()))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| BackupError::crypto("加密失败"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(BackupError::crypto("密文长度不足"));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| BackupError::crypto("解密失败，密钥错误或数据已损坏"))
    }

    pub fn encrypt_secret(&self, secret: &SecretString) -> Result<Vec<u8>> {
        self.encrypt(secret.expose_secret().as_bytes())
    }

    pub fn decrypt_secret(&self, blob: &[u8]) -> Result<SecretString> {
        let plaintext = self.decrypt(blob)?;
        let text = String::from_utf8(plaintext)
            .map_err(|_| BackupError::crypto("解密结果不是有效的 UTF-8"))?;
        Ok(SecretString::from(text))
    }
}

pub fn random_salt() -> [u8; SALT_LEN] {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let salt = random_salt();
        let cipher = SecretCipher::derive(&SecretString::from("master"), &salt, 1000);
        let blob = cipher.encrypt_secret(&SecretString::from("repo-pass")).unwrap();

        assert!(!blob.windows(9).any(|w| w == b"repo-pass"));
        let secret = cipher.decrypt_secret(&blob).unwrap();
        assert_eq!(secret.expose_secret(), "repo-pass");
    }

    #[test]
    fn test_wrong_key_or_tampering_fails() {
        let salt = random_salt();
        let cipher = SecretCipher::derive(&SecretString::from("master"), &salt, 1000);
        let other = SecretCipher::derive(&SecretString::from("other"), &salt, 1000);
        let mut blob = cipher.encrypt(b"data").unwrap();

        assert!(matches!(other.decrypt(&blob), Err(BackupError::Crypto(_))));
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(cipher.decrypt(&blob).is_err());
        assert!(cipher.decrypt(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_clone_shares_key_and_debug_is_redacted() {
        let cipher = SecretCipher::derive(&SecretString::from("master"), b"salt", 1000);
        let copy = cipher.clone();
        let blob = cipher.encrypt(b"data").unwrap();
        drop(cipher);
        assert_eq!(copy.decrypt(&blob).unwrap(), b"data");
        assert_eq!(format!("{copy:?}"), "SecretCipher([REDACTED])");
    }

    #[test]
    fn test_nonce_is_random() {
        let cipher = SecretCipher::derive(&SecretString::from("m"), b"salt", 1000);
        assert_ne!(cipher.encrypt(b"x").unwrap(), cipher.encrypt(b"x").unwrap());
    }
}
