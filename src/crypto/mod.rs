//! Sealing of stored root credentials.
//! The panel keeps server root passwords AES-256-GCM sealed at rest; the gateway
//! opens them only for the duration of one connect attempt.

use ring::aead;
use ring::rand::{SecureRandom, SystemRandom};

const NONCE_LEN: usize = 12;

/// Seal `plaintext` with AES-256-GCM. Output is `nonce || ciphertext || tag`.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
    let rng = SystemRandom::new();
    let sealing_key = less_safe_key(key)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| anyhow::anyhow!("RNG failed"))?;
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| anyhow::anyhow!("Sealing failed"))?;

    let mut sealed = nonce_bytes.to_vec();
    sealed.extend(in_out);
    Ok(sealed)
}

/// Open a value produced by [`seal`].
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
    if sealed.len() < NONCE_LEN + aead::AES_256_GCM.tag_len() {
        return Err(anyhow::anyhow!("Sealed value too short"));
    }

    let (nonce_bytes, encrypted) = sealed.split_at(NONCE_LEN);
    let nonce_bytes: [u8; NONCE_LEN] = nonce_bytes.try_into()?;
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);
    let opening_key = less_safe_key(key)?;

    let mut in_out = encrypted.to_vec();
    let plaintext = opening_key
        .open_in_place(nonce, aead::Aad::empty(), &mut in_out)
        .map_err(|_| anyhow::anyhow!("Credential could not be opened (wrong key?)"))?;
    Ok(plaintext.to_vec())
}

/// Hex form of [`seal`], as stored in configuration.
pub fn seal_hex(key: &[u8; 32], secret: &str) -> Result<String, anyhow::Error> {
    Ok(hex::encode(seal(key, secret.as_bytes())?))
}

/// Open a hex-encoded sealed secret into a UTF-8 string.
pub fn open_hex(key: &[u8; 32], sealed_hex: &str) -> Result<String, anyhow::Error> {
    let sealed = hex::decode(sealed_hex.trim())?;
    Ok(String::from_utf8(open(key, &sealed)?)?)
}

/// Parse a 64-character hex key.
pub fn parse_key(key_hex: &str) -> Result<[u8; 32], anyhow::Error> {
    let bytes = hex::decode(key_hex.trim())?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("Key must be 32 bytes, got {}", b.len()))
}

fn less_safe_key(key: &[u8; 32]) -> Result<aead::LessSafeKey, anyhow::Error> {
    let unbound_key = aead::UnboundKey::new(&aead::AES_256_GCM, key)
        .map_err(|_| anyhow::anyhow!("Invalid key"))?;
    Ok(aead::LessSafeKey::new(unbound_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_password() {
        let key = [0x42u8; 32];
        let sealed = seal_hex(&key, "root-pass-123").unwrap();
        assert!(!sealed.contains("root-pass"));
        assert_eq!(open_hex(&key, &sealed).unwrap(), "root-pass-123");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&[1u8; 32], b"secret").unwrap();
        assert!(open(&[2u8; 32], &sealed).is_err());
    }

    #[test]
    fn test_open_too_short() {
        let key = [0x42u8; 32];
        assert!(open(&key, b"short").is_err());
    }

    #[test]
    fn test_parse_key() {
        let key = parse_key(&"ab".repeat(32)).unwrap();
        assert_eq!(key, [0xabu8; 32]);
        assert!(parse_key("abcd").is_err());
        assert!(parse_key("zz").is_err());
    }
}
