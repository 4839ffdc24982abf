//! HKDF key derivation

use anyhow::Result;
use hkdf::Hkdf;
use sha2::Sha256;

/// Derive key material from a master secret and a context string
pub fn derive_key(master: &[u8], context: &[u8], output_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(None, master);
    let mut output = vec![0u8; output_len];
    hk.expand(context, &mut output)
        .map_err(|_| anyhow::anyhow!("HKDF expansion failed (output too long)"))?;
    Ok(output)
}

/// Derive with an explicit salt, for session keys bound to handshake randoms
pub fn derive_key_salted(
    master: &[u8],
    salt: &[u8],
    context: &[u8],
    output_len: usize,
) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), master);
    let mut output = vec![0u8; output_len];
    hk.expand(context, &mut output)
        .map_err(|_| anyhow::anyhow!("HKDF expansion failed (output too long)"))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = derive_key(b"master", b"ctx", 32).unwrap();
        let b = derive_key(b"master", b"ctx", 32).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_context_separates() {
        let a = derive_key(b"master", b"ctx-a", 32).unwrap();
        let b = derive_key(b"master", b"ctx-b", 32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_salt_separates() {
        let a = derive_key_salted(b"master", b"salt-a", b"ctx", 32).unwrap();
        let b = derive_key_salted(b"master", b"salt-b", b"ctx", 32).unwrap();
        assert_ne!(a, b);
    }
}
