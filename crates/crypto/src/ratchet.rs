//! Key-Ratchet: Generation -> AEAD-Schluessel
//!
//! Die MLS-Sitzung liefert pro Epoche ein Geheimnis; daraus entsteht ein
//! Ratchet, der fuer jede Generation genau einen 16-Byte-Schluessel
//! ableitet. Alte Schluessel lassen sich aus neueren nicht
//! rekonstruieren (Forward Secrecy).

use std::collections::HashMap;

use hkdf::Hkdf;
use sha2::Sha256;

use sotto_protocol::frame::AES_GCM_128_KEY_BYTES;

use crate::cipher::EncryptionKey;
use crate::error::{CryptoError, CryptoResult};

/// Index in den Key-Ratchet; jede Generation hat genau einen Schluessel
pub type KeyGeneration = u32;

/// Faehigkeit, die die Pipeline von der Gruppensitzung konsumiert
pub trait KeyRatchet: Send {
    /// Liefert den Schluessel fuer `generation` (deterministisch; darf
    /// intern die Kette vorruecken).
    fn get_key(&mut self, generation: KeyGeneration) -> CryptoResult<EncryptionKey>;

    /// Verwirft den Schluessel fuer `generation` endgueltig (best effort).
    fn delete_key(&mut self, generation: KeyGeneration);
}

/// Label fuer den naechsten Kettenschluessel
const CHAIN_INFO: &[u8] = b"sotto/chain";

/// Label fuer den Medien-Schluessel einer Generation
const KEY_INFO: &[u8] = b"sotto/media-key";

/// Obergrenze fuer Sprunge nach vorn; grob gegen Amok-Generationen
/// (die eigentlichen Fenster sitzen im CipherManager).
const MAX_RATCHET_SKIP: u32 = 1 << 16;

/// HKDF-SHA256-Kettenratsche ab einem 32-Byte-Epoch-Secret
///
/// Pro Generation wird ein Medien-Schluessel abgeleitet und der
/// Kettenschluessel ueberschrieben. Abgeleitete Schluessel bleiben bis
/// `delete_key` im Cache, damit verspaetete Frames alter Generationen
/// noch entschluesselt werden koennen; Anfragen hinter einer geloeschten
/// Generation schlagen fehl.
pub struct ChainKeyRatchet {
    chain_key: [u8; 32],
    next_generation: KeyGeneration,
    keys: HashMap<KeyGeneration, EncryptionKey>,
}

impl ChainKeyRatchet {
    pub fn new(epoch_secret: &[u8; 32]) -> Self {
        Self {
            chain_key: *epoch_secret,
            next_generation: 0,
            keys: HashMap::new(),
        }
    }

    /// Rueckt die Kette eine Generation vor und legt den Schluessel in
    /// den Cache.
    fn advance(&mut self) {
        let mut media_key = [0u8; AES_GCM_128_KEY_BYTES];
        expand(&self.chain_key, KEY_INFO, &mut media_key);

        let mut next_chain = [0u8; 32];
        expand(&self.chain_key, CHAIN_INFO, &mut next_chain);

        // Alten Kettenschluessel ueberschreiben - Forward Secrecy
        self.chain_key = next_chain;

        self.keys
            .insert(self.next_generation, EncryptionKey::new(media_key));
        self.next_generation += 1;
    }
}

impl KeyRatchet for ChainKeyRatchet {
    fn get_key(&mut self, generation: KeyGeneration) -> CryptoResult<EncryptionKey> {
        if let Some(key) = self.keys.get(&generation) {
            return Ok(key.clone());
        }
        if generation < self.next_generation {
            return Err(CryptoError::RatchetVorbei { generation });
        }
        if generation - self.next_generation > MAX_RATCHET_SKIP {
            return Err(CryptoError::RatchetSprung {
                von: self.next_generation,
                nach: generation,
            });
        }

        while self.next_generation <= generation {
            self.advance();
        }
        self.keys
            .get(&generation)
            .cloned()
            .ok_or(CryptoError::KeinSchluessel { generation })
    }

    fn delete_key(&mut self, generation: KeyGeneration) {
        // Drop nullt das Schluesselmaterial
        self.keys.remove(&generation);
    }
}

impl Drop for ChainKeyRatchet {
    fn drop(&mut self) {
        self.chain_key.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for ChainKeyRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainKeyRatchet")
            .field("next_generation", &self.next_generation)
            .field("cached_keys", &self.keys.len())
            .finish()
    }
}

fn expand(chain_key: &[u8; 32], info: &[u8], out: &mut [u8]) {
    let hk = Hkdf::<Sha256>::new(None, chain_key);
    // Expand scheitert nur bei absurden Ausgabelaengen (> 255 * 32)
    hk.expand(info, out)
        .unwrap_or_else(|_| unreachable!("HKDF-Ausgabelaenge ist konstant klein"));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_secret() -> [u8; 32] {
        let mut secret = [0u8; 32];
        for (i, byte) in secret.iter_mut().enumerate() {
            *byte = i as u8;
        }
        secret
    }

    #[test]
    fn deterministisch_bei_gleichem_secret() {
        let mut a = ChainKeyRatchet::new(&test_secret());
        let mut b = ChainKeyRatchet::new(&test_secret());
        for generation in 0..10 {
            assert_eq!(
                a.get_key(generation).unwrap().as_bytes(),
                b.get_key(generation).unwrap().as_bytes()
            );
        }
    }

    #[test]
    fn generationen_haben_verschiedene_schluessel() {
        let mut ratchet = ChainKeyRatchet::new(&test_secret());
        let k0 = ratchet.get_key(0).unwrap();
        let k1 = ratchet.get_key(1).unwrap();
        let k2 = ratchet.get_key(2).unwrap();
        assert_ne!(k0.as_bytes(), k1.as_bytes());
        assert_ne!(k1.as_bytes(), k2.as_bytes());
        assert_ne!(k0.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn verschiedene_secrets_verschiedene_schluessel() {
        let mut secret_b = test_secret();
        secret_b[0] ^= 0xFF;
        let mut a = ChainKeyRatchet::new(&test_secret());
        let mut b = ChainKeyRatchet::new(&secret_b);
        assert_ne!(a.get_key(0).unwrap().as_bytes(), b.get_key(0).unwrap().as_bytes());
    }

    #[test]
    fn sprung_nach_vorn_entspricht_sequenz() {
        let mut sequentiell = ChainKeyRatchet::new(&test_secret());
        for generation in 0..=5 {
            sequentiell.get_key(generation).unwrap();
        }
        let mut springend = ChainKeyRatchet::new(&test_secret());
        assert_eq!(
            springend.get_key(5).unwrap().as_bytes(),
            sequentiell.get_key(5).unwrap().as_bytes()
        );
    }

    #[test]
    fn alte_generation_bleibt_im_cache() {
        let mut ratchet = ChainKeyRatchet::new(&test_secret());
        let k0 = ratchet.get_key(0).unwrap();
        ratchet.get_key(5).unwrap();
        // Generation 0 wurde nicht geloescht, also noch abrufbar
        assert_eq!(ratchet.get_key(0).unwrap().as_bytes(), k0.as_bytes());
    }

    #[test]
    fn geloeschte_generation_schlaegt_fehl() {
        let mut ratchet = ChainKeyRatchet::new(&test_secret());
        ratchet.get_key(3).unwrap();
        ratchet.delete_key(0);
        assert!(matches!(
            ratchet.get_key(0),
            Err(CryptoError::RatchetVorbei { generation: 0 })
        ));
        // Andere Generationen bleiben verfuegbar
        assert!(ratchet.get_key(1).is_ok());
    }

    #[test]
    fn zu_grosser_sprung_schlaegt_fehl() {
        let mut ratchet = ChainKeyRatchet::new(&test_secret());
        assert!(matches!(
            ratchet.get_key(MAX_RATCHET_SKIP + 10),
            Err(CryptoError::RatchetSprung { .. })
        ));
    }
}
