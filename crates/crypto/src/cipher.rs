//! AES-128-GCM AEAD-Primitiv mit trunkiertem Tag
//!
//! Der Schluessel wird bei der Konstruktion an die Instanz gebunden;
//! zwischen den Aufrufen haelt der Cipher keinen Zustand. Auf dem Draht
//! stehen nur die ersten 8 Bytes des 16-Byte-GCM-Tags.
//!
//! Das aes-gcm-Crate verifiziert nur volle Tags. Deshalb laeuft der
//! Decrypt in zwei Schritten: die CTR-Schicht von GCM ist selbstinvers,
//! ein "Encrypt" ueber dem Ciphertext liefert also den Klartext; ein
//! zweiter Encrypt ueber dem Klartext liefert den vollen Tag, dessen
//! Praefix in konstanter Zeit gegen den Draht-Tag geprueft wird.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes128Gcm, Key, Nonce,
};
use subtle::ConstantTimeEq;

use sotto_protocol::frame::{
    AES_GCM_128_KEY_BYTES, AES_GCM_128_NONCE_BYTES, AES_GCM_128_TRUNCATED_TAG_BYTES,
};

use crate::error::{CryptoError, CryptoResult};

/// 16-Byte-AEAD-Schluessel; wird beim Drop genullt
#[derive(Clone)]
pub struct EncryptionKey([u8; AES_GCM_128_KEY_BYTES]);

impl EncryptionKey {
    pub fn new(bytes: [u8; AES_GCM_128_KEY_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; AES_GCM_128_KEY_BYTES] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::UngueltigeSchluesselLaenge {
                    erwartet: AES_GCM_128_KEY_BYTES,
                    erhalten: bytes.len(),
                })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; AES_GCM_128_KEY_BYTES] {
        &self.0
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED] {} bytes)", self.0.len())
    }
}

/// AES-128-GCM mit 12-Byte-Nonce und 8-Byte-Tag
pub struct AeadCipher {
    cipher: Aes128Gcm,
}

impl AeadCipher {
    /// Bindet den Schluessel an eine neue Cipher-Instanz
    pub fn new(key: &EncryptionKey) -> Self {
        let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key.as_bytes()));
        Self { cipher }
    }

    /// Verschluesselt `plaintext` nach `ciphertext` und schreibt den
    /// trunkierten Tag nach `tag_out`.
    ///
    /// `ciphertext` muss mindestens so gross wie `plaintext` sein; der
    /// Ciphertext hat exakt die Laenge des Klartexts.
    pub fn encrypt(
        &self,
        ciphertext: &mut [u8],
        plaintext: &[u8],
        nonce: &[u8; AES_GCM_128_NONCE_BYTES],
        additional_data: &[u8],
        tag_out: &mut [u8; AES_GCM_128_TRUNCATED_TAG_BYTES],
    ) -> CryptoResult<()> {
        if ciphertext.len() < plaintext.len() {
            return Err(CryptoError::PufferZuKlein {
                benoetigt: plaintext.len(),
                vorhanden: ciphertext.len(),
            });
        }

        let buffer = &mut ciphertext[..plaintext.len()];
        buffer.copy_from_slice(plaintext);

        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), additional_data, buffer)
            .map_err(|e| CryptoError::Verschluesselung(e.to_string()))?;
        tag_out.copy_from_slice(&tag.as_slice()[..AES_GCM_128_TRUNCATED_TAG_BYTES]);
        Ok(())
    }

    /// Entschluesselt `ciphertext` nach `plaintext` und verifiziert den
    /// trunkierten Tag samt AAD.
    pub fn decrypt(
        &self,
        plaintext: &mut [u8],
        ciphertext: &[u8],
        tag: &[u8; AES_GCM_128_TRUNCATED_TAG_BYTES],
        nonce: &[u8; AES_GCM_128_NONCE_BYTES],
        additional_data: &[u8],
    ) -> CryptoResult<()> {
        if plaintext.len() < ciphertext.len() {
            return Err(CryptoError::PufferZuKlein {
                benoetigt: ciphertext.len(),
                vorhanden: plaintext.len(),
            });
        }

        let buffer = &mut plaintext[..ciphertext.len()];
        buffer.copy_from_slice(ciphertext);

        // Schritt 1: Keystream anwenden - der Tag dieses Aufrufs gehoert
        // zum falschen Strom und wird verworfen
        self.cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), b"", buffer)
            .map_err(|e| CryptoError::Entschluesselung(e.to_string()))?;

        // Schritt 2: vollen Tag ueber dem echten Ciphertext nachrechnen
        let mut scratch = buffer.to_vec();
        let full_tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), additional_data, &mut scratch)
            .map_err(|e| CryptoError::Entschluesselung(e.to_string()))?;
        debug_assert_eq!(scratch.as_slice(), ciphertext);

        let tag_ok: bool = full_tag.as_slice()[..AES_GCM_128_TRUNCATED_TAG_BYTES]
            .ct_eq(tag)
            .into();
        if !tag_ok {
            // Unauthentifizierten Klartext nicht herausgeben
            buffer.fill(0);
            return Err(CryptoError::Entschluesselung(
                "Tag-Verifikation fehlgeschlagen".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadCipher(Aes128Gcm)")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
