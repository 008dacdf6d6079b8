use std::time::Duration;

use aes::Aes128;
use cbc::{
    cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit},
    Decryptor,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{DrmError, DrmResult};
use crate::metadata::MetadataHash;

/// Upper bound on how long a decrypt waits for license acquisition.
pub const MAX_LICENSE_ACQ_WAIT_TIME: Duration = Duration::from_millis(12_000);

/// Key material installed by the license back-end.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key: [u8; 16],
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes never reach logs.
        f.write_str("KeyMaterial(..)")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum KeyState {
    Pending,
    Ready(KeyMaterial),
    Failed(String),
    Aborted,
}

/// One license session, keyed by metadata digest.
///
/// Decrypts for the same session are serialized by an internal lock; distinct
/// sessions decrypt concurrently. A decrypt issued before the key arrives
/// waits on the key-state channel, bounded by the caller's timeout.
#[derive(Debug)]
pub struct DrmSession {
    hash: MetadataHash,
    state_tx: watch::Sender<KeyState>,
    decrypt_lock: Mutex<()>,
}

impl DrmSession {
    #[must_use]
    pub(crate) fn new(hash: MetadataHash) -> Self {
        let (state_tx, _) = watch::channel(KeyState::Pending);
        Self {
            hash,
            state_tx,
            decrypt_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn hash(&self) -> MetadataHash {
        self.hash
    }

    #[must_use]
    pub fn key_ready(&self) -> bool {
        matches!(*self.state_tx.borrow(), KeyState::Ready(_))
    }

    pub(crate) fn install_key(&self, key: KeyMaterial) {
        debug!(hash = %self.hash, "key material installed");
        let _ = self.state_tx.send(KeyState::Ready(key));
    }

    pub(crate) fn fail_key(&self, reason: String) {
        warn!(hash = %self.hash, reason = %reason, "license acquisition failed");
        let _ = self.state_tx.send(KeyState::Failed(reason));
    }

    /// Abort any in-flight key waits (shutdown, re-tune).
    pub fn cancel_key_wait(&self) {
        self.state_tx.send_modify(|state| {
            if matches!(state, KeyState::Pending) {
                *state = KeyState::Aborted;
            }
        });
    }

    /// Undo a `cancel_key_wait` so the session is usable again.
    pub fn restore_key_state(&self) {
        self.state_tx.send_modify(|state| {
            if matches!(state, KeyState::Aborted) {
                *state = KeyState::Pending;
            }
        });
    }

    async fn wait_for_key(&self, timeout: Duration) -> DrmResult<KeyMaterial> {
        let mut rx = self.state_tx.subscribe();
        let wait = async {
            loop {
                match rx.borrow_and_update().clone() {
                    KeyState::Ready(key) => return Ok(key),
                    KeyState::Failed(reason) => return Err(DrmError::LicenseFailed(reason)),
                    KeyState::Aborted => return Err(DrmError::Cancelled),
                    KeyState::Pending => {}
                }
                if rx.changed().await.is_err() {
                    return Err(DrmError::Cancelled);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| DrmError::KeyAcquisitionTimeout)?
    }

    /// Decrypt a whole AES-128-CBC segment in place, waiting up to `timeout`
    /// for the key. The buffer is truncated to the unpadded plaintext length.
    pub async fn decrypt(
        &self,
        buffer: &mut Vec<u8>,
        iv: &[u8; 16],
        timeout: Duration,
    ) -> DrmResult<()> {
        let key = self.wait_for_key(timeout).await?;
        let _guard = self.decrypt_lock.lock().await;

        if buffer.is_empty() {
            return Ok(());
        }
        if buffer.len() % 16 != 0 {
            return Err(DrmError::DecryptFailed(format!(
                "segment length {} not block-aligned",
                buffer.len()
            )));
        }

        let decryptor = Decryptor::<Aes128>::new((&key.key).into(), iv.into());
        let plaintext_len = decryptor
            .decrypt_padded_mut::<Pkcs7>(buffer.as_mut_slice())
            .map_err(|e| DrmError::DecryptFailed(format!("unpad failed: {e}")))?
            .len();
        buffer.truncate(plaintext_len);

        trace!(hash = %self.hash, bytes = plaintext_len, "segment decrypted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use aes::Aes128;
    use cbc::{
        cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit},
        Encryptor,
    };

    use super::*;

    fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let padded_len = plaintext.len() + (16 - plaintext.len() % 16);
        let mut buf = vec![0u8; padded_len];
        buf[..plaintext.len()].copy_from_slice(plaintext);
        Encryptor::<Aes128>::new(key.into(), iv.into())
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
            .expect("encrypt")
            .to_vec()
    }

    #[tokio::test]
    async fn decrypt_round_trip() {
        let key = [0x42u8; 16];
        let iv = [0x13u8; 16];
        let plaintext = b"an encrypted media fragment payload";

        let session = DrmSession::new(MetadataHash::of(b"meta"));
        session.install_key(KeyMaterial { key });

        let mut buffer = encrypt(plaintext, &key, &iv);
        session
            .decrypt(&mut buffer, &iv, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(buffer, plaintext);
    }

    #[tokio::test]
    async fn decrypt_times_out_without_key() {
        let session = DrmSession::new(MetadataHash::of(b"meta"));
        let mut buffer = vec![0u8; 16];
        let err = session
            .decrypt(&mut buffer, &[0u8; 16], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, DrmError::KeyAcquisitionTimeout));
    }

    #[tokio::test]
    async fn decrypt_waits_for_late_key() {
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let session = std::sync::Arc::new(DrmSession::new(MetadataHash::of(b"meta")));

        let installer = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            installer.install_key(KeyMaterial { key });
        });

        let mut buffer = encrypt(b"late key", &key, &iv);
        session
            .decrypt(&mut buffer, &iv, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(buffer, b"late key");
    }

    #[tokio::test]
    async fn cancel_aborts_and_restore_recovers() {
        let session = DrmSession::new(MetadataHash::of(b"meta"));
        session.cancel_key_wait();

        let mut buffer = vec![0u8; 16];
        let err = session
            .decrypt(&mut buffer, &[0u8; 16], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, DrmError::Cancelled));

        session.restore_key_state();
        session.install_key(KeyMaterial { key: [1u8; 16] });
        assert!(session.key_ready());
    }

    #[tokio::test]
    async fn unaligned_segment_rejected() {
        let session = DrmSession::new(MetadataHash::of(b"meta"));
        session.install_key(KeyMaterial { key: [1u8; 16] });
        let mut buffer = vec![0u8; 15];
        let err = session
            .decrypt(&mut buffer, &[0u8; 16], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, DrmError::DecryptFailed(_)));
    }
}
