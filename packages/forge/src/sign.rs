//! Detached artifact signing.
//!
//! The signing key is loaded and decrypted once at startup and immutable
//! afterwards. A missing key file disables signing entirely; callers must
//! refuse to surface unsigned artifacts to clients that expect signatures.

use std::io::Read;

use camino::Utf8Path;
use chrono::SubsecRound;
use color_eyre::{Result, eyre::Context};
use pgp::{
    ArmorOptions,
    composed::{Deserializable, SignedSecretKey, StandaloneSignature},
    crypto::hash::HashAlgorithm,
    packet::{SignatureConfig, SignatureType, Subpacket, SubpacketData},
    types::{PublicKeyTrait, SecretKeyTrait},
};
use tracing::{debug, instrument, warn};

/// Holds the decrypted signing key for the lifetime of the process.
pub struct Signer {
    key: SignedSecretKey,
    password: String,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("key", &self.key.key_id())
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Load the armored secret key and its password from disk.
    ///
    /// A missing key file is not an error: it returns `None` and the service
    /// runs with signing disabled. A missing password file is treated as an
    /// empty password, which matches unencrypted keys.
    #[instrument]
    pub fn load(key_path: &Utf8Path, password_path: &Utf8Path) -> Result<Option<Self>> {
        let armored = match std::fs::read_to_string(key_path) {
            Ok(armored) => armored,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(%key_path, "signing key not found; signing is disabled");
                return Ok(None);
            }
            Err(err) => return Err(err).context(format!("read signing key: {key_path}")),
        };
        let (key, _headers) =
            SignedSecretKey::from_string(&armored).context("parse signing key")?;

        let password = match std::fs::read_to_string(password_path) {
            Ok(password) => password.trim_end_matches(['\r', '\n']).to_string(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(%password_path, "no key password file; assuming unencrypted key");
                String::new()
            }
            Err(err) => return Err(err).context(format!("read key password: {password_path}")),
        };

        debug!(key = ?key.key_id(), "loaded signing key");
        Ok(Some(Self { key, password }))
    }

    /// Construct a signer from an already-parsed key.
    pub fn new(key: SignedSecretKey, password: impl Into<String>) -> Self {
        Self {
            key,
            password: password.into(),
        }
    }

    /// Produce a detached ASCII-armored signature over `data`.
    #[instrument(skip_all)]
    pub fn sign(&self, data: impl Read) -> Result<Vec<u8>> {
        let mut config = SignatureConfig::v4(
            SignatureType::Binary,
            self.key.algorithm(),
            HashAlgorithm::SHA2_256,
        );
        config.hashed_subpackets = vec![
            Subpacket::regular(SubpacketData::SignatureCreationTime(
                chrono::Utc::now().trunc_subsecs(0),
            )),
            Subpacket::regular(SubpacketData::Issuer(self.key.key_id())),
        ];

        let password = self.password.clone();
        let signature = config
            .sign(&self.key, move || password, data)
            .context("sign artifact")?;
        StandaloneSignature::new(signature)
            .to_armored_bytes(None.into())
            .context("armor signature")
    }
}

#[cfg(test)]
mod tests {
    use pgp::composed::{KeyType, SecretKeyParamsBuilder};

    use super::*;

    fn test_key() -> SignedSecretKey {
        let params = SecretKeyParamsBuilder::default()
            .key_type(KeyType::EdDSA)
            .can_sign(true)
            .primary_user_id(String::from("forge test <forge@example.com>"))
            .build()
            .expect("build key params");
        let key = params.generate().expect("generate key");
        key.sign(String::new).expect("self-sign key")
    }

    #[test]
    fn signatures_are_armored_and_verify() {
        let key = test_key();
        let signer = Signer::new(key, "");
        let data = b"archive bytes".as_slice();

        let armored = signer.sign(data).expect("sign data");
        let text = String::from_utf8(armored).expect("armored output is ascii");
        assert!(text.starts_with("-----BEGIN PGP SIGNATURE-----"), "{text}");
        assert!(text.trim_end().ends_with("-----END PGP SIGNATURE-----"), "{text}");

        let (signature, _) =
            StandaloneSignature::from_string(&text).expect("parse signature back");
        signature
            .verify(&signer.key, data)
            .expect("signature verifies against the signing key");
    }

    #[test]
    fn missing_key_file_disables_signing() {
        let dir = tempfile::TempDir::new().unwrap();
        let key_path =
            camino::Utf8PathBuf::from_path_buf(dir.path().join("missing.asc")).unwrap();
        let password_path =
            camino::Utf8PathBuf::from_path_buf(dir.path().join("missing.txt")).unwrap();
        let signer = Signer::load(&key_path, &password_path).expect("load tolerates absence");
        assert!(signer.is_none());
    }
}
