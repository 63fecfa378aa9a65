//! Private key loading and public key authentication.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::{client, keys};
use tracing::debug;

use super::error::ExecError;

/// A parsed private key, ready for public key authentication.
///
/// Key material never leaves this type: `Debug` only shows the file path and
/// the key algorithm.
pub struct ClientCredential {
    path: PathBuf,
    key: Arc<keys::PrivateKey>,
}

impl ClientCredential {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Authenticate `username` on an established connection.
    ///
    /// Returns `Ok(false)` when the server rejects the key.
    pub async fn authenticate<H: client::Handler>(
        &self,
        handle: &mut client::Handle<H>,
        username: &str,
    ) -> Result<bool, String> {
        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;

        Ok(result.success())
    }
}

impl fmt::Debug for ClientCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredential")
            .field("path", &self.path)
            .field("algorithm", &self.key.algorithm().as_str())
            .finish_non_exhaustive()
    }
}

/// Read and parse the private key at `path`.
///
/// The file is read exactly once. Passphrase-protected keys are rejected as
/// [`ExecError::CredentialInvalid`].
pub async fn load_credential(path: &Path) -> Result<ClientCredential, ExecError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|source| ExecError::CredentialUnavailable {
            path: path.to_path_buf(),
            source,
        })?;

    let invalid = |reason: String| ExecError::CredentialInvalid {
        path: path.to_path_buf(),
        reason,
    };

    let pem = String::from_utf8(raw).map_err(|_| invalid("key file is not text".to_string()))?;

    let key = keys::decode_secret_key(&pem, None).map_err(|e| match e {
        keys::Error::KeyIsEncrypted => invalid("encrypted keys are not supported".to_string()),
        other => invalid(other.to_string()),
    })?;

    debug!("Loaded {} key from {}", key.algorithm().as_str(), path.display());

    Ok(ClientCredential {
        path: path.to_path_buf(),
        key: Arc::new(key),
    })
}
