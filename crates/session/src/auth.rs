//! Credential resolution for the NATS connection
//!
//! A session authenticates either with a credsfile, which the client library reads itself, or
//! with a user JWT and nkey seed held in separate files. In the second case the JWT is read up
//! front and the seed is re-read for every nonce the server asks us to sign.
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::config::{AuthMode, ConnectionConfig};
use crate::error::{Error, Result};

/// Whether nonce signing is compiled into this build.
///
/// Signing is provided by the `nkeys` feature, enabled by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigningSupport(bool);

impl SigningSupport {
    pub const fn detect() -> Self {
        SigningSupport(cfg!(feature = "nkeys"))
    }

    /// Signing support that is never available, regardless of build features
    pub const fn unavailable() -> Self {
        SigningSupport(false)
    }

    pub const fn is_available(&self) -> bool {
        self.0
    }
}

impl Default for SigningSupport {
    fn default() -> Self {
        Self::detect()
    }
}

/// Resolved credentials, ready to hand to the messaging client
#[derive(Clone, Debug)]
pub enum Credentials {
    /// Credsfile for the client library to read
    CredsFile(PathBuf),
    /// User JWT and the signer used to answer the server nonce
    Jwt { jwt: String, signer: NonceSigner },
}

/// Signs server nonces with the nkey seed stored at a path
#[derive(Clone, Debug)]
pub struct NonceSigner {
    seed_path: PathBuf,
}

impl NonceSigner {
    pub fn new(seed_path: impl Into<PathBuf>) -> Self {
        Self {
            seed_path: seed_path.into(),
        }
    }

    /// Read the seed, derive its key pair and sign `nonce`, returning the raw signature bytes.
    #[cfg(feature = "nkeys")]
    pub fn sign(&self, nonce: &[u8]) -> Result<Vec<u8>> {
        let key_pair = self.key_pair()?;
        key_pair.sign(nonce).map_err(|e| Error::Credentials {
            path: self.seed_path.clone(),
            reason: "failed to sign nonce".into(),
            source: Some(Box::new(e)),
        })
    }

    #[cfg(not(feature = "nkeys"))]
    pub fn sign(&self, _nonce: &[u8]) -> Result<Vec<u8>> {
        Err(missing_signing())
    }

    /// Public key of the seed, as the server sees it.
    #[cfg(feature = "nkeys")]
    pub fn public_key(&self) -> Result<String> {
        Ok(self.key_pair()?.public_key())
    }

    #[cfg(feature = "nkeys")]
    fn key_pair(&self) -> Result<nkeys::KeyPair> {
        let seed = std::fs::read_to_string(&self.seed_path)
            .map_err(|e| Error::credentials_io(&self.seed_path, e))?;
        nkeys::KeyPair::from_seed(seed.trim()).map_err(|e| Error::Credentials {
            path: self.seed_path.clone(),
            reason: "invalid nkey seed".into(),
            source: Some(Box::new(e)),
        })
    }
}

fn missing_signing() -> Error {
    Error::MissingDependency(
        "jwt/nkey authentication requires nkey signing support, rebuild with the `nkeys` feature",
    )
}

/// Read a file and trim surrounding whitespace, rejecting files that are empty once trimmed.
pub async fn read_trimmed(path: &Path) -> Result<String> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::credentials_io(path, e))?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Err(Error::credentials(path, "file is empty"));
    }
    Ok(trimmed.to_string())
}

/// Resolve the credentials selected by `config`.
///
/// Fails with [`Error::Config`] when no complete authentication mode is configured and with
/// [`Error::MissingDependency`] when a JWT/nkey pair is configured but signing is unavailable.
/// Both checks happen before any file is read. For a JWT/nkey pair the JWT is loaded and the
/// seed is checked so that bad credentials are reported here rather than as a failed connect.
#[instrument(level = "debug", skip_all)]
pub async fn resolve(config: &ConnectionConfig, signing: SigningSupport) -> Result<Credentials> {
    match config.auth_mode()? {
        AuthMode::CredsFile(path) => {
            debug!(creds = %path.display(), "using credsfile authentication");
            Ok(Credentials::CredsFile(path.to_path_buf()))
        }
        AuthMode::JwtNkey { jwt, nkey } => {
            if !signing.is_available() {
                return Err(missing_signing());
            }
            let signer = NonceSigner::new(nkey);
            // surface an unreadable or malformed seed now instead of during the handshake
            signer.sign(b"")?;
            let jwt = read_trimmed(jwt).await?;
            debug!(nkey = %nkey.display(), "using jwt/nkey authentication");
            Ok(Credentials::Jwt { jwt, signer })
        }
    }
}

#[cfg(all(test, feature = "nkeys"))]
mod test {
    use std::io::Write as _;

    use anyhow::Result;
    use nkeys::KeyPair;
    use tempfile::NamedTempFile;

    use super::*;

    fn write_temp(contents: &str) -> Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        file.write_all(contents.as_bytes())?;
        Ok(file)
    }

    fn jwt_config(jwt: &Path, nkey: &Path) -> ConnectionConfig {
        ConnectionConfig {
            jwt: Some(jwt.to_path_buf()),
            nkey: Some(nkey.to_path_buf()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resolves_jwt_and_signs_nonce() -> Result<()> {
        let kp = KeyPair::new_user();
        let seed = write_temp(&format!("  {}\n", kp.seed()?))?;
        let jwt = write_temp("\n eyJhbGciOi.payload.sig \n")?;

        let creds = resolve(&jwt_config(jwt.path(), seed.path()), SigningSupport::detect()).await?;
        let Credentials::Jwt { jwt, signer } = creds else {
            panic!("expected jwt credentials");
        };
        assert_eq!(jwt, "eyJhbGciOi.payload.sig");

        let nonce = b"server-nonce";
        let signature = signer.sign(nonce)?;
        kp.verify(nonce, &signature)?;
        assert_eq!(signer.public_key()?, kp.public_key());
        Ok(())
    }

    #[tokio::test]
    async fn signing_unavailable_is_missing_dependency() -> Result<()> {
        // paths do not exist: the dependency check must come before any read
        let cfg = jwt_config(Path::new("/nonexistent/user.jwt"), Path::new("/nonexistent/user.nk"));
        let err = resolve(&cfg, SigningSupport::unavailable())
            .await
            .expect_err("resolution should fail");
        assert!(matches!(err, Error::MissingDependency(_)));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_seed_is_credentials_error() -> Result<()> {
        let seed = write_temp("not-a-seed")?;
        let jwt = write_temp("jwt")?;
        let err = resolve(&jwt_config(jwt.path(), seed.path()), SigningSupport::detect())
            .await
            .expect_err("resolution should fail");
        assert!(matches!(err, Error::Credentials { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn empty_jwt_is_credentials_error() -> Result<()> {
        let kp = KeyPair::new_user();
        let seed = write_temp(&kp.seed()?)?;
        let jwt = write_temp("   \n")?;
        let err = resolve(&jwt_config(jwt.path(), seed.path()), SigningSupport::detect())
            .await
            .expect_err("resolution should fail");
        assert!(matches!(err, Error::Credentials { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn creds_file_is_passed_through() -> Result<()> {
        let cfg = ConnectionConfig {
            creds: Some(PathBuf::from("user.creds")),
            ..Default::default()
        };
        let creds = resolve(&cfg, SigningSupport::unavailable()).await?;
        assert!(matches!(creds, Credentials::CredsFile(p) if p == Path::new("user.creds")));
        Ok(())
    }
}
