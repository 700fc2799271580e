//! Credentials read from a local file.
//!
//! The file holds whitespace-separated tokens:
//!
//! ```text
//! CREDENTIALS <accessKeyId> [<expiration>] <secretKey> [<sessionToken>]
//! ```
//!
//! When a fourth token is present the third one is an IoT-format expiration.
//! The file is re-read whenever the cached credential is within
//! [`CREDENTIAL_FILE_READ_GRACE_PERIOD`] of expiring.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::credential::{
    CredentialRecord, MAX_ACCESS_KEY_LEN, MAX_AUTH_LEN, MAX_EXPIRATION_LEN, MAX_SECRET_KEY_LEN,
    MAX_SESSION_TOKEN_LEN,
};
use crate::error::{AuthError, AuthResult};
use crate::expiration::parse_iot_expiration;
use crate::provider::{
    AccessMode, AuthCapabilities, AuthCapability, AuthProvider, AuthToken, StreamingTokenSink,
    MAX_ENFORCED_TOKEN_EXPIRATION_DURATION,
};
use crate::time::{Clock, Timestamp};

/// First token of every credentials file.
pub const CREDENTIAL_FILE_MARKER: &str = "CREDENTIALS";
/// Re-read the file when the cached credential expires within this window.
pub const CREDENTIAL_FILE_READ_GRACE_PERIOD: Duration = Duration::from_secs(5);
/// Credentials files must be shorter than this, in bytes.
pub const MAX_CREDENTIAL_FILE_LEN: usize = MAX_AUTH_LEN;

fn bounded<'a>(token: &'a str, max: usize) -> AuthResult<&'a str> {
    if token.len() > max {
        return Err(AuthError::InvalidAuthLen {
            len: token.len(),
            max,
        });
    }
    Ok(token)
}

/// Parse the contents of a credentials file as of `now`.
pub fn parse_credentials_file(contents: &str, now: Timestamp) -> AuthResult<CredentialRecord> {
    if contents.len() >= MAX_CREDENTIAL_FILE_LEN {
        return Err(AuthError::invalid_arg(format!(
            "credentials file of {} bytes exceeds {}",
            contents.len(),
            MAX_CREDENTIAL_FILE_LEN
        )));
    }

    let tokens: Vec<&str> = contents.split_whitespace().take(5).collect();
    if tokens.first() != Some(&CREDENTIAL_FILE_MARKER) {
        return Err(AuthError::invalid_arg(
            "credentials file does not start with the CREDENTIALS marker",
        ));
    }

    let access_key_id = bounded(tokens.get(1).copied().unwrap_or(""), MAX_ACCESS_KEY_LEN)?;
    let (expiration, secret_key) = match tokens.get(3) {
        Some(secret) => {
            let expiration = bounded(tokens[2], MAX_EXPIRATION_LEN)?;
            (Some(expiration), *secret)
        }
        None => (None, tokens.get(2).copied().unwrap_or("")),
    };
    let secret_key = bounded(secret_key, MAX_SECRET_KEY_LEN)?;
    let session_token = bounded(tokens.get(4).copied().unwrap_or(""), MAX_SESSION_TOKEN_LEN)?;

    if access_key_id.is_empty() || secret_key.is_empty() {
        return Err(AuthError::InvalidAuthLen {
            len: 0,
            max: MAX_ACCESS_KEY_LEN.min(MAX_SECRET_KEY_LEN),
        });
    }

    let ceiling = now.saturating_add(MAX_ENFORCED_TOKEN_EXPIRATION_DURATION);
    let expiration = match expiration {
        Some(text) => parse_iot_expiration(text, now)?.min(ceiling),
        None => ceiling,
    };

    CredentialRecord::new(access_key_id, secret_key, Some(session_token), expiration)
}

/// Auth provider backed by a credentials file, re-read as expiry nears.
pub struct FileCredentialProvider {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    credential: Mutex<Option<CredentialRecord>>,
}

impl FileCredentialProvider {
    /// Open the provider, reading the credentials file immediately.
    pub fn new(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> AuthResult<Self> {
        let provider = Self {
            path: path.as_ref().to_path_buf(),
            clock,
            credential: Mutex::new(None),
        };
        let now = provider.clock.now();
        let record = provider.read(now)?;
        *provider.credential.lock() = Some(record);
        Ok(provider)
    }

    /// The credentials file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self, now: Timestamp) -> AuthResult<CredentialRecord> {
        let contents = std::fs::read_to_string(&self.path)?;
        debug!(path = %self.path.display(), len = contents.len(), "reading credentials file");
        parse_credentials_file(&contents, now)
    }

    /// The cached credential, re-read first if it is close to expiring.
    pub fn current(&self) -> AuthResult<CredentialRecord> {
        let now = self.clock.now();
        let mut slot = self.credential.lock();
        let stale = match slot.as_ref() {
            Some(record) => now.saturating_add(CREDENTIAL_FILE_READ_GRACE_PERIOD) > record.expiration(),
            None => return Err(AuthError::Released),
        };
        if stale {
            let record = self.read(now)?;
            info!(path = %self.path.display(), expiration = %record.expiration(), "refreshed file credentials");
            *slot = Some(record);
        }
        slot.clone().ok_or(AuthError::Released)
    }
}

#[async_trait]
impl AuthProvider for FileCredentialProvider {
    fn capabilities(&self) -> AuthCapabilities {
        AuthCapabilities::of(&[AuthCapability::StreamingToken, AuthCapability::SecurityToken])
    }

    async fn get_streaming_token(
        &self,
        stream_name: &str,
        _access_mode: AccessMode,
        sink: Arc<dyn StreamingTokenSink>,
    ) -> AuthResult<()> {
        let record = self.current()?;
        sink.streaming_token_result(
            stream_name,
            Ok(AuthToken::credentials(
                record.as_bytes().to_vec(),
                record.expiration(),
            )),
        );
        Ok(())
    }

    async fn get_security_token(&self) -> AuthResult<AuthToken> {
        let record = self.current()?;
        Ok(AuthToken::credentials(
            record.as_bytes().to_vec(),
            record.expiration(),
        ))
    }

    fn release(&self) {
        let mut slot = self.credential.lock();
        CredentialRecord::free(&mut slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const NOW_SECS: u64 = 1_548_972_059;

    fn now() -> Timestamp {
        Timestamp::from_unix_secs(NOW_SECS)
    }

    #[test]
    fn test_two_field_format() {
        let record = parse_credentials_file("CREDENTIALS AKID SECRET\n", now()).unwrap();
        assert_eq!(record.access_key_id(), b"AKID");
        assert_eq!(record.secret_key(), b"SECRET");
        assert_eq!(record.session_token(), Some(&b""[..]));
        assert_eq!(
            record.expiration(),
            now().saturating_add(MAX_ENFORCED_TOKEN_EXPIRATION_DURATION)
        );
    }

    #[test]
    fn test_full_format_with_expiration() {
        let record = parse_credentials_file(
            "CREDENTIALS AKID 2019-01-31T23:00:59Z SECRET TOKEN",
            now(),
        )
        .unwrap();
        assert_eq!(record.secret_key(), b"SECRET");
        assert_eq!(record.session_token(), Some(&b"TOKEN"[..]));
        // one hour away, clamped to forty minutes
        assert_eq!(
            record.expiration(),
            now().saturating_add(MAX_ENFORCED_TOKEN_EXPIRATION_DURATION)
        );

        let near = Timestamp::from_unix_secs(NOW_SECS + 3000);
        let record = parse_credentials_file(
            "CREDENTIALS AKID 2019-01-31T23:00:59Z SECRET TOKEN",
            near,
        )
        .unwrap();
        assert_eq!(record.expiration(), Timestamp::from_unix_secs(NOW_SECS + 3600));
    }

    #[test]
    fn test_bad_marker() {
        assert!(matches!(
            parse_credentials_file("CREDS AKID SECRET", now()),
            Err(AuthError::InvalidArg { .. })
        ));
    }

    #[test]
    fn test_missing_keys() {
        assert!(matches!(
            parse_credentials_file("CREDENTIALS AKID", now()),
            Err(AuthError::InvalidAuthLen { .. })
        ));
        assert!(matches!(
            parse_credentials_file("CREDENTIALS", now()),
            Err(AuthError::InvalidAuthLen { .. })
        ));
    }

    #[test]
    fn test_oversized_file_and_fields() {
        let huge = format!("CREDENTIALS AKID SECRET {}", "t".repeat(MAX_AUTH_LEN));
        assert!(matches!(
            parse_credentials_file(&huge, now()),
            Err(AuthError::InvalidArg { .. })
        ));

        let long_key = format!("CREDENTIALS {} SECRET", "a".repeat(MAX_ACCESS_KEY_LEN + 1));
        assert!(matches!(
            parse_credentials_file(&long_key, now()),
            Err(AuthError::InvalidAuthLen { .. })
        ));
    }

    #[test]
    fn test_expired_file_credentials_rejected() {
        let later = Timestamp::from_unix_secs(NOW_SECS + 7200);
        assert!(matches!(
            parse_credentials_file("CREDENTIALS AKID 2019-01-31T23:00:59Z SECRET TOKEN", later),
            Err(AuthError::IotExpirationOccursInPast { .. })
        ));
    }

    #[tokio::test]
    async fn test_provider_rereads_near_expiry() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "CREDENTIALS FIRST SECRET").unwrap();
        let clock = Arc::new(ManualClock::new(now()));
        let provider = FileCredentialProvider::new(file.path(), clock.clone()).unwrap();

        let token = provider.get_security_token().await.unwrap();
        let view = CredentialRecord::deserialize_in_place(&token.bytes).unwrap();
        assert_eq!(view.access_key_id(), b"FIRST");

        std::fs::write(file.path(), "CREDENTIALS SECOND SECRET").unwrap();

        clock.advance(Duration::from_secs(60));
        let token = provider.get_security_token().await.unwrap();
        let view = CredentialRecord::deserialize_in_place(&token.bytes).unwrap();
        assert_eq!(view.access_key_id(), b"FIRST");

        clock.advance(MAX_ENFORCED_TOKEN_EXPIRATION_DURATION);
        let token = provider.get_security_token().await.unwrap();
        let view = CredentialRecord::deserialize_in_place(&token.bytes).unwrap();
        assert_eq!(view.access_key_id(), b"SECOND");
    }

    #[test]
    fn test_missing_file() {
        let clock = Arc::new(ManualClock::new(now()));
        let result = FileCredentialProvider::new("/nonexistent/vidingest/credentials", clock);
        assert!(matches!(result, Err(AuthError::Io(_))));
    }
}
