//! Size-bounded, self-describing credential records.
//!
//! A [`CredentialRecord`] keeps its wire form as its in-memory form: a fixed
//! little-endian header followed by the access key id, secret key and optional
//! session token bytes, in that order. Copying the record is a byte copy of
//! `size` bytes, and [`CredentialRecord::deserialize_in_place`] validates such
//! a copy without re-parsing any string content.
//!
//! Header layout (40 bytes):
//!
//! | offset | field |
//! |---|---|
//! | 0 | version (u32) |
//! | 4 | total size including header (u32) |
//! | 8 | access key id span (offset u32, len u32) |
//! | 16 | secret key span |
//! | 24 | session token span |
//! | 32 | expiration in 100 ns units (u64) |
//!
//! A span offset of zero marks an absent field. Present fields, even empty
//! ones, always start at or after the header.

use std::fmt;

use bytes::{Buf, BufMut};
use zeroize::Zeroizing;

use crate::error::{AuthError, AuthResult};
use crate::time::Timestamp;

/// Upper bound on a serialized credential record, header included.
pub const MAX_AUTH_LEN: usize = 10_000;
/// Newest record layout version this crate reads and writes.
pub const CREDENTIAL_RECORD_CURRENT_VERSION: u32 = 0;
/// Size of the fixed header, in bytes.
pub const CREDENTIAL_HEADER_LEN: usize = 40;

/// Longest access key id accepted from a credential endpoint.
pub const MAX_ACCESS_KEY_LEN: usize = 128;
/// Longest secret key accepted from a credential endpoint.
pub const MAX_SECRET_KEY_LEN: usize = 128;
/// Longest session token accepted from a credential endpoint.
pub const MAX_SESSION_TOKEN_LEN: usize = 2048;
/// Longest expiration string accepted from a credential endpoint.
pub const MAX_EXPIRATION_LEN: usize = 128;

/// Location of one string field inside the record block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldSpan {
    /// Byte offset from the start of the block; zero when absent.
    pub offset: u32,
    /// Length in bytes.
    pub len: u32,
}

impl FieldSpan {
    /// Span of a field that is not present.
    pub const ABSENT: FieldSpan = FieldSpan { offset: 0, len: 0 };

    /// Whether the field exists, even if empty.
    pub fn is_present(&self) -> bool {
        self.offset != 0
    }

    fn end(&self) -> usize {
        self.offset as usize + self.len as usize
    }
}

/// Fixed header at the start of every record block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialHeader {
    /// Layout version.
    pub version: u32,
    /// Total block size, header included.
    pub size: u32,
    /// Access key id location.
    pub access_key_id: FieldSpan,
    /// Secret key location.
    pub secret_key: FieldSpan,
    /// Session token location, [`FieldSpan::ABSENT`] when there is none.
    pub session_token: FieldSpan,
    /// Absolute expiration.
    pub expiration: Timestamp,
}

impl CredentialHeader {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.size);
        for span in [self.access_key_id, self.secret_key, self.session_token] {
            buf.put_u32_le(span.offset);
            buf.put_u32_le(span.len);
        }
        buf.put_u64_le(self.expiration.as_hundreds_of_nanos());
    }

    fn decode(mut buf: &[u8]) -> AuthResult<Self> {
        if buf.len() < CREDENTIAL_HEADER_LEN {
            return Err(AuthError::invalid_arg(format!(
                "credential block of {} bytes is shorter than its {} byte header",
                buf.len(),
                CREDENTIAL_HEADER_LEN
            )));
        }
        let version = buf.get_u32_le();
        let size = buf.get_u32_le();
        let mut spans = [FieldSpan::ABSENT; 3];
        for span in spans.iter_mut() {
            span.offset = buf.get_u32_le();
            span.len = buf.get_u32_le();
        }
        let expiration = Timestamp::from_hundreds_of_nanos(buf.get_u64_le());
        Ok(Self {
            version,
            size,
            access_key_id: spans[0],
            secret_key: spans[1],
            session_token: spans[2],
            expiration,
        })
    }

    /// Check that the header describes a well-formed block of at most
    /// `available` bytes.
    fn validate(&self, available: usize) -> AuthResult<()> {
        if self.version > CREDENTIAL_RECORD_CURRENT_VERSION {
            return Err(AuthError::invalid_arg(format!(
                "credential record version {} is newer than {}",
                self.version, CREDENTIAL_RECORD_CURRENT_VERSION
            )));
        }

        if !self.access_key_id.is_present() || !self.secret_key.is_present() {
            return Err(AuthError::invalid_arg(
                "access key id and secret key must be present",
            ));
        }

        if self.session_token.len != 0 && !self.session_token.is_present() {
            return Err(AuthError::invalid_arg(
                "session token has a length but no location",
            ));
        }

        let size = self.size as usize;
        if size > MAX_AUTH_LEN || size > available {
            return Err(AuthError::invalid_arg(format!(
                "declared size {} exceeds the {} bytes available",
                size,
                available.min(MAX_AUTH_LEN)
            )));
        }

        let declared = [
            self.access_key_id.len,
            self.secret_key.len,
            self.session_token.len,
        ];
        if declared.iter().any(|&len| len as usize > MAX_AUTH_LEN) {
            return Err(AuthError::invalid_arg(format!(
                "declared field length exceeds {MAX_AUTH_LEN} bytes"
            )));
        }

        let expected = Layout::compute(
            self.access_key_id.len as usize,
            self.secret_key.len as usize,
            self.session_token
                .is_present()
                .then_some(self.session_token.len as usize),
        )
        .ok_or_else(|| AuthError::invalid_arg("field lengths overflow the record layout"))?;
        if expected.access_key_id != self.access_key_id
            || expected.secret_key != self.secret_key
            || expected.session_token != self.session_token
            || expected.size != size
        {
            return Err(AuthError::invalid_arg(
                "field spans do not match the record layout",
            ));
        }

        Ok(())
    }
}

struct Layout {
    access_key_id: FieldSpan,
    secret_key: FieldSpan,
    session_token: FieldSpan,
    size: usize,
}

impl Layout {
    /// Lay the fields out back to back after the header. `None` when the
    /// offsets do not fit the 32-bit span encoding.
    fn compute(access_len: usize, secret_len: usize, session_len: Option<usize>) -> Option<Self> {
        let span = |offset: usize, len: usize| -> Option<FieldSpan> {
            Some(FieldSpan {
                offset: u32::try_from(offset).ok()?,
                len: u32::try_from(len).ok()?,
            })
        };
        let secret_offset = CREDENTIAL_HEADER_LEN.checked_add(access_len)?;
        let secret_end = secret_offset.checked_add(secret_len)?;
        let access_key_id = span(CREDENTIAL_HEADER_LEN, access_len)?;
        let secret_key = span(secret_offset, secret_len)?;
        let (session_token, size) = match session_len {
            Some(len) => (span(secret_end, len)?, secret_end.checked_add(len)?),
            None => (FieldSpan::ABSENT, secret_end),
        };
        u32::try_from(size).ok()?;
        Some(Self {
            access_key_id,
            secret_key,
            session_token,
            size,
        })
    }
}

fn field(blob: &[u8], span: FieldSpan) -> &[u8] {
    blob.get(span.offset as usize..span.end()).unwrap_or(&[])
}

/// Resolve the effective bytes of one input field.
///
/// A zero length means "up to the first NUL byte, or the whole slice". A
/// non-zero length is taken at face value and need not end on a NUL.
fn effective(value: &[u8], declared_len: u32) -> AuthResult<&[u8]> {
    if declared_len == 0 {
        let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
        return Ok(&value[..end]);
    }
    value.get(..declared_len as usize).ok_or_else(|| {
        AuthError::invalid_arg(format!(
            "declared length {} exceeds the {} bytes supplied",
            declared_len,
            value.len()
        ))
    })
}

/// Immutable credential: access key id, secret key, optional session token
/// and an absolute expiration.
#[derive(Clone)]
pub struct CredentialRecord {
    header: CredentialHeader,
    blob: Zeroizing<Vec<u8>>,
}

impl CredentialRecord {
    /// Validating factory.
    ///
    /// `access_key_id` and `secret_key` are mandatory (`InvalidArg` when
    /// absent); `session_token` may be absent entirely. Fails with
    /// `InvalidAuthLen` when the serialized block would exceed
    /// [`MAX_AUTH_LEN`].
    pub fn create(
        access_key_id: Option<&[u8]>,
        access_key_id_len: u32,
        secret_key: Option<&[u8]>,
        secret_key_len: u32,
        session_token: Option<&[u8]>,
        session_token_len: u32,
        expiration: Timestamp,
    ) -> AuthResult<Self> {
        let access_key_id = access_key_id
            .ok_or_else(|| AuthError::invalid_arg("access key id is required"))?;
        let secret_key =
            secret_key.ok_or_else(|| AuthError::invalid_arg("secret key is required"))?;

        let access_key_id = effective(access_key_id, access_key_id_len)?;
        let secret_key = effective(secret_key, secret_key_len)?;
        let session_token = session_token
            .map(|token| effective(token, session_token_len))
            .transpose()?;

        let total = CREDENTIAL_HEADER_LEN
            + access_key_id.len()
            + secret_key.len()
            + session_token.map_or(0, <[u8]>::len);
        if total > MAX_AUTH_LEN {
            return Err(AuthError::InvalidAuthLen {
                len: total,
                max: MAX_AUTH_LEN,
            });
        }

        let layout = Layout::compute(
            access_key_id.len(),
            secret_key.len(),
            session_token.map(<[u8]>::len),
        )
        .ok_or(AuthError::InvalidAuthLen {
            len: total,
            max: MAX_AUTH_LEN,
        })?;
        let header = CredentialHeader {
            version: CREDENTIAL_RECORD_CURRENT_VERSION,
            size: layout.size as u32,
            access_key_id: layout.access_key_id,
            secret_key: layout.secret_key,
            session_token: layout.session_token,
            expiration,
        };

        let mut blob = Zeroizing::new(Vec::with_capacity(layout.size));
        header.encode(&mut *blob);
        blob.put_slice(access_key_id);
        blob.put_slice(secret_key);
        if let Some(token) = session_token {
            blob.put_slice(token);
        }

        Ok(Self { header, blob })
    }

    /// Convenience constructor over string slices.
    pub fn new(
        access_key_id: &str,
        secret_key: &str,
        session_token: Option<&str>,
        expiration: Timestamp,
    ) -> AuthResult<Self> {
        Self::create(
            Some(access_key_id.as_bytes()),
            access_key_id.len() as u32,
            Some(secret_key.as_bytes()),
            secret_key.len() as u32,
            session_token.map(str::as_bytes),
            session_token.map_or(0, |t| t.len() as u32),
            expiration,
        )
    }

    /// The decoded header.
    pub fn header(&self) -> &CredentialHeader {
        &self.header
    }

    /// Access key id bytes.
    pub fn access_key_id(&self) -> &[u8] {
        field(&self.blob, self.header.access_key_id)
    }

    /// Secret key bytes.
    pub fn secret_key(&self) -> &[u8] {
        field(&self.blob, self.header.secret_key)
    }

    /// Session token bytes, `None` when absent.
    pub fn session_token(&self) -> Option<&[u8]> {
        self.header
            .session_token
            .is_present()
            .then(|| field(&self.blob, self.header.session_token))
    }

    /// Absolute expiration.
    pub fn expiration(&self) -> Timestamp {
        self.header.expiration
    }

    /// Total serialized size, header included.
    pub fn size(&self) -> usize {
        self.header.size as usize
    }

    /// The wire form of the record.
    pub fn as_bytes(&self) -> &[u8] {
        &self.blob
    }

    /// Verbatim copy of the record into `buf`. Returns the bytes written.
    pub fn serialize_into(&self, buf: &mut [u8]) -> AuthResult<usize> {
        let size = self.size();
        let available = buf.len();
        let dst = buf.get_mut(..size).ok_or_else(|| {
            AuthError::invalid_arg(format!(
                "buffer of {available} bytes cannot hold a {size} byte credential"
            ))
        })?;
        dst.copy_from_slice(&self.blob);
        Ok(size)
    }

    /// Validate a verbatim copy of a record and view it where it lies.
    ///
    /// An empty buffer fails with `NullArg`. A missing access key id or
    /// secret key, or a session token with a length but no location, fails
    /// with `InvalidArg`.
    pub fn deserialize_in_place(buf: &[u8]) -> AuthResult<CredentialView<'_>> {
        if buf.is_empty() {
            return Err(AuthError::NullArg);
        }
        let header = CredentialHeader::decode(buf)?;
        header.validate(buf.len())?;
        Ok(CredentialView {
            header,
            blob: &buf[..header.size as usize],
        })
    }

    /// Release the record held in `slot`. Releasing an empty slot is a no-op.
    pub fn free(slot: &mut Option<CredentialRecord>) {
        slot.take();
    }
}

impl PartialEq for CredentialRecord {
    fn eq(&self, other: &Self) -> bool {
        self.blob.as_slice() == other.blob.as_slice()
    }
}

impl Eq for CredentialRecord {}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field(
                "access_key_id",
                &String::from_utf8_lossy(self.access_key_id()),
            )
            .field("secret_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token().map(|_| "<redacted>"),
            )
            .field("expiration", &self.header.expiration)
            .field("size", &self.header.size)
            .finish()
    }
}

/// A validated record borrowed from a caller-owned buffer.
#[derive(Clone, Copy)]
pub struct CredentialView<'a> {
    header: CredentialHeader,
    blob: &'a [u8],
}

impl<'a> CredentialView<'a> {
    /// The decoded header.
    pub fn header(&self) -> &CredentialHeader {
        &self.header
    }

    /// Access key id bytes, borrowed from the buffer.
    pub fn access_key_id(&self) -> &'a [u8] {
        field(self.blob, self.header.access_key_id)
    }

    /// Secret key bytes, borrowed from the buffer.
    pub fn secret_key(&self) -> &'a [u8] {
        field(self.blob, self.header.secret_key)
    }

    /// Session token bytes, `None` when absent.
    pub fn session_token(&self) -> Option<&'a [u8]> {
        self.header
            .session_token
            .is_present()
            .then(|| field(self.blob, self.header.session_token))
    }

    /// Absolute expiration.
    pub fn expiration(&self) -> Timestamp {
        self.header.expiration
    }

    /// Owned copy of the viewed block.
    pub fn to_record(&self) -> CredentialRecord {
        CredentialRecord {
            header: self.header,
            blob: Zeroizing::new(self.blob.to_vec()),
        }
    }
}

impl fmt::Debug for CredentialView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialView")
            .field(
                "access_key_id",
                &String::from_utf8_lossy(self.access_key_id()),
            )
            .field("expiration", &self.header.expiration)
            .field("size", &self.header.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expiration() -> Timestamp {
        Timestamp::from_unix_secs(1_700_000_000)
    }

    fn sample() -> CredentialRecord {
        CredentialRecord::new("AKIDEXAMPLE", "wJalrXUtnFEMI", Some("token"), expiration())
            .unwrap()
    }

    #[test]
    fn test_create_and_read_fields() {
        let record = sample();
        assert_eq!(record.access_key_id(), b"AKIDEXAMPLE");
        assert_eq!(record.secret_key(), b"wJalrXUtnFEMI");
        assert_eq!(record.session_token(), Some(&b"token"[..]));
        assert_eq!(record.expiration(), expiration());
        assert_eq!(record.size(), CREDENTIAL_HEADER_LEN + 11 + 13 + 5);
        assert_eq!(record.as_bytes().len(), record.size());
    }

    #[test]
    fn test_zero_length_derives_from_content() {
        let record = CredentialRecord::create(
            Some(&b"access\0ignored"[..]),
            0,
            Some(&b"secret"[..]),
            0,
            None,
            0,
            expiration(),
        )
        .unwrap();
        assert_eq!(record.access_key_id(), b"access");
        assert_eq!(record.secret_key(), b"secret");
        assert!(record.session_token().is_none());
    }

    #[test]
    fn test_explicit_length_taken_at_face_value() {
        let record = CredentialRecord::create(
            Some(&b"access-key-long"[..]),
            6,
            Some(&b"secret\0with-nul"[..]),
            15,
            Some(&b"tok"[..]),
            2,
            expiration(),
        )
        .unwrap();
        assert_eq!(record.access_key_id(), b"access");
        assert_eq!(record.secret_key(), b"secret\0with-nul");
        assert_eq!(record.session_token(), Some(&b"to"[..]));
    }

    #[test]
    fn test_declared_length_past_input_rejected() {
        let err = CredentialRecord::create(Some(&b"abc"[..]), 10, Some(&b"s"[..]), 0, None, 0, expiration())
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidArg { .. }));
    }

    #[test]
    fn test_missing_mandatory_fields() {
        let err = CredentialRecord::create(None, 0, Some(&b"s"[..]), 0, None, 0, expiration())
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidArg { .. }));

        let err = CredentialRecord::create(Some(&b"a"[..]), 0, None, 0, None, 0, expiration())
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidArg { .. }));
    }

    #[test]
    fn test_empty_strings_accepted() {
        let record = CredentialRecord::new("", "", Some(""), expiration()).unwrap();
        assert!(record.access_key_id().is_empty());
        assert!(record.secret_key().is_empty());
        assert_eq!(record.session_token(), Some(&b""[..]));
        assert!(record.header().session_token.is_present());
    }

    #[test]
    fn test_length_bound() {
        let third = "x".repeat(MAX_AUTH_LEN / 3);
        let err = CredentialRecord::new(&third, &third, Some(&third), expiration()).unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidAuthLen {
                max: MAX_AUTH_LEN,
                ..
            }
        ));

        let fits = "x".repeat(MAX_AUTH_LEN - CREDENTIAL_HEADER_LEN - 2);
        let record = CredentialRecord::new(&fits, "s", Some("t"), expiration()).unwrap();
        assert_eq!(record.size(), MAX_AUTH_LEN);
    }

    #[test]
    fn test_serialize_into_and_view() {
        let record = sample();
        let mut buf = vec![0u8; MAX_AUTH_LEN];
        let written = record.serialize_into(&mut buf).unwrap();
        assert_eq!(written, record.size());

        let view = CredentialRecord::deserialize_in_place(&buf).unwrap();
        assert_eq!(view.access_key_id(), record.access_key_id());
        assert_eq!(view.secret_key(), record.secret_key());
        assert_eq!(view.session_token(), record.session_token());
        assert_eq!(view.expiration(), record.expiration());
        assert_eq!(view.to_record(), record);
    }

    #[test]
    fn test_serialize_into_short_buffer() {
        let record = sample();
        let mut buf = vec![0u8; record.size() - 1];
        assert!(matches!(
            record.serialize_into(&mut buf),
            Err(AuthError::InvalidArg { .. })
        ));
    }

    #[test]
    fn test_deserialize_empty_buffer_is_null_arg() {
        assert!(matches!(
            CredentialRecord::deserialize_in_place(&[]),
            Err(AuthError::NullArg)
        ));
    }

    fn patch_u32(buf: &mut [u8], at: usize, value: u32) {
        buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn test_deserialize_rejects_missing_mandatory_offsets() {
        let bytes = sample().as_bytes().to_vec();

        let mut no_access = bytes.clone();
        patch_u32(&mut no_access, 8, 0);
        assert!(matches!(
            CredentialRecord::deserialize_in_place(&no_access),
            Err(AuthError::InvalidArg { .. })
        ));

        let mut no_secret = bytes.clone();
        patch_u32(&mut no_secret, 16, 0);
        assert!(matches!(
            CredentialRecord::deserialize_in_place(&no_secret),
            Err(AuthError::InvalidArg { .. })
        ));

        let mut no_token = bytes;
        patch_u32(&mut no_token, 24, 0);
        assert!(matches!(
            CredentialRecord::deserialize_in_place(&no_token),
            Err(AuthError::InvalidArg { .. })
        ));
    }

    #[test]
    fn test_deserialize_rejects_truncated_and_inconsistent() {
        let bytes = sample().as_bytes().to_vec();
        assert!(CredentialRecord::deserialize_in_place(&bytes[..bytes.len() - 1]).is_err());
        assert!(CredentialRecord::deserialize_in_place(&bytes[..10]).is_err());

        let mut shifted = bytes;
        patch_u32(&mut shifted, 16, 41);
        assert!(matches!(
            CredentialRecord::deserialize_in_place(&shifted),
            Err(AuthError::InvalidArg { .. })
        ));
    }

    #[test]
    fn test_deserialize_rejects_wrapping_lengths() {
        // Access length chosen so the secret offset wraps to 1 in 32 bits.
        let mut forged = vec![0u8; 51];
        patch_u32(&mut forged, 4, 51);
        patch_u32(&mut forged, 8, CREDENTIAL_HEADER_LEN as u32);
        patch_u32(&mut forged, 12, 0u32.wrapping_sub(39));
        patch_u32(&mut forged, 16, 1);
        patch_u32(&mut forged, 20, 50);
        assert!(matches!(
            CredentialRecord::deserialize_in_place(&forged),
            Err(AuthError::InvalidArg { .. })
        ));
    }

    #[test]
    fn test_deserialize_rejects_oversized_declared_length() {
        let mut bytes = sample().as_bytes().to_vec();
        patch_u32(&mut bytes, 28, (MAX_AUTH_LEN + 1) as u32);
        assert!(matches!(
            CredentialRecord::deserialize_in_place(&bytes),
            Err(AuthError::InvalidArg { .. })
        ));
    }

    #[test]
    fn test_free_is_idempotent() {
        let mut slot = Some(sample());
        CredentialRecord::free(&mut slot);
        assert!(slot.is_none());
        CredentialRecord::free(&mut slot);
        assert!(slot.is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", sample());
        assert!(rendered.contains("AKIDEXAMPLE"));
        assert!(!rendered.contains("wJalrXUtnFEMI"));
        assert!(!rendered.contains("\"token\""));
    }
}
