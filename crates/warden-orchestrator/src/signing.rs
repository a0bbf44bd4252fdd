//! Signed download paths
//!
//! Restore targets are fetched through an external archive streamer; the
//! core hands out paths of the form `{opIdHex}-{signatureHex}/{subpath}`
//! where the signature is an HMAC-SHA256 over the big-endian operation id
//! with a process-scoped secret. Verification recomputes and compares in
//! constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use warden_core::{Result, WardenError};

type HmacSha256 = Hmac<Sha256>;

pub struct DownloadSigner {
    secret: [u8; 32],
}

impl DownloadSigner {
    pub fn new(secret: [u8; 32]) -> Self {
        Self { secret }
    }

    /// Signed path segment for an operation id: `{opIdHex}-{sigHex}`.
    pub fn sign(&self, op_id: i64) -> String {
        format!("{:016x}-{}", op_id, hex::encode(self.mac(op_id)))
    }

    /// Full download path for a file inside the restore target.
    pub fn download_path(&self, op_id: i64, subpath: &str) -> String {
        format!("{}/{}", self.sign(op_id), subpath.trim_start_matches('/'))
    }

    /// Parse and verify a download path. Returns `(op_id, subpath)`.
    ///
    /// Malformed paths are `InvalidArgument`; a well-formed path with a bad
    /// signature is `Unauthorized`.
    pub fn verify_path(&self, path: &str) -> Result<(i64, String)> {
        let path = path.trim_start_matches('/');
        let (segment, subpath) = path
            .split_once('/')
            .ok_or_else(|| WardenError::InvalidArgument("missing file path".to_string()))?;
        let (id_hex, sig_hex) = segment
            .split_once('-')
            .ok_or_else(|| WardenError::InvalidArgument("missing signature".to_string()))?;

        let op_id = i64::from_str_radix(id_hex, 16)
            .map_err(|e| WardenError::InvalidArgument(format!("bad operation id: {}", e)))?;
        let signature = hex::decode(sig_hex)
            .map_err(|e| WardenError::InvalidArgument(format!("bad signature encoding: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| WardenError::InvalidArgument(e.to_string()))?;
        mac.update(&op_id.to_be_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| WardenError::Unauthorized("signature mismatch".to_string()))?;

        Ok((op_id, subpath.to_string()))
    }

    fn mac(&self, op_id: i64) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("hmac accepts any key length");
        mac.update(&op_id.to_be_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> DownloadSigner {
        DownloadSigner::new([7u8; 32])
    }

    #[test]
    fn test_sign_format() {
        let segment = signer().sign(7);
        let (id_hex, sig_hex) = segment.split_once('-').unwrap();
        assert_eq!(id_hex, "0000000000000007");
        assert_eq!(sig_hex.len(), 64);
    }

    #[test]
    fn test_round_trip_verifies() {
        let signer = signer();
        let path = signer.download_path(42, "docs/report.pdf");
        let (op_id, subpath) = signer.verify_path(&path).unwrap();
        assert_eq!(op_id, 42);
        assert_eq!(subpath, "docs/report.pdf");
    }

    #[test]
    fn test_tampered_signature_is_unauthorized() {
        let signer = signer();
        let path = signer.download_path(42, "file.txt");

        // Flip the low bit of the final signature nibble.
        let mut tampered = path.clone();
        let slash = tampered.find('/').unwrap();
        let last = tampered[..slash].chars().last().unwrap();
        let flipped = if last == '0' { '1' } else { '0' };
        tampered.replace_range(slash - 1..slash, &flipped.to_string());

        assert!(matches!(
            signer.verify_path(&tampered),
            Err(WardenError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_tampered_op_id_is_unauthorized() {
        let signer = signer();
        let path = signer.download_path(42, "file.txt");
        let tampered = path.replacen("000000000000002a", "000000000000002b", 1);
        assert!(matches!(
            signer.verify_path(&tampered),
            Err(WardenError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let path = signer().download_path(42, "file.txt");
        let other = DownloadSigner::new([8u8; 32]);
        assert!(matches!(
            other.verify_path(&path),
            Err(WardenError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_malformed_paths_are_invalid() {
        let signer = signer();
        assert!(matches!(
            signer.verify_path("no-slash-here"),
            Err(WardenError::InvalidArgument(_))
        ));
        assert!(matches!(
            signer.verify_path("deadbeef/file.txt"),
            Err(WardenError::InvalidArgument(_))
        ));
        assert!(matches!(
            signer.verify_path("zzzz-abcd/file.txt"),
            Err(WardenError::InvalidArgument(_))
        ));
    }
}
