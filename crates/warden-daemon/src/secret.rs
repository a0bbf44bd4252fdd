//! Process-scoped signing secret
//!
//! Generated once on first start and persisted next to the operation log so
//! download paths stay valid across restarts.

use std::path::Path;

use warden_core::{Result, WardenError};

pub const SECRET_LEN: usize = 32;

/// Load the signing secret, generating and persisting it on first start.
pub fn load_or_generate_secret(path: &Path) -> Result<[u8; SECRET_LEN]> {
    if path.exists() {
        let bytes = std::fs::read(path)?;
        let secret: [u8; SECRET_LEN] = bytes.as_slice().try_into().map_err(|_| {
            WardenError::Corrupt(format!(
                "signing secret at {} has wrong length {}",
                path.display(),
                bytes.len()
            ))
        })?;
        return Ok(secret);
    }

    let secret: [u8; SECRET_LEN] = rand::random();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, secret)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(secret)
}
