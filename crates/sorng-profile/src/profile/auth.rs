//! Credential encoding and owner-only artifact files.

use crate::profile::keyexchange::{box_seal, box_secret, decode_box_key};
use crate::profile::device::rand_str;
use crate::profile::types::*;
use base64::{engine::general_purpose::STANDARD as B64, engine::general_purpose::STANDARD_NO_PAD as B64_RAW, Engine as _};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Password prefix for a box-sealed firewall token.
pub const FIREWALL_TOKEN_PREFIX: &str = "$f$";
/// Password prefix for box-sealed `token + timestamp + password`.
pub const BOX_AUTH_PREFIX: &str = "$x$";
/// Password prefix for RSA-OAEP sealed [`AuthData`].
pub const RSA_AUTH_PREFIX: &str = "<%=RSA_ENCRYPTED=%>";

/// Inputs for [`encode_credentials`].
#[derive(Debug, Clone, Default)]
pub struct CredentialInputs<'a> {
    pub username: &'a str,
    pub password: &'a str,
    /// Firewall token returned by the handshake, empty when none.
    pub firewall_token: &'a str,
    pub server_box_public_key: &'a str,
    pub server_public_key: &'a str,
    /// Current auth token from the token cache.
    pub auth_token: &'a str,
}

/// Username/password pair written to the auth file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Seal `plaintext` for the gateway with a fresh key whose public half
/// becomes the username. The nonce is derived from that public key.
fn box_credentials(prefix: &str, plaintext: &[u8], server_box_public_key: &str) -> Result<Credentials, ProfileError> {
    let server_key = decode_box_key(server_box_public_key)?;
    let secret = box_secret();
    let public = secret.public_key();

    let mut nonce = [0u8; 24];
    nonce.copy_from_slice(&Sha256::digest(public.as_bytes())[..24]);

    let ciphertext = box_seal(plaintext, &nonce, &server_key, &secret)?;
    Ok(Credentials {
        username: B64_RAW.encode(public.as_bytes()),
        password: format!("{}{}", prefix, B64_RAW.encode(ciphertext)),
    })
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey, ProfileError> {
    RsaPublicKey::from_pkcs1_pem(pem).or_else(|_| {
        RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| ProfileError::parse("Failed to parse public key").with_detail(e.to_string()))
    })
}

/// Encode credentials using the strongest scheme the inputs allow.
pub fn encode_credentials(inputs: &CredentialInputs<'_>) -> Result<Credentials, ProfileError> {
    if !inputs.firewall_token.is_empty() {
        return box_credentials(
            FIREWALL_TOKEN_PREFIX,
            inputs.firewall_token.as_bytes(),
            inputs.server_box_public_key,
        );
    }

    if !inputs.server_box_public_key.is_empty() {
        let data = format!("{}{}{}", inputs.auth_token, unix_now(), inputs.password);
        return box_credentials(BOX_AUTH_PREFIX, data.as_bytes(), inputs.server_box_public_key);
    }

    if !inputs.server_public_key.is_empty() {
        let key = parse_public_key(inputs.server_public_key)?;
        let data = AuthData {
            token: inputs.auth_token.to_string(),
            password: inputs.password.to_string(),
            nonce: rand_str(32),
            timestamp: unix_now(),
        };
        let json = serde_json::to_vec(&data)
            .map_err(|e| ProfileError::parse("Failed to encode auth data").with_detail(e.to_string()))?;
        let ciphertext = key
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha512>(), &json)
            .map_err(|e| ProfileError::write("Failed to encrypt auth data").with_detail(e.to_string()))?;
        return Ok(Credentials {
            username: inputs.username.to_string(),
            password: format!("{}{}", RSA_AUTH_PREFIX, B64.encode(ciphertext)),
        });
    }

    Ok(Credentials {
        username: inputs.username.to_string(),
        password: inputs.password.to_string(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Artifact files
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Replace `path` with `contents`, created with `mode` on Unix.
pub fn write_artifact(path: &Path, contents: &str, mode: u32) -> Result<PathBuf, ProfileError> {
    let _ = std::fs::remove_file(path);

    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = opts.open(path).map_err(|e| {
        ProfileError::write(format!("Failed to write {}", path.display())).with_detail(e.to_string())
    })?;
    file.write_all(contents.as_bytes()).map_err(|e| {
        ProfileError::write(format!("Failed to write {}", path.display())).with_detail(e.to_string())
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
    }

    Ok(path.to_path_buf())
}

/// Write `<id>.auth` with the username and password on separate lines.
pub fn write_auth_file(dir: &Path, id: &str, creds: &Credentials) -> Result<PathBuf, ProfileError> {
    let path = dir.join(format!("{}.auth", id));
    write_artifact(&path, &format!("{}\n{}\n", creds.username, creds.password), 0o600)
}
