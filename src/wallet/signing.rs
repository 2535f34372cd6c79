use anyhow::{anyhow, Result};
use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};

/// Produces the `Biz-Api-Key` / `Biz-Api-Signature` pair for a wallet API
/// request.
pub trait RequestSigner: Send + Sync {
    /// Value for `Biz-Api-Key`.
    fn api_key(&self) -> String;

    fn sign(&self, method: &str, path: &str, nonce: &str, query: &str, body: &str) -> Result<String>;
}

/// Canonical string covered by the signature: `METHOD|PATH|NONCE|QUERY|BODY`.
pub fn string_to_sign(method: &str, path: &str, nonce: &str, query: &str, body: &str) -> String {
    format!("{}|{}|{}|{}|{}", method.to_uppercase(), path, nonce, query, body)
}

/// SHA-256 applied twice to [`string_to_sign`]; this is what gets signed.
pub fn signing_digest(method: &str, path: &str, nonce: &str, query: &str, body: &str) -> [u8; 32] {
    let once = Sha256::digest(string_to_sign(method, path, nonce, query, body).as_bytes());
    let twice = Sha256::digest(once);
    let mut out = [0u8; 32];
    out.copy_from_slice(&twice);
    out
}

/// Ed25519 API-key signer. The secret is the hex 32-byte private key; the
/// API key sent alongside is the matching public key, hex encoded.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn from_hex(secret: &str) -> Result<Self> {
        let secret = secret.trim();
        let raw = secret.strip_prefix("0x").unwrap_or(secret);
        let bytes = hex::decode(raw).map_err(|e| anyhow!("api secret is not hex: {}", e))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("api secret must be 32 bytes, got {}", bytes.len()))?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }
}

impl RequestSigner for Ed25519Signer {
    fn api_key(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    fn sign(&self, method: &str, path: &str, nonce: &str, query: &str, body: &str) -> Result<String> {
        let digest = signing_digest(method, path, nonce, query, body);
        Ok(hex::encode(self.key.sign(&digest).to_bytes()))
    }
}

/// Hex SHA-256 of a request body, for audit logs that must not carry the body.
pub fn body_digest(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}
