use std::fmt;

use rand::rngs::OsRng;
use secp256k1::{ecdh, schnorr, Keypair, Message, Parity, SecretKey, XOnlyPublicKey, SECP256K1};

use crate::error::IdentityError;
use crate::types::PublicKey;

/// The signing capability the rest of the client depends on.
///
/// Implementors hold a private key they never hand out: callers can only ask
/// for the public key, a signature over a 32-byte digest, or the shared
/// secret with a counterparty.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKey;

    /// BIP-340 Schnorr signature over `digest`.
    fn sign(&self, digest: &[u8; 32]) -> Result<[u8; 64], IdentityError>;

    /// x-coordinate of the ECDH point shared with `counterparty`.
    fn derive_shared_secret(&self, counterparty: &PublicKey) -> Result<[u8; 32], IdentityError>;
}

/// A user's cryptographic identity based on a secp256k1 keypair.
/// The x-only public key serves as the user ID.
#[derive(Clone)]
pub struct Identity {
    keypair: Keypair,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self {
            keypair: Keypair::new(SECP256K1, &mut OsRng),
        }
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, IdentityError> {
        let secret_key =
            SecretKey::from_slice(secret).map_err(|_| IdentityError::InvalidSecretKey)?;
        Ok(Self {
            keypair: Keypair::from_secret_key(SECP256K1, &secret_key),
        })
    }

    /// Restore identity from a hex-encoded secret key
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(secret_hex.trim()).map_err(|_| IdentityError::InvalidSecretKey)?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidSecretKey)?;
        Self::from_secret_bytes(&secret)
    }

    /// Get the raw secret key bytes
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.keypair.secret_bytes()
    }

    /// Export the secret key as hex (for backups / the CLI `keygen` command)
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_bytes())
    }
}

impl Signer for Identity {
    fn public_key(&self) -> PublicKey {
        let (xonly, _parity) = self.keypair.x_only_public_key();
        PublicKey(xonly.serialize())
    }

    fn sign(&self, digest: &[u8; 32]) -> Result<[u8; 64], IdentityError> {
        let message = Message::from_digest(*digest);
        let signature = SECP256K1.sign_schnorr_no_aux_rand(&message, &self.keypair);
        Ok(signature.serialize())
    }

    fn derive_shared_secret(&self, counterparty: &PublicKey) -> Result<[u8; 32], IdentityError> {
        let xonly = XOnlyPublicKey::from_slice(counterparty.as_bytes())
            .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
        // x-only keys are lifted with even parity; the shared x is the same either way
        let point = xonly.public_key(Parity::Even);
        let secret_key = SecretKey::from_keypair(&self.keypair);
        let shared = ecdh::shared_secret_point(&point, &secret_key);

        let mut x = [0u8; 32];
        x.copy_from_slice(&shared[..32]);
        Ok(x)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key().to_hex())
            .finish_non_exhaustive()
    }
}

/// Verify a Schnorr signature against an x-only public key
pub fn verify_signature(
    pubkey: &PublicKey,
    digest: &[u8; 32],
    signature: &[u8; 64],
) -> Result<(), IdentityError> {
    let xonly = XOnlyPublicKey::from_slice(pubkey.as_bytes())
        .map_err(|e| IdentityError::InvalidPublicKey(e.to_string()))?;
    let signature = schnorr::Signature::from_slice(signature)
        .map_err(|e| IdentityError::Signing(e.to_string()))?;
    SECP256K1
        .verify_schnorr(&signature, &Message::from_digest(*digest), &xonly)
        .map_err(|e| IdentityError::Signing(e.to_string()))
}
