use std::{error::Error, fs, path::Path};

use ring::{
    rand::SystemRandom,
    signature::{
        EcdsaKeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_ASN1,
        ECDSA_P256_SHA256_ASN1_SIGNING,
    },
};

use crate::hash::hash160;

/// Version byte prepended to the public key when deriving an address.
pub const ADDRESS_VERSION: u8 = 1;

/// A key pair plus the identifiers derived from it. The signature scheme is
/// ECDSA P-256 and is fixed cluster-wide; every node signs and verifies with
/// the same algorithm.
pub struct Account {
    pkcs8: Vec<u8>,
    keypair: EcdsaKeyPair,
    public_key_hex: String,
}

impl Account {
    pub fn generate() -> Result<Self, Box<dyn Error>> {
        let rng = SystemRandom::new();
        let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .map_err(|_| "Failed to generate keypair")?;

        Self::from_pkcs8(document.as_ref().to_vec())
    }

    pub fn from_pkcs8(pkcs8: Vec<u8>) -> Result<Self, Box<dyn Error>> {
        let keypair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &pkcs8)
            .map_err(|_| "Invalid keypair document")?;
        let public_key_hex = hex::encode(keypair.public_key().as_ref());

        Ok(Self {
            pkcs8,
            keypair,
            public_key_hex,
        })
    }

    /// The hex encoding of the public key. This is the identity that appears
    /// in unlocking scripts.
    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    /// The public-key fingerprint embedded in P2PKH locking scripts.
    pub fn pub_key_hash(&self) -> String {
        hash160(&self.public_key_hex)
    }

    /// The account address: hash160 over the version byte and the public key.
    pub fn address(&self) -> String {
        hash160(&format!("{}{}", ADDRESS_VERSION, self.public_key_hex))
    }

    /// Sign the UTF-8 bytes of `text`, returning a detached hex signature.
    pub fn sign(&self, text: &str) -> Result<String, Box<dyn Error>> {
        let rng = SystemRandom::new();
        let sig = self
            .keypair
            .sign(&rng, text.as_bytes())
            .map_err(|_| "Failed to sign")?;

        Ok(hex::encode(sig.as_ref()))
    }

    pub fn save(&self, path: &str) -> Result<(), Box<dyn Error>> {
        fs::write(path, hex::encode(&self.pkcs8))?;

        Ok(())
    }

    pub fn load(path: &str) -> Result<Self, Box<dyn Error>> {
        if !Path::new(path).exists() {
            return Err(format!("No wallet file at {path}").into());
        }

        let pkcs8 = hex::decode(fs::read_to_string(path)?.trim())?;

        Self::from_pkcs8(pkcs8)
    }
}

impl Clone for Account {
    fn clone(&self) -> Self {
        Self::from_pkcs8(self.pkcs8.clone()).expect("A valid keypair document stays valid")
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address())
            .field("pub_key_hash", &self.pub_key_hash())
            .finish()
    }
}

/// Verify a detached hex signature over the UTF-8 bytes of `text` for the
/// given hex public key. Any decode failure counts as a bad signature.
pub fn verify_signature(text: &str, signature_hex: &str, public_key_hex: &str) -> bool {
    let sig = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let pubkey = match hex::decode(public_key_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, &pubkey)
        .verify(text.as_bytes(), &sig)
        .is_ok()
}
