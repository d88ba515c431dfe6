// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The Primary's Uptane signing key.
//!
//! Production deployments keep this key in an HSM; the trait hides where the
//! private half lives. [`EphemeralKeyStore`] holds an in-memory Ed25519 key
//! and backs the test environments.

use crate::canonical::canonicalize;
use crate::crypto::{KeyType, PublicKey, Signature};
use crate::error::{Error, Result};
use data_encoding::{BASE64, HEXLOWER};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde_json::{json, Value};

pub trait KeyStore {
    /// The public half, in its Uptane wire form.
    fn public_key(&self) -> &PublicKey;

    /// Sign `msg` and return an attached signature carrying this key's id.
    fn sign(&self, msg: &[u8]) -> Result<Signature>;
}

/// Wrap `payload` into a signed document: `{"signatures": [...], "signed":
/// payload}`, signed over the canonical form of the payload.
pub fn sign_payload(store: &dyn KeyStore, payload: Value) -> Result<Value> {
    let canonical = canonicalize(&payload)?;
    let signature = store.sign(&canonical)?;
    Ok(json!({
        "signatures": [signature],
        "signed": payload,
    }))
}

/// An in-memory Ed25519 signing key.
pub struct EphemeralKeyStore {
    keypair: Ed25519KeyPair,
    public: PublicKey,
}

impl EphemeralKeyStore {
    pub fn generate() -> Result<Self> {
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new())
            .map_err(|_| Error::KeyStore("failed to generate Ed25519 key".into()))?;
        Self::from_pkcs8(pkcs8.as_ref())
    }

    pub fn from_pkcs8(der: &[u8]) -> Result<Self> {
        let keypair = Ed25519KeyPair::from_pkcs8(der)
            .map_err(|_| Error::KeyStore("could not parse key as PKCS#8v2".into()))?;
        let public = PublicKey::new(
            KeyType::Ed25519,
            HEXLOWER.encode(keypair.public_key().as_ref()),
        )?;
        Ok(EphemeralKeyStore { keypair, public })
    }
}

impl KeyStore for EphemeralKeyStore {
    fn public_key(&self) -> &PublicKey {
        &self.public
    }

    fn sign(&self, msg: &[u8]) -> Result<Signature> {
        let sig = self.keypair.sign(msg);
        Ok(Signature {
            keyid: self.public.key_id().clone(),
            method: Some("ed25519".to_string()),
            sig: BASE64.encode(sig.as_ref()),
        })
    }
}
