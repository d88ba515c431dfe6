// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hashes, public keys and signature verification.
//!
//! Key material travels inside role metadata in the Uptane wire form:
//!
//! ```bash
//! {
//!   "keytype": "RSA" | "ED25519",
//!   "keyval": { "public": PEM_SPKI | HEX }
//! }
//! ```
//!
//! A key's id is the lowercase hex digest of SHA-256 over the canonical JSON
//! of that wire form, and is the only reference roles use to name keys.

use crate::canonical::canonicalize;
use crate::error::{Error, Result};
use data_encoding::{BASE64, HEXLOWER, HEXLOWER_PERMISSIVE};
use derp::Tag;
use ring::digest::{self, SHA256, SHA512};
use ring::signature::{UnparsedPublicKey, ED25519, RSA_PSS_2048_8192_SHA256};
use serde::de::Error as DeserializeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use untrusted::Input;

/// 1.2.840.113549.1.1.1 rsaEncryption (PKCS #1)
const RSA_SPKI_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];

const ED25519_PUBLIC_KEY_LENGTH: usize = 32;

/// Digest algorithms this device can compute locally.
///
/// Metadata may name algorithms we do not support; those entries are carried
/// through parsing and ignored when hash sets are intersected.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
    Unknown(String),
}

impl HashAlgorithm {
    pub const SUPPORTED: &'static [HashAlgorithm] =
        &[HashAlgorithm::Sha256, HashAlgorithm::Sha512];

    pub fn is_supported(&self) -> bool {
        !matches!(self, HashAlgorithm::Unknown(_))
    }

    fn name(&self) -> &str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Unknown(s) => s,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "sha256" => HashAlgorithm::Sha256,
            "sha512" => HashAlgorithm::Sha512,
            _ => HashAlgorithm::Unknown(s.to_string()),
        })
    }
}

impl Serialize for HashAlgorithm {
    fn serialize<S: Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
        ser.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for HashAlgorithm {
    fn deserialize<D: Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(de)?;
        s.parse().map_err(|e| DeserializeError::custom(format!("{:?}", e)))
    }
}

/// A raw digest value, hex encoded on the wire.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HashValue(Vec<u8>);

impl HashValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        HashValue(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map(HashValue)
            .map_err(|e| Error::MalformedMetadata(format!("bad hash value: {}", e)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl fmt::Debug for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HashValue").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for HashValue {
    fn serialize<S: Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
        ser.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for HashValue {
    fn deserialize<D: Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(de)?;
        HashValue::from_hex(&s).map_err(|e| DeserializeError::custom(format!("{:?}", e)))
    }
}

/// An algorithm-tagged digest. Equality is algorithm and digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Hash {
    pub algorithm: HashAlgorithm,
    pub value: HashValue,
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

/// Digest `data` with a supported algorithm.
pub fn digest(algorithm: &HashAlgorithm, data: &[u8]) -> Option<HashValue> {
    let alg = match algorithm {
        HashAlgorithm::Sha256 => &SHA256,
        HashAlgorithm::Sha512 => &SHA512,
        HashAlgorithm::Unknown(_) => return None,
    };
    Some(HashValue(digest::digest(alg, data).as_ref().to_vec()))
}

/// Size and digests of a payload under every supported algorithm in `algs`.
pub fn calculate_hashes(
    data: &[u8],
    algs: &[HashAlgorithm],
) -> (u64, HashMap<HashAlgorithm, HashValue>) {
    let mut hashes = HashMap::new();
    for alg in algs {
        if let Some(value) = digest(alg, data) {
            hashes.insert(alg.clone(), value);
        }
    }
    (data.len() as u64, hashes)
}

/// Types of public keys understood by the verifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyType {
    Rsa2048,
    Rsa4096,
    Ed25519,
    Unknown(String),
}

impl KeyType {
    fn uptane_name(&self) -> &str {
        match self {
            KeyType::Rsa2048 | KeyType::Rsa4096 => "RSA",
            KeyType::Ed25519 => "ED25519",
            KeyType::Unknown(s) => s,
        }
    }
}

/// Wrapper type for a public key's id.
///
/// Computed as `hexdigest(sha256(cjson(uptane_key)))`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(String);

impl KeyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for KeyId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(Error::MalformedMetadata("key id must be 64 characters long".into()));
        }
        Ok(KeyId(s.to_owned()))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for KeyId {
    fn serialize<S: Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(ser)
    }
}

impl<'de> Deserialize<'de> for KeyId {
    fn deserialize<D: Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(de)?;
        KeyId::from_str(&s).map_err(|e| DeserializeError::custom(format!("{:?}", e)))
    }
}

/// One signature over the canonical form of a role's `signed` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub keyid: KeyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub sig: String,
}

/// A public key in its Uptane wire form, with verification material parsed
/// out at construction so that signature checks are cheap.
#[derive(Clone, Debug)]
pub struct PublicKey {
    keytype: KeyType,
    public: String,
    key_id: KeyId,
    material: VerifyMaterial,
}

#[derive(Clone, Debug)]
enum VerifyMaterial {
    Ed25519(Vec<u8>),
    /// PKCS#1 `RSAPublicKey` DER, extracted from the PEM SPKI.
    RsaPkcs1(Vec<u8>),
    Unusable,
}

impl PublicKey {
    pub fn new(keytype: KeyType, public: impl Into<String>) -> Result<Self> {
        let public = public.into();
        let material = match &keytype {
            KeyType::Ed25519 => match HEXLOWER_PERMISSIVE.decode(public.as_bytes()) {
                Ok(bytes) if bytes.len() == ED25519_PUBLIC_KEY_LENGTH => {
                    VerifyMaterial::Ed25519(bytes)
                }
                _ => VerifyMaterial::Unusable,
            },
            KeyType::Rsa2048 | KeyType::Rsa4096 => match rsa_pkcs1_from_pem(&public) {
                Some((pkcs1, _)) => VerifyMaterial::RsaPkcs1(pkcs1),
                None => VerifyMaterial::Unusable,
            },
            KeyType::Unknown(_) => VerifyMaterial::Unusable,
        };
        let key_id = calculate_key_id(&json!({
            "keytype": keytype.uptane_name(),
            "keyval": {"public": public},
        }))?;
        Ok(PublicKey { keytype, public, key_id, material })
    }

    /// Parse a key out of role metadata.
    ///
    /// Malformed keys parse as [`KeyType::Unknown`] rather than failing the
    /// whole document; an unknown key never verifies anything.
    pub fn from_uptane(value: &Value) -> Result<Self> {
        let keytype = value.get("keytype").and_then(Value::as_str).unwrap_or("");
        let public = value
            .get("keyval")
            .and_then(|kv| kv.get("public"))
            .and_then(Value::as_str)
            .unwrap_or("");

        let keytype = match keytype.to_ascii_uppercase().as_str() {
            "ED25519" => match HEXLOWER_PERMISSIVE.decode(public.as_bytes()) {
                Ok(bytes) if bytes.len() == ED25519_PUBLIC_KEY_LENGTH => KeyType::Ed25519,
                _ => KeyType::Unknown("ED25519".to_string()),
            },
            "RSA" => match rsa_pkcs1_from_pem(public) {
                Some((_, 4096)) => KeyType::Rsa4096,
                Some((_, _)) => KeyType::Rsa2048,
                None => KeyType::Unknown("RSA".to_string()),
            },
            other => KeyType::Unknown(other.to_string()),
        };
        PublicKey::new(keytype, public)
    }

    pub fn to_uptane(&self) -> Value {
        json!({
            "keytype": self.keytype.uptane_name(),
            "keyval": {"public": self.public},
        })
    }

    pub fn keytype(&self) -> &KeyType {
        &self.keytype
    }

    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// Verify a base64 signature over `msg`.
    ///
    /// RSA keys use RSASSA-PSS with SHA-256 (MGF1/SHA-256, salt length equal
    /// to the hash length); Ed25519 keys verify per RFC 8032.
    pub fn verify_signature(&self, msg: &[u8], sig_base64: &str) -> bool {
        let sig = match BASE64.decode(sig_base64.as_bytes()) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        match &self.material {
            VerifyMaterial::Ed25519(raw) => {
                UnparsedPublicKey::new(&ED25519, raw).verify(msg, &sig).is_ok()
            }
            VerifyMaterial::RsaPkcs1(pkcs1) => {
                UnparsedPublicKey::new(&RSA_PSS_2048_8192_SHA256, pkcs1)
                    .verify(msg, &sig)
                    .is_ok()
            }
            VerifyMaterial::Unusable => false,
        }
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        // key_id is derived from the other two fields.
        self.keytype == other.keytype && self.public == other.public
    }
}

impl Eq for PublicKey {}

fn calculate_key_id(uptane_key: &Value) -> Result<KeyId> {
    let canonical = canonicalize(uptane_key)?;
    let digest = digest::digest(&SHA256, &canonical);
    Ok(KeyId(HEXLOWER.encode(digest.as_ref())))
}

/// Strip PEM armor and base64-decode the body.
fn pem_to_der(pem: &str) -> Option<Vec<u8>> {
    let mut body = String::new();
    let mut inside = false;
    for line in pem.lines() {
        let line = line.trim();
        if line.starts_with("-----BEGIN") {
            inside = true;
        } else if line.starts_with("-----END") {
            break;
        } else if inside {
            body.push_str(line);
        }
    }
    if body.is_empty() {
        return None;
    }
    BASE64.decode(body.as_bytes()).ok()
}

/// Walk a `SubjectPublicKeyInfo` and return the embedded PKCS#1
/// `RSAPublicKey` DER together with the modulus size in bits.
fn rsa_pkcs1_from_pem(pem: &str) -> Option<(Vec<u8>, usize)> {
    let der = pem_to_der(pem)?;
    let input = Input::from(&der);
    let pkcs1 = input
        .read_all(derp::Error::Read, |input| {
            derp::nested(input, Tag::Sequence, |input| {
                derp::nested(input, Tag::Sequence, |input| {
                    let oid = derp::expect_tag_and_get_value(input, Tag::Oid)?;
                    if oid.as_slice_less_safe() != RSA_SPKI_OID {
                        return Err(derp::Error::WrongValue);
                    }
                    derp::read_null(input)
                })?;
                let bits = derp::bit_string_with_no_unused_bits(input)?;
                Ok(bits.as_slice_less_safe().to_vec())
            })
        })
        .ok()?;

    let modulus_bits = {
        let input = Input::from(&pkcs1);
        input
            .read_all(derp::Error::Read, |input| {
                derp::nested(input, Tag::Sequence, |input| {
                    let modulus = derp::expect_tag_and_get_value(input, Tag::Integer)?;
                    let _exponent = derp::expect_tag_and_get_value(input, Tag::Integer)?;
                    let bytes = modulus.as_slice_less_safe();
                    // DER integers carry a leading zero octet when the high
                    // bit of the magnitude is set.
                    let magnitude = bytes.iter().position(|&b| b != 0).map_or(0, |i| bytes.len() - i);
                    Ok(magnitude * 8)
                })
            })
            .ok()?
    };
    Some((pkcs1, modulus_bits))
}
