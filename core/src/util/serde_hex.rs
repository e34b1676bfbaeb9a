//! Hex serialization helpers for serde
use serde::Deserialize;

fn decode_array<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
    bytes
        .try_into()
        .map_err(|_| serde::de::Error::custom("Invalid length"))
}

pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&hex::encode(bytes))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    hex::decode(s).map_err(serde::de::Error::custom)
}

/// Fixed 32-byte secrets (root keys, chain keys, message key material).
pub mod bytes32 {
    use super::*;

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        decode_array(deserializer)
    }
}

pub mod bytes12 {
    use super::*;

    pub fn serialize<S>(bytes: &[u8; 12], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 12], D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        decode_array(deserializer)
    }
}

pub mod x25519 {
    use super::*;
    use x25519_dalek::PublicKey;

    pub fn serialize<S>(key: &PublicKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(key.as_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PublicKey, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let array: [u8; 32] = decode_array(deserializer)?;
        Ok(PublicKey::from(array))
    }
}

pub mod x25519_opt {
    use super::*;
    use serde::Serialize;
    use x25519_dalek::PublicKey;

    pub fn serialize<S>(key: &Option<PublicKey>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        key.map(|k| hex::encode(k.as_bytes())).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<PublicKey>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let Some(s) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid length"))?;
        Ok(Some(PublicKey::from(array)))
    }
}

pub mod static_secret {
    use super::*;
    use x25519_dalek::StaticSecret;
    use zeroize::Zeroizing;

    pub fn serialize<S>(secret: &StaticSecret, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded = Zeroizing::new(hex::encode(secret.to_bytes()));
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<StaticSecret, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let array: Zeroizing<[u8; 32]> = Zeroizing::new(decode_array(deserializer)?);
        Ok(StaticSecret::from(*array))
    }
}

pub mod verifying_key {
    use super::*;
    use ed25519_dalek::VerifyingKey;

    pub fn serialize<S>(key: &VerifyingKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(key.as_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<VerifyingKey, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let array: [u8; 32] = decode_array(deserializer)?;
        VerifyingKey::from_bytes(&array).map_err(serde::de::Error::custom)
    }
}

pub mod signature {
    use super::*;
    use ed25519_dalek::Signature;

    pub fn serialize<S>(sig: &Signature, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(sig.to_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Signature, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let array: [u8; 64] = decode_array(deserializer)?;
        Ok(Signature::from_bytes(&array))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use x25519_dalek::{PublicKey, StaticSecret};

    #[derive(Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super::bytes32")]
        key: [u8; 32],
        #[serde(with = "super::x25519_opt")]
        remote: Option<PublicKey>,
        #[serde(with = "super::static_secret")]
        secret: StaticSecret,
    }

    #[test]
    fn test_hex_fields_restore() {
        let secret = StaticSecret::from([7u8; 32]);
        let sample = Sample {
            key: [3u8; 32],
            remote: Some(PublicKey::from(&secret)),
            secret,
        };

        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains(&hex::encode([3u8; 32])));

        let restored: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.key, [3u8; 32]);
        assert_eq!(restored.remote, sample.remote);
        assert_eq!(restored.secret.to_bytes(), [7u8; 32]);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let json = format!(
            r#"{{"key":"{}","remote":null,"secret":"{}"}}"#,
            hex::encode([1u8; 31]),
            hex::encode([2u8; 32])
        );
        assert!(serde_json::from_str::<Sample>(&json).is_err());
    }
}
