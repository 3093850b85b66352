//! Serde adapters for fixed-size byte arrays carried as hex strings on the
//! JSON wire.

/// Use with `#[serde(with = "serde_helpers::hex_array")]` on `[u8; N]` fields.
pub mod hex_array {
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(d: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        let raw = hex::decode(&s).map_err(DeError::custom)?;
        raw.try_into()
            .map_err(|_| DeError::custom(format!("expected {} hex bytes", N)))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapper {
        #[serde(with = "super::hex_array")]
        data: [u8; 4],
    }

    #[test]
    fn test_hex_array_round_trip() {
        let w = Wrapper { data: [0xde, 0xad, 0xbe, 0xef] };
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"data":"deadbeef"}"#);
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn test_hex_array_rejects_wrong_length() {
        let res: Result<Wrapper, _> = serde_json::from_str(r#"{"data":"dead"}"#);
        assert!(res.is_err());
    }
}
