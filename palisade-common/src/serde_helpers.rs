//! [`serde`] field helpers.

/// Byte blobs (DER certificates, encrypted key material, salts) rendered
/// as lowercase hex in human-readable formats and as raw bytes in binary
/// ones.
///
/// ## Example:
///
/// ```rust
/// use palisade_common::serde_helpers::hexstr_or_bytes;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct CertDer(#[serde(with = "hexstr_or_bytes")] Vec<u8>);
/// ```
pub mod hexstr_or_bytes {
    use std::{fmt, marker::PhantomData};

    use hex::FromHex;
    use serde::{Deserializer, Serializer, de, ser};

    pub fn serialize<S, T>(data: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: ser::Serialize + AsRef<[u8]>,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(data.as_ref()))
        } else {
            data.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: de::Deserialize<'de> + FromHex,
        T::Error: fmt::Display,
    {
        struct HexVisitor<T>(PhantomData<T>);

        impl<T: FromHex> de::Visitor<'_> for HexVisitor<T>
        where
            T::Error: fmt::Display,
        {
            type Value = T;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a hex-encoded string")
            }

            fn visit_str<E: de::Error>(self, s: &str) -> Result<T, E> {
                T::from_hex(s).map_err(de::Error::custom)
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(HexVisitor(PhantomData))
        } else {
            T::deserialize(deserializer)
        }
    }

    #[cfg(test)]
    mod test {
        use serde::{Deserialize, Serialize};

        #[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
        struct Entry {
            #[serde(with = "super")]
            der: Vec<u8>,
            alias: String,
        }

        #[test]
        fn human_readable_form_is_hex() {
            let entry = Entry {
                der: vec![0x30, 0x82, 0x00, 0xff],
                alias: "root".to_owned(),
            };
            let json = serde_json::to_value(&entry).unwrap();
            assert_eq!(
                json,
                serde_json::json!({ "der": "308200ff", "alias": "root" }),
            );

            let roundtripped: Entry = serde_json::from_value(json).unwrap();
            assert_eq!(roundtripped, entry);
        }

        #[test]
        fn rejects_non_hex_input() {
            for bad in [
                r#"{ "der": "zz", "alias": "a" }"#,
                r#"{ "der": "abc", "alias": "a" }"#,
            ] {
                assert!(serde_json::from_str::<Entry>(bad).is_err());
            }
        }
    }
}
