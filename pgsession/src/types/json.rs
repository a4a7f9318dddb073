use serde::{Serialize, de::DeserializeOwned};
use std::any::Any;

use crate::{
    codec::{CodecError, Registry},
    postgres::{Oid, PgFormat, oid},
};

/// Binary `jsonb` starts with its format version.
const JSONB_VERSION: u8 = 1;

pub(super) fn register(registry: &mut Registry) {
    registry.register_json::<serde_json::Value>();
}

impl Registry {
    /// Register `json` and `jsonb` codecs for a serde type.
    ///
    /// [`serde_json::Value`] is registered by default.
    pub fn register_json<T>(&mut self)
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        for format in [PgFormat::Text, PgFormat::Binary] {
            self.register_type::<T>(oid::JSON, format, encode_json, |raw| decode_json(oid::JSON, raw));
        }
        self.register_type::<T>(oid::JSONB, PgFormat::Text, encode_json, |raw| decode_json(oid::JSONB, raw));
        self.register_type::<T>(
            oid::JSONB,
            PgFormat::Binary,
            |value, buf| {
                buf.extend_from_slice(&[JSONB_VERSION]);
                encode_json(value, buf)
            },
            |raw| match raw.split_first() {
                Some((&JSONB_VERSION, raw)) => decode_json(oid::JSONB, raw),
                Some((version, _)) => Err(CodecError::invalid(
                    oid::JSONB,
                    format!("unsupported jsonb version {version}"),
                )),
                None => Err(CodecError::invalid(oid::JSONB, "empty jsonb")),
            },
        );
    }
}

fn encode_json<T: Serialize>(value: &T, buf: &mut bytes::BytesMut) -> Result<(), CodecError> {
    use bytes::BufMut;
    serde_json::to_writer(buf.writer(), value).map_err(|e| CodecError::invalid(oid::JSON, e.to_string()))
}

fn decode_json<T: DeserializeOwned>(oid: Oid, raw: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(raw).map_err(|e| CodecError::invalid(oid, e.to_string()))
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn jsonb_binary_has_version() {
        let registry = Registry::new();
        let value = json!({ "id": 1, "tags": ["a"] });

        let mut buf = BytesMut::new();
        registry.encode(oid::JSONB, PgFormat::Binary, &value, &mut buf).unwrap();
        assert_eq!(buf[0], JSONB_VERSION);

        let decoded = registry.decode(oid::JSONB, PgFormat::Binary, &buf).unwrap();
        assert_eq!(decoded.downcast::<Value>().unwrap(), value);
    }

    #[test]
    fn json_text_round_trip() {
        let registry = Registry::new();
        let value = json!([1, null, "x"]);

        let mut buf = BytesMut::new();
        registry.encode(oid::JSON, PgFormat::Text, &value, &mut buf).unwrap();
        let decoded = registry.decode(oid::JSON, PgFormat::Text, &buf).unwrap();
        assert_eq!(decoded.downcast::<Value>().unwrap(), value);
    }
}
