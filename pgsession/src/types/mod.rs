//! Built-in codecs.
//!
//! Registered by [`Registry::new`]:
//!
//! | postgres | rust | formats |
//! |---|---|---|
//! | `bool` | [`bool`] | text, binary |
//! | `int2`, `int4`, `int8` | [`i16`], [`i32`], [`i64`] | text, binary |
//! | `oid` | [`u32`] | text, binary |
//! | `float4`, `float8` | [`f32`], [`f64`] | text, binary |
//! | `text`, `varchar`, `bpchar`, `name`, `unknown` | [`String`], encode also from `&'static str` | text, binary |
//! | `bytea` | [`Vec<u8>`] | text (hex), binary |
//! | `json`, `jsonb` | [`serde_json::Value`], requires `json` feature | text, binary |
//! | `timestamp`, `timestamptz`, `date` | [`time`][::time] types, requires `time` feature | see module |
use bytes::BytesMut;
use std::{fmt::Write, str::FromStr};

use crate::{
    codec::{CodecError, Registry},
    postgres::{Oid, PgFormat, oid},
};

#[cfg(feature = "json")]
mod json;

#[cfg(feature = "time")]
mod time;

pub(crate) fn utf8(oid: Oid, raw: &[u8]) -> Result<&str, CodecError> {
    std::str::from_utf8(raw).map_err(|_| CodecError::invalid(oid, "value is not utf8"))
}

pub(crate) fn parse_text<T: FromStr>(oid: Oid, raw: &[u8]) -> Result<T, CodecError> {
    utf8(oid, raw)?
        .parse()
        .map_err(|_| CodecError::invalid(oid, format!("cannot parse {}", std::any::type_name::<T>())))
}

pub(crate) fn fixed<const N: usize>(oid: Oid, raw: &[u8]) -> Result<[u8; N], CodecError> {
    raw.try_into()
        .map_err(|_| CodecError::invalid(oid, format!("expected {N} bytes, found {}", raw.len())))
}

fn register_bool(registry: &mut Registry) {
    registry.register_type::<bool>(
        oid::BOOL,
        PgFormat::Binary,
        |v, buf| {
            buf.extend_from_slice(&[u8::from(*v)]);
            Ok(())
        },
        |raw| Ok(fixed::<1>(oid::BOOL, raw)?[0] != 0),
    );
    registry.register_type::<bool>(
        oid::BOOL,
        PgFormat::Text,
        |v, buf| {
            buf.extend_from_slice(if *v { b"t" } else { b"f" });
            Ok(())
        },
        |raw| match raw {
            b"t" | b"true" => Ok(true),
            b"f" | b"false" => Ok(false),
            _ => Err(CodecError::invalid(oid::BOOL, "expected `t` or `f`")),
        },
    );
}

macro_rules! int {
    ($registry:ident, $ty:ty, $oid:expr) => {
        $registry.register_type::<$ty>(
            $oid,
            PgFormat::Binary,
            |v, buf| {
                buf.extend_from_slice(&v.to_be_bytes());
                Ok(())
            },
            |raw| Ok(<$ty>::from_be_bytes(fixed($oid, raw)?)),
        );
        $registry.register_type::<$ty>(
            $oid,
            PgFormat::Text,
            |v, buf| {
                buf.extend_from_slice(itoa::Buffer::new().format(*v).as_bytes());
                Ok(())
            },
            |raw| parse_text($oid, raw),
        );
    };
}

macro_rules! float {
    ($registry:ident, $ty:ty, $oid:expr) => {
        $registry.register_type::<$ty>(
            $oid,
            PgFormat::Binary,
            |v, buf| {
                buf.extend_from_slice(&v.to_be_bytes());
                Ok(())
            },
            |raw| Ok(<$ty>::from_be_bytes(fixed($oid, raw)?)),
        );
        $registry.register_type::<$ty>(
            $oid,
            PgFormat::Text,
            |v, buf| {
                if v.is_nan() {
                    buf.extend_from_slice(b"NaN");
                } else if v.is_infinite() {
                    buf.extend_from_slice(if *v > 0.0 { b"Infinity" } else { b"-Infinity" });
                } else {
                    let _ = write!(buf, "{v}");
                }
                Ok(())
            },
            |raw| match raw {
                b"NaN" => Ok(<$ty>::NAN),
                b"Infinity" => Ok(<$ty>::INFINITY),
                b"-Infinity" => Ok(<$ty>::NEG_INFINITY),
                _ => parse_text($oid, raw),
            },
        );
    };
}

pub(crate) fn register_builtins(registry: &mut Registry) {
    register_bool(registry);

    int!(registry, i16, oid::INT2);
    int!(registry, i32, oid::INT4);
    int!(registry, i64, oid::INT8);
    int!(registry, u32, oid::OID);

    float!(registry, f32, oid::FLOAT4);
    float!(registry, f64, oid::FLOAT8);

    for oid in [oid::TEXT, oid::VARCHAR, oid::BPCHAR, oid::NAME, oid::UNKNOWN] {
        register_text(registry, oid);
    }

    register_bytea(registry);

    #[cfg(feature = "json")]
    json::register(registry);

    #[cfg(feature = "time")]
    time::register(registry);
}

fn register_text(registry: &mut Registry, oid: Oid) {
    for format in [PgFormat::Text, PgFormat::Binary] {
        registry.register_encoder::<&'static str>(oid, format, |v, buf| {
            buf.extend_from_slice(v.as_bytes());
            Ok(())
        });
        registry.register_type::<String>(
            oid,
            format,
            |v, buf| {
                buf.extend_from_slice(v.as_bytes());
                Ok(())
            },
            move |raw| utf8(oid, raw).map(str::to_owned),
        );
    }
}

fn register_bytea(registry: &mut Registry) {
    registry.register_type::<Vec<u8>>(
        oid::BYTEA,
        PgFormat::Binary,
        |v, buf| {
            buf.extend_from_slice(v);
            Ok(())
        },
        |raw| Ok(raw.to_vec()),
    );
    registry.register_type::<Vec<u8>>(
        oid::BYTEA,
        PgFormat::Text,
        |v, buf| {
            buf.reserve(2 + v.len() * 2);
            buf.extend_from_slice(b"\\x");
            for byte in v {
                let _ = write!(buf, "{byte:02x}");
            }
            Ok(())
        },
        decode_bytea_hex,
    );
}

fn decode_bytea_hex(raw: &[u8]) -> Result<Vec<u8>, CodecError> {
    let Some(hex) = raw.strip_prefix(b"\\x") else {
        return Err(CodecError::invalid(oid::BYTEA, "only hex output is supported"));
    };
    if hex.len() % 2 != 0 {
        return Err(CodecError::invalid(oid::BYTEA, "odd hex length"));
    }
    hex.chunks_exact(2)
        .map(|pair| {
            let pair = utf8(oid::BYTEA, pair)?;
            u8::from_str_radix(pair, 16).map_err(|_| CodecError::invalid(oid::BYTEA, "invalid hex digit"))
        })
        .collect()
}
