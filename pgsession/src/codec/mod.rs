//! Value codec registry.
//!
//! Values cross the engine type-erased: a [`Param`] carries any `'static` value together with its
//! [`Oid`], and a decoded column comes back as a [`Value`] to be downcast by the caller. The
//! [`Registry`] maps `(Oid, PgFormat)` to the functions converting between the two.
//!
//! ```
//! use pgsession::{codec::{CodecError, Registry}, postgres::{PgFormat, oid}};
//!
//! #[derive(Debug, PartialEq)]
//! struct Celsius(f64);
//!
//! let mut registry = Registry::new();
//! registry.register_type::<Celsius>(
//!     oid::FLOAT8,
//!     PgFormat::Text,
//!     |value, buf| { buf.extend_from_slice(value.0.to_string().as_bytes()); Ok(()) },
//!     |raw| std::str::from_utf8(raw)
//!         .ok()
//!         .and_then(|e| e.parse().ok())
//!         .map(Celsius)
//!         .ok_or(CodecError::invalid(oid::FLOAT8, "not a float")),
//! );
//! ```
use bytes::{Bytes, BytesMut};
use std::{
    any::{Any, type_name},
    borrow::Cow,
    collections::HashMap,
    fmt,
    sync::Arc,
};

use crate::{
    Error, Result,
    postgres::{Oid, PgFormat, PgType, ProtocolError, frontend::check_len},
};

type EncodeFn = dyn Fn(&dyn Any, &mut BytesMut) -> Result<(), CodecError> + Send + Sync;
type DecodeFn = dyn Fn(&[u8]) -> Result<Value, CodecError> + Send + Sync;

#[derive(Clone, Default)]
struct Codec {
    encode: Option<Arc<EncodeFn>>,
    decode: Option<Arc<DecodeFn>>,
}

/// Codec lookup table keyed by type oid and wire format.
///
/// Registration happens before the registry is shared, afterwards it is only read, so one
/// `Arc<Registry>` can serve any number of sessions.
///
/// Text columns without a registered decoder fall back to [`String`].
#[derive(Clone)]
pub struct Registry {
    codecs: HashMap<(Oid, PgFormat), Codec>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry with all built-in codecs.
    pub fn new() -> Self {
        let mut me = Self::empty();
        crate::types::register_builtins(&mut me);
        me
    }

    /// Registry without any codec, only the text fallback applies.
    pub fn empty() -> Self {
        Self { codecs: HashMap::new() }
    }

    /// Register raw codec functions, replacing any existing one.
    pub fn register<E, D>(&mut self, oid: Oid, format: PgFormat, encode: E, decode: D)
    where
        E: Fn(&dyn Any, &mut BytesMut) -> Result<(), CodecError> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<Value, CodecError> + Send + Sync + 'static,
    {
        self.codecs.insert((oid, format), Codec {
            encode: Some(Arc::new(encode)),
            decode: Some(Arc::new(decode)),
        });
    }

    /// Register a typed codec.
    ///
    /// The encoder is chained in front of any existing encoder for the same key, so several
    /// rust types can encode into one postgres type. The decoder replaces the existing one.
    pub fn register_type<T: Any + Send + Sync>(
        &mut self,
        oid: Oid,
        format: PgFormat,
        encode: impl Fn(&T, &mut BytesMut) -> Result<(), CodecError> + Send + Sync + 'static,
        decode: impl Fn(&[u8]) -> Result<T, CodecError> + Send + Sync + 'static,
    ) {
        self.register_encoder(oid, format, encode);
        let codec = self.codecs.entry((oid, format)).or_default();
        codec.decode = Some(Arc::new(move |raw: &[u8]| decode(raw).map(Value::new)));
    }

    /// Register an additional encoder only.
    pub fn register_encoder<T: Any + Send + Sync>(
        &mut self,
        oid: Oid,
        format: PgFormat,
        encode: impl Fn(&T, &mut BytesMut) -> Result<(), CodecError> + Send + Sync + 'static,
    ) {
        let codec = self.codecs.entry((oid, format)).or_default();
        let prev = codec.encode.take();
        codec.encode = Some(Arc::new(move |value: &dyn Any, buf: &mut BytesMut| {
            match value.downcast_ref::<T>() {
                Some(value) => encode(value, buf),
                None => match &prev {
                    Some(prev) => prev(value, buf),
                    None => Err(CodecError::Mismatch { oid }),
                },
            }
        }));
    }

    pub fn can_encode(&self, oid: Oid, format: PgFormat) -> bool {
        self.codecs.get(&(oid, format)).is_some_and(|e| e.encode.is_some())
    }

    /// Returns `true` if a column of given type can be decoded, text always can.
    pub fn can_decode(&self, oid: Oid, format: PgFormat) -> bool {
        format == PgFormat::Text
            || self.codecs.get(&(oid, format)).is_some_and(|e| e.decode.is_some())
    }

    pub fn encode(
        &self,
        oid: Oid,
        format: PgFormat,
        value: &dyn Any,
        buf: &mut BytesMut,
    ) -> Result<(), CodecError> {
        match self.codecs.get(&(oid, format)).and_then(|e| e.encode.as_ref()) {
            Some(encode) => encode(value, buf),
            None => Err(UnsupportedType { oid, format }.into()),
        }
    }

    pub fn decode(&self, oid: Oid, format: PgFormat, raw: &[u8]) -> Result<Value, CodecError> {
        match self.codecs.get(&(oid, format)).and_then(|e| e.decode.as_ref()) {
            Some(decode) => decode(raw),
            None if format == PgFormat::Text => match std::str::from_utf8(raw) {
                Ok(text) => Ok(Value::new(text.to_owned())),
                Err(_) => Err(CodecError::invalid(oid, "text value is not utf8")),
            },
            None => Err(UnsupportedType { oid, format }.into()),
        }
    }

    /// Format to request for a column, `preferred` when decodable, text otherwise.
    pub(crate) fn result_format(&self, oid: Oid, preferred: PgFormat) -> PgFormat {
        match self.can_decode(oid, preferred) {
            true => preferred,
            false => PgFormat::Text,
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("codecs", &self.codecs.len()).finish()
    }
}

/// Type-erased decoded value.
pub struct Value(Box<dyn Any + Send + Sync>);

impl Value {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Take the inner value, returns self back if the type does not match.
    pub fn downcast<T: Any>(self) -> Result<T, Value> {
        match self.0.downcast::<T>() {
            Ok(ok) => Ok(*ok),
            Err(inner) => Err(Value(inner)),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Value(..)")
    }
}

/// A query parameter.
pub struct Param {
    oid: Oid,
    value: Option<Box<dyn Any + Send + Sync>>,
    type_name: &'static str,
}

impl Param {
    /// Parameter typed by its [`PgType`].
    pub fn new<T: PgType + Any + Send + Sync>(value: T) -> Self {
        Self::with_oid(T::OID, value)
    }

    /// Parameter with explicit oid, for types without [`PgType`] or to override it.
    pub fn with_oid<T: Any + Send + Sync>(oid: Oid, value: T) -> Self {
        Self { oid, value: Some(Box::new(value)), type_name: type_name::<T>() }
    }

    /// `NULL` parameter of given type.
    pub fn null(oid: Oid) -> Self {
        Self { oid, value: None, type_name: "NULL" }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// Encode using binary when the registry can, text otherwise.
    ///
    /// A value whose rust type is only known to the text encoders of its oid is sent as text.
    fn encode(&self, registry: &Registry, buf: &mut BytesMut) -> Result<(PgFormat, Option<Bytes>), CodecError> {
        let binary = registry.can_encode(self.oid, PgFormat::Binary);
        let Some(value) = &self.value else {
            let format = if binary { PgFormat::Binary } else { PgFormat::Text };
            return Ok((format, None));
        };
        if binary {
            match registry.encode(self.oid, PgFormat::Binary, value.as_ref(), buf) {
                Ok(()) => return Ok((PgFormat::Binary, Some(buf.split().freeze()))),
                Err(CodecError::Mismatch { .. }) if registry.can_encode(self.oid, PgFormat::Text) => buf.clear(),
                Err(err) => return Err(err),
            }
        }
        registry.encode(self.oid, PgFormat::Text, value.as_ref(), buf)?;
        Ok((PgFormat::Text, Some(buf.split().freeze())))
    }

    /// Encode using the binary codec only, `COPY ... (FORMAT binary)` has no per column format.
    pub(crate) fn encode_binary(&self, registry: &Registry, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        let Some(value) = &self.value else {
            return Ok(None);
        };
        registry
            .encode(self.oid, PgFormat::Binary, value.as_ref(), buf)
            .map_err(|err| Error::from(err).with_context(format!("copy value ({})", self.type_name)))?;
        Ok(Some(buf.split().freeze()))
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("oid", &self.oid)
            .field("type", &self.type_name)
            .finish()
    }
}

/// Parameters encoded for `Parse` and `Bind`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Encoded {
    pub(crate) oids: Vec<Oid>,
    pub(crate) formats: Vec<PgFormat>,
    pub(crate) values: Vec<Option<Bytes>>,
}

impl Encoded {
    /// Encode all parameters up front, nothing is sent when any of them fails.
    pub(crate) fn new(params: &[Param], registry: &Registry) -> Result<Self> {
        if params.len() > usize::from(u16::MAX) {
            return Err(ProtocolError::too_large("parameter count", params.len()).into());
        }
        let mut buf = BytesMut::new();
        let mut total = 0usize;
        let mut me = Self {
            oids: Vec::with_capacity(params.len()),
            formats: Vec::with_capacity(params.len()),
            values: Vec::with_capacity(params.len()),
        };
        for (i, param) in params.iter().enumerate() {
            let (format, value) = param.encode(registry, &mut buf).map_err(|err| {
                Error::from(err).with_context(format!("parameter ${} ({})", i + 1, param.type_name))
            })?;
            // length prefix and format code
            total += 6 + value.as_ref().map(Bytes::len).unwrap_or(0);
            check_len("bind message", total)?;
            me.oids.push(param.oid);
            me.formats.push(format);
            me.values.push(value);
        }
        Ok(me)
    }
}

/// Type not registered in the [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsupportedType {
    pub oid: Oid,
    pub format: PgFormat,
}

impl std::error::Error for UnsupportedType { }

impl fmt::Display for UnsupportedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no {:?} codec registered for oid {}", self.format, self.oid)
    }
}

/// An error from a registered codec.
pub enum CodecError {
    /// No codec for the type and format.
    Unsupported(UnsupportedType),
    /// The encoder does not accept the given rust type.
    Mismatch { oid: Oid },
    /// Malformed value.
    Invalid { oid: Oid, reason: Cow<'static, str> },
}

impl CodecError {
    pub fn invalid(oid: Oid, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Invalid { oid, reason: reason.into() }
    }
}

impl From<UnsupportedType> for CodecError {
    fn from(value: UnsupportedType) -> Self {
        Self::Unsupported(value)
    }
}

impl std::error::Error for CodecError { }

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(e) => e.fmt(f),
            Self::Mismatch { oid } => write!(f, "encoder for oid {oid} does not accept this value"),
            Self::Invalid { oid, reason } => write!(f, "invalid value for oid {oid}: {reason}"),
        }
    }
}

impl fmt::Debug for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ErrorKind, postgres::oid};

    #[test]
    fn text_fallback() {
        let registry = Registry::empty();
        let value = registry.decode(oid::UUID, PgFormat::Text, b"a0ee").unwrap();
        assert_eq!(value.downcast::<String>().unwrap(), "a0ee");

        let err = registry.decode(oid::UUID, PgFormat::Binary, &[0; 16]).unwrap_err();
        assert!(matches!(err, CodecError::Unsupported(UnsupportedType { oid: oid::UUID, .. })));
    }

    #[test]
    fn chained_encoders() {
        let mut registry = Registry::empty();
        registry.register_encoder::<i32>(oid::INT8, PgFormat::Binary, |v, buf| {
            buf.extend_from_slice(&i64::from(*v).to_be_bytes());
            Ok(())
        });
        registry.register_encoder::<i64>(oid::INT8, PgFormat::Binary, |v, buf| {
            buf.extend_from_slice(&v.to_be_bytes());
            Ok(())
        });

        let mut buf = BytesMut::new();
        registry.encode(oid::INT8, PgFormat::Binary, &7i32, &mut buf).unwrap();
        registry.encode(oid::INT8, PgFormat::Binary, &7i64, &mut buf).unwrap();
        assert_eq!(&buf[..8], &buf[8..]);

        let err = registry.encode(oid::INT8, PgFormat::Binary, &"7", &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Mismatch { oid: oid::INT8 }));
    }

    #[test]
    fn encode_failure_names_the_parameter() {
        let registry = Registry::new();
        let params = [Param::new(1i32), Param::with_oid(oid::UUID, [0u8; 16])];
        let err = Encoded::new(&params, &registry).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnsupportedType(_)));
        assert!(err.to_string().starts_with("parameter $2"));
    }

    #[test]
    fn null_param_keeps_oid() {
        let registry = Registry::new();
        let encoded = Encoded::new(&[Param::null(oid::INT4)], &registry).unwrap();
        assert_eq!(encoded.oids, [oid::INT4]);
        assert_eq!(encoded.values, [None]);
    }

    #[test]
    fn result_format_falls_back_to_text() {
        let registry = Registry::new();
        assert_eq!(registry.result_format(oid::INT4, PgFormat::Binary), PgFormat::Binary);
        assert_eq!(registry.result_format(oid::UUID, PgFormat::Binary), PgFormat::Text);
    }

    #[test]
    fn text_encoder_of_another_type() {
        let mut registry = Registry::new();
        #[derive(Debug)]
        struct Version(u16, u16);
        registry.register_encoder::<Version>(oid::TEXT, PgFormat::Text, |v, buf| {
            buf.extend_from_slice(format!("{}.{}", v.0, v.1).as_bytes());
            Ok(())
        });
        assert!(registry.can_encode(oid::TEXT, PgFormat::Binary));

        let params = [Param::with_oid(oid::TEXT, Version(16, 4)), Param::new("foo")];
        let encoded = Encoded::new(&params, &registry).unwrap();
        assert_eq!(encoded.formats, [PgFormat::Text, PgFormat::Binary]);
        assert_eq!(encoded.values[0].as_deref(), Some(&b"16.4"[..]));
        assert_eq!(encoded.values[1].as_deref(), Some(&b"foo"[..]));

        // no encoder of either format takes the type
        let err = Encoded::new(&[Param::with_oid(oid::INT4, Version(1, 0))], &registry).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Codec(_)));
    }

    #[test]
    fn too_many_parameters() {
        let registry = Registry::new();
        let params = (0..=u16::MAX as usize).map(|_| Param::null(oid::INT4)).collect::<Vec<_>>();
        let err = Encoded::new(&params, &registry).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(ProtocolError::TooLarge { .. })));
        assert!(!err.is_fatal());

        Encoded::new(&params[1..], &registry).unwrap();
    }
}
