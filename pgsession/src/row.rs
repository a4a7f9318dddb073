//! Postgres row operation.
//!
//! - [`Row`]
//! - [`Column`]
//! - [`FromRow`]
//! - [`Decode`]
//!
//! - [`Index`]
//! - [`DecodeError`]
use bytes::Bytes;
use std::{any::{Any, type_name}, borrow::Cow, fmt, ops::Range, sync::Arc};

use crate::{
    codec::{CodecError, Registry, Value},
    common::{ByteStr, unit_error},
    ext::{BytesExt, FmtExt},
    postgres::{Oid, PgFormat, ProtocolError, backend},
};

/// Column description from `RowDescription`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: ByteStr,
    table_oid: Oid,
    column_id: i16,
    type_oid: Oid,
    type_size: i16,
    type_modifier: i32,
    format: PgFormat,
}

impl Column {
    /// Parse all columns of a `RowDescription`.
    pub(crate) fn parse_description(desc: backend::RowDescription) -> Result<Arc<[Column]>, ProtocolError> {
        let mut body = desc.body;
        (0..desc.field_len)
            .map(|_| {
                Ok(Column {
                    name: body.get_nul_bytestr()?,
                    table_oid: body.try_u32()?,
                    column_id: body.try_i16()?,
                    type_oid: body.try_u32()?,
                    type_size: body.try_i16()?,
                    type_modifier: body.try_i32()?,
                    format: PgFormat::from_code(body.try_u16()?)?,
                })
            })
            .collect()
    }

    /// Replace formats with the ones requested in `Bind`.
    ///
    /// `formats` follows `Bind` convention, empty means all text, one applies to all.
    pub(crate) fn with_formats(columns: &Arc<[Column]>, formats: &[PgFormat]) -> Arc<[Column]> {
        let format_of = |i: usize| match formats {
            [] => PgFormat::Text,
            [one] => *one,
            many => many.get(i).copied().unwrap_or_default(),
        };
        if columns.iter().enumerate().all(|(i, col)| col.format == format_of(i)) {
            return columns.clone();
        }
        columns
            .iter()
            .enumerate()
            .map(|(i, col)| Column { format: format_of(i), ..col.clone() })
            .collect()
    }

    /// Returns column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Oid of the table this column belongs to, `0` for computed column.
    pub fn table_oid(&self) -> Oid {
        self.table_oid
    }

    /// Attribute number of the column in its table, `0` for computed column.
    pub fn column_id(&self) -> i16 {
        self.column_id
    }

    /// Returns column type [`Oid`].
    pub fn type_oid(&self) -> Oid {
        self.type_oid
    }

    pub fn type_size(&self) -> i16 {
        self.type_size
    }

    pub fn type_modifier(&self) -> i32 {
        self.type_modifier
    }

    /// Wire format of the values in this column.
    pub fn format(&self) -> PgFormat {
        self.format
    }
}

/// Postgres row.
///
/// Values are kept raw and decoded through the session [`Registry`] on access, a decode
/// failure only affects the value being read.
pub struct Row {
    columns: Arc<[Column]>,
    registry: Arc<Registry>,
    values: Bytes,
    ranges: Box<[Option<Range<usize>>]>,
}

impl Row {
    /// `DataRow` message
    pub(crate) fn new(
        columns: Arc<[Column]>,
        registry: Arc<Registry>,
        row: backend::DataRow,
    ) -> Result<Self, ProtocolError> {
        if usize::from(row.column_len) != columns.len() {
            return Err(ProtocolError::malformed("DataRow length does not match RowDescription"));
        }

        let mut body = row.body.clone();
        let mut offset = 0;
        let mut ranges = Vec::with_capacity(columns.len());
        for _ in 0..row.column_len {
            let len = body.try_i32()?;
            offset += 4;
            ranges.push(match len {
                -1 => None,
                len if len < 0 => return Err(ProtocolError::malformed("negative value length")),
                len => {
                    let len = len as usize;
                    body.try_split(len)?;
                    offset += len;
                    Some(offset - len..offset)
                }
            });
        }

        Ok(Self {
            columns,
            registry,
            values: row.body,
            ranges: ranges.into_boxed_slice(),
        })
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Returns the number of fields/column.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Raw value bytes, [`None`] if value is `NULL`.
    pub fn get_raw<I: Index>(&self, idx: I) -> Result<Option<&[u8]>, DecodeError> {
        let nth = idx.position(&self.columns)?;
        Ok(self.ranges[nth].clone().map(|range| &self.values[range]))
    }

    /// Decode a value without committing to a rust type, [`None`] if value is `NULL`.
    pub fn try_get_value<I: Index>(&self, idx: I) -> Result<Option<Value>, DecodeError> {
        let nth = idx.position(&self.columns)?;
        let Some(range) = self.ranges[nth].clone() else {
            return Ok(None);
        };
        let col = &self.columns[nth];
        self.registry
            .decode(col.type_oid, col.format, &self.values[range])
            .map(Some)
            .map_err(DecodeError::Codec)
    }

    /// Try get and decode column.
    pub fn try_get<I: Index, R: Decode>(&self, idx: I) -> Result<R, DecodeError> {
        R::decode(self.try_get_value(idx)?)
    }

    /// Try decode type using [`FromRow`] implementation.
    pub fn decode<D: FromRow>(self) -> Result<D, DecodeError> {
        D::from_row(self)
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for (col, range) in self.columns.iter().zip(&self.ranges) {
            dbg.key(&col.name);
            match range {
                None => dbg.value(&format_args!("NULL")),
                Some(range) => dbg.value(&self.values[range.clone()].lossy()),
            };
        }
        dbg.finish()
    }
}

// ===== Traits =====

/// Type that can be constructed from a row.
pub trait FromRow: Sized {
    /// Construct self from row.
    fn from_row(row: Row) -> Result<Self, DecodeError>;
}

impl FromRow for Row {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        Ok(row)
    }
}

impl FromRow for () {
    fn from_row(_: Row) -> Result<Self, DecodeError> {
        Ok(())
    }
}

macro_rules! from_row_tuple {
    ($($t:ident $i:literal),*) => {
        impl<$($t),*> FromRow for ($($t),*,)
        where
            $($t: Decode),*
        {
            fn from_row(row: Row) -> Result<Self, DecodeError> {
                Ok((
                    $(row.try_get($i)?),*,
                ))
            }
        }
    };
}

from_row_tuple!(T0 0);
from_row_tuple!(T0 0, T1 1);
from_row_tuple!(T0 0, T1 1, T2 2);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5, T6 6);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5, T6 6, T7 7);

/// A type that can be taken out of a decoded column value.
///
/// Types registered in the [`Registry`] implement this by downcasting, see [`downcast`].
pub trait Decode: Sized {
    /// `value` is [`None`] for `NULL`.
    fn decode(value: Option<Value>) -> Result<Self, DecodeError>;
}

/// Take a registered type out of a decoded value.
pub fn downcast<T: Any>(value: Option<Value>) -> Result<T, DecodeError> {
    value
        .ok_or(DecodeError::Null)?
        .downcast()
        .map_err(|_| DecodeError::TypeMismatch(type_name::<T>()))
}

impl<T: Decode> Decode for Option<T> {
    fn decode(value: Option<Value>) -> Result<Self, DecodeError> {
        match value {
            None => Ok(None),
            value => T::decode(value).map(Some),
        }
    }
}

impl Decode for Value {
    fn decode(value: Option<Value>) -> Result<Self, DecodeError> {
        value.ok_or(DecodeError::Null)
    }
}

macro_rules! decode_registered {
    ($($ty:ty),* $(,)?) => {$(
        impl Decode for $ty {
            fn decode(value: Option<Value>) -> Result<Self, DecodeError> {
                downcast(value)
            }
        }
    )*};
}

decode_registered!(bool, i16, i32, i64, u32, f32, f64, String, Vec<u8>);

#[cfg(feature = "json")]
decode_registered!(serde_json::Value);

#[cfg(feature = "time")]
decode_registered!(time::PrimitiveDateTime, time::UtcDateTime, time::Date);

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns the nth column.
    fn position(self, columns: &[Column]) -> Result<usize, DecodeError>;
}

impl Index for usize {
    fn position(self, columns: &[Column]) -> Result<usize, DecodeError> {
        match self < columns.len() {
            true => Ok(self),
            false => Err(DecodeError::IndexOutOfBounds(self)),
        }
    }
}

impl Index for &str {
    fn position(self, columns: &[Column]) -> Result<usize, DecodeError> {
        columns
            .iter()
            .position(|col| col.name == self)
            .ok_or_else(|| DecodeError::ColumnNotFound(String::from(self).into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

unit_error! {
    /// An error when try to [`fetch_one`][crate::query::Query::fetch_one] and not returns any row.
    pub struct RowNotFound("row not found");
}

/// An error when decoding row value.
pub enum DecodeError {
    /// Column requested not found.
    ColumnNotFound(Cow<'static,str>),
    /// Index requested is out of bounds.
    IndexOutOfBounds(usize),
    /// Requested rust type is not what the codec produced.
    TypeMismatch(&'static str),
    /// Row is null.
    Null,
    /// Codec failed to decode the value.
    Codec(CodecError),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
            Self::IndexOutOfBounds(u) => write!(f, "index out of bounds: {u:?}"),
            Self::TypeMismatch(ty) => write!(f, "column type does not decode into {ty}"),
            Self::Null => write!(f, "unexpected NULL value"),
            Self::Codec(e) => write!(f, "{e}"),
        }
    }
}

impl From<CodecError> for DecodeError {
    fn from(value: CodecError) -> Self {
        Self::Codec(value)
    }
}

impl std::error::Error for DecodeError { }

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
pub(crate) mod test {
    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::postgres::oid;

    /// `RowDescription` body for `(name, oid)` pairs in text format.
    pub(crate) fn description(fields: &[(&str, Oid)]) -> backend::RowDescription {
        let mut body = BytesMut::new();
        for (name, oid) in fields {
            body.put_slice(name.as_bytes());
            body.put_u8(0);
            body.put_u32(0);
            body.put_i16(0);
            body.put_u32(*oid);
            body.put_i16(-1);
            body.put_i32(-1);
            body.put_u16(0);
        }
        backend::RowDescription { field_len: fields.len() as u16, body: body.freeze() }
    }

    pub(crate) fn data_row(values: &[Option<&[u8]>]) -> backend::DataRow {
        let mut body = BytesMut::new();
        for value in values {
            match value {
                Some(value) => {
                    body.put_i32(value.len() as i32);
                    body.put_slice(value);
                }
                None => body.put_i32(-1),
            }
        }
        backend::DataRow { column_len: values.len() as u16, body: body.freeze() }
    }

    fn row() -> Row {
        let columns = Column::parse_description(description(&[
            ("id", oid::INT4),
            ("name", oid::TEXT),
            ("note", oid::TEXT),
        ]))
        .unwrap();
        let row = data_row(&[Some(b"42"), Some(b"foo"), None]);
        Row::new(columns, Arc::new(Registry::new()), row).unwrap()
    }

    #[test]
    fn get_by_index_and_name() {
        let row = row();
        assert_eq!(row.try_get::<_, i32>(0).unwrap(), 42);
        assert_eq!(row.try_get::<_, String>("name").unwrap(), "foo");
        assert_eq!(row.try_get::<_, Option<String>>("note").unwrap(), None);
        assert_eq!(row.get_raw(1).unwrap(), Some(&b"foo"[..]));
    }

    #[test]
    fn decode_errors_are_scoped_to_the_value() {
        let row = row();
        assert!(matches!(row.try_get::<_, String>("note"), Err(DecodeError::Null)));
        assert!(matches!(row.try_get::<_, i64>(0), Err(DecodeError::TypeMismatch(_))));
        assert!(matches!(row.try_get::<_, i32>(9), Err(DecodeError::IndexOutOfBounds(9))));
        assert!(matches!(row.try_get::<_, i32>("nope"), Err(DecodeError::ColumnNotFound(_))));
        // the row is still usable afterwards
        assert_eq!(row.try_get::<_, i32>("id").unwrap(), 42);
    }

    #[test]
    fn tuple_from_row() {
        let (id, name, note) = row().decode::<(i32, String, Option<String>)>().unwrap();
        assert_eq!((id, name.as_str(), note), (42, "foo", None));
    }

    #[test]
    fn column_count_mismatch() {
        let columns = Column::parse_description(description(&[("id", oid::INT4)])).unwrap();
        let row = data_row(&[Some(b"1"), Some(b"2")]);
        assert!(Row::new(columns, Arc::new(Registry::new()), row).is_err());
    }

    #[test]
    fn formats_follow_bind_convention() {
        let columns = Column::parse_description(description(&[
            ("a", oid::INT4),
            ("b", oid::UUID),
        ]))
        .unwrap();
        let same = Column::with_formats(&columns, &[]);
        assert!(Arc::ptr_eq(&same, &columns));

        let binary = Column::with_formats(&columns, &[PgFormat::Binary, PgFormat::Text]);
        assert_eq!(binary[0].format(), PgFormat::Binary);
        assert_eq!(binary[1].format(), PgFormat::Text);
    }
}
