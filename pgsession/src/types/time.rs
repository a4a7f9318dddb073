//! `time` crate codecs.
//!
//! - `timestamp` as [`PrimitiveDateTime`], text and binary
//! - `timestamptz` as [`UtcDateTime`], binary, text encode only since the text output
//!   depends on the session `TimeZone`
//! - `date` as [`Date`], text and binary
use time::{
    Date, Duration, PrimitiveDateTime, Time, UtcDateTime,
    format_description::{BorrowedFormatItem as I, Component as C, modifier},
};

use super::fixed;
use crate::{
    codec::{CodecError, Registry},
    postgres::{Oid, PgFormat, PgType, oid},
};

impl PgType for PrimitiveDateTime {
    const OID: Oid = oid::TIMESTAMP;
}

impl PgType for UtcDateTime {
    const OID: Oid = oid::TIMESTAMPTZ;
}

impl PgType for Date {
    const OID: Oid = oid::DATE;
}

// 2000-01-01
const PG_EPOCH_DATE: Date = match Date::from_julian_day(2_451_545) {
    Ok(ok) => ok,
    Err(_) => panic!("postgres epoch is a valid julian day"),
};

const PG_EPOCH: PrimitiveDateTime = PrimitiveDateTime::new(PG_EPOCH_DATE, Time::MIDNIGHT);

const DATE: &[I<'_>] = &[
    I::Component(C::Year(modifier::Year::default())),
    I::Literal(b"-"),
    I::Component(C::Month(modifier::Month::default())),
    I::Literal(b"-"),
    I::Component(C::Day(modifier::Day::default())),
];

const TIMESTAMP: &[I<'_>] = &[
    I::Compound(DATE),
    I::Literal(b" "),
    I::Component(C::Hour(modifier::Hour::default())),
    I::Literal(b":"),
    I::Component(C::Minute(modifier::Minute::default())),
    I::Literal(b":"),
    I::Component(C::Second(modifier::Second::default())),
    I::Optional(&I::Compound(&[
        I::Literal(b"."),
        I::Component(C::Subsecond(modifier::Subsecond::default())),
    ])),
];

const TIMESTAMPTZ: &[I<'_>] = &[I::Compound(TIMESTAMP), I::Literal(b"+00")];

fn micros(ts: PrimitiveDateTime) -> Result<i64, CodecError> {
    i64::try_from((ts - PG_EPOCH).whole_microseconds())
        .map_err(|_| CodecError::invalid(oid::TIMESTAMP, "timestamp out of range"))
}

fn from_micros(oid: Oid, raw: &[u8]) -> Result<PrimitiveDateTime, CodecError> {
    let micros = i64::from_be_bytes(fixed(oid, raw)?);
    PG_EPOCH
        .checked_add(Duration::microseconds(micros))
        .ok_or_else(|| CodecError::invalid(oid, "timestamp out of range"))
}

fn utc(ts: &UtcDateTime) -> PrimitiveDateTime {
    PrimitiveDateTime::new(ts.date(), ts.time())
}

fn text(
    oid: Oid,
    format: &[I<'_>],
    value: impl FnOnce(&[I<'_>]) -> Result<String, time::error::Format>,
    buf: &mut bytes::BytesMut,
) -> Result<(), CodecError> {
    let text = value(format).map_err(|e| CodecError::invalid(oid, e.to_string()))?;
    buf.extend_from_slice(text.as_bytes());
    Ok(())
}

pub(super) fn register(registry: &mut Registry) {
    registry.register_type::<PrimitiveDateTime>(
        oid::TIMESTAMP,
        PgFormat::Binary,
        |v, buf| {
            buf.extend_from_slice(&micros(*v)?.to_be_bytes());
            Ok(())
        },
        |raw| from_micros(oid::TIMESTAMP, raw),
    );
    registry.register_type::<PrimitiveDateTime>(
        oid::TIMESTAMP,
        PgFormat::Text,
        |v, buf| text(oid::TIMESTAMP, TIMESTAMP, |f| v.format(f), buf),
        |raw| {
            let raw = super::utf8(oid::TIMESTAMP, raw)?;
            PrimitiveDateTime::parse(raw, TIMESTAMP)
                .map_err(|e| CodecError::invalid(oid::TIMESTAMP, e.to_string()))
        },
    );

    registry.register_type::<UtcDateTime>(
        oid::TIMESTAMPTZ,
        PgFormat::Binary,
        |v, buf| {
            buf.extend_from_slice(&micros(utc(v))?.to_be_bytes());
            Ok(())
        },
        |raw| from_micros(oid::TIMESTAMPTZ, raw).map(|ts| UtcDateTime::new(ts.date(), ts.time())),
    );
    registry.register_encoder::<UtcDateTime>(oid::TIMESTAMPTZ, PgFormat::Text, |v, buf| {
        text(oid::TIMESTAMPTZ, TIMESTAMPTZ, |f| utc(v).format(f), buf)
    });

    registry.register_type::<Date>(
        oid::DATE,
        PgFormat::Binary,
        |v, buf| {
            let days = v.to_julian_day() - PG_EPOCH_DATE.to_julian_day();
            buf.extend_from_slice(&days.to_be_bytes());
            Ok(())
        },
        |raw| {
            let days = i32::from_be_bytes(fixed(oid::DATE, raw)?);
            PG_EPOCH_DATE
                .checked_add(Duration::days(days.into()))
                .ok_or_else(|| CodecError::invalid(oid::DATE, "date out of range"))
        },
    );
    registry.register_type::<Date>(
        oid::DATE,
        PgFormat::Text,
        |v, buf| text(oid::DATE, DATE, |f| v.format(f), buf),
        |raw| {
            let raw = super::utf8(oid::DATE, raw)?;
            Date::parse(raw, DATE).map_err(|e| CodecError::invalid(oid::DATE, e.to_string()))
        },
    );
}
