use pgsession::{
    Config, Connection, Decode, DecodeError, Result, query,
    codec::{Registry, Value},
    row::downcast,
};
use serde::{Deserialize, Serialize};
use time::{PrimitiveDateTime, UtcDateTime};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Foo {
    id: i32,
}

impl Decode for Foo {
    fn decode(value: Option<Value>) -> Result<Self, DecodeError> {
        downcast(value)
    }
}

pub async fn main() -> Result<()> {
    // replaces the `serde_json::Value` decoder of `json` and `jsonb`
    let mut registry = Registry::new();
    registry.register_json::<Foo>();
    let config = Config::from_env().registry(registry);
    let mut conn = Connection::connect(&config).await?;

    let (null,): (Option<String>,) = query("SELECT NULL::TEXT", &mut conn).fetch_one().await?;

    assert!(null.is_none());

    // `time`

    let now_utc = UtcDateTime::now().replace_millisecond(0).unwrap();
    let (local, utc): (PrimitiveDateTime, UtcDateTime) =
        query("SELECT now()::TIMESTAMP,now()::TIMESTAMPTZ", &mut conn)
            .fetch_one()
            .await?;

    assert_eq!(
        (local.month(), local.minute(), local.second()),
        (now_utc.month(), now_utc.minute(), now_utc.second()),
    );
    assert_eq!(utc.replace_millisecond(0).unwrap(), now_utc);

    // `json`

    let (foo,): (Foo,) = query("SELECT '{\"id\":420}'::jsonb", &mut conn)
        .fetch_one()
        .await?;

    assert_eq!(foo, Foo { id: 420 });

    Ok(())
}
