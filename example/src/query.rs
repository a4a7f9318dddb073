use futures::StreamExt;
use pgsession::{
    Connection, IsolationLevel, Result, SqlExt, TxOptions, begin, begin_with, execute, prepare, query,
    query_row,
    postgres::PgFormat,
    query::{Pipeline, simple_query},
};

pub async fn main() -> Result<()> {
    let mut conn = Connection::connect_env().await?;

    // Execute

    execute("CREATE TEMP TABLE post(id serial, name text)", &mut conn).await?;

    let affected = execute("INSERT INTO post(name) VALUES($1)", &mut conn)
        .bind("Deez")
        .await?;

    execute("INSERT INTO post(name) VALUES('Foo')", &mut conn).await?;

    assert_eq!(affected, 1);

    // Queries

    let datas = query::<_, _, (i32, String)>("SELECT * FROM post", &mut conn)
        .fetch_all()
        .await?;

    assert_eq!(datas.len(), 2);

    let (_id, name) = query::<_, _, (i32, String)>("SELECT * FROM post LIMIT 1", &mut conn)
        .fetch_one()
        .await?;

    assert_eq!(name.as_str(), "Deez");

    let data = query::<_, _, (i32, String)>("SELECT * FROM post LIMIT 0", &mut conn)
        .fetch_optional()
        .await?;

    assert!(data.is_none());

    let mut stream = query::<_, _, (i32, String)>("SELECT * FROM post", &mut conn)
        .fetch_size(1)
        .fetch();

    while let Some(row) = stream.next().await {
        let (_id, _name) = row?;
    }
    drop(stream);

    let mut total = 0;
    let affected = query::<_, _, (i32,)>("SELECT id FROM post", &mut conn)
        .for_each_row(|(id,)| {
            total += id;
            Ok(())
        })
        .await?;
    assert_eq!(affected, 2);
    assert_eq!(total, 3);

    let rows = query_row("SELECT * FROM post", &mut conn)
        .result_format(PgFormat::Text)
        .fetch_all()
        .await?;

    assert_eq!(rows[0].try_get::<_, String>("name").unwrap(), "Deez");

    // not kept in the statement cache
    execute("DELETE FROM post WHERE id = $1".once(), &mut conn).bind(42).await?;

    let results = simple_query("SELECT 1; SELECT 2", &mut conn).await?;
    assert_eq!(results.len(), 2);

    // Pipeline

    let mut pipeline = Pipeline::new();
    pipeline
        .add("INSERT INTO post(name) VALUES('Bar')", vec![])
        .add("SELECT name FROM post", vec![]);
    let results = pipeline.send(&mut conn).collect().await;
    assert_eq!(results[1].as_ref().unwrap().rows.len(), 3);

    // Transaction

    let mut tx = begin(&mut conn).await?;
    execute("INSERT INTO post(name) VALUES('Foo')", &mut tx).await?;

    let mut savepoint = begin(&mut tx).await?;
    execute("INSERT INTO post(id) VALUES('not a number')", &mut savepoint).await.unwrap_err();
    savepoint.rollback().await?;
    drop(savepoint);

    tx.commit().await?;
    drop(tx);

    let options = TxOptions::new().isolation(IsolationLevel::RepeatableRead).read_only(true);
    let mut tx = begin_with(options, &mut conn).await?;
    let count = query::<_, _, (i64,)>("SELECT count(*) FROM post", &mut tx).fetch_one().await?;
    println!("{} posts", count.0);
    tx.commit().await?;
    drop(tx);

    // Prepare

    let stmt = prepare("SELECT name FROM post WHERE id = $1", &mut conn).await?;
    println!("{} expects {:?}", stmt.name(), stmt.params());

    // Error case

    execute("SELECT foo", &mut conn).await.unwrap_err();

    let _err = query::<_, _, (i32, String)>("SELECT * FROM post LIMIT 0", &mut conn)
        .fetch_one()
        .await
        .unwrap_err();

    assert!(conn.is_healthy());

    Ok(())
}
