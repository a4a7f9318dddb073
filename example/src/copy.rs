use pgsession::{
    Connection, Result, execute,
    codec::Param,
    copy::{copy_from, copy_in, copy_out},
};

pub async fn main() -> Result<()> {
    let mut conn = Connection::connect_env().await?;

    execute("CREATE TEMP TABLE copied(id int, name text)", &mut conn).await?;

    let mut copy = copy_in("COPY copied(id, name) FROM STDIN", &mut conn).await?;
    copy.send(b"1\tfoo\n").await?;
    copy.send(b"2\tbar\n").await?;
    assert_eq!(copy.finish().await?, 2);

    let rows = (3..100).map(|id| vec![Param::new(id), Param::new(format!("row{id}"))]);
    let copied = copy_from("copied", &["id", "name"], rows, &mut conn).await?;
    assert_eq!(copied, 97);

    let mut out = copy_out("COPY copied TO STDOUT", &mut conn).await?;
    let mut lines = 0;
    while let Some(chunk) = out.next().await {
        chunk?;
        lines += 1;
    }
    assert_eq!(lines, 99);

    Ok(())
}
