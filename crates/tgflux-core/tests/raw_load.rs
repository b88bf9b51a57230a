use std::env;
use std::path::Path;

use anyhow::Result;
use tgflux_core::{
    db,
    layout::DataLayout,
    loader::{load_raw_messages, FileStatus},
};
use tokio::runtime::Runtime;

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../tgflux-parser/tests/data")
        .join(name);
    std::fs::read_to_string(path).expect("read fixture")
}

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

async fn row_count(pool: &db::DbPool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM raw_telegram_messages")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[test]
fn raw_load_is_idempotent_and_keyed_per_channel() -> Result<()> {
    let database_url = match env::var("TGFLUX_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping raw load integration test because TGFLUX_TEST_DATABASE_URL is not set");
            return Ok(());
        }
    };

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = db::connect_url(&database_url).await?;
        db::run_migrations(&pool).await?;
        sqlx::query("TRUNCATE TABLE raw_telegram_messages, loaded_channel_files")
            .execute(&pool)
            .await?;

        let data = tempfile::tempdir()?;
        let layout = DataLayout::new(data.path().join("data"), data.path().join("logs"));
        let messages = layout.messages_dir();
        write(&messages, "2025-03-14/CheMed123.json", &fixture("CheMed123.json"));
        write(
            &messages,
            "2025-03-14/tikvahpharma.json",
            r#"[{"id": 1, "message": "Insulin pens", "date": "2025-03-14T06:00:00+00:00", "sender_id": 9}]"#,
        );
        write(
            &messages,
            "2025-03-14/tenamereja.json",
            r#"[{"id": 1, "message": "Blood pressure monitor", "date": "2025-03-14 07:30:00"}]"#,
        );
        write(&messages, "2025-03-14/lobelia4cosmetics.json", "  \n");
        write(&messages, "2025-03-13/broken.json", "[{\"id\": ");

        let first = load_raw_messages(&pool, &layout).await?;
        assert_eq!(first.count(FileStatus::Parsed), 3);
        assert_eq!(first.count(FileStatus::Empty), 1);
        assert_eq!(first.count(FileStatus::Malformed), 1);
        assert_eq!(first.inserted, 5);
        assert_eq!(row_count(&pool).await?, 5);

        let (shared_id,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM raw_telegram_messages WHERE id = 1")
                .fetch_one(&pool)
                .await?;
        assert_eq!(shared_id, 2);

        let (sender,): (Option<i64>,) = sqlx::query_as(
            "SELECT sender_id FROM raw_telegram_messages WHERE channel = 'CheMed123' AND id = 1041",
        )
        .fetch_one(&pool)
        .await?;
        assert_eq!(sender, Some(5512345));

        let second = load_raw_messages(&pool, &layout).await?;
        assert_eq!(second.count(FileStatus::Duplicate), 3);
        assert_eq!(second.inserted, 0);
        assert_eq!(row_count(&pool).await?, 5);

        // A later scrape overlapping earlier messages only adds the new ones.
        write(
            &messages,
            "2025-03-15/tikvahpharma.json",
            r#"[{"id": 2, "message": "Syringes"}, {"id": 1, "message": "Insulin pens"}]"#,
        );
        let third = load_raw_messages(&pool, &layout).await?;
        assert_eq!(third.records, 2);
        assert_eq!(third.inserted, 1);
        assert_eq!(third.duplicates, 1);
        assert_eq!(row_count(&pool).await?, 6);

        sqlx::query("TRUNCATE TABLE raw_telegram_messages, loaded_channel_files")
            .execute(&pool)
            .await?;
        Ok(())
    })
}
