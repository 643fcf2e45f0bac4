//! Direct streaming against the staged path, mixed DAT grammars

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{catalog, sorted_rows, write_many, Workspace, CORRUPT};
use datforge_ingest::{IngestStrategy, RunSummary};

const CMP_CATALOG: &str = r#"clrmamepro (
	name "Sinclair ZX Spectrum - Games"
)

game (
	name "Game A (1990)(Publisher)"
	rom ( name "Game A (1990)(Publisher).tzx" size 48912 crc 1A2B3C4D sha1 ABC123 )
)
"#;

#[tokio::test]
async fn direct_and_staged_produce_the_same_table() {
    let ws = Workspace::new();
    let mut files = write_many(&ws, "Amstrad CPC", 15);
    files.push(ws.write("Spectrum/Sinclair ZX Spectrum - Games.dat", CMP_CATALOG));
    files.push(ws.write("Spectrum/broken.dat", CORRUPT));

    let staged = ws.pipeline("staged").await;
    staged.run(files.clone()).await.unwrap();

    let direct_config = ws
        .config("direct")
        .with_strategy(IngestStrategy::Direct)
        .with_batch_size(4);
    let direct = ws.pipeline_with(direct_config).await;
    let RunSummary::Direct(summary) = direct.run(files).await.unwrap() else {
        panic!("expected a direct run");
    };

    assert_eq!(summary.files_failed, 1);
    assert_eq!(summary.rows_inserted, 16);
    assert_eq!(summary.batches, 4);
    assert!(summary.failures[0].path.ends_with("broken.dat"));
    assert_eq!(sorted_rows(&direct).await, sorted_rows(&staged).await);

    // no checkpoints are written on the direct path
    assert_eq!(direct.status().await.unwrap().checkpoints.total(), 0);
}

#[tokio::test]
async fn direct_rerun_is_idempotent() {
    let ws = Workspace::new();
    let path = ws.write(
        "Amiga/a.dat",
        &catalog("Game A", &[("a.adf", "abc123"), ("b.adf", "def456")]),
    );
    let config = ws.config("state").with_strategy(IngestStrategy::Direct);
    let pipeline = ws.pipeline_with(config).await;

    pipeline.run(vec![path.clone()]).await.unwrap();
    let RunSummary::Direct(second) = pipeline.run(vec![path]).await.unwrap() else {
        panic!("expected a direct run");
    };

    assert_eq!(second.files_parsed, 1);
    assert_eq!(second.rows_inserted, 0);
    assert_eq!(second.rows_ignored, 2);
    assert_eq!(pipeline.destination().row_count().await.unwrap(), 2);
}
