//! End-to-end tests of the pipeline against SQLite database files.
//!
//! Each test creates its own source and destination databases in a
//! temporary directory.

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use sales_etl::pipeline::{EtlPipeline, PipelineConfig, RunState};
use sales_etl::scheduler::{DagDefinition, DagRunStatus, LocalOrchestrator, Orchestrator, RetryPolicy, TaskStatus};
use sales_etl::StageError;
use sqlx::{Connection, SqliteConnection};
use tempfile::TempDir;

const SOURCE_DDL: &str = "CREATE TABLE SALES_TRANSACTIONS (
    TRANSACTION_ID INTEGER PRIMARY KEY,
    CUSTOMER_ID TEXT NOT NULL,
    AMOUNT TEXT NOT NULL,
    TRANSACTION_DATE TEXT NOT NULL,
    CHANNEL TEXT
)";

const DEST_DDL: &str = "CREATE TABLE ANALYTICS_TRANSACTIONS (
    TRANSACTION_ID INTEGER PRIMARY KEY,
    CUSTOMER_ID TEXT NOT NULL,
    AMOUNT TEXT NOT NULL,
    TRANSACTION_DATE TEXT NOT NULL,
    CATEGORY TEXT NOT NULL
)";

struct Fixture {
    dir: TempDir,
    source_url: String,
    dest_url: String,
}

impl Fixture {
    async fn new(source_rows: &[(i64, &str, &str, &str)]) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let source_url = sqlite_url(&dir.path().join("source.db"));
        let dest_url = sqlite_url(&dir.path().join("dest.db"));

        let mut conn = SqliteConnection::connect(&source_url).await.unwrap();
        sqlx::query(SOURCE_DDL).execute(&mut conn).await.unwrap();
        for (id, customer, amount, date) in source_rows {
            sqlx::query("INSERT INTO SALES_TRANSACTIONS VALUES (?, ?, ?, ?, 'web')")
                .bind(id)
                .bind(customer)
                .bind(amount)
                .bind(date)
                .execute(&mut conn)
                .await
                .unwrap();
        }
        conn.close().await.unwrap();

        let mut conn = SqliteConnection::connect(&dest_url).await.unwrap();
        sqlx::query(DEST_DDL).execute(&mut conn).await.unwrap();
        conn.close().await.unwrap();

        Self {
            dir,
            source_url,
            dest_url,
        }
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig::new(&self.source_url, &self.dest_url)
            .unwrap()
            .with_batch_size(2)
            .with_retry(
                RetryPolicy::default()
                    .with_initial_delay(Duration::from_millis(10))
                    .with_max_delay(Duration::from_millis(20)),
            )
    }

    async fn dest_rows(&self) -> Vec<(i64, String, String, String, String)> {
        let mut conn = SqliteConnection::connect(&self.dest_url).await.unwrap();
        let rows = sqlx::query_as(
            "SELECT TRANSACTION_ID, CUSTOMER_ID, AMOUNT, TRANSACTION_DATE, CATEGORY
             FROM ANALYTICS_TRANSACTIONS ORDER BY TRANSACTION_ID",
        )
        .fetch_all(&mut conn)
        .await
        .unwrap();
        conn.close().await.unwrap();
        rows
    }

    async fn execute_on_dest(&self, sql: &str) {
        let mut conn = SqliteConnection::connect(&self.dest_url).await.unwrap();
        sqlx::query(sql).execute(&mut conn).await.unwrap();
        conn.close().await.unwrap();
    }
}

fn sqlite_url(path: &Path) -> String {
    format!("sqlite://{}?mode=rwc", path.display())
}

fn sample_rows() -> Vec<(i64, &'static str, &'static str, &'static str)> {
    vec![
        (1, "abc", "50", "2024-01-01 09:00:00"),
        (2, "def", "250.00", "2024-01-01 10:00:00"),
        (3, "ghi", "500", "2024-01-01 11:00:00"),
        (4, "jkl", "-10", "2024-01-01 12:00:00"),
        (5, "MnO", "0", "2024-01-01 13:00:00"),
    ]
}

#[tokio::test]
async fn test_run_once_loads_categorized_rows() {
    let fx = Fixture::new(&sample_rows()).await;
    let summary = EtlPipeline::new(fx.config()).run_once().await.unwrap();

    assert_eq!(summary.extracted, 5);
    assert_eq!(summary.transformed, 3);
    assert_eq!(summary.load.rows_inserted, 3);
    assert_eq!(summary.load.batches, 2);
    assert_eq!(summary.state, RunState::Loaded);

    let rows = fx.dest_rows().await;
    assert_eq!(
        rows,
        vec![
            (1, "ABC".into(), "50".into(), "2024-01-01 09:00:00".into(), "LOW".into()),
            (2, "DEF".into(), "250.00".into(), "2024-01-01 10:00:00".into(), "MEDIUM".into()),
            (3, "GHI".into(), "500".into(), "2024-01-01 11:00:00".into(), "HIGH".into()),
        ]
    );
}

#[tokio::test]
async fn test_empty_source_commits_nothing() {
    let fx = Fixture::new(&[]).await;
    let summary = EtlPipeline::new(fx.config()).run_once().await.unwrap();

    assert_eq!(summary.extracted, 0);
    assert_eq!(summary.load.rows_inserted, 0);
    assert_eq!(summary.load.batches, 0);
    assert!(fx.dest_rows().await.is_empty());
}

#[tokio::test]
async fn test_failed_load_rolls_back_everything() {
    let fx = Fixture::new(&sample_rows()).await;
    // Row 3 already exists, so the second batch hits a primary key conflict.
    fx.execute_on_dest(
        "INSERT INTO ANALYTICS_TRANSACTIONS VALUES (3, 'OLD', '1', '2023-12-31 00:00:00', 'LOW')",
    )
    .await;

    let err = EtlPipeline::new(fx.config()).run_once().await.unwrap_err();
    assert!(matches!(err, StageError::Load { .. }));
    assert!(err.to_string().contains("rows 2-2"));

    let rows = fx.dest_rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, "OLD");
}

#[tokio::test]
async fn test_unreachable_source_fails_extract() {
    let fx = Fixture::new(&sample_rows()).await;
    let missing = format!(
        "sqlite://{}?mode=ro",
        fx.dir.path().join("missing.db").display()
    );
    let config = PipelineConfig::new(missing, &fx.dest_url).unwrap();

    let err = EtlPipeline::new(config).run_once().await.unwrap_err();
    assert!(matches!(err, StageError::Connection { .. }));
    assert!(fx.dest_rows().await.is_empty());
}

#[tokio::test]
async fn test_unreachable_oracle_source_is_reported() {
    let fx = Fixture::new(&sample_rows()).await;
    let config = PipelineConfig::new("etl/secret@127.0.0.1:1/SALES", &fx.dest_url)
        .unwrap()
        .with_connect_timeout(Duration::from_secs(5));

    let err = EtlPipeline::new(config).run_once().await.unwrap_err();
    assert!(matches!(err, StageError::Connection { .. }));
    assert!(err.to_string().contains("etl/***@127.0.0.1:1/SALES"));
    assert!(!err.to_string().contains("secret"));
    assert!(fx.dest_rows().await.is_empty());
}

#[tokio::test]
async fn test_oracle_destination_is_rejected() {
    let fx = Fixture::new(&sample_rows()).await;
    let config = PipelineConfig::new(&fx.source_url, "etl/secret@127.0.0.1:1/SALES").unwrap();

    let err = EtlPipeline::new(config).run_once().await.unwrap_err();
    assert!(matches!(err, StageError::Connection { .. }));
    assert!(err.to_string().contains("source only"));
}

#[tokio::test]
async fn test_dag_run_with_parquet_checkpoints() {
    let fx = Fixture::new(&sample_rows()).await;
    let checkpoint_dir = fx.dir.path().join("checkpoints");
    let config = fx.config().with_checkpoint_dir(&checkpoint_dir);
    let dag = DagDefinition::from_config(&config);
    let pipeline = EtlPipeline::new(config);

    let report = LocalOrchestrator::new()
        .run_dag(&dag, &pipeline, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
        .await
        .unwrap();

    assert!(report.is_success(), "report: {:?}", report);
    assert_eq!(report.task("extract_oracle").unwrap().rows, Some(5));
    assert_eq!(report.task("transform_data").unwrap().rows, Some(3));
    assert_eq!(report.task("load_postgres").unwrap().rows, Some(3));

    let loaded: Vec<i64> = fx.dest_rows().await.into_iter().map(|r| r.0).collect();
    assert_eq!(loaded, vec![1, 2, 3]);

    // The run's checkpoints are removed once it ends.
    let leftover = std::fs::read_dir(&checkpoint_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}

#[tokio::test]
async fn test_dag_run_retries_then_fails() {
    let fx = Fixture::new(&sample_rows()).await;
    let missing = format!(
        "sqlite://{}?mode=ro",
        fx.dir.path().join("missing.db").display()
    );
    let config = PipelineConfig::new(missing, &fx.dest_url)
        .unwrap()
        .with_retry(
            RetryPolicy::default()
                .with_initial_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(10)),
        );
    let dag = DagDefinition::from_config(&config);
    let pipeline = EtlPipeline::new(config);

    let report = LocalOrchestrator::new()
        .run_dag(&dag, &pipeline, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
        .await
        .unwrap();

    assert_eq!(report.status, DagRunStatus::Failed);
    assert_eq!(report.state, RunState::ExtractFailed);
    let extract = report.task("extract_oracle").unwrap();
    assert_eq!(extract.attempts, 3);
    assert_eq!(extract.error_kind.as_deref(), Some("connection"));
    assert_eq!(
        report.task("load_postgres").unwrap().status,
        TaskStatus::UpstreamFailed
    );
}

#[tokio::test]
async fn test_dag_run_does_not_retry_bad_data() {
    let fx = Fixture::new(&sample_rows()).await;
    // A second source table with a duplicated transaction id.
    let mut conn = SqliteConnection::connect(&fx.source_url).await.unwrap();
    sqlx::query("CREATE TABLE DUPLICATED (TRANSACTION_ID INTEGER, CUSTOMER_ID TEXT, AMOUNT TEXT, TRANSACTION_DATE TEXT)")
        .execute(&mut conn)
        .await
        .unwrap();
    sqlx::query("INSERT INTO DUPLICATED VALUES (1, 'a', '10', '2024-01-01'), (1, 'b', '20', '2024-01-01')")
        .execute(&mut conn)
        .await
        .unwrap();
    conn.close().await.unwrap();

    let config = fx
        .config()
        .with_source_table("DUPLICATED".parse().unwrap());
    let dag = DagDefinition::from_config(&config);
    let pipeline = EtlPipeline::new(config);

    let report = LocalOrchestrator::new()
        .run_dag(&dag, &pipeline, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
        .await
        .unwrap();

    assert_eq!(report.status, DagRunStatus::Failed);
    let transform = report.task("transform_data").unwrap();
    assert_eq!(transform.attempts, 1);
    assert_eq!(transform.error_kind.as_deref(), Some("transform"));
    assert!(fx.dest_rows().await.is_empty());
}
