use std::path::PathBuf;

use rand::Rng;
use sp500etl_lib::pipeline::RunStatus;
use sp500etl_lib::types::Stage;
use sp500etl_lib::{
    DefaultPipeline, PipelineConfig, PipelineError, RetryPolicy, RunDate, TableSchema,
    UniverseSource, WarehouseSink,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TABLE: &str = "SP500_DATA";

fn load_fixture(name: &str) -> String {
    std::fs::read_to_string(format!("tests/fixtures/{}", name)).unwrap()
}

fn scratch_dir() -> PathBuf {
    let suffix: u64 = rand::thread_rng().gen();
    let dir = std::env::temp_dir().join(format!("sp500etl-it-{:016x}", suffix));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

async fn mock_chart_api() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v8/finance/chart/AAPL"))
        .respond_with(ResponseTemplate::new(200).set_body_string(load_fixture("chart_aapl.json")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v8/finance/chart/MSFT"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(load_fixture("chart_holiday_gap.json")),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v8/finance/chart/ZZZZ"))
        .respond_with(
            ResponseTemplate::new(404).set_body_string(load_fixture("chart_not_found.json")),
        )
        .mount(&server)
        .await;
    server
}

fn config(server: &MockServer, dir: &std::path::Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.universe = UniverseSource::Static {
        symbols: vec!["AAPL".into(), "MSFT".into(), "ZZZZ".into()],
    };
    config.window.days = 2;
    config.market_data.chart_base_url = server.uri();
    config.extract.min_delay_ms = 0;
    config.extract.max_delay_ms = 0;
    config.staging.root = dir.join("staging");
    config.warehouse.path = dir.join("warehouse.db");
    config.retry = RetryPolicy::none();
    config
}

fn run_date() -> RunDate {
    "2024-06-15".parse().unwrap()
}

#[tokio::test]
async fn full_run_against_mock_chart_api() {
    let server = mock_chart_api().await;
    let dir = scratch_dir();
    let config = config(&server, &dir);
    let pipeline = DefaultPipeline::from_config(&config, None).unwrap();
    pipeline
        .loader()
        .sink()
        .init_table(TABLE, &TableSchema::daily_prices())
        .unwrap();

    let window = config.run_window(run_date(), None).unwrap();
    let report = pipeline.run(&window).await.unwrap();

    assert_eq!(report.status, RunStatus::PartialSuccess);
    assert_eq!(report.tickers_attempted, 3);
    assert_eq!(report.tickers_loaded, 2);
    // AAPL on the 13th and 14th, MSFT only on the 14th (the 13th is a gap).
    assert_eq!(report.rows_loaded, 3);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].ticker.as_str(), "ZZZZ");
    assert_eq!(report.skipped[0].stage, Stage::Extract);

    assert!(dir
        .join("staging/sp500/raw/sp500_raw_2024-06-15.csv")
        .is_file());
    assert!(dir
        .join("staging/sp500/transformed/sp500_transformed_2024-06-15.csv.manifest.json")
        .is_file());

    let staged = pipeline
        .loader()
        .read_transformed(&report.transformed_handle)
        .await
        .unwrap();
    let aapl_first = &staged.dataset.rows[0];
    assert_eq!(aapl_first.symbol.as_str(), "AAPL");
    assert!((aapl_first.close_change.unwrap() - (214.24 - 213.07)).abs() < 1e-9);
    let msft = &staged.dataset.rows[2];
    assert_eq!(msft.symbol.as_str(), "MSFT");
    assert!((msft.close_change.unwrap() - (442.57 - 441.06)).abs() < 1e-9);
    assert_eq!(msft.adj_close, msft.close);

    let count = pipeline.loader().sink().row_count(TABLE, None).unwrap();
    let rerun = pipeline.run(&window).await.unwrap();
    assert_eq!(rerun.rows_loaded, report.rows_loaded);
    assert_eq!(pipeline.loader().sink().row_count(TABLE, None).unwrap(), count);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn case_drift_in_target_table_blocks_load() {
    let server = mock_chart_api().await;
    let dir = scratch_dir();
    let config = config(&server, &dir);
    let pipeline = DefaultPipeline::from_config(&config, None).unwrap();

    let mut drifted = TableSchema::daily_prices();
    drifted.columns[1].name = "Symbol".to_string();
    pipeline.loader().sink().init_table(TABLE, &drifted).unwrap();

    let window = config.run_window(run_date(), None).unwrap();
    let err = pipeline.run(&window).await.unwrap_err();
    match err {
        PipelineError::SchemaMismatch(mismatch) => {
            assert!(mismatch.to_string().contains("case differs"));
        }
        other => panic!("expected schema mismatch, got {:?}", other),
    }
    assert_eq!(pipeline.loader().sink().row_count(TABLE, None).unwrap(), 0);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn all_tickers_missing_is_no_data() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(404).set_body_string(load_fixture("chart_not_found.json")),
        )
        .mount(&server)
        .await;
    let dir = scratch_dir();
    let config = config(&server, &dir);
    let pipeline = DefaultPipeline::from_config(&config, None).unwrap();

    let window = config.run_window(run_date(), None).unwrap();
    let err = pipeline.run(&window).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoDataAvailable { attempted: 3 }));
    assert!(!dir.join("staging/sp500/raw").exists());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn rate_limited_ticker_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v8/finance/chart/AAPL"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v8/finance/chart/AAPL"))
        .respond_with(ResponseTemplate::new(200).set_body_string(load_fixture("chart_aapl.json")))
        .mount(&server)
        .await;

    let dir = scratch_dir();
    let mut config = config(&server, &dir);
    config.universe = UniverseSource::Static {
        symbols: vec!["AAPL".into()],
    };
    config.retry = RetryPolicy {
        max_retries: 2,
        base_delay_ms: 1,
        max_delay_ms: 5,
    };
    let pipeline = DefaultPipeline::from_config(&config, None).unwrap();
    pipeline
        .loader()
        .sink()
        .init_table(TABLE, &TableSchema::daily_prices())
        .unwrap();

    let window = config.run_window(run_date(), None).unwrap();
    let report = pipeline.run(&window).await.unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.rows_loaded, 2);

    std::fs::remove_dir_all(&dir).unwrap();
}

async fn weekend_run(run_date: &str) {
    let server = mock_chart_api().await;
    let dir = scratch_dir();
    let mut config = config(&server, &dir);
    config.window.days = 1;
    let pipeline = DefaultPipeline::from_config(&config, None).unwrap();
    pipeline
        .loader()
        .sink()
        .init_table(TABLE, &TableSchema::daily_prices())
        .unwrap();

    let window = config
        .run_window(run_date.parse().unwrap(), None)
        .unwrap();
    let report = pipeline.run(&window).await.unwrap();

    let friday = chrono::NaiveDate::from_ymd_opt(2024, 6, 14).unwrap();
    assert_eq!(report.reporting.start, friday);
    assert_eq!(report.reporting.end, friday);
    assert_eq!(report.status, RunStatus::PartialSuccess);
    assert_eq!(report.rows_loaded, 2);
    assert_eq!(report.tickers_loaded, 2);

    let staged = pipeline
        .loader()
        .read_transformed(&report.transformed_handle)
        .await
        .unwrap();
    assert_eq!(staged.dataset.window.reporting, report.reporting);
    let aapl = &staged.dataset.rows[0];
    assert_eq!(aapl.symbol.as_str(), "AAPL");
    assert!((aapl.close_change.unwrap() - (212.49 - 214.24)).abs() < 1e-9);
    let msft = &staged.dataset.rows[1];
    assert_eq!(msft.symbol.as_str(), "MSFT");
    assert!((msft.close_change.unwrap() - (442.57 - 441.06)).abs() < 1e-9);

    let sink = pipeline.loader().sink();
    assert_eq!(sink.row_count(TABLE, Some(&report.reporting)).unwrap(), 2);
    assert_eq!(sink.row_count(TABLE, None).unwrap(), 2);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn sunday_run_loads_friday_session() {
    weekend_run("2024-06-16").await;
}

#[tokio::test]
async fn monday_run_loads_friday_session() {
    weekend_run("2024-06-17").await;
}

#[tokio::test]
async fn explicit_end_on_weekend_is_no_data() {
    let server = mock_chart_api().await;
    let dir = scratch_dir();
    let mut config = config(&server, &dir);
    config.window.days = 1;
    let pipeline = DefaultPipeline::from_config(&config, None).unwrap();

    let saturday = chrono::NaiveDate::from_ymd_opt(2024, 6, 15).unwrap();
    let window = config
        .run_window("2024-06-17".parse().unwrap(), Some(saturday))
        .unwrap();
    let err = pipeline.run(&window).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoDataAvailable { attempted: 3 }));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn extract_and_transform_leave_warehouse_untouched() {
    let server = mock_chart_api().await;
    let dir = scratch_dir();
    let mut config = config(&server, &dir);
    config.warehouse.path = dir.join("db").join("warehouse.db");
    let pipeline = DefaultPipeline::from_config(&config, None).unwrap();

    let window = config.run_window(run_date(), None).unwrap();
    let extracted = pipeline.extract(&window).await.unwrap();
    pipeline.transform(&extracted.handle).await.unwrap();

    assert!(!pipeline.loader().sink().is_connected());
    assert!(!dir.join("db").exists());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn loading_unknown_handle_names_the_key() {
    let server = mock_chart_api().await;
    let dir = scratch_dir();
    let config = config(&server, &dir);
    let pipeline = DefaultPipeline::from_config(&config, None).unwrap();

    let handle = pipeline.loader().transformed_handle("2024-06-01".parse().unwrap());
    let err = pipeline.load(&handle).await.unwrap_err();
    match err {
        PipelineError::MissingArtifact { key } => {
            assert_eq!(key, "sp500/transformed/sp500_transformed_2024-06-01.csv")
        }
        other => panic!("expected missing artifact, got {:?}", other),
    }

    std::fs::remove_dir_all(&dir).unwrap();
}
