use serde::Serialize;
use sp500etl_lib::pipeline::{ExtractReport, TransformReport};
use sp500etl_lib::types::SkippedTicker;
use sp500etl_lib::{LoadSummary, RunReport, Ticker};
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Clone, Debug)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Tabled, Serialize)]
struct FieldRow {
    #[tabled(rename = "Field")]
    #[serde(rename = "Field")]
    field: String,
    #[tabled(rename = "Value")]
    #[serde(rename = "Value")]
    value: String,
}

#[derive(Tabled, Serialize)]
struct SkippedRow {
    #[tabled(rename = "Ticker")]
    #[serde(rename = "Ticker")]
    ticker: String,
    #[tabled(rename = "Stage")]
    #[serde(rename = "Stage")]
    stage: String,
    #[tabled(rename = "Reason")]
    #[serde(rename = "Reason")]
    reason: String,
}

#[derive(Tabled, Serialize)]
struct TickerRow {
    #[tabled(rename = "#")]
    #[serde(rename = "#")]
    index: usize,
    #[tabled(rename = "Ticker")]
    #[serde(rename = "Ticker")]
    ticker: String,
}

// -- Row builders --

fn field(name: &str, value: impl ToString) -> FieldRow {
    FieldRow {
        field: name.to_string(),
        value: value.to_string(),
    }
}

fn build_run_rows(report: &RunReport) -> Vec<FieldRow> {
    vec![
        field("Run date", report.run_date),
        field("Status", report.status),
        field("Reporting window", report.reporting),
        field("Table", &report.table),
        field("Tickers attempted", report.tickers_attempted),
        field("Tickers loaded", report.tickers_loaded),
        field("Rows loaded", report.rows_loaded),
        field("Rows rejected", report.rejected_rows),
        field("Tickers skipped", report.skipped.len()),
        field("Raw artifact", &report.raw_handle),
        field("Transformed artifact", &report.transformed_handle),
    ]
}

fn build_extract_rows(report: &ExtractReport) -> Vec<FieldRow> {
    vec![
        field("Run date", report.run_date),
        field("Fetch window", report.fetch_range),
        field("Tickers attempted", report.attempted),
        field("Tickers fetched", report.fetched),
        field("Rows", report.rows),
        field("Tickers skipped", report.skipped.len()),
        field("Raw artifact", &report.handle),
    ]
}

fn build_transform_rows(report: &TransformReport) -> Vec<FieldRow> {
    vec![
        field("Run date", report.run_date),
        field("Reporting window", report.reporting),
        field("Tickers", report.tickers),
        field("Rows", report.rows),
        field("Rows rejected", report.rejected_rows),
        field("Tickers skipped", report.skipped.len()),
        field("Transformed artifact", &report.handle),
    ]
}

fn build_load_rows(summary: &LoadSummary) -> Vec<FieldRow> {
    vec![
        field("Table", &summary.table),
        field("Partition", summary.partition),
        field("Rows loaded", summary.rows),
        field("Artifact", &summary.handle),
    ]
}

fn build_skipped_rows(skipped: &[SkippedTicker]) -> Vec<SkippedRow> {
    skipped
        .iter()
        .map(|s| SkippedRow {
            ticker: s.ticker.to_string(),
            stage: s.stage.to_string(),
            reason: s.reason.clone(),
        })
        .collect()
}

fn build_ticker_rows(tickers: &[Ticker]) -> Vec<TickerRow> {
    tickers
        .iter()
        .enumerate()
        .map(|(i, t)| TickerRow {
            index: i + 1,
            ticker: t.to_string(),
        })
        .collect()
}

// -- Table output --

fn print_fields(rows: Vec<FieldRow>) {
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);
}

fn print_skipped_table(skipped: &[SkippedTicker]) {
    if skipped.is_empty() {
        return;
    }
    println!("{}", Table::new(build_skipped_rows(skipped)));
}

pub fn print_run_report(report: &RunReport, format: &OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            print_fields(build_run_rows(report));
            print_skipped_table(&report.skipped);
        }
    }
}

pub fn print_extract_report(report: &ExtractReport, format: &OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            print_fields(build_extract_rows(report));
            print_skipped_table(&report.skipped);
        }
    }
}

pub fn print_transform_report(report: &TransformReport, format: &OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            print_fields(build_transform_rows(report));
            print_skipped_table(&report.skipped);
        }
    }
}

pub fn print_load_summary(summary: &LoadSummary, format: &OutputFormat) {
    match format {
        OutputFormat::Json => print_json(summary),
        OutputFormat::Table => print_fields(build_load_rows(summary)),
    }
}

pub fn print_universe(tickers: &[Ticker], format: &OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&tickers),
        OutputFormat::Table => {
            let mut table = Table::new(build_ticker_rows(tickers));
            table.with(Style::psql());
            println!("{}", table);
        }
    }
}

// -- JSON output --

pub fn print_json<T: Serialize>(data: &T) {
    match serde_json::to_string_pretty(data) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize to JSON: {}", e),
    }
}
