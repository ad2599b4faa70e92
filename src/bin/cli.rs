//! Binary entry point for the chronocol command-line tool.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use chronocol::storage::PartitionEntry;
use chronocol::{
    ColumnType, CommitSummary, Engine, EngineConfig, PartitionBy, Row, TableId, TableSchema, Value,
};

#[derive(Parser, Debug)]
#[command(
    name = "chronocol",
    version,
    about = "Create, load and inspect chronocol tables",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "CHRONOCOL_CONFIG",
        value_name = "FILE",
        help = "TOML file with [engine], [o3] and [pool] sections"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "CHRONOCOL_ROOT",
        value_name = "DIR",
        help = "Directory holding the tables"
    )]
    root: Option<PathBuf>,

    #[arg(long, global = true, help = "Override the number of pipeline workers")]
    workers: Option<usize>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create an empty table")]
    Create(CreateCmd),

    #[command(about = "Load rows from a CSV file; the designated timestamp is in microseconds")]
    Ingest(IngestCmd),

    #[command(about = "Print every row of a table in timestamp order")]
    Dump(DumpCmd),

    #[command(about = "List the published partitions of a table")]
    Partitions {
        #[arg(value_name = "TABLE")]
        table: String,
    },

    #[command(about = "List the tables under the root")]
    Tables,
}

#[derive(Args, Debug)]
struct CreateCmd {
    #[arg(value_name = "TABLE")]
    table: String,

    #[arg(
        long,
        value_delimiter = ',',
        value_name = "NAME:TYPE",
        help = "Columns besides the timestamp, e.g. price:double,qty:long"
    )]
    columns: Vec<String>,

    #[arg(long, default_value = "ts", help = "Name of the designated timestamp column")]
    timestamp: String,

    #[arg(long, default_value = "day", help = "none, hour, day, month or year")]
    partition_by: String,
}

#[derive(Args, Debug)]
struct IngestCmd {
    #[arg(value_name = "TABLE")]
    table: String,

    #[arg(value_name = "CSV")]
    csv: PathBuf,

    #[arg(long, default_value_t = 10_000, help = "Rows per commit")]
    batch_rows: usize,

    #[arg(long, help = "The first line is data, not a header")]
    no_header: bool,
}

#[derive(Args, Debug)]
struct DumpCmd {
    #[arg(value_name = "TABLE")]
    table: String,

    #[arg(long, help = "Stop after this many rows")]
    limit: Option<usize>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct CreateReport {
    table: String,
    columns: Vec<String>,
    partition_by: PartitionBy,
}

#[derive(Serialize, Default)]
struct IngestReport {
    table: String,
    rows: u64,
    commits: usize,
    out_of_order_commits: usize,
    txn: u64,
}

#[derive(Serialize)]
struct DumpReport {
    columns: Vec<String>,
    rows: Vec<Vec<serde_json::Value>>,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CHRONOCOL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
    }
    let engine = Engine::open(config)?;

    match cli.command {
        Command::Create(cmd) => {
            let report = run_create(&engine, cmd)?;
            emit(cli.format, &report, |r| {
                println!(
                    "created table {} ({}) partitioned by {:?}",
                    r.table,
                    r.columns.join(", "),
                    r.partition_by
                )
            })?;
        }
        Command::Ingest(cmd) => {
            let report = run_ingest(&engine, cmd)?;
            emit(cli.format, &report, |r| {
                println!(
                    "ingested {} rows into {} in {} commits ({} out of order), txn {}",
                    r.rows, r.table, r.commits, r.out_of_order_commits, r.txn
                )
            })?;
        }
        Command::Dump(cmd) => {
            let report = run_dump(&engine, cmd)?;
            emit(cli.format, &report, print_dump_text)?;
        }
        Command::Partitions { table } => {
            let id = engine.open_table(&table)?;
            let parts = engine.reader(id)?.partitions().to_vec();
            emit(cli.format, &parts, |parts| print_partitions_text(parts))?;
        }
        Command::Tables => {
            let names = engine.list_tables()?;
            emit(cli.format, &names, |names| names.iter().for_each(|n| println!("{n}")))?;
        }
    }
    engine.shutdown();
    Ok(())
}

fn run_create(engine: &Engine, cmd: CreateCmd) -> Result<CreateReport, Box<dyn Error>> {
    let partition_by = PartitionBy::parse(&cmd.partition_by)?;
    let mut schema = TableSchema::new(&cmd.table, &cmd.timestamp, partition_by);
    for spec in cmd.columns.iter().filter(|s| !s.trim().is_empty()) {
        let (name, ty) = spec
            .split_once(':')
            .ok_or_else(|| format!("column {spec:?} is not NAME:TYPE"))?;
        schema = schema.column(name.trim(), ColumnType::parse(ty.trim())?);
    }
    engine.create_table(schema.clone())?;
    Ok(CreateReport {
        table: schema.name,
        columns: schema
            .columns
            .iter()
            .map(|c| format!("{}:{}", c.name, format!("{:?}", c.ty).to_lowercase()))
            .collect(),
        partition_by,
    })
}

fn run_ingest(engine: &Engine, cmd: IngestCmd) -> Result<IngestReport, Box<dyn Error>> {
    if cmd.batch_rows == 0 {
        return Err("--batch-rows must be positive".into());
    }
    let id = engine.open_table(&cmd.table)?;
    let schema = engine.reader(id)?.schema().clone();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(!cmd.no_header)
        .from_path(&cmd.csv)?;

    let mut report = IngestReport {
        table: schema.name.clone(),
        ..IngestReport::default()
    };
    let mut pending = Vec::with_capacity(cmd.batch_rows);
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        pending.push(parse_record(&schema, &record).map_err(|err| format!("record {}: {err}", line + 1))?);
        if pending.len() == cmd.batch_rows {
            commit(engine, id, &mut pending, &mut report)?;
        }
    }
    if !pending.is_empty() {
        commit(engine, id, &mut pending, &mut report)?;
    }
    Ok(report)
}

fn parse_record(schema: &TableSchema, record: &csv::StringRecord) -> Result<Row, Box<dyn Error>> {
    if record.len() != schema.columns.len() {
        return Err(format!(
            "expected {} fields, found {}",
            schema.columns.len(),
            record.len()
        )
        .into());
    }
    let ts_field = record.get(schema.timestamp_index).unwrap_or_default().trim();
    let mut row = Row::new(ts_field.parse()?);
    for (i, (col, field)) in schema.columns.iter().zip(record.iter()).enumerate() {
        if i != schema.timestamp_index {
            row = row.with(col.ty.parse_value(field)?);
        }
    }
    Ok(row)
}

fn commit(
    engine: &Engine,
    id: TableId,
    pending: &mut Vec<Row>,
    report: &mut IngestReport,
) -> Result<(), Box<dyn Error>> {
    let summary: CommitSummary = engine.write(id, pending)?;
    report.rows += summary.rows;
    report.commits += 1;
    report.out_of_order_commits += usize::from(summary.out_of_order);
    report.txn = summary.txn;
    pending.clear();
    Ok(())
}

fn run_dump(engine: &Engine, cmd: DumpCmd) -> Result<DumpReport, Box<dyn Error>> {
    let id = engine.open_table(&cmd.table)?;
    let reader = engine.reader(id)?;
    let schema = reader.schema();
    let limit = cmd.limit.unwrap_or(usize::MAX);
    let rows = reader
        .rows()?
        .into_iter()
        .take(limit)
        .map(|row| {
            let mut values = row.values.into_iter();
            (0..schema.columns.len())
                .map(|i| {
                    if i == schema.timestamp_index {
                        serde_json::Value::from(row.timestamp)
                    } else {
                        values.next().map(|v| to_json(&v)).unwrap_or_default()
                    }
                })
                .collect()
        })
        .collect();
    Ok(DumpReport {
        columns: schema.columns.iter().map(|c| c.name.clone()).collect(),
        rows,
    })
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(v) => (*v).into(),
        Value::Byte(v) => (*v).into(),
        Value::Short(v) => (*v).into(),
        Value::Int(v) => (*v).into(),
        Value::Long(v) | Value::Timestamp(v) => (*v).into(),
        Value::Double(v) => (*v).into(),
    }
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: FnOnce(&T),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(value),
    }
    Ok(())
}

fn print_dump_text(report: &DumpReport) {
    println!("{}", report.columns.join(","));
    for row in &report.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|v| match v {
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect();
        println!("{}", cells.join(","));
    }
}

fn print_partitions_text(parts: &[PartitionEntry]) {
    for part in parts {
        println!(
            "{} rows={} lo={} hi={} min={} max={}",
            part.dir_name(),
            part.rows,
            part.lo,
            part.hi,
            part.min_ts,
            part.max_ts
        );
    }
}
