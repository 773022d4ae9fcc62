use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tally_api::{ClientConfig, Collections, MutationOutcome, OrderBy, QueryResult, QuerySpec, Record, Selection};
use tally_apply::{ApplyOptions, DiffSummary};
use tally_persist::SqliteTable;
use tally_remote::{MemoryTable, RemoteTable, RestTable};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tallyctl", version, about = "Tally CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Storage backend
    #[arg(long = "backend", value_enum, global = true, env = "TALLY_BACKEND", default_value_t = Backend::Sqlite)]
    backend: Backend,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend { Sqlite, Memory, Rest }

#[derive(Args, Debug, Clone)]
struct QueryArgs {
    /// Collection name, e.g. "purchase_orders"
    collection: String,
    /// Comma-separated columns (default: all)
    #[arg(long = "select")]
    select: Option<String>,
    /// Equality filter `field=value`; repeatable, ANDed. Values parse as JSON when possible.
    #[arg(long = "eq", action = ArgAction::Append)]
    eq: Vec<String>,
    /// Order by `field` or `field.desc`
    #[arg(long = "order")]
    order: Option<String>,
    /// Hard row limit
    #[arg(long = "limit")]
    limit: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read a collection
    Query {
        #[command(flatten)]
        query: QueryArgs,
        /// Case-insensitive text search over the returned rows
        #[arg(long = "search")]
        search: Option<String>,
        /// Comma-separated fields searched by --search (default: every field)
        #[arg(long = "search-fields")]
        search_fields: Option<String>,
        /// 1-based page of the (searched) rows
        #[arg(long = "page")]
        page: Option<usize>,
        #[arg(long = "per-page", default_value_t = 20)]
        per_page: usize,
    },
    /// Insert a record given as JSON
    Insert { collection: String, json: String },
    /// Update a record; the JSON must carry `id`
    Update { collection: String, json: String },
    /// Delete a record by id
    Delete { collection: String, id: String },
    /// Apply a YAML/JSON seed document
    Apply {
        /// Path to the document
        file: String,
        /// Only report what would change
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Delete live records the document does not mention
        #[arg(long = "prune", action = ArgAction::SetTrue)]
        prune: bool,
    },
    /// Compare a seed document against live data without writing
    Diff { file: String },
    /// List stored collections with record counts (sqlite backend)
    Collections,
    /// Show prior versions of a record (sqlite backend)
    History {
        collection: String,
        id: String,
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Hold a live query and print every state change
    Watch {
        #[command(flatten)]
        query: QueryArgs,
        /// Invalidate the collection every N seconds
        #[arg(long = "refresh-secs")]
        refresh_secs: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("TALLY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TALLY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TALLY_METRICS_ADDR; expected host:port");
        }
    }
}

/// JSON when it parses (numbers, booleans, null, quoted strings), bare string otherwise.
fn parse_value(s: &str) -> Value { serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string())) }

fn parse_eq(s: &str) -> Result<(String, Value)> {
    let (field, value) = s.split_once('=').ok_or_else(|| anyhow!("--eq expects field=value, got {:?}", s))?;
    if field.trim().is_empty() {
        return Err(anyhow!("--eq has an empty field name: {:?}", s));
    }
    Ok((field.trim().to_string(), parse_value(value)))
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(|c| c.trim()).filter(|c| !c.is_empty()).map(|c| c.to_string()).collect()
}

fn build_spec(q: &QueryArgs) -> Result<QuerySpec> {
    let mut spec = QuerySpec::new(q.collection.as_str());
    if let Some(cols) = &q.select {
        spec.selection = Selection::parse(cols);
    }
    for e in q.eq.iter() {
        let (field, value) = parse_eq(e)?;
        spec = spec.eq(field, value);
    }
    spec.order_by = q.order.as_deref().map(OrderBy::parse);
    if let Some(n) = q.limit {
        spec = spec.limit(n);
    }
    spec.validate()?;
    Ok(spec)
}

fn parse_record(json: &str) -> Result<Record> {
    let v: Value = serde_json::from_str(json).context("parsing record JSON")?;
    v.as_object().cloned().ok_or_else(|| anyhow!("record must be a JSON object"))
}

struct Opened {
    table: Arc<dyn RemoteTable>,
    sqlite: Option<Arc<SqliteTable>>,
}

fn open_backend(backend: Backend) -> Result<Opened> {
    Ok(match backend {
        Backend::Sqlite => {
            let t = Arc::new(SqliteTable::open_default()?);
            Opened { table: t.clone(), sqlite: Some(t) }
        }
        Backend::Memory => {
            warn!("memory backend: data lives only for this process");
            Opened { table: Arc::new(MemoryTable::new()), sqlite: None }
        }
        Backend::Rest => Opened { table: Arc::new(RestTable::from_env()?), sqlite: None },
    })
}

/// Columns to print: the selection, else keys seen across rows with `id` first.
fn columns(spec: &QuerySpec, rows: &[&Record]) -> Vec<String> {
    if let Selection::Columns(cols) = &spec.selection {
        return cols.to_vec();
    }
    let mut cols: Vec<String> = Vec::new();
    for r in rows {
        for k in r.keys() {
            if !cols.contains(k) {
                cols.push(k.clone());
            }
        }
    }
    if let Some(pos) = cols.iter().position(|c| c == "id") {
        let id = cols.remove(pos);
        cols.insert(0, id);
    }
    cols
}

fn cell(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn print_table(spec: &QuerySpec, rows: &[&Record]) {
    let cols = columns(spec, rows);
    let mut widths: Vec<usize> = cols.iter().map(|c| c.len()).collect();
    let cells: Vec<Vec<String>> = rows.iter().map(|r| cols.iter().map(|c| cell(r.get(c))).collect()).collect();
    for row in cells.iter() {
        for (i, c) in row.iter().enumerate() {
            widths[i] = widths[i].max(c.chars().count()).min(40);
        }
    }
    let line = |vals: Vec<&str>| {
        vals.iter().enumerate().map(|(i, v)| format!("{:<w$}", v, w = widths[i])).collect::<Vec<_>>().join("  ")
    };
    let header: Vec<String> = cols.iter().map(|c| c.to_uppercase()).collect();
    println!("{}", line(header.iter().map(String::as_str).collect()));
    for row in cells.iter() {
        println!("{}", line(row.iter().map(|s| s.as_str()).collect()));
    }
}

#[derive(Serialize)]
struct WatchLine<'a> {
    generation: u64,
    status: &'a str,
    rows: usize,
    error: Option<String>,
    data: &'a [Record],
}

fn print_state(out: Output, s: &QueryResult<Record>) -> Result<()> {
    match out {
        Output::Human => match (&s.error, s.is_loading()) {
            (_, true) => println!("[gen {}] loading (showing {} rows)", s.generation, s.data.len()),
            (Some(e), false) => println!("[gen {}] error: {} (showing {} stale rows)", s.generation, e, s.data.len()),
            (None, false) => {
                println!("[gen {}] {} rows", s.generation, s.data.len());
                for r in s.data.iter() {
                    println!("  {}", serde_json::to_string(r)?);
                }
            }
        },
        Output::Json => {
            let line = WatchLine {
                generation: s.generation,
                status: s.status.as_str(),
                rows: s.data.len(),
                error: s.error.as_ref().map(|e| e.to_string()),
                data: &s.data,
            };
            println!("{}", serde_json::to_string(&line)?);
        }
    }
    Ok(())
}

fn print_outcome(out: Output, o: &MutationOutcome<Record>) -> Result<()> {
    match (out, o) {
        (Output::Human, MutationOutcome::Record(r)) => println!("{}", serde_json::to_string(r)?),
        (Output::Human, MutationOutcome::Deleted { id }) => println!("deleted {}", id),
        (Output::Json, MutationOutcome::Record(r)) => println!("{}", serde_json::to_string_pretty(r)?),
        (Output::Json, MutationOutcome::Deleted { id }) => println!("{}", serde_json::json!({ "deleted": id })),
    }
    Ok(())
}

fn read_document(file: &str) -> Result<tally_apply::SeedDocument> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
    tally_apply::parse_document(&text).with_context(|| format!("parsing {}", file))
}

fn human_summary(s: &DiffSummary) -> String {
    format!("+{} ~{} ={} -{}", s.adds, s.updates, s.unchanged, s.removes)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let opened = open_backend(cli.backend)?;
    let api = Collections::with_config(opened.table.clone(), ClientConfig::from_env());

    match cli.command {
        Commands::Query { query, search, search_fields, page, per_page } => {
            counter!("cli_commands_total", 1u64, "cmd" => "query");
            let t0 = Instant::now();
            let spec = build_spec(&query)?;
            info!(key = %spec.key(), "query invoked");
            let rows: Vec<Record> = api.fetch(&spec).await?;
            let mut view: Vec<&Record> = rows.iter().collect();
            if let Some(q) = search.as_deref() {
                let fields: Vec<String> = match &search_fields {
                    Some(f) => split_list(f),
                    None => columns(&spec, &view),
                };
                let field_refs: Vec<&str> = fields.iter().map(|s| s.as_str()).collect();
                view = tally_search::contains_filter(&rows, q, &field_refs);
            }
            let (view, page_info) = match page {
                Some(p) => {
                    let pg = tally_search::paginate(&view, p, per_page);
                    let info = (pg.page, pg.total_pages, pg.total);
                    (pg.items, Some(info))
                }
                None => (view, None),
            };
            match cli.output {
                Output::Human => {
                    print_table(&spec, &view);
                    if let Some((p, pages, total)) = page_info {
                        eprintln!("page {}/{} ({} rows)", p, pages, total);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&view)?),
            }
            info!(rows = view.len(), took_ms = %t0.elapsed().as_millis(), "query done");
        }
        Commands::Insert { collection, json } => {
            counter!("cli_commands_total", 1u64, "cmd" => "insert");
            let o = api.insert::<Record>(collection.as_str()).mutate(&parse_record(&json)?).await?;
            print_outcome(cli.output, &o)?;
        }
        Commands::Update { collection, json } => {
            counter!("cli_commands_total", 1u64, "cmd" => "update");
            let o = api.update::<Record>(collection.as_str()).mutate(&parse_record(&json)?).await?;
            print_outcome(cli.output, &o)?;
        }
        Commands::Delete { collection, id } => {
            counter!("cli_commands_total", 1u64, "cmd" => "delete");
            let o = api.delete::<Record>(collection.as_str()).mutate(&serde_json::json!({ "id": parse_value(&id) })).await?;
            print_outcome(cli.output, &o)?;
        }
        Commands::Apply { file, dry_run, prune } => {
            counter!("cli_commands_total", 1u64, "cmd" => "apply");
            let doc = read_document(&file)?;
            let res = tally_apply::apply(&api, &doc, ApplyOptions { dry_run, prune }).await?;
            match cli.output {
                Output::Human => {
                    for c in res.collections.iter() {
                        println!("{:<24} {}", c.collection, human_summary(&c.summary));
                        for f in c.failures.iter() {
                            println!("  ! {}", f);
                        }
                    }
                    let verb = if res.dry_run { "would apply" } else { "applied" };
                    println!("{} {} ({} failed)", verb, human_summary(&res.summary), res.failures());
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&res)?),
            }
            if res.failures() > 0 {
                return Err(anyhow!("{} item(s) failed", res.failures()));
            }
        }
        Commands::Diff { file } => {
            counter!("cli_commands_total", 1u64, "cmd" => "diff");
            let doc = read_document(&file)?;
            let rows = tally_apply::diff(&api, &doc).await?;
            match cli.output {
                Output::Human => {
                    for (collection, s) in rows.iter() {
                        println!("{:<24} {}", collection, human_summary(s));
                    }
                }
                Output::Json => {
                    let m: std::collections::BTreeMap<&str, &DiffSummary> = rows.iter().map(|(c, s)| (c.as_str(), s)).collect();
                    println!("{}", serde_json::to_string_pretty(&m)?);
                }
            }
        }
        Commands::Collections => {
            counter!("cli_commands_total", 1u64, "cmd" => "collections");
            let sqlite = opened.sqlite.as_ref().ok_or_else(|| anyhow!("collections requires the sqlite backend"))?;
            let list = sqlite.collections()?;
            match cli.output {
                Output::Human => {
                    println!("{:<24} {}", "COLLECTION", "RECORDS");
                    for (name, n) in list.iter() {
                        println!("{:<24} {}", name, n);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&list)?),
            }
        }
        Commands::History { collection, id, limit } => {
            counter!("cli_commands_total", 1u64, "cmd" => "history");
            let sqlite = opened.sqlite.as_ref().ok_or_else(|| anyhow!("history requires the sqlite backend"))?;
            let revs = sqlite.history(&collection, &parse_value(&id), limit)?;
            match cli.output {
                Output::Human => {
                    if revs.is_empty() {
                        eprintln!("no history for {}/{}", collection, id);
                    }
                    for r in revs.iter() {
                        println!("{}  {}", r.ts, serde_json::to_string(&r.record)?);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&revs)?),
            }
        }
        Commands::Watch { query, refresh_secs } => {
            counter!("cli_commands_total", 1u64, "cmd" => "watch");
            let spec = build_spec(&query)?;
            let collection = spec.collection.clone();
            info!(key = %spec.key(), refresh_secs = ?refresh_secs, "watch invoked");
            let binding = api.query::<Record>(spec);
            let mut rx = binding.subscribe();
            print_state(cli.output, &rx.borrow_and_update().clone())?;
            let period = Duration::from_secs(refresh_secs.unwrap_or(0).max(1));
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            warn!("binding closed; exiting watch loop");
                            break;
                        }
                        let state = rx.borrow_and_update().clone();
                        print_state(cli.output, &state)?;
                    }
                    _ = tick.tick(), if refresh_secs.is_some() => {
                        api.invalidate(&collection);
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(collection: &str) -> QueryArgs {
        QueryArgs { collection: collection.to_string(), select: None, eq: Vec::new(), order: None, limit: None }
    }

    #[test]
    fn values_parse_as_json_when_possible() {
        assert_eq!(parse_value("0"), json!(0));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("null"), json!(null));
        assert_eq!(parse_value("open"), json!("open"));
        assert_eq!(parse_value("\"42\""), json!("42"));
        assert!(parse_eq("qty").is_err());
        assert!(parse_eq("=1").is_err());
        assert_eq!(parse_eq("a=b=c").unwrap(), ("a".to_string(), json!("b=c")));
    }

    #[test]
    fn spec_from_flags() {
        let mut q = args("purchase_orders");
        q.select = Some("id, status".into());
        q.eq = vec!["status=open".into(), "vendor_id=4".into()];
        q.order = Some("created_at.desc".into());
        q.limit = Some(25);
        let spec = build_spec(&q).unwrap();
        assert_eq!(
            spec,
            QuerySpec::new("purchase_orders")
                .select(["id", "status"])
                .eq("status", "open")
                .eq("vendor_id", 4)
                .order_by("created_at", false)
                .limit(25)
        );

        let mut q = args("items");
        q.order = Some("unit.price".into());
        assert_eq!(build_spec(&q).unwrap().order_by.unwrap().field, "unit.price");
        assert!(build_spec(&args("")).is_err());
    }

    #[test]
    fn columns_put_id_first() {
        let a = json!({"name": "A", "id": 1}).as_object().cloned().unwrap();
        let b = json!({"qty": 2, "id": 2}).as_object().cloned().unwrap();
        let cols = columns(&QuerySpec::new("items"), &[&a, &b]);
        assert_eq!(cols[0], "id");
        assert_eq!(cols.len(), 3);
    }
}
