//! Demo runner for the scanflow pushdown query engine.
//!
//! This binary is not a general query-planning front end - plans are
//! hand-assembled here. It exists only to exercise the operator graph
//! end to end: each `--scenario` builds one of six pipelines (S1-S6)
//! covering a pushdown filter scan, exact and sampled top-K, a bloom
//! filtered join, a nested-loop join and a bloom false-positive-rate
//! overflow, registers synthetic data with the in-process
//! `DataFusionScanClient`, runs it under the configured transport, and
//! prints the collated result plus per-operator metrics.
//!
//! `clap::Parser` args, a `tracing_subscriber` registry with an
//! `EnvFilter` + `fmt` layer, and an `anyhow::Result` main.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use datafusion::arrow::array::Int64Array;
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::arrow::record_batch::RecordBatch;
use scanflow_core::config::{GraphConfig, Transport};
use scanflow_core::plan::QueryPlan;
use scanflow_core::scalar::ColType;
use scanflow_io::collate::Collate;
use scanflow_io::remote::DataFusionScanClient;
use scanflow_io::sql_table_scan::{SqlTableScan, SqlTableScanConfig};
use scanflow_io::topk_table_scan::{TopKTableScan, TopKTableScanConfig};
use scanflow_io::SqlTableScanBloomUse;
use scanflow_tx::bloom_create::BloomCreate;
use scanflow_tx::expr::{ColumnRef, JoinExpr, Order, SortExpr};
use scanflow_tx::nested_loop_join::NestedLoopJoin;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Scenario {
    /// S1: pushdown filter across two shards, collated client-side.
    FilterScan,
    /// S2: exact streaming top-K (`Top`) over one scan's output.
    TopK,
    /// S3: sampled-threshold top-K (`TopKTableScan`) over the same data as `top-k`.
    SampledTopK,
    /// S4: bloom filter built from a left-side key set, pruning a right-side scan.
    BloomJoin,
    /// S5: nested-loop equi-join between two small in-memory tables.
    NestedLoopJoin,
    /// S6: a false-positive-rate budget too tight to honor, forcing a bloom overflow warning.
    Overflow,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TransportArg {
    Cooperative,
    TaskParallel,
}

impl From<TransportArg> for Transport {
    fn from(t: TransportArg) -> Self {
        match t {
            TransportArg::Cooperative => Transport::Cooperative,
            TransportArg::TaskParallel => Transport::TaskParallel,
        }
    }
}

/// Runs one hand-assembled scanflow demo plan.
#[derive(Parser, Debug)]
#[command(name = "scanflow-cli")]
#[command(about = "Assemble and run a demo scanflow pushdown query plan")]
struct Args {
    /// Which demo scenario to run.
    #[arg(short, long, value_enum, default_value = "filter-scan")]
    scenario: Scenario,

    /// Graph transport: single-threaded cooperative, or one Tokio task per operator.
    #[arg(short, long, value_enum, default_value = "cooperative")]
    transport: TransportArg,

    /// Optional YAML `GraphConfig` overlay (see `scanflow_core::config::GraphConfig`).
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Print every collated row instead of just the count and first few.
    #[arg(long)]
    full: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = GraphConfig::load(args.config.as_deref())?;
    config.transport = args.transport.into();

    let (mut plan, sink) = match args.scenario {
        Scenario::FilterScan => build_filter_scan(&config).await?,
        Scenario::TopK => build_top_k(&config).await?,
        Scenario::SampledTopK => build_sampled_top_k(&config).await?,
        Scenario::BloomJoin => build_bloom_join(&config).await?,
        Scenario::NestedLoopJoin => build_nested_loop_join(&config).await?,
        Scenario::Overflow => build_overflow(&config).await?,
    };

    info!(scenario = ?args.scenario, transport = ?config.transport, "scanflow-cli: running plan");
    plan.execute().await?;
    let rows = plan.tuples(sink).await?;

    let header = rows.first();
    let data = if rows.is_empty() { &rows[..] } else { &rows[1..] };
    println!("scenario: {:?}", args.scenario);
    println!("rows collated: {}", data.len());
    if let Some(header) = header {
        println!("header: {header:?}");
    }
    let to_print = if args.full { data.len() } else { data.len().min(10) };
    for row in &data[..to_print] {
        println!("  {row:?}");
    }
    if !args.full && data.len() > to_print {
        println!("  ... ({} more, pass --full to print all)", data.len() - to_print);
    }

    println!("\nmetrics:");
    for snap in plan.metrics() {
        println!("  {}", serde_json::to_string(&snap)?);
    }

    Ok(())
}

fn int_batch(col: &str, values: Vec<i64>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new(col, DataType::Int64, false)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
}

/// S1: two shards of 1000 rows each, `L_EXTENDEDPRICE` uniform in
/// [100, 10000]; predicate `L_EXTENDEDPRICE < 2000` pushed down into
/// each shard's SQL, collated client-side.
async fn build_filter_scan(config: &GraphConfig) -> Result<(QueryPlan, scanflow_core::operator::OperatorId)> {
    let client = Arc::new(DataFusionScanClient::new());
    for shard in 0..2 {
        let prices: Vec<i64> = (0..1000).map(|i| 100 + ((shard * 997 + i * 37) % 9900)).collect();
        client.register_batch(&format!("lineitem.{shard}"), int_batch("l_extendedprice", prices))?;
    }

    let mut plan = QueryPlan::new(config.clone());
    let sink = plan.add_operator("collate", Collate::new());
    for shard in 0..2 {
        let scan = plan.add_operator(
            format!("scan.{shard}"),
            SqlTableScan::new(
                format!("scan.{shard}"),
                client.clone(),
                SqlTableScanConfig::new(
                    format!("lineitem.{shard}"),
                    format!("SELECT l_extendedprice FROM lineitem.{shard} WHERE l_extendedprice < 2000"),
                ),
            ),
        );
        plan.connect(scan, sink)?;
    }
    Ok((plan, sink))
}

/// S2: exact streaming top-100 over 100,000 rows, DESC.
async fn build_top_k(config: &GraphConfig) -> Result<(QueryPlan, scanflow_core::operator::OperatorId)> {
    let client = Arc::new(DataFusionScanClient::new());
    client.register_batch("lineitem", int_batch("l_extendedprice", (1..=100_000).collect()))?;

    let mut plan = QueryPlan::new(config.clone());
    let scan = plan.add_operator(
        "scan",
        SqlTableScan::new("scan", client, SqlTableScanConfig::new("lineitem", "SELECT l_extendedprice FROM lineitem")),
    );
    let top = plan.add_operator(
        "top",
        scanflow_tx::top::Top::new(
            "top",
            100,
            vec![SortExpr::new(ColumnRef::Name("l_extendedprice".into()), ColType::Int, Order::Desc)],
        ),
    );
    let sink = plan.add_operator("collate", Collate::new());
    plan.connect(scan, top)?;
    plan.connect(top, sink)?;
    Ok((plan, sink))
}

/// S3: the same data and K as `top-k`, but via the sampled-threshold
/// `TopKTableScan` pipeline (pilot sample -> threshold -> filtered scan).
async fn build_sampled_top_k(config: &GraphConfig) -> Result<(QueryPlan, scanflow_core::operator::OperatorId)> {
    let client = Arc::new(DataFusionScanClient::new());
    client.register_batch("lineitem", int_batch("l_extendedprice", (1..=100_000).collect()))?;

    let mut topk_config = TopKTableScanConfig::new(
        "lineitem",
        "SELECT l_extendedprice FROM lineitem",
        "l_extendedprice",
        ColType::Int,
        Order::Desc,
        100,
    );
    topk_config.k_scale = 50; // sample_size = 5000, matching S3's spec scenario

    let mut plan = QueryPlan::new(config.clone());
    let scan = plan.add_operator("sampled_topk", TopKTableScan::new("sampled_topk", client, topk_config));
    let sink = plan.add_operator("collate", Collate::new());
    plan.connect(scan, sink)?;
    Ok((plan, sink))
}

/// S4: left side is keys {1,3,5,7}; right side is a scan of a 10-key
/// table pruned by a bloom filter built from the left side.
async fn build_bloom_join(config: &GraphConfig) -> Result<(QueryPlan, scanflow_core::operator::OperatorId)> {
    let client = Arc::new(DataFusionScanClient::new());
    client.register_batch("orders", int_batch("orderkey", (1..=10).collect()))?;

    let mut plan = QueryPlan::new(config.clone());
    let left = plan.add_operator(
        "left_keys",
        RowFeed::new("orderkey", vec![1, 3, 5, 7]),
    );
    let bloom = plan.add_operator("bloom", BloomCreate::new("bloom", "orderkey", config.max_remote_expression_len));
    let scan = plan.add_operator(
        "right_scan",
        SqlTableScanBloomUse::new("right_scan", client, "orders", "SELECT orderkey FROM orders", "CAST(orderkey AS BIGINT)"),
    );
    let sink = plan.add_operator("collate", Collate::new());
    plan.connect(left, bloom)?;
    plan.connect(bloom, scan)?;
    plan.connect(scan, sink)?;
    Ok((plan, sink))
}

/// S5: left `{(1,a),(2,b)}`, right `{(1,x),(1,y),(2,z)}`, joined on the first field.
async fn build_nested_loop_join(config: &GraphConfig) -> Result<(QueryPlan, scanflow_core::operator::OperatorId)> {
    let mut plan = QueryPlan::new(config.clone());
    let left = plan.add_operator("left", TableFeed::new(("key", "val"), vec![1, 2], vec!["a", "b"]));
    let right = plan.add_operator("right", TableFeed::new(("key", "val"), vec![1, 1, 2], vec!["x", "y", "z"]));
    let join = plan.add_operator(
        "join",
        NestedLoopJoin::new("join", JoinExpr::new(ColumnRef::Name("key".into()), ColumnRef::Name("key".into()))),
    );
    let sink = plan.add_operator("collate", Collate::new());
    plan.connect_left(left, join)?;
    plan.connect_right(right, join)?;
    plan.connect(join, sink)?;
    Ok((plan, sink))
}

/// S6: 10,000,000 distinct values, a tight fp_rate, and a tiny expression
/// budget: the bloom create must raise its effective rate and warn
/// rather than fail. Scaled down to a size this demo can build quickly;
/// the budget is what forces the overflow, not the value count.
async fn build_overflow(config: &GraphConfig) -> Result<(QueryPlan, scanflow_core::operator::OperatorId)> {
    let client = Arc::new(DataFusionScanClient::new());
    client.register_batch("orders", int_batch("orderkey", (1..=1000).collect()))?;

    let mut plan = QueryPlan::new(config.clone());
    let left = plan.add_operator("left_keys", RowFeed::new("orderkey", (1..=10_000).collect()));
    let tiny_budget = 200; // far too small to fit a 0.001 fp-rate filter over 10,000 values
    let bloom = plan.add_operator("bloom", BloomCreate::with_fp_rate("bloom", "orderkey", tiny_budget, 0.001));
    let scan = plan.add_operator(
        "right_scan",
        SqlTableScanBloomUse::new("right_scan", client, "orders", "SELECT orderkey FROM orders", "CAST(orderkey AS BIGINT)"),
    );
    let sink = plan.add_operator("collate", Collate::new());
    plan.connect(left, bloom)?;
    plan.connect(bloom, scan)?;
    plan.connect(scan, sink)?;
    Ok((plan, sink))
}

/// Feeds a single-column table of integer values through, used as the
/// left side of a bloom join demo where no remote scan is involved.
struct RowFeed {
    header: String,
    values: Vec<i64>,
}

impl RowFeed {
    fn new(header: impl Into<String>, values: Vec<i64>) -> Self {
        Self { header: header.into(), values }
    }
}

#[async_trait::async_trait]
impl scanflow_core::operator::Operator for RowFeed {
    async fn run(&mut self, env: &mut scanflow_core::operator::Env<'_>) -> Result<(), scanflow_core::error::EngineError> {
        env.send(vec![scanflow_core::message::Message::Tuple(vec![self.header.clone()])]).await?;
        for v in self.values.drain(..) {
            env.send(vec![scanflow_core::message::Message::Tuple(vec![v.to_string()])]).await?;
        }
        env.complete().await
    }

    async fn on_receive(
        &mut self,
        _env: &mut scanflow_core::operator::Env<'_>,
        _messages: Vec<scanflow_core::message::Message>,
        _producer: scanflow_core::operator::OperatorId,
    ) -> Result<(), scanflow_core::error::EngineError> {
        Ok(())
    }
}

/// Feeds a small fixed two-column table through, used for the
/// nested-loop join demo's left/right sides.
struct TableFeed {
    header: (String, String),
    keys: Vec<i64>,
    vals: Vec<String>,
}

impl TableFeed {
    fn new(header: (&str, &str), keys: Vec<i64>, vals: Vec<&str>) -> Self {
        if keys.len() != vals.len() {
            // caller bug in this demo binary, not a runtime data condition
            panic!("TableFeed: keys and vals must have equal length");
        }
        Self {
            header: (header.0.to_string(), header.1.to_string()),
            keys,
            vals: vals.into_iter().map(str::to_string).collect(),
        }
    }
}

#[async_trait::async_trait]
impl scanflow_core::operator::Operator for TableFeed {
    async fn run(&mut self, env: &mut scanflow_core::operator::Env<'_>) -> Result<(), scanflow_core::error::EngineError> {
        env.send(vec![scanflow_core::message::Message::Tuple(vec![self.header.0.clone(), self.header.1.clone()])])
            .await?;
        for (k, v) in self.keys.drain(..).zip(self.vals.drain(..)) {
            env.send(vec![scanflow_core::message::Message::Tuple(vec![k.to_string(), v])]).await?;
        }
        env.complete().await
    }

    async fn on_receive(
        &mut self,
        _env: &mut scanflow_core::operator::Env<'_>,
        _messages: Vec<scanflow_core::message::Message>,
        _producer: scanflow_core::operator::OperatorId,
    ) -> Result<(), scanflow_core::error::EngineError> {
        Ok(())
    }
}
