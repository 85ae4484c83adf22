//! Remote-scan-backed operators (sources and the bloom-consuming scan)
//! plus the `Collate` sink, built on top of `scanflow-core`'s graph
//! primitives and `scanflow-tx`'s in-memory transforms.

pub mod bloom_scan;
pub mod collate;
pub mod dummy_top;
pub mod remote;
pub mod sql_table_scan;
pub mod topk_table_scan;

pub use bloom_scan::SqlTableScanBloomUse;
pub use collate::Collate;
pub use dummy_top::{DummyTop, DummyTopConfig};
pub use remote::{ComputeOffloadClient, DataFusionScanClient, RemoteScanClient, ScanFormat, ScanOutcome};
pub use sql_table_scan::{ShardConcurrency, SqlShardedTableScan, SqlTableScan, SqlTableScanConfig};
pub use topk_table_scan::{ShardSpec, TopKTableScan, TopKTableScanConfig};
