//! In-memory transform operators for the scanflow pushdown query
//! engine: `Project`, `Sort`, `Top`, `NestedLoopJoin` and `BloomCreate`.
//! None of these talk to a `RemoteScanClient` - that's `scanflow-io`'s
//! job; this crate only ever reacts to messages already inside the
//! graph.

pub mod bloom_create;
pub mod expr;
pub mod nested_loop_join;
pub mod project;
pub mod sort;
pub mod top;

pub use bloom_create::BloomCreate;
pub use expr::{ColumnRef, JoinExpr, Order, SortExpr};
pub use nested_loop_join::NestedLoopJoin;
pub use project::{Project, ProjectExpr};
pub use sort::Sort;
pub use top::Top;
