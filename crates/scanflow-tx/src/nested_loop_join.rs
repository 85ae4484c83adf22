//! Inner join via nested loops, grounded on
//! `s3filter/op/nested_loop_join.py`'s `NestedLoopJoin`: buffer both
//! sides, then on full completion emit the joined header followed by
//! every matching pair. Equality is on the raw string field value,
//! exactly as the original's `l_tuple[idx] == r_tuple[idx]` compared
//! without casting.

use crate::expr::JoinExpr;
use async_trait::async_trait;
use scanflow_core::error::{EngineError, PlanError};
use scanflow_core::message::{Message, RowTuple};
use scanflow_core::operator::{Env, Operator, OperatorId, Side};

pub struct NestedLoopJoin {
    name: String,
    join_expr: JoinExpr,
    left_producer: Option<OperatorId>,
    right_producer: Option<OperatorId>,
    left_header: Option<RowTuple>,
    right_header: Option<RowTuple>,
    left_rows: Vec<RowTuple>,
    right_rows: Vec<RowTuple>,
    rows_joined: u64,
    l_rows_processed: usize,
    r_rows_processed: usize,
}

impl NestedLoopJoin {
    pub fn new(name: impl Into<String>, join_expr: JoinExpr) -> Self {
        Self {
            name: name.into(),
            join_expr,
            left_producer: None,
            right_producer: None,
            left_header: None,
            right_header: None,
            left_rows: Vec::new(),
            right_rows: Vec::new(),
            rows_joined: 0,
            l_rows_processed: 0,
            r_rows_processed: 0,
        }
    }

    fn side_of(&self, producer: OperatorId) -> Option<Side> {
        if self.left_producer == Some(producer) {
            Some(Side::Left)
        } else if self.right_producer == Some(producer) {
            Some(Side::Right)
        } else {
            None
        }
    }
}

#[async_trait]
impl Operator for NestedLoopJoin {
    fn bind_producer(&mut self, producer: OperatorId, side: Option<Side>) -> Result<(), PlanError> {
        match side {
            Some(Side::Left) => {
                if self.left_producer.is_some() {
                    return Err(PlanError::DuplicateBinding(self.name.clone(), "left"));
                }
                if self.right_producer == Some(producer) {
                    return Err(PlanError::AmbiguousJoinSide(producer));
                }
                self.left_producer = Some(producer);
                Ok(())
            }
            Some(Side::Right) => {
                if self.right_producer.is_some() {
                    return Err(PlanError::DuplicateBinding(self.name.clone(), "right"));
                }
                if self.left_producer == Some(producer) {
                    return Err(PlanError::AmbiguousJoinSide(producer));
                }
                self.right_producer = Some(producer);
                Ok(())
            }
            None => Err(PlanError::RejectedConnection {
                producer,
                consumer: OperatorId(0),
                reason: "NestedLoopJoin requires connect_left/connect_right, not connect".to_string(),
            }),
        }
    }

    async fn on_receive(&mut self, _env: &mut Env<'_>, messages: Vec<Message>, producer: OperatorId) -> Result<(), EngineError> {
        let side = self
            .side_of(producer)
            .ok_or_else(|| EngineError::schema(&self.name, format!("received data from unconnected producer {producer:?}")))?;

        for message in messages {
            let row = match message {
                Message::Tuple(row) => row,
                other => return Err(EngineError::schema(&self.name, format!("unexpected message {other:?}"))),
            };
            match side {
                Side::Left => {
                    if self.left_header.is_none() {
                        self.left_header = Some(row);
                    } else {
                        self.left_rows.push(row);
                    }
                }
                Side::Right => {
                    if self.right_header.is_none() {
                        self.right_header = Some(row);
                    } else {
                        self.right_rows.push(row);
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_drain(&mut self, env: &mut Env<'_>) -> Result<(), EngineError> {
        self.l_rows_processed = self.left_rows.len();
        self.r_rows_processed = self.right_rows.len();

        let (left_header, right_header) = match (&self.left_header, &self.right_header) {
            (Some(l), Some(r)) => (l.clone(), r.clone()),
            _ => return Ok(()), // a side produced nothing at all: no header, no rows, no join output
        };

        let l_idx = self
            .join_expr
            .left
            .resolve(&left_header)
            .ok_or_else(|| EngineError::schema(&self.name, format!("left join column {:?} not in header {:?}", self.join_expr.left, left_header)))?;
        let r_idx = self
            .join_expr
            .right
            .resolve(&right_header)
            .ok_or_else(|| EngineError::schema(&self.name, format!("right join column {:?} not in header {:?}", self.join_expr.right, right_header)))?;

        let mut joined_header = left_header.clone();
        joined_header.extend(right_header.clone());
        env.send(vec![Message::Tuple(joined_header)]).await?;

        for l_tuple in &self.left_rows {
            if env.is_completed() {
                break;
            }
            for r_tuple in &self.right_rows {
                if env.is_completed() {
                    break;
                }
                if l_tuple[l_idx] == r_tuple[r_idx] {
                    let mut joined = l_tuple.clone();
                    joined.extend(r_tuple.clone());
                    self.rows_joined += 1;
                    env.send(vec![Message::Tuple(joined)]).await?;
                }
            }
        }

        self.left_rows.clear();
        self.right_rows.clear();
        Ok(())
    }

    fn metrics_extra(&self) -> serde_json::Value {
        serde_json::json!({
            "l_rows_processed": self.l_rows_processed,
            "r_rows_processed": self.r_rows_processed,
            "rows_joined": self.rows_joined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ColumnRef;
    use async_trait::async_trait;
    use scanflow_core::config::GraphConfig;
    use scanflow_core::plan::QueryPlan;

    struct FeedOnce {
        rows: Vec<RowTuple>,
    }

    #[async_trait]
    impl Operator for FeedOnce {
        async fn run(&mut self, env: &mut Env<'_>) -> Result<(), EngineError> {
            for row in self.rows.drain(..) {
                env.send(vec![Message::Tuple(row)]).await?;
            }
            env.complete().await
        }

        async fn on_receive(&mut self, _env: &mut Env<'_>, _messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
            Ok(())
        }
    }

    struct Capture {
        rows: Vec<RowTuple>,
    }

    #[async_trait]
    impl Operator for Capture {
        async fn on_receive(&mut self, _env: &mut Env<'_>, messages: Vec<Message>, _producer: OperatorId) -> Result<(), EngineError> {
            for m in messages {
                if let Message::Tuple(t) = m {
                    self.rows.push(t);
                }
            }
            Ok(())
        }

        async fn on_snapshot(&mut self, _env: &mut Env<'_>) -> Result<scanflow_core::message::RowTable, EngineError> {
            Ok(self.rows.clone())
        }
    }

    #[tokio::test]
    async fn joins_matching_keys_from_both_sides() {
        let mut plan = QueryPlan::new(GraphConfig::default());
        let left = plan.add_operator(
            "left",
            FeedOnce {
                rows: vec![
                    vec!["l_orderkey".into()],
                    vec!["1".into()],
                    vec!["2".into()],
                ],
            },
        );
        let right = plan.add_operator(
            "right",
            FeedOnce {
                rows: vec![
                    vec!["o_orderkey".into(), "o_total".into()],
                    vec!["1".into(), "99".into()],
                    vec!["3".into(), "50".into()],
                ],
            },
        );
        let join = plan.add_operator(
            "join",
            NestedLoopJoin::new("join", JoinExpr::new(ColumnRef::Name("l_orderkey".into()), ColumnRef::Name("o_orderkey".into()))),
        );
        let sink = plan.add_operator("sink", Capture { rows: Vec::new() });
        plan.connect_left(left, join).unwrap();
        plan.connect_right(right, join).unwrap();
        plan.connect(join, sink).unwrap();
        plan.execute().await.unwrap();
        let rows = plan.tuples(sink).await.unwrap();
        assert_eq!(rows[0], vec!["l_orderkey".to_string(), "o_orderkey".to_string(), "o_total".to_string()]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec!["1".to_string(), "1".to_string(), "99".to_string()]);
    }

    #[test]
    fn rejects_same_producer_on_both_sides() {
        let mut plan = QueryPlan::new(GraphConfig::default());
        let src = plan.add_operator("src", FeedOnce { rows: vec![] });
        let join = plan.add_operator(
            "join",
            NestedLoopJoin::new("join", JoinExpr::new(ColumnRef::Name("a".into()), ColumnRef::Name("b".into()))),
        );
        plan.connect_left(src, join).unwrap();
        assert!(matches!(plan.connect_right(src, join), Err(PlanError::AmbiguousJoinSide(_))));
    }
}
