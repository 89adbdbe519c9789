//! Query entry points of an index.

use roaring::RoaringTreemap;
use tracing::debug;

use super::convert::Convert;
use super::iterator::{LookupIterator, ScanIterator};
use super::Index;
use crate::context::Context;
use crate::error::Result;
use crate::query::{Filter, FilterMode, FilterNode};
use crate::schema::{IndexKind, Value};
use crate::store::Db;

/// Row ids produced by an index query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexResult {
    pub rows: RoaringTreemap,
    /// Set when keys are hashes: the caller must re-check the real values.
    pub collide: bool,
}

fn is_empty_list(flt: &Filter) -> bool {
    flt.mode == FilterMode::In && matches!(&flt.value, Value::List(v) if v.is_empty())
}

impl<D: Db> Index<D> {
    /// Reports whether this index can serve `node`.
    pub fn can_match(&self, node: &FilterNode) -> bool {
        match self.schema.kind {
            IndexKind::Hash => match node {
                FilterNode::Leaf(f) => {
                    f.field == self.schema.fields[0]
                        && matches!(f.mode, FilterMode::Equal | FilterMode::In)
                }
                _ => false,
            },
            IndexKind::Int => {
                let leaves = node.leaves();
                !leaves.is_empty()
                    && leaves.iter().all(|f| {
                        f.field == self.schema.fields[0] && f.mode != FilterMode::NotEqual
                    })
            }
            IndexKind::Composite => {
                let FilterNode::And(children) = node else {
                    return false;
                };
                self.schema.fields.iter().all(|field| {
                    children.iter().any(|c| {
                        matches!(c, FilterNode::Leaf(f) if f.field == *field && f.mode == FilterMode::Equal)
                    })
                })
            }
        }
    }

    /// Returns the rows matching `node`, or `None` when the index cannot
    /// serve it.
    pub fn query(&mut self, ctx: &Context, node: &FilterNode) -> Result<Option<IndexResult>> {
        if !self.can_match(node) {
            return Ok(None);
        }
        let result = match (self.schema.kind, node) {
            (IndexKind::Composite, _) => return self.query_composite(ctx, node),
            (_, FilterNode::Leaf(f)) if is_empty_list(f) => IndexResult {
                rows: RoaringTreemap::new(),
                collide: self.schema.kind == IndexKind::Hash,
            },
            (IndexKind::Hash, _) => IndexResult {
                rows: self.lookup(ctx, node)?,
                collide: true,
            },
            (IndexKind::Int, FilterNode::Leaf(f))
                if matches!(f.mode, FilterMode::Equal | FilterMode::In) =>
            {
                IndexResult {
                    rows: self.lookup(ctx, node)?,
                    collide: false,
                }
            }
            (IndexKind::Int, _) => IndexResult {
                rows: self.scan(ctx, node)?,
                collide: false,
            },
        };
        self.metrics.record_query(result.rows.len());
        debug!(index = %self.name(), filter = %node, rows = result.rows.len(), "Index query");
        Ok(Some(result))
    }

    /// Serves an AND group with an equality condition on every indexed
    /// field of a composite index.
    pub fn query_composite(
        &mut self,
        ctx: &Context,
        node: &FilterNode,
    ) -> Result<Option<IndexResult>> {
        if self.schema.kind != IndexKind::Composite || !self.can_match(node) {
            return Ok(None);
        }
        let rows = self.lookup(ctx, node)?;
        self.metrics.record_query(rows.len());
        debug!(index = %self.name(), filter = %node, rows = rows.len(), "Composite query");
        Ok(Some(IndexResult {
            rows,
            collide: true,
        }))
    }

    fn lookup(&self, ctx: &Context, node: &FilterNode) -> Result<RoaringTreemap> {
        let keys = self.converter.query_keys(node)?;
        if keys.is_empty() {
            return Ok(RoaringTreemap::new());
        }
        LookupIterator::new(
            &self.db,
            &self.buckets,
            self.cache.as_ref(),
            self.opts.pack_size,
            keys,
        )?
        .collect(ctx)
    }

    fn scan(&self, ctx: &Context, node: &FilterNode) -> Result<RoaringTreemap> {
        let filter = self.converter.query_filter(node)?;
        ScanIterator::new(
            &self.db,
            &self.buckets,
            self.cache.as_ref(),
            self.opts.pack_size,
            filter,
        )?
        .collect(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexOptions;
    use crate::index::tests::{orders_page, small_opts, test_table};
    use crate::pack::WriteMode;
    use crate::schema::IndexSchema;
    use crate::store::mem::MemDb;
    use crate::cache::BlockCache;
    use std::sync::{Arc, Mutex};

    fn rows(result: Option<IndexResult>) -> Vec<u64> {
        result.unwrap().rows.iter().collect()
    }

    fn sample() -> Vec<(u64, i64, &'static str, u32)> {
        vec![
            (1, 40, "ann", 1),
            (2, -10, "bob", 2),
            (3, 25, "cid", 1),
            (4, 40, "dee", 3),
            (5, 0, "bob", 2),
            (6, 99, "eve", 1),
            (7, -3, "fay", 3),
        ]
    }

    fn index(kind: IndexKind, fields: &[&str], opts: IndexOptions) -> Index<MemDb> {
        let ctx = Context::new();
        let schema = IndexSchema::new("q_idx", kind, fields, "id");
        let mut idx = Index::create(MemDb::in_memory(), test_table(), schema, opts).unwrap();
        idx.add_pack(&ctx, &orders_page(&sample()), WriteMode::All).unwrap();
        idx.finalize(&ctx, 1).unwrap();
        idx
    }

    fn eq(field: &str, v: Value) -> FilterNode {
        FilterNode::leaf(field, FilterMode::Equal, v)
    }

    #[test]
    fn test_shared_cache_keeps_indexes_apart() {
        let ctx = Context::new();
        let db = MemDb::in_memory();
        let shared = Arc::new(Mutex::new(BlockCache::new(16)));
        let page = orders_page(&[(1, 5, "ann", 1), (2, 6, "bob", 7)]);

        let mut by_region = Index::create(
            db.clone(),
            test_table(),
            IndexSchema::new("region_idx", IndexKind::Int, &["region"], "id"),
            small_opts(4, 1 << 20),
        )
        .unwrap()
        .with_cache(shared.clone());
        let mut by_id = Index::create(
            db,
            test_table(),
            IndexSchema::new("id_idx", IndexKind::Int, &["id"], "id"),
            small_opts(4, 1 << 20),
        )
        .unwrap()
        .with_cache(shared);
        for idx in [&mut by_region, &mut by_id] {
            idx.add_pack(&ctx, &page, WriteMode::All).unwrap();
            idx.finalize(&ctx, 1).unwrap();
        }

        // both indexes have their first pack at (1, 1)
        assert_eq!(rows(by_region.query(&ctx, &eq("region", Value::from(7u32))).unwrap()), vec![2]);
        assert_eq!(rows(by_id.query(&ctx, &eq("id", Value::from(2u64))).unwrap()), vec![2]);
        assert_eq!(rows(by_region.query(&ctx, &eq("region", Value::from(1u32))).unwrap()), vec![1]);
    }

    #[test]
    fn test_can_match() {
        let hash = index(IndexKind::Hash, &["name"], small_opts(4, 1 << 20));
        assert!(hash.can_match(&eq("name", Value::from("bob"))));
        assert!(!hash.can_match(&FilterNode::leaf("name", FilterMode::Lt, Value::from("bob"))));
        assert!(!hash.can_match(&eq("region", Value::Uint(1))));

        let int = index(IndexKind::Int, &["amount"], small_opts(4, 1 << 20));
        assert!(int.can_match(&FilterNode::leaf("amount", FilterMode::Ge, Value::Int(3))));
        assert!(!int.can_match(&FilterNode::leaf("amount", FilterMode::NotEqual, Value::Int(3))));

        let comp = index(IndexKind::Composite, &["region", "name"], small_opts(4, 1 << 20));
        let both = FilterNode::And(vec![eq("name", Value::from("bob")), eq("region", Value::Uint(2))]);
        assert!(comp.can_match(&both));
        assert!(!comp.can_match(&FilterNode::And(vec![eq("region", Value::Uint(2))])));
        assert!(!comp.can_match(&eq("region", Value::Uint(2))));
    }

    #[test]
    fn test_hash_lookup() {
        let ctx = Context::new();
        let mut idx = index(IndexKind::Hash, &["name"], small_opts(2, 1 << 20));
        let res = idx.query(&ctx, &eq("name", Value::from("bob"))).unwrap();
        assert!(res.as_ref().unwrap().collide);
        assert_eq!(rows(res), vec![2, 5]);

        let list = Value::List(vec![Value::from("eve"), Value::from("ann"), Value::from("zed")]);
        let res = idx.query(&ctx, &FilterNode::leaf("name", FilterMode::In, list)).unwrap();
        assert_eq!(rows(res), vec![1, 6]);
        assert_eq!(idx.metrics().query_calls, 2);
    }

    #[test]
    fn test_int_lookup_and_scan() {
        let ctx = Context::new();
        let mut idx = index(IndexKind::Int, &["amount"], small_opts(2, 1 << 20));

        let res = idx.query(&ctx, &eq("amount", Value::Int(40))).unwrap();
        assert!(!res.as_ref().unwrap().collide);
        assert_eq!(rows(res), vec![1, 4]);

        let lt = FilterNode::leaf("amount", FilterMode::Lt, Value::Int(0));
        assert_eq!(rows(idx.query(&ctx, &lt).unwrap()), vec![2, 7]);

        let range = FilterNode::leaf("amount", FilterMode::Range, Value::range(Value::Int(0), Value::Int(40)));
        assert_eq!(rows(idx.query(&ctx, &range).unwrap()), vec![1, 3, 4, 5]);

        let nin = FilterNode::leaf(
            "amount",
            FilterMode::NotIn,
            Value::List(vec![Value::Int(40), Value::Int(-10)]),
        );
        assert_eq!(rows(idx.query(&ctx, &nin).unwrap()), vec![3, 5, 6, 7]);

        let either = FilterNode::Or(vec![
            FilterNode::leaf("amount", FilterMode::Le, Value::Int(-10)),
            FilterNode::leaf("amount", FilterMode::Gt, Value::Int(40)),
        ]);
        assert_eq!(rows(idx.query(&ctx, &either).unwrap()), vec![2, 6]);
    }

    #[test]
    fn test_empty_in_list() {
        let ctx = Context::new();
        let mut idx = index(IndexKind::Int, &["amount"], small_opts(4, 1 << 20));
        let node = FilterNode::leaf("amount", FilterMode::In, Value::List(vec![]));
        let res = idx.query(&ctx, &node).unwrap().unwrap();
        assert!(res.rows.is_empty());
    }

    #[test]
    fn test_unserved_condition() {
        let ctx = Context::new();
        let mut idx = index(IndexKind::Hash, &["name"], small_opts(4, 1 << 20));
        let node = FilterNode::leaf("name", FilterMode::NotIn, Value::List(vec![]));
        assert!(idx.query(&ctx, &node).unwrap().is_none());
        assert!(idx.query_composite(&ctx, &eq("name", Value::from("bob"))).unwrap().is_none());
    }

    #[test]
    fn test_composite_query() {
        let ctx = Context::new();
        let mut idx = index(IndexKind::Composite, &["region", "name"], small_opts(4, 1 << 20));
        // condition order differs from field order
        let node = FilterNode::And(vec![eq("name", Value::from("bob")), eq("region", Value::Uint(2))]);
        let res = idx.query_composite(&ctx, &node).unwrap().unwrap();
        assert!(res.collide);
        assert_eq!(res.rows.iter().collect::<Vec<_>>(), vec![2, 5]);

        let miss = FilterNode::And(vec![eq("name", Value::from("bob")), eq("region", Value::Uint(1))]);
        assert_eq!(rows(idx.query(&ctx, &miss).unwrap()), Vec::<u64>::new());
    }

    #[test]
    fn test_deleted_rows_not_found() {
        let ctx = Context::new();
        let mut idx = index(IndexKind::Hash, &["name"], small_opts(2, 1 << 20));
        let page = orders_page(&sample()).with_selection(vec![1]);
        idx.del_pack(&ctx, &page, WriteMode::IncludeSelected, 2).unwrap();
        idx.finalize(&ctx, 2).unwrap();
        assert_eq!(rows(idx.query(&ctx, &eq("name", Value::from("bob"))).unwrap()), vec![5]);
    }

    #[test]
    fn test_cancelled_query() {
        let ctx = Context::new();
        let mut idx = index(IndexKind::Int, &["amount"], small_opts(2, 1 << 20));
        ctx.cancel();
        let lt = FilterNode::leaf("amount", FilterMode::Lt, Value::Int(50));
        assert!(idx.query(&ctx, &lt).is_err());
    }
}
