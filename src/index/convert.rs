//! Conversion of table pages into two-column index pages.

use xxhash_rust::xxh64::xxh64;

use crate::encoding::keycode::{order_f64, order_i64};
use crate::error::{Error, Result};
use crate::pack::{Block, BlockType, Package, WriteMode};
use crate::query::{Filter, FilterMode, FilterNode, KeyFilter, KeyMatch};
use crate::schema::{FieldType, IndexKind, IndexSchema, Schema, Value};

/// Seed of the 64-bit key hash.
const HASH_SEED: u64 = 0;

/// Turns table pages into index pages and query literals into index keys.
pub trait Convert {
    /// Produces an index page with a key column and a row id column from
    /// the rows of `pkg` selected by `mode`.
    fn convert_pack(&self, pkg: &Package, mode: WriteMode) -> Result<Package>;

    /// Translates an equality condition into sorted, unique index keys.
    fn query_keys(&self, node: &FilterNode) -> Result<Vec<u64>>;
}

/// Maps an orderable column value into the u64 key domain.
fn order_key(block: &Block, row: usize) -> Result<u64> {
    Ok(match block {
        Block::U64(v) => v[row],
        Block::U32(v) => v[row] as u64,
        Block::U16(v) => v[row] as u64,
        Block::U8(v) => v[row] as u64,
        Block::I64(v) => order_i64(v[row]),
        Block::I32(v) => order_i64(v[row] as i64),
        Block::I16(v) => order_i64(v[row] as i64),
        Block::I8(v) => order_i64(v[row] as i64),
        Block::F64(v) => order_f64(v[row]),
        Block::F32(v) => order_f64(v[row] as f64),
        Block::Bool(v) => v[row] as u64,
        Block::Bytes(_) => {
            return Err(Error::Contract("bytes column cannot back an ordered index".into()))
        }
    })
}

fn list_values(flt: &Filter) -> Result<&[Value]> {
    match &flt.value {
        Value::List(values) => Ok(values),
        other => Err(Error::Contract(format!(
            "{} filter on {} requires a list value, found {other:?}",
            flt.mode, flt.field
        ))),
    }
}

fn sorted_unique(mut keys: Vec<u64>) -> Vec<u64> {
    keys.sort_unstable();
    keys.dedup();
    keys
}

fn index_page(len: usize) -> Package {
    Package::new(&[BlockType::U64, BlockType::U64], len.max(1))
}

/// Ordered integer index: relinks one column into the key domain.
#[derive(Debug, Clone)]
pub struct Relink {
    field: String,
    typ: FieldType,
    src: usize,
    row_id: usize,
}

impl Relink {
    fn key_of(&self, value: &Value) -> Result<u64> {
        value.order_key(self.typ)
    }

    /// Translates a condition tree on the indexed field into key space.
    pub fn query_filter(&self, node: &FilterNode) -> Result<KeyFilter> {
        Ok(match node {
            FilterNode::Leaf(flt) => KeyFilter::Leaf(self.query_match(flt)?),
            FilterNode::And(c) => KeyFilter::And(
                c.iter().map(|n| self.query_filter(n)).collect::<Result<_>>()?,
            ),
            FilterNode::Or(c) => KeyFilter::Or(
                c.iter().map(|n| self.query_filter(n)).collect::<Result<_>>()?,
            ),
        })
    }

    fn query_match(&self, flt: &Filter) -> Result<KeyMatch> {
        if flt.field != self.field {
            return Err(Error::Contract(format!(
                "filter on {} sent to index on {}",
                flt.field, self.field
            )));
        }
        let list = |flt: &Filter| -> Result<Vec<u64>> {
            list_values(flt)?.iter().map(|v| self.key_of(v)).collect()
        };
        Ok(match flt.mode {
            FilterMode::Equal => KeyMatch::Equal(self.key_of(&flt.value)?),
            FilterMode::In => KeyMatch::in_list(list(flt)?),
            FilterMode::NotIn => KeyMatch::not_in_list(list(flt)?),
            FilterMode::Lt => KeyMatch::Lt(self.key_of(&flt.value)?),
            FilterMode::Le => KeyMatch::Le(self.key_of(&flt.value)?),
            FilterMode::Gt => KeyMatch::Gt(self.key_of(&flt.value)?),
            FilterMode::Ge => KeyMatch::Ge(self.key_of(&flt.value)?),
            FilterMode::Range => match &flt.value {
                Value::Range(from, to) => KeyMatch::Range(self.key_of(from)?, self.key_of(to)?),
                other => {
                    return Err(Error::Contract(format!(
                        "range filter on {} requires a range value, found {other:?}",
                        flt.field
                    )))
                }
            },
            FilterMode::NotEqual => {
                return Err(Error::Contract(format!(
                    "{} is not served by ordered indexes",
                    flt.mode
                )))
            }
        })
    }
}

impl Convert for Relink {
    fn convert_pack(&self, pkg: &Package, mode: WriteMode) -> Result<Package> {
        let rows = pkg.rows(mode);
        let src = pkg.block(self.src)?;
        let row_ids = pkg.u64s(self.row_id)?;
        let mut out = index_page(rows.len());
        for i in rows {
            out.push_u64s(&[order_key(src, i)?, row_ids[i]])?;
        }
        Ok(out)
    }

    fn query_keys(&self, node: &FilterNode) -> Result<Vec<u64>> {
        match self.query_filter(node)? {
            KeyFilter::Leaf(KeyMatch::Equal(k)) => Ok(vec![k]),
            KeyFilter::Leaf(KeyMatch::In(keys)) => Ok(keys),
            _ => Err(Error::Contract(format!("{node} is not an equality condition"))),
        }
    }
}

/// Hash of a single column's wire encoding.
#[derive(Debug, Clone)]
pub struct SimpleHash {
    field: String,
    typ: FieldType,
    src: usize,
    row_id: usize,
}

impl SimpleHash {
    fn hash_value(&self, value: &Value, buf: &mut Vec<u8>) -> Result<u64> {
        buf.clear();
        value.write_wire(self.typ, buf)?;
        Ok(xxh64(buf, HASH_SEED))
    }
}

impl Convert for SimpleHash {
    fn convert_pack(&self, pkg: &Package, mode: WriteMode) -> Result<Package> {
        let rows = pkg.rows(mode);
        let src = pkg.block(self.src)?;
        let row_ids = pkg.u64s(self.row_id)?;
        let mut out = index_page(rows.len());
        let mut buf = Vec::with_capacity(16);
        for i in rows {
            buf.clear();
            src.write_wire(i, &mut buf)?;
            out.push_u64s(&[xxh64(&buf, HASH_SEED), row_ids[i]])?;
        }
        Ok(out)
    }

    fn query_keys(&self, node: &FilterNode) -> Result<Vec<u64>> {
        let FilterNode::Leaf(flt) = node else {
            return Err(Error::Contract(format!("hash index cannot serve {node}")));
        };
        let mut buf = Vec::with_capacity(16);
        match flt.mode {
            FilterMode::Equal => Ok(vec![self.hash_value(&flt.value, &mut buf)?]),
            FilterMode::In | FilterMode::NotIn => {
                let keys = list_values(flt)?
                    .iter()
                    .map(|v| self.hash_value(v, &mut buf))
                    .collect::<Result<Vec<_>>>()?;
                Ok(sorted_unique(keys))
            }
            mode => Err(Error::Contract(format!(
                "{mode} filter on {} cannot be hashed",
                self.field
            ))),
        }
    }
}

/// Hash over the concatenated wire encodings of several columns.
#[derive(Debug, Clone)]
pub struct CompositeHash {
    fields: Vec<String>,
    types: Vec<FieldType>,
    srcs: Vec<usize>,
    row_id: usize,
}

impl Convert for CompositeHash {
    fn convert_pack(&self, pkg: &Package, mode: WriteMode) -> Result<Package> {
        let rows = pkg.rows(mode);
        let srcs = self
            .srcs
            .iter()
            .map(|&s| pkg.block(s))
            .collect::<Result<Vec<_>>>()?;
        let row_ids = pkg.u64s(self.row_id)?;
        let mut out = index_page(rows.len());
        let mut buf = Vec::with_capacity(16 * srcs.len());
        for i in rows {
            buf.clear();
            for b in &srcs {
                b.write_wire(i, &mut buf)?;
            }
            out.push_u64s(&[xxh64(&buf, HASH_SEED), row_ids[i]])?;
        }
        Ok(out)
    }

    /// Hashes the Equal values found for every indexed field in an AND group.
    fn query_keys(&self, node: &FilterNode) -> Result<Vec<u64>> {
        let FilterNode::And(children) = node else {
            return Err(Error::Contract(format!("composite index cannot serve {node}")));
        };
        let mut buf = Vec::with_capacity(16 * self.fields.len());
        for (field, typ) in self.fields.iter().zip(&self.types) {
            let value = children
                .iter()
                .find_map(|c| match c {
                    FilterNode::Leaf(f) if f.field == *field && f.mode == FilterMode::Equal => {
                        Some(&f.value)
                    }
                    _ => None,
                })
                .ok_or_else(|| {
                    Error::Contract(format!("no equality condition on {field} in {node}"))
                })?;
            value.write_wire(*typ, &mut buf)?;
        }
        Ok(vec![xxh64(&buf, HASH_SEED)])
    }
}

/// The converter of an index, chosen by its kind.
#[derive(Debug, Clone)]
pub enum Converter {
    Relink(Relink),
    SimpleHash(SimpleHash),
    CompositeHash(CompositeHash),
}

impl Converter {
    pub fn new(table: &Schema, index: &IndexSchema) -> Result<Self> {
        index.validate(table)?;
        let lookup = |name: &str| -> Result<(usize, FieldType)> {
            table
                .find(name)
                .map(|(pos, f)| (pos, f.typ))
                .ok_or_else(|| Error::InvalidSchema(format!("unknown field {name}")))
        };
        let (row_id, _) = lookup(&index.row_id)?;
        Ok(match index.kind {
            IndexKind::Int => {
                let (src, typ) = lookup(&index.fields[0])?;
                Converter::Relink(Relink {
                    field: index.fields[0].clone(),
                    typ,
                    src,
                    row_id,
                })
            }
            IndexKind::Hash => {
                let (src, typ) = lookup(&index.fields[0])?;
                Converter::SimpleHash(SimpleHash {
                    field: index.fields[0].clone(),
                    typ,
                    src,
                    row_id,
                })
            }
            IndexKind::Composite => {
                let mut srcs = Vec::with_capacity(index.fields.len());
                let mut types = Vec::with_capacity(index.fields.len());
                for name in &index.fields {
                    let (src, typ) = lookup(name)?;
                    srcs.push(src);
                    types.push(typ);
                }
                Converter::CompositeHash(CompositeHash {
                    fields: index.fields.clone(),
                    types,
                    srcs,
                    row_id,
                })
            }
        })
    }

    /// Key-space filter for range scans. Only ordered indexes support it.
    pub fn query_filter(&self, node: &FilterNode) -> Result<KeyFilter> {
        match self {
            Converter::Relink(c) => c.query_filter(node),
            _ => Err(Error::Contract("hash indexes cannot translate range filters".into())),
        }
    }
}

impl Convert for Converter {
    fn convert_pack(&self, pkg: &Package, mode: WriteMode) -> Result<Package> {
        match self {
            Converter::Relink(c) => c.convert_pack(pkg, mode),
            Converter::SimpleHash(c) => c.convert_pack(pkg, mode),
            Converter::CompositeHash(c) => c.convert_pack(pkg, mode),
        }
    }

    fn query_keys(&self, node: &FilterNode) -> Result<Vec<u64>> {
        match self {
            Converter::Relink(c) => c.query_keys(node),
            Converter::SimpleHash(c) => c.query_keys(node),
            Converter::CompositeHash(c) => c.query_keys(node),
        }
    }
}
