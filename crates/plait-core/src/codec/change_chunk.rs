//! Columnar encoding of a single change.
//!
//! Payload layout: LEB128 header (actor table with the change's own actor
//! first, seq, start-op, time, message, sorted deps), expanded row count,
//! column table (id + byte length per non-empty column, ids ascending),
//! then the column bytes. Multi-value runs are stored expanded, one row
//! per element, and re-collapsed on decode.

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::change::Change;
use crate::identity::{ActorId, ElemId, Key, ObjId, OpId};
use crate::op::{Op, OpType};
use crate::value::{ObjType, ScalarValue};

use super::column::{BooleanDecoder, BooleanEncoder, DeltaDecoder, DeltaEncoder, RleDecoder, RleEncoder};
use super::leb::{write_sleb, write_uleb, Reader};
use super::{encode_chunk, parse_chunk, ChunkType, DecodeError};

const COL_OBJ_ACTOR: u64 = 0;
const COL_OBJ_CTR: u64 = 1;
const COL_KEY_ACTOR: u64 = 2;
const COL_KEY_CTR: u64 = 3;
const COL_KEY_STR: u64 = 4;
const COL_INSERT: u64 = 5;
const COL_ACTION: u64 = 6;
const COL_VAL_LEN: u64 = 7;
const COL_VAL_RAW: u64 = 8;
const COL_CHLD_ACTOR: u64 = 9;
const COL_CHLD_CTR: u64 = 10;
const COL_PRED_NUM: u64 = 11;
const COL_PRED_ACTOR: u64 = 12;
const COL_PRED_CTR: u64 = 13;
const MAX_COL: u64 = COL_PRED_CTR;

const ACTION_MAKE_MAP: u64 = 0;
const ACTION_SET: u64 = 1;
const ACTION_MAKE_LIST: u64 = 2;
const ACTION_DEL: u64 = 3;
const ACTION_MAKE_TEXT: u64 = 4;
const ACTION_INC: u64 = 5;
const ACTION_MAKE_TABLE: u64 = 6;
const ACTION_LINK: u64 = 7;

const VAL_NULL: u64 = 0;
const VAL_FALSE: u64 = 1;
const VAL_TRUE: u64 = 2;
const VAL_INT: u64 = 3;
const VAL_F64: u64 = 4;
const VAL_STR: u64 = 5;
const VAL_COUNTER: u64 = 6;
const VAL_TIMESTAMP: u64 = 7;

fn action_code(action: OpType) -> u64 {
    match action {
        OpType::Make(ObjType::Map) => ACTION_MAKE_MAP,
        OpType::Set => ACTION_SET,
        OpType::Make(ObjType::List) => ACTION_MAKE_LIST,
        OpType::Del => ACTION_DEL,
        OpType::Make(ObjType::Text) => ACTION_MAKE_TEXT,
        OpType::Inc => ACTION_INC,
        OpType::Make(ObjType::Table) => ACTION_MAKE_TABLE,
        OpType::Link => ACTION_LINK,
    }
}

fn action_from_code(code: u64) -> Result<OpType, DecodeError> {
    match code {
        ACTION_MAKE_MAP => Ok(OpType::Make(ObjType::Map)),
        ACTION_SET => Ok(OpType::Set),
        ACTION_MAKE_LIST => Ok(OpType::Make(ObjType::List)),
        ACTION_DEL => Ok(OpType::Del),
        ACTION_MAKE_TEXT => Ok(OpType::Make(ObjType::Text)),
        ACTION_INC => Ok(OpType::Inc),
        ACTION_MAKE_TABLE => Ok(OpType::Make(ObjType::Table)),
        ACTION_LINK => Ok(OpType::Link),
        code => Err(DecodeError::UnknownAction { code }),
    }
}

fn encode_value(value: &ScalarValue, raw: &mut Vec<u8>) -> u64 {
    let before = raw.len();
    let code = match value {
        ScalarValue::Null => VAL_NULL,
        ScalarValue::Bool(false) => VAL_FALSE,
        ScalarValue::Bool(true) => VAL_TRUE,
        ScalarValue::Int(n) => {
            write_sleb(raw, *n);
            VAL_INT
        }
        ScalarValue::F64(n) => {
            raw.extend_from_slice(&n.to_le_bytes());
            VAL_F64
        }
        ScalarValue::Str(s) => {
            raw.extend_from_slice(s.as_bytes());
            VAL_STR
        }
        ScalarValue::Counter(n) => {
            write_sleb(raw, *n);
            VAL_COUNTER
        }
        ScalarValue::Timestamp(n) => {
            write_sleb(raw, *n);
            VAL_TIMESTAMP
        }
    };
    (((raw.len() - before) as u64) << 4) | code
}

fn decode_value(cell: u64, raw: &mut Reader<'_>) -> Result<ScalarValue, DecodeError> {
    let code = cell & 0xf;
    let len = (cell >> 4) as usize;
    let payload = raw.read_bytes(len)?;
    let mut r = Reader::new(payload);
    let value = match code {
        VAL_NULL => ScalarValue::Null,
        VAL_FALSE => ScalarValue::Bool(false),
        VAL_TRUE => ScalarValue::Bool(true),
        VAL_INT => ScalarValue::Int(r.read_sleb()?),
        VAL_F64 => {
            let bytes: [u8; 8] = r.read_bytes(8)?.try_into().expect("8-byte slice");
            ScalarValue::F64(f64::from_le_bytes(bytes))
        }
        VAL_STR => ScalarValue::Str(
            String::from_utf8(payload.to_vec()).map_err(|_| DecodeError::BadUtf8)?,
        ),
        VAL_COUNTER => ScalarValue::Counter(r.read_sleb()?),
        VAL_TIMESTAMP => ScalarValue::Timestamp(r.read_sleb()?),
        code => return Err(DecodeError::UnknownValueCode { code }),
    };
    Ok(value)
}

struct Columns {
    obj_actor: RleEncoder<u64>,
    obj_ctr: RleEncoder<u64>,
    key_actor: RleEncoder<u64>,
    key_ctr: DeltaEncoder,
    key_str: RleEncoder<String>,
    insert: BooleanEncoder,
    action: RleEncoder<u64>,
    val_len: RleEncoder<u64>,
    val_raw: Vec<u8>,
    chld_actor: RleEncoder<u64>,
    chld_ctr: DeltaEncoder,
    pred_num: RleEncoder<u64>,
    pred_actor: RleEncoder<u64>,
    pred_ctr: DeltaEncoder,
}

impl Columns {
    fn new() -> Self {
        Columns {
            obj_actor: RleEncoder::new(),
            obj_ctr: RleEncoder::new(),
            key_actor: RleEncoder::new(),
            key_ctr: DeltaEncoder::new(),
            key_str: RleEncoder::new(),
            insert: BooleanEncoder::new(),
            action: RleEncoder::new(),
            val_len: RleEncoder::new(),
            val_raw: Vec::new(),
            chld_actor: RleEncoder::new(),
            chld_ctr: DeltaEncoder::new(),
            pred_num: RleEncoder::new(),
            pred_actor: RleEncoder::new(),
            pred_ctr: DeltaEncoder::new(),
        }
    }

    fn finish(self) -> Vec<(u64, Vec<u8>)> {
        vec![
            (COL_OBJ_ACTOR, self.obj_actor.finish()),
            (COL_OBJ_CTR, self.obj_ctr.finish()),
            (COL_KEY_ACTOR, self.key_actor.finish()),
            (COL_KEY_CTR, self.key_ctr.finish()),
            (COL_KEY_STR, self.key_str.finish()),
            (COL_INSERT, self.insert.finish()),
            (COL_ACTION, self.action.finish()),
            (COL_VAL_LEN, self.val_len.finish()),
            (COL_VAL_RAW, self.val_raw),
            (COL_CHLD_ACTOR, self.chld_actor.finish()),
            (COL_CHLD_CTR, self.chld_ctr.finish()),
            (COL_PRED_NUM, self.pred_num.finish()),
            (COL_PRED_ACTOR, self.pred_actor.finish()),
            (COL_PRED_CTR, self.pred_ctr.finish()),
        ]
    }
}

/// Actor table for one change: the change's own actor at index 0, every
/// other referenced actor after it in byte order.
fn actor_table(change: &Change) -> Vec<ActorId> {
    let mut others: BTreeSet<ActorId> = BTreeSet::new();
    for row in change.expanded_ops() {
        if let ObjId::Op(id) = row.obj {
            others.insert(id.actor.clone());
        }
        if let Key::Elem(ElemId::Op(id)) = &row.key {
            others.insert(id.actor.clone());
        }
        if let Some(child) = row.child {
            others.insert(child.actor.clone());
        }
        for pred in row.pred {
            others.insert(pred.actor.clone());
        }
    }
    let mut table = vec![change.actor.clone()];
    table.extend(others.into_iter().filter(|a| *a != change.actor));
    table
}

pub fn encode_change(change: &Change) -> Bytes {
    let actors = actor_table(change);
    let index_of = |actor: &ActorId| -> u64 {
        actors
            .iter()
            .position(|a| a == actor)
            .expect("actor table covers all referenced actors") as u64
    };

    let mut payload = Vec::new();
    write_uleb(&mut payload, actors.len() as u64);
    for actor in &actors {
        write_uleb(&mut payload, actor.as_bytes().len() as u64);
        payload.extend_from_slice(actor.as_bytes());
    }
    write_uleb(&mut payload, change.seq);
    write_uleb(&mut payload, change.start_op);
    write_sleb(&mut payload, change.time);
    let message = change.message.as_deref().unwrap_or("");
    write_uleb(&mut payload, message.len() as u64);
    payload.extend_from_slice(message.as_bytes());
    write_uleb(&mut payload, change.deps.len() as u64);
    for dep in &change.deps {
        payload.extend_from_slice(dep.as_bytes());
    }

    let rows = change.expanded_ops();
    write_uleb(&mut payload, rows.len() as u64);

    let mut cols = Columns::new();
    for row in &rows {
        match row.obj {
            ObjId::Root => {
                cols.obj_actor.append(None);
                cols.obj_ctr.append(None);
            }
            ObjId::Op(id) => {
                cols.obj_actor.append(Some(index_of(&id.actor)));
                cols.obj_ctr.append(Some(id.counter));
            }
        }
        match &row.key {
            Key::Map(s) => {
                cols.key_actor.append(None);
                cols.key_ctr.append(None);
                cols.key_str.append(Some(s.clone()));
            }
            Key::Elem(ElemId::Head) => {
                cols.key_actor.append(None);
                cols.key_ctr.append(Some(0));
                cols.key_str.append(None);
            }
            Key::Elem(ElemId::Op(id)) => {
                cols.key_actor.append(Some(index_of(&id.actor)));
                cols.key_ctr.append(Some(id.counter));
                cols.key_str.append(None);
            }
        }
        cols.insert.append(row.insert);
        cols.action.append(Some(action_code(row.action)));
        match row.value {
            None => cols.val_len.append(None),
            Some(value) => {
                let cell = encode_value(value, &mut cols.val_raw);
                cols.val_len.append(Some(cell));
            }
        }
        match row.child {
            None => {
                cols.chld_actor.append(None);
                cols.chld_ctr.append(None);
            }
            Some(child) => {
                cols.chld_actor.append(Some(index_of(&child.actor)));
                cols.chld_ctr.append(Some(child.counter));
            }
        }
        let mut pred: Vec<&OpId> = row.pred.iter().collect();
        pred.sort_unstable();
        cols.pred_num.append(Some(pred.len() as u64));
        for p in pred {
            cols.pred_actor.append(Some(index_of(&p.actor)));
            cols.pred_ctr.append(Some(p.counter));
        }
    }

    let finished: Vec<(u64, Vec<u8>)> = cols
        .finish()
        .into_iter()
        .filter(|(_, bytes)| !bytes.is_empty())
        .collect();
    write_uleb(&mut payload, finished.len() as u64);
    for (id, bytes) in &finished {
        write_uleb(&mut payload, *id);
        write_uleb(&mut payload, bytes.len() as u64);
    }
    for (_, bytes) in &finished {
        payload.extend_from_slice(bytes);
    }

    encode_chunk(ChunkType::Change, &payload)
}

struct Row {
    action: OpType,
    obj: ObjId,
    key: Key,
    insert: bool,
    pred: Vec<OpId>,
    value: Option<ScalarValue>,
    child: Option<OpId>,
}

pub fn decode_change(bytes: &[u8]) -> Result<Change, DecodeError> {
    let (chunk_type, payload) = parse_chunk(bytes)?;
    if chunk_type != ChunkType::Change {
        return Err(DecodeError::WrongChunkType {
            expected: ChunkType::Change,
            got: chunk_type,
        });
    }
    decode_change_payload(payload)
}

fn decode_change_payload(payload: &[u8]) -> Result<Change, DecodeError> {
    let mut r = Reader::new(payload);

    let num_actors = r.read_usize()?;
    let mut actors = Vec::with_capacity(num_actors);
    for _ in 0..num_actors {
        let len = r.read_usize()?;
        let bytes = r.read_bytes(len)?;
        let actor = ActorId::from_bytes(bytes.to_vec())
            .map_err(|_| DecodeError::BadRow { row: 0, reason: "empty actor in table" })?;
        actors.push(actor);
    }
    if actors.is_empty() {
        return Err(DecodeError::BadRow { row: 0, reason: "empty actor table" });
    }

    let seq = r.read_uleb()?;
    let start_op = r.read_uleb()?;
    let time = r.read_sleb()?;
    let message_len = r.read_usize()?;
    let message_bytes = r.read_bytes(message_len)?;
    let message = if message_bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8(message_bytes.to_vec()).map_err(|_| DecodeError::BadUtf8)?)
    };
    let num_deps = r.read_usize()?;
    let mut deps = Vec::with_capacity(num_deps);
    for _ in 0..num_deps {
        let bytes: [u8; 32] = r.read_bytes(32)?.try_into().expect("32-byte slice");
        deps.push(crate::change::ChangeHash(bytes));
    }

    let num_rows = r.read_usize()?;
    let num_cols = r.read_usize()?;
    let mut col_table = Vec::with_capacity(num_cols);
    let mut prev_id = None;
    for _ in 0..num_cols {
        let id = r.read_uleb()?;
        if id > MAX_COL {
            return Err(DecodeError::UnknownColumn { id });
        }
        if prev_id.is_some_and(|prev| id <= prev) {
            return Err(DecodeError::UnknownColumn { id });
        }
        prev_id = Some(id);
        let len = r.read_usize()?;
        col_table.push((id, len));
    }
    let mut col_data: [&[u8]; (MAX_COL + 1) as usize] = [&[]; (MAX_COL + 1) as usize];
    for (id, len) in col_table {
        col_data[id as usize] = r.read_bytes(len)?;
    }
    if !r.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }

    let mut obj_actor = RleDecoder::<u64>::new(col_data[COL_OBJ_ACTOR as usize]);
    let mut obj_ctr = RleDecoder::<u64>::new(col_data[COL_OBJ_CTR as usize]);
    let mut key_actor = RleDecoder::<u64>::new(col_data[COL_KEY_ACTOR as usize]);
    let mut key_ctr = DeltaDecoder::new(col_data[COL_KEY_CTR as usize]);
    let mut key_str = RleDecoder::<String>::new(col_data[COL_KEY_STR as usize]);
    let mut insert_col = BooleanDecoder::new(col_data[COL_INSERT as usize]);
    let mut action_col = RleDecoder::<u64>::new(col_data[COL_ACTION as usize]);
    let mut val_len = RleDecoder::<u64>::new(col_data[COL_VAL_LEN as usize]);
    let mut val_raw = Reader::new(col_data[COL_VAL_RAW as usize]);
    let mut chld_actor = RleDecoder::<u64>::new(col_data[COL_CHLD_ACTOR as usize]);
    let mut chld_ctr = DeltaDecoder::new(col_data[COL_CHLD_CTR as usize]);
    let mut pred_num = RleDecoder::<u64>::new(col_data[COL_PRED_NUM as usize]);
    let mut pred_actor = RleDecoder::<u64>::new(col_data[COL_PRED_ACTOR as usize]);
    let mut pred_ctr = DeltaDecoder::new(col_data[COL_PRED_CTR as usize]);

    let actor_at = |row: usize, index: u64| -> Result<ActorId, DecodeError> {
        actors
            .get(usize::try_from(index).map_err(|_| DecodeError::BadActorIndex { row, index })?)
            .cloned()
            .ok_or(DecodeError::BadActorIndex { row, index })
    };

    let mut rows = Vec::with_capacity(num_rows);
    for i in 0..num_rows {
        let obj = match (obj_actor.next()?, obj_ctr.next()?) {
            (None, None) => ObjId::Root,
            (Some(a), Some(c)) => ObjId::Op(OpId::new(c, actor_at(i, a)?)),
            _ => return Err(DecodeError::BadRow { row: i, reason: "half-null obj id" }),
        };
        let key = match (key_str.next()?, key_actor.next()?, key_ctr.next()?) {
            (Some(s), None, None) => Key::Map(s),
            (None, None, Some(0)) => Key::Elem(ElemId::Head),
            (None, Some(a), Some(c)) => Key::elem(OpId::new(c, actor_at(i, a)?)),
            _ => return Err(DecodeError::BadRow { row: i, reason: "malformed key" }),
        };
        let insert = insert_col.next()?;
        let code = action_col
            .next()?
            .ok_or(DecodeError::BadRow { row: i, reason: "missing action" })?;
        let action = action_from_code(code)?;
        let value = match val_len.next()? {
            None => None,
            Some(cell) => Some(decode_value(cell, &mut val_raw)?),
        };
        let child = match (chld_actor.next()?, chld_ctr.next()?) {
            (None, None) => None,
            (Some(a), Some(c)) => Some(OpId::new(c, actor_at(i, a)?)),
            _ => return Err(DecodeError::BadRow { row: i, reason: "half-null child id" }),
        };
        let num_pred = pred_num.next()?.unwrap_or(0);
        let mut pred = Vec::with_capacity(num_pred as usize);
        for _ in 0..num_pred {
            match (pred_actor.next()?, pred_ctr.next()?) {
                (Some(a), Some(c)) => pred.push(OpId::new(c, actor_at(i, a)?)),
                _ => return Err(DecodeError::BadRow { row: i, reason: "truncated pred group" }),
            }
        }
        pred.sort_unstable();
        rows.push(Row {
            action,
            obj,
            key,
            insert,
            pred,
            value,
            child,
        });
    }

    let actor = actors[0].clone();
    let ops = collapse_rows(rows, start_op, &actor);
    Ok(Change {
        actor,
        seq,
        start_op,
        time,
        message,
        deps,
        ops,
    })
}

/// Rebuild ops from expanded rows, re-collapsing multi-value insert runs:
/// consecutive primitive `set` inserts into one object where each row's key
/// is the elemId of the previous row.
fn collapse_rows(rows: Vec<Row>, start_op: u64, actor: &ActorId) -> Vec<Op> {
    let mut ops: Vec<Op> = Vec::with_capacity(rows.len());
    for (i, row) in rows.into_iter().enumerate() {
        // `ops.last()` always ends at row i-1, so keying on the previous
        // row's elemId is exactly run adjacency.
        let extends_run = row.insert
            && row.action == OpType::Set
            && row.pred.is_empty()
            && row.value.is_some()
            && i > 0
            && row.key == Key::elem(OpId::new(start_op + i as u64 - 1, actor.clone()))
            && ops.last().is_some_and(|prev| {
                prev.insert
                    && prev.action == OpType::Set
                    && prev.obj == row.obj
                    && prev.pred.is_empty()
            });
        if extends_run {
            let prev = ops.last_mut().expect("run head exists");
            let value = row.value.expect("checked above");
            match &mut prev.values {
                Some(values) => values.push(value),
                None => {
                    let first = prev.value.take().expect("set op has a value");
                    prev.values = Some(vec![first, value]);
                }
            }
        } else {
            ops.push(Op {
                action: row.action,
                obj: row.obj,
                key: row.key,
                insert: row.insert,
                pred: row.pred,
                value: row.value,
                child: row.child,
                values: None,
            });
        }
    }
    ops
}
