//! Run-length column encoders.
//!
//! Three shapes cover every op column:
//! - RLE of nullable values (uints, signed ints, strings): runs are
//!   `sleb(count) value` for a repeat, `sleb(-count) v0..vn` for a literal
//!   block, `sleb(0) uleb(count)` for a null run.
//! - Delta: RLE of signed differences against a running absolute value.
//! - Boolean: alternating run lengths, starting with the false run.

use super::leb::{write_sleb, write_uleb, Reader};
use super::DecodeError;

/// A value that can live in an RLE column.
pub trait ColVal: Clone + PartialEq {
    fn write(&self, buf: &mut Vec<u8>);
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError>;
}

impl ColVal for u64 {
    fn write(&self, buf: &mut Vec<u8>) {
        write_uleb(buf, *self);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        r.read_uleb()
    }
}

impl ColVal for i64 {
    fn write(&self, buf: &mut Vec<u8>) {
        write_sleb(buf, *self);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        r.read_sleb()
    }
}

impl ColVal for String {
    fn write(&self, buf: &mut Vec<u8>) {
        write_uleb(buf, self.len() as u64);
        buf.extend_from_slice(self.as_bytes());
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let len = r.read_usize()?;
        let bytes = r.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::BadUtf8)
    }
}

enum RleState<T> {
    Empty,
    NullRun(u64),
    Run(T, u64),
    Literal(Vec<T>),
}

pub struct RleEncoder<T: ColVal> {
    buf: Vec<u8>,
    state: RleState<T>,
}

impl<T: ColVal> RleEncoder<T> {
    pub fn new() -> Self {
        RleEncoder {
            buf: Vec::new(),
            state: RleState::Empty,
        }
    }

    pub fn append(&mut self, value: Option<T>) {
        let state = std::mem::replace(&mut self.state, RleState::Empty);
        self.state = match (state, value) {
            (RleState::Empty, None) => RleState::NullRun(1),
            (RleState::Empty, Some(v)) => RleState::Run(v, 1),
            (RleState::NullRun(n), None) => RleState::NullRun(n + 1),
            (RleState::NullRun(n), Some(v)) => {
                self.flush(RleState::NullRun(n));
                RleState::Run(v, 1)
            }
            (RleState::Run(u, n), Some(v)) if u == v => RleState::Run(u, n + 1),
            (RleState::Run(u, 1), Some(v)) => RleState::Literal(vec![u, v]),
            (RleState::Run(u, n), Some(v)) => {
                self.flush(RleState::Run(u, n));
                RleState::Run(v, 1)
            }
            (RleState::Run(u, n), None) => {
                self.flush(RleState::Run(u, n));
                RleState::NullRun(1)
            }
            (RleState::Literal(mut lits), Some(v)) => {
                if lits.last() == Some(&v) {
                    lits.pop();
                    if !lits.is_empty() {
                        self.flush(RleState::Literal(lits));
                    }
                    RleState::Run(v, 2)
                } else {
                    lits.push(v);
                    RleState::Literal(lits)
                }
            }
            (RleState::Literal(lits), None) => {
                self.flush(RleState::Literal(lits));
                RleState::NullRun(1)
            }
        };
    }

    fn flush(&mut self, state: RleState<T>) {
        match state {
            RleState::Empty => {}
            RleState::NullRun(n) => {
                write_sleb(&mut self.buf, 0);
                write_uleb(&mut self.buf, n);
            }
            RleState::Run(v, n) => {
                write_sleb(&mut self.buf, n as i64);
                v.write(&mut self.buf);
            }
            RleState::Literal(lits) => {
                write_sleb(&mut self.buf, -(lits.len() as i64));
                for v in lits {
                    v.write(&mut self.buf);
                }
            }
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        let state = std::mem::replace(&mut self.state, RleState::Empty);
        self.flush(state);
        self.buf
    }
}

enum RleRun<T> {
    Nulls(u64),
    Repeat(T, u64),
    Literals(u64),
}

pub struct RleDecoder<'a, T: ColVal> {
    reader: Reader<'a>,
    run: Option<RleRun<T>>,
}

impl<'a, T: ColVal> RleDecoder<'a, T> {
    pub fn new(buf: &'a [u8]) -> Self {
        RleDecoder {
            reader: Reader::new(buf),
            run: None,
        }
    }

    /// Next cell. An empty column yields endless nulls, which is the
    /// canonical encoding for an all-null column.
    pub fn next(&mut self) -> Result<Option<T>, DecodeError> {
        if self.run.is_none() {
            if self.reader.is_empty() {
                return Ok(None);
            }
            let len = self.reader.read_sleb()?;
            self.run = Some(if len > 0 {
                let v = T::read(&mut self.reader)?;
                RleRun::Repeat(v, len as u64)
            } else if len < 0 {
                RleRun::Literals(len.unsigned_abs())
            } else {
                RleRun::Nulls(self.reader.read_uleb()?)
            });
        }
        match self.run.take() {
            None => Ok(None),
            Some(RleRun::Nulls(n)) => {
                if n > 1 {
                    self.run = Some(RleRun::Nulls(n - 1));
                }
                Ok(None)
            }
            Some(RleRun::Repeat(v, n)) => {
                let out = v.clone();
                if n > 1 {
                    self.run = Some(RleRun::Repeat(v, n - 1));
                }
                Ok(Some(out))
            }
            Some(RleRun::Literals(n)) => {
                let out = T::read(&mut self.reader)?;
                if n > 1 {
                    self.run = Some(RleRun::Literals(n - 1));
                }
                Ok(Some(out))
            }
        }
    }
}

/// Unsigned values stored as RLE'd signed deltas against a running total.
pub struct DeltaEncoder {
    rle: RleEncoder<i64>,
    last: u64,
}

impl DeltaEncoder {
    pub fn new() -> Self {
        DeltaEncoder {
            rle: RleEncoder::new(),
            last: 0,
        }
    }

    pub fn append(&mut self, value: Option<u64>) {
        match value {
            None => self.rle.append(None),
            Some(v) => {
                self.rle.append(Some(v.wrapping_sub(self.last) as i64));
                self.last = v;
            }
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.rle.finish()
    }
}

pub struct DeltaDecoder<'a> {
    rle: RleDecoder<'a, i64>,
    last: u64,
}

impl<'a> DeltaDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        DeltaDecoder {
            rle: RleDecoder::new(buf),
            last: 0,
        }
    }

    pub fn next(&mut self) -> Result<Option<u64>, DecodeError> {
        match self.rle.next()? {
            None => Ok(None),
            Some(delta) => {
                self.last = self.last.wrapping_add(delta as u64);
                Ok(Some(self.last))
            }
        }
    }
}

/// Booleans as alternating run lengths, false first.
pub struct BooleanEncoder {
    buf: Vec<u8>,
    last: bool,
    count: u64,
}

impl BooleanEncoder {
    pub fn new() -> Self {
        BooleanEncoder {
            buf: Vec::new(),
            last: false,
            count: 0,
        }
    }

    pub fn append(&mut self, value: bool) {
        if value == self.last {
            self.count += 1;
        } else {
            write_uleb(&mut self.buf, self.count);
            self.last = value;
            self.count = 1;
        }
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.count > 0 {
            write_uleb(&mut self.buf, self.count);
        }
        self.buf
    }
}

pub struct BooleanDecoder<'a> {
    reader: Reader<'a>,
    value: bool,
    remaining: u64,
}

impl<'a> BooleanDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        BooleanDecoder {
            reader: Reader::new(buf),
            // The first stored run is the false run; flipping on the first
            // read lands us there.
            value: true,
            remaining: 0,
        }
    }

    pub fn next(&mut self) -> Result<bool, DecodeError> {
        while self.remaining == 0 {
            if self.reader.is_empty() {
                // Exhausted column: trailing cells read as false.
                return Ok(false);
            }
            self.remaining = self.reader.read_uleb()?;
            self.value = !self.value;
        }
        self.remaining -= 1;
        Ok(self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rle_roundtrip(cells: Vec<Option<u64>>) -> Vec<Option<u64>> {
        let mut enc = RleEncoder::new();
        for cell in &cells {
            enc.append(*cell);
        }
        let buf = enc.finish();
        let mut dec = RleDecoder::<u64>::new(&buf);
        (0..cells.len()).map(|_| dec.next().unwrap()).collect()
    }

    #[test]
    fn rle_round_trips_mixed_runs() {
        let cells = vec![
            Some(7),
            Some(7),
            Some(7),
            None,
            None,
            Some(1),
            Some(2),
            Some(3),
            Some(3),
            None,
        ];
        assert_eq!(rle_roundtrip(cells.clone()), cells);
    }

    #[test]
    fn rle_literal_block_ends_in_run() {
        // 1 2 3 3 must flush the literal [1, 2] then open a run of 3s.
        let cells = vec![Some(1), Some(2), Some(3), Some(3), Some(3)];
        assert_eq!(rle_roundtrip(cells.clone()), cells);
    }

    #[test]
    fn rle_strings_round_trip() {
        let cells = vec![
            Some("bird".to_string()),
            Some("bird".to_string()),
            None,
            Some("fish".to_string()),
        ];
        let mut enc = RleEncoder::new();
        for cell in &cells {
            enc.append(cell.clone());
        }
        let buf = enc.finish();
        let mut dec = RleDecoder::<String>::new(&buf);
        let out: Vec<_> = (0..cells.len()).map(|_| dec.next().unwrap()).collect();
        assert_eq!(out, cells);
    }

    #[test]
    fn delta_round_trips_descending_values() {
        let cells = vec![Some(10), Some(11), Some(5), None, Some(5), Some(100)];
        let mut enc = DeltaEncoder::new();
        for cell in &cells {
            enc.append(*cell);
        }
        let buf = enc.finish();
        let mut dec = DeltaDecoder::new(&buf);
        let out: Vec<_> = (0..cells.len()).map(|_| dec.next().unwrap()).collect();
        assert_eq!(out, cells);
    }

    #[test]
    fn boolean_runs_start_false() {
        let cells = vec![true, true, false, true];
        let mut enc = BooleanEncoder::new();
        for cell in &cells {
            enc.append(*cell);
        }
        let buf = enc.finish();
        let mut dec = BooleanDecoder::new(&buf);
        let out: Vec<_> = (0..cells.len()).map(|_| dec.next().unwrap()).collect();
        assert_eq!(out, cells);

        // Leading zero-length false run.
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn empty_column_reads_as_nulls() {
        let mut dec = RleDecoder::<u64>::new(&[]);
        assert_eq!(dec.next().unwrap(), None);
        assert_eq!(dec.next().unwrap(), None);
    }
}
