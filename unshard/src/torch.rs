//! Writer for the zip archives produced by `torch.save`.
//!
//! The archive holds a protocol 2 pickle at `<name>/data.pkl` plus one raw
//! little-endian storage file per tensor under `<name>/data/`, where `<name>` is
//! the file stem. Storages are referenced from the pickle through persistent
//! ids, and the stream is laid out opcode for opcode the way CPython's pickler
//! writes it for `torch.save`, memo puts and gets included. The result loads
//! with `torch.load` as well as with `candle_core::pickle`.

use std::{collections::HashMap, fs::File, io::Write, path::Path};

use candle_core::{DType, Tensor};
use safetensors::View;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use crate::{
    state_dict::{Checkpoint, CheckpointValue},
    Error, Result,
};

/// Items per `SETITEMS` batch, as in CPython's pickler.
const BATCH_SIZE: usize = 1000;

fn storage_type(dtype: DType) -> Result<&'static str> {
    Ok(match dtype {
        DType::F32 => "FloatStorage",
        DType::F64 => "DoubleStorage",
        DType::F16 => "HalfStorage",
        DType::BF16 => "BFloat16Storage",
        DType::U8 => "ByteStorage",
        DType::I64 => "LongStorage",
        other => return Err(Error::UnsupportedDtype(other)),
    })
}

mod op {
    pub const PROTO: u8 = 0x80;
    pub const GLOBAL: u8 = b'c';
    pub const MARK: u8 = b'(';
    pub const TUPLE: u8 = b't';
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const EMPTY_TUPLE: u8 = b')';
    pub const EMPTY_DICT: u8 = b'}';
    pub const REDUCE: u8 = b'R';
    pub const SETITEM: u8 = b's';
    pub const SETITEMS: u8 = b'u';
    pub const BINPERSID: u8 = b'Q';
    pub const BINUNICODE: u8 = b'X';
    pub const BININT1: u8 = b'K';
    pub const BININT2: u8 = b'M';
    pub const BININT: u8 = b'J';
    pub const LONG1: u8 = 0x8a;
    pub const NEWFALSE: u8 = 0x89;
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
    pub const STOP: u8 = b'.';
}

/// Objects that are pickled once and fetched back from the memo afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Shared {
    Global(&'static str, &'static str),
    Str(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    /// A plain `dict`, what `torch.save({...})` writes.
    Dict,
    /// A `collections.OrderedDict`, what `torch.save(model.state_dict())` writes.
    OrderedDict,
}

/// Emits the pickle stream and collects the storages it references.
struct Pickler<'a> {
    buf: Vec<u8>,
    memo_len: u32,
    memo: HashMap<Shared, u32>,
    storages: Vec<&'a Tensor>,
}

impl<'a> Pickler<'a> {
    fn new() -> Self {
        Self {
            buf: vec![op::PROTO, 2],
            memo_len: 0,
            memo: HashMap::new(),
            storages: vec![],
        }
    }

    /// Memoizes the object on top of the stack.
    fn put(&mut self) -> u32 {
        let id = self.memo_len;
        self.memo_len += 1;
        match u8::try_from(id) {
            Ok(id) => self.buf.extend_from_slice(&[op::BINPUT, id]),
            Err(_) => {
                self.buf.push(op::LONG_BINPUT);
                self.buf.extend_from_slice(&id.to_le_bytes());
            }
        }
        id
    }

    fn get(&mut self, id: u32) {
        match u8::try_from(id) {
            Ok(id) => self.buf.extend_from_slice(&[op::BINGET, id]),
            Err(_) => {
                self.buf.push(op::LONG_BINGET);
                self.buf.extend_from_slice(&id.to_le_bytes());
            }
        }
    }

    /// Writes `shared` with `write` the first time, as a memo get afterwards.
    fn shared(&mut self, shared: Shared, write: impl FnOnce(&mut Vec<u8>)) {
        if let Some(&id) = self.memo.get(&shared) {
            self.get(id);
        } else {
            write(&mut self.buf);
            let id = self.put();
            self.memo.insert(shared, id);
        }
    }

    fn global(&mut self, module: &'static str, name: &'static str) {
        self.shared(Shared::Global(module, name), |buf| {
            buf.push(op::GLOBAL);
            buf.extend_from_slice(module.as_bytes());
            buf.push(b'\n');
            buf.extend_from_slice(name.as_bytes());
            buf.push(b'\n');
        });
    }

    fn raw_unicode(buf: &mut Vec<u8>, s: &str) {
        buf.push(op::BINUNICODE);
        buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    fn unicode(&mut self, s: &str) {
        Self::raw_unicode(&mut self.buf, s);
        self.put();
    }

    fn constant(&mut self, s: &'static str) {
        self.shared(Shared::Str(s), |buf| Self::raw_unicode(buf, s));
    }

    fn int(&mut self, value: usize) {
        if let Ok(byte) = u8::try_from(value) {
            self.buf.extend_from_slice(&[op::BININT1, byte]);
        } else if let Ok(short) = u16::try_from(value) {
            self.buf.push(op::BININT2);
            self.buf.extend_from_slice(&short.to_le_bytes());
        } else if let Ok(int) = i32::try_from(value) {
            self.buf.push(op::BININT);
            self.buf.extend_from_slice(&int.to_le_bytes());
        } else {
            // two's complement, little-endian, with room for a clear sign bit
            let mut bytes = (value as u64).to_le_bytes().to_vec();
            while bytes.len() > 1 && bytes[bytes.len() - 1] == 0 && bytes[bytes.len() - 2] < 0x80 {
                bytes.pop();
            }
            if bytes[bytes.len() - 1] >= 0x80 {
                bytes.push(0);
            }
            self.buf.extend_from_slice(&[op::LONG1, bytes.len() as u8]);
            self.buf.extend_from_slice(&bytes);
        }
    }

    fn ints(&mut self, values: &[usize]) {
        let close = match values.len() {
            0 => return self.buf.push(op::EMPTY_TUPLE),
            1 => op::TUPLE1,
            2 => op::TUPLE2,
            3 => op::TUPLE3,
            _ => {
                self.buf.push(op::MARK);
                op::TUPLE
            }
        };
        values.iter().for_each(|v| self.int(*v));
        self.buf.push(close);
        self.put();
    }

    fn ordered_dict(&mut self) {
        self.global("collections", "OrderedDict");
        self.buf.extend_from_slice(&[op::EMPTY_TUPLE, op::REDUCE]);
        self.put();
    }

    fn dict(&mut self) {
        self.buf.push(op::EMPTY_DICT);
        self.put();
    }

    /// Sets every entry of `checkpoint` on the dict on top of the stack.
    fn items(&mut self, checkpoint: &'a Checkpoint) -> Result<()> {
        let entries: Vec<_> = checkpoint.iter().collect();
        for batch in entries.chunks(BATCH_SIZE) {
            let many = batch.len() > 1;
            if many {
                self.buf.push(op::MARK);
            }
            for &(key, value) in batch {
                self.unicode(key);
                match value {
                    CheckpointValue::Tensor(tensor) => self.tensor(tensor)?,
                    CheckpointValue::Dict(dict) => {
                        self.ordered_dict();
                        self.items(dict)?;
                    }
                }
            }
            self.buf.push(if many { op::SETITEMS } else { op::SETITEM });
        }
        Ok(())
    }

    /// `_rebuild_tensor_v2(storage, offset, size, stride, requires_grad, hooks)`
    fn tensor(&mut self, tensor: &'a Tensor) -> Result<()> {
        let storage = storage_type(tensor.dtype())?;
        let key = self.storages.len().to_string();
        let dims = tensor.dims();
        let mut strides = vec![1; dims.len()];
        for i in (0..dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * dims[i + 1];
        }

        self.global("torch._utils", "_rebuild_tensor_v2");
        self.buf.push(op::MARK);
        self.buf.push(op::MARK);
        self.constant("storage");
        self.global("torch", storage);
        self.unicode(&key);
        self.constant("cpu");
        self.int(tensor.elem_count());
        self.buf.push(op::TUPLE);
        self.put();
        self.buf.push(op::BINPERSID);
        self.int(0);
        self.ints(dims);
        self.ints(&strides);
        self.buf.push(op::NEWFALSE);
        self.ordered_dict();
        self.buf.push(op::TUPLE);
        self.put();
        self.buf.push(op::REDUCE);
        self.put();

        self.storages.push(tensor);
        Ok(())
    }

    fn finish(mut self) -> (Vec<u8>, Vec<&'a Tensor>) {
        self.buf.push(op::STOP);
        (self.buf, self.storages)
    }
}

fn write_archive(path: &Path, checkpoint: &Checkpoint, root: Root) -> Result<()> {
    let mut pickler = Pickler::new();
    match root {
        Root::Dict => pickler.dict(),
        Root::OrderedDict => pickler.ordered_dict(),
    }
    pickler.items(checkpoint)?;
    let (pickle, storages) = pickler.finish();

    let archive = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("archive");
    let file = File::create(path).map_err(Error::io(path))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(true);

    zip.start_file(format!("{archive}/data.pkl"), options)?;
    zip.write_all(&pickle).map_err(Error::io(path))?;
    zip.start_file(format!("{archive}/byteorder"), options)?;
    zip.write_all(b"little").map_err(Error::io(path))?;
    for (key, tensor) in storages.into_iter().enumerate() {
        let tensor = tensor.contiguous()?;
        zip.start_file(format!("{archive}/data/{key}"), options)?;
        zip.write_all(&tensor.data()).map_err(Error::io(path))?;
    }
    zip.start_file(format!("{archive}/version"), options)?;
    zip.write_all(b"3\n").map_err(Error::io(path))?;
    zip.finish()?;
    Ok(())
}

/// Writes `checkpoint` to `path` as a plain dict; nested dicts become
/// `OrderedDict`s, like state dicts saved inside a training checkpoint.
pub fn save_checkpoint<P: AsRef<Path>>(path: P, checkpoint: &Checkpoint) -> Result<()> {
    write_archive(path.as_ref(), checkpoint, Root::Dict)
}

/// Writes a flat state dict, keeping the iteration order of `entries`.
pub fn save_state_dict<'a, P, I, S>(path: P, entries: I) -> Result<()>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = (S, &'a Tensor)>,
    S: Into<String>,
{
    let checkpoint: Checkpoint = entries
        .into_iter()
        .map(|(name, tensor)| (name.into(), tensor.clone()))
        .collect();
    write_archive(path.as_ref(), &checkpoint, Root::OrderedDict)
}
