//! Big-endian binary layout of journal records.
//!
//! ```text
//! entry   := op:u8 xid:u64 ts:i64 inode:i64 present:u8 [path] [node] [edge]
//! path    := root:str count:u32 element*
//! element := kind:str name:str index:i64
//! node    := index:i64 parent:i64 version:u64 path flags:u8 type:str data:bytes
//! edge    := index:i64 version:u64 flags:u8 key:element to_index:i64
//!            has_to_path:u8 [path] has_data:u8 [data:bytes] xmin:u64 xmax:u64
//! str     := len:u32 utf8
//! bytes   := len:u32 raw
//! ```

use super::journal::{JournalEntry, JournalOp};
use super::path::{Path, PathElement};
use super::record::{EdgeFlags, NodeFlags, SerializedEdge, SerializedNode};
use crate::types::{GraphFsError, Result};

const HAS_PATH: u8 = 0x01;
const HAS_NODE: u8 = 0x02;
const HAS_EDGE: u8 = 0x04;

/// Encodes `entry` into a fresh buffer.
pub fn encode_entry(entry: &JournalEntry) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.push(entry.op.as_u8());
    buf.extend_from_slice(&entry.xid.to_be_bytes());
    buf.extend_from_slice(&entry.ts.to_be_bytes());
    buf.extend_from_slice(&entry.inode.to_be_bytes());
    let mut present = 0u8;
    if entry.path.is_some() {
        present |= HAS_PATH;
    }
    if entry.node.is_some() {
        present |= HAS_NODE;
    }
    if entry.edge.is_some() {
        present |= HAS_EDGE;
    }
    buf.push(present);
    if let Some(path) = &entry.path {
        put_path(&mut buf, path)?;
    }
    if let Some(node) = &entry.node {
        put_node(&mut buf, node)?;
    }
    if let Some(edge) = &entry.edge {
        put_edge(&mut buf, edge)?;
    }
    Ok(buf)
}

/// Decodes an entry previously produced by [`encode_entry`].
pub fn decode_entry(src: &[u8]) -> Result<JournalEntry> {
    let mut reader = ByteReader::new(src);
    let op = JournalOp::try_from(reader.u8()?)?;
    let xid = reader.u64()?;
    let ts = reader.i64()?;
    let inode = reader.i64()?;
    let present = reader.u8()?;
    if present & !(HAS_PATH | HAS_NODE | HAS_EDGE) != 0 {
        return Err(GraphFsError::Corruption("journal entry has unknown sections"));
    }
    let path = if present & HAS_PATH != 0 {
        Some(reader.path()?)
    } else {
        None
    };
    let node = if present & HAS_NODE != 0 {
        Some(reader.node()?)
    } else {
        None
    };
    let edge = if present & HAS_EDGE != 0 {
        Some(reader.edge()?)
    } else {
        None
    };
    if !reader.is_exhausted() {
        return Err(GraphFsError::Corruption("journal entry has trailing bytes"));
    }
    Ok(JournalEntry {
        op,
        xid,
        ts,
        inode,
        path,
        node,
        edge,
    })
}

fn put_len(buf: &mut Vec<u8>, len: usize) -> Result<()> {
    let len: u32 = len
        .try_into()
        .map_err(|_| GraphFsError::Invalid("journal field length exceeds u32::MAX"))?;
    buf.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    put_len(buf, s.len())?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    put_len(buf, bytes.len())?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_element(buf: &mut Vec<u8>, element: &PathElement) -> Result<()> {
    put_str(buf, &element.kind)?;
    put_str(buf, &element.name)?;
    buf.extend_from_slice(&element.index.to_be_bytes());
    Ok(())
}

fn put_path(buf: &mut Vec<u8>, path: &Path) -> Result<()> {
    put_str(buf, path.root())?;
    put_len(buf, path.len())?;
    for element in path.elements() {
        put_element(buf, element)?;
    }
    Ok(())
}

fn put_node(buf: &mut Vec<u8>, node: &SerializedNode) -> Result<()> {
    buf.extend_from_slice(&node.index.to_be_bytes());
    buf.extend_from_slice(&node.parent.to_be_bytes());
    buf.extend_from_slice(&node.version.to_be_bytes());
    put_path(buf, &node.path)?;
    buf.push(node.flags.bits());
    put_str(buf, &node.node_type)?;
    put_bytes(buf, &node.data)
}

fn put_edge(buf: &mut Vec<u8>, edge: &SerializedEdge) -> Result<()> {
    buf.extend_from_slice(&edge.index.to_be_bytes());
    buf.extend_from_slice(&edge.version.to_be_bytes());
    buf.push(edge.flags.bits());
    put_element(buf, &edge.key)?;
    buf.extend_from_slice(&edge.to_index.to_be_bytes());
    match &edge.to_path {
        Some(path) => {
            buf.push(1);
            put_path(buf, path)?;
        }
        None => buf.push(0),
    }
    match &edge.data {
        Some(data) => {
            buf.push(1);
            put_bytes(buf, data)?;
        }
        None => buf.push(0),
    }
    buf.extend_from_slice(&edge.xmin.to_be_bytes());
    buf.extend_from_slice(&edge.xmax.to_be_bytes());
    Ok(())
}

struct ByteReader<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }

    fn is_exhausted(&self) -> bool {
        self.pos == self.src.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.src.len())
            .ok_or(GraphFsError::Corruption("journal entry truncated"))?;
        let slice = &self.src[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn flag(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(GraphFsError::Corruption("journal option marker invalid")),
        }
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| GraphFsError::Corruption("journal string is not utf-8"))
    }

    fn element(&mut self) -> Result<PathElement> {
        let kind = self.string()?;
        let name = self.string()?;
        let index = self.i64()?;
        Ok(PathElement { kind, name, index })
    }

    fn path(&mut self) -> Result<Path> {
        let root = self.string()?;
        let count = self.u32()? as usize;
        let mut elements = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            elements.push(self.element()?);
        }
        Ok(Path::from_elements(root, elements))
    }

    fn node(&mut self) -> Result<SerializedNode> {
        let index = self.i64()?;
        let parent = self.i64()?;
        let version = self.u64()?;
        let path = self.path()?;
        let flags = NodeFlags::from_bits(self.u8()?);
        let node_type = self.string()?;
        let data = self.bytes()?;
        Ok(SerializedNode {
            index,
            parent,
            version,
            path,
            flags,
            node_type,
            data,
        })
    }

    fn edge(&mut self) -> Result<SerializedEdge> {
        let index = self.i64()?;
        let version = self.u64()?;
        let flags = EdgeFlags::from_bits(self.u8()?);
        let key = self.element()?;
        let to_index = self.i64()?;
        let to_path = if self.flag()? { Some(self.path()?) } else { None };
        let data = if self.flag()? { Some(self.bytes()?) } else { None };
        let xmin = self.u64()?;
        let xmax = self.u64()?;
        Ok(SerializedEdge {
            index,
            version,
            flags,
            key,
            to_index,
            to_path,
            data,
            xmin,
            xmax,
        })
    }
}
