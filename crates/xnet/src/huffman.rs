//! Static Huffman coding of datagram payloads.
//!
//! One tree is built per process from a pre-counted byte frequency table and
//! never changes afterwards, so both peers always agree on the codes.

use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::sync::LazyLock;

use crate::bitbuf::BitBuffer;

/// Largest block that fits the 16-bit length prefix.
pub const MAX_COMPRESSED_INPUT: usize = u16::MAX as usize;

const LENGTH_PREFIX_BYTES: usize = 2;

#[rustfmt::skip]
static FREQUENCIES: [u32; 256] = [
    0x3D1CB, 0x0A0E9, 0x01894, 0x01BC2, 0x00E92, 0x00EA6, 0x017DE, 0x05AF3,
    0x08225, 0x01B26, 0x01E9E, 0x025F2, 0x02429, 0x0436B, 0x00F6D, 0x006F2,
    0x02060, 0x00644, 0x00636, 0x0067F, 0x0044C, 0x004BD, 0x004D6, 0x0046E,
    0x006D5, 0x00423, 0x004DE, 0x0047D, 0x004F9, 0x01186, 0x00AF5, 0x00D90,
    0x0553B, 0x00487, 0x00686, 0x0042A, 0x00413, 0x003F4, 0x0041D, 0x0042E,
    0x006BE, 0x00378, 0x0049C, 0x00352, 0x003C0, 0x0030C, 0x006D8, 0x00CE0,
    0x02986, 0x011A2, 0x016F9, 0x00A7D, 0x0122A, 0x00EFD, 0x0082D, 0x0074B,
    0x00A18, 0x0079D, 0x007B4, 0x003AC, 0x0046E, 0x006FC, 0x00686, 0x004B6,
    0x01657, 0x017F0, 0x01C36, 0x019FE, 0x00E7E, 0x00ED3, 0x005D4, 0x005F4,
    0x008A7, 0x00474, 0x0054B, 0x003CB, 0x00884, 0x004E0, 0x00530, 0x004AB,
    0x006EA, 0x00436, 0x004F0, 0x004F2, 0x00490, 0x003C5, 0x00483, 0x004A2,
    0x00543, 0x004CC, 0x005F9, 0x00640, 0x00A39, 0x00800, 0x009F2, 0x00CCB,
    0x0096A, 0x00E01, 0x009C8, 0x00AF0, 0x00A73, 0x01802, 0x00E4F, 0x00B18,
    0x037AD, 0x00C5C, 0x008AD, 0x00697, 0x00C88, 0x00AB3, 0x00DB8, 0x012BC,
    0x00FFB, 0x00DBB, 0x014A8, 0x00FB0, 0x01F01, 0x0178F, 0x014F0, 0x00F54,
    0x0131C, 0x00E9F, 0x011D6, 0x012C7, 0x016DC, 0x01900, 0x01851, 0x02063,
    0x05ACB, 0x01E9E, 0x01BA1, 0x022E7, 0x0153D, 0x01183, 0x00E39, 0x01488,
    0x014C0, 0x014D0, 0x014FA, 0x00DA4, 0x0099A, 0x0069E, 0x0071D, 0x00849,
    0x0077C, 0x0047D, 0x005EC, 0x00557, 0x004D4, 0x00405, 0x004EA, 0x00450,
    0x004DD, 0x003EE, 0x0047D, 0x00401, 0x004D9, 0x003B8, 0x00507, 0x003E5,
    0x006B1, 0x003F1, 0x004A3, 0x0036F, 0x0044B, 0x003A1, 0x00436, 0x003B7,
    0x00678, 0x003A2, 0x00481, 0x00406, 0x004EE, 0x00426, 0x004BE, 0x00424,
    0x00655, 0x003A2, 0x00452, 0x00390, 0x0040A, 0x0037C, 0x00486, 0x003DE,
    0x00497, 0x00352, 0x00461, 0x00387, 0x0043F, 0x00398, 0x00478, 0x00420,
    0x00D86, 0x008C0, 0x0112D, 0x02F68, 0x01E4E, 0x00541, 0x0051B, 0x00CCE,
    0x0079E, 0x00376, 0x003FF, 0x00458, 0x00435, 0x00412, 0x00425, 0x0042F,
    0x005CC, 0x003E9, 0x00448, 0x00393, 0x0041C, 0x003E3, 0x0042E, 0x0036C,
    0x00457, 0x00353, 0x00423, 0x00325, 0x00458, 0x0039B, 0x0044F, 0x00331,
    0x0076B, 0x00750, 0x003D0, 0x00349, 0x00467, 0x003BC, 0x00487, 0x003B6,
    0x01E6F, 0x003BA, 0x00509, 0x003A5, 0x00467, 0x00C87, 0x003FC, 0x0039F,
    0x0054B, 0x00300, 0x00410, 0x002E9, 0x003B8, 0x00325, 0x00431, 0x002E4,
    0x003F5, 0x00325, 0x003F0, 0x0031C, 0x003E4, 0x00421, 0x02CC1, 0x034C0,
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HuffmanError {
    #[error("nothing to compress")]
    Empty,
    #[error("block of {0} bytes exceeds the {MAX_COMPRESSED_INPUT} byte limit")]
    TooLarge(usize),
    #[error("compressed block is truncated")]
    Truncated,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    children: Option<[u16; 2]>,
    parent: Option<u16>,
    symbol: u8,
}

#[derive(Debug, Clone, Copy, Default)]
struct Code {
    bits: u32,
    len: u32,
}

pub struct HuffmanTree {
    nodes: Vec<Node>,
    codes: [Code; 256],
    root: u16,
}

static TREE: LazyLock<HuffmanTree> = LazyLock::new(|| HuffmanTree::build(&FREQUENCIES));

impl HuffmanTree {
    /// Builds the tree by repeatedly joining the two lightest parentless
    /// nodes. Ties go to the lower arena index and the first node taken off
    /// the heap becomes the left (0) child.
    pub fn build(frequencies: &[u32; 256]) -> Self {
        let mut nodes: Vec<Node> = (0..=255u8)
            .map(|symbol| Node {
                children: None,
                parent: None,
                symbol,
            })
            .collect();

        let mut heap: BinaryHeap<Reverse<(u64, u16)>> = frequencies
            .iter()
            .enumerate()
            .map(|(i, &f)| Reverse((f as u64, i as u16)))
            .collect();

        while heap.len() > 1 {
            let (Some(Reverse((f0, left))), Some(Reverse((f1, right)))) = (heap.pop(), heap.pop())
            else {
                break;
            };

            let index = nodes.len() as u16;
            nodes.push(Node {
                children: Some([left, right]),
                parent: None,
                symbol: 0,
            });
            nodes[left as usize].parent = Some(index);
            nodes[right as usize].parent = Some(index);
            heap.push(Reverse((f0 + f1, index)));
        }

        let root = heap.pop().map(|Reverse((_, i))| i).unwrap_or(0);

        let mut codes = [Code::default(); 256];
        for (symbol, code) in codes.iter_mut().enumerate() {
            let mut path = Vec::new();
            let mut current = symbol as u16;
            while let Some(parent) = nodes[current as usize].parent {
                let is_right = nodes[parent as usize]
                    .children
                    .is_some_and(|c| c[1] == current);
                path.push(is_right);
                current = parent;
            }

            // path runs leaf to root, the wire wants root first
            for (i, &bit) in path.iter().rev().enumerate() {
                if bit {
                    code.bits |= 1 << i;
                }
            }
            code.len = path.len() as u32;
        }

        Self { nodes, codes, root }
    }

    pub fn code_len(&self, symbol: u8) -> u32 {
        self.codes[symbol as usize].len
    }

    pub fn encode_into<T: AsRef<[u8]> + AsMut<[u8]>>(&self, symbol: u8, buf: &mut BitBuffer<T>) {
        let code = self.codes[symbol as usize];
        buf.write_ubits(code.bits, code.len);
    }

    pub fn decode_from<T: AsRef<[u8]>>(&self, buf: &mut BitBuffer<T>) -> Option<u8> {
        let mut current = self.root;
        loop {
            let node = &self.nodes[current as usize];
            let Some(children) = node.children else {
                return Some(node.symbol);
            };
            if buf.bits_left() == 0 {
                return None;
            }
            current = children[buf.read_one_bit() as usize];
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, HuffmanError> {
        if data.is_empty() {
            return Err(HuffmanError::Empty);
        }
        if data.len() > MAX_COMPRESSED_INPUT {
            return Err(HuffmanError::TooLarge(data.len()));
        }

        let bits: usize = data.iter().map(|&b| self.code_len(b) as usize).sum();
        let mut buf = BitBuffer::with_capacity(LENGTH_PREFIX_BYTES + bits.div_ceil(8));

        let len = data.len() as u16;
        buf.write_byte((len >> 8) as u8);
        buf.write_byte((len & 0xFF) as u8);

        for &b in data {
            self.encode_into(b, &mut buf);
        }

        let used = buf.bytes_written();
        let mut out = buf.into_inner();
        out.truncate(used);
        Ok(out)
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, HuffmanError> {
        if data.len() < LENGTH_PREFIX_BYTES {
            return Err(HuffmanError::Truncated);
        }

        let len = ((data[0] as usize) << 8) | data[1] as usize;
        let mut buf = BitBuffer::with_bits(data, LENGTH_PREFIX_BYTES * 8, data.len() * 8);

        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            match self.decode_from(&mut buf) {
                Some(b) => out.push(b),
                None => return Err(HuffmanError::Truncated),
            }
        }
        Ok(out)
    }
}

pub fn tree() -> &'static HuffmanTree {
    &TREE
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>, HuffmanError> {
    TREE.compress(data)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, HuffmanError> {
    TREE.decompress(data)
}

/// Compresses everything after `offset` in place. An empty tail is left alone.
pub fn compress_packet(packet: &mut Vec<u8>, offset: usize) -> Result<(), HuffmanError> {
    if packet.len() <= offset {
        return Ok(());
    }
    let compressed = TREE.compress(&packet[offset..])?;
    packet.truncate(offset);
    packet.extend_from_slice(&compressed);
    Ok(())
}

pub fn decompress_packet(packet: &mut Vec<u8>, offset: usize) -> Result<(), HuffmanError> {
    if packet.len() <= offset {
        return Ok(());
    }
    let plain = TREE.decompress(&packet[offset..])?;
    packet.truncate(offset);
    packet.extend_from_slice(&plain);
    Ok(())
}
