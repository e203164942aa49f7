//! LZSS with adaptive Huffman coding, as used by Teledisk "advanced
//! compression" images. A 4 KiB window primed with spaces, 60-byte
//! lookahead and a 314-symbol adaptive tree.

const N: usize = 4096;
const F: usize = 60;
const THRESHOLD: usize = 2;
const N_CHAR: usize = 256 - THRESHOLD + F;
const T: usize = N_CHAR * 2 - 1;
const R: usize = T - 1;
const MAX_FREQ: u32 = 0x8000;
/// Output ceiling; a full 2.88M disk fits easily
const MAX_OUTPUT: usize = 16 << 20;

/// Upper six bits of a match position, indexed by the first position byte
fn d_code(byte: usize) -> usize {
    match byte {
        0x00..=0x1F => 0,
        0x20..=0x4F => 1 + (byte - 0x20) / 16,
        0x50..=0x8F => 4 + (byte - 0x50) / 8,
        0x90..=0xBF => 0x0C + (byte - 0x90) / 4,
        0xC0..=0xEF => 0x18 + (byte - 0xC0) / 2,
        _ => 0x30 + (byte - 0xF0),
    }
}

/// Total bits in a position code starting with this byte
fn d_len(byte: usize) -> usize {
    const LENS: [usize; 16] = [3, 3, 4, 4, 4, 5, 5, 5, 5, 6, 6, 6, 7, 7, 7, 8];
    LENS[byte >> 4]
}

struct Huffman {
    freq: [u32; T + 1],
    prnt: [usize; T + N_CHAR],
    son: [usize; T],
}

impl Huffman {
    fn new() -> Self {
        let mut h = Huffman {
            freq: [0; T + 1],
            prnt: [0; T + N_CHAR],
            son: [0; T],
        };
        for i in 0..N_CHAR {
            h.freq[i] = 1;
            h.son[i] = i + T;
            h.prnt[i + T] = i;
        }
        let (mut i, mut j) = (0, N_CHAR);
        while j <= R {
            h.freq[j] = h.freq[i] + h.freq[i + 1];
            h.son[j] = i;
            h.prnt[i] = j;
            h.prnt[i + 1] = j;
            i += 2;
            j += 1;
        }
        h.freq[T] = 0xFFFF;
        h.prnt[R] = 0;
        h
    }

    fn reconstruct(&mut self) {
        let mut j = 0;
        for i in 0..T {
            if self.son[i] >= T {
                self.freq[j] = (self.freq[i] + 1) / 2;
                self.son[j] = self.son[i];
                j += 1;
            }
        }
        let mut i = 0;
        for j in N_CHAR..T {
            let f = self.freq[i] + self.freq[i + 1];
            let mut k = j - 1;
            while f < self.freq[k] {
                k -= 1;
            }
            k += 1;
            self.freq.copy_within(k..j, k + 1);
            self.freq[k] = f;
            self.son.copy_within(k..j, k + 1);
            self.son[k] = i;
            i += 2;
        }
        for i in 0..T {
            let k = self.son[i];
            self.prnt[k] = i;
            if k < T {
                self.prnt[k + 1] = i;
            }
        }
    }

    fn update(&mut self, symbol: usize) {
        if self.freq[R] == MAX_FREQ {
            self.reconstruct();
        }
        let mut c = self.prnt[symbol + T];
        loop {
            self.freq[c] += 1;
            let k = self.freq[c];
            let mut l = c + 1;
            if k > self.freq[l] {
                while k > self.freq[l + 1] {
                    l += 1;
                }
                self.freq[c] = self.freq[l];
                self.freq[l] = k;

                let i = self.son[c];
                self.prnt[i] = l;
                if i < T {
                    self.prnt[i + 1] = l;
                }
                let j = self.son[l];
                self.son[l] = i;
                self.prnt[j] = c;
                if j < T {
                    self.prnt[j + 1] = c;
                }
                self.son[c] = j;
                c = l;
            }
            c = self.prnt[c];
            if c == 0 {
                break;
            }
        }
    }

    /// Path from the root to a symbol's leaf, root side first
    #[cfg(test)]
    fn code(&self, symbol: usize) -> Vec<bool> {
        let mut bits = Vec::new();
        let mut k = self.prnt[symbol + T];
        loop {
            bits.push(k & 1 == 1);
            k = self.prnt[k];
            if k == R {
                break;
            }
        }
        bits.reverse();
        bits
    }
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
    buffer: u32,
    bits: u32,
    tree: Huffman,
}

impl<'a> Decoder<'a> {
    fn refill(&mut self) {
        while self.bits <= 8 {
            let byte = self.input.get(self.pos).copied().unwrap_or(0) as u32;
            self.pos += 1;
            self.buffer |= byte << (8 - self.bits);
            self.bits += 8;
        }
    }

    fn bit(&mut self) -> usize {
        self.refill();
        let bit = (self.buffer >> 15) & 1;
        self.buffer = (self.buffer << 1) & 0xFFFF;
        self.bits -= 1;
        bit as usize
    }

    fn byte(&mut self) -> usize {
        self.refill();
        let byte = (self.buffer >> 8) & 0xFF;
        self.buffer = (self.buffer << 8) & 0xFFFF;
        self.bits -= 8;
        byte as usize
    }

    fn exhausted(&self) -> bool {
        self.pos >= self.input.len() + 2
    }

    fn symbol(&mut self) -> usize {
        let mut c = self.tree.son[R];
        while c < T {
            let bit = self.bit();
            c = self.tree.son[c + bit];
        }
        c -= T;
        self.tree.update(c);
        c
    }

    fn position(&mut self) -> usize {
        let mut i = self.byte();
        let high = d_code(i) << 6;
        for _ in 0..d_len(i) - 2 {
            i = (i << 1) + self.bit();
        }
        high | (i & 0x3F)
    }
}

/// Decompress a whole stream; decoding stops when the input runs out
pub fn decompress(input: &[u8]) -> Vec<u8> {
    let mut decoder = Decoder {
        input,
        pos: 0,
        buffer: 0,
        bits: 0,
        tree: Huffman::new(),
    };
    let mut window = [b' '; N];
    let mut r = N - F;
    let mut out = Vec::with_capacity(input.len() * 2);
    while !decoder.exhausted() && out.len() < MAX_OUTPUT {
        let c = decoder.symbol();
        if c < 256 {
            out.push(c as u8);
            window[r] = c as u8;
            r = (r + 1) & (N - 1);
        } else {
            let start = r.wrapping_sub(decoder.position() + 1) & (N - 1);
            let len = c - 255 + THRESHOLD;
            for k in 0..len {
                let byte = window[(start + k) & (N - 1)];
                out.push(byte);
                window[r] = byte;
                r = (r + 1) & (N - 1);
            }
        }
    }
    out
}

/// Literal-only encoder driving the same adaptive tree
#[cfg(test)]
pub(crate) fn encode_literals(data: &[u8]) -> Vec<u8> {
    let mut tree = Huffman::new();
    let mut bits = Vec::new();
    for &b in data {
        bits.extend(tree.code(b as usize));
        tree.update(b as usize);
    }
    bits.chunks(8)
        .map(|chunk| chunk.iter().enumerate().fold(0u8, |acc, (i, &bit)| acc | ((bit as u8) << (7 - i))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_tables() {
        assert_eq!(d_code(0x1F), 0);
        assert_eq!(d_code(0x20), 1);
        assert_eq!(d_code(0x4F), 3);
        assert_eq!(d_code(0x50), 4);
        assert_eq!(d_code(0x8F), 0x0B);
        assert_eq!(d_code(0xBF), 0x17);
        assert_eq!(d_code(0xEF), 0x2F);
        assert_eq!(d_code(0xFF), 0x3F);
        assert_eq!(d_len(0x00), 3);
        assert_eq!(d_len(0xF0), 8);
    }

    #[test]
    fn test_literal_stream() {
        let text = b"TELEDISK SECTOR DATA \x00\x01\x02\xFF repeated text repeated text";
        let packed = encode_literals(text);
        let out = decompress(&packed);
        assert!(out.starts_with(text));
    }

    #[test]
    fn test_tree_survives_rescale() {
        // enough symbols to push the root past MAX_FREQ
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 7) as u8).collect();
        let packed = encode_literals(&data);
        let out = decompress(&packed);
        assert_eq!(&out[..data.len()], &data[..]);
    }
}
