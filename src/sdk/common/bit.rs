#[macro_export]
macro_rules! BIT {
    ( $x:expr ) => {
        1 << $x
    };
}

#[macro_export]
macro_rules! BIT_MASK_LEN {
    ( $x:expr ) => {
        (1u64 << $x) - 1
    };
}

/// Reads little-endian bit fields, least significant bit of each octet first, the
/// way the Core Specification packs ACAD and PDU fields on air.
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Returns `None` when fewer than `bits` remain.
    pub fn read(&mut self, bits: usize) -> Option<u64> {
        debug_assert!(bits <= 64);
        if self.pos + bits > self.data.len() * 8 {
            return None;
        }

        let mut value = 0u64;
        for i in 0..bits {
            let bit = self.pos + i;
            if self.data[bit >> 3] & BIT!(bit & 7) != 0 {
                value |= 1u64 << i;
            }
        }
        self.pos += bits;

        Some(value)
    }

    pub fn read_bytes<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        for b in out.iter_mut() {
            *b = self.read(8)? as u8;
        }
        Some(out)
    }

    pub fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.pos
    }
}

/// Inverse of [`BitReader`]; the buffer must be zeroed before writing.
pub struct BitWriter<'a> {
    data: &'a mut [u8],
    pos: usize,
}

impl<'a> BitWriter<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn write(&mut self, value: u64, bits: usize) -> Option<()> {
        if self.pos + bits > self.data.len() * 8 {
            return None;
        }

        for i in 0..bits {
            if value & (1u64 << i) != 0 {
                let bit = self.pos + i;
                self.data[bit >> 3] |= BIT!(bit & 7);
            }
        }
        self.pos += bits;

        Some(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Option<()> {
        for b in bytes {
            self.write(*b as u64, 8)?;
        }
        Some(())
    }

    pub fn len(&self) -> usize {
        (self.pos + 7) / 8
    }
}
