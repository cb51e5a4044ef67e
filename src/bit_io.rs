//! Bit-level I/O for JPEG 2000 packet headers.
//!
//! Packet headers are bit streams with a stuffing rule: a byte equal to
//! 0xFF may only be followed by a byte whose most significant bit is 0, so
//! after emitting 0xFF the next byte carries 7 payload bits. A header never
//! ends with 0xFF.

/// Writer accumulating packet header bits, MSB first.
pub struct PacketBitWriter {
    data: Vec<u8>,
    bit_buffer: u8,
    bits_count: u8,
    /// Capacity of the byte being filled: 8, or 7 right after a 0xFF byte.
    capacity: u8,
    bit_len: usize,
}

impl PacketBitWriter {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            bit_buffer: 0,
            bits_count: 0,
            capacity: 8,
            bit_len: 0,
        }
    }

    pub fn write_bit(&mut self, bit: u8) {
        self.bit_buffer = (self.bit_buffer << 1) | (bit & 1);
        self.bits_count += 1;
        self.bit_len += 1;
        if self.bits_count == self.capacity {
            self.flush_byte();
        }
    }

    /// Write the `count` low bits of `value`, most significant first. The
    /// field may be wider than the value (leading zeros are emitted).
    pub fn write_bits(&mut self, value: u32, count: u8) {
        debug_assert!(count <= 64);
        let value = value as u64;
        for i in (0..count).rev() {
            self.write_bit(((value >> i) & 1) as u8);
        }
    }

    fn flush_byte(&mut self) {
        // With capacity 7 the stuffed 0 is the (implicit) most significant
        // bit, so the byte value is just the 7 accumulated bits.
        let b = self.bit_buffer;
        self.data.push(b);
        self.capacity = if b == 0xFF { 7 } else { 8 };
        self.bit_buffer = 0;
        self.bits_count = 0;
    }

    /// Number of payload bits written so far (stuffed bits excluded).
    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// Pad with 0 bits to a byte boundary and return the header bytes.
    pub fn finish(mut self) -> Vec<u8> {
        if self.bits_count > 0 {
            self.bit_buffer <<= self.capacity - self.bits_count;
            self.flush_byte();
        }
        // The last header byte shall not be 0xFF.
        if self.data.last() == Some(&0xFF) {
            self.data.push(0x00);
        }
        self.data
    }
}

impl Default for PacketBitWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader undoing the stuffing performed by [`PacketBitWriter`].
pub struct PacketBitReader<'a> {
    data: &'a [u8],
    pos: usize,
    bit_buffer: u8,
    bits_left: u8,
    prev_was_ff: bool,
}

impl<'a> PacketBitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            bit_buffer: 0,
            bits_left: 0,
            prev_was_ff: false,
        }
    }

    pub fn read_bit(&mut self) -> Result<u8, ()> {
        if self.bits_left == 0 {
            if self.pos >= self.data.len() {
                return Err(()); // EOF
            }
            let b = self.data[self.pos];
            self.pos += 1;
            // After a 0xFF byte the MSB is a stuffed 0: only 7 bits remain.
            self.bits_left = if self.prev_was_ff { 7 } else { 8 };
            self.prev_was_ff = b == 0xFF;
            self.bit_buffer = b;
        }
        let bit = (self.bit_buffer >> (self.bits_left - 1)) & 1;
        self.bits_left -= 1;
        Ok(bit)
    }

    pub fn read_bits(&mut self, mut count: u8) -> Result<u32, ()> {
        let mut bits = 0u32;
        while count > 0 {
            let bit = self.read_bit()?;
            bits = (bits << 1) | (bit as u32);
            count -= 1;
        }
        Ok(bits)
    }

    pub fn has_data(&self) -> bool {
        self.pos < self.data.len() || self.bits_left > 0
    }
}
