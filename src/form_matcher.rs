//! Streaming matcher for `application/x-www-form-urlencoded` bodies.
//!
//! [`parse`] walks the body once, percent-decoding as it goes, and copies the values of a
//! small fixed set of keys straight into caller-owned buffers. Nothing is allocated and no
//! intermediate key or value is ever stored.
//!
//! Every value buffer that receives a value is NUL-terminated. Values longer than the buffer
//! keep their first `capacity - 1` bytes. Unknown keys and their values are skipped.

/// Matching is tracked in a `u32` bit set; descriptors past this index never match.
pub const MAX_FIELDS: usize = 32;

/// One key of interest and the buffer its value is decoded into.
///
/// The whole buffer is the capacity, including the terminating NUL.
pub struct FieldDescriptor<'a> {
    name: &'a [u8],
    value: &'a mut [u8],
}

impl<'a> FieldDescriptor<'a> {
    /// Describe the key `name`, decoding its value into `value`.
    pub const fn new(name: &'a str, value: &'a mut [u8]) -> Self {
        Self {
            name: name.as_bytes(),
            value,
        }
    }

    /// The key this descriptor matches.
    #[must_use]
    pub const fn name(&self) -> &[u8] {
        self.name
    }

    /// Bytes of the value up to (not including) the first NUL.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        terminated(self.value)
    }

    /// Size of the value buffer, terminator included.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.value.len()
    }

    fn write(&mut self, at: usize, byte: u8) {
        if let Some(slot) = self.value.get_mut(at) {
            *slot = byte;
        }
    }

    fn terminate(&mut self, at: usize) {
        self.write(at, 0);
    }
}

/// The bytes of `buffer` before its first NUL (all of it when there is none).
#[must_use]
pub fn terminated(buffer: &[u8]) -> &[u8] {
    let end = buffer
        .iter()
        .position(|&byte| byte == 0)
        .unwrap_or(buffer.len());
    buffer.get(..end).unwrap_or_default()
}

/// Decode `body` and fill every descriptor whose key appears in it.
///
/// When a key repeats, the last occurrence wins.
pub fn parse(body: &[u8], fields: &mut [FieldDescriptor<'_>]) {
    let mut cursor = MatchCursor::new(fields);
    let mut scanning_value = false;
    let mut rest = body;

    while let Some((decoded, consumed)) = decode_next(rest) {
        rest = rest.get(consumed..).unwrap_or_default();

        if scanning_value {
            match decoded {
                Decoded::Raw(b'&') => {
                    cursor.finish_value(fields);
                    cursor.restart(fields);
                    scanning_value = false;
                }
                Decoded::Raw(byte) | Decoded::Escaped(byte) => cursor.push_value(fields, byte),
            }
        } else {
            match decoded {
                Decoded::Raw(b'=') => {
                    cursor.begin_value(fields);
                    scanning_value = true;
                }
                Decoded::Raw(b'&') => cursor.restart(fields),
                Decoded::Raw(byte) | Decoded::Escaped(byte) => cursor.push_key(fields, byte),
            }
        }
    }

    if scanning_value {
        cursor.finish_value(fields);
    }
}

/// A decoded body byte. Only raw bytes can act as `=`/`&` separators.
#[derive(Clone, Copy)]
enum Decoded {
    Raw(u8),
    Escaped(u8),
}

/// Decode one byte from the front of `input`, returning it and the number of input bytes used.
fn decode_next(input: &[u8]) -> Option<(Decoded, usize)> {
    match *input {
        [] => None,
        [b'+', ..] => Some((Decoded::Escaped(b' '), 1)),
        [b'%', high, low, ..] => match (hex_value(high), hex_value(low)) {
            (Some(high), Some(low)) => Some((Decoded::Escaped((high << 4) | low), 3)),
            _ => Some((Decoded::Raw(b'%'), 1)),
        },
        [byte, ..] => Some((Decoded::Raw(byte), 1)),
    }
}

const fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => digit.checked_sub(b'0'),
        b'a'..=b'f' => digit.checked_sub(b'a' - 10),
        b'A'..=b'F' => digit.checked_sub(b'A' - 10),
        _ => None,
    }
}

/// Key-matching and value-writing progress for the current key.
///
/// `live` holds the descriptors whose name still agrees with every key byte seen so far;
/// it only ever shrinks until the next key starts.
struct MatchCursor {
    live: u32,
    key_len: usize,
    target: Option<usize>,
    written: usize,
}

impl MatchCursor {
    fn new(fields: &[FieldDescriptor<'_>]) -> Self {
        let mut cursor = Self {
            live: 0,
            key_len: 0,
            target: None,
            written: 0,
        };
        cursor.restart(fields);
        cursor
    }

    fn restart(&mut self, fields: &[FieldDescriptor<'_>]) {
        self.live = fields
            .iter()
            .take(MAX_FIELDS)
            .enumerate()
            .filter(|(_, field)| field.capacity() > 0)
            .fold(0, |live, (index, _)| live | (1 << index));
        self.key_len = 0;
        self.target = None;
        self.written = 0;
    }

    fn push_key(&mut self, fields: &[FieldDescriptor<'_>], byte: u8) {
        if self.live == 0 {
            return;
        }
        for (index, field) in fields.iter().take(MAX_FIELDS).enumerate() {
            if field.name.get(self.key_len) != Some(&byte) {
                self.live &= !(1 << index);
            }
        }
        self.key_len = self.key_len.saturating_add(1);
    }

    /// At `=`: the first live descriptor whose name is exactly the key seen so far.
    fn begin_value(&mut self, fields: &[FieldDescriptor<'_>]) {
        let (live, key_len) = (self.live, self.key_len);
        self.target = fields
            .iter()
            .take(MAX_FIELDS)
            .enumerate()
            .find(|&(index, field)| live & (1 << index) != 0 && field.name.len() == key_len)
            .map(|(index, _)| index);
        self.written = 0;
    }

    fn push_value(&mut self, fields: &mut [FieldDescriptor<'_>], byte: u8) {
        let Some(field) = self.target.and_then(|index| fields.get_mut(index)) else {
            return;
        };
        if self.written.saturating_add(1) < field.capacity() {
            field.write(self.written, byte);
            self.written = self.written.saturating_add(1);
        } else {
            field.terminate(self.written);
            self.target = None;
        }
    }

    fn finish_value(&mut self, fields: &mut [FieldDescriptor<'_>]) {
        if let Some(field) = self.target.take().and_then(|index| fields.get_mut(index)) {
            field.terminate(self.written);
        }
    }
}
