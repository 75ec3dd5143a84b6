//! Incremental UTF-8 decoding across read boundaries.

/// Decodes a byte stream chunk by chunk.
///
/// A multi-byte sequence split across two reads is carried over and
/// completed by the next chunk. Bytes that can never form valid UTF-8 are
/// replaced with U+FFFD instead of being held back.
#[derive(Debug, Default)]
pub struct Utf8Reassembler {
    carry: Vec<u8>,
}

impl Utf8Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `chunk`, prefixed by any incomplete tail from the previous call.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Bytes held back waiting for the rest of a code point
    pub fn pending(&self) -> &[u8] {
        &self.carry
    }
}
