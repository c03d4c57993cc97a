//! Shared helpers for the unit tests.

use crate::header::{Header, Trailer};

/// Data size claimed by every fake trailer.
pub const FAKE_DATA_SIZE: u64 = 1000;

/// A syntactically valid member image whose stream is filler: correct
/// header, consistent trailer, right sizes.  The stream never decodes
/// (the byte pattern is not a valid LZMA stream) and contains no zero
/// bytes, so backward scans cannot misfire inside it.
pub fn fake_member(stream_size: usize) -> Vec<u8> {
    let mut image = Header::new(1 << 12).expect("valid dictionary size").data.to_vec();
    for i in 0..stream_size {
        image.push((((i * 7) + 13) % 255) as u8 + 1);
    }
    let msize = (Header::SIZE + stream_size + Trailer::SIZE) as u64;
    image.extend_from_slice(&Trailer::new(0xDEADBEEF, FAKE_DATA_SIZE, msize).data);
    image
}
