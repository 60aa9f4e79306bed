use std::io;

/// Parses a message out of one received frame.
///
/// Payloads may borrow from `buf`, which is the receiver's reusable buffer.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
