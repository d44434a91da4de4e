mod buffer;
mod errors;

pub use self::buffer::ByteBuffer;
pub use self::errors::{Error, ErrorKind, Result};
