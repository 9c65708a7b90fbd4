mod request;
mod stream;

pub use request::{build_request_body, wire_messages, ImageUrl, WireContent, WireMessage, WirePart};
pub use stream::{
    classify_line, decode_chunk, ChunkContent, LineFramer, StreamError, StreamErrorKind,
    StreamLine,
};
