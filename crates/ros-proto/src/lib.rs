// ros-proto: RouterOS API wire protocol framing and reply model.
//
// The API encodes each word with a variable-length big-endian length prefix
// and terminates a sentence with an empty word (a single zero byte).  This
// crate is pure: encoding/decoding over byte slices, no I/O, no state beyond
// the incremental decoder's buffer.

pub mod reply;
pub mod sentence;
pub mod word;

pub use reply::{Attrs, Reply};
pub use sentence::{SentenceDecoder, encode_sentence};
pub use word::FrameError;
