//! Wire codec abstraction.
//!
//! # Implementors
//!
//! - `WireCodec` (default): little-endian, length-prefixed layout with
//!   out-of-band handle markers.

use crate::error::{DecodeError, EncodeError};
use crate::message::{Header, LaunchResult, RawMessage, Request};

/// Decodes requests and encodes Launch responses.
///
/// Decoding is split so the dispatcher can name the operation when a
/// body fails to decode: the header is read first, then the body is
/// decoded against it. The body decoder consumes the message; handles
/// of a message that fails to decode are closed with it.
pub trait Codec {
    fn decode_header(&self, bytes: &[u8]) -> Result<Header, DecodeError>;

    /// Must consume every byte and every handle. An ordinal with no
    /// request type decodes to `Request::Unknown`.
    fn decode_request(&self, header: &Header, msg: RawMessage) -> Result<Request, DecodeError>;

    /// Response for `header`'s transaction, echoing its txid.
    fn encode_launch_response(
        &self,
        header: &Header,
        result: LaunchResult,
    ) -> Result<RawMessage, EncodeError>;
}
