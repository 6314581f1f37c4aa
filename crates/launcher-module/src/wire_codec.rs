//! `WireCodec`: default `Codec` implementation.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! header   := txid:u32 reserved:u32 flags:u32 ordinal:u32
//! string   := len:u32 bytes[len]                  (no NUL inside)
//! ostring  := len:u32 bytes[len] | 0xFFFF_FFFF    (absent)
//! vector   := count:u32 element[count]
//! handle   := 0xFFFF_FFFF (next attached handle) | 0 (absent)
//!
//! Launch       := header handle(executable) handle(job) string(name)
//! AddArgs      := header vector<string>
//! AddEnvirons  := header vector<string>
//! AddNames     := header vector<string(path) handle(directory)>
//! AddHandles   := header vector<handle u32(id)>
//! LaunchReply  := header i32(status) handle(process) handle(root_vmar) ostring
//! ```
//!
//! Handles are consumed from the message's attachment list in the order
//! their markers appear. A decode must use up every byte and every
//! handle; anything left over is an error.

use std::ffi::{CStr, CString};

use launcher_core::codec::Codec;
use launcher_core::error::{DecodeError, EncodeError};
use launcher_core::handle::Handle;
use launcher_core::message::{
    ordinal, Header, HandleInfo, LaunchInfo, LaunchResult, NameInfo, RawMessage, Request,
    HEADER_LEN, MAX_MESSAGE_BYTES, MAX_MESSAGE_HANDLES,
};
use launcher_core::status::Status;

pub const HANDLE_PRESENT: u32 = 0xFFFF_FFFF;
pub const HANDLE_ABSENT: u32 = 0;
const STRING_ABSENT: u32 = 0xFFFF_FFFF;

/// Longest path or argument string.
pub const MAX_STRING: usize = 4096;
/// Longest process name.
pub const MAX_NAME: usize = 32;
/// Most entries in one vector.
pub const MAX_VECTOR: usize = 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

impl WireCodec {
    pub fn new() -> Self {
        Self
    }

    /// Client-side encoding of a request.
    pub fn encode_request(&self, txid: u32, request: Request) -> Result<RawMessage, EncodeError> {
        let mut enc = Encoder::new(&Header::new(txid, request.ordinal()));
        match request {
            Request::Launch(info) => {
                enc.put_handle(Some(info.executable));
                enc.put_handle(Some(info.job));
                enc.put_string(&info.name);
            }
            Request::AddArgs(strings) | Request::AddEnvirons(strings) => {
                enc.put_u32(strings.len() as u32);
                for s in &strings {
                    enc.put_string(s);
                }
            }
            Request::AddNames(names) => {
                enc.put_u32(names.len() as u32);
                for n in names {
                    enc.put_string(&n.path);
                    enc.put_handle(Some(n.directory));
                }
            }
            Request::AddHandles(handles) => {
                enc.put_u32(handles.len() as u32);
                for h in handles {
                    enc.put_handle(Some(h.handle));
                    enc.put_u32(h.id);
                }
            }
            Request::Unknown { .. } => {}
        }
        enc.finish()
    }

    /// Client-side decoding of a Launch response.
    pub fn decode_launch_response(
        &self,
        msg: RawMessage,
    ) -> Result<(Header, LaunchResult), DecodeError> {
        let RawMessage { bytes, handles } = msg;
        let mut d = Decoder::new(&bytes, handles);
        let header = d.header()?;
        if header.ordinal != ordinal::LAUNCH {
            return Err(DecodeError::Mismatch {
                field: "ordinal",
                expected: ordinal::LAUNCH,
                actual: header.ordinal,
            });
        }
        let status = Status(d.i32()?);
        let process = d.opt_handle()?;
        let root_vmar = d.opt_handle()?;
        let error_message = d.opt_string(MAX_MESSAGE_BYTES)?;
        d.finish()?;
        Ok((header, LaunchResult { status, process, root_vmar, error_message }))
    }
}

impl Codec for WireCodec {
    fn decode_header(&self, bytes: &[u8]) -> Result<Header, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::ShortHeader(bytes.len()));
        }
        Decoder::new(bytes, Vec::new()).header()
    }

    fn decode_request(&self, header: &Header, msg: RawMessage) -> Result<Request, DecodeError> {
        let RawMessage { bytes, handles } = msg;
        let mut d = Decoder::new(&bytes, handles);
        d.skip(HEADER_LEN)?;
        let request = match header.ordinal {
            ordinal::LAUNCH => {
                let executable = d.handle()?;
                let job = d.handle()?;
                let name = d.string(MAX_NAME)?;
                Request::Launch(LaunchInfo { executable, job, name })
            }
            ordinal::ADD_ARGS => Request::AddArgs(d.strings()?),
            ordinal::ADD_ENVIRONS => Request::AddEnvirons(d.strings()?),
            ordinal::ADD_NAMES => {
                let count = d.count()?;
                let mut names = Vec::with_capacity(count);
                for _ in 0..count {
                    let path = d.string(MAX_STRING)?;
                    let directory = d.handle()?;
                    names.push(NameInfo { path, directory });
                }
                Request::AddNames(names)
            }
            ordinal::ADD_HANDLES => {
                let count = d.count()?;
                let mut infos = Vec::with_capacity(count);
                for _ in 0..count {
                    let handle = d.handle()?;
                    let id = d.u32()?;
                    infos.push(HandleInfo { handle, id });
                }
                Request::AddHandles(infos)
            }
            other => {
                // Body layout unknown; leave it unread.
                return Ok(Request::Unknown { ordinal: other });
            }
        };
        d.finish()?;
        Ok(request)
    }

    fn encode_launch_response(
        &self,
        header: &Header,
        result: LaunchResult,
    ) -> Result<RawMessage, EncodeError> {
        let mut enc = Encoder::new(&Header::new(header.txid, header.ordinal));
        enc.put_i32(result.status.into_raw());
        enc.put_handle(result.process);
        enc.put_handle(result.root_vmar);
        enc.put_opt_string(result.error_message.as_deref());
        enc.finish()
    }
}

/// Cursor over a message's bytes and its attached handles.
pub(crate) struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    handles: std::vec::IntoIter<Handle>,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(bytes: &'a [u8], handles: Vec<Handle>) -> Self {
        Self { bytes, pos: 0, handles: handles.into_iter() }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.bytes.len() - self.pos < n {
            return Err(DecodeError::Truncated { offset: self.pos });
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, DecodeError> {
        self.u32().map(|v| v as i32)
    }

    pub(crate) fn header(&mut self) -> Result<Header, DecodeError> {
        if self.bytes.len() - self.pos < HEADER_LEN {
            return Err(DecodeError::ShortHeader(self.bytes.len() - self.pos));
        }
        let txid = self.u32()?;
        let _reserved = self.u32()?;
        let flags = self.u32()?;
        let ordinal = self.u32()?;
        Ok(Header { txid, flags, ordinal })
    }

    fn count(&mut self) -> Result<usize, DecodeError> {
        let count = self.u32()? as usize;
        if count > MAX_VECTOR {
            return Err(DecodeError::VectorTooLong { count, max: MAX_VECTOR });
        }
        Ok(count)
    }

    pub(crate) fn string(&mut self, max: usize) -> Result<CString, DecodeError> {
        let len = self.u32()? as usize;
        if len > max {
            return Err(DecodeError::StringTooLong { len, max });
        }
        let raw = self.take(len)?;
        CString::new(raw).map_err(|_| DecodeError::InteriorNul)
    }

    fn strings(&mut self) -> Result<Vec<CString>, DecodeError> {
        let count = self.count()?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.string(MAX_STRING)?);
        }
        Ok(out)
    }

    fn opt_string(&mut self, max: usize) -> Result<Option<String>, DecodeError> {
        let len = self.u32()?;
        if len == STRING_ABSENT {
            return Ok(None);
        }
        let len = len as usize;
        if len > max {
            return Err(DecodeError::StringTooLong { len, max });
        }
        let raw = self.take(len)?;
        Ok(Some(String::from_utf8_lossy(raw).into_owned()))
    }

    pub(crate) fn opt_handle(&mut self) -> Result<Option<Handle>, DecodeError> {
        match self.u32()? {
            HANDLE_ABSENT => Ok(None),
            HANDLE_PRESENT => self.handles.next().map(Some).ok_or(DecodeError::HandleUnderflow),
            other => Err(DecodeError::BadHandleMarker(other)),
        }
    }

    pub(crate) fn handle(&mut self) -> Result<Handle, DecodeError> {
        self.opt_handle()?.ok_or(DecodeError::MissingHandle)
    }

    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        let left = self.bytes.len() - self.pos;
        if left != 0 {
            return Err(DecodeError::TrailingBytes(left));
        }
        let handles_left = self.handles.len();
        if handles_left != 0 {
            return Err(DecodeError::TrailingHandles(handles_left));
        }
        Ok(())
    }
}

/// Builds one message; handles are attached in marker order.
pub(crate) struct Encoder {
    bytes: Vec<u8>,
    handles: Vec<Handle>,
}

impl Encoder {
    pub(crate) fn new(header: &Header) -> Self {
        let mut enc = Self { bytes: Vec::with_capacity(64), handles: Vec::new() };
        enc.put_u32(header.txid);
        enc.put_u32(0);
        enc.put_u32(header.flags);
        enc.put_u32(header.ordinal);
        enc
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_i32(&mut self, v: i32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn put_string(&mut self, s: &CStr) {
        let raw = s.to_bytes();
        self.put_u32(raw.len() as u32);
        self.bytes.extend_from_slice(raw);
    }

    fn put_opt_string(&mut self, s: Option<&str>) {
        match s {
            Some(s) => {
                self.put_u32(s.len() as u32);
                self.bytes.extend_from_slice(s.as_bytes());
            }
            None => self.put_u32(STRING_ABSENT),
        }
    }

    pub(crate) fn put_handle(&mut self, h: Option<Handle>) {
        match h {
            Some(h) => {
                self.put_u32(HANDLE_PRESENT);
                self.handles.push(h);
            }
            None => self.put_u32(HANDLE_ABSENT),
        }
    }

    pub(crate) fn finish(self) -> Result<RawMessage, EncodeError> {
        if self.bytes.len() > MAX_MESSAGE_BYTES {
            return Err(EncodeError::TooLarge(self.bytes.len()));
        }
        if self.handles.len() > MAX_MESSAGE_HANDLES {
            return Err(EncodeError::TooManyHandles(self.handles.len()));
        }
        Ok(RawMessage::new(self.bytes, self.handles))
    }
}
