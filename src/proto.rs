//! QAP1 protocol constants and framing.
//!
//! QAP1 ("quad attributes packets") frames every request and response as a
//! 16-octet header followed by a typed parameter list. All integers and
//! doubles on the wire are little-endian regardless of host order.
//!
//! See <https://www.rforge.net/Rserve/doc.html> for the protocol description.
#![deny(missing_docs)]
use color_eyre::eyre::{bail, ensure};
use color_eyre::Result;
use log::warn;
use std::error::Error;
use std::fmt;
use std::io::{self, prelude::*};

use byteorder::{ByteOrder, ReadBytesExt, WriteBytesExt, LE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 6311;

/// ID banner sent immediately after accept: signature, protocol version,
/// framing marker, then filler up to exactly 32 octets.
pub const ID_STRING: &[u8; 32] = b"Rsrv0100QAP1\r\n\r\n--------------\r\n";

/// Per-connection input scratch size.
pub const INPUT_BUF: usize = 2048;
/// Largest request body accepted before the oversize path kicks in.
pub const MAX_REQUEST: usize = INPUT_BUF - 4;
/// Default transfer chunk for `readFile`.
pub const FILE_BUF: usize = 32768;
/// Initial capacity of the per-connection send buffer.
pub const SEND_BUF: usize = 2048 * 1024;

/// Flag set on the `cmd` word of every response.
pub const CMD_RESP: u32 = 0x10000;
/// Response: command succeeded.
pub const RESP_OK: u32 = CMD_RESP | 0x0001;
/// Response: command failed; the stat bits carry the reason.
pub const RESP_ERR: u32 = CMD_RESP | 0x0002;

/// Pack a 7-bit stat value into bits 24-30 of a response word.
pub fn set_stat(cmd: u32, stat: i32) -> u32 {
    cmd | (((stat & 0x7f) as u32) << 24)
}

/// Extract the stat value from a response word.
pub fn get_stat(cmd: u32) -> i32 {
    ((cmd >> 24) & 0x7f) as i32
}

/// Request commands.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum Cmd {
    /// "name\npwd", accepted for compatibility; the core is unauthenticated.
    Login = 0x001,
    /// Parse and evaluate source text, discarding the result.
    VoidEval = 0x002,
    /// Parse and evaluate source text, returning the encoded value tree.
    Eval = 0x003,
    /// Stop the whole server.
    Shutdown = 0x004,
    /// Open a file for reading in the connection directory.
    OpenFile = 0x010,
    /// Create (truncate) a file for writing in the connection directory.
    CreateFile = 0x011,
    /// Release the open file handle.
    CloseFile = 0x012,
    /// Read up to a hinted number of octets from the open file.
    ReadFile = 0x013,
    /// Write a byte stream to the open file.
    WriteFile = 0x014,
}

/// Error stats carried in failed responses. Stats 0x00-0x3f are reserved for
/// evaluator codes (parse status); negative stats are evaluator runtime
/// errors.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrCode {
    /// Authentication failed or required but not attempted.
    AuthFailed = 0x41,
    /// Connection closed or a broken packet killed it.
    ConnBroken = 0x42,
    /// Invalid or unsupported command.
    InvCmd = 0x43,
    /// Some parameters are invalid.
    InvPar = 0x44,
    /// Evaluator runtime error.
    RError = 0x45,
    /// File I/O error.
    IoError = 0x46,
    /// File read/write attempted with no open file.
    NotOpen = 0x47,
    /// Operation not allowed for this client.
    AccessDenied = 0x48,
    /// Command known but not supported on this build.
    UnsupportedCmd = 0x49,
    /// Command not recognized at all.
    UnknownCmd = 0x4a,
}

/// Data-type tags for entries of the parameter list.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Dt {
    /// 4-octet integer.
    Int = 1,
    /// Single octet.
    Char = 2,
    /// 8-octet double.
    Double = 3,
    /// NUL-terminated string.
    String = 4,
    /// Opaque octet sequence, may contain NUL.
    Bytestream = 5,
    /// Encoded value tree.
    Sexp = 10,
    /// Counted array of objects.
    Array = 11,
}

/// Wire-format violation detected while framing or parsing.
#[derive(Debug, Clone)]
pub struct ProtocolError(pub(crate) String);

impl ProtocolError {
    /// Wrap a description of the violation.
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "qap1 protocol error: {}", self.0)?;
        Ok(())
    }
}

impl Error for ProtocolError {}

/// Verify the byte-order normalizer: the first wire octet of 0x12345678 must
/// be 0x78. The process aborts at startup if this fails.
pub fn byte_sex_ok() -> bool {
    let mut b = [0u8; 4];
    LE::write_i32(&mut b, 0x12345678);
    b[0] == 0x78
}

/// The fixed 16-octet packet header. `cmd` carries a command on requests and
/// a response status on replies; `len` is the octet count of the payload that
/// follows; `dof` is the offset of the parameter list within the payload;
/// `res` is reserved and transmitted as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Command or response code.
    pub cmd: u32,
    /// Payload length in octets.
    pub len: u32,
    /// Data offset of the parameter list, normally 0.
    pub dof: u32,
    /// Reserved, must be zero.
    pub res: u32,
}

impl Header {
    /// Encoded size of the header.
    pub const SIZE: usize = 16;

    /// Header for a request or reply with a `len`-octet payload.
    pub fn new(cmd: u32, len: u32) -> Self {
        Self {
            cmd,
            len,
            dof: 0,
            res: 0,
        }
    }

    /// Read one header. Returns `None` on a clean end of stream at the frame
    /// boundary; a partial header is a protocol error.
    pub fn get<IO: Read>(mut stream: IO) -> Result<Option<Self>> {
        let mut buf = [0u8; Self::SIZE];
        let mut got = 0;
        while got < buf.len() {
            let n = stream.read(&mut buf[got..])?;
            if n == 0 {
                if got == 0 {
                    return Ok(None);
                }
                bail!(ProtocolError(format!("partial header ({got} of 16 octets)")));
            }
            got += n;
        }
        let mut cur = &buf[..];
        Ok(Some(Self {
            cmd: cur.read_u32::<LE>()?,
            len: cur.read_u32::<LE>()?,
            dof: cur.read_u32::<LE>()?,
            res: cur.read_u32::<LE>()?,
        }))
    }

    /// Write the header in wire order.
    pub fn put<IO: Write>(&self, mut stream: IO) -> io::Result<()> {
        stream.write_u32::<LE>(self.cmd)?;
        stream.write_u32::<LE>(self.len)?;
        stream.write_u32::<LE>(self.dof)?;
        stream.write_u32::<LE>(self.res)?;
        Ok(())
    }
}

/// At most this many parameters are recognized per request; the rest of the
/// payload is silently ignored.
pub const MAX_PARAMS: usize = 16;

/// One entry of a request's parameter list: the raw data-type tag and a
/// slice into the payload buffer. No copies are made.
#[derive(Debug, Clone, Copy)]
pub struct Param<'a> {
    /// Low 8 bits of the parameter header word.
    pub tag: u8,
    /// Parameter body.
    pub data: &'a [u8],
}

impl<'a> Param<'a> {
    /// The data-type tag, if it is one we recognize.
    pub fn typ(&self) -> Option<Dt> {
        Dt::try_from(self.tag).ok()
    }

    /// Decode a `DT_INT` body.
    pub fn as_int(&self) -> Option<i32> {
        if self.typ() != Some(Dt::Int) || self.data.len() < 4 {
            return None;
        }
        Some(LE::read_i32(&self.data[..4]))
    }

    /// Decode a `DT_STRING` body up to its NUL terminator.
    pub fn as_str(&self) -> Option<&'a str> {
        if self.typ() != Some(Dt::String) {
            return None;
        }
        let end = self.data.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&self.data[..end]).ok()
    }

    /// Borrow a `DT_BYTESTREAM` body.
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        if self.typ() != Some(Dt::Bytestream) {
            return None;
        }
        Some(self.data)
    }
}

/// Split a payload into its parameter list, starting at offset `dof`.
///
/// The walk stops at the first all-zero header word, at the end of the
/// payload, or at a parameter whose declared body would overrun it (the
/// malformed tail is dropped, never referenced).
pub fn walk_params(payload: &[u8], dof: usize) -> Vec<Param<'_>> {
    let mut params = Vec::new();
    let mut off = dof;
    while off + 4 <= payload.len() && params.len() < MAX_PARAMS {
        let word = LE::read_u32(&payload[off..off + 4]);
        if word == 0 {
            break;
        }
        let tag = (word & 0xff) as u8;
        let len = (word >> 8) as usize;
        let start = off + 4;
        if start + len > payload.len() {
            warn!(target: "rsrv", "parameter body overruns payload, dropping tail");
            break;
        }
        params.push(Param {
            tag,
            data: &payload[start..start + len],
        });
        off = start + len;
    }
    params
}

/// Append one encoded parameter (header word + body) to a request payload.
pub fn put_param<W: Write>(mut w: W, dt: Dt, body: &[u8]) -> Result<()> {
    ensure!(
        body.len() <= 0x7fffff,
        ProtocolError(format!("parameter body of {} octets too long", body.len()))
    );
    w.write_u32::<LE>(((body.len() as u32) << 8) | u8::from(dt) as u32)?;
    w.write_all(body)?;
    Ok(())
}

/// Builder for response frames.
#[must_use]
pub struct Reply<'a> {
    cmd: u32,
    body: &'a [u8],
}

impl<'a> Reply<'a> {
    /// Success with no payload.
    pub fn ok() -> Reply<'static> {
        Reply {
            cmd: RESP_OK,
            body: &[],
        }
    }

    /// Success carrying a raw payload.
    pub fn ok_data(body: &'a [u8]) -> Self {
        Reply { cmd: RESP_OK, body }
    }

    /// Failure with a protocol error code.
    pub fn err(code: ErrCode) -> Reply<'static> {
        Reply {
            cmd: set_stat(RESP_ERR, u8::from(code) as i32),
            body: &[],
        }
    }

    /// Failure carrying a raw evaluator stat (parse status or negated
    /// runtime code).
    pub fn stat(stat: i32) -> Reply<'static> {
        Reply {
            cmd: set_stat(RESP_ERR, stat),
            body: &[],
        }
    }

    /// Emit the response frame and flush so the client never waits on a
    /// buffered reply.
    pub fn put<IO: Write>(self, mut stream: IO) -> io::Result<()> {
        Header::new(self.cmd, self.body.len() as u32).put(&mut stream)?;
        stream.write_all(self.body)?;
        stream.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_sex_is_intel() {
        assert!(byte_sex_ok());
    }

    #[test]
    fn header_round_trip() {
        let hdr = Header {
            cmd: Cmd::Eval.into(),
            len: 12,
            dof: 0,
            res: 0,
        };
        let mut buf = Vec::new();
        hdr.put(&mut buf).unwrap();
        assert_eq!(buf.len(), Header::SIZE);
        // cmd=3 in wire order
        assert_eq!(&buf[..4], &[3, 0, 0, 0]);
        let back = Header::get(&buf[..]).unwrap().unwrap();
        assert_eq!(back, hdr);
    }

    #[test]
    fn header_clean_eof_vs_partial() {
        assert!(Header::get(&[][..]).unwrap().is_none());
        assert!(Header::get(&[1u8, 2, 3][..]).is_err());
    }

    #[test]
    fn stat_packing() {
        let cmd = set_stat(RESP_ERR, ErrCode::NotOpen as i32);
        assert_eq!(cmd & 0xffffff, RESP_ERR);
        assert_eq!(get_stat(cmd), 0x47);
        // negative evaluator codes survive masked to 7 bits
        assert_eq!(get_stat(set_stat(RESP_ERR, -2)), 0x7e);
    }

    #[test]
    fn param_walk_round_trip() {
        let mut payload = Vec::new();
        put_param(&mut payload, Dt::String, b"1+1\n\0\0\0\0").unwrap();
        put_param(&mut payload, Dt::Int, &[42, 0, 0, 0]).unwrap();
        let params = walk_params(&payload, 0);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].as_str(), Some("1+1\n"));
        assert_eq!(params[1].as_int(), Some(42));
    }

    #[test]
    fn param_walk_stops_at_zero_word() {
        let mut payload = Vec::new();
        put_param(&mut payload, Dt::Int, &[7, 0, 0, 0]).unwrap();
        payload.extend_from_slice(&[0, 0, 0, 0]);
        put_param(&mut payload, Dt::Int, &[8, 0, 0, 0]).unwrap();
        let params = walk_params(&payload, 0);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].as_int(), Some(7));
    }

    #[test]
    fn param_walk_caps_at_sixteen() {
        let mut payload = Vec::new();
        for i in 0..20 {
            put_param(&mut payload, Dt::Int, &[i, 0, 0, 0]).unwrap();
        }
        assert_eq!(walk_params(&payload, 0).len(), MAX_PARAMS);
    }

    #[test]
    fn param_walk_drops_overrunning_tail() {
        let mut payload = Vec::new();
        put_param(&mut payload, Dt::Int, &[1, 0, 0, 0]).unwrap();
        // declares 100 octets but provides none
        payload
            .write_u32::<LE>((100 << 8) | u8::from(Dt::Bytestream) as u32)
            .unwrap();
        let params = walk_params(&payload, 0);
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn param_walk_honors_dof() {
        let mut payload = vec![0xee, 0xee, 0xee, 0xee];
        put_param(&mut payload, Dt::Int, &[9, 0, 0, 0]).unwrap();
        let params = walk_params(&payload, 4);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].as_int(), Some(9));
    }

    #[test]
    fn reply_frame_shape() {
        let mut buf = Vec::new();
        Reply::err(ErrCode::InvPar).put(&mut buf).unwrap();
        assert_eq!(buf.len(), Header::SIZE);
        let hdr = Header::get(&buf[..]).unwrap().unwrap();
        assert_eq!(hdr.cmd & CMD_RESP, CMD_RESP);
        assert_eq!(get_stat(hdr.cmd), 0x44);
        assert_eq!(hdr.len, 0);

        let mut buf = Vec::new();
        Reply::ok_data(b"abc").put(&mut buf).unwrap();
        let hdr = Header::get(&buf[..]).unwrap().unwrap();
        assert_eq!(hdr.cmd, RESP_OK);
        assert_eq!(hdr.len as usize, buf.len() - Header::SIZE);
    }

    #[test]
    fn banner_is_32_octets() {
        assert_eq!(ID_STRING.len(), 32);
        assert_eq!(&ID_STRING[..12], b"Rsrv0100QAP1");
    }

    #[test]
    fn oversized_param_rejected() {
        let body = vec![0u8; 0x800000];
        assert!(put_param(Vec::new(), Dt::Bytestream, &body).is_err());
    }
}
