//! QAP1 client that works with this crate's server.

use color_eyre::eyre::{bail, ensure, WrapErr};
use color_eyre::Result;
use log::debug;
use std::error::Error;
use std::fmt;
use std::io::prelude::*;
use std::net::TcpStream;

use byteorder::{ByteOrder, LE};

use crate::proto::{get_stat, put_param, Cmd, Dt, ErrCode, Header, ProtocolError, CMD_RESP, RESP_OK};
use crate::sexp::Sexp;
use crate::transport::Transport;

/// Failure reported by the server in a reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteError {
    /// The stat value from the response word.
    pub stat: i32,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match ErrCode::try_from(self.stat as u8) {
            Ok(code) => write!(f, "server error {code:?} ({:#x})", self.stat),
            Err(_) => write!(f, "server error stat {:#x}", self.stat),
        }
    }
}

impl Error for RemoteError {}

/// Client for one server connection.
#[derive(Debug)]
pub struct Client<IO: Transport> {
    conn: IO,
    banner: [u8; 32],
}

impl Client<TcpStream> {
    /// Connect over TCP and consume the ID banner.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).wrap_err("connecting to server")?;
        stream.set_nodelay(true)?;
        Self::new(stream)
    }
}

impl<IO: Transport> Client<IO> {
    /// Validate the ID banner on an established stream and return a client
    /// ready for use.
    pub fn new(mut stream: IO) -> Result<Self> {
        let mut banner = [0u8; 32];
        stream.read_exact(&mut banner).wrap_err("reading ID banner")?;
        ensure!(
            &banner[..4] == b"Rsrv",
            ProtocolError::new("missing Rsrv signature in banner")
        );
        ensure!(
            &banner[8..12] == b"QAP1",
            ProtocolError::new("server speaks an unsupported framing protocol")
        );
        debug!(
            target: "rsrv",
            "connected to server version {}",
            String::from_utf8_lossy(&banner[4..8])
        );
        Ok(Self {
            conn: stream,
            banner,
        })
    }

    /// The raw 32-octet banner the server sent.
    pub fn banner(&self) -> &[u8; 32] {
        &self.banner
    }

    /// Evaluate source text and decode the resulting value tree.
    pub fn eval(&mut self, source: &str) -> Result<Sexp> {
        let (hdr, body) = self.eval_request(Cmd::Eval, source)?;
        Self::check("eval", &hdr)?;
        Sexp::decode(&body)
    }

    /// Evaluate source text, discarding the result server-side.
    pub fn void_eval(&mut self, source: &str) -> Result<()> {
        let (hdr, _) = self.eval_request(Cmd::VoidEval, source)?;
        Self::check("voidEval", &hdr)
    }

    /// Log in. The server accepts any credentials; the call exists for
    /// compatibility with clients that always authenticate.
    pub fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let mut payload = Vec::new();
        string_param(&mut payload, &format!("{user}\n{password}"))?;
        let (hdr, _) = self.request(Cmd::Login, &payload)?;
        Self::check("login", &hdr)
    }

    /// Open a file for reading in the connection directory.
    pub fn open_file(&mut self, name: &str) -> Result<()> {
        self.file_request(Cmd::OpenFile, name)
    }

    /// Create (truncate) a file for writing in the connection directory.
    pub fn create_file(&mut self, name: &str) -> Result<()> {
        self.file_request(Cmd::CreateFile, name)
    }

    /// Release the open file handle.
    pub fn close_file(&mut self) -> Result<()> {
        let (hdr, _) = self.request(Cmd::CloseFile, &[])?;
        Self::check("closeFile", &hdr)
    }

    /// Read up to `hint` octets (the server's chunk size when `None`).
    /// An empty result means end of file.
    pub fn read_file(&mut self, hint: Option<i32>) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        if let Some(hint) = hint {
            let mut b = [0u8; 4];
            LE::write_i32(&mut b, hint);
            put_param(&mut payload, Dt::Int, &b)?;
        }
        let (hdr, body) = self.request(Cmd::ReadFile, &payload)?;
        Self::check("readFile", &hdr)?;
        Ok(body)
    }

    /// Write all of `data` to the open file.
    pub fn write_file(&mut self, data: &[u8]) -> Result<()> {
        let mut payload = Vec::new();
        put_param(&mut payload, Dt::Bytestream, data)?;
        let (hdr, _) = self.request(Cmd::WriteFile, &payload)?;
        Self::check("writeFile", &hdr)
    }

    /// Ask the server to shut down.
    pub fn shutdown(mut self) -> Result<()> {
        let (hdr, _) = self.request(Cmd::Shutdown, &[])?;
        Self::check("shutdown", &hdr)
    }

    fn eval_request(&mut self, cmd: Cmd, source: &str) -> Result<(Header, Vec<u8>)> {
        // the server-side parser requires a trailing newline
        let mut src = source.to_string();
        if !src.ends_with('\n') {
            src.push('\n');
        }
        let mut payload = Vec::new();
        string_param(&mut payload, &src)?;
        self.request(cmd, &payload)
    }

    fn file_request(&mut self, cmd: Cmd, name: &str) -> Result<()> {
        let mut payload = Vec::new();
        string_param(&mut payload, name)?;
        let (hdr, _) = self.request(cmd, &payload)?;
        Self::check(if cmd == Cmd::OpenFile { "openFile" } else { "createFile" }, &hdr)
    }

    fn request(&mut self, cmd: Cmd, payload: &[u8]) -> Result<(Header, Vec<u8>)> {
        Header::new(cmd.into(), payload.len() as u32).put(&mut self.conn)?;
        self.conn.write_all(payload)?;
        self.conn.flush()?;

        let hdr = match Header::get(&mut self.conn)? {
            Some(hdr) => hdr,
            None => bail!(ProtocolError::new("server closed the connection")),
        };
        ensure!(
            hdr.cmd & CMD_RESP != 0,
            ProtocolError::new("reply lacks the response flag")
        );
        let mut body = vec![0u8; hdr.len as usize];
        self.conn
            .read_exact(&mut body)
            .wrap_err_with(|| format!("reading {}-octet reply body", hdr.len))?;
        Ok((hdr, body))
    }

    fn check(method: &str, hdr: &Header) -> Result<()> {
        if hdr.cmd == RESP_OK {
            return Ok(());
        }
        let err = RemoteError {
            stat: get_stat(hdr.cmd),
        };
        debug!(target: "rsrv", "{method}: {err}");
        Err(err).wrap_err_with(|| format!("{method} failed"))
    }
}

// NUL-terminated and padded to a word boundary, as the reference clients do
fn string_param(payload: &mut Vec<u8>, s: &str) -> Result<()> {
    let mut body = Vec::with_capacity(s.len() + 4);
    body.extend_from_slice(s.as_bytes());
    body.push(0);
    while body.len() % 4 != 0 {
        body.push(0);
    }
    put_param(payload, Dt::String, &body)
}
