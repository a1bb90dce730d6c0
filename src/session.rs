//! Per-connection request handling: banner, read-dispatch-reply loop, the
//! open-file slot and the connection working directory.

use color_eyre::Result;
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::{self, prelude::*, ErrorKind};
use std::path::{Path, PathBuf};

use crate::engine::Engine;
use crate::proto::{
    walk_params, Cmd, ErrCode, Header, Param, Reply, FILE_BUF, ID_STRING, INPUT_BUF, SEND_BUF,
};
use crate::transport::Transport;

/// How a session ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The client went away; the server keeps running.
    Disconnect,
    /// The client asked the whole server to stop.
    Shutdown,
}

/// State owned by one connection, dropped on disconnect.
pub struct Session<IO, E> {
    stream: IO,
    engine: E,
    ucix: u32,
    conn_dir: PathBuf,
    max_request: usize,
    file: Option<File>,
    sendbuf: Vec<u8>,
}

impl<IO: Transport, E: Engine> Session<IO, E> {
    /// Set up a session for an accepted stream. `ucix` is the unique
    /// connection index allocated by the supervisor.
    pub fn new(stream: IO, engine: E, ucix: u32, workdir: &Path, max_request: usize) -> Self {
        Self {
            stream,
            engine,
            ucix,
            conn_dir: workdir.join(format!("conn{ucix}")),
            max_request,
            file: None,
            sendbuf: Vec::with_capacity(SEND_BUF),
        }
    }

    /// Write the ID banner, then serve requests until the client disconnects
    /// or asks for shutdown. One command is in flight at a time; replies go
    /// out in request order.
    pub fn run(mut self) -> Result<Outcome> {
        // working directories are a convention for file commands, not a
        // sandbox; they are left behind for post-mortem inspection
        if let Err(err) = fs::create_dir_all(&self.conn_dir) {
            warn!(target: "rsrv", "could not create {}: {err}", self.conn_dir.display());
        }

        self.stream.write_all(ID_STRING)?;
        self.stream.flush()?;
        info!(target: "rsrv", "connection {} ready", self.ucix);

        let mut body = Vec::with_capacity(INPUT_BUF);
        loop {
            let hdr = match Header::get(&mut self.stream) {
                Ok(Some(hdr)) => hdr,
                Ok(None) => {
                    info!(target: "rsrv", "connection {} closed by peer", self.ucix);
                    return Ok(Outcome::Disconnect);
                }
                Err(err) => {
                    warn!(target: "rsrv", "connection {}: {err:#}", self.ucix);
                    let _ = Reply::err(ErrCode::ConnBroken).put(&mut self.stream);
                    return Ok(Outcome::Disconnect);
                }
            };
            debug!(target: "rsrv", "request cmd={:#x} len={} dof={}", hdr.cmd, hdr.len, hdr.dof);

            let len = hdr.len as usize;
            if len > self.max_request {
                // drain the stream to preserve framing, then reject without
                // dispatching
                warn!(target: "rsrv", "discarding oversized body ({len} octets)");
                if self.drain(len).is_err() {
                    let _ = Reply::err(ErrCode::ConnBroken).put(&mut self.stream);
                    return Ok(Outcome::Disconnect);
                }
                Reply::err(ErrCode::InvPar).put(&mut self.stream)?;
                continue;
            }

            body.resize(len, 0);
            if let Err(err) = self.stream.read_exact(&mut body) {
                warn!(target: "rsrv", "connection {}: body read failed: {err}", self.ucix);
                let _ = Reply::err(ErrCode::ConnBroken).put(&mut self.stream);
                return Ok(Outcome::Disconnect);
            }

            if let Some(outcome) = self.dispatch(&hdr, &body)? {
                return Ok(outcome);
            }
        }
    }

    fn dispatch(&mut self, hdr: &Header, body: &[u8]) -> Result<Option<Outcome>> {
        let params = walk_params(body, hdr.dof as usize);
        let cmd = match Cmd::try_from(hdr.cmd) {
            Ok(cmd) => cmd,
            Err(_) => {
                warn!(target: "rsrv", "invalid command {:#x}", hdr.cmd);
                Reply::err(ErrCode::InvCmd).put(&mut self.stream)?;
                return Ok(None);
            }
        };
        debug!(target: "rsrv", "{cmd:?} with {} parameter(s)", params.len());

        match cmd {
            Cmd::Shutdown => {
                Reply::ok().put(&mut self.stream)?;
                info!(target: "rsrv", "connection {} initiated clean shutdown", self.ucix);
                return Ok(Some(Outcome::Shutdown));
            }
            // the surviving command set is unauthenticated; accepted so
            // clients that always log in keep working
            Cmd::Login => Reply::ok().put(&mut self.stream)?,
            Cmd::OpenFile | Cmd::CreateFile => self.open_file(cmd, &params)?,
            Cmd::CloseFile => {
                // idempotent
                self.file = None;
                Reply::ok().put(&mut self.stream)?;
            }
            Cmd::ReadFile => self.read_file(&params)?,
            Cmd::WriteFile => self.write_file(&params)?,
            Cmd::VoidEval | Cmd::Eval => self.eval(cmd, &params)?,
        }
        Ok(None)
    }

    fn open_file(&mut self, cmd: Cmd, params: &[Param]) -> Result<()> {
        let name = match params.first().and_then(|p| p.as_str()) {
            Some(name) => name,
            None => {
                Reply::err(ErrCode::InvPar).put(&mut self.stream)?;
                return Ok(());
            }
        };
        // any previously open handle is replaced
        self.file = None;
        let path = self.conn_dir.join(name);
        let opened = if cmd == Cmd::OpenFile {
            File::open(&path)
        } else {
            File::create(&path)
        };
        match opened {
            Ok(f) => {
                self.file = Some(f);
                Reply::ok().put(&mut self.stream)?;
            }
            Err(err) => {
                warn!(target: "rsrv", "{cmd:?} {} failed: {err}", path.display());
                Reply::err(ErrCode::IoError).put(&mut self.stream)?;
            }
        }
        Ok(())
    }

    fn read_file(&mut self, params: &[Param]) -> Result<()> {
        let file = match &mut self.file {
            Some(f) => f,
            None => {
                Reply::err(ErrCode::NotOpen).put(&mut self.stream)?;
                return Ok(());
            }
        };
        let mut cap = FILE_BUF;
        if let Some(hint) = params.first().and_then(|p| p.as_int()) {
            // negative hints fall back to the default chunk
            if hint >= 0 {
                cap = cap.min(hint as usize);
            }
        }
        let mut data = Vec::with_capacity(cap);
        match std::io::Read::by_ref(file).take(cap as u64).read_to_end(&mut data) {
            // an empty body signals end of file
            Ok(_) => Reply::ok_data(&data).put(&mut self.stream)?,
            Err(err) => {
                warn!(target: "rsrv", "readFile failed: {err}");
                Reply::err(ErrCode::IoError).put(&mut self.stream)?;
            }
        }
        Ok(())
    }

    fn write_file(&mut self, params: &[Param]) -> Result<()> {
        let file = match &mut self.file {
            Some(f) => f,
            None => {
                Reply::err(ErrCode::NotOpen).put(&mut self.stream)?;
                return Ok(());
            }
        };
        let data = match params.first().and_then(|p| p.as_bytes()) {
            Some(data) => data,
            None => {
                Reply::err(ErrCode::InvPar).put(&mut self.stream)?;
                return Ok(());
            }
        };
        match file.write_all(data) {
            Ok(()) => Reply::ok().put(&mut self.stream)?,
            Err(err) => {
                warn!(target: "rsrv", "writeFile failed: {err}");
                Reply::err(ErrCode::IoError).put(&mut self.stream)?;
            }
        }
        Ok(())
    }

    fn eval(&mut self, cmd: Cmd, params: &[Param]) -> Result<()> {
        let source = match params.first().and_then(|p| p.as_str()) {
            Some(source) => source,
            None => {
                Reply::err(ErrCode::InvPar).put(&mut self.stream)?;
                return Ok(());
            }
        };
        // the source text must end in a newline; its count is what the
        // parser is told
        let lines = source.bytes().filter(|&b| b == b'\n').count();
        self.engine.reset();
        let expr = match self.engine.parse(source, lines) {
            Ok(expr) => expr,
            Err(status) => {
                debug!(target: "rsrv", "parse failed: {}", status.name());
                Reply::stat(status.stat()).put(&mut self.stream)?;
                return Ok(());
            }
        };
        match self.engine.eval(&expr) {
            Ok(value) => {
                if cmd == Cmd::VoidEval {
                    Reply::ok().put(&mut self.stream)?;
                    return Ok(());
                }
                self.sendbuf.clear();
                if value.put(&mut self.sendbuf).is_err() {
                    warn!(target: "rsrv", "result does not fit the value-tree encoding");
                    Reply::err(ErrCode::RError).put(&mut self.stream)?;
                    return Ok(());
                }
                debug!(target: "rsrv", "stored value tree, {} octets", self.sendbuf.len());
                Reply::ok_data(&self.sendbuf).put(&mut self.stream)?;
            }
            Err(err) => {
                debug!(target: "rsrv", "evaluation failed: {err}");
                Reply::stat(err.stat()).put(&mut self.stream)?;
            }
        }
        Ok(())
    }

    fn drain(&mut self, mut left: usize) -> io::Result<()> {
        let mut sink = [0u8; INPUT_BUF];
        while left > 0 {
            let want = left.min(sink.len());
            let n = self.stream.read(&mut sink[..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream ended mid-drain",
                ));
            }
            left -= n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, RemoteError};
    use crate::interp::Interp;
    use crate::proto::{self, get_stat, put_param, Dt, RESP_ERR, RESP_OK};
    use crate::sexp::{Kind, Sexp};
    use byteorder::{ReadBytesExt, LE};
    use readwrite::ReadWrite;
    use std::thread::{self, JoinHandle};

    type Duplex = ReadWrite<pipe::PipeReader, pipe::PipeWriter>;

    fn session_pair(test: &str) -> (Duplex, JoinHandle<Outcome>) {
        let (c2s_r, c2s_w) = pipe::pipe();
        let (s2c_r, s2c_w) = pipe::pipe();
        let server_io = ReadWrite::new(c2s_r, s2c_w);
        let client_io = ReadWrite::new(s2c_r, c2s_w);
        let workdir = std::env::temp_dir().join(format!("rsrv-test-{}-{test}", std::process::id()));
        let handle = thread::spawn(move || {
            Session::new(server_io, Interp::new(), 1, &workdir, proto::MAX_REQUEST)
                .run()
                .unwrap()
        });
        (client_io, handle)
    }

    fn client_pair(test: &str) -> (Client<Duplex>, JoinHandle<Outcome>) {
        let (client_io, handle) = session_pair(test);
        (Client::new(client_io).unwrap(), handle)
    }

    fn remote_stat(err: color_eyre::Report) -> i32 {
        err.downcast_ref::<RemoteError>().expect("remote error").stat
    }

    #[test]
    fn eval_round_trips() {
        let (mut client, handle) = client_pair("eval");
        assert_eq!(client.eval("1+1").unwrap(), Sexp::double(2.0));
        assert_eq!(
            client.eval("\"hi\"").unwrap(),
            Sexp::new(Kind::Char("hi".into()))
        );
        assert_eq!(client.eval("1:3").unwrap(), Sexp::ints(vec![1, 2, 3]));
        drop(client);
        assert_eq!(handle.join().unwrap(), Outcome::Disconnect);
    }

    #[test]
    fn environment_survives_across_requests() {
        let (mut client, handle) = client_pair("env");
        client.void_eval("x <- 5").unwrap();
        assert_eq!(client.eval("x * 2").unwrap(), Sexp::double(10.0));
        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn eval_error_stats() {
        let (mut client, handle) = client_pair("err");
        // parse error and incomplete input surface the raw parse status
        assert_eq!(remote_stat(client.eval("1 @ 2").unwrap_err()), 3);
        assert_eq!(remote_stat(client.eval("1 +").unwrap_err()), 2);
        // runtime errors surface negated, masked to 7 bits
        assert_eq!(remote_stat(client.eval("nope").unwrap_err()), 0x7f);
        // the connection survives all of them
        assert_eq!(client.eval("2+2").unwrap(), Sexp::double(4.0));
        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn file_round_trip() {
        let (mut client, handle) = client_pair("file");
        assert_eq!(
            remote_stat(client.read_file(None).unwrap_err()),
            ErrCode::NotOpen as i32
        );
        client.create_file("out.bin").unwrap();
        client.write_file(b"hello qap1").unwrap();
        client.close_file().unwrap();
        client.open_file("out.bin").unwrap();
        assert_eq!(client.read_file(None).unwrap(), b"hello qap1");
        // EOF reads back as an empty body
        assert_eq!(client.read_file(None).unwrap(), b"");
        // a size hint caps the chunk
        client.open_file("out.bin").unwrap();
        assert_eq!(client.read_file(Some(5)).unwrap(), b"hello");
        client.close_file().unwrap();
        // closeFile is idempotent
        client.close_file().unwrap();
        assert_eq!(
            remote_stat(client.open_file("missing.bin").unwrap_err()),
            ErrCode::IoError as i32
        );
        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn login_accepted() {
        let (mut client, handle) = client_pair("login");
        client.login("user", "secret").unwrap();
        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_outcome() {
        let (mut client, handle) = client_pair("shutdown");
        client.shutdown().unwrap();
        assert_eq!(handle.join().unwrap(), Outcome::Shutdown);
    }

    #[test]
    fn oversize_request_preserves_framing() {
        let (mut io, handle) = session_pair("oversize");
        let mut banner = [0u8; 32];
        io.read_exact(&mut banner).unwrap();
        assert_eq!(&banner[..4], b"Rsrv");

        // body larger than the ceiling: drained, rejected, never dispatched
        let huge = proto::MAX_REQUEST + 100;
        Header::new(Cmd::VoidEval.into(), huge as u32)
            .put(&mut io)
            .unwrap();
        io.write_all(&vec![0u8; huge]).unwrap();
        let reply = Header::get(&mut io).unwrap().unwrap();
        assert_eq!(get_stat(reply.cmd), ErrCode::InvPar as i32);
        assert_eq!(reply.cmd & 0xffffff, RESP_ERR);

        // the same connection keeps working
        let mut payload = Vec::new();
        put_param(&mut payload, Dt::String, b"1+1\n\0\0\0\0").unwrap();
        Header::new(Cmd::VoidEval.into(), payload.len() as u32)
            .put(&mut io)
            .unwrap();
        io.write_all(&payload).unwrap();
        let reply = Header::get(&mut io).unwrap().unwrap();
        assert_eq!(reply.cmd, RESP_OK);
        assert_eq!(reply.len, 0);

        drop(io);
        handle.join().unwrap();
    }

    #[test]
    fn zero_length_request_dispatches() {
        let (mut io, handle) = session_pair("zerolen");
        let mut banner = [0u8; 32];
        io.read_exact(&mut banner).unwrap();

        // closeFile takes no parameters at all
        Header::new(Cmd::CloseFile.into(), 0).put(&mut io).unwrap();
        let reply = Header::get(&mut io).unwrap().unwrap();
        assert_eq!(reply.cmd, RESP_OK);

        drop(io);
        handle.join().unwrap();
    }

    #[test]
    fn unknown_command_rejected() {
        let (mut io, handle) = session_pair("unknown");
        let mut banner = [0u8; 32];
        io.read_exact(&mut banner).unwrap();

        Header::new(0x999, 0).put(&mut io).unwrap();
        let reply = Header::get(&mut io).unwrap().unwrap();
        assert_eq!(get_stat(reply.cmd), ErrCode::InvCmd as i32);

        drop(io);
        handle.join().unwrap();
    }

    #[test]
    fn eval_reply_is_bare_value_tree() {
        let (mut io, handle) = session_pair("barebody");
        let mut banner = [0u8; 32];
        io.read_exact(&mut banner).unwrap();

        let mut payload = Vec::new();
        put_param(&mut payload, Dt::String, b"1+1\n\0\0\0\0").unwrap();
        Header::new(Cmd::Eval.into(), payload.len() as u32)
            .put(&mut io)
            .unwrap();
        io.write_all(&payload).unwrap();

        let reply = Header::get(&mut io).unwrap().unwrap();
        assert_eq!(reply.cmd, RESP_OK);
        assert_eq!(reply.len, 12);
        // a single XT_DOUBLE node, no parameter framing around it
        let word = io.read_u32::<LE>().unwrap();
        assert_eq!(word & 0xff, 2);
        assert_eq!(word >> 8, 8);
        assert_eq!(io.read_f64::<LE>().unwrap(), 2.0);

        drop(io);
        handle.join().unwrap();
    }

    #[test]
    fn eval_without_string_param_is_invalid() {
        let (mut io, handle) = session_pair("invpar");
        let mut banner = [0u8; 32];
        io.read_exact(&mut banner).unwrap();

        let mut payload = Vec::new();
        put_param(&mut payload, Dt::Int, &[1, 0, 0, 0]).unwrap();
        Header::new(Cmd::Eval.into(), payload.len() as u32)
            .put(&mut io)
            .unwrap();
        io.write_all(&payload).unwrap();
        let reply = Header::get(&mut io).unwrap().unwrap();
        assert_eq!(get_stat(reply.cmd), ErrCode::InvPar as i32);

        drop(io);
        handle.join().unwrap();
    }
}
