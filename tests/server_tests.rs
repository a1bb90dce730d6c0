//! Integration tests for the client and server binaries.

use std::env;
use std::io::prelude::*;
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{self, Child, Command, Output};
use std::thread::sleep;
use std::time::Duration;

use color_eyre::Result;
use serial_test::serial;

use rsrv::client::{Client, RemoteError};
use rsrv::proto::ErrCode;
use rsrv::sexp::{Kind, Sexp};

fn exe_path(name: &str) -> PathBuf {
    let bin_dir = env::current_exe()
        .unwrap()
        .parent()
        .expect("test executable's directory")
        .parent()
        .expect("output directory")
        .to_path_buf();
    bin_dir.join(name)
}

fn cmd_stdout(out: Output) -> String {
    String::from_utf8(out.stdout).expect("non utf-8 output")
}

fn test_workdir(tag: &str) -> PathBuf {
    env::temp_dir().join(format!("rsrv-it-{tag}-{}", process::id()))
}

fn start_server(port: u16, tag: &str, extra: &[&str]) -> Child {
    let workdir = test_workdir(tag);
    let server = Command::new(exe_path("server"))
        .args(["--port", &port.to_string()])
        .args(["--workdir", workdir.to_str().unwrap()])
        .args(extra)
        .spawn()
        .expect("failed to start server");
    // wait for the listener to come up
    sleep(Duration::from_millis(200));
    server
}

fn stop_server(mut server: Child) {
    server.kill().expect("could not kill server process");
    server.wait().expect("waiting for server");
}

fn connect(port: u16) -> Client<TcpStream> {
    let mut last = None;
    for _ in 0..20 {
        match Client::connect("127.0.0.1", port) {
            Ok(client) => return client,
            Err(err) => last = Some(err),
        }
        sleep(Duration::from_millis(50));
    }
    panic!("could not connect to test server: {:?}", last);
}

fn remote_stat(err: color_eyre::Report) -> i32 {
    err.downcast_ref::<RemoteError>().expect("remote error").stat
}

#[test]
fn test_server_help_flag() {
    let out = Command::new(exe_path("server"))
        .arg("--help")
        .output()
        .expect("failed to run server --help");
    let stdout = cmd_stdout(out);
    assert!(stdout.contains("server"));
}

#[test]
fn test_client_help_flag() {
    let out = Command::new(exe_path("client"))
        .args(["--help"])
        .output()
        .expect("failed to run client --help");
    let stdout = cmd_stdout(out);
    assert!(stdout.contains("client"));
}

#[test]
#[serial]
fn test_banner_bytes() -> Result<()> {
    let server = start_server(16311, "banner", &[]);

    let mut stream = TcpStream::connect(("127.0.0.1", 16311))?;
    let mut banner = [0u8; 32];
    stream.read_exact(&mut banner)?;
    assert_eq!(&banner[..12], b"Rsrv0100QAP1");

    stop_server(server);
    Ok(())
}

#[test]
#[serial]
fn test_eval_over_tcp() -> Result<()> {
    let server = start_server(16312, "eval", &[]);
    let mut client = connect(16312);

    client.void_eval("x <- 20")?;
    assert_eq!(client.eval("x * 2 + 2")?, Sexp::double(42.0));
    // a length-1 character vector comes back as a bare string scalar
    assert_eq!(client.eval("\"hi\"")?, Sexp::new(Kind::Char("hi".into())));
    assert_eq!(client.eval("1:3")?, Sexp::ints(vec![1, 2, 3]));
    assert_eq!(remote_stat(client.eval("y").unwrap_err()), 0x7f);
    assert_eq!(
        remote_stat(client.read_file(None).unwrap_err()),
        ErrCode::NotOpen as i32
    );

    stop_server(server);
    Ok(())
}

#[test]
#[serial]
fn test_connections_are_isolated() -> Result<()> {
    let server = start_server(16313, "isolated", &[]);

    let mut first = connect(16313);
    first.void_eval("x <- 1")?;
    assert_eq!(first.eval("x")?, Sexp::double(1.0));

    // a second connection gets its own copy of the global environment
    let mut second = connect(16313);
    assert!(second.eval("x").is_err());

    stop_server(server);
    Ok(())
}

#[test]
#[serial]
fn test_engine_init_arguments() -> Result<()> {
    let server = start_server(16314, "init", &["--", "preset <- 7"]);
    let mut client = connect(16314);

    assert_eq!(client.eval("preset")?, Sexp::double(7.0));

    stop_server(server);
    Ok(())
}

#[test]
#[serial]
fn test_file_commands_over_tcp() -> Result<()> {
    let server = start_server(16315, "files", &[]);
    let mut client = connect(16315);

    client.create_file("data.txt")?;
    client.write_file(b"stored by the server")?;
    client.close_file()?;
    client.open_file("data.txt")?;
    assert_eq!(client.read_file(None)?, b"stored by the server");
    assert_eq!(client.read_file(None)?, b"");
    client.close_file()?;

    stop_server(server);
    Ok(())
}

#[test]
#[serial]
fn test_shutdown_command() -> Result<()> {
    let mut server = start_server(16316, "shutdown", &[]);

    let client = connect(16316);
    client.shutdown()?;

    // the supervisor should exit on its own
    let mut exited = false;
    for _ in 0..50 {
        if server.try_wait()?.is_some() {
            exited = true;
            break;
        }
        sleep(Duration::from_millis(100));
    }
    assert!(exited, "server did not exit after shutdown");
    assert!(Client::connect("127.0.0.1", 16316).is_err());
    Ok(())
}

#[test]
#[serial]
fn test_client_binary_evaluates() -> Result<()> {
    let server = start_server(16317, "clientbin", &[]);
    // give the listener a moment, then drive it with the client binary
    sleep(Duration::from_millis(100));

    let out = Command::new(exe_path("client"))
        .args(["--port", "16317", "1+1"])
        .output()
        .expect("failed to run client");
    assert!(out.status.success());
    assert!(cmd_stdout(out).contains("2.0"));

    stop_server(server);
    Ok(())
}
