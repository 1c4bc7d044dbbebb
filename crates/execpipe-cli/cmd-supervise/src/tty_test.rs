// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::io::IoSlice;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

use execpipe::WindowSize;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use nix::sys::termios::{tcgetattr, OutputFlags, Termios};
use rstest::rstest;

use super::{apply_window_sizes, receive_fd, set_onlcr, ConsoleSocket, MAX_SOCKET_DIR_LEN};

fn pty() -> OpenptyResult {
    openpty(None::<&Winsize>, None::<&Termios>).expect("failed to open a pty")
}

fn window_size(terminal: &impl AsRawFd) -> (u16, u16) {
    let mut size = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { libc::ioctl(terminal.as_raw_fd(), libc::TIOCGWINSZ, &mut size) };
    assert_eq!(rc, 0, "failed to read the window size");
    (size.ws_col, size.ws_row)
}

fn send_fd(stream: &UnixStream, fd: &impl AsRawFd) {
    let fds = [fd.as_raw_fd()];
    sendmsg::<()>(
        stream.as_raw_fd(),
        &[IoSlice::new(b"/dev/pts/0")],
        &[ControlMessage::ScmRights(&fds)],
        MsgFlags::empty(),
        None,
    )
    .expect("failed to send fd");
}

#[rstest]
fn test_socket_dir_too_long() {
    let base = std::path::PathBuf::from(format!("/tmp/{}", "d".repeat(MAX_SOCKET_DIR_LEN)));
    let err = ConsoleSocket::bind(&base).err().expect("a long base should be rejected");
    assert!(err.to_string().contains("cannot exceed"), "{err}");
}

#[rstest]
fn test_receive_master_cleans_up_socket() {
    let tmpdir = tempfile::tempdir().unwrap();
    let socket = ConsoleSocket::bind(tmpdir.path()).unwrap();
    let path = socket.path();
    assert!(path.starts_with(tmpdir.path()));
    assert!(path.exists(), "socket should be created");

    let pty = pty();
    let client_path = path.clone();
    let client = std::thread::spawn(move || {
        let stream = UnixStream::connect(client_path).unwrap();
        send_fd(&stream, &pty.master);
        pty
    });

    let master = socket.receive_master().unwrap();
    let pty = client.join().unwrap();
    assert!(master.as_raw_fd() != pty.master.as_raw_fd());
    assert!(
        !path.parent().unwrap().exists(),
        "socket dir should be removed once the terminal is received"
    );
}

#[rstest]
fn test_receive_fd_without_rights() {
    let (left, right) = UnixStream::pair().unwrap();
    std::io::Write::write_all(&mut &left, b"no fds here").unwrap();
    let err = receive_fd(&right).err().expect("no descriptor was sent");
    assert!(err.to_string().contains("No terminal descriptor"), "{err}");
}

#[rstest]
fn test_set_onlcr() {
    let pty = pty();
    set_onlcr(&pty.master).unwrap();
    let termios = tcgetattr(&pty.master).unwrap();
    assert!(termios.output_flags.contains(OutputFlags::ONLCR));
}

#[rstest]
fn test_apply_window_sizes() {
    let pty = pty();
    let events = concat!(
        "{\"columns\":80,\"rows\":24}\n",
        "not json\n",
        "{\"columns\":132,\"rows\":43}\n",
    );
    apply_window_sizes(events.as_bytes(), &pty.master);
    assert_eq!(window_size(&pty.slave), (132, 43));
}

#[rstest]
fn test_set_window_size() {
    let pty = pty();
    super::set_window_size(
        &pty.master,
        WindowSize {
            columns: 100,
            rows: 30,
        },
    )
    .unwrap();
    assert_eq!(window_size(&pty.slave), (100, 30));
}
