// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use rstest::fixture;
use tokio::io::AsyncWrite;

pub fn init_logging() {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .without_time()
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(sub);
}

#[fixture]
pub fn tmpdir() -> tempfile::TempDir {
    init_logging();
    tempfile::Builder::new()
        .prefix("execpipe-test-")
        .tempdir()
        .expect("failed to create dir for test")
}

/// The effective user and group of the test process
pub fn current_ids() -> (u32, u32) {
    (
        nix::unistd::geteuid().as_raw(),
        nix::unistd::getegid().as_raw(),
    )
}

/// An in-memory destination that can be inspected after being written to
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A destination that rejects every write
pub struct FailingWriter;

impl AsyncWrite for FailingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Generates a bash script that speaks the supervisor protocol
/// without starting any container runtime.
#[derive(Clone, Debug)]
pub struct FakeSupervisor {
    /// Exit before opening any of the named pipes
    pub crash_before_handshake: bool,
    /// The runtime exit status reported on fd 3
    pub status: u8,
    /// Lines written to the runtime log on fd 4
    pub runtime_log: Vec<String>,
    /// Read one line from stdin and echo it to stdout before continuing
    pub echo_stdin_line: bool,
    /// Stay alive until stdin is closed, after producing output
    pub hold_until_stdin_closes: bool,
    pub stdout: String,
    pub stderr: String,
    /// Written to the exitcode file, or no file when unset
    pub exit_code: Option<String>,
}

impl Default for FakeSupervisor {
    fn default() -> Self {
        Self {
            crash_before_handshake: false,
            status: 0,
            runtime_log: Vec::new(),
            echo_stdin_line: false,
            hold_until_stdin_closes: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some("0".to_string()),
        }
    }
}

impl FakeSupervisor {
    pub fn script(&self) -> String {
        let mut script = String::from(
            r#"#!/bin/bash
while [[ "$1" == --* ]]; do
    case "$1" in
        --tty) shift ;;
        *) shift 2 ;;
    esac
done
mode="$1"
dir="$3"
target="$4"
echo "supervising $mode of $target in $dir"
"#,
        );
        if self.crash_before_handshake {
            script.push_str("echo 'crashing' >&2\nexit 1\n");
            return script;
        }
        script.push_str(
            r#"exec 6<"$dir/stdin" 7>"$dir/stdout" 8>"$dir/stderr" 9<>"$dir/exit"
printf '\000' >&5
exec 5>&-
exec 10<"$dir/stdout" 11<"$dir/stderr"
cat >/dev/null
"#,
        );
        for line in self.runtime_log.iter() {
            script.push_str(&format!("printf '%s\\n' {} >&4\n", quote(line)));
        }
        script.push_str("exec 4>&-\n");
        script.push_str(&format!("printf '\\{:03o}' >&3\nexec 3>&-\n", self.status));
        if self.status != 0 {
            script.push_str("exit 3\n");
            return script;
        }
        script.push_str("echo $$ > \"$dir/pidfile\"\n");
        if self.echo_stdin_line {
            script.push_str("IFS= read -r line <&6\nprintf '%s\\n' \"$line\" >&7\n");
        }
        script.push_str(&format!("printf '%s' {} >&7\n", quote(&self.stdout)));
        script.push_str(&format!("printf '%s' {} >&8\n", quote(&self.stderr)));
        if self.hold_until_stdin_closes {
            script.push_str("while IFS= read -r line <&6; do :; done\n");
        }
        script.push_str("exec 7>&- 8>&-\n");
        if let Some(code) = &self.exit_code {
            script.push_str(&format!("printf '%s' {} > \"$dir/exitcode\"\n", quote(code)));
        }
        script.push_str("exit 0\n");
        script
    }

    /// Write the script into the given directory, returning its path
    pub fn install(&self, dir: &Path) -> PathBuf {
        let path = dir.join("fake-supervisor");
        std::fs::write(&path, self.script()).expect("failed to write fake supervisor");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to make fake supervisor executable");
        path
    }
}
