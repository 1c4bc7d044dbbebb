// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::time::{Duration, Instant};

use rstest::{fixture, rstest};

use super::{read_pid_file, PidFileError, PidFileReader, PidGetter};
use crate::fixtures::*;
use crate::Error;

#[fixture]
fn reader() -> PidFileReader {
    PidFileReader {
        timeout: Duration::from_millis(60),
        interval: Duration::from_millis(20),
    }
}

#[rstest]
#[tokio::test]
async fn test_pid_reads_pid_file(tmpdir: tempfile::TempDir, reader: PidFileReader) {
    let path = tmpdir.path().join("pidfile");
    std::fs::write(&path, "5621").unwrap();

    assert_eq!(reader.pid(&path).await.unwrap(), 5621);
}

#[rstest]
#[tokio::test]
async fn test_pid_tolerates_trailing_newline(tmpdir: tempfile::TempDir, reader: PidFileReader) {
    let path = tmpdir.path().join("pidfile");
    std::fs::write(&path, "5621\n").unwrap();

    assert_eq!(reader.pid(&path).await.unwrap(), 5621);
}

#[rstest]
#[case::missing(None)]
#[case::empty(Some(""))]
#[tokio::test]
async fn test_pid_waits_for_pid_file(
    tmpdir: tempfile::TempDir,
    #[case] initial: Option<&str>,
) {
    let path = tmpdir.path().join("pidfile");
    if let Some(content) = initial {
        std::fs::write(&path, content).unwrap();
    }
    let reader = PidFileReader {
        timeout: Duration::from_secs(5),
        interval: Duration::from_millis(20),
    };

    let writer = {
        let path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(&path, "5621").unwrap();
        })
    };

    assert_eq!(reader.pid(&path).await.unwrap(), 5621);
    writer.await.unwrap();
}

#[rstest]
#[case::missing(None)]
#[case::empty(Some(""))]
#[tokio::test]
async fn test_pid_times_out(
    tmpdir: tempfile::TempDir,
    reader: PidFileReader,
    #[case] initial: Option<&str>,
) {
    let path = tmpdir.path().join("pidfile");
    if let Some(content) = initial {
        std::fs::write(&path, content).unwrap();
    }

    let err = reader.pid(&path).await.expect_err("should time out");
    assert!(matches!(err, Error::PidResolutionFailed { .. }));
    assert!(err.to_string().contains("timeout"), "{err}");
}

#[rstest]
#[case::not_a_number("notanint")]
#[case::zero("0")]
#[case::negative("-1")]
#[tokio::test]
async fn test_pid_invalid_content_fails_immediately(
    tmpdir: tempfile::TempDir,
    #[case] content: &str,
) {
    let path = tmpdir.path().join("pidfile");
    std::fs::write(&path, content).unwrap();
    let reader = PidFileReader {
        timeout: Duration::from_secs(10),
        interval: Duration::from_millis(100),
    };

    let start = Instant::now();
    let err = reader.pid(&path).await.expect_err("should fail to parse");
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(matches!(err, Error::PidResolutionFailed { .. }), "{err}");
    assert!(
        err.to_string().contains("parsing pid file contents"),
        "{err}"
    );
}

#[rstest]
fn test_read_pid_file_once(tmpdir: tempfile::TempDir) {
    let path = tmpdir.path().join("pidfile");
    assert!(matches!(read_pid_file(&path), Err(PidFileError::Missing)));
    std::fs::write(&path, "-1").unwrap();
    assert!(matches!(read_pid_file(&path), Err(PidFileError::Invalid(_))));

    std::fs::write(&path, "").unwrap();
    assert!(matches!(read_pid_file(&path), Err(PidFileError::Empty)));

    std::fs::write(&path, "42").unwrap();
    assert_eq!(read_pid_file(&path).unwrap(), 42);
}
