// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

#[cfg(test)]
#[path = "./fan_out_test.rs"]
mod fan_out_test;

const CHUNK_SIZE: usize = 8 * 1024;

/// A destination that receives a copy of a process output stream
pub type Destination = Box<dyn AsyncWrite + Send + Unpin>;

/// Duplicates everything written to it into every attached destination.
///
/// Destinations can be added at any time, and only see the
/// data that is written after they were attached.
#[derive(Default)]
pub struct FanOutWriter {
    destinations: Mutex<Vec<Destination>>,
}

impl std::fmt::Debug for FanOutWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutWriter").finish_non_exhaustive()
    }
}

impl FanOutWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination, returning the number of destinations
    /// now attached, including this one.
    pub async fn attach(&self, destination: Destination) -> usize {
        let mut destinations = self.destinations.lock().await;
        destinations.push(destination);
        destinations.len()
    }

    /// The number of currently attached destinations
    pub async fn count(&self) -> usize {
        self.destinations.lock().await.len()
    }

    /// Write the given bytes to every destination.
    ///
    /// A destination that fails does not affect the others.
    pub async fn write(&self, buf: &[u8]) {
        let mut destinations = self.destinations.lock().await;
        for (index, destination) in destinations.iter_mut().enumerate() {
            let res = match destination.write_all(buf).await {
                Ok(()) => destination.flush().await,
                Err(err) => Err(err),
            };
            if let Err(err) = res {
                tracing::debug!(index, ?err, "failed to write to output destination");
            }
        }
    }

    /// Copy everything from the given source into all destinations
    /// until it reaches EOF, returning the number of bytes copied.
    ///
    /// Destinations are left open when the source is exhausted.
    pub async fn pump<R>(&self, mut source: R) -> std::io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0; CHUNK_SIZE];
        let mut total = 0;
        loop {
            let count = source.read(&mut buf).await?;
            if count == 0 {
                break;
            }
            self.write(&buf[..count]).await;
            total += count as u64;
        }
        Ok(total)
    }
}
