use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{lock, not_connected, Stream};
use crate::{Error, Result};

#[derive(Debug)]
enum Scripted {
    Data(Vec<u8>),
    Timeout,
}

#[derive(Debug, Default)]
struct State {
    reads: VecDeque<Scripted>,
    written: Vec<Vec<u8>>,
    connected: bool,
    connects: usize,
}

/// In-memory stream that returns scripted reads and records writes.
///
/// Clones share state, so a test can keep one handle while an interface owns another.
/// Reads return end of stream once the script is exhausted.
///
/// ```
/// use cmdtlm::stream::{MemoryStream, Stream};
///
/// let stream = MemoryStream::new();
/// stream.push_read(vec![1, 2]);
/// stream.connect().unwrap();
/// assert_eq!(stream.read().unwrap(), Some(vec![1, 2]));
/// assert_eq!(stream.read().unwrap(), None);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    state: Arc<Mutex<State>>,
}

impl MemoryStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    pub fn push_read(&self, data: impl Into<Vec<u8>>) {
        self.state().reads.push_back(Scripted::Data(data.into()));
    }

    /// Script a read that fails with [Error::Timeout].
    pub fn push_timeout(&self) {
        self.state().reads.push_back(Scripted::Timeout);
    }

    /// Everything written so far, one entry per write.
    #[must_use]
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    /// Number of successful connects.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.state().connects
    }
}

impl Stream for MemoryStream {
    fn connect(&self) -> Result<()> {
        let mut state = self.state();
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    fn connected(&self) -> bool {
        self.state().connected
    }

    fn read(&self) -> Result<Option<Vec<u8>>> {
        let mut state = self.state();
        if !state.connected {
            return Err(not_connected("memory stream"));
        }
        match state.reads.pop_front() {
            Some(Scripted::Data(data)) => Ok(Some(data)),
            Some(Scripted::Timeout) => Err(Error::Timeout),
            None => Ok(None),
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        if !state.connected {
            return Err(not_connected("memory stream"));
        }
        state.written.push(data.to_vec());
        Ok(())
    }

    fn disconnect(&self) {
        self.state().connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_reads() {
        let stream = MemoryStream::new();
        stream.push_read([1]);
        stream.push_timeout();
        stream.push_read([2]);
        assert!(stream.read().is_err());

        stream.connect().unwrap();
        assert_eq!(stream.read().unwrap(), Some(vec![1]));
        assert!(matches!(stream.read(), Err(Error::Timeout)));
        assert_eq!(stream.read().unwrap(), Some(vec![2]));
        assert_eq!(stream.read().unwrap(), None);
    }

    #[test]
    fn clones_share_writes() {
        let stream = MemoryStream::new();
        let handle = stream.clone();
        stream.connect().unwrap();
        stream.write(&[1, 2]).unwrap();
        stream.write(&[3]).unwrap();
        assert_eq!(handle.written(), vec![vec![1, 2], vec![3]]);
        assert_eq!(handle.connects(), 1);

        stream.disconnect();
        assert!(!handle.connected());
        assert!(stream.write(&[4]).is_err());
    }
}
