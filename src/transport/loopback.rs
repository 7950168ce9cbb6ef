//! In-memory transport.
use std::collections::VecDeque;

use anyhow::Result;

use super::Transport;

/// Bytes pushed with [`Loopback::feed`] are what `read` returns; whatever is
/// written is collected for [`Loopback::take_output`].
#[derive(Debug, Default)]
pub struct Loopback {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }
}

impl Transport for Loopback {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.rx.len());
        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.tx.extend_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_full_stops_when_dry() {
        let mut pipe = Loopback::new();
        pipe.feed(&[1, 2, 3]);
        let mut buf = [0u8; 5];
        assert_eq!(pipe.read_full(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(pipe.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn output_is_collected() {
        let mut pipe = Loopback::new();
        pipe.write(&[0xcd, 0]).unwrap();
        pipe.write(&[0xab]).unwrap();
        assert_eq!(pipe.take_output(), vec![0xcd, 0, 0xab]);
        assert!(pipe.take_output().is_empty());
    }
}
