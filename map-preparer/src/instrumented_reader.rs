use std::io::{self, Read};

/// Default progress interval: 256 MiB
pub const DEFAULT_FREQUENCY: u64 = 256 * 1024 * 1024;

/// A reader wrapper that invokes a callback every time another `frequency`
/// bytes have been read from the underlying stream. Used to report progress
/// while streaming multi-gigabyte raster grids.
///
/// If a single read crosses several multiples of `frequency`, the callback is
/// invoked once per crossed multiple.
#[derive(Debug)]
pub struct InstrumentedReader<R, F>
where
    R: Read,
    F: FnMut(u64),
{
    inner: R,
    callback: F,
    frequency: u64,
    total_read: u64,
    next_threshold: u64,
}

impl<R, F> InstrumentedReader<R, F>
where
    R: Read,
    F: FnMut(u64),
{
    pub fn new(inner: R, callback: F) -> Self {
        Self::with_frequency(inner, DEFAULT_FREQUENCY, callback)
    }

    /// A `frequency` of 0 selects the default.
    pub fn with_frequency(inner: R, frequency: u64, callback: F) -> Self {
        let frequency = if frequency == 0 { DEFAULT_FREQUENCY } else { frequency };
        Self {
            inner,
            callback,
            frequency,
            total_read: 0,
            next_threshold: frequency,
        }
    }

    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    fn fire_callbacks(&mut self) {
        while self.total_read >= self.next_threshold {
            (self.callback)(self.total_read);
            match self.next_threshold.checked_add(self.frequency) {
                Some(next) => self.next_threshold = next,
                None => break,
            }
        }
    }
}

impl<R, F> Read for InstrumentedReader<R, F>
where
    R: Read,
    F: FnMut(u64),
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.total_read = self.total_read.saturating_add(n as u64);
            self.fire_callbacks();
        }
        Ok(n)
    }
}
