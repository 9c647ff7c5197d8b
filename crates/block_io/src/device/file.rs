//! [`BlockDevice`] over a regular file using positioned I/O on worker threads.

use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use super::{BlockDevice, DeviceCapabilities, DeviceIo, IoCompleter, IoOutcome, IoPriorityHint};
use crate::error::BlockError;
use crate::request::IoKind;

/// Default number of I/O worker threads.
const DEFAULT_WORKERS: usize = 2;

/// Options for [`FileDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDeviceOptions {
    /// Open without write access; the engine refuses modifications.
    pub read_only: bool,
    /// Treat the file as sparse (enables trim and allocation queries).
    pub sparse: bool,
    /// Accept multi-segment submissions.
    pub scatter_gather: bool,
    /// Worker threads performing the positioned reads and writes.
    pub workers: usize,
}

impl Default for FileDeviceOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            sparse: false,
            scatter_gather: true,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl FileDeviceOptions {
    /// Sets read-only mode.
    #[must_use]
    pub const fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets sparse mode.
    #[must_use]
    pub const fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    /// Enables or disables scatter/gather submissions.
    #[must_use]
    pub const fn scatter_gather(mut self, enabled: bool) -> Self {
        self.scatter_gather = enabled;
        self
    }

    /// Sets the worker count (at least one).
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

struct Job {
    io: DeviceIo,
    completer: IoCompleter,
}

/// File-backed device.
pub struct FileDevice {
    file: Arc<File>,
    capabilities: DeviceCapabilities,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    hint: AtomicU8,
}

impl FileDevice {
    /// Opens an existing file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or the workers cannot be spawned.
    pub fn open(path: impl AsRef<Path>, options: FileDeviceOptions) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!options.read_only)
            .open(path)?;
        Self::from_file(file, options)
    }

    /// Creates (or truncates) a file opened for reading and writing.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be created or the workers cannot be spawned.
    pub fn create(path: impl AsRef<Path>, options: FileDeviceOptions) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::from_file(file, options.read_only(false))
    }

    /// Wraps an already opened file.
    ///
    /// # Errors
    ///
    /// Fails if a worker thread cannot be spawned.
    pub fn from_file(file: File, options: FileDeviceOptions) -> io::Result<Self> {
        let file = Arc::new(file);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..options.workers.max(1))
            .map(|index| {
                let file = Arc::clone(&file);
                let jobs = receiver.clone();
                thread::Builder::new()
                    .name(format!("blockio-io-{index}"))
                    .spawn(move || run_worker(&file, &jobs))
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            file,
            capabilities: DeviceCapabilities {
                scatter_gather: options.scatter_gather,
                extent_mapped: false,
                read_only: options.read_only,
                sparse: options.sparse,
            },
            sender: Some(sender),
            workers,
            hint: AtomicU8::new(hint_to_u8(IoPriorityHint::Normal)),
        })
    }

    /// The last priority hint applied.
    #[must_use]
    pub fn priority_hint(&self) -> IoPriorityHint {
        hint_from_u8(self.hint.load(Ordering::Relaxed))
    }
}

impl std::fmt::Debug for FileDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDevice")
            .field("capabilities", &self.capabilities)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl BlockDevice for FileDevice {
    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn submit(&self, io: DeviceIo, completer: IoCompleter) {
        let Some(sender) = &self.sender else {
            completer.complete(IoOutcome::failure(BlockError::NoSuchDevice));
            return;
        };
        if let Err(rejected) = sender.send(Job { io, completer }) {
            rejected
                .into_inner()
                .completer
                .complete(IoOutcome::failure(BlockError::NoSuchDevice));
        }
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_size(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    fn trim(&self, range: Range<u64>) -> io::Result<()> {
        punch_hole(&self.file, range)
    }

    fn allocated_ranges(&self, range: Range<u64>) -> io::Result<Vec<Range<u64>>> {
        let end = range.end.min(self.size()?);
        if range.start >= end {
            return Ok(Vec::new());
        }
        data_ranges(&self.file, range.start..end)
    }

    fn set_priority_hint(&self, hint: IoPriorityHint) -> io::Result<()> {
        self.hint.store(hint_to_u8(hint), Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        // Closing the channel lets each worker drain what is queued and exit.
        self.sender.take();
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The last engine reference can be released on a worker thread.
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

fn run_worker(file: &File, jobs: &Receiver<Job>) {
    for job in jobs {
        let outcome = perform(file, &job.io);
        job.completer.complete(outcome);
    }
}

fn perform(file: &File, io: &DeviceIo) -> IoOutcome {
    let mut position = io.offset;
    let mut transferred = 0u64;
    for segment in &io.segments {
        let result = match io.kind {
            IoKind::Read => segment.with_bytes_mut(|bytes| read_full(file, bytes, position)),
            IoKind::Write => segment.with_bytes(|bytes| write_full(file, bytes, position)),
        };
        match result {
            Ok(done) => {
                transferred += done as u64;
                position += done as u64;
                if done < segment.len() {
                    break;
                }
            }
            Err(error) => {
                return IoOutcome {
                    status: Err(BlockError::from_io(&error)),
                    bytes_remaining: io.length - transferred,
                };
            }
        }
    }
    IoOutcome::partial(io.length - transferred)
}

/// Reads until `buf` is full or end of file; returns the bytes read.
fn read_full(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match read_at(file, &mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(done)
}

fn write_full(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match write_at(file, &buf[done..], offset + done as u64) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => done += n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(done)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

#[cfg(target_os = "linux")]
fn punch_hole(file: &File, range: Range<u64>) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let start = libc::off_t::try_from(range.start)
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let len = libc::off_t::try_from(range.end.saturating_sub(range.start))
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            start,
            len,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn punch_hole(_file: &File, _range: Range<u64>) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(target_os = "linux")]
fn data_ranges(file: &File, range: Range<u64>) -> io::Result<Vec<Range<u64>>> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let seek = |offset: u64, whence: libc::c_int| -> io::Result<Option<u64>> {
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        // SAFETY: the descriptor is owned by `file`; lseek does not touch memory.
        let found = unsafe { libc::lseek(fd, offset, whence) };
        if found >= 0 {
            return Ok(u64::try_from(found).ok());
        }
        let error = io::Error::last_os_error();
        if error.raw_os_error() == Some(libc::ENXIO) {
            Ok(None)
        } else {
            Err(error)
        }
    };

    let mut ranges = Vec::new();
    let mut position = range.start;
    while position < range.end {
        let Some(data) = seek(position, libc::SEEK_DATA)? else {
            break;
        };
        if data >= range.end {
            break;
        }
        let hole = seek(data, libc::SEEK_HOLE)?.unwrap_or(range.end).min(range.end);
        ranges.push(data..hole);
        position = hole;
    }
    Ok(ranges)
}

#[cfg(not(target_os = "linux"))]
fn data_ranges(_file: &File, range: Range<u64>) -> io::Result<Vec<Range<u64>>> {
    Ok(vec![range])
}

const fn hint_to_u8(hint: IoPriorityHint) -> u8 {
    match hint {
        IoPriorityHint::VeryLow => 0,
        IoPriorityHint::Low => 1,
        IoPriorityHint::Normal => 2,
    }
}

const fn hint_from_u8(raw: u8) -> IoPriorityHint {
    match raw {
        0 => IoPriorityHint::VeryLow,
        1 => IoPriorityHint::Low,
        _ => IoPriorityHint::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferSegment, IoBuffer};
    use crate::device::CompletionSink;
    use crate::request::Priority;
    use crossbeam_channel::Sender as OutcomeSender;
    use std::io::Write;
    use std::sync::Weak;
    use std::time::Duration;

    struct ChannelSink(OutcomeSender<IoOutcome>);

    impl CompletionSink for ChannelSink {
        fn deliver(&self, _token: usize, outcome: IoOutcome) {
            let _ = self.0.send(outcome);
        }
    }

    fn run(device: &FileDevice, io: DeviceIo) -> IoOutcome {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let sink: Arc<dyn CompletionSink> = Arc::new(ChannelSink(tx));
        let weak: Weak<dyn CompletionSink> = Arc::downgrade(&sink);
        device.submit(io, IoCompleter::new(0, weak));
        rx.recv_timeout(Duration::from_secs(5)).expect("completion")
    }

    fn io(kind: IoKind, offset: u64, segments: Vec<BufferSegment>) -> DeviceIo {
        let length = segments.iter().map(|s| s.len() as u64).sum();
        DeviceIo {
            kind,
            offset,
            length,
            segments,
            priority: Priority::Foreground,
            hint: IoPriorityHint::Normal,
        }
    }

    #[test]
    fn gathered_write_then_scattered_read() {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::create(dir.path().join("data.bin"), FileDeviceOptions::default())
            .unwrap();

        let a = IoBuffer::from_slice(&[1u8; 512], 512);
        let b = IoBuffer::from_slice(&[2u8; 512], 512);
        let outcome = run(
            &device,
            io(
                IoKind::Write,
                1024,
                vec![BufferSegment::whole(a), BufferSegment::whole(b)],
            ),
        );
        assert_eq!(outcome, IoOutcome::success());
        assert_eq!(device.size().unwrap(), 2048);

        let out = IoBuffer::zeroed(1024, 512);
        let outcome = run(
            &device,
            io(IoKind::Read, 1024, vec![BufferSegment::whole(Arc::clone(&out))]),
        );
        assert_eq!(outcome, IoOutcome::success());
        let bytes = out.to_vec();
        assert!(bytes[..512].iter().all(|&x| x == 1));
        assert!(bytes[512..].iter().all(|&x| x == 2));
    }

    #[test]
    fn read_past_end_reports_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[9u8; 512])
            .unwrap();
        let device = FileDevice::open(&path, FileDeviceOptions::default()).unwrap();

        let out = IoBuffer::zeroed(1024, 512);
        let outcome = run(&device, io(IoKind::Read, 0, vec![BufferSegment::whole(out)]));
        assert_eq!(outcome, IoOutcome::partial(512));
    }

    #[test]
    fn read_only_file_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.bin");
        std::fs::write(&path, [0u8; 512]).unwrap();
        let device =
            FileDevice::open(&path, FileDeviceOptions::default().read_only(true)).unwrap();
        assert!(device.capabilities().read_only);

        let data = IoBuffer::from_slice(&[1u8; 512], 512);
        let outcome = run(&device, io(IoKind::Write, 0, vec![BufferSegment::whole(data)]));
        assert!(matches!(outcome.status, Err(BlockError::Device { .. })));
        assert_eq!(outcome.bytes_remaining, 512);
    }

    #[test]
    fn size_flush_and_hint() {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::create(dir.path().join("f.bin"), FileDeviceOptions::default())
            .unwrap();
        device.set_size(8192).unwrap();
        assert_eq!(device.size().unwrap(), 8192);
        device.flush().unwrap();
        device.set_priority_hint(IoPriorityHint::Low).unwrap();
        assert_eq!(device.priority_hint(), IoPriorityHint::Low);
    }

    #[test]
    fn allocated_ranges_are_clipped_to_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::create(
            dir.path().join("sparse.bin"),
            FileDeviceOptions::default().sparse(true),
        )
        .unwrap();
        let data = IoBuffer::from_slice(&[5u8; 4096], 4096);
        assert_eq!(
            run(&device, io(IoKind::Write, 0, vec![BufferSegment::whole(data)])),
            IoOutcome::success()
        );

        let ranges = device.allocated_ranges(0..1 << 20).unwrap();
        assert!(!ranges.is_empty());
        assert_eq!(ranges[0].start, 0);
        assert!(ranges.iter().all(|r| r.end <= 4096));
        assert!(device.allocated_ranges(4096..8192).unwrap().is_empty());
    }
}
