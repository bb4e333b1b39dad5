//! # Disk Writer Queue
//!
//! Single background consumer of dirty log pages. Commit threads enqueue
//! readable buffers (each carrying one share owned by the queue) and the
//! worker writes them at their assigned positions, releasing the share
//! afterwards. Whenever the worker drains the queue it issues the
//! durability barrier and wakes every [`DiskWriterQueue::wait`]er.
//!
//! ## Failure policy
//!
//! The first I/O error latches: the worker stops writing, every queued and
//! future page is released unwritten, and `enqueue`/`wait` raise
//! `DiskWriterFailed` until the engine is reopened. Mutating entry points
//! sample the latch before starting work.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use super::buffer::PageBuffer;
use super::stream::Stream;
use crate::{Error, Result};

struct QueueState {
    pending: usize,
    flushed: bool,
    failure: Option<String>,
}

struct Shared {
    state: Mutex<QueueState>,
    drained: Condvar,
}

pub struct DiskWriterQueue {
    sender: Option<Sender<Arc<PageBuffer>>>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DiskWriterQueue {
    /// Spawns the worker over the pool's single writer stream.
    pub fn new(stream: Arc<parking_lot::Mutex<Box<dyn Stream>>>) -> Self {
        let (sender, receiver) = unbounded::<Arc<PageBuffer>>();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: 0,
                flushed: true,
                failure: None,
            }),
            drained: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("disk-writer".into())
            .spawn(move || run_worker(receiver, stream, worker_shared))
            .expect("spawn disk writer thread");

        Self {
            sender: Some(sender),
            shared,
            worker: Some(worker),
        }
    }

    /// Hands a readable buffer (with one share owned by the queue) to the
    /// worker. The buffer must already carry its final log position.
    pub fn enqueue(&self, buffer: Arc<PageBuffer>) -> Result<()> {
        debug_assert!(buffer.share_counter() > 0, "enqueue of unshared buffer");

        {
            let mut state = self.shared.state.lock();
            if let Some(message) = &state.failure {
                buffer.release_share();
                return Err(Error::DiskWriterFailed(message.clone()));
            }
            state.pending += 1;
            state.flushed = false;
        }

        self.sender
            .as_ref()
            .expect("queue alive")
            .send(buffer)
            .expect("worker alive while queue alive");
        Ok(())
    }

    /// Blocks until the worker has observed an empty queue and flushed.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        while state.failure.is_none() && !(state.pending == 0 && state.flushed) {
            self.shared.drained.wait(&mut state);
        }
        match &state.failure {
            Some(message) => Err(Error::DiskWriterFailed(message.clone())),
            None => Ok(()),
        }
    }

    /// Re-raises a latched failure, if any.
    pub fn check(&self) -> Result<()> {
        let state = self.shared.state.lock();
        match &state.failure {
            Some(message) => Err(Error::DiskWriterFailed(message.clone())),
            None => Ok(()),
        }
    }

    /// Stops the worker after draining. Called on engine close.
    pub fn shutdown(&mut self) {
        let _ = self.wait();
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for DiskWriterQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    receiver: Receiver<Arc<PageBuffer>>,
    stream: Arc<parking_lot::Mutex<Box<dyn Stream>>>,
    shared: Arc<Shared>,
) {
    while let Ok(buffer) = receiver.recv() {
        let already_failed = shared.state.lock().failure.is_some();

        let result = if already_failed {
            Ok(())
        } else {
            let position = buffer.position();
            let mut stream = stream.lock();
            stream.write_all_at(position, buffer.bytes().as_slice())
        };

        buffer.release_share();

        if let Err(error) = result {
            let mut state = shared.state.lock();
            if state.failure.is_none() {
                state.failure = Some(error.to_string());
            }
            state.pending -= 1;
            shared.drained.notify_all();
            continue;
        }

        let drained = {
            let mut state = shared.state.lock();
            state.pending -= 1;
            state.pending == 0 && receiver.is_empty()
        };

        if drained {
            let flush_result = {
                let mut stream = stream.lock();
                stream.flush_to_disk()
            };

            let mut state = shared.state.lock();
            match flush_result {
                Ok(()) => {
                    if state.pending == 0 {
                        state.flushed = true;
                    }
                }
                Err(error) => {
                    if state.failure.is_none() {
                        state.failure = Some(error.to_string());
                    }
                }
            }
            shared.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::stream::{MemoryStreamFactory, StreamFactory};
    use crate::config::PAGE_SIZE;
    use parking_lot::Mutex as PlMutex;

    fn readable_buffer(position: u64, byte: u8) -> Arc<PageBuffer> {
        let buffer = Arc::new(PageBuffer::new());
        buffer.mark_writable();
        buffer.write_bytes().fill(byte);
        buffer.set_position(position);
        buffer.publish_readable();
        buffer
    }

    #[test]
    fn worker_writes_and_releases() {
        let factory = MemoryStreamFactory::new();
        let stream = Arc::new(PlMutex::new(factory.open_write().unwrap()));
        let queue = DiskWriterQueue::new(Arc::clone(&stream));

        let buffer = readable_buffer(PAGE_SIZE as u64, 0xCD);
        queue.enqueue(Arc::clone(&buffer)).unwrap();
        queue.wait().unwrap();

        assert_eq!(buffer.share_counter(), 0);
        let mut check = vec![0u8; PAGE_SIZE];
        factory
            .open_read()
            .unwrap()
            .read_exact_at(PAGE_SIZE as u64, &mut check)
            .unwrap();
        assert!(check.iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn wait_on_idle_queue_returns_immediately() {
        let factory = MemoryStreamFactory::new();
        let stream = Arc::new(PlMutex::new(factory.open_write().unwrap()));
        let queue = DiskWriterQueue::new(stream);
        queue.wait().unwrap();
    }

    #[test]
    fn many_pages_drain_in_order() {
        let factory = MemoryStreamFactory::new();
        let stream = Arc::new(PlMutex::new(factory.open_write().unwrap()));
        let queue = DiskWriterQueue::new(stream);

        for i in 0..20u64 {
            let buffer = readable_buffer(i * PAGE_SIZE as u64, i as u8);
            queue.enqueue(buffer).unwrap();
        }
        queue.wait().unwrap();

        let mut reader = factory.open_read().unwrap();
        for i in 0..20u64 {
            let mut check = vec![0u8; PAGE_SIZE];
            reader.read_exact_at(i * PAGE_SIZE as u64, &mut check).unwrap();
            assert!(check.iter().all(|&b| b == i as u8), "page {i} content");
        }
    }

    struct FailingStream;

    impl Stream for FailingStream {
        fn read_exact_at(&mut self, _: u64, _: &mut [u8]) -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "nope").into())
        }
        fn write_all_at(&mut self, _: u64, _: &[u8]) -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into())
        }
        fn length(&self) -> Result<u64> {
            Ok(0)
        }
        fn set_length(&mut self, _: u64) -> Result<()> {
            Ok(())
        }
        fn flush_to_disk(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn io_error_latches_until_restart() {
        let stream: Arc<PlMutex<Box<dyn Stream>>> = Arc::new(PlMutex::new(Box::new(FailingStream)));
        let queue = DiskWriterQueue::new(stream);

        let buffer = readable_buffer(0, 1);
        queue.enqueue(Arc::clone(&buffer)).unwrap();

        assert!(matches!(queue.wait(), Err(Error::DiskWriterFailed(_))));
        assert_eq!(buffer.share_counter(), 0, "failed page is still released");

        // every later operation re-raises the latched failure
        assert!(matches!(queue.check(), Err(Error::DiskWriterFailed(_))));
        let another = readable_buffer(PAGE_SIZE as u64, 2);
        assert!(matches!(
            queue.enqueue(Arc::clone(&another)),
            Err(Error::DiskWriterFailed(_))
        ));
        assert_eq!(another.share_counter(), 0);
    }
}
