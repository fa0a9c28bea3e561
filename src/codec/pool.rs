//! Buffer pooling for the framed codec (spec §4.1) and the binary
//! side-channel (spec §4.5).
//!
//! The teacher's `allocator` module pools fixed-size buffers behind an
//! intrusive linked list of raw, heap-allocated, unsized nodes so a
//! multi-buffer allocation can be represented without extra copies. That
//! is more machinery than this project needs: every pooled buffer here is
//! used for exactly one frame or one chunk and handed back whole, so a
//! plain `mpsc` channel of `Vec<u8>` — recycled through a guard's `Drop`
//! impl — gets the same "steady-state allocations are bounded" property
//! (spec §5 "Back-pressure") without `unsafe`.

use tokio::sync::mpsc;

/// A pool of fixed-capacity buffers. Messages larger than the pool's
/// buffer size bypass the pool entirely (spec §4.1: "messages ≤ 4 KiB
/// ... larger messages allocate").
#[derive(Clone)]
pub struct BufferPool {
    buffer_size: usize,
    sender: mpsc::Sender<Vec<u8>>,
    receiver: std::sync::Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        for _ in 0..capacity {
            let _ = sender.try_send(vec![0u8; buffer_size]);
        }
        Self {
            buffer_size,
            sender,
            receiver: std::sync::Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Obtain a buffer of at least `buffer_size` bytes, pulling from the
    /// pool when one is free and allocating fresh otherwise (the pool
    /// never blocks the caller).
    pub async fn acquire(&self) -> PooledBuffer {
        let mut buf = {
            let mut rx = self.receiver.lock().await;
            match rx.try_recv() {
                Ok(buf) => buf,
                Err(_) => vec![0u8; self.buffer_size],
            }
        };
        buf.clear();
        buf.resize(self.buffer_size, 0);
        PooledBuffer { buf: Some(buf), sender: self.sender.clone() }
    }
}

/// A buffer on loan from a [`BufferPool`]. Returned to the pool on drop;
/// if the pool is full the buffer is simply dropped.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    sender: mpsc::Sender<Vec<u8>>,
}

impl PooledBuffer {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("buffer taken")
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_ref().expect("buffer taken")
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        self.buf.take().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let _ = self.sender.try_send(buf);
        }
    }
}
