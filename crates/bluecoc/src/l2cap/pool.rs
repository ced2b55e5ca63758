//! A fixed-capacity block pool backing a channel's SDU buffers.
//!
//! All blocks are allocated when the pool is created. An [`SduBuffer`] is a
//! chain of blocks drawn from the pool; dropping it hands the blocks back, so
//! a buffer given to the host is released whenever the host is done with it.

use std::fmt;
use std::sync::{Arc, Mutex};

use super::types::{CocConfig, L2capError, L2capResult};

struct PoolInner {
    block_size: usize,
    capacity: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl PoolInner {
    fn alloc(&self) -> Option<Box<[u8]>> {
        self.free.lock().unwrap().pop()
    }

    fn release(&self, blocks: impl IntoIterator<Item = Box<[u8]>>) {
        let mut free = self.free.lock().unwrap();
        free.extend(blocks);
        debug_assert!(free.len() <= self.capacity);
    }
}

/// A pool of equally sized blocks
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool sized for a channel with the given MTU
    pub fn for_mtu(mtu: u16, config: &CocConfig) -> L2capResult<Self> {
        config.validate()?;
        let count = config
            .pool_blocks(mtu)
            .ok_or(L2capError::ResourceLimitReached)?;
        Self::with_blocks(count, config.block_size)
    }

    /// Create a pool of `count` blocks of `block_size` bytes
    ///
    /// Fails with `ResourceLimitReached` if the memory cannot be reserved.
    pub fn with_blocks(count: usize, block_size: usize) -> L2capResult<Self> {
        if block_size == 0 {
            return Err(L2capError::InvalidParameter("Block size must be non-zero".into()));
        }

        let mut free = Vec::new();
        free.try_reserve_exact(count)
            .map_err(|_| L2capError::ResourceLimitReached)?;
        for _ in 0..count {
            let mut block = Vec::new();
            block
                .try_reserve_exact(block_size)
                .map_err(|_| L2capError::ResourceLimitReached)?;
            block.resize(block_size, 0);
            free.push(block.into_boxed_slice());
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                block_size,
                capacity: count,
                free: Mutex::new(free),
            }),
        })
    }

    /// Take an empty SDU buffer holding one block
    pub fn acquire(&self) -> L2capResult<SduBuffer> {
        let block = self.inner.alloc().ok_or(L2capError::ResourceLimitReached)?;
        Ok(SduBuffer {
            blocks: vec![block],
            len: 0,
            pool: self.inner.clone(),
        })
    }

    /// Take a buffer and fill it with `data`
    pub fn acquire_with(&self, data: &[u8]) -> L2capResult<SduBuffer> {
        let mut sdu = self.acquire()?;
        sdu.append(data)?;
        Ok(sdu)
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Total number of blocks owned by the pool
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of blocks currently free
    pub fn available(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("block_size", &self.inner.block_size)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// One SDU held in a chain of pool blocks
pub struct SduBuffer {
    blocks: Vec<Box<[u8]>>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl SduBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append bytes, drawing more blocks from the pool as needed
    ///
    /// On pool exhaustion the buffer keeps whatever it already held and
    /// `ResourceLimitReached` is returned.
    pub fn append(&mut self, mut data: &[u8]) -> L2capResult<()> {
        let block_size = self.pool.block_size;
        while !data.is_empty() {
            let offset = self.len % block_size;
            if offset == 0 && self.len / block_size == self.blocks.len() {
                let block = self.pool.alloc().ok_or(L2capError::ResourceLimitReached)?;
                self.blocks.push(block);
            }
            let idx = self.len / block_size;
            let n = data.len().min(block_size - offset);
            self.blocks[idx][offset..offset + n].copy_from_slice(&data[..n]);
            self.len += n;
            data = &data[n..];
        }
        Ok(())
    }

    /// Copy the SDU contents into `dst`, returning the number of bytes copied
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in self.chunks() {
            let n = chunk.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
            if copied == dst.len() {
                break;
            }
        }
        copied
    }

    /// Iterate over the filled part of each block
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let block_size = self.pool.block_size;
        let len = self.len;
        self.blocks.iter().enumerate().filter_map(move |(idx, block)| {
            let start = idx * block_size;
            (start < len).then(|| &block[..block_size.min(len - start)])
        })
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        self.chunks().for_each(|c| out.extend_from_slice(c));
        out
    }
}

impl Drop for SduBuffer {
    fn drop(&mut self) {
        self.pool.release(self.blocks.drain(..));
    }
}

impl fmt::Debug for SduBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SduBuffer")
            .field("len", &self.len)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}
