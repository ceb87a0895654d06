// Copyright 2022 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Byte-buffer pools. Each pool serves exactly one purpose (UDP reads, TCP
//! reads, QUIC reads, response builds) so sizes can be tuned independently
//! and a misbehaving consumer cannot poison the others.

use bytes::BytesMut;
use std::sync::Mutex;

/// A pool of fixed-capacity read/write buffers.
pub struct BufPool {
    size: usize,
    bufs: Mutex<Vec<BytesMut>>,
}

impl BufPool {
    /// Create a pool handing out buffers of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            bufs: Mutex::new(Vec::new()),
        }
    }

    /// The capacity every buffer from this pool is restored to.
    pub fn buf_size(&self) -> usize {
        self.size
    }

    /// Take a zero-filled buffer of the pool's size.
    pub fn get(&self) -> BytesMut {
        let mut buf = self
            .bufs
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.size));
        buf.resize(self.size, 0);
        buf
    }

    /// Return a buffer. Buffers that shrank below the pool size (e.g. after
    /// `split_to`) are dropped instead of being recycled at the wrong size.
    pub fn put(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() >= self.size {
            self.bufs.lock().expect("buffer pool poisoned").push(buf);
        }
    }
}
