//! The shared block buffer pool and the FIFO queues built on it.
//!
//! Every block travelling between the channel peer and the network side
//! lives in one of a fixed number of fixed-size buffers. A buffer is held
//! by exactly one owner at a time (the pool, a queue, the in-flight upline
//! transfer, or a local binding); ownership moves enforce this.

use std::collections::VecDeque;

use log::error;

/// Capacity of one block buffer.
pub const MAX_BUFFER: usize = 4096;

/// Number of buffers in the pool.
pub const NUM_BUFFERS: usize = 1000;

pub struct Buffer {
	pub data: Box<[u8; MAX_BUFFER]>,
	/// Bytes in use.
	pub num_bytes: usize,
	/// Send offset: bytes before it have already been written out.
	pub offset: usize,
	/// Sequence number to acknowledge once the buffer has been sent.
	pub block_seq_no: u8,
}

impl Buffer {
	fn new() -> Self {
		Self {
			data: Box::new([0; MAX_BUFFER]),
			num_bytes: 0,
			offset: 0,
			block_seq_no: 0,
		}
	}

	/// The used portion of the buffer.
	pub fn bytes(&self) -> &[u8] {
		&self.data[..self.num_bytes]
	}

	/// The portion still to be sent.
	pub fn unsent(&self) -> &[u8] {
		&self.data[self.offset..self.num_bytes]
	}

	/// Replace the contents with `bytes`, which must fit.
	pub fn set(&mut self, bytes: &[u8]) {
		self.data[..bytes.len()].copy_from_slice(bytes);
		self.num_bytes = bytes.len();
		self.offset = 0;
	}

	/// Append as much of `bytes` as fits; returns the number copied.
	pub fn append(&mut self, bytes: &[u8]) -> usize {
		let n = bytes.len().min(MAX_BUFFER - self.num_bytes);
		self.data[self.num_bytes..self.num_bytes + n].copy_from_slice(&bytes[..n]);
		self.num_bytes += n;
		n
	}

	pub fn room(&self) -> usize {
		MAX_BUFFER - self.num_bytes
	}
}

/// Fixed pool of block buffers. Running out is unrecoverable: it means
/// blocks are leaking or the host has wedged, and the emulation cannot
/// limp on without breaking the block protocol.
pub struct Pool {
	free: Vec<Buffer>,
}

impl Pool {
	pub fn new() -> Self {
		let mut free = Vec::with_capacity(NUM_BUFFERS);
		free.resize_with(NUM_BUFFERS, Buffer::new);
		Self { free }
	}

	/// Take a buffer from the pool.
	pub fn get(&mut self) -> Buffer {
		match self.free.pop() {
			Some(b) => b,
			None => {
				error!("Out of buffers");
				panic!("BIP: out of buffers");
			}
		}
	}

	/// Return a buffer to the pool.
	pub fn release(&mut self, mut b: Buffer) {
		b.num_bytes = 0;
		b.offset = 0;
		b.block_seq_no = 0;
		self.free.push(b);
	}

	/// Buffers currently in the pool.
	pub fn count(&self) -> usize {
		self.free.len()
	}
}

/// FIFO of buffers, with prepend for re-queueing a partially sent block
/// at the head.
#[derive(Default)]
pub struct Queue {
	items: VecDeque<Buffer>,
}

impl Queue {
	pub fn append(&mut self, b: Buffer) {
		self.items.push_back(b);
	}

	pub fn prepend(&mut self, b: Buffer) {
		self.items.push_front(b);
	}

	pub fn extract(&mut self) -> Option<Buffer> {
		self.items.pop_front()
	}

	/// The most recently appended buffer, left in place.
	pub fn last_mut(&mut self) -> Option<&mut Buffer> {
		self.items.back_mut()
	}

	pub fn not_empty(&self) -> bool {
		!self.items.is_empty()
	}

	/// Drain the queue back into the pool.
	pub fn release_all(&mut self, pool: &mut Pool) {
		while let Some(b) = self.items.pop_front() {
			pool.release(b);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn get_release_cycle() {
		let mut pool = Pool::new();
		assert_eq!(pool.count(), NUM_BUFFERS);

		let mut b = pool.get();
		b.set(b"hello");
		b.offset = 2;
		b.block_seq_no = 3;
		assert_eq!(pool.count(), NUM_BUFFERS - 1);

		pool.release(b);
		assert_eq!(pool.count(), NUM_BUFFERS);

		// Release must have scrubbed the bookkeeping fields.
		let b = pool.get();
		assert_eq!(b.num_bytes, 0);
		assert_eq!(b.offset, 0);
		assert_eq!(b.block_seq_no, 0);
		pool.release(b);
	}

	#[test]
	#[should_panic(expected = "out of buffers")]
	fn exhaustion_is_fatal() {
		let mut pool = Pool::new();
		let mut held = Vec::new();
		for _ in 0..NUM_BUFFERS {
			held.push(pool.get());
		}
		// The pool is empty; the next request must terminate the program.
		let _ = pool.get();
	}

	#[test]
	fn queue_order_and_prepend() {
		let mut pool = Pool::new();
		let mut q = Queue::default();
		assert!(!q.not_empty());

		for tag in 1..=3u8 {
			let mut b = pool.get();
			b.set(&[tag]);
			q.append(b);
		}
		assert!(q.not_empty());
		assert_eq!(q.last_mut().unwrap().bytes(), &[3]);

		let first = q.extract().unwrap();
		assert_eq!(first.bytes(), &[1]);
		q.prepend(first);
		assert_eq!(q.extract().unwrap().bytes(), &[1]);
		assert_eq!(q.extract().unwrap().bytes(), &[2]);
		assert_eq!(q.extract().unwrap().bytes(), &[3]);
		assert!(q.extract().is_none());
	}

	#[test]
	fn append_respects_capacity() {
		let mut pool = Pool::new();
		let mut b = pool.get();
		let n = b.append(&[0x55; MAX_BUFFER + 10]);
		assert_eq!(n, MAX_BUFFER);
		assert_eq!(b.room(), 0);
		pool.release(b);
	}
}
