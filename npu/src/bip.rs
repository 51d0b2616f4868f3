//! Block Interface Protocol: the order-word state machine that exchanges
//! whole blocks with the channel peer. Downline blocks are staged one at a
//! time and dispatched by destination node; upline blocks are strictly
//! serialised, exactly one in flight, the rest queued.

use log::warn;

use crate::buf::{Buffer, Pool, Queue};

/// Handler receiving upline blocks on their way to the channel peer. The
/// peer answers each delivery with `notify_upline_sent` (or `retry_input`
/// to have the same block presented again).
pub type UplineHandler = Box<dyn FnMut(&[u8])>;

/// What the staged downline buffer was announced as.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Staged {
	Svm,
	Data(u8),
}

#[derive(Clone, Copy, PartialEq)]
enum State {
	Idle,
	DownSvm,
	DownDataLow,
	DownDataHigh,
}

pub struct Bip {
	state: State,
	downline: Option<Buffer>,
	upline: Option<Buffer>,
	upline_q: Queue,
	peer: UplineHandler,
	/// Deliver upline blocks immediately instead of waiting for the
	/// peer's acknowledgement, so tests see every block.
	#[cfg(test)]
	pub(crate) auto_ack: bool,
}

impl Bip {
	pub fn new(peer: UplineHandler) -> Self {
		Self {
			state: State::Idle,
			downline: None,
			upline: None,
			upline_q: Queue::default(),
			peer,
			#[cfg(test)]
			auto_ack: false,
		}
	}

	/// Release everything and return to idle (NAM restart).
	pub fn reset(&mut self, pool: &mut Pool) {
		if let Some(b) = self.upline.take() {
			pool.release(b);
		}
		self.upline_q.release_all(pool);
		if let Some(b) = self.downline.take() {
			pool.release(b);
		}
		self.state = State::Idle;
	}

	/// Order word: the peer has a service message to deliver.
	pub fn notify_service_message(&mut self, pool: &mut Pool) {
		self.stage(pool, State::DownSvm);
	}

	/// Order word: the peer has a data block of the given priority.
	pub fn notify_data(&mut self, pool: &mut Pool, priority: u8) {
		self.stage(
			pool,
			if priority == 0 { State::DownDataLow } else { State::DownDataHigh },
		);
	}

	fn stage(&mut self, pool: &mut Pool, state: State) {
		if let Some(b) = self.downline.take() {
			warn!("Downline buffer staged twice, discarding previous");
			pool.release(b);
		}
		self.downline = Some(pool.get());
		self.state = state;
	}

	/// The staged downline buffer, for the peer to fill.
	pub fn request_downline(&mut self) -> Option<&mut Buffer> {
		self.downline.as_mut()
	}

	/// Order word: the staged downline buffer is complete. Returns it with
	/// its staging class for dispatch; the caller must follow up with
	/// [`Bip::kick_upline`] once dispatch is done.
	pub fn finish_downline(&mut self) -> Option<(Staged, Buffer)> {
		let staged = match self.state {
			State::Idle => {
				warn!("Downline completion without a staged buffer");
				return None;
			}
			State::DownSvm => Staged::Svm,
			State::DownDataLow => Staged::Data(0),
			State::DownDataHigh => Staged::Data(1),
		};
		self.state = State::Idle;
		self.downline.take().map(|b| (staged, b))
	}

	/// Order word: the downline transfer was aborted.
	pub fn abort_downline(&mut self, pool: &mut Pool) {
		if let Some(b) = self.downline.take() {
			pool.release(b);
		}
		self.state = State::Idle;
		self.kick_upline();
	}

	/// Hand a block to the peer, or queue it behind the one in flight.
	pub fn request_upline(&mut self, b: Buffer) {
		#[cfg(test)]
		if self.auto_ack {
			(self.peer)(b.bytes());
			return;
		}

		if self.upline.is_some() {
			self.upline_q.append(b);
			return;
		}

		self.upline = Some(b);

		if self.state == State::Idle {
			self.present();
		}
	}

	/// Copy a canned message into a fresh buffer and send it upline.
	pub fn request_upline_canned(&mut self, pool: &mut Pool, msg: &[u8]) {
		let mut b = pool.get();
		b.set(msg);
		self.request_upline(b);
	}

	/// Order word: the in-flight upline block has been consumed.
	pub fn notify_upline_sent(&mut self, pool: &mut Pool) {
		if let Some(b) = self.upline.take() {
			pool.release(b);
		}

		if let Some(b) = self.upline_q.extract() {
			self.upline = Some(b);
			self.present();
		}
	}

	/// Order word: re-present the current in-flight upline block.
	pub fn retry_input(&mut self) {
		if self.upline.is_some() {
			self.present();
		}
	}

	/// Present the in-flight upline block, if any. Called after each
	/// downline dispatch completes.
	pub fn kick_upline(&mut self) {
		if self.upline.is_some() {
			self.present();
		}
	}

	fn present(&mut self) {
		if let Some(b) = &self.upline {
			(self.peer)(b.bytes());
		}
	}
}

#[cfg(test)]
mod tests {
	use std::cell::RefCell;
	use std::rc::Rc;

	use super::*;

	fn collector() -> (Rc<RefCell<Vec<Vec<u8>>>>, UplineHandler) {
		let seen = Rc::new(RefCell::new(Vec::new()));
		let sink = seen.clone();
		(seen, Box::new(move |b: &[u8]| sink.borrow_mut().push(b.to_vec())))
	}

	#[test]
	fn upline_is_serialised() {
		let mut pool = Pool::new();
		let (seen, peer) = collector();
		let mut bip = Bip::new(peer);

		bip.request_upline_canned(&mut pool, &[1]);
		bip.request_upline_canned(&mut pool, &[2]);
		bip.request_upline_canned(&mut pool, &[3]);

		// Only the first block reaches the peer until it acknowledges.
		assert_eq!(seen.borrow().len(), 1);
		assert_eq!(seen.borrow()[0], vec![1]);

		bip.notify_upline_sent(&mut pool);
		assert_eq!(seen.borrow().len(), 2);
		assert_eq!(seen.borrow()[1], vec![2]);

		bip.notify_upline_sent(&mut pool);
		bip.notify_upline_sent(&mut pool);
		assert_eq!(seen.borrow().len(), 3);

		// All buffers back home.
		assert_eq!(pool.count(), crate::buf::NUM_BUFFERS);
	}

	#[test]
	fn retry_re_presents_in_flight() {
		let mut pool = Pool::new();
		let (seen, peer) = collector();
		let mut bip = Bip::new(peer);

		bip.request_upline_canned(&mut pool, &[7, 8]);
		bip.retry_input();

		assert_eq!(seen.borrow().len(), 2);
		assert_eq!(seen.borrow()[0], seen.borrow()[1]);
	}

	#[test]
	fn upline_held_during_downline_transfer() {
		let mut pool = Pool::new();
		let (seen, peer) = collector();
		let mut bip = Bip::new(peer);

		bip.notify_service_message(&mut pool);
		bip.request_upline_canned(&mut pool, &[9]);
		// A downline transfer is in progress, so nothing is presented yet.
		assert!(seen.borrow().is_empty());

		bip.request_downline().unwrap().set(&[0, 0, 0, 4, 0x0E, 0x8A]);
		let (staged, b) = bip.finish_downline().unwrap();
		assert_eq!(staged, Staged::Svm);
		pool.release(b);
		bip.kick_upline();

		assert_eq!(seen.borrow().len(), 1);
	}

	#[test]
	fn abort_releases_staged_buffer() {
		let mut pool = Pool::new();
		let (_, peer) = collector();
		let mut bip = Bip::new(peer);

		bip.notify_data(&mut pool, 1);
		assert_eq!(pool.count(), crate::buf::NUM_BUFFERS - 1);
		bip.abort_downline(&mut pool);
		assert_eq!(pool.count(), crate::buf::NUM_BUFFERS);
		assert!(bip.finish_downline().is_none());
	}
}
