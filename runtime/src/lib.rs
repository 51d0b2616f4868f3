use core::cell::RefCell;
use core::mem;
use core::time::Duration;
use std::io::{self, ErrorKind};
use std::net::{SocketAddrV4, TcpListener, TcpStream};

use log::{error, warn};
use stakker::Fwd;
use utils::error::*;

pub mod logger;
mod rt;

pub use rt::*;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, FromRawFd, RawFd};

	pub use libc::{
		c_void as BufType, poll, pollfd as Poll, recv, send, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT,
	};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}
}

pub use sys::AsRawFd;
use sys::*;

/// Bytes requested from the kernel per read.
const READ_CHUNK: usize = 4096;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

/// Enable SO_KEEPALIVE so that a rebooted peer is eventually discovered.
fn keepalive(fd: RawFd) {
	let on: libc::c_int = 1;
	unsafe {
		libc::setsockopt(
			fd,
			libc::SOL_SOCKET,
			libc::SO_KEEPALIVE,
			&on as *const _ as *const libc::c_void,
			mem::size_of::<libc::c_int>() as libc::socklen_t,
		);
	}
}

fn sock_send(fd: RawFd, buf: &[u8]) -> Result<usize> {
	let r = unsafe { sys::send(fd, buf.as_ptr() as *const BufType, buf.len(), 0) };

	if r >= 0 {
		return Ok(r as usize);
	}

	let err = io::Error::last_os_error();

	if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) {
		return Ok(0);
	}

	warn!("I/O operation failed: {err}");
	Err(())
}

/// Initiate a non-blocking TCP connection. The returned stream is usually
/// still connecting: register it with [`Io::connecting`] and complete the
/// handshake when it becomes writable.
pub fn connect(addr: SocketAddrV4) -> io::Result<TcpStream> {
	unsafe {
		let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
		if fd < 0 {
			return Err(io::Error::last_os_error());
		}

		keepalive(fd);
		libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);

		let mut sa: libc::sockaddr_in = mem::zeroed();
		sa.sin_family = libc::AF_INET as libc::sa_family_t;
		sa.sin_port = addr.port().to_be();
		sa.sin_addr = libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() };

		let r = libc::connect(
			fd,
			&sa as *const _ as *const libc::sockaddr,
			mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
		);
		if r == 0 {
			return Ok(TcpStream::from_raw_fd(fd));
		}

		let err = io::Error::last_os_error();
		if err.raw_os_error() == Some(libc::EINPROGRESS) {
			Ok(TcpStream::from_raw_fd(fd))
		} else {
			libc::close(fd);
			Err(err)
		}
	}
}

/// Create a non-blocking listening socket bound to all interfaces.
pub fn listen(port: u16) -> io::Result<TcpListener> {
	unsafe {
		let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
		if fd < 0 {
			return Err(io::Error::last_os_error());
		}

		let on: libc::c_int = 1;
		libc::setsockopt(
			fd,
			libc::SOL_SOCKET,
			libc::SO_REUSEADDR,
			&on as *const _ as *const libc::c_void,
			mem::size_of::<libc::c_int>() as libc::socklen_t,
		);
		// A client dropping its attempt between poll and accept must not
		// block the loop.
		libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);

		let mut sa: libc::sockaddr_in = mem::zeroed();
		sa.sin_family = libc::AF_INET as libc::sa_family_t;
		sa.sin_port = port.to_be();
		sa.sin_addr = libc::in_addr { s_addr: libc::INADDR_ANY.to_be() };

		if libc::bind(
			fd,
			&sa as *const _ as *const libc::sockaddr,
			mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
		) < 0
		{
			let err = io::Error::last_os_error();
			libc::close(fd);
			return Err(err);
		}

		if libc::listen(fd, 5) < 0 {
			let err = io::Error::last_os_error();
			libc::close(fd);
			return Err(err);
		}

		Ok(TcpListener::from_raw_fd(fd))
	}
}

/// Socket readiness events delivered to the owning actor. The `u32` that
/// accompanies each event is the token the socket was registered with.
pub enum IoEvent {
	/// Bytes received from the socket, in arrival order.
	Data(Vec<u8>),
	/// The socket will accept more output (or a pending connect finished,
	/// for sockets registered with [`Io::connecting`]).
	Writable,
	/// The peer closed the connection, or the socket failed.
	Closed,
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new()
		})
	};
}

struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
}

enum Entry {
	Stream {
		token: u32,
		fwd: Fwd<(u32, IoEvent)>,
		connecting: bool,
	},
	Listener {
		token: u32,
		fwd: Fwd<(u32, TcpStream)>,
	},
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	fn idx_of(&self, raw: RawFd) -> usize {
		self.fds.iter().position(|f| f.fd == raw).expect("Socket is present")
	}

	/// Returns whether any more I/O is waiting.
	fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	/// Poll the fds. Returns whether any file descriptors were ready.
	fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("Fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		let pending: u32 = ret
			.try_into()
			.map_err(|_| error!("poll() failed: {}", io::Error::last_os_error()))?;

		if pending == 0 {
			return Ok(false);
		}

		for idx in 0..self.fds.len() {
			let Poll { fd, revents, .. } = self.fds[idx];

			if revents == 0 {
				continue;
			}
			self.fds[idx].revents = 0;

			match &self.entries[idx] {
				Entry::Listener { token, fwd } => {
					if revents & POLLIN != 0 {
						accept_pending(fd, *token, fwd);
					}
					if revents & (POLLERR | POLLNVAL) != 0 {
						error!("Error polling listening socket");
						self.fds[idx].events = 0;
					}
				}
				Entry::Stream { token, fwd, connecting } => {
					if *connecting {
						// Failure shows up as POLLERR/POLLHUP here; the owner
						// sorts success from failure with take_error().
						if revents & (POLLOUT | POLLERR | POLLHUP) != 0 {
							fwd.fwd((*token, IoEvent::Writable));
							self.fds[idx].events = 0;
						}
						continue;
					}

					let mut closed = false;

					if revents & POLLIN != 0 {
						closed = flush_read(fd, *token, fwd);
					}
					if revents & (POLLERR | POLLHUP | POLLNVAL) != 0 {
						closed = true;
					} else if revents & POLLOUT != 0 {
						// One-shot: the owner re-arms with want_write() if
						// its queue is still not drained.
						fwd.fwd((*token, IoEvent::Writable));
						self.fds[idx].events &= !POLLOUT;
					}

					if closed {
						fwd.fwd((*token, IoEvent::Closed));
						self.fds[idx].events = 0;
					}
				}
			}
		}

		Ok(true)
	}
}

/// Drain a readable socket. Returns true when the peer has closed.
fn flush_read(fd: RawFd, token: u32, fwd: &Fwd<(u32, IoEvent)>) -> bool {
	loop {
		let mut buf = vec![0; READ_CHUNK];
		let r = unsafe { sys::recv(fd, buf.as_mut_ptr() as *mut BufType, buf.len(), 0) };

		if r > 0 {
			buf.truncate(r as usize);
			let done = (r as usize) < READ_CHUNK;
			fwd.fwd((token, IoEvent::Data(buf)));
			if done {
				return false;
			}
			continue;
		}

		if r == 0 {
			return true;
		}

		let err = io::Error::last_os_error();
		return !matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted);
	}
}

fn accept_pending(fd: RawFd, token: u32, fwd: &Fwd<(u32, TcpStream)>) {
	loop {
		let conn = unsafe { libc::accept(fd, core::ptr::null_mut(), core::ptr::null_mut()) };

		if conn < 0 {
			let err = io::Error::last_os_error();
			if !matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) {
				warn!("Spurious connection attempt: {err}");
			}
			return;
		}

		let stream = unsafe { TcpStream::from_raw_fd(conn) };
		keepalive(conn);
		let _ = stream.set_nonblocking(true);
		fwd.fwd((token, stream));
	}
}

/// A connected (or connecting) TCP socket registered with the reactor.
/// Reads are delivered through the registered `Fwd`; writes stay with the
/// owner, which keeps its own queue and re-arms POLLOUT on a short write.
pub struct Io {
	sock: TcpStream,
}

impl Io {
	pub fn new(sock: TcpStream, token: u32, fwd: Fwd<(u32, IoEvent)>) -> Self {
		Self::register(sock, token, fwd, false)
	}

	/// Register a socket whose connect is still in progress. A single
	/// `Writable` event is delivered when the attempt resolves; call
	/// [`Io::set_connected`] after checking [`Io::take_error`].
	pub fn connecting(sock: TcpStream, token: u32, fwd: Fwd<(u32, IoEvent)>) -> Self {
		Self::register(sock, token, fwd, true)
	}

	fn register(sock: TcpStream, token: u32, fwd: Fwd<(u32, IoEvent)>, connecting: bool) -> Self {
		State::with(|i| {
			i.fds.push(Poll {
				fd: as_raw(&sock),
				events: if connecting { POLLOUT } else { POLLIN },
				revents: 0,
			});
			i.entries.push(Entry::Stream { token, fwd, connecting });

			Self { sock }
		})
	}

	/// Non-blocking send. Returns the number of bytes the socket took,
	/// which is 0 when the send would block.
	pub fn send(&self, buf: &[u8]) -> Result<usize> {
		sock_send(as_raw(&self.sock), buf)
	}

	/// Arm or disarm write-readiness notification.
	pub fn want_write(&self, on: bool) {
		self.set_events(POLLOUT, on);
	}

	/// Arm or disarm read notification. Disarming leaves inbound data in
	/// the kernel buffers, pushing back on the peer.
	pub fn want_read(&self, on: bool) {
		self.set_events(POLLIN, on);
	}

	fn set_events(&self, bit: i16, on: bool) {
		State::with(|i| {
			let idx = i.idx_of(as_raw(&self.sock));
			if on {
				i.fds[idx].events |= bit;
			} else {
				i.fds[idx].events &= !bit;
			}
		})
	}

	/// Switch a connecting socket over to normal read-driven operation.
	pub fn set_connected(&self) {
		State::with(|i| {
			let idx = i.idx_of(as_raw(&self.sock));
			i.fds[idx].events = POLLIN;
			if let Entry::Stream { connecting, .. } = &mut i.entries[idx] {
				*connecting = false;
			}
		})
	}

	/// Redirect events to a different token/forwarder. Used when an
	/// accepted socket is handed over to the port that owns the peer.
	pub fn set_route(&self, token: u32, fwd: Fwd<(u32, IoEvent)>) {
		State::with(|i| {
			let idx = i.idx_of(as_raw(&self.sock));
			if let Entry::Stream { token: t, fwd: f, .. } = &mut i.entries[idx] {
				*t = token;
				*f = fwd;
			}
		})
	}

	/// The pending socket error, for completing non-blocking connects.
	pub fn take_error(&self) -> io::Result<Option<io::Error>> {
		self.sock.take_error()
	}

	pub fn stream(&self) -> &TcpStream {
		&self.sock
	}
}

impl Drop for Io {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(as_raw(&self.sock));
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}

/// A listening socket registered with the reactor. Accepted connections
/// are made non-blocking, get SO_KEEPALIVE, and are forwarded with the
/// listener's token.
pub struct Listener {
	sock: TcpListener,
}

impl Listener {
	pub fn new(sock: TcpListener, token: u32, fwd: Fwd<(u32, TcpStream)>) -> Self {
		State::with(|i| {
			i.fds.push(Poll { fd: as_raw(&sock), events: POLLIN, revents: 0 });
			i.entries.push(Entry::Listener { token, fwd });

			Self { sock }
		})
	}

	pub fn socket(&self) -> &TcpListener {
		&self.sock
	}
}

impl Drop for Listener {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(as_raw(&self.sock));
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}

pub(crate) fn io_pending() -> bool {
	State::with(|i| i.is_io())
}

pub(crate) fn poll_io(timeout: Option<Duration>) -> Result<bool> {
	State::with(|i| i.poll(timeout))
}
