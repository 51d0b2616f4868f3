//! DSA-311 mux: bridges the 12-bit-word BSC framing NOS TIELINE expects
//! to an 8-bit byte-stream TCP peer (a 2703 emulation, or another HASP
//! speaker). Upline records get a table-driven CRC-16 appended; downline
//! CRCs are discarded. The outbound TCP connection retries every 30
//! seconds.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use log::{info, warn};
use runtime::{Io, IoEvent};
use stakker::{fwd_to, Fwd, CX};

const SOH: u8 = 0x01;
const STX: u8 = 0x02;
const DLE: u8 = 0x10;
const ETB: u8 = 0x26;
const ENQ: u8 = 0x2D;
const SYN: u8 = 0x32;
const NAK: u8 = 0x3D;
const ACK0: u8 = 0x70;

/// Control codes from the PP side.
pub const REQUEST_SEND: u8 = 0o042;
pub const RESYNC: u8 = 0o045;

const PP_IN_BUF_SIZE: usize = 1032;
const SKT_OUT_BUF_SIZE: usize = 1024;

pub const CONNECTION_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Table for CRC-16 based upon polynomial x^16 + x^15 + x^2 + 1.
static CRC16_TABLE: [u16; 256] = [
	0x0000, 0xC0C1, 0xC181, 0x0140, 0xC301, 0x03C0, 0x0280, 0xC241,
	0xC601, 0x06C0, 0x0780, 0xC741, 0x0500, 0xC5C1, 0xC481, 0x0440,
	0xCC01, 0x0CC0, 0x0D80, 0xCD41, 0x0F00, 0xCFC1, 0xCE81, 0x0E40,
	0x0A00, 0xCAC1, 0xCB81, 0x0B40, 0xC901, 0x09C0, 0x0880, 0xC841,
	0xD801, 0x18C0, 0x1980, 0xD941, 0x1B00, 0xDBC1, 0xDA81, 0x1A40,
	0x1E00, 0xDEC1, 0xDF81, 0x1F40, 0xDD01, 0x1DC0, 0x1C80, 0xDC41,
	0x1400, 0xD4C1, 0xD581, 0x1540, 0xD701, 0x17C0, 0x1680, 0xD641,
	0xD201, 0x12C0, 0x1380, 0xD341, 0x1100, 0xD1C1, 0xD081, 0x1040,
	0xF001, 0x30C0, 0x3180, 0xF141, 0x3300, 0xF3C1, 0xF281, 0x3240,
	0x3600, 0xF6C1, 0xF781, 0x3740, 0xF501, 0x35C0, 0x3480, 0xF441,
	0x3C00, 0xFCC1, 0xFD81, 0x3D40, 0xFF01, 0x3FC0, 0x3E80, 0xFE41,
	0xFA01, 0x3AC0, 0x3B80, 0xFB41, 0x3900, 0xF9C1, 0xF881, 0x3840,
	0x2800, 0xE8C1, 0xE981, 0x2940, 0xEB01, 0x2BC0, 0x2A80, 0xEA41,
	0xEE01, 0x2EC0, 0x2F80, 0xEF41, 0x2D00, 0xEDC1, 0xEC81, 0x2C40,
	0xE401, 0x24C0, 0x2580, 0xE541, 0x2700, 0xE7C1, 0xE681, 0x2640,
	0x2200, 0xE2C1, 0xE381, 0x2340, 0xE101, 0x21C0, 0x2080, 0xE041,
	0xA001, 0x60C0, 0x6180, 0xA141, 0x6300, 0xA3C1, 0xA281, 0x6240,
	0x6600, 0xA6C1, 0xA781, 0x6740, 0xA501, 0x65C0, 0x6480, 0xA441,
	0x6C00, 0xACC1, 0xAD81, 0x6D40, 0xAF01, 0x6FC0, 0x6E80, 0xAE41,
	0xAA01, 0x6AC0, 0x6B80, 0xAB41, 0x6900, 0xA9C1, 0xA881, 0x6840,
	0x7800, 0xB8C1, 0xB981, 0x7940, 0xBB01, 0x7BC0, 0x7A80, 0xBA41,
	0xBE01, 0x7EC0, 0x7F80, 0xBF41, 0x7D00, 0xBDC1, 0xBC81, 0x7C40,
	0xB401, 0x74C0, 0x7580, 0xB541, 0x7700, 0xB7C1, 0xB681, 0x7640,
	0x7200, 0xB2C1, 0xB381, 0x7340, 0xB101, 0x71C0, 0x7080, 0xB041,
	0x5000, 0x90C1, 0x9181, 0x5140, 0x9301, 0x53C0, 0x5280, 0x9241,
	0x9601, 0x56C0, 0x5780, 0x9741, 0x5500, 0x95C1, 0x9481, 0x5440,
	0x9C01, 0x5CC0, 0x5D80, 0x9D41, 0x5F00, 0x9FC1, 0x9E81, 0x5E40,
	0x5A00, 0x9AC1, 0x9B81, 0x5B40, 0x9901, 0x59C0, 0x5880, 0x9841,
	0x8801, 0x48C0, 0x4980, 0x8941, 0x4B00, 0x8BC1, 0x8A81, 0x4A40,
	0x4E00, 0x8EC1, 0x8F81, 0x4F40, 0x8D01, 0x4DC0, 0x4C80, 0x8C41,
	0x4400, 0x84C1, 0x8581, 0x4540, 0x8701, 0x47C0, 0x4680, 0x8641,
	0x8201, 0x42C0, 0x4380, 0x8341, 0x4100, 0x81C1, 0x8081, 0x4040,
];

/// One CRC-16 step.
pub fn crc16_update(crc: u16, b: u8) -> u16 {
	crc >> 8 ^ CRC16_TABLE[(crc ^ b as u16) as usize & 0xFF]
}

/// CRC-16 of a whole buffer.
pub fn crc16(data: &[u8]) -> u16 {
	data.iter().fold(0, |crc, &b| crc16_update(crc, b))
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum MajorState {
	Disconnected,
	Connecting,
	Connected,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum InputState {
	Dle1,
	Stx,
	Dle2,
	Etb,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputState {
	Soh,
	Enq,
	Dle1,
	Dle2,
	Etb1,
	Etb2,
	Crc1,
	Crc2,
}

/// A DSA-311 line: one TCP peer, one pair of BSC scanners.
pub struct Dsa311 {
	addr: SocketAddrV4,
	major: MajorState,
	input: InputState,
	output: OutputState,
	is_rts: bool,
	crc: u16,
	/// Translated bytes awaiting the PP.
	pp_in: VecDeque<u8>,
	/// Translated bytes awaiting the socket.
	skt_out: Vec<u8>,
	link: Option<Io>,
	next_attempt: Option<Instant>,
	fwd: Option<Fwd<(u32, IoEvent)>>,
}

impl Dsa311 {
	pub fn new(addr: SocketAddrV4) -> Self {
		Self {
			addr,
			major: MajorState::Disconnected,
			input: InputState::Dle1,
			output: OutputState::Soh,
			is_rts: false,
			crc: 0,
			pp_in: VecDeque::new(),
			skt_out: Vec::new(),
			link: None,
			next_attempt: None,
			fwd: None,
		}
	}

	/// Actor entry point: starts the reconnect/service timer.
	pub fn init(cx: CX![], addr: SocketAddrV4) -> Option<Self> {
		let mut this = Self::new(addr);
		this.fwd = Some(fwd_to!([cx], sock_event() as (u32, IoEvent)));
		this.schedule(cx);
		Some(this)
	}

	fn schedule(&mut self, cx: CX![]) {
		let actor = cx.access_actor().clone();
		cx.after(Duration::from_millis(100), move |s| {
			actor.apply(s, |this, cx| {
				this.service(cx.now());
				this.schedule(cx);
			})
		});
	}

	fn sock_event(&mut self, cx: CX![], _token: u32, ev: IoEvent) {
		let now = cx.now();
		match ev {
			IoEvent::Data(data) => self.receive(&data),
			IoEvent::Writable => {
				if self.major == MajorState::Connecting {
					self.finish_connect(now);
				} else {
					self.send(now);
				}
			}
			IoEvent::Closed => {
				info!("DSA311 connection to {} closed", self.addr);
				self.close_connection(now);
			}
		}
	}

	/// Periodic service: reconnects and output draining.
	pub fn service(&mut self, now: Instant) {
		if self.major == MajorState::Disconnected
			&& self.next_attempt.is_none_or(|t| now >= t)
		{
			self.initiate_connection(now);
		}

		if self.major == MajorState::Connected && !self.skt_out.is_empty() {
			self.send(now);
		}
	}

	/// Whether the line will currently take PP output.
	pub fn output_ready(&self) -> bool {
		self.major == MajorState::Connected && self.is_rts && self.skt_out.len() < SKT_OUT_BUF_SIZE
	}

	/// The next translated byte for the PP, if any.
	pub fn input_byte(&mut self) -> Option<u8> {
		if self.major == MajorState::Connected {
			self.pp_in.pop_front()
		} else {
			None
		}
	}

	/// A control word from the PP.
	pub fn control(&mut self, code: u8) {
		match code {
			REQUEST_SEND => self.is_rts = true,
			RESYNC => self.is_rts = false,
			_ => {}
		}
	}

	/// One output byte from the PP, fed through the downline scanner.
	/// SOH ENQ passes through, SOH STX becomes a transparent DLE STX
	/// frame, NAK becomes SYN NAK, and the PP's trailing CRC is dropped.
	pub fn output_byte(&mut self, ch: u8) {
		match self.output {
			// Discard until the beginning of a message: SOH (SOH-ENQ or a
			// non-transparent frame), DLE (transparent frame), or NAK.
			OutputState::Soh => {
				if ch == SOH {
					self.output = OutputState::Enq;
				} else if ch == DLE {
					self.push_out(ch);
					self.output = OutputState::Dle1;
				} else if ch == NAK {
					self.push_out(SYN);
					self.push_out(ch);
				}
			}

			OutputState::Enq => {
				if ch == ENQ {
					self.push_out(SOH);
					self.push_out(ch);
					self.output = OutputState::Soh;
				} else if ch == STX {
					self.push_out(DLE);
					self.push_out(ch);
					self.output = OutputState::Etb1;
				} else {
					self.output = OutputState::Soh;
				}
			}

			// Non-transparent frame: escape sensitive characters and wait
			// for the closing ETB.
			OutputState::Etb1 => {
				if self.skt_out.len() + 1 < SKT_OUT_BUF_SIZE {
					match ch {
						SYN => {} // discard trailing SYNs
						SOH => self.output = OutputState::Soh,
						ETB => {
							self.output = OutputState::Crc1;
							self.push_out(DLE);
							self.push_out(ch);
						}
						STX | DLE => {
							self.push_out(DLE);
							self.push_out(ch);
						}
						_ => self.push_out(ch),
					}
				}
			}

			// After DLE: ACK0 is a bare acknowledgement, anything else is
			// a transparent frame.
			OutputState::Dle1 => {
				self.push_out(ch);
				self.output = if ch == ACK0 { OutputState::Soh } else { OutputState::Dle2 };
			}

			OutputState::Dle2 => {
				self.push_out(ch);
				if ch == DLE {
					self.output = OutputState::Etb2;
				}
			}

			OutputState::Etb2 => {
				self.push_out(ch);
				self.output = if ch == ETB { OutputState::Crc1 } else { OutputState::Dle2 };
			}

			// The PP appends a CRC the byte stream peer must not see.
			OutputState::Crc1 => self.output = OutputState::Crc2,
			OutputState::Crc2 => self.output = OutputState::Soh,
		}
	}

	fn push_out(&mut self, b: u8) {
		if self.skt_out.len() < SKT_OUT_BUF_SIZE {
			self.skt_out.push(b);
		}
	}

	/// Translate received peer bytes into PP-side BSC with CRC.
	fn receive(&mut self, data: &[u8]) {
		for &b in data {
			if self.pp_in.len() + 2 >= PP_IN_BUF_SIZE {
				return;
			}

			match self.input {
				InputState::Dle1 => {
					if b == NAK {
						self.pp_in.push_back(SYN);
						self.pp_in.push_back(b);
					} else if b == DLE {
						self.input = InputState::Stx;
					}
				}

				InputState::Stx => {
					if b == STX {
						self.pp_in.push_back(SOH);
						self.pp_in.push_back(b);
						self.crc = 0;
						self.crc = crc16_update(self.crc, SOH);
						self.crc = crc16_update(self.crc, b);
						self.input = InputState::Dle2;
					} else if b == ACK0 {
						self.pp_in.push_back(DLE);
						self.pp_in.push_back(b);
						self.input = InputState::Dle1;
					}
				}

				InputState::Dle2 => {
					if b == DLE {
						self.input = InputState::Etb;
					} else {
						self.pp_in.push_back(b);
						self.crc = crc16_update(self.crc, b);
					}
				}

				InputState::Etb => {
					self.pp_in.push_back(b);
					self.crc = crc16_update(self.crc, b);
					if b == ETB {
						self.pp_in.push_back((self.crc >> 8) as u8);
						self.pp_in.push_back(self.crc as u8);
						self.input = InputState::Dle1;
					}
				}
			}
		}
	}

	fn initiate_connection(&mut self, now: Instant) {
		self.next_attempt = Some(now + CONNECTION_RETRY_INTERVAL);
		let Some(fwd) = &self.fwd else { return };

		match runtime::connect(self.addr) {
			Ok(stream) => {
				self.link = Some(Io::connecting(stream, 0, fwd.clone()));
				self.major = MajorState::Connecting;
			}
			Err(err) => {
				warn!("DSA311 connect to {} failed: {err}", self.addr);
			}
		}
	}

	fn finish_connect(&mut self, now: Instant) {
		let Some(io) = &self.link else { return };

		match io.take_error() {
			Ok(None) => {
				info!("DSA311 connected to {}", self.addr);
				io.set_connected();
				self.major = MajorState::Connected;
				self.reset();
			}
			Ok(Some(err)) | Err(err) => {
				warn!("DSA311 failed to connect to {}: {err}", self.addr);
				self.close_connection(now);
			}
		}
	}

	fn close_connection(&mut self, now: Instant) {
		self.link = None;
		self.major = MajorState::Disconnected;
		self.next_attempt = Some(now + CONNECTION_RETRY_INTERVAL);
	}

	fn reset(&mut self) {
		self.pp_in.clear();
		self.skt_out.clear();
		self.input = InputState::Dle1;
		self.output = OutputState::Soh;
	}

	fn send(&mut self, now: Instant) {
		let Some(io) = &self.link else { return };

		match io.send(&self.skt_out) {
			Ok(n) => {
				self.skt_out.drain(..n);
				if !self.skt_out.is_empty() {
					io.want_write(true);
				}
			}
			Err(()) => self.close_connection(now),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn mux() -> Dsa311 {
		let mut m = Dsa311::new(SocketAddrV4::new([127, 0, 0, 1].into(), 2553));
		m.major = MajorState::Connected;
		m
	}

	#[test]
	fn crc_laws() {
		// An empty buffer and a single zero byte both hash to zero.
		assert_eq!(crc16(&[]), 0);
		assert_eq!(crc16(&[0x00]), 0);

		// The CRC is order sensitive.
		assert_ne!(crc16(b"ab"), crc16(b"ba"));

		// And matches the table-driven reference for a known pair.
		let c = crc16_update(crc16_update(0, SOH), STX);
		assert_eq!(c, crc16(&[SOH, STX]));
	}

	#[test]
	fn upline_frame_gets_crc() {
		let mut m = mux();

		// Peer sends a transparent frame: DLE STX data DLE ETB.
		m.receive(&[DLE, STX, 0x41, 0x42, DLE, ETB]);

		let expected_crc = crc16(&[SOH, STX, 0x41, 0x42, ETB]);
		let mut got = Vec::new();
		while let Some(b) = m.input_byte() {
			got.push(b);
		}
		assert_eq!(
			got,
			vec![SOH, STX, 0x41, 0x42, ETB, (expected_crc >> 8) as u8, expected_crc as u8]
		);
	}

	#[test]
	fn upline_dle_escape_and_ack() {
		let mut m = mux();

		// DLE DLE inside a frame is a literal DLE; DLE ACK0 outside is an
		// acknowledgement.
		m.receive(&[DLE, ACK0]);
		m.receive(&[DLE, STX, DLE, DLE, DLE, ETB]);

		let mut got = Vec::new();
		while let Some(b) = m.input_byte() {
			got.push(b);
		}
		assert_eq!(&got[..2], &[DLE, ACK0]);
		assert_eq!(&got[2..5], &[SOH, STX, DLE]);
		assert_eq!(got[5], ETB);
	}

	#[test]
	fn downline_translation() {
		let mut m = mux();
		m.control(REQUEST_SEND);
		assert!(m.output_ready());

		// SOH ENQ passes through unchanged.
		m.output_byte(SOH);
		m.output_byte(ENQ);
		assert_eq!(m.skt_out, vec![SOH, ENQ]);
		m.skt_out.clear();

		// A non-transparent frame SOH STX ... ETB CRC CRC becomes a
		// transparent DLE STX ... DLE ETB, CRC dropped.
		for &b in &[SOH, STX, 0x41, DLE, 0x42, ETB, 0xAA, 0xBB] {
			m.output_byte(b);
		}
		assert_eq!(m.skt_out, vec![DLE, STX, 0x41, DLE, DLE, 0x42, DLE, ETB]);
		m.skt_out.clear();

		// NAK becomes SYN NAK.
		m.output_byte(NAK);
		assert_eq!(m.skt_out, vec![SYN, NAK]);
	}

	#[test]
	fn resync_drops_rts() {
		let mut m = mux();
		m.control(REQUEST_SEND);
		m.control(RESYNC);
		assert!(!m.output_ready());
	}
}
