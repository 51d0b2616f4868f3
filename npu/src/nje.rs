//! NJE/TCP: VMNET-compatible network job entry links carried for the
//! host's NJF application. TCP payloads are TTB-framed groups of
//! TTR-prefixed records; inside sit BSC leaders, BCB/FCS sequencing,
//! RCB/SRCB records and SCB-compressed strings.

use std::time::{Duration, Instant};

use log::{info, warn};
use rand::Rng;

use crate::block::*;
use crate::buf::{Buffer, Queue};
use crate::net::{queue_output, ConnType};
use crate::tip::{self, TermState, MAX_TCBS};
use crate::Npu;

/// Retransmitted blocks tolerated before the link is declared broken.
pub const MAX_RETRIES: u8 = 8;

/// Upline blocks to NJF are capped well below the buffer size.
pub const MAX_UPLINE_BLOCK_SIZE: usize = 640;

/// Patience for each handshake step.
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(15);

// Special EBCDIC characters of the NJE protocol.
const SOH: u8 = 0x01;
const STX: u8 = 0x02;
const DLE: u8 = 0x10;
const ENQ: u8 = 0x2D;
const SYN: u8 = 0x32;
const NAK: u8 = 0x3D;
const ACK0: u8 = 0x70;
const EBCDIC_BLANK: u8 = 0x40;

/// Record Control Block codes.
pub const RCB_RTI: u8 = 0x90;
pub const RCB_PTI: u8 = 0xA0;
pub const RCB_DENY: u8 = 0xB0;
pub const RCB_TRANS_COMPLETE: u8 = 0xC0;
pub const RCB_RTR: u8 = 0xD0;
pub const RCB_SEQ_ERR: u8 = 0xE0;
pub const RCB_GCR: u8 = 0xF0;
pub const RCB_NJF_TIP_COMMAND: u8 = 0xFF;

/// Sub-Record Control Block codes of general control records.
pub const SRCB_SIGNOFF: u8 = 0xC2;
pub const SRCB_INITIAL_SIGNON: u8 = 0xC9;
pub const SRCB_RESP_SIGNON: u8 = 0xD1;
pub const SRCB_RESET_SIGNON: u8 = 0xD2;
pub const SRCB_ACCEPT_SIGNON: u8 = 0xD3;
pub const SRCB_ADD_CONNECTION: u8 = 0xD4;
pub const SRCB_DELETE_CONNECTION: u8 = 0xD5;

/// NJF TIP commands (RCB 0xFF).
const SRCB_CMD_XBZ: u8 = 0x00; // set transmission block size
const SRCB_CMD_ABT: u8 = 0x01; // abort transmitter

/// NJE/TCP data block header.
const TTB_LENGTH: usize = 8;
const TTB_OFF_LENGTH: usize = 2;
const TTR_LENGTH: usize = 4;
const TTR_OFF_LENGTH: usize = 2;

/// NJE/TCP control record layout.
const CR_LENGTH: usize = 33;

/// NAK control record reason codes.
pub const NAK_NO_SUCH_LINK: u8 = 1;
pub const NAK_LINK_ACTIVE: u8 = 2;
pub const NAK_ATTEMPTING_ACTIVE_OPEN: u8 = 3;
pub const NAK_TEMPORARY_FAILURE: u8 = 4;

/// Control record types, in EBCDIC.
const CR_TYPE_ACK: [u8; 8] = [0xC1, 0xC3, 0xD2, 0x40, 0x40, 0x40, 0x40, 0x40];
const CR_TYPE_OPEN: [u8; 8] = [0xD6, 0xD7, 0xC5, 0xD5, 0x40, 0x40, 0x40, 0x40];
const CR_TYPE_NAK: [u8; 8] = [0xD5, 0xC1, 0xD2, 0x40, 0x40, 0x40, 0x40, 0x40];

/// Canned NJE/TCP blocks.
const DLE_ACK0: [u8; 18] = [
	0x00, 0x00, 0x00, 0x12, 0x00, 0x00, 0x00, 0x00, // TTB
	0x00, 0x00, 0x00, 0x02, // TTR
	DLE, ACK0, // data
	0x00, 0x00, 0x00, 0x00, // TTREOB
];
const EMPTY_BLOCK: [u8; 12] = [
	0x00, 0x00, 0x00, 0x0C, 0x00, 0x00, 0x00, 0x00, // TTB
	0x00, 0x00, 0x00, 0x00, // TTR
];
const SOH_ENQ: [u8; 18] = [
	0x00, 0x00, 0x00, 0x12, 0x00, 0x00, 0x00, 0x00, // TTB
	0x00, 0x00, 0x00, 0x02, // TTR
	SOH, ENQ, // data
	0x00, 0x00, 0x00, 0x00, // TTREOB
];

/// NAM messages whose appearance downline means NJF went away.
const FAILURE_MESSAGES: [&[u8]; 4] = [
	b"APPLICATION FAILED.",
	b"APPLICATION NOT PRESENT.",
	b"APPLICATION BUSY",
	b"LOGGED OUT.",
];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NjeState {
	Disconnected,
	RcvOpen,
	RcvSohEnq,
	SndOpen,
	RcvAck,
	RcvSignon,
	RcvRespSignon,
	ExchangeData,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Upload {
	Ok,
	Nothing,
	SohEnq,
	SynNak,
	DleAck0,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum NjeErr {
	BlockTooShort,
	BlockTooLong,
	BadLeader,
	BadBcb,
	BadBsn,
	BadFcs,
	BadRcb,
	BadScb,
	TooManyRetries,
	ProtocolError,
}

/// NJE sub-state of a PCB.
pub struct NjePcb {
	pub state: NjeState,
	pub is_passive: bool,
	pub tcb: Option<u8>,
	/// Downline (to the peer) BCB count; 0xFF means the next leader
	/// carries a reset-sequence BCB.
	pub downline_bsn: u8,
	/// Upline (from the peer) BCB count.
	pub upline_bsn: u8,
	pub last_rcb: u8,
	pub last_srcb: u8,
	pub retries: u8,
	pub ping_interval: u32,
	pub last_xmit: Option<Instant>,
	/// Configured maximum NJE/TCP block size.
	pub block_size: usize,
	/// Maximum record size, renegotiated during signon (CMDXBZ).
	pub max_record_size: usize,
	pub local_ip: u32,
	pub remote_ip: u32,
	/// Raw TCP accumulation.
	pub input: Vec<u8>,
	/// Downline output staging (TTB/TTR framed).
	pub out: Vec<u8>,
	/// Position of the open TTR in `out`.
	pub ttr_at: Option<usize>,
	pub upline_q: Queue,
}

impl NjePcb {
	pub fn new(block_size: usize, ping_interval: u32, local_ip: u32, remote_ip: u32) -> Self {
		Self {
			state: NjeState::Disconnected,
			is_passive: false,
			tcb: None,
			downline_bsn: 0xFF,
			upline_bsn: 0x0F,
			last_rcb: 0,
			last_srcb: 0,
			retries: 0,
			ping_interval,
			last_xmit: None,
			block_size,
			max_record_size: 1024,
			local_ip,
			remote_ip,
			input: Vec::new(),
			out: Vec::new(),
			ttr_at: None,
			upline_q: Queue::default(),
		}
	}
}

/// Decode one SCB-compressed record, up to and including its terminating
/// 0x00 SCB. Returns the expanded record and the number of input bytes
/// consumed.
pub fn scb_decode(data: &[u8]) -> utils::error::Result<(Vec<u8>, usize)> {
	let mut out = Vec::new();
	let mut i = 0;

	loop {
		let Some(&scb) = data.get(i) else { return Err(()) };
		i += 1;

		if scb == 0x00 {
			return Ok((out, i));
		}

		match scb & 0xC0 {
			0x40 => {} // terminate stream transmission
			0x80 => {
				let n = (scb & 0x1F) as usize;
				if scb & 0x20 != 0 {
					// Compressed run of a repeated character.
					let Some(&ch) = data.get(i) else { return Err(()) };
					i += 1;
					out.extend(std::iter::repeat(ch).take(n));
				} else {
					// Compressed run of blanks.
					out.extend(std::iter::repeat(EBCDIC_BLANK).take(n));
				}
			}
			0xC0 => {
				let n = (scb & 0x3F) as usize;
				if i + n > data.len() {
					return Err(());
				}
				out.extend_from_slice(&data[i..i + n]);
				i += n;
			}
			_ => return Err(()),
		}
	}
}

/// Encode a record as SCB strings: literal substrings of up to 63 bytes,
/// closed by the end-of-record SCB.
pub fn scb_encode(data: &[u8], out: &mut Vec<u8>) {
	for chunk in data.chunks(63) {
		out.push(0xC0 | chunk.len() as u8);
		out.extend_from_slice(chunk);
	}
	out.push(0x00);
}

/// RCBs whose records are SCB-compressed strings.
fn is_scb_rcb(rcb: u8) -> bool {
	match rcb & 0x0F {
		// SYSIN and SYSOUT stream records.
		0x08 | 0x09 => rcb >= 0x98,
		// Stream control records.
		0x00 => matches!(rcb, RCB_RTI | RCB_PTI | RCB_TRANS_COMPLETE | RCB_RTR | RCB_SEQ_ERR),
		// Command or message record.
		0x0A => rcb == 0x9A,
		_ => false,
	}
}

enum Collect {
	Incomplete,
	TooLong,
	Complete { block: Vec<u8>, consumed: usize },
}

/// Collect one complete NJE/TCP block from accumulated input, compressing
/// out the TTB and TTRs.
fn collect_block(input: &[u8], max: usize) -> Collect {
	if input.len() < TTB_LENGTH {
		return Collect::Incomplete;
	}

	let size = (input[TTB_OFF_LENGTH] as usize) << 8 | input[TTB_OFF_LENGTH + 1] as usize;
	if size > max {
		return Collect::TooLong;
	}
	if input.len() < size {
		return Collect::Incomplete;
	}

	let mut block = Vec::with_capacity(size);
	let mut dp = TTB_LENGTH;
	while dp + TTR_LENGTH < size {
		let mut rec_len = (input[dp + TTR_OFF_LENGTH] as usize) << 8 | input[dp + TTR_OFF_LENGTH + 1] as usize;
		dp += TTR_LENGTH;
		while dp < size && rec_len > 0 {
			block.push(input[dp]);
			dp += 1;
			rec_len -= 1;
		}
	}

	Collect::Complete { block, consumed: size }
}

fn nje_controls(npu: &mut Npu, port: u8) -> Option<&mut NjePcb> {
	match &mut npu.net.pcbs[port as usize].controls {
		crate::net::PortControls::Nje(n) => Some(n),
		_ => None,
	}
}

impl Npu {
	fn nje_find_tcb(&mut self, port: u8) -> Option<u8> {
		let cached = nje_controls(self, port).and_then(|c| c.tcb);

		if let Some(cn) = cached {
			let tcb = &self.tcbs[cn];
			if tcb.state != TermState::Idle && tcb.port == port {
				return Some(cn);
			}
		}

		let found = (1..MAX_TCBS as u8).find(|&cn| {
			let t = &self.tcbs[cn];
			t.state != TermState::Idle && t.port == port
		});

		if let Some(ctl) = nje_controls(self, port) {
			ctl.tcb = found;
		}

		found
	}

	pub(crate) fn nje_notify_net_connect(&mut self, port: u8, passive: bool, now: Instant) -> bool {
		self.nje_reset_pcb(port);

		let Some(ctl) = nje_controls(self, port) else { return false };
		if passive {
			ctl.is_passive = true;
			ctl.state = NjeState::RcvOpen;
		} else {
			ctl.state = NjeState::SndOpen;
		}
		ctl.last_xmit = Some(now);

		true
	}

	pub(crate) fn nje_notify_net_disconnect(&mut self, port: u8, now: Instant) {
		self.nje_close_connection(port, now);
	}

	pub(crate) fn nje_notify_term_connect(&mut self, cn: u8) {
		let port = self.tcbs[cn].port;
		if self.net.pcbs[port as usize].link.is_open() {
			self.tcbs[cn].upline_block_limit = self.tcbs[cn].params.upline_block_limit;
		} else {
			// The network connection went away while the terminal was
			// being connected.
			self.svm_send_disc_request(cn);
		}
	}

	pub(crate) fn nje_notify_term_disconnect(&mut self, _cn: u8) {}

	pub(crate) fn nje_reset_pcb(&mut self, port: u8) {
		let tcb = self.nje_find_tcb(port);

		let Npu { net, pool, tcbs, .. } = self;
		let crate::net::PortControls::Nje(ctl) = &mut net.pcbs[port as usize].controls else {
			return;
		};

		ctl.state = NjeState::Disconnected;
		ctl.tcb = None;
		ctl.is_passive = false;
		ctl.downline_bsn = 0xFF;
		ctl.upline_bsn = 0x0F;
		ctl.last_rcb = 0;
		ctl.last_srcb = 0;
		ctl.retries = 0;
		ctl.last_xmit = None;
		ctl.input.clear();
		ctl.out.clear();
		ctl.ttr_at = None;
		ctl.upline_q.release_all(pool);

		if let Some(cn) = tcb {
			tcbs[cn].output_q.release_all(pool);
		}
	}

	fn nje_close_connection(&mut self, port: u8, now: Instant) {
		match self.nje_find_tcb(port) {
			Some(cn) if self.tcbs[cn].state != TermState::Idle => self.svm_send_disc_request(cn),
			_ => self.close_pcb(port, now),
		}
	}

	/// Consume bytes arriving on an NJE link.
	pub(crate) fn nje_process_upline(&mut self, mut port: u8, data: &[u8], now: Instant) {
		{
			let Some(ctl) = nje_controls(self, port) else { return };
			if ctl.input.len() + data.len() > ctl.block_size * 2 + CR_LENGTH {
				warn!("NJE input overflow on port {port}, data discarded");
				return;
			}
			ctl.input.extend_from_slice(data);
		}

		loop {
			let Some(ctl) = nje_controls(self, port) else { return };
			if ctl.input.is_empty() {
				return;
			}

			match ctl.state {
				NjeState::Disconnected => {
					ctl.input.clear();
					return;
				}

				NjeState::RcvOpen => {
					if ctl.input.len() < CR_LENGTH {
						return;
					}
					if ctl.input[..8] != CR_TYPE_OPEN {
						warn!("Expecting OPEN on port {port}");
						self.nje_close_connection(port, now);
						return;
					}

					let cr: Vec<u8> = ctl.input.drain(..CR_LENGTH).collect();
					let (rhost, rip, ohost, oip, _r) = parse_control_record(&cr[8..]);

					match self.nje_handle_open(port, &rhost, rip, &ohost, oip, now) {
						Some(new_port) => port = new_port,
						None => return,
					}
				}

				NjeState::SndOpen => {
					// Waiting for try_output to send our OPEN; hold input.
					return;
				}

				NjeState::RcvAck => {
					if ctl.input.len() < CR_LENGTH {
						return;
					}
					let cr: Vec<u8> = ctl.input.drain(..CR_LENGTH).collect();

					if cr[..8] == CR_TYPE_ACK {
						if self.nje_send_raw(port, &SOH_ENQ, now) && self.nje_connect_terminal(port) {
							// NJF answers the connection with an initial
							// signon, so the peer's response signon follows.
							if let Some(ctl) = nje_controls(self, port) {
								ctl.state = NjeState::RcvRespSignon;
							}
						} else {
							self.nje_close_connection(port, now);
							return;
						}
					} else if cr[..8] == CR_TYPE_NAK {
						let (.., r) = parse_control_record(&cr[8..]);
						warn!("OPEN request denied on port {port}, reason {r}");
						self.nje_close_connection(port, now);
						// Attempt reconnection after a short random delay.
						let delay = Duration::from_secs(rand::thread_rng().gen_range(3..8));
						if let Some(idx) = self.net.pcbs[port as usize].ncb {
							self.net.ncbs[idx].next_attempt = Some(now + delay);
						}
						return;
					} else {
						warn!("Expecting ACK or NAK on port {port}");
						self.nje_close_connection(port, now);
						return;
					}
				}

				NjeState::RcvSohEnq
				| NjeState::RcvSignon
				| NjeState::RcvRespSignon
				| NjeState::ExchangeData => {
					let state = ctl.state;
					let max = ctl.block_size;
					let (block, consumed) = match collect_block(&ctl.input, max) {
						Collect::Incomplete => return,
						Collect::TooLong => {
							warn!("NJE block exceeds configured max block size on port {port}");
							self.nje_close_connection(port, now);
							return;
						}
						Collect::Complete { block, consumed } => (block, consumed),
					};
					ctl.input.drain(..consumed);

					match self.nje_upload_block(port, &block) {
						Err(err) => {
							warn!("NJE block error {err:?} on port {port} in state {state:?}");
							self.nje_close_connection(port, now);
							return;
						}
						Ok((status, rcb, srcb)) => {
							if !self.nje_advance_state(port, state, status, rcb, srcb, now) {
								return;
							}
						}
					}
				}
			}
		}
	}

	/// Drive the connection state machine with the outcome of one
	/// uploaded block. Returns false when the connection went down.
	fn nje_advance_state(
		&mut self,
		port: u8,
		state: NjeState,
		status: Upload,
		rcb: u8,
		srcb: u8,
		now: Instant,
	) -> bool {
		match (state, status) {
			(_, Upload::DleAck0) | (_, Upload::Nothing) => true,

			(NjeState::RcvSohEnq, Upload::SohEnq) => {
				if self.nje_send_raw(port, &DLE_ACK0, now) {
					if let Some(ctl) = nje_controls(self, port) {
						ctl.state = NjeState::RcvSignon;
					}
					true
				} else {
					self.nje_close_connection(port, now);
					false
				}
			}

			(NjeState::RcvSohEnq, Upload::SynNak) => {
				if self.nje_send_raw(port, &SOH_ENQ, now) && self.nje_connect_terminal(port) {
					if let Some(ctl) = nje_controls(self, port) {
						ctl.state = NjeState::RcvRespSignon;
					}
					true
				} else {
					self.nje_close_connection(port, now);
					false
				}
			}

			(NjeState::RcvSignon, Upload::Ok) if rcb == RCB_GCR && srcb == SRCB_INITIAL_SIGNON => {
				if let Some(ctl) = nje_controls(self, port) {
					ctl.state = NjeState::ExchangeData;
					info!("Port {port}: enter data exchange, ping interval {}s", ctl.ping_interval);
				}
				true
			}

			(NjeState::RcvRespSignon, Upload::Ok) if rcb == RCB_GCR && srcb == SRCB_RESP_SIGNON => {
				self.nje_queue_net_output(port, &DLE_ACK0);
				if let Some(ctl) = nje_controls(self, port) {
					ctl.state = NjeState::ExchangeData;
				}
				true
			}

			(NjeState::ExchangeData, Upload::Ok) => true,

			_ => {
				warn!("Unexpected NJE element in state {state:?} on port {port}");
				self.nje_close_connection(port, now);
				false
			}
		}
	}

	/// Handle a received OPEN control record: match it to a definition,
	/// answer ACK or NAK, possibly reassigning the socket to the port
	/// that owns the peer. Returns the port now owning the connection.
	fn nje_handle_open(
		&mut self,
		port: u8,
		rhost: &str,
		rip: u32,
		ohost: &str,
		oip: u32,
		now: Instant,
	) -> Option<u8> {
		let mut owner = port;
		let target = self.nje_find_pcb_for_cr(rhost, rip, ohost);
		let mut r = 0;

		match target {
			None => r = NAK_NO_SUCH_LINK,
			Some(t) if t == port => {
				if self.nje_find_tcb(port).is_some() {
					r = NAK_ATTEMPTING_ACTIVE_OPEN;
				}
			}
			Some(t) if self.net.pcbs[t as usize].link.is_open() => {
				warn!("Port {t:02x}: close connection due to active link conflict");
				r = NAK_LINK_ACTIVE;
				self.close_pcb(t, now);
			}
			Some(t) => {
				// Reassign the socket to the port owning the definition.
				info!("Port {port:02x}: connection reassigned to port {t:02x}");
				self.nje_reset_pcb(t);
				let pending: Vec<u8> = match nje_controls(self, port) {
					Some(ctl) => std::mem::take(&mut ctl.input),
					None => Vec::new(),
				};
				let link = self.net.pcbs[port as usize].link.take();
				if let (Some(io), Some(fwds)) = (link.io(), &self.fwds) {
					io.set_route(t as u32, fwds.pcb.clone());
				}
				self.net.pcbs[t as usize].link = link;

				let was_passive = nje_controls(self, port).is_some_and(|c| c.is_passive);
				if let Some(ctl) = nje_controls(self, port) {
					ctl.state = NjeState::Disconnected;
				}
				if let Some(ctl) = nje_controls(self, t) {
					ctl.state = NjeState::RcvOpen;
					ctl.is_passive = was_passive;
					ctl.last_xmit = Some(now);
					ctl.input = pending;
				}
				owner = t;
			}
		}

		if r == 0 {
			if self.nje_connect_terminal(owner) {
				if let Some(ctl) = nje_controls(self, owner) {
					ctl.state = NjeState::RcvSohEnq;
				}
			} else {
				r = NAK_TEMPORARY_FAILURE;
			}
		}

		let cr_type = if r == 0 { CR_TYPE_ACK } else { CR_TYPE_NAK };
		let sent = self.nje_send_control_record(owner, &cr_type, ohost, oip, rhost, rip, r, now);

		if !sent || r != 0 {
			self.nje_close_connection(owner, now);
			return None;
		}

		Some(owner)
	}

	fn nje_connect_terminal(&mut self, port: u8) -> bool {
		if self.nje_find_tcb(port).is_some() {
			warn!("Port {port:02x}: already associated with a TCB");
			return false;
		}
		self.svm_connect_terminal(port)
	}

	fn nje_find_pcb_for_cr(&self, rhost: &str, rip: u32, ohost: &str) -> Option<u8> {
		if !self.net.host_id.eq_ignore_ascii_case(ohost) {
			return None;
		}

		(0..=self.net.max_cla_port).find(|&p| {
			let pcb = &self.net.pcbs[p as usize];
			pcb.ncb.is_some_and(|n| {
				let ncb = &self.net.ncbs[n];
				ncb.conn_type == ConnType::Nje && ncb.host_name.eq_ignore_ascii_case(rhost)
			}) && matches!(&pcb.controls, crate::net::PortControls::Nje(c)
				if c.remote_ip == rip || c.remote_ip == 0)
		})
	}

	/// Send bytes to the peer immediately (handshake traffic).
	fn nje_send_raw(&mut self, port: u8, data: &[u8], now: Instant) -> bool {
		let sent = self.net.pcbs[port as usize].link.send(data);
		if let Some(ctl) = nje_controls(self, port) {
			ctl.last_xmit = Some(now);
		}
		sent == Ok(data.len())
	}

	#[allow(clippy::too_many_arguments)]
	fn nje_send_control_record(
		&mut self,
		port: u8,
		cr_type: &[u8; 8],
		local_name: &str,
		local_ip: u32,
		peer_name: &str,
		peer_ip: u32,
		r: u8,
		now: Instant,
	) -> bool {
		let mut cr = Vec::with_capacity(CR_LENGTH);
		cr.extend_from_slice(cr_type);

		let mut name = [EBCDIC_BLANK; 8];
		utils::ebcdic::encode(&local_name.as_bytes()[..local_name.len().min(8)], &mut name);
		cr.extend_from_slice(&name);
		cr.extend_from_slice(&local_ip.to_be_bytes());

		let mut name = [EBCDIC_BLANK; 8];
		utils::ebcdic::encode(&peer_name.as_bytes()[..peer_name.len().min(8)], &mut name);
		cr.extend_from_slice(&name);
		cr.extend_from_slice(&peer_ip.to_be_bytes());

		cr.push(r);

		self.nje_send_raw(port, &cr, now)
	}

	/// Queue framed bytes on the terminal's output queue.
	fn nje_queue_net_output(&mut self, port: u8, data: &[u8]) {
		let Some(cn) = self.nje_find_tcb(port) else { return };
		let Npu { pool, tcbs, .. } = self;
		queue_output(pool, &mut tcbs[cn], data);
	}

	/// Parse an uploaded (de-framed) block: validate its BSC leader, BCB
	/// and FCS, decompress its records and queue them upline to NJF.
	fn nje_upload_block(
		&mut self,
		port: u8,
		block: &[u8],
	) -> core::result::Result<(Upload, u8, u8), NjeErr> {
		let payload_limit = MAX_UPLINE_BLOCK_SIZE - OFF_DATA;
		let mut uploads: Vec<(u8, Vec<u8>)> = Vec::new();
		let mut current: Vec<u8> = Vec::new();
		let mut rcb = 0;
		let mut srcb = 0;
		let mut ibp = 0;
		let mut is_retransmission = false;

		let ctl = nje_controls(self, port).ok_or(NjeErr::ProtocolError)?;

		while ibp < block.len() {
			let len = block.len() - ibp;
			if len < 2 {
				return Err(NjeErr::BlockTooShort);
			}
			match (block[ibp], block[ibp + 1]) {
				(SOH, ENQ) => return Ok((Upload::SohEnq, 0, 0)),
				(SYN, NAK) => return Ok((Upload::SynNak, 0, 0)),
				(DLE, ACK0) => return Ok((Upload::DleAck0, 0, 0)),
				(DLE, STX) => {}
				(DLE, _) => return Err(NjeErr::BadLeader),
				_ => return Err(NjeErr::BadLeader),
			}

			// A protocol block: <DLE><STX> BCB FCS FCS records...
			if len < 7 {
				return Err(NjeErr::BlockTooShort);
			}
			is_retransmission = false;
			ibp += 2;

			let bcb = block[ibp];
			let bsn = bcb & 0x0F;
			match bcb & 0xF0 {
				// Normal block.
				0x80 => {
					if ctl.upline_bsn.wrapping_add(1) & 0x0F == bsn {
						ctl.upline_bsn = bsn;
						ctl.retries = 0;
					} else if ctl.upline_bsn == bsn {
						// Validate the block, then discard it.
						ctl.retries += 1;
						if ctl.retries > MAX_RETRIES {
							return Err(NjeErr::TooManyRetries);
						}
						is_retransmission = true;
					} else {
						warn!(
							"Invalid sequence number in BCB ({bcb:02x}), expected bsn {:02x}",
							ctl.upline_bsn.wrapping_add(1) & 0x0F
						);
						return Err(NjeErr::BadBsn);
					}
				}
				// Bypass sequence count validation.
				0x90 => ctl.retries = 0,
				// Reset sequence count.
				0xA0 => {
					ctl.upline_bsn = bsn.wrapping_sub(1) & 0x0F;
					ctl.retries = 0;
				}
				_ => return Err(NjeErr::BadBcb),
			}

			// FCS bytes must have their high bits set.
			ibp += 1;
			if block[ibp] & 0x80 == 0 || block[ibp + 1] & 0x80 == 0 {
				return Err(NjeErr::BadFcs);
			}
			ibp += 2;

			// Records until the end-of-block RCB.
			while ibp < block.len() {
				if block.len() - ibp < 2 {
					return Err(NjeErr::BlockTooShort);
				}
				rcb = block[ibp];
				srcb = block[ibp + 1];
				ibp += 2;
				let mut block_type = BT_MSG;

				match rcb {
					// General control record: first and only record.
					RCB_GCR => {
						let rec: &[u8] = match srcb {
							SRCB_SIGNOFF => &[],
							SRCB_INITIAL_SIGNON | SRCB_RESP_SIGNON => {
								if !current.is_empty() || !uploads.is_empty() {
									return Err(NjeErr::ProtocolError);
								}
								let rec_len = block.get(ibp).map(|&b| b as usize).unwrap_or(0);
								let rec_len = rec_len.saturating_sub(2);
								if ibp + rec_len > block.len() {
									return Err(NjeErr::BlockTooShort);
								}
								&block[ibp..ibp + rec_len]
							}
							_ => return Err(NjeErr::ProtocolError),
						};

						current.push(rec.len() as u8);
						current.push(rcb);
						current.push(srcb);
						current.extend_from_slice(rec);

						if !is_retransmission {
							uploads.push((BT_MSG, std::mem::take(&mut current)));
						}

						let any = !uploads.is_empty();
						self.nje_queue_uploads(port, uploads);
						return Ok((if any { Upload::Ok } else { Upload::Nothing }, rcb, srcb));
					}

					// SYSIN/SYSOUT data and stream-control records, and
					// command/message records: SCB strings follow.
					r if is_scb_rcb(r) => {
						if matches!(rcb & 0x0F, 0x08 | 0x09) {
							// Data records go up as BLK; control flavors of
							// the SRCB force MSG.
							if srcb & 0xC0 == 0x80 {
								block_type = BT_BLK;
							}
						}

						if ibp >= block.len() {
							return Err(NjeErr::BlockTooShort);
						}

						// Flush accumulated data records before a
						// non-data record.
						if block_type == BT_MSG && !current.is_empty() {
							if !is_retransmission {
								uploads.push((BT_BLK, std::mem::take(&mut current)));
							} else {
								current.clear();
							}
						}

						let (mut decoded, consumed) =
							scb_decode(&block[ibp..]).map_err(|()| NjeErr::BadScb)?;
						ibp += consumed;

						if decoded.is_empty() {
							// End of stream.
							block_type = BT_MSG;
						}
						decoded.truncate(255);

						if current.len() + decoded.len() + 3 > payload_limit && !current.is_empty() {
							if !is_retransmission {
								uploads.push((BT_BLK, std::mem::take(&mut current)));
							} else {
								current.clear();
							}
						}

						current.push(decoded.len() as u8);
						current.push(rcb);
						current.push(srcb);
						current.extend_from_slice(&decoded);

						if block_type == BT_MSG {
							if !is_retransmission {
								uploads.push((BT_MSG, std::mem::take(&mut current)));
							} else {
								current.clear();
							}
						}
					}

					_ => return Err(NjeErr::BadRcb),
				}

				// End-of-block RCB.
				if block.get(ibp) == Some(&0x00) {
					ibp += 1;
					if !current.is_empty() {
						if !is_retransmission {
							uploads.push((BT_BLK, std::mem::take(&mut current)));
						} else {
							current.clear();
						}
					}
					break;
				}
			}
		}

		if !current.is_empty() && !is_retransmission {
			uploads.push((BT_BLK, current));
		}

		let any = !uploads.is_empty();
		self.nje_queue_uploads(port, uploads);

		Ok((if any { Upload::Ok } else { Upload::Nothing }, rcb, srcb))
	}

	/// Wrap parsed records as transparent upline blocks and queue them
	/// for NJF, respecting the terminal's block limit credit.
	fn nje_queue_uploads(&mut self, port: u8, uploads: Vec<(u8, Vec<u8>)>) {
		{
			let Npu { net, pool, .. } = self;
			let crate::net::PortControls::Nje(ctl) = &mut net.pcbs[port as usize].controls else {
				return;
			};

			for (bt, payload) in uploads {
				let mut b = pool.get();
				b.set(&[0, 0, 0, bt, DBC_TRANSPARENT]);
				b.append(&payload);
				ctl.upline_q.append(b);
			}
		}

		self.nje_transmit_queued(port);
	}

	/// Transmit queued upline blocks to NAM while credit remains.
	fn nje_transmit_queued(&mut self, port: u8) {
		let Some(cn) = self.nje_find_tcb(port) else { return };
		if self.tcbs[cn].state != TermState::HostConnected {
			return;
		}

		let Npu { net, bip, tcbs, nodes, .. } = self;
		let crate::net::PortControls::Nje(ctl) = &mut net.pcbs[port as usize].controls else {
			return;
		};
		let tcb = &mut tcbs[cn];

		while tcb.upline_block_limit > 0 {
			let Some(mut b) = ctl.upline_q.extract() else { return };
			b.data[OFF_DN] = nodes.coupler;
			b.data[OFF_SN] = nodes.npu;
			b.data[OFF_CN] = cn;
			b.data[OFF_BTBSN] |= tcb.upline_bsn << SHIFT_BSN;
			tcb.upline_bsn = if tcb.upline_bsn >= 7 { 1 } else { tcb.upline_bsn + 1 };
			tcb.upline_block_limit -= 1;
			bip.request_upline(b);
		}
	}

	/// Process a downline block from NJF.
	pub(crate) fn nje_process_downline(&mut self, cn: u8, buf: Buffer, now: Instant) {
		let port = self.tcbs[cn].port;
		let data = buf.bytes();

		if data.len() <= OFF_DBC {
			self.pool.release(buf);
			return;
		}

		let block_type = bt(data[OFF_BTBSN]);
		let bsn_bits = data[OFF_BTBSN] & (MASK_BSN << SHIFT_BSN);
		let dbc = data[OFF_DBC];
		let payload = data[OFF_DATA..].to_vec();
		self.pool.release(buf);

		if dbc & DBC_TRANSPARENT != 0 {
			let ok = self.nje_append_records(port, &payload, block_type);
			tip::notify_sent(&mut self.pool, &mut self.bip, self.nodes, cn, bsn_bits);
			if ok.is_err() {
				self.nje_close_connection(port, now);
			}
			self.nje_try_output(port, now);
			return;
		}

		// Non-transparent blocks carry NAM console text. Records run from
		// a format effector to <US>; failure notices close the link.
		let mut dp = 0;
		while dp < payload.len() {
			let start = dp;
			while dp < payload.len() && payload[dp] != 0x1F {
				dp += 1;
			}
			// The record body follows its format effector.
			let record = if start + 1 < dp { &payload[start + 1..dp] } else { &[][..] };
			if FAILURE_MESSAGES.iter().any(|m| record.starts_with(m)) {
				info!("Port {port:02x}: disconnected from NJF");
				tip::notify_sent(&mut self.pool, &mut self.bip, self.nodes, cn, bsn_bits);
				self.nje_close_connection(port, now);
				return;
			}
			dp += 1;
		}

		tip::notify_sent(&mut self.pool, &mut self.bip, self.nodes, cn, bsn_bits);
	}

	/// Append downline records to the framed output staging, flushing
	/// complete NJE/TCP blocks to the network queue.
	fn nje_append_records(
		&mut self,
		port: u8,
		data: &[u8],
		block_type: u8,
	) -> utils::error::Result {
		let mut flushes: Vec<Vec<u8>> = Vec::new();

		{
			let Some(ctl) = nje_controls(self, port) else { return Err(()) };
			let mut bp = 0;

			while bp < data.len() {
				if data.len() - bp < 3 {
					warn!("Truncated downline NJE record on port {port}");
					return Err(());
				}
				let ncc = data[bp] as usize;
				let rcb = data[bp + 1];
				let srcb = data[bp + 2];
				bp += 3;

				if rcb == RCB_NJF_TIP_COMMAND {
					match srcb {
						SRCB_CMD_XBZ => {
							if data.len() - bp < 2 {
								return Err(());
							}
							ctl.max_record_size = (data[bp] as usize) << 8 | data[bp + 1] as usize;
							info!(
								"Port {port:02x}: TIP command, set transmission block size to {}",
								ctl.max_record_size
							);
							bp += 2;
						}
						SRCB_CMD_ABT => {
							info!("Port {port:02x}: TIP command, abort transmitter");
							bp += 2;
						}
						_ => {
							warn!("Port {port:02x}: unrecognized TIP command {srcb:02x}");
							bp = data.len();
						}
					}
					continue;
				}

				// A downline initial signon on a passive connection means
				// NJF is out of step; drop the record.
				if rcb == RCB_GCR && srcb == SRCB_INITIAL_SIGNON && ctl.is_passive {
					warn!("Port {port:02x}: downline initial signon discarded on passive connection");
					return Ok(());
				}

				if bp + ncc > data.len() {
					warn!("Truncated downline NJE record on port {port}");
					return Err(());
				}
				let rec = &data[bp..bp + ncc];
				bp += ncc;

				let max_needed = ncc + 2 + (ncc + 62) / 63 + 1;

				// Flush the block downline when the staging buffer cannot
				// take the record.
				if !ctl.out.is_empty()
					&& ctl.out.len() + max_needed + TTR_LENGTH + 32 > ctl.block_size
				{
					ctl.out.push(0x00); // end of block RCB
					flushes.push(flush_frame(ctl));
				}

				if ctl.out.len() < TTB_LENGTH {
					prepare_output(ctl);
				} else if (ctl.last_rcb != rcb && ctl.last_rcb != 0)
					|| (ctl.last_srcb != srcb && ctl.last_srcb != 0)
				{
					close_downline_block(ctl);
				}

				// Respect the negotiated maximum record size within the
				// current NJE block.
				if let Some(ttr_at) = ctl.ttr_at {
					let block_len = ctl.out.len() - (ttr_at + TTR_LENGTH);
					if block_len + max_needed + 8 > ctl.max_record_size {
						close_downline_block(ctl);
					}
				}

				ctl.out.push(rcb);
				ctl.out.push(srcb);
				ctl.last_rcb = rcb;
				ctl.last_srcb = srcb;

				if rcb == RCB_GCR {
					if matches!(srcb, SRCB_INITIAL_SIGNON | SRCB_RESP_SIGNON) {
						ctl.out.extend_from_slice(rec);
					}
				} else {
					scb_encode(rec, &mut ctl.out);
				}

				if block_type == BT_MSG && bp >= data.len() {
					if rcb != RCB_GCR {
						ctl.out.push(0x00); // end of data RCB
					}
					flushes.push(flush_frame(ctl));
				}
			}
		}

		for frame in flushes {
			self.nje_queue_net_output(port, &frame);
		}

		Ok(())
	}

	/// Send queued output, run handshake and keep-alive timers.
	pub(crate) fn nje_try_output(&mut self, port: u8, now: Instant) {
		let Some(state_info) = nje_controls(self, port).map(|c| (c.state, c.last_xmit, c.ping_interval))
		else {
			return;
		};
		let (state, last_xmit, ping_interval) = state_info;

		match state {
			NjeState::RcvOpen
			| NjeState::RcvSohEnq
			| NjeState::RcvAck
			| NjeState::RcvSignon
			| NjeState::RcvRespSignon => {
				if last_xmit.is_some_and(|t| now.duration_since(t) > MAX_WAIT_TIME) {
					warn!("Timeout in NJE state {state:?} on port {port}");
					self.nje_close_connection(port, now);
					return;
				}
			}

			NjeState::ExchangeData => {
				if ping_interval > 0
					&& last_xmit
						.is_some_and(|t| now.duration_since(t) > Duration::from_secs(ping_interval as u64))
				{
					let idle = self
						.nje_find_tcb(port)
						.is_some_and(|cn| !self.tcbs[cn].output_q.not_empty());
					if idle {
						self.nje_queue_net_output(port, &EMPTY_BLOCK);
						if let Some(ctl) = nje_controls(self, port) {
							ctl.last_xmit = Some(now);
						}
					}
				}
			}

			NjeState::SndOpen => {
				let (host_id, local_ip, remote_ip, peer) = {
					let host_id = self.net.host_id.clone();
					let peer = self.net.pcbs[port as usize]
						.ncb
						.map(|n| self.net.ncbs[n].host_name.clone())
						.unwrap_or_default();
					let Some(ctl) = nje_controls(self, port) else { return };
					(host_id, ctl.local_ip, ctl.remote_ip, peer)
				};

				if self
					.nje_send_control_record(port, &CR_TYPE_OPEN, &host_id, local_ip, &peer, remote_ip, 0, now)
				{
					if let Some(ctl) = nje_controls(self, port) {
						ctl.state = NjeState::RcvAck;
					}
				}
			}

			NjeState::Disconnected => {}
		}

		// Drain the terminal's output queue onto the socket.
		if let Some(cn) = self.nje_find_tcb(port) {
			let Npu { net, pool, tcbs, .. } = self;
			let tcb = &mut tcbs[cn];
			let link = &mut net.pcbs[port as usize].link;
			let mut sent_any = false;

			while let Some(mut b) = tcb.output_q.extract() {
				match link.send(b.unsent()) {
					Ok(n) => {
						b.offset += n;
						sent_any |= n > 0;
						if b.offset >= b.num_bytes {
							pool.release(b);
						} else {
							tcb.output_q.prepend(b);
							link.want_write(true);
							break;
						}
					}
					Err(()) => {
						tcb.output_q.prepend(b);
						break;
					}
				}
			}

			if sent_any {
				if let Some(ctl) = nje_controls(self, port) {
					ctl.last_xmit = Some(now);
				}
			}

			if self.tcbs[cn].state == TermState::HostConnected {
				self.nje_transmit_queued(port);
			}
		}
	}
}

/// Preset the staging buffer with a TTB, a TTR and a block leader.
fn prepare_output(ctl: &mut NjePcb) {
	ctl.out.clear();
	ctl.out.extend_from_slice(&[0; TTB_LENGTH]);
	ctl.ttr_at = Some(ctl.out.len());
	ctl.out.extend_from_slice(&[0; TTR_LENGTH]);
	append_leader(ctl);
	ctl.last_rcb = 0;
	ctl.last_srcb = 0;
}

/// Append the BSC leader: DLE STX BCB FCS FCS.
fn append_leader(ctl: &mut NjePcb) {
	ctl.out.push(DLE);
	ctl.out.push(STX);
	if ctl.downline_bsn == 0xFF {
		ctl.out.push(0xA0); // reset block sequence number
		ctl.downline_bsn = 0;
	} else {
		ctl.out.push(0x80 | ctl.downline_bsn);
		ctl.downline_bsn = (ctl.downline_bsn + 1) & 0x0F;
	}
	ctl.out.push(0x8F); // FCS
	ctl.out.push(0xCF); // FCS
}

/// Record the length of the open TTR.
fn set_ttr_length(ctl: &mut NjePcb) {
	if let Some(at) = ctl.ttr_at {
		let rec_len = ctl.out.len() - (at + TTR_LENGTH);
		ctl.out[at + TTR_OFF_LENGTH] = (rec_len >> 8) as u8;
		ctl.out[at + TTR_OFF_LENGTH + 1] = rec_len as u8;
	}
}

/// Close the current NJE block and open a new TTR + leader after it.
fn close_downline_block(ctl: &mut NjePcb) {
	ctl.out.push(0x00); // end of block RCB
	set_ttr_length(ctl);
	ctl.ttr_at = Some(ctl.out.len());
	ctl.out.extend_from_slice(&[0; TTR_LENGTH]);
	append_leader(ctl);
}

/// Finish the frame: close the TTR, append the end-of-buffer TTR, stamp
/// the TTB length, and hand the bytes back for transmission.
fn flush_frame(ctl: &mut NjePcb) -> Vec<u8> {
	set_ttr_length(ctl);
	ctl.out.extend_from_slice(&[0; TTR_LENGTH]);
	let len = ctl.out.len();
	ctl.out[TTB_OFF_LENGTH] = (len >> 8) as u8;
	ctl.out[TTB_OFF_LENGTH + 1] = len as u8;

	ctl.ttr_at = None;
	ctl.last_rcb = 0;
	ctl.last_srcb = 0;

	std::mem::take(&mut ctl.out)
}

/// Split the RHOST/RIP/OHOST/OIP/R fields of a control record.
fn parse_control_record(cr: &[u8]) -> (String, u32, String, u32, u8) {
	let mut rhost = [0; 8];
	utils::ebcdic::decode(&cr[0..8], &mut rhost);
	let rip = u32::from_be_bytes(cr[8..12].try_into().expect("4 bytes"));
	let mut ohost = [0; 8];
	utils::ebcdic::decode(&cr[12..20], &mut ohost);
	let oip = u32::from_be_bytes(cr[20..24].try_into().expect("4 bytes"));
	let r = cr[24];

	let trim = |b: &[u8]| String::from_utf8_lossy(b).trim_end().to_string();
	(trim(&rhost), rip, trim(&ohost), oip, r)
}

#[cfg(test)]
mod tests {
	use std::time::Instant;

	use super::*;
	use crate::net::{ConnDef, Link};

	fn nje_npu() -> (crate::Npu, std::rc::Rc<std::cell::RefCell<Vec<Vec<u8>>>>, u8) {
		let (mut npu, upline) = crate::test_npu();
		npu.svm.set_ready();

		let mut def = ConnDef::new(175, 20, 1, ConnType::Nje);
		def.host_name = "IBM1".into();
		def.remote_ip = 0x0A000002;
		def.local_ip = 0x0A000001;
		npu.net.register_conn_type(def, Instant::now()).unwrap();
		npu.net.pcbs[20].link = Link::test();

		assert!(npu.nje_notify_net_connect(20, true, Instant::now()));
		(npu, upline, 20)
	}

	fn open_record() -> Vec<u8> {
		let mut cr = Vec::new();
		cr.extend_from_slice(&CR_TYPE_OPEN);
		let mut name = [EBCDIC_BLANK; 8];
		utils::ebcdic::encode(b"IBM1", &mut name);
		cr.extend_from_slice(&name);
		cr.extend_from_slice(&0x0A000002u32.to_be_bytes());
		let mut name = [EBCDIC_BLANK; 8];
		utils::ebcdic::encode(b"CYBER1", &mut name);
		cr.extend_from_slice(&name);
		cr.extend_from_slice(&0x0A000001u32.to_be_bytes());
		cr.push(0);
		cr
	}

	#[test]
	fn scb_round_trips() {
		// Arbitrary bytes survive encode → decode.
		let data: Vec<u8> = (0u16..150).map(|v| (v % 251) as u8).collect();
		let mut encoded = Vec::new();
		scb_encode(&data, &mut encoded);
		let (decoded, used) = scb_decode(&encoded).unwrap();
		assert_eq!(decoded, data);
		assert_eq!(used, encoded.len());

		// Literal streams survive decode → encode.
		let mut stream = Vec::new();
		stream.push(0xC0 | 3);
		stream.extend_from_slice(b"ABC");
		stream.push(0x00);
		let (decoded, _) = scb_decode(&stream).unwrap();
		let mut re = Vec::new();
		scb_encode(&decoded, &mut re);
		assert_eq!(re, stream);

		// Compressed runs expand.
		let (decoded, _) = scb_decode(&[0x80 | 0x20 | 4, 0xC1, 0x00]).unwrap();
		assert_eq!(decoded, vec![0xC1; 4]);
		let (decoded, _) = scb_decode(&[0x80 | 3, 0x00]).unwrap();
		assert_eq!(decoded, vec![EBCDIC_BLANK; 3]);

		// A bad SCB is rejected.
		assert!(scb_decode(&[0x3F, 0x00]).is_err());
	}

	#[test]
	fn open_is_acknowledged() {
		let (mut npu, _upline, port) = nje_npu();

		npu.nje_process_upline(port, &open_record(), Instant::now());

		let sent = npu.test_port_output(port);
		assert_eq!(sent.len(), CR_LENGTH);
		assert_eq!(&sent[..8], &CR_TYPE_ACK);
		// RHOST/OHOST come back swapped: we answer as CYBER1 to IBM1.
		let (rhost, rip, ohost, oip, r) = parse_control_record(&sent[8..]);
		assert_eq!(rhost, "CYBER1");
		assert_eq!(rip, 0x0A000001);
		assert_eq!(ohost, "IBM1");
		assert_eq!(oip, 0x0A000002);
		assert_eq!(r, 0);

		assert!(matches!(npu.test_nje_state(port), NjeState::RcvSohEnq));
	}

	#[test]
	fn open_for_unknown_peer_is_nakked() {
		let (mut npu, _upline, port) = nje_npu();

		let mut cr = open_record();
		// Claim to be an unknown peer.
		let mut name = [EBCDIC_BLANK; 8];
		utils::ebcdic::encode(b"NOBODY", &mut name);
		cr[8..16].copy_from_slice(&name);

		npu.nje_process_upline(port, &cr, Instant::now());

		let sent = npu.test_port_output(port);
		assert_eq!(&sent[..8], &CR_TYPE_NAK);
		assert_eq!(sent[CR_LENGTH - 1], NAK_NO_SUCH_LINK);
	}

	fn frame(records: &[u8], bcb: u8) -> Vec<u8> {
		let mut inner = vec![DLE, STX, bcb, 0x8F, 0xCF];
		inner.extend_from_slice(records);

		let mut f = vec![0, 0, 0, 0, 0, 0, 0, 0];
		f.extend_from_slice(&[0, 0, (inner.len() >> 8) as u8, inner.len() as u8]);
		f.extend_from_slice(&inner);
		f.extend_from_slice(&[0, 0, 0, 0]);
		let len = f.len();
		f[TTB_OFF_LENGTH] = (len >> 8) as u8;
		f[TTB_OFF_LENGTH + 1] = len as u8;
		f
	}

	fn exchange_npu() -> (crate::Npu, std::rc::Rc<std::cell::RefCell<Vec<Vec<u8>>>>, u8, u8) {
		let (mut npu, upline, port) = nje_npu();
		let cn = 0x21;
		npu.test_attach_tcb(cn, port, crate::tip::TipType::Nje);
		npu.tcbs[cn].upline_block_limit = 7;
		if let Some(ctl) = nje_controls(&mut npu, port) {
			ctl.state = NjeState::ExchangeData;
		}
		(npu, upline, port, cn)
	}

	#[test]
	fn command_record_goes_upline() {
		let (mut npu, upline, port, cn) = exchange_npu();

		// A console message record: RCB 0x9A, literal SCB string.
		let mut records = vec![0x9A, 0x80];
		records.push(0xC0 | 5);
		records.extend_from_slice(&[0xC8, 0xC5, 0xD3, 0xD3, 0xD6]); // HELLO
		records.push(0x00); // end of record
		records.push(0x00); // end of block

		npu.nje_process_upline(port, &frame(&records, 0x80), Instant::now());

		let blocks = upline.borrow();
		assert_eq!(blocks.len(), 1);
		let b = &blocks[0];
		assert_eq!(b[OFF_CN], cn);
		assert_eq!(bt(b[OFF_BTBSN]), BT_MSG);
		assert_eq!(b[OFF_DBC], DBC_TRANSPARENT);
		// Record: length, RCB, SRCB, expanded text.
		assert_eq!(&b[OFF_DATA..], &[5, 0x9A, 0x80, 0xC8, 0xC5, 0xD3, 0xD3, 0xD6]);
	}

	#[test]
	fn bcb_wraps_and_retransmissions_are_dropped() {
		let (mut npu, upline, port, _cn) = exchange_npu();

		if let Some(ctl) = nje_controls(&mut npu, port) {
			ctl.upline_bsn = 0x0F;
		}

		let mut records = vec![0x9A, 0x80, 0xC0 | 1, 0xC1, 0x00, 0x00];

		// BCB wraps from 0x0F to 0x00 without complaint.
		npu.nje_process_upline(port, &frame(&records, 0x80), Instant::now());
		assert_eq!(upline.borrow().len(), 1);
		assert!(matches!(npu.test_nje_state(port), NjeState::ExchangeData));

		// The same BSN again is a retransmission: parsed but not uploaded.
		records[3] = 0xC2;
		npu.nje_process_upline(port, &frame(&records, 0x80), Instant::now());
		assert_eq!(upline.borrow().len(), 1);
		assert!(matches!(npu.test_nje_state(port), NjeState::ExchangeData));
	}

	#[test]
	fn downline_records_are_framed_and_compressed() {
		let (mut npu, _upline, port, cn) = exchange_npu();

		// One downline record: ncc, RCB, SRCB, then the record bytes.
		let mut payload = vec![3, 0x99, 0x80];
		payload.extend_from_slice(&[0xC1, 0xC2, 0xC3]);

		let mut blk = vec![1, 2, cn, BT_MSG | 1 << SHIFT_BSN, DBC_TRANSPARENT];
		blk.extend_from_slice(&payload);
		let mut b = npu.pool.get();
		b.set(&blk);
		npu.nje_process_downline(cn, b, Instant::now());

		let sent = npu.test_port_output(port);
		// TTB length covers the whole frame.
		let total = (sent[TTB_OFF_LENGTH] as usize) << 8 | sent[TTB_OFF_LENGTH + 1] as usize;
		assert_eq!(total, sent.len());
		// The leader carries a reset BCB on the first block.
		let rec = &sent[TTB_LENGTH + TTR_LENGTH..];
		assert_eq!(&rec[..5], &[DLE, STX, 0xA0, 0x8F, 0xCF]);
		// RCB, SRCB, then a literal SCB string and terminators.
		assert_eq!(&rec[5..7], &[0x99, 0x80]);
		assert_eq!(rec[7], 0xC0 | 3);
		assert_eq!(&rec[8..11], &[0xC1, 0xC2, 0xC3]);
	}

	#[test]
	fn failure_message_closes_link() {
		let (mut npu, _upline, port, cn) = exchange_npu();

		let mut blk = vec![1, 2, cn, BT_MSG, 0];
		blk.push(b' ');
		blk.extend_from_slice(b"APPLICATION FAILED.  ");
		blk.push(0x1F);
		let mut b = npu.pool.get();
		b.set(&blk);
		npu.nje_process_downline(cn, b, Instant::now());

		// The NPU asked the host to terminate the connection.
		assert_eq!(npu.tcbs[cn].state, TermState::NpuDisconnect);
		let _ = port;
	}
}
