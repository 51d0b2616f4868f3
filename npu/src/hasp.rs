//! HASP TIP: the multileaving spooler protocol spoken by RBF, carried as
//! BSC frames over TCP. One console and a set of stream devices (reader,
//! printer, punch) share each connection; records travel SCB-compressed
//! behind DLE STX leaders with BCB/FCS sequencing, and transparent DLE
//! escapes protect the payload. Reverse HASP dials out instead of
//! listening.

use std::time::{Duration, Instant};

use log::{info, warn};

use crate::block::*;
use crate::buf::Buffer;
use crate::net::queue_output;
use crate::nje::{scb_decode, scb_encode};
use crate::tip::{self, DeviceType, TermState, MAX_TCBS};
use crate::Npu;

/// Retransmitted blocks tolerated before the link is declared broken.
pub const MAX_HASP_RETRIES: u8 = 8;

/// Handshake patience.
pub const HASP_WAIT_TIME: Duration = Duration::from_secs(15);

const SOH: u8 = 0x01;
const STX: u8 = 0x02;
const DLE: u8 = 0x10;
const ETB: u8 = 0x26;
const ENQ: u8 = 0x2D;
const SYN: u8 = 0x32;
const NAK: u8 = 0x3D;
const ACK0: u8 = 0x70;

/// Stream control record codes, shared with the NJE dialect.
const RCB_RTI: u8 = 0x90;
const RCB_PTI: u8 = 0xA0;
const RCB_TRANS_COMPLETE: u8 = 0xC0;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HaspConnState {
	Disconnected,
	/// Passive side: waiting for the peer's SOH ENQ.
	RcvSohEnq,
	/// Reverse HASP: our SOH ENQ is due.
	SndSohEnq,
	/// Reverse HASP: waiting for DLE ACK0.
	RcvAck0,
	ExchangeData,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RecvState {
	/// Between frames: SYNs, control sequences, or a DLE STX leader.
	Idle,
	/// Saw SOH.
	Soh,
	/// Saw DLE outside a frame.
	Dle,
	/// Saw SYN outside a frame.
	Syn,
	/// Collecting frame content.
	Data,
	/// Saw DLE inside a frame.
	DataDle,
}

/// Downline stream progression: data may only flow once the peer has
/// granted permission to initiate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StreamMode {
	Idle,
	RtiSent,
	Active,
}

/// HASP sub-state of a PCB.
pub struct HaspPcb {
	pub state: HaspConnState,
	recv: RecvState,
	/// De-escaped frame under collection.
	block: Vec<u8>,
	pub downline_bsn: u8,
	pub upline_bsn: u8,
	pub retries: u8,
	pub block_size: usize,
	/// Block under assembly toward the peer.
	out: Vec<u8>,
	last_rcb: u8,
	last_srcb: u8,
	/// Downline stream states, indexed by stream number.
	pub streams: [StreamMode; 8],
	pub last_xmit: Option<Instant>,
}

impl HaspPcb {
	pub fn new(block_size: usize) -> Self {
		Self {
			state: HaspConnState::Disconnected,
			recv: RecvState::Idle,
			block: Vec::new(),
			downline_bsn: 0,
			upline_bsn: 0x0F,
			retries: 0,
			block_size,
			out: Vec::new(),
			last_rcb: 0,
			last_srcb: 0,
			streams: [StreamMode::Idle; 8],
			last_xmit: None,
		}
	}
}

/// The RCB identifying a device's data stream.
fn stream_rcb(device: DeviceType, stream: u8) -> u8 {
	let s = stream.clamp(1, 7);
	match device {
		DeviceType::CardReader => 0x80 | s << 4 | 0x08,
		DeviceType::Printer | DeviceType::CardPunch | DeviceType::Plotter => 0x80 | s << 4 | 0x09,
		DeviceType::Console => 0x9A,
	}
}

fn hasp_controls(npu: &mut Npu, port: u8) -> Option<&mut HaspPcb> {
	match &mut npu.net.pcbs[port as usize].controls {
		crate::net::PortControls::Hasp(h) => Some(h),
		_ => None,
	}
}

/// Append payload bytes with BSC transparency: each DLE doubles.
fn push_escaped(out: &mut Vec<u8>, data: &[u8]) {
	for &b in data {
		out.push(b);
		if b == DLE {
			out.push(DLE);
		}
	}
}

impl Npu {
	/// The console TCB of a HASP port.
	fn hasp_find_console(&mut self, port: u8) -> Option<u8> {
		(1..MAX_TCBS as u8).find(|&cn| {
			let t = &self.tcbs[cn];
			t.state != TermState::Idle && t.port == port && t.device_type == DeviceType::Console
		})
	}

	/// The TCB owning the stream a record belongs to.
	fn hasp_find_stream_tcb(&mut self, port: u8, rcb: u8) -> Option<u8> {
		let stream = rcb >> 4 & 7;
		let want_reader = rcb & 0x0F == 0x08;

		if rcb & 0x0F == 0x0A {
			return self.hasp_find_console(port);
		}

		(1..MAX_TCBS as u8)
			.find(|&cn| {
				let t = &self.tcbs[cn];
				t.state != TermState::Idle
					&& t.port == port
					&& t.stream_id & 7 == stream
					&& (t.device_type == DeviceType::CardReader) == want_reader
					&& t.device_type != DeviceType::Console
			})
			.or_else(|| self.hasp_find_console(port))
	}

	pub(crate) fn hasp_notify_net_connect(&mut self, port: u8, passive: bool, now: Instant) -> bool {
		self.hasp_reset_pcb(port);

		let Some(ctl) = hasp_controls(self, port) else { return false };
		ctl.state = if passive { HaspConnState::RcvSohEnq } else { HaspConnState::SndSohEnq };
		ctl.last_xmit = Some(now);

		// The host side comes up right away; the BSC handshake decides
		// when data may flow.
		self.svm_connect_terminal(port)
	}

	pub(crate) fn hasp_notify_net_disconnect(&mut self, port: u8, now: Instant) {
		match self.hasp_find_console(port) {
			Some(cn) => self.svm_send_disc_request(cn),
			None => self.close_pcb(port, now),
		}
	}

	pub(crate) fn hasp_notify_term_connect(&mut self, cn: u8) {
		let port = self.tcbs[cn].port;
		if self.net.pcbs[port as usize].link.is_open() {
			self.tcbs[cn].upline_block_limit = self.tcbs[cn].params.upline_block_limit;
		} else {
			self.svm_send_disc_request(cn);
		}
	}

	pub(crate) fn hasp_notify_term_disconnect(&mut self, _cn: u8) {}

	/// Reset the stream owned by a TCB whose connection is terminating.
	pub(crate) fn hasp_close_stream(&mut self, cn: u8) {
		let port = self.tcbs[cn].port;
		let stream = (self.tcbs[cn].stream_id & 7) as usize;

		self.tcbs[cn].output_q.release_all(&mut self.pool);
		if let Some(ctl) = hasp_controls(self, port) {
			ctl.streams[stream] = StreamMode::Idle;
		}
	}

	pub(crate) fn hasp_reset_pcb(&mut self, port: u8) {
		// Release the queues of every device on this port.
		for cn in 1..MAX_TCBS as u8 {
			if self.tcbs[cn].state != TermState::Idle && self.tcbs[cn].port == port {
				let Npu { tcbs, pool, .. } = self;
				tcbs[cn].output_q.release_all(pool);
			}
		}

		if let Some(ctl) = hasp_controls(self, port) {
			ctl.state = HaspConnState::Disconnected;
			ctl.recv = RecvState::Idle;
			ctl.block.clear();
			ctl.downline_bsn = 0;
			ctl.upline_bsn = 0x0F;
			ctl.retries = 0;
			ctl.out.clear();
			ctl.last_rcb = 0;
			ctl.last_srcb = 0;
			ctl.streams = [StreamMode::Idle; 8];
			ctl.last_xmit = None;
		}
	}

	/// Scan received bytes through the BSC receiver.
	pub(crate) fn hasp_process_upline(&mut self, port: u8, data: &[u8], now: Instant) {
		for &b in data {
			let Some(ctl) = hasp_controls(self, port) else { return };
			ctl.last_xmit = Some(now);

			let recv = ctl.recv;
			match recv {
				RecvState::Idle => match b {
					SYN => ctl.recv = RecvState::Syn,
					SOH => ctl.recv = RecvState::Soh,
					DLE => ctl.recv = RecvState::Dle,
					_ => {}
				},
				RecvState::Syn => {
					// Leading SYNs precede anything; SYN NAK asks for a
					// retransmission of the last block.
					match b {
						NAK => {
							warn!("Port {port:02x}: received SYN NAK");
							ctl.recv = RecvState::Idle;
						}
						SYN => {}
						SOH => ctl.recv = RecvState::Soh,
						DLE => ctl.recv = RecvState::Dle,
						_ => ctl.recv = RecvState::Idle,
					}
				}
				RecvState::Soh => {
					ctl.recv = RecvState::Idle;
					if b == ENQ {
						self.hasp_handle_soh_enq(port, now);
					}
				}
				RecvState::Dle => match b {
					ACK0 => {
						ctl.recv = RecvState::Idle;
						self.hasp_handle_ack0(port, now);
					}
					STX => {
						ctl.block.clear();
						ctl.recv = RecvState::Data;
					}
					_ => {
						warn!("Port {port:02x}: bad BSC leader");
						ctl.recv = RecvState::Idle;
					}
				},
				RecvState::Data => {
					if b == DLE {
						ctl.recv = RecvState::DataDle;
					} else {
						ctl.block.push(b);
					}
				}
				RecvState::DataDle => {
					match b {
						ETB => {
							ctl.recv = RecvState::Idle;
							let block = std::mem::take(&mut ctl.block);
							self.hasp_process_block(port, &block, now);
						}
						_ => {
							// Transparent escape: the byte stands for itself.
							ctl.block.push(b);
							ctl.recv = RecvState::Data;
						}
					}
				}
			}

			let Some(ctl) = hasp_controls(self, port) else { return };
			if ctl.block.len() > ctl.block_size {
				warn!("Port {port:02x}: oversized HASP block");
				self.hasp_abort_connection(port, now);
				return;
			}
		}

		self.hasp_try_output(port, now);
	}

	fn hasp_handle_soh_enq(&mut self, port: u8, now: Instant) {
		let state = match hasp_controls(self, port) {
			Some(ctl) => ctl.state,
			None => return,
		};

		match state {
			HaspConnState::RcvSohEnq | HaspConnState::ExchangeData => {
				if self.net.pcbs[port as usize].link.send(&[DLE, ACK0]) == Ok(2) {
					if let Some(ctl) = hasp_controls(self, port) {
						ctl.state = HaspConnState::ExchangeData;
						ctl.last_xmit = Some(now);
					}
					info!("Port {port:02x}: HASP connection established");
				} else {
					self.hasp_abort_connection(port, now);
				}
			}
			_ => warn!("Port {port:02x}: unexpected SOH ENQ in state {state:?}"),
		}
	}

	fn hasp_handle_ack0(&mut self, port: u8, now: Instant) {
		let state = match hasp_controls(self, port) {
			Some(ctl) => ctl.state,
			None => return,
		};

		if state == HaspConnState::RcvAck0 {
			if let Some(ctl) = hasp_controls(self, port) {
				ctl.state = HaspConnState::ExchangeData;
			}
			info!("Port {port:02x}: reverse HASP connection established");
		}

		// An idle ACK0 is the peer's turn signal; answer with pending
		// output, or with our own ACK0 handled by try_output's pacing.
		self.hasp_try_output(port, now);
	}

	/// Validate and dispatch one de-escaped BSC block.
	fn hasp_process_block(&mut self, port: u8, block: &[u8], now: Instant) {
		if block.is_empty() {
			return;
		}
		if block.len() < 3 {
			warn!("Port {port:02x}: short HASP block");
			self.hasp_abort_connection(port, now);
			return;
		}

		{
			let Some(ctl) = hasp_controls(self, port) else { return };

			let bcb = block[0];
			let bsn = bcb & 0x0F;
			match bcb & 0xF0 {
				0x80 => {
					if ctl.upline_bsn.wrapping_add(1) & 0x0F == bsn {
						ctl.upline_bsn = bsn;
						ctl.retries = 0;
					} else if ctl.upline_bsn == bsn {
						ctl.retries += 1;
						if ctl.retries > MAX_HASP_RETRIES {
							warn!("Port {port:02x}: HASP retransmission limit exceeded");
							self.hasp_abort_connection(port, now);
						}
						return;
					} else {
						warn!("Port {port:02x}: HASP block sequence error ({bcb:02x})");
						self.hasp_abort_connection(port, now);
						return;
					}
				}
				0x90 => ctl.retries = 0,
				0xA0 => {
					ctl.upline_bsn = bsn.wrapping_sub(1) & 0x0F;
					ctl.retries = 0;
				}
				_ => {
					warn!("Port {port:02x}: bad HASP BCB ({bcb:02x})");
					self.hasp_abort_connection(port, now);
					return;
				}
			}

			if block[1] & 0x80 == 0 || block[2] & 0x80 == 0 {
				warn!("Port {port:02x}: bad HASP FCS");
				self.hasp_abort_connection(port, now);
				return;
			}
		}

		// Records follow the leader bytes.
		let mut ibp = 3;
		while ibp < block.len() {
			let rcb = block[ibp];
			if rcb == 0x00 {
				break;
			}
			if ibp + 1 >= block.len() {
				warn!("Port {port:02x}: truncated HASP record");
				self.hasp_abort_connection(port, now);
				return;
			}
			let srcb = block[ibp + 1];
			ibp += 2;

			match rcb & 0x0F {
				// Stream control records carry their SCB terminator too.
				0x00 => {
					let Ok((_, used)) = scb_decode(&block[ibp..]) else {
						self.hasp_abort_connection(port, now);
						return;
					};
					ibp += used;

					match rcb & 0xF0 {
						0x90 => self.hasp_handle_rti(port, srcb),
						0xA0 => self.hasp_handle_pti(port, srcb, now),
						0xC0 => self.hasp_upline_record(port, srcb, srcb, &[], BT_MSG),
						_ => info!("Port {port:02x}: stream control record {rcb:02x}/{srcb:02x}"),
					}
				}

				// Data, console and command records.
				0x08 | 0x09 | 0x0A => {
					let Ok((decoded, used)) = scb_decode(&block[ibp..]) else {
						warn!("Port {port:02x}: bad SCB in HASP record {rcb:02x}");
						self.hasp_abort_connection(port, now);
						return;
					};
					ibp += used;

					let bt = if rcb & 0x0F == 0x0A || srcb & 0xC0 != 0x80 || decoded.is_empty() {
						BT_MSG
					} else {
						BT_BLK
					};
					self.hasp_upline_record(port, rcb, srcb, &decoded, bt);
				}

				_ => {
					warn!("Port {port:02x}: bad HASP RCB ({rcb:02x})");
					self.hasp_abort_connection(port, now);
					return;
				}
			}
		}
	}

	/// The peer asks to start a stream toward us: grant it.
	fn hasp_handle_rti(&mut self, port: u8, stream: u8) {
		info!("Port {port:02x}: request to initiate stream {stream:02x}");
		let record = [RCB_PTI, stream, 0x00];
		self.hasp_queue_block(port, &record);
	}

	/// The peer granted one of our stream requests: open the gate and
	/// flush what the host already queued.
	fn hasp_handle_pti(&mut self, port: u8, stream_rcb_byte: u8, now: Instant) {
		let stream = (stream_rcb_byte >> 4 & 7) as usize;
		if let Some(ctl) = hasp_controls(self, port) {
			ctl.streams[stream] = StreamMode::Active;
		}
		info!("Port {port:02x}: permission to initiate stream {stream}");
		self.hasp_try_output(port, now);
	}

	/// Send a parsed record upline to the TCB owning its stream.
	fn hasp_upline_record(&mut self, port: u8, rcb: u8, srcb: u8, data: &[u8], bt: u8) {
		let Some(cn) = self.hasp_find_stream_tcb(port, rcb) else {
			warn!("Port {port:02x}: record {rcb:02x} for unknown stream");
			return;
		};
		if self.tcbs[cn].state != TermState::HostConnected {
			return;
		}

		let Npu { pool, bip, tcbs, nodes, .. } = self;
		let tcb = &mut tcbs[cn];

		let mut b = pool.get();
		b.set(&[nodes.coupler, nodes.npu, cn, bt, DBC_TRANSPARENT]);
		b.append(&[data.len() as u8, rcb, srcb]);
		b.append(data);
		b.data[OFF_BTBSN] = btbsn(bt, tcb.upline_bsn);
		tcb.upline_bsn = if tcb.upline_bsn >= 7 { 1 } else { tcb.upline_bsn + 1 };
		bip.request_upline(b);
	}

	/// Process a downline block from RBF for one of the port's devices.
	pub(crate) fn hasp_process_downline(&mut self, cn: u8, buf: Buffer, now: Instant) {
		let port = self.tcbs[cn].port;
		let data = buf.bytes();

		if data.len() <= OFF_DBC {
			self.pool.release(buf);
			return;
		}

		let bsn_bits = data[OFF_BTBSN] & (MASK_BSN << SHIFT_BSN);
		let dbc = data[OFF_DBC];
		let payload = data[OFF_DATA..].to_vec();
		self.pool.release(buf);

		let device = self.tcbs[cn].device_type;
		let stream_id = self.tcbs[cn].stream_id;
		let rcb = stream_rcb(device, stream_id);

		if dbc & DBC_TRANSPARENT != 0 {
			// Transparent records travel as (ncc, RCB, SRCB, bytes).
			let mut bp = 0;
			while bp + 3 <= payload.len() {
				let ncc = payload[bp] as usize;
				let rec_rcb = payload[bp + 1];
				let rec_srcb = payload[bp + 2];
				bp += 3;
				if bp + ncc > payload.len() {
					break;
				}
				self.hasp_queue_stream_record(port, rec_rcb, rec_srcb, &payload[bp..bp + ncc]);
				bp += ncc;
			}
		} else {
			// Console text: one record per format-effector-to-US line.
			let mut dp = 0;
			while dp < payload.len() {
				let start = dp + 1; // skip the format effector
				while dp < payload.len() && payload[dp] != 0x1F {
					dp += 1;
				}
				if start <= dp {
					let mut line = Vec::with_capacity(dp - start);
					for &c in &payload[start.min(payload.len())..dp] {
						line.push(utils::ebcdic::to_ebcdic(c));
					}
					self.hasp_queue_stream_record(port, rcb, 0x80, &line);
				}
				dp += 1;
			}
		}

		tip::notify_sent(&mut self.pool, &mut self.bip, self.nodes, cn, bsn_bits);
		self.hasp_try_output(port, now);
	}

	/// Append a record to the block under assembly, opening the stream
	/// with an RTI first when the peer has not yet granted it.
	fn hasp_queue_stream_record(&mut self, port: u8, rcb: u8, srcb: u8, data: &[u8]) {
		// Console and control records flow without permission; data
		// streams need an RTI/PTI exchange first.
		if matches!(rcb & 0x0F, 0x08 | 0x09) {
			let stream = (rcb >> 4 & 7) as usize;
			let mode = match hasp_controls(self, port) {
				Some(ctl) => ctl.streams[stream],
				None => return,
			};
			match mode {
				StreamMode::Idle => {
					if let Some(ctl) = hasp_controls(self, port) {
						ctl.streams[stream] = StreamMode::RtiSent;
					}
					let rti = [RCB_RTI, rcb, 0x00];
					self.hasp_queue_block(port, &rti);
				}
				StreamMode::RtiSent | StreamMode::Active => {}
			}
		}

		let Some(ctl) = hasp_controls(self, port) else { return };
		let mut record = Vec::with_capacity(data.len() + 8);
		record.push(rcb);
		record.push(srcb);
		scb_encode(data, &mut record);
		ctl.out.extend_from_slice(&record);
	}

	/// Frame a complete record group and queue it for the wire.
	fn hasp_queue_block(&mut self, port: u8, records: &[u8]) {
		let Some(cn) = self.hasp_find_console(port) else { return };

		let frame = {
			let Some(ctl) = hasp_controls(self, port) else { return };
			let mut frame = Vec::with_capacity(records.len() + 8);
			frame.push(DLE);
			frame.push(STX);
			frame.push(0x80 | ctl.downline_bsn);
			ctl.downline_bsn = (ctl.downline_bsn + 1) & 0x0F;
			frame.push(0x8F);
			frame.push(0xCF);
			push_escaped(&mut frame, records);
			frame.push(0x00); // end of block RCB
			frame.push(DLE);
			frame.push(ETB);
			frame
		};

		let Npu { pool, tcbs, .. } = self;
		queue_output(pool, &mut tcbs[cn], &frame);
	}

	/// Flush assembled records and drain the console output queue.
	pub(crate) fn hasp_try_output(&mut self, port: u8, now: Instant) {
		let state = match hasp_controls(self, port) {
			Some(ctl) => ctl.state,
			None => return,
		};

		match state {
			HaspConnState::Disconnected => return,

			HaspConnState::SndSohEnq => {
				if self.net.pcbs[port as usize].link.send(&[SOH, ENQ]) == Ok(2) {
					if let Some(ctl) = hasp_controls(self, port) {
						ctl.state = HaspConnState::RcvAck0;
						ctl.last_xmit = Some(now);
					}
				}
				return;
			}

			HaspConnState::RcvSohEnq | HaspConnState::RcvAck0 => {
				let stale = hasp_controls(self, port)
					.and_then(|c| c.last_xmit)
					.is_some_and(|t| now.duration_since(t) > HASP_WAIT_TIME);
				if stale {
					warn!("Port {port:02x}: timeout establishing HASP connection");
					self.hasp_abort_connection(port, now);
				}
				return;
			}

			HaspConnState::ExchangeData => {}
		}

		// Close out the block under assembly, gated on stream permission:
		// records for unpermitted streams stay queued in `out`.
		let pending = match hasp_controls(self, port) {
			Some(ctl) => {
				let blocked = ctl
					.streams
					.iter()
					.any(|&s| s == StreamMode::RtiSent);
				if !ctl.out.is_empty() && !blocked {
					Some(std::mem::take(&mut ctl.out))
				} else {
					None
				}
			}
			None => None,
		};
		if let Some(records) = pending {
			self.hasp_queue_block(port, &records);
		}

		// Drain the console queue onto the socket, honoring flow control.
		let Some(cn) = self.hasp_find_console(port) else { return };

		let Npu { pool, bip, tcbs, net, nodes, .. } = self;
		let tcb = &mut tcbs[cn];
		if tcb.xoff {
			return;
		}
		let link = &mut net.pcbs[port as usize].link;

		while let Some(mut b) = tcb.output_q.extract() {
			let taken = if b.num_bytes > b.offset {
				match link.send(b.unsent()) {
					Ok(n) => n,
					Err(()) => {
						tcb.output_q.prepend(b);
						return;
					}
				}
			} else {
				0
			};

			b.offset += taken;

			if b.offset >= b.num_bytes {
				if b.block_seq_no != 0 {
					tip::notify_sent(pool, bip, *nodes, cn, b.block_seq_no);
				}
				pool.release(b);
			} else {
				tcb.output_q.prepend(b);
				link.want_write(true);
				return;
			}
		}
	}

	fn hasp_abort_connection(&mut self, port: u8, now: Instant) {
		match self.hasp_find_console(port) {
			Some(cn) => self.svm_send_disc_request(cn),
			None => self.close_pcb(port, now),
		}
		if let Some(ctl) = hasp_controls(self, port) {
			ctl.state = HaspConnState::Disconnected;
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Instant;

	use super::*;
	use crate::net::{ConnDef, ConnType, Link};
	use crate::tip::TipType;

	fn hasp_npu() -> (crate::Npu, std::rc::Rc<std::cell::RefCell<Vec<Vec<u8>>>>, u8, u8) {
		let (mut npu, upline) = crate::test_npu();
		npu.svm.set_ready();

		let mut def = ConnDef::new(2552, 30, 1, ConnType::Hasp);
		def.host_name = "RJE1".into();
		npu.net.register_conn_type(def, Instant::now()).unwrap();
		npu.net.pcbs[30].link = Link::test();

		// Console terminal attached and connected.
		let cn = 0x31;
		npu.test_attach_tcb(cn, 30, TipType::Hasp);
		npu.tcbs[cn].upline_block_limit = 7;

		if let Some(ctl) = hasp_controls(&mut npu, 30) {
			ctl.state = HaspConnState::RcvSohEnq;
		}

		(npu, upline, 30, cn)
	}

	#[test]
	fn soh_enq_is_acknowledged() {
		let (mut npu, _upline, port, _cn) = hasp_npu();

		npu.hasp_process_upline(port, &[SYN, SYN, SOH, ENQ], Instant::now());

		assert_eq!(npu.test_port_output(port), &[DLE, ACK0]);
		let state = hasp_controls(&mut npu, port).unwrap().state;
		assert_eq!(state, HaspConnState::ExchangeData);
	}

	fn establish(npu: &mut crate::Npu, port: u8) {
		npu.hasp_process_upline(port, &[SOH, ENQ], Instant::now());
		npu.test_clear_port_output(port);
	}

	#[test]
	fn console_record_goes_upline() {
		let (mut npu, upline, port, cn) = hasp_npu();
		establish(&mut npu, port);

		// Console message: RCB 0x9A, data SRCB, literal text, DLE-escaped
		// frame with BCB 0x80 (first after reset at 0x0F).
		let mut records = vec![0x9A, 0x80, 0xC0 | 2, 0xC8, 0xC9, 0x00, 0x00];
		let mut frame = vec![DLE, STX, 0x80, 0x8F, 0xCF];
		frame.append(&mut records);
		frame.extend_from_slice(&[DLE, ETB]);

		npu.hasp_process_upline(port, &frame, Instant::now());

		let blocks = upline.borrow();
		assert_eq!(blocks.len(), 1);
		let b = &blocks[0];
		assert_eq!(b[OFF_CN], cn);
		assert_eq!(b[OFF_DBC], DBC_TRANSPARENT);
		assert_eq!(&b[OFF_DATA..], &[2, 0x9A, 0x80, 0xC8, 0xC9]);
	}

	#[test]
	fn dle_escapes_are_stripped() {
		let (mut npu, upline, port, _cn) = hasp_npu();
		establish(&mut npu, port);

		// The record text contains a DLE, doubled on the wire.
		let mut frame = vec![DLE, STX, 0x80, 0x8F, 0xCF];
		frame.extend_from_slice(&[0x9A, 0x80, 0xC0 | 2, DLE, DLE, 0xC1, 0x00, 0x00]);
		frame.extend_from_slice(&[DLE, ETB]);

		npu.hasp_process_upline(port, &frame, Instant::now());

		let blocks = upline.borrow();
		assert_eq!(&blocks[0][OFF_DATA..], &[2, 0x9A, 0x80, DLE, 0xC1]);
	}

	#[test]
	fn printer_stream_requests_permission() {
		let (mut npu, _upline, port, _console) = hasp_npu();
		establish(&mut npu, port);

		// A printer device on stream 1.
		let pr = 0x32;
		npu.test_attach_tcb(pr, port, TipType::Hasp);
		npu.tcbs[pr].device_type = DeviceType::Printer;
		npu.tcbs[pr].stream_id = 1;

		// Downline transparent record for the printer.
		let mut blk = vec![1, 2, pr, BT_MSG | 1 << SHIFT_BSN, DBC_TRANSPARENT];
		blk.extend_from_slice(&[3, 0x99, 0x80, 0xC1, 0xC2, 0xC3]);
		let mut b = npu.pool.get();
		b.set(&blk);
		npu.hasp_process_downline(pr, b, Instant::now());

		// Only the RTI went out; the data waits for permission.
		let sent = npu.test_port_output(port).to_vec();
		assert_eq!(&sent[..2], &[DLE, STX]);
		assert!(sent.windows(2).any(|w| w == [RCB_RTI, 0x99]));
		assert!(!sent.windows(3).any(|w| w == [0xC1, 0xC2, 0xC3]));
		npu.test_clear_port_output(port);

		// Permission arrives: the data is framed and sent.
		let mut frame = vec![DLE, STX, 0x80, 0x8F, 0xCF];
		frame.extend_from_slice(&[RCB_PTI, 0x99, 0x00, 0x00]);
		frame.extend_from_slice(&[DLE, ETB]);
		npu.hasp_process_upline(port, &frame, Instant::now());

		let sent = npu.test_port_output(port).to_vec();
		assert!(sent.windows(5).any(|w| w == [0x99, 0x80, 0xC0 | 3, 0xC1, 0xC2]));
	}

	#[test]
	fn retransmission_is_discarded() {
		let (mut npu, upline, port, _cn) = hasp_npu();
		establish(&mut npu, port);

		let mut frame = vec![DLE, STX, 0x80, 0x8F, 0xCF];
		frame.extend_from_slice(&[0x9A, 0x80, 0xC0 | 1, 0xC1, 0x00, 0x00]);
		frame.extend_from_slice(&[DLE, ETB]);

		npu.hasp_process_upline(port, &frame, Instant::now());
		assert_eq!(upline.borrow().len(), 1);

		// The same BSN again is parsed but not uploaded.
		npu.hasp_process_upline(port, &frame, Instant::now());
		assert_eq!(upline.borrow().len(), 1);
	}
}
