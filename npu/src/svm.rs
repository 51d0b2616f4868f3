//! Service Message protocol: the supervisory dialogue with the host.
//! Regulation and supervision bring the NPU up; terminal configure /
//! connect / terminate messages manage the lifecycle of every terminal
//! connection on behalf of the TIPs.

use std::time::Instant;

use log::warn;

use crate::block::*;
use crate::buf::Buffer;
use crate::tip::{self, DeviceType, TermState, TipType};
use crate::{Nodes, Npu};

/// Primary service message function codes.
pub const PFC_REG: u8 = 0x1; // logical link regulation
pub const PFC_ICN: u8 = 0x2; // initiate connection
pub const PFC_TCN: u8 = 0x3; // terminate connection
pub const PFC_CHC: u8 = 0x4; // change terminal characteristics
pub const PFC_NPU: u8 = 0xA; // initialize npu
pub const PFC_SUP: u8 = 0xE; // initiate supervision
pub const PFC_CNF: u8 = 0xF; // configure terminal
pub const PFC_NPS: u8 = 0x12; // npu status request

/// Secondary service message function codes.
pub const SFC_NP: u8 = 0x0; // npu
pub const SFC_LL: u8 = 0x1; // logical link
pub const SFC_TE: u8 = 0x3; // terminal
pub const SFC_TA: u8 = 0x8; // terminate connection
pub const SFC_IN: u8 = 0xA; // initiate supervision

/// Response and error markers OR-ed into the SFC.
pub const SFC_RESP: u8 = 0x80;
pub const SFC_ERR: u8 = 0x40;

/// Regulation level bit masks.
pub const REG_LVL_BUFFERS: u8 = 0x03;
pub const REG_LVL_CS_AVAILABLE: u8 = 0x04;
pub const REG_LVL_NS_AVAILABLE: u8 = 0x08;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SvmState {
	Idle,
	WaitSupervision,
	Ready,
}

pub struct Svm {
	state: SvmState,
	old_reg_level: u8,
}

impl Svm {
	pub fn new() -> Self {
		Self {
			state: SvmState::Idle,
			old_reg_level: 0,
		}
	}

	pub fn reset(&mut self) {
		self.state = SvmState::Idle;
		self.old_reg_level = 0;
	}

	/// Whether the host has agreed to supervise us and network connection
	/// attempts may proceed.
	pub fn is_ready(&self) -> bool {
		self.state == SvmState::Ready
	}

	pub(crate) fn set_ready(&mut self) {
		self.state = SvmState::Ready;
	}
}

fn link_regulation(nodes: Nodes, level: u8) -> [u8; 14] {
	[
		nodes.coupler,
		nodes.npu,
		0,
		BT_CMD,
		PFC_REG,
		SFC_LL,
		level,
		0, 0, 0, 0, 0, 0, 0,
	]
}

fn request_supervision(nodes: Nodes) -> [u8; 21] {
	[
		nodes.coupler,
		nodes.npu,
		0,        // CN
		BT_CMD,
		PFC_SUP,
		SFC_IN,
		0,        // PS
		0,        // PL
		0,        // RI
		0, 0, 0,  // not used
		3,        // CCP version
		1,        // ...
		0,        // CCP level
		0,        // ...
		0,        // CCP cycle or variant
		0,        // ...
		0,        // not used
		0, 0,     // NCF version in NDL file (ignored)
	]
}

fn response_npu_status(nodes: Nodes) -> [u8; 6] {
	[nodes.coupler, nodes.npu, 0, BT_CMD, PFC_NPS, SFC_NP | SFC_RESP]
}

fn terminate_connection(nodes: Nodes, cn: u8, response: bool) -> [u8; 7] {
	[
		nodes.coupler,
		nodes.npu,
		0,
		BT_CMD,
		PFC_TCN,
		if response { SFC_TA | SFC_RESP } else { SFC_TA },
		cn,
	]
}

impl Npu {
	/// Order word: the host announced a new regulation level. Echo a link
	/// regulation block on each change, and request supervision once the
	/// CS becomes available.
	pub fn notify_host_regulation(&mut self, level: u8) {
		let Npu { pool, bip, svm, nodes, .. } = self;

		if svm.state == SvmState::Idle || level != svm.old_reg_level {
			svm.old_reg_level = level;
			bip.request_upline_canned(pool, &link_regulation(*nodes, level));
		}

		if svm.state == SvmState::Idle && level & REG_LVL_CS_AVAILABLE != 0 {
			bip.request_upline_canned(pool, &request_supervision(*nodes));
			svm.state = SvmState::WaitSupervision;
		}
	}

	/// Start the host connection sequence for a port whose network
	/// connection just came up.
	pub(crate) fn svm_connect_terminal(&mut self, port: u8) -> bool {
		self.svm_request_terminal_config(port)
	}

	/// Process a service message block from the host.
	pub(crate) fn svm_process_buffer(&mut self, buf: Buffer, now: Instant) {
		if buf.num_bytes <= OFF_SFC {
			if buf.num_bytes == OFF_BTBSN + 1 && buf.data[OFF_CN] != 0 {
				// NAM sends input acknowledgements as 4-byte service
				// messages; the TIP knows what to do with them.
				self.tip_process_buffer(buf, 0, now);
				return;
			}

			warn!("Short service message in state {:?}", self.svm.state);
			self.pool.release(buf);
			return;
		}

		let msg = buf.bytes().to_vec();
		self.pool.release(buf);

		let pfc = msg[OFF_PFC];
		let sfc = msg[OFF_SFC];

		// The CN field of the header is zero for every service message;
		// the real connection number, if any, travels in P3.
		if msg[OFF_CN] != 0 {
			warn!(
				"Connection number is {} but must be zero in service message {pfc:02x}/{sfc:02x}",
				msg[OFF_CN]
			);
			return;
		}

		let cn = if matches!(pfc, PFC_ICN | PFC_TCN) {
			if msg.len() <= OFF_P3 {
				warn!("Service message {pfc:02x}/{sfc:02x} is too short and has no required P3");
				return;
			}
			let cn = msg[OFF_P3];
			match self.tcbs.find_for_cn(cn) {
				Some(cn) => cn,
				None => {
					warn!("Unexpected connection number {cn} in message {pfc:02x}/{sfc:02x}");
					return;
				}
			}
		} else {
			0
		};

		match pfc {
			PFC_SUP => {
				if sfc == SFC_IN | SFC_RESP {
					if self.svm.state != SvmState::WaitSupervision {
						warn!("Unexpected supervision reply in state {:?}", self.svm.state);
						return;
					}
					// The host has agreed to supervise us; we are now ready
					// to handle network connection attempts.
					self.svm.state = SvmState::Ready;
				} else {
					warn!("Unexpected message {pfc:02x}/{sfc:02x} in state {:?}", self.svm.state);
				}
			}

			PFC_NPS => {
				if sfc == SFC_NP {
					let status = response_npu_status(self.nodes);
					self.bip.request_upline_canned(&mut self.pool, &status);
				} else {
					warn!("Unexpected message {pfc:02x}/{sfc:02x} in state {:?}", self.svm.state);
				}
			}

			PFC_CNF => {
				if msg.len() <= OFF_P3 {
					warn!("Service message {pfc:02x}/{sfc:02x} is too short and has no required P3");
					return;
				}
				let cla_port = msg[OFF_P3];

				if sfc == SFC_TE | SFC_RESP {
					match self.svm_process_terminal_config(cla_port, &msg) {
						Some(cn) => {
							if self.svm_request_terminal_connection(cn) {
								self.tcbs[cn].state = TermState::RequestConnection;
							} else {
								self.close_pcb(cla_port, now);
								self.tcbs[cn].state = TermState::Idle;
							}
						}
						None => self.close_pcb(cla_port, now),
					}
				} else if sfc == SFC_TE | SFC_ERR {
					// This port is unknown to the host.
					warn!("Terminal on port {cla_port} not configured");
					self.close_pcb(cla_port, now);
				} else {
					warn!("Unexpected message {pfc:02x}/{sfc:02x} with port {cla_port}");
					self.close_pcb(cla_port, now);
				}
			}

			PFC_ICN => {
				if self.tcbs[cn].state != TermState::RequestConnection {
					warn!(
						"Unexpected terminal connection reply in state {:?}",
						self.tcbs[cn].state
					);
					return;
				}

				if sfc == SFC_TE | SFC_RESP {
					self.tcbs[cn].state = TermState::HostConnected;
					self.notify_term_connect(cn);
					self.net_connected(cn);
				} else if sfc == SFC_TE | SFC_ERR {
					warn!(
						"Terminal connection rejected - reason {:02x}",
						msg.get(OFF_P4).copied().unwrap_or(0)
					);
					self.tcbs[cn].state = TermState::Idle;
					self.net_disconnected(cn, now);
				} else {
					warn!("Unexpected message {pfc:02x}/{sfc:02x} with CN {cn}");
					self.tcbs[cn].state = TermState::Idle;
					self.net_disconnected(cn, now);
				}
			}

			PFC_TCN => {
				if sfc == SFC_TA {
					// Host-initiated termination.
					self.tip_terminate_connection(cn, now);
				} else if sfc == SFC_TA | SFC_RESP {
					if self.tcbs[cn].state == TermState::NpuDisconnect {
						// HASP streams are torn down with their console.
						if matches!(self.tcbs[cn].tip_type, TipType::Hasp | TipType::RevHasp) {
							self.hasp_close_stream(cn);
						}
						self.tcbs[cn].state = TermState::Idle;
						self.tcbs.set_max_cn(cn);

						// Once no terminal remains on the port, the network
						// connection goes too.
						let port = self.tcbs[cn].port;
						if self.tcbs.find_for_port(port).is_none() {
							self.close_pcb(port, now);
						}
					}
				} else {
					warn!("Unexpected message {pfc:02x}/{sfc:02x} with CN {cn}");
				}
			}

			_ => warn!("Unrecognized service message {pfc:02x}/{sfc:02x}"),
		}
	}

	/// Send a TCN/TA/R to request termination of a connection, discarding
	/// whatever output is still pending.
	pub(crate) fn svm_send_disc_request(&mut self, cn: u8) {
		let Npu { pool, bip, tcbs, nodes, .. } = self;
		let tcb = &mut tcbs[cn];

		tcb.xoff = false;
		tip::discard_output_q(tcb, pool);
		bip.request_upline_canned(pool, &terminate_connection(*nodes, cn, false));
		tcb.state = TermState::NpuDisconnect;
	}

	/// Notify the owning TIP of a host-initiated termination.
	pub(crate) fn svm_disc_request_terminal(&mut self, cn: u8) {
		let state = self.tcbs[cn].state;
		if matches!(
			state,
			TermState::Configure | TermState::RequestConnection | TermState::HostConnected
		) {
			self.notify_term_disconnect(cn);
		} else {
			self.tcbs[cn].state = TermState::Idle;
			self.tcbs.set_max_cn(cn);
		}
	}

	/// Send a TCN/TA/N acknowledging the host's termination request.
	pub(crate) fn svm_disc_reply_terminal(&mut self, cn: u8) {
		let msg = terminate_connection(self.nodes, cn, true);
		self.bip.request_upline_canned(&mut self.pool, &msg);
	}

	fn notify_term_connect(&mut self, cn: u8) {
		match self.tcbs[cn].tip_type {
			TipType::Async => self.async_notify_term_connect(cn),
			TipType::Hasp | TipType::RevHasp => self.hasp_notify_term_connect(cn),
			TipType::Nje => self.nje_notify_term_connect(cn),
		}
	}

	fn notify_term_disconnect(&mut self, cn: u8) {
		match self.tcbs[cn].tip_type {
			TipType::Async => self.async_notify_term_disconnect(cn),
			TipType::Hasp | TipType::RevHasp => self.hasp_notify_term_disconnect(cn),
			TipType::Nje => self.nje_notify_term_disconnect(cn),
		}
	}

	/// Ask the host to configure the terminal on a CLA port.
	fn svm_request_terminal_config(&mut self, port: u8) -> bool {
		let Some(conn_type) = self.net.conn_type(port) else {
			warn!("Terminal configuration requested for unregistered port {port}");
			return false;
		};
		let Some(tip_type) = conn_type.tip_type() else {
			return false;
		};

		let msg = [
			self.nodes.coupler,
			self.nodes.npu,
			0,
			BT_CMD,
			PFC_CNF,
			SFC_TE,
			port, // CLA port from the "PORT=" parameter in the NDL source
			0,    // sub-port number, always 0 for async ports
			tip_type.code() << 3, // no auto recognition; TIP type; speed range 0
		];
		self.bip.request_upline_canned(&mut self.pool, &msg);

		true
	}

	/// Process a terminal configuration reply and populate a fresh TCB.
	fn svm_process_terminal_config(&mut self, cla_port: u8, msg: &[u8]) -> Option<u8> {
		if self.net.find_pcb(cla_port).is_none() {
			warn!("PCB not found for port {cla_port}");
			return None;
		}

		if !self.net.pcbs[cla_port as usize].link.is_open() {
			warn!("No TCB allocated for port {cla_port}: network connection is closed");
			return None;
		}

		let Some(cn) = self.tcbs.find_free() else {
			warn!("No free TCB available for port {cla_port}");
			return None;
		};

		// P3 onward: port, sub-port, two address bytes, device type,
		// sub-TIP, terminal name, class, status, last response, code set.
		let fixed = OFF_P3 + 6 + 7 + 4;
		if msg.len() < fixed {
			warn!("Short terminal configuration response with length {}", msg.len());
			return None;
		}

		let sub_tip = msg[OFF_P3 + 5];
		let device_type = DeviceType::from_u8(msg[OFF_P3 + 4]);
		let stream_id = msg[OFF_P3 + 3];
		let status = msg[fixed - 3];
		let code_set = msg[fixed - 1];
		let term_class = msg[fixed - 4];
		let mut term_name = [0; 7];
		term_name.copy_from_slice(&msg[OFF_P3 + 6..OFF_P3 + 13]);

		let tip_type = self.net.conn_type(cla_port).and_then(|ct| ct.tip_type());
		let Some(tip_type) = tip_type else {
			warn!("Invalid connection type for terminal configuration on port {cla_port}");
			return None;
		};

		let tcb = self.tcbs.reset_slot(cn);
		tcb.port = cla_port;
		tcb.tip_type = tip_type;
		tcb.enabled = status == 0;
		tcb.term_name = term_name;
		tcb.device_type = device_type;
		tcb.stream_id = stream_id;
		tcb.sub_tip = sub_tip;
		tcb.code_set = code_set;

		let Some(console) = self.svm_find_owning_console(cn) else {
			warn!(
				"Failed to find owning console for port {cla_port} ({})",
				String::from_utf8_lossy(&term_name)
			);
			return None;
		};

		let tcb = &mut self.tcbs[cn];
		tcb.owning_console = console;
		tip::setup_terminal_class(&mut tcb.params, term_class);
		tip::parse_fn_fv(&msg[fixed..], &mut tcb.params);
		tcb.break_pending = false;
		tip::input_reset(tcb, self.nodes);

		tcb.state = TermState::Configure;
		self.tcbs.set_max_cn(cn);

		Some(cn)
	}

	/// The owning console of an async terminal is itself; a HASP or NJE
	/// stream device belongs to the first console on its CLA port.
	fn svm_find_owning_console(&self, cn: u8) -> Option<u8> {
		let tcb = &self.tcbs[cn];

		if tcb.tip_type == TipType::Async || tcb.device_type == DeviceType::Console {
			return Some(cn);
		}

		let port = tcb.port;
		(1..=self.tcbs.max_cn).find(|&c| {
			let t = &self.tcbs[c];
			t.state != TermState::Idle && t.port == port && t.device_type == DeviceType::Console
		})
	}

	/// Send the terminal connection request for a freshly configured TCB.
	fn svm_request_terminal_connection(&mut self, cn: u8) -> bool {
		let Npu { pool, bip, tcbs, nodes, .. } = self;
		let tcb = &tcbs[cn];
		let p = &tcb.params;

		let mut msg = Vec::with_capacity(48);
		msg.extend_from_slice(&[
			nodes.coupler,
			nodes.npu,
			0,
			BT_CMD,
			PFC_ICN,
			SFC_TE,
			cn,
			p.tc,
			p.page_length,
			p.page_width,
			tcb.device_type.code(),
			p.downline_block_limit,
		]);
		msg.extend_from_slice(&tcb.term_name);
		msg.extend_from_slice(&[
			p.app_block_limit,
			(p.downline_block_size >> 8) as u8,
			p.downline_block_size as u8,
			0, // auto login indicator
			p.device_ordinal,
			(p.upline_block_size >> 8) as u8,
			p.upline_block_size as u8,
			p.sub_device_type,
		]);
		msg.extend_from_slice(&tcbs[tcb.owning_console].term_name);
		msg.extend_from_slice(&[
			7, // security level
			p.priority,
			if tcb.tip_type == TipType::Hasp { p.interactive_capability } else { 0 },
			p.echoplex as u8,
			1, // upline block size
			1, // hardwired indicator
			0, // fill
			0, // VTP level
			0, // calling DTE address length
			0, // called DTE address length
		]);

		bip.request_upline_canned(pool, &msg);

		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::net::{ConnDef, ConnType, Link};

	#[test]
	fn regulation_handshake() {
		let (mut npu, upline) = crate::test_npu();

		npu.notify_host_regulation(0x0C);

		{
			let blocks = upline.borrow();
			assert_eq!(blocks.len(), 2);

			let reg = &blocks[0];
			assert_eq!(reg[OFF_DN], 1);
			assert_eq!(reg[OFF_SN], 2);
			assert_eq!(reg[OFF_CN], 0);
			assert_eq!(reg[OFF_BTBSN], BT_CMD);
			assert_eq!(reg[OFF_PFC], PFC_REG);
			assert_eq!(reg[OFF_SFC], SFC_LL);
			assert_eq!(reg[OFF_P3], 0x0C);

			let sup = &blocks[1];
			assert_eq!(sup[OFF_PFC], PFC_SUP);
			assert_eq!(sup[OFF_SFC], SFC_IN);
			assert_eq!(sup[12], 3, "CCP version");
			assert_eq!(sup[13], 1);
		}

		assert!(!npu.svm.is_ready());

		// Supervision reply downline makes the NPU ready.
		npu.notify_service_message();
		npu.process_downline_block(&[1, 2, 0, BT_CMD, PFC_SUP, SFC_IN | SFC_RESP]);
		assert!(npu.svm.is_ready());

		// A repeated regulation level is not echoed again.
		let count = upline.borrow().len();
		npu.notify_host_regulation(0x0C);
		assert_eq!(upline.borrow().len(), count);
	}

	#[test]
	fn terminal_configuration_allocates_tcb() {
		let (mut npu, upline) = crate::test_npu();
		npu.svm.set_ready();

		npu.net
			.register_conn_type(ConnDef::new(6610, 5, 1, ConnType::Telnet), Instant::now())
			.unwrap();
		npu.net.pcbs[5].link = Link::test();

		assert!(npu.svm_connect_terminal(5));
		{
			let blocks = upline.borrow();
			let cnf = blocks.last().unwrap();
			assert_eq!(cnf[OFF_PFC], PFC_CNF);
			assert_eq!(cnf[OFF_SFC], SFC_TE);
			assert_eq!(cnf[OFF_P3], 5);
			assert_eq!(cnf[8], 1 << 3, "async TIP type");
		}

		// Host replies with the terminal configuration.
		let mut reply = vec![2, 1, 0, BT_CMD, PFC_CNF, SFC_TE | SFC_RESP];
		reply.extend_from_slice(&[5, 0, 0, 0, 0, 0]); // port, sub-port, addrs, console, sub-tip
		reply.extend_from_slice(b"TERM01 ");
		reply.extend_from_slice(&[crate::tip::TC_X364, 0, 0, 0]);
		let mut b = npu.pool.get();
		b.set(&reply);
		npu.svm_process_buffer(b, Instant::now());

		let cn = npu.tcbs.max_cn;
		assert_ne!(cn, 0);
		assert_eq!(npu.tcbs[cn].state, TermState::RequestConnection);
		assert_eq!(npu.tcbs[cn].port, 5);
		assert_eq!(&npu.tcbs[cn].term_name, b"TERM01 ");

		// The connection request went upline with the terminal's name.
		{
			let blocks = upline.borrow();
			let icn = blocks.last().unwrap();
			assert_eq!(icn[OFF_PFC], PFC_ICN);
			assert_eq!(icn[OFF_P3], cn);
			assert_eq!(&icn[12..19], b"TERM01 ");
		}

		// Host accepts; the terminal is connected.
		let mut b = npu.pool.get();
		b.set(&[2, 1, 0, BT_CMD, PFC_ICN, SFC_TE | SFC_RESP, cn]);
		npu.svm_process_buffer(b, Instant::now());
		assert_eq!(npu.tcbs[cn].state, TermState::HostConnected);
	}

	#[test]
	fn host_disconnect_round_trip() {
		let (mut npu, upline) = crate::test_npu();
		let port = npu.test_async_port(0x15);
		let _ = port;

		// Host-initiated TCN/TA: the TIP is notified and we reply TA/N.
		let mut b = npu.pool.get();
		b.set(&[2, 1, 0, BT_CMD, PFC_TCN, SFC_TA, 0x15]);
		npu.svm_process_buffer(b, Instant::now());

		let blocks = upline.borrow();
		let reply = blocks.last().unwrap();
		assert_eq!(reply[OFF_PFC], PFC_TCN);
		assert_eq!(reply[OFF_SFC], SFC_TA | SFC_RESP);
		assert_eq!(reply[OFF_P3], 0x15);
		drop(blocks);
		assert_eq!(npu.tcbs[0x15].state, TermState::Idle);

		// NPU-initiated disconnect emits TCN/TA/R and parks the TCB until
		// the host acknowledges.
		let (mut npu, upline) = crate::test_npu();
		npu.test_async_port(0x16);
		npu.svm_send_disc_request(0x16);
		assert_eq!(npu.tcbs[0x16].state, TermState::NpuDisconnect);
		{
			let blocks = upline.borrow();
			let req = blocks.last().unwrap();
			assert_eq!(req[OFF_SFC], SFC_TA);
			assert_eq!(req[OFF_P3], 0x16);
		}

		let mut b = npu.pool.get();
		b.set(&[2, 1, 0, BT_CMD, PFC_TCN, SFC_TA | SFC_RESP, 0x16]);
		npu.svm_process_buffer(b, Instant::now());
		assert_eq!(npu.tcbs[0x16].state, TermState::Idle);
		assert_eq!(npu.tcbs.max_cn, 0);
	}
}
