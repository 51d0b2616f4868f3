//! Terminal Interface Protocol: the TCB table, per-terminal parameters
//! negotiated through FN/FV pairs, terminal-class defaults, upline input
//! assembly, and block acknowledgements.

use std::ops::{Index, IndexMut};
use std::time::Instant;

use log::warn;

use crate::bip::Bip;
use crate::block::*;
use crate::buf::{Buffer, Pool, Queue, MAX_BUFFER};
use crate::{Nodes, Npu};

/// Size of the TCB table; connection numbers are 1..MAX_TCBS-1.
pub const MAX_TCBS: usize = 128;

/// Upline interactive data unit. A full input buffer is forced upline
/// once `block_factor` of these have accumulated.
pub const MAX_IVT_DATA: usize = 100;

/// TIP types as configured in the host's NDL. The HASP variants must not
/// be renumbered: the host dispatches on these exact sub-TIP values.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TipType {
	Async,
	Hasp,
	RevHasp,
	Nje,
}

impl TipType {
	pub fn code(self) -> u8 {
		match self {
			TipType::Async => 1,
			TipType::Hasp => 4,
			TipType::RevHasp => 12,
			TipType::Nje => 13,
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceType {
	Console,
	CardReader,
	Printer,
	CardPunch,
	Plotter,
}

impl DeviceType {
	pub fn from_u8(v: u8) -> Self {
		match v {
			1 => DeviceType::CardReader,
			2 => DeviceType::Printer,
			3 => DeviceType::CardPunch,
			4 => DeviceType::Plotter,
			_ => DeviceType::Console,
		}
	}

	pub fn code(self) -> u8 {
		match self {
			DeviceType::Console => 0,
			DeviceType::CardReader => 1,
			DeviceType::Printer => 2,
			DeviceType::CardPunch => 3,
			DeviceType::Plotter => 4,
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TermState {
	Idle,
	Configure,
	RequestConnection,
	HostConnected,
	NpuDisconnect,
}

/// Terminal classes.
pub const TC_M33: u8 = 1;
pub const TC_713: u8 = 2;
pub const TC_721: u8 = 3;
pub const TC_2741: u8 = 4;
pub const TC_M40: u8 = 5;
pub const TC_H2000: u8 = 6;
pub const TC_X364: u8 = 7;
pub const TC_HASP: u8 = 9;

/// FN codes of the FN/FV parameter pairs trailing configuration and
/// characteristics messages.
pub mod fnfv {
	pub const ABORT_BLOCK: u8 = 0x29;
	pub const BLOCK_FACTOR: u8 = 0x2A;
	pub const BREAK_AS_USER: u8 = 0x2B;
	pub const BS: u8 = 0x2C;
	pub const USER_BREAK_1: u8 = 0x2D;
	pub const USER_BREAK_2: u8 = 0x2E;
	pub const ENA_X_USER_BREAK: u8 = 0x2F;
	pub const CI: u8 = 0x30;
	pub const CN: u8 = 0x31;
	pub const CURSOR_POS: u8 = 0x32;
	pub const CT: u8 = 0x33;
	pub const X_CHAR_FLAG: u8 = 0x34;
	pub const X_CNT_HI: u8 = 0x35;
	pub const X_CNT_LO: u8 = 0x36;
	pub const X_CHAR: u8 = 0x37;
	pub const X_TIMEOUT: u8 = 0x38;
	pub const X_MODE_MULTIPLE: u8 = 0x39;
	pub const EOB: u8 = 0x3A;
	pub const EOB_TERM: u8 = 0x3B;
	pub const EOB_CURSOR_POS: u8 = 0x3C;
	pub const EOL: u8 = 0x3D;
	pub const EOL_TERM: u8 = 0x3E;
	pub const EOL_CURSOR_POS: u8 = 0x3F;
	pub const ECHOPLEX: u8 = 0x40;
	pub const FULL_ASCII: u8 = 0x41;
	pub const IN_FLOW_CONTROL: u8 = 0x42;
	pub const X_INPUT: u8 = 0x43;
	pub const INPUT_DEVICE: u8 = 0x44;
	pub const LI: u8 = 0x45;
	pub const OUT_FLOW_CONTROL: u8 = 0x47;
	pub const PG: u8 = 0x48;
	pub const PL: u8 = 0x49;
	pub const PW: u8 = 0x4A;
	pub const SPECIAL_EDIT: u8 = 0x4D;
	pub const TC: u8 = 0x4E;
	pub const X_STICKY_TIMEOUT: u8 = 0x4F;
	pub const DBL: u8 = 0x54;
	pub const DBZ_HI: u8 = 0x55;
	pub const DBZ_LO: u8 = 0x56;
	pub const ABL: u8 = 0x57;
	pub const UBL: u8 = 0x58;
	pub const UBZ_HI: u8 = 0x59;
	pub const UBZ_LO: u8 = 0x5A;
	pub const DO: u8 = 0x5B;
	pub const SDT: u8 = 0x5C;
	pub const PRIORITY: u8 = 0x5D;
	pub const RIC: u8 = 0x5E;
}

/// Operating parameters of one terminal, preset from its terminal class
/// and overridden by FN/FV pairs.
#[derive(Clone)]
pub struct TermParams {
	pub tc: u8,
	pub page_length: u8,
	pub page_width: u8,
	pub downline_block_limit: u8,
	pub app_block_limit: u8,
	pub downline_block_size: u16,
	pub upline_block_size: u16,
	pub upline_block_limit: u8,
	pub device_ordinal: u8,
	pub sub_device_type: u8,
	pub priority: u8,
	pub interactive_capability: u8,
	pub echoplex: bool,
	pub cursor_pos: bool,
	/// EOL cursor positioning: 0 none, 1 CR, 2 LF, 3 CR+LF.
	pub eol_cursor_pos: u8,
	pub eol: u8,
	pub bs: u8,
	pub cancel: u8,
	pub user_break_1: u8,
	pub user_break_2: u8,
	pub out_flow_control: bool,
	pub in_flow_control: bool,
	pub full_ascii: bool,
	pub special_edit: bool,
	pub block_factor: u8,
	pub x_input: bool,
	pub x_char_flag: bool,
	pub x_char: u8,
	pub x_cnt: u16,
	pub x_timeout: bool,
	pub x_sticky_timeout: bool,
	pub x_mode_multiple: bool,
	pub x_user_break_enabled: bool,
}

impl Default for TermParams {
	fn default() -> Self {
		Self {
			tc: TC_X364,
			page_length: 24,
			page_width: 80,
			downline_block_limit: 2,
			app_block_limit: 2,
			downline_block_size: 2000,
			upline_block_size: 100,
			upline_block_limit: 7,
			device_ordinal: 0,
			sub_device_type: 0,
			priority: 1,
			interactive_capability: 0,
			echoplex: true,
			cursor_pos: true,
			eol_cursor_pos: 3,
			eol: 0x0D,
			bs: 0x08,
			cancel: 0x18,
			user_break_1: 0x10,
			user_break_2: 0x14,
			out_flow_control: true,
			in_flow_control: true,
			full_ascii: false,
			special_edit: false,
			block_factor: 1,
			x_input: false,
			x_char_flag: false,
			x_char: 0,
			x_cnt: 0,
			x_timeout: false,
			x_sticky_timeout: false,
			x_mode_multiple: false,
			x_user_break_enabled: false,
		}
	}
}

/// Preset the operating parameters for a terminal class.
pub fn setup_terminal_class(params: &mut TermParams, tc: u8) {
	*params = TermParams::default();
	params.tc = tc;

	match tc {
		TC_M33 => {
			params.page_length = 0;
			params.page_width = 72;
		}
		TC_713 => {
			params.page_length = 0;
		}
		TC_721 => {
			params.page_length = 30;
		}
		TC_2741 => {
			params.echoplex = false;
		}
		TC_M40 | TC_H2000 | TC_X364 => {}
		TC_HASP => {
			params.echoplex = false;
			params.cursor_pos = false;
			params.out_flow_control = false;
			params.block_factor = 4;
			params.downline_block_size = 640;
			params.upline_block_size = 640;
		}
		_ => {}
	}
}

/// One terminal connection.
pub struct Tcb {
	pub cn: u8,
	pub state: TermState,
	/// CLA port of the supporting PCB.
	pub port: u8,
	pub tip_type: TipType,
	pub device_type: DeviceType,
	pub sub_tip: u8,
	pub stream_id: u8,
	pub code_set: u8,
	pub enabled: bool,
	pub term_name: [u8; 7],
	/// CN of the owning console: itself for async terminals, the console
	/// device on the same CLA port for HASP/NJE stream devices.
	pub owning_console: u8,
	pub upline_bsn: u8,
	pub upline_block_limit: u8,
	pub break_pending: bool,
	pub xoff: bool,
	pub last_op_was_input: bool,
	pub dbc_no_echoplex: bool,
	pub dbc_no_cursor_pos: bool,
	/// Start of the transparent-input forwarding timeout, when running.
	pub x_timer: Option<Instant>,
	/// Upline block under assembly, including its 5-byte header.
	pub in_buf: Vec<u8>,
	pub params: TermParams,
	pub output_q: Queue,
}

impl Tcb {
	fn new(cn: u8) -> Self {
		Self {
			cn,
			state: TermState::Idle,
			port: 0,
			tip_type: TipType::Async,
			device_type: DeviceType::Console,
			sub_tip: 0,
			stream_id: 0,
			code_set: 0,
			enabled: false,
			term_name: [b' '; 7],
			owning_console: 0,
			upline_bsn: 1,
			upline_block_limit: 0,
			break_pending: false,
			xoff: false,
			last_op_was_input: false,
			dbc_no_echoplex: false,
			dbc_no_cursor_pos: false,
			x_timer: None,
			in_buf: Vec::with_capacity(MAX_BUFFER),
			params: TermParams::default(),
			output_q: Queue::default(),
		}
	}

	/// Bytes of input currently assembled, excluding the block header.
	pub fn input_len(&self) -> usize {
		self.in_buf.len().saturating_sub(OFF_DATA)
	}
}

pub struct TcbTable {
	tcbs: Vec<Tcb>,
	/// Highest CN with a non-idle TCB, or 0.
	pub max_cn: u8,
}

impl Index<u8> for TcbTable {
	type Output = Tcb;

	fn index(&self, cn: u8) -> &Tcb {
		&self.tcbs[cn as usize]
	}
}

impl IndexMut<u8> for TcbTable {
	fn index_mut(&mut self, cn: u8) -> &mut Tcb {
		&mut self.tcbs[cn as usize]
	}
}

impl TcbTable {
	pub fn new() -> Self {
		Self {
			tcbs: (0..MAX_TCBS as u8).map(Tcb::new).collect(),
			max_cn: 0,
		}
	}

	/// The CN of a free slot, if any.
	pub fn find_free(&self) -> Option<u8> {
		(1..MAX_TCBS as u8).find(|&cn| self.tcbs[cn as usize].state == TermState::Idle)
	}

	/// Validate a CN arriving in a message and resolve it to an in-use TCB.
	pub fn find_for_cn(&self, cn: u8) -> Option<u8> {
		let tcb = self.tcbs.get(cn as usize)?;
		(cn != 0 && tcb.state != TermState::Idle).then_some(cn)
	}

	/// Find the active TCB supported by a CLA port. HASP ports carry
	/// several; this returns the first, which the caller may refine.
	pub fn find_for_port(&self, port: u8) -> Option<u8> {
		(1..=self.max_cn).find(|&cn| {
			let t = &self.tcbs[cn as usize];
			t.state != TermState::Idle && t.port == port
		})
	}

	/// Reset a slot for a fresh configuration, keeping only its CN.
	pub fn reset_slot(&mut self, cn: u8) -> &mut Tcb {
		self.tcbs[cn as usize] = Tcb::new(cn);
		&mut self.tcbs[cn as usize]
	}

	/// Track the highest active connection number after `cn` changed state.
	pub fn set_max_cn(&mut self, cn: u8) {
		if self.tcbs[cn as usize].state == TermState::Idle && cn >= self.max_cn {
			self.max_cn = (1..=cn)
				.rev()
				.find(|&c| self.tcbs[c as usize].state != TermState::Idle)
				.unwrap_or(0);
		} else if cn > self.max_cn {
			self.max_cn = cn;
		}
	}
}

/// Parse an FN/FV byte-pair stream into a terminal's parameters.
pub fn parse_fn_fv(data: &[u8], params: &mut TermParams) {
	let mut it = data.chunks_exact(2);

	for pair in &mut it {
		let (fn_, fv) = (pair[0], pair[1]);
		match fn_ {
			fnfv::BLOCK_FACTOR => params.block_factor = fv.max(1),
			fnfv::BS => params.bs = fv,
			fnfv::USER_BREAK_1 => params.user_break_1 = fv,
			fnfv::USER_BREAK_2 => params.user_break_2 = fv,
			fnfv::ENA_X_USER_BREAK => params.x_user_break_enabled = fv != 0,
			fnfv::CN => params.cancel = fv,
			fnfv::CURSOR_POS => params.cursor_pos = fv != 0,
			fnfv::X_CHAR_FLAG => params.x_char_flag = fv != 0,
			fnfv::X_CNT_HI => params.x_cnt = (params.x_cnt & 0x00FF) | (fv as u16) << 8,
			fnfv::X_CNT_LO => params.x_cnt = (params.x_cnt & 0xFF00) | fv as u16,
			fnfv::X_CHAR => params.x_char = fv,
			fnfv::X_TIMEOUT => params.x_timeout = fv != 0,
			fnfv::X_MODE_MULTIPLE => params.x_mode_multiple = fv != 0,
			fnfv::X_STICKY_TIMEOUT => params.x_sticky_timeout = fv != 0,
			fnfv::EOL => params.eol = fv,
			fnfv::EOL_CURSOR_POS => params.eol_cursor_pos = fv & 3,
			fnfv::ECHOPLEX => params.echoplex = fv != 0,
			fnfv::FULL_ASCII => params.full_ascii = fv != 0,
			fnfv::IN_FLOW_CONTROL => params.in_flow_control = fv != 0,
			fnfv::OUT_FLOW_CONTROL => params.out_flow_control = fv != 0,
			fnfv::X_INPUT => params.x_input = fv != 0,
			fnfv::SPECIAL_EDIT => params.special_edit = fv != 0,
			fnfv::TC => params.tc = fv,
			fnfv::PL => params.page_length = fv,
			fnfv::PW => params.page_width = fv,
			fnfv::DBL => params.downline_block_limit = fv,
			fnfv::DBZ_HI => {
				params.downline_block_size = (params.downline_block_size & 0x00FF) | (fv as u16) << 8
			}
			fnfv::DBZ_LO => {
				params.downline_block_size = (params.downline_block_size & 0xFF00) | fv as u16
			}
			fnfv::ABL => params.app_block_limit = fv,
			fnfv::UBL => params.upline_block_limit = fv,
			fnfv::UBZ_HI => {
				params.upline_block_size = (params.upline_block_size & 0x00FF) | (fv as u16) << 8
			}
			fnfv::UBZ_LO => params.upline_block_size = (params.upline_block_size & 0xFF00) | fv as u16,
			fnfv::DO => params.device_ordinal = fv,
			fnfv::SDT => params.sub_device_type = fv,
			fnfv::PRIORITY => params.priority = fv,
			fnfv::RIC => params.interactive_capability = fv,
			fnfv::ABORT_BLOCK | fnfv::BREAK_AS_USER | fnfv::CI | fnfv::CT | fnfv::EOB
			| fnfv::EOB_TERM | fnfv::EOB_CURSOR_POS | fnfv::EOL_TERM | fnfv::INPUT_DEVICE
			| fnfv::LI | fnfv::PG => {}
			_ => warn!("Unrecognized FN/FV pair {fn_:02x}/{fv:02x}"),
		}
	}
}

/// Rebuild the input assembly header. Data accumulates after it.
pub fn input_reset(tcb: &mut Tcb, nodes: Nodes) {
	tcb.in_buf.clear();
	tcb.in_buf.extend_from_slice(&[
		nodes.coupler,
		nodes.npu,
		tcb.cn,
		btbsn(BT_MSG, tcb.upline_bsn),
		0,
	]);
}

/// Send the assembled input upline as a block of type `bt`, then reset
/// the assembly for the next block.
pub fn send_input_block(tcb: &mut Tcb, pool: &mut Pool, bip: &mut Bip, nodes: Nodes, bt: u8) {
	tcb.in_buf[OFF_BTBSN] = btbsn(bt, tcb.upline_bsn);
	bip.request_upline_canned(pool, &tcb.in_buf);
	tcb.upline_bsn = if tcb.upline_bsn >= 7 { 1 } else { tcb.upline_bsn + 1 };
	input_reset(tcb, nodes);
}

/// Acknowledge a downline block whose network transmission completed.
/// `bsn_bits` are the BSN bits of the acknowledged block's header byte 3.
pub fn notify_sent(pool: &mut Pool, bip: &mut Bip, nodes: Nodes, cn: u8, bsn_bits: u8) {
	let back = [
		nodes.coupler,
		nodes.npu,
		cn,
		BT_BACK | (bsn_bits & (MASK_BSN << SHIFT_BSN)),
	];
	bip.request_upline_canned(pool, &back);
}

/// Release all output queued for a terminal.
pub fn discard_output_q(tcb: &mut Tcb, pool: &mut Pool) {
	tcb.output_q.release_all(pool);
}

/// Signal a user break upline, out of band: pending output is discarded
/// and a reset marker block is presented to the host.
pub fn send_user_break(tcb: &mut Tcb, pool: &mut Pool, bip: &mut Bip, nodes: Nodes, _bk: u8) {
	tcb.xoff = false;
	tcb.break_pending = true;
	discard_output_q(tcb, pool);
	input_reset(tcb, nodes);

	let reset = [nodes.coupler, nodes.npu, tcb.cn, BT_RESET];
	bip.request_upline_canned(pool, &reset);
}

impl Npu {
	/// Dispatch a downline data block addressed to a terminal.
	pub(crate) fn tip_process_buffer(&mut self, buf: Buffer, _priority: u8, now: Instant) {
		let data = buf.bytes();

		if data.len() <= OFF_BTBSN {
			warn!("Short downline block discarded");
			self.pool.release(buf);
			return;
		}

		let cn = data[OFF_CN];
		let Some(cn) = self.tcbs.find_for_cn(cn) else {
			warn!("Downline block for unknown connection {cn}");
			self.pool.release(buf);
			return;
		};

		match bt(data[OFF_BTBSN]) {
			BT_CMD => {
				// Characteristics update: FN/FV pairs follow the header.
				let tcb = &mut self.tcbs[cn];
				parse_fn_fv(&data[OFF_PFC..], &mut tcb.params);
				let bsn_bits = data[OFF_BTBSN] & (MASK_BSN << SHIFT_BSN);
				notify_sent(&mut self.pool, &mut self.bip, self.nodes, cn, bsn_bits);
				self.pool.release(buf);
			}
			BT_BACK => {
				// The host acknowledged one of our upline blocks.
				let tcb = &mut self.tcbs[cn];
				match tcb.tip_type {
					TipType::Nje | TipType::Hasp | TipType::RevHasp => {
						tcb.upline_block_limit = tcb.upline_block_limit.saturating_add(1);
					}
					TipType::Async => {}
				}
				self.pool.release(buf);
			}
			BT_BLK | BT_MSG => match self.tcbs[cn].tip_type {
				TipType::Async => self.async_process_downline(cn, buf, now),
				TipType::Hasp | TipType::RevHasp => self.hasp_process_downline(cn, buf, now),
				TipType::Nje => self.nje_process_downline(cn, buf, now),
			},
			bt => {
				warn!("Unexpected downline block type {bt} for connection {cn}");
				self.pool.release(buf);
			}
		}
	}

	/// Host-initiated termination of a terminal connection (TCN/TA).
	pub(crate) fn tip_terminate_connection(&mut self, cn: u8, now: Instant) {
		self.svm_disc_request_terminal(cn);
		self.svm_disc_reply_terminal(cn);

		if self.tcbs[cn].device_type == DeviceType::Console {
			let port = self.tcbs[cn].port;
			self.close_pcb(port, now);
		}
		self.tcbs[cn].state = TermState::Idle;
		self.tcbs.set_max_cn(cn);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn max_cn_tracks_highest_active() {
		let mut t = TcbTable::new();
		t[5].state = TermState::Configure;
		t.set_max_cn(5);
		assert_eq!(t.max_cn, 5);

		t[3].state = TermState::HostConnected;
		t.set_max_cn(3);
		assert_eq!(t.max_cn, 5);

		t[5].state = TermState::Idle;
		t.set_max_cn(5);
		assert_eq!(t.max_cn, 3);

		t[3].state = TermState::Idle;
		t.set_max_cn(3);
		assert_eq!(t.max_cn, 0);
	}

	#[test]
	fn slots_keep_their_cn() {
		let mut t = TcbTable::new();
		for cn in 1..MAX_TCBS as u8 {
			assert_eq!(t[cn].cn, cn);
		}
		let tcb = t.reset_slot(9);
		assert_eq!(tcb.cn, 9);
	}

	#[test]
	fn fn_fv_overrides() {
		let mut params = TermParams::default();
		setup_terminal_class(&mut params, TC_X364);

		parse_fn_fv(
			&[
				fnfv::ECHOPLEX, 0,
				fnfv::EOL_CURSOR_POS, 1,
				fnfv::BLOCK_FACTOR, 2,
				fnfv::X_CNT_HI, 0x01,
				fnfv::X_CNT_LO, 0x40,
			],
			&mut params,
		);

		assert!(!params.echoplex);
		assert_eq!(params.eol_cursor_pos, 1);
		assert_eq!(params.block_factor, 2);
		assert_eq!(params.x_cnt, 0x0140);
	}

	#[test]
	fn input_header_is_prestamped() {
		let mut t = TcbTable::new();
		let nodes = Nodes { coupler: 1, npu: 2, cdcnet: 255 };
		let tcb = &mut t[0x15];
		input_reset(tcb, nodes);

		assert_eq!(tcb.in_buf.len(), OFF_DATA);
		assert_eq!(tcb.in_buf[OFF_CN], 0x15);
		assert_eq!(bt(tcb.in_buf[OFF_BTBSN]), BT_MSG);
		assert_eq!(tcb.input_len(), 0);
	}
}
