//! Async TIP: interactive terminals over raw TCP, Pterm, RS-232 bridges
//! and Telnet. Handles option negotiation, the four upline input modes,
//! echoplex, and downline format-effector interpretation.

use std::time::{Duration, Instant};

use crate::block::*;
use crate::buf::{Buffer, Pool};
use crate::net::{queue_ack, queue_output, ConnType};
use crate::tip::{self, Tcb, TermState, MAX_IVT_DATA, MAX_TCBS, TC_X364};
use crate::Npu;

/// Transparent input forwarding timeout.
pub const X_INPUT_TIMEOUT: Duration = Duration::from_millis(200);

const TELNET_IAC: u8 = 255;
const TELNET_DONT: u8 = 254;
const TELNET_DO: u8 = 253;
const TELNET_WONT: u8 = 252;
const TELNET_WILL: u8 = 251;
const TELNET_SB: u8 = 250;
const TELNET_GO_AHEAD: u8 = 249;
const TELNET_ERASE_LINE: u8 = 248;
const TELNET_ERASE_CHAR: u8 = 247;
const TELNET_AYT: u8 = 246;
const TELNET_ABT_OUTPUT: u8 = 245;
const TELNET_INTERRUPT: u8 = 244;
const TELNET_BREAK: u8 = 243;
const TELNET_DATA_MARK: u8 = 242;
const TELNET_NO_OP: u8 = 241;
const TELNET_SE: u8 = 240;

const TELNET_OPT_BINARY: u8 = 0;
const TELNET_OPT_ECHO: u8 = 1;
const TELNET_OPT_SGA: u8 = 3;

const I_AM_HERE: &[u8] = b"\r\nYes, I am here.\r\n\r\n";

const CHR_NUL: u8 = 0x00;
const CHR_BEL: u8 = 0x07;
const CHR_BS: u8 = 0x08;
const CHR_LF: u8 = 0x0A;
const CHR_CR: u8 = 0x0D;
const CHR_DC1: u8 = 0x11;
const CHR_DC3: u8 = 0x13;
const CHR_STX: u8 = 0x02;
const CHR_US: u8 = 0x1F;
const CHR_DEL: u8 = 0x7F;

const FC_SINGLE: &[u8] = b"\r\n";
const FC_DOUBLE: &[u8] = b"\r\n\n";
const FC_TRIPLE: &[u8] = b"\r\n\n\n";
const FC_BOL: &[u8] = b"\r";
const FC_TOF_ANSI: &[u8] = b"\r\n\x1b[H";
const FC_TOF: &[u8] = b"\x0c";
const FC_CLEAR_HOME_ANSI: &[u8] = b"\r\n\x1b[H\x1b[J";

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TelnetState {
	Data,
	ProtoElem,
	Do,
	Dont,
	Will,
	Wont,
	Cr,
}

/// Async TIP sub-state of a PCB.
pub struct AsyncPcb {
	pub state: TelnetState,
	/// Options we announced with WILL and are awaiting DO/DONT for.
	pub pending_wills: u8,
	/// Cached CN of the connected terminal.
	pub tcb: Option<u8>,
}

impl AsyncPcb {
	pub fn new() -> Self {
		Self {
			state: TelnetState::Data,
			pending_wills: 0,
			tcb: None,
		}
	}
}

/// Queue terminal output with Telnet escaping: each literal 0xFF becomes
/// IAC IAC on the wire.
pub(crate) fn telnet_escape_queue(pool: &mut Pool, tcb: &mut Tcb, data: &[u8]) {
	let mut start = 0;
	for (i, b) in data.iter().enumerate() {
		if *b == TELNET_IAC {
			queue_output(pool, tcb, &data[start..=i]);
			queue_output(pool, tcb, &[TELNET_IAC]);
			start = i + 1;
		}
	}
	if start < data.len() {
		queue_output(pool, tcb, &data[start..]);
	}
}

/// Queue terminal output with Pterm escaping: 0xFF doubles and CR gets a
/// trailing NUL so the Telnet layer does not eat real zeroes.
pub(crate) fn pterm_escape_queue(pool: &mut Pool, tcb: &mut Tcb, data: &[u8]) {
	let mut start = 0;
	for (i, b) in data.iter().enumerate() {
		match *b {
			TELNET_IAC => {
				queue_output(pool, tcb, &data[start..=i]);
				queue_output(pool, tcb, &[TELNET_IAC]);
				start = i + 1;
			}
			CHR_CR => {
				queue_output(pool, tcb, &data[start..=i]);
				queue_output(pool, tcb, &[CHR_NUL]);
				start = i + 1;
			}
			_ => {}
		}
	}
	if start < data.len() {
		queue_output(pool, tcb, &data[start..]);
	}
}

/// Queue output for a terminal, escaped per the connection type.
fn queue_terminal_output(pool: &mut Pool, tcb: &mut Tcb, conn_type: ConnType, data: &[u8]) {
	match conn_type {
		ConnType::Telnet => telnet_escape_queue(pool, tcb, data),
		ConnType::Pterm => pterm_escape_queue(pool, tcb, data),
		_ => queue_output(pool, tcb, data),
	}
}

/// Format effector before the line.
fn do_fe_before(out: &mut Vec<u8>, tcb: &mut Tcb, fe: u8) {
	match fe {
		b' ' => out.extend_from_slice(if tcb.last_op_was_input { FC_BOL } else { FC_SINGLE }),
		b'0' => out.extend_from_slice(if tcb.last_op_was_input { FC_SINGLE } else { FC_DOUBLE }),
		b'-' => out.extend_from_slice(if tcb.last_op_was_input { FC_DOUBLE } else { FC_TRIPLE }),
		b'+' => out.extend_from_slice(FC_BOL),
		b'*' => {
			// Cursor home for X3.64 terminals, formfeed for the rest.
			out.extend_from_slice(if tcb.params.tc == TC_X364 { FC_TOF_ANSI } else { FC_TOF })
		}
		b'1' => out.extend_from_slice(if tcb.params.tc == TC_X364 {
			FC_CLEAR_HOME_ANSI
		} else {
			FC_TOF
		}),
		b',' => {}
		_ => {}
	}

	tcb.last_op_was_input = false;
}

/// Format effector after the line.
fn do_fe_after(out: &mut Vec<u8>, fe: u8) {
	match fe {
		b'.' => out.extend_from_slice(FC_SINGLE),
		b'/' => out.extend_from_slice(FC_BOL),
		_ => {}
	}
}

impl Npu {
	/// Resolve (and cache) the terminal connected on an async port.
	pub(crate) fn async_find_tcb(&mut self, port: u8) -> Option<u8> {
		let cached = match &self.net.pcbs[port as usize].controls {
			crate::net::PortControls::Async(a) => a.tcb,
			_ => return None,
		};

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

		if let crate::net::PortControls::Async(a) = &mut self.net.pcbs[port as usize].controls {
			a.tcb = found;
		}

		found
	}

	pub(crate) fn async_notify_net_connect(&mut self, port: u8, _passive: bool) -> bool {
		self.async_reset_pcb(port);
		self.svm_connect_terminal(port)
	}

	pub(crate) fn async_notify_net_disconnect(&mut self, port: u8, now: Instant) {
		match self.async_find_tcb(port) {
			Some(cn) => self.svm_send_disc_request(cn),
			None => self.close_pcb(port, now),
		}
	}

	/// SVM reports the terminal connected: negotiate echo suppression on
	/// Telnet links.
	pub(crate) fn async_notify_term_connect(&mut self, cn: u8) {
		let port = self.tcbs[cn].port;
		if self.net.conn_type(port) != Some(ConnType::Telnet) {
			return;
		}

		let announce = [
			TELNET_IAC, TELNET_WILL, TELNET_OPT_ECHO,
			TELNET_IAC, TELNET_WILL, TELNET_OPT_SGA,
		];
		let pcb = &mut self.net.pcbs[port as usize];
		if let crate::net::PortControls::Async(a) = &mut pcb.controls {
			a.pending_wills = 1 << TELNET_OPT_ECHO | 1 << TELNET_OPT_SGA;
		}
		let _ = pcb.link.send(&announce);
	}

	pub(crate) fn async_notify_term_disconnect(&mut self, _cn: u8) {}

	pub(crate) fn async_reset_pcb(&mut self, port: u8) {
		let Npu { net, tcbs, pool, .. } = self;

		if let crate::net::PortControls::Async(a) = &mut net.pcbs[port as usize].controls {
			a.state = TelnetState::Data;
			a.pending_wills = 0;
			if let Some(cn) = a.tcb.take() {
				tcbs[cn].output_q.release_all(pool);
			}
		}
	}

	/// Strip and answer Telnet protocol elements, then feed what remains
	/// through the normal upline path.
	pub(crate) fn async_process_telnet_data(&mut self, port: u8, data: &[u8], now: Instant) {
		let cn = self.async_find_tcb(port);
		let mut edited = Vec::with_capacity(data.len());
		let mut reply = Vec::new();

		{
			let params = cn.map(|cn| self.tcbs[cn].params.clone());
			let crate::net::PortControls::Async(a) = &mut self.net.pcbs[port as usize].controls else {
				return;
			};

			for &ch in data {
				match a.state {
					TelnetState::Data => {
						if ch == TELNET_IAC {
							a.state = TelnetState::ProtoElem;
						} else if ch == CHR_CR {
							edited.push(ch);
							a.state = TelnetState::Cr;
						} else {
							edited.push(ch);
						}
					}
					TelnetState::ProtoElem => {
						a.state = TelnetState::Data;
						match ch {
							TELNET_IAC => edited.push(TELNET_IAC),
							TELNET_DONT => a.state = TelnetState::Dont,
							TELNET_DO => a.state = TelnetState::Do,
							TELNET_WONT => a.state = TelnetState::Wont,
							TELNET_WILL => a.state = TelnetState::Will,
							TELNET_ERASE_LINE => {
								if let Some(p) = &params {
									edited.push(p.cancel);
								}
							}
							TELNET_ERASE_CHAR => {
								if let Some(p) = &params {
									edited.push(p.bs);
								}
							}
							TELNET_AYT => reply.extend_from_slice(I_AM_HERE),
							TELNET_ABT_OUTPUT => {
								if let Some(p) = &params {
									edited.push(p.user_break_1);
								}
							}
							TELNET_INTERRUPT | TELNET_BREAK => {
								if let Some(p) = &params {
									edited.push(p.user_break_2);
								}
							}
							TELNET_DATA_MARK | TELNET_GO_AHEAD | TELNET_SB | TELNET_SE
							| TELNET_NO_OP => {}
							_ => {}
						}
					}
					TelnetState::Dont => {
						if ch < 8 && a.pending_wills & 1 << ch != 0 {
							a.pending_wills &= !(1 << ch);
						} else {
							reply.extend_from_slice(&[TELNET_IAC, TELNET_WONT, ch]);
						}
						a.state = TelnetState::Data;
					}
					TelnetState::Do => {
						if ch < 8 && a.pending_wills & 1 << ch != 0 {
							a.pending_wills &= !(1 << ch);
						} else if matches!(ch, TELNET_OPT_BINARY | TELNET_OPT_ECHO | TELNET_OPT_SGA) {
							reply.extend_from_slice(&[TELNET_IAC, TELNET_WILL, ch]);
						} else {
							reply.extend_from_slice(&[TELNET_IAC, TELNET_WONT, ch]);
						}
						a.state = TelnetState::Data;
					}
					TelnetState::Wont => {
						reply.extend_from_slice(&[TELNET_IAC, TELNET_DONT, ch]);
						a.state = TelnetState::Data;
					}
					TelnetState::Will => {
						if matches!(ch, TELNET_OPT_BINARY | TELNET_OPT_SGA) {
							reply.extend_from_slice(&[TELNET_IAC, TELNET_DO, ch]);
						} else {
							reply.extend_from_slice(&[TELNET_IAC, TELNET_DONT, ch]);
						}
						a.state = TelnetState::Data;
					}
					TelnetState::Cr => {
						// CR NUL and CR LF both mean a bare carriage return;
						// anything else is reprocessed as data.
						a.state = TelnetState::Data;
						if matches!(ch, CHR_NUL | CHR_LF) {
						} else if ch == TELNET_IAC {
							a.state = TelnetState::ProtoElem;
						} else {
							edited.push(ch);
							if ch == CHR_CR {
								a.state = TelnetState::Cr;
							}
						}
					}
				}
			}
		}

		if !reply.is_empty() {
			let _ = self.net.pcbs[port as usize].link.send(&reply);
		}

		if !edited.is_empty() && cn.is_some() {
			self.async_process_upline_data(port, &edited, now);
		}
	}

	/// Feed received terminal input through the mode selected by the
	/// terminal's parameters.
	pub(crate) fn async_process_upline_data(&mut self, port: u8, data: &[u8], now: Instant) {
		let Some(cn) = self.async_find_tcb(port) else { return };
		if self.tcbs[cn].state != TermState::HostConnected {
			return;
		}

		let Npu { pool, bip, tcbs, net, nodes, .. } = self;
		let tcb = &mut tcbs[cn];
		let conn_type = net.ncbs[net.pcbs[port as usize].ncb.expect("registered port")].conn_type;
		let nodes = *nodes;

		let mut echo = Vec::new();

		if tcb.params.x_input {
			upline_transparent(tcb, pool, bip, nodes, data, &mut echo, now);
		} else if tcb.params.full_ascii {
			upline_ascii(tcb, pool, bip, nodes, conn_type, data, &mut echo);
		} else if tcb.params.special_edit {
			upline_special(tcb, pool, bip, nodes, conn_type, data, &mut echo);
		} else {
			upline_normal(tcb, pool, bip, nodes, conn_type, data, &mut echo);
		}

		if !tcb.dbc_no_echoplex && !echo.is_empty() {
			queue_terminal_output(pool, tcb, conn_type, &echo);
		}

		self.async_try_output(port, now);
	}

	/// Flush pending transparent input upline when its forwarding timer
	/// has elapsed.
	pub(crate) fn async_flush_upline_transparent(&mut self, cn: u8) {
		let Npu { pool, bip, tcbs, nodes, .. } = self;
		let tcb = &mut tcbs[cn];

		if !tcb.params.x_sticky_timeout {
			// Terminate transparent mode unless the timeout is sticky.
			tcb.params.x_input = false;
		}

		tcb.in_buf[OFF_DBC] = DBC_TRANSPARENT;
		tip::send_input_block(tcb, pool, bip, *nodes, BT_MSG);
		tcb.x_timer = None;
	}

	/// Interpret a downline data block for an async terminal.
	pub(crate) fn async_process_downline(&mut self, cn: u8, buf: Buffer, now: Instant) {
		let Npu { pool, tcbs, net, .. } = self;
		let tcb = &mut tcbs[cn];
		let port = tcb.port;
		let conn_type = net.ncbs[net.pcbs[port as usize].ncb.expect("registered port")].conn_type;

		let data = buf.bytes();
		if data.len() <= OFF_DBC {
			pool.release(buf);
			return;
		}

		let dbc = data[OFF_DBC];
		let bsn_bits = data[OFF_BTBSN] & (MASK_BSN << SHIFT_BSN);
		tcb.dbc_no_echoplex = dbc & DBC_ECHOPLEX != 0;
		tcb.dbc_no_cursor_pos = dbc & DBC_NO_CURSOR_POS != 0;

		let mut blk = &data[OFF_DATA..];

		if dbc & DBC_TRANSPARENT != 0 {
			queue_terminal_output(pool, tcb, conn_type, blk);
		} else {
			let mut out = Vec::with_capacity(blk.len() + 16);

			while !blk.is_empty() {
				let fe = if dbc & DBC_NO_FE != 0 {
					// Format effector suppressed: single-spaced output.
					b' '
				} else {
					let fe = blk[0];
					blk = &blk[1..];
					fe
				};

				do_fe_before(&mut out, tcb, fe);

				if blk.is_empty() {
					break;
				}

				match blk.iter().position(|&b| b == CHR_US) {
					None => {
						out.extend_from_slice(blk);
						break;
					}
					Some(pos) => {
						out.extend_from_slice(&blk[..pos]);
						if dbc & DBC_NO_CURSOR_POS == 0 {
							do_fe_after(&mut out, fe);
						}
						blk = &blk[pos + 1..];
					}
				}
			}

			queue_terminal_output(pool, tcb, conn_type, &out);
		}

		queue_ack(pool, tcb, bsn_bits);
		pool.release(buf);

		self.async_try_output(port, now);
	}

	/// Drain queued output onto the socket, acknowledging blocks as their
	/// last byte leaves, and service the transparent-input timer.
	pub(crate) fn async_try_output(&mut self, port: u8, now: Instant) {
		let Some(cn) = self.async_find_tcb(port) else { return };

		if self.tcbs[cn]
			.x_timer
			.is_some_and(|t| now.duration_since(t) >= X_INPUT_TIMEOUT)
		{
			self.async_flush_upline_transparent(cn);
		}

		let Npu { pool, bip, tcbs, net, nodes, .. } = self;
		let tcb = &mut tcbs[cn];

		// Suspend output while x-off is in effect.
		if tcb.xoff {
			return;
		}

		let pcb = &mut net.pcbs[port as usize];

		while let Some(mut b) = tcb.output_q.extract() {
			let taken = if b.num_bytes > b.offset {
				match pcb.link.send(b.unsent()) {
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
				continue;
			}

			// The socket did not take everything; wait for writability.
			tcb.output_q.prepend(b);
			pcb.link.want_write(true);
			return;
		}
	}
}

fn upline_transparent(
	tcb: &mut Tcb,
	pool: &mut Pool,
	bip: &mut crate::bip::Bip,
	nodes: crate::Nodes,
	data: &[u8],
	echo: &mut Vec<u8>,
	now: Instant,
) {
	// New input cancels the forwarding timeout.
	tcb.x_timer = None;

	for &ch in data {
		if tcb.params.echoplex {
			echo.push(ch);
		}

		if tcb.params.x_char_flag && ch == tcb.params.x_char {
			if !tcb.params.x_mode_multiple {
				// Terminate single-message transparent mode.
				tcb.params.x_input = false;
			}
			tcb.in_buf[OFF_DBC] = DBC_TRANSPARENT;
			tip::send_input_block(tcb, pool, bip, nodes, BT_MSG);
		} else if ch == tcb.params.user_break_2 && tcb.params.x_user_break_enabled {
			tcb.in_buf.push(ch);
			tcb.in_buf[OFF_DBC] = DBC_TRANSPARENT;
			tip::send_input_block(tcb, pool, bip, nodes, BT_MSG);
		} else {
			tcb.in_buf.push(ch);
			let n = tcb.input_len();
			if n >= tcb.params.x_cnt as usize || n >= crate::buf::MAX_BUFFER - OFF_DBC - 2 {
				if !tcb.params.x_mode_multiple && n >= tcb.params.x_cnt as usize {
					tcb.params.x_input = false;
				}
				tcb.in_buf[OFF_DBC] = DBC_TRANSPARENT;
				tip::send_input_block(tcb, pool, bip, nodes, BT_MSG);
			}
		}
	}

	// If data is pending, schedule the forwarding timeout.
	if tcb.params.x_timeout && tcb.input_len() > 0 {
		tcb.x_timer = Some(now);
	}
}

fn upline_ascii(
	tcb: &mut Tcb,
	pool: &mut Pool,
	bip: &mut crate::bip::Bip,
	nodes: crate::Nodes,
	conn_type: ConnType,
	data: &[u8],
	echo: &mut Vec<u8>,
) {
	tcb.in_buf[OFF_DBC] = 0;

	for &raw in data {
		let ch = raw & 0x7F;

		if tcb.input_len() == 0 && matches!(ch, CHR_NUL | CHR_LF | CHR_DEL) {
			continue;
		}

		if matches!(ch, CHR_DC1 | CHR_DC3) && tcb.params.out_flow_control {
			tcb.xoff = ch == CHR_DC3;
			continue;
		}

		if ch == tcb.params.cancel || ch == tcb.params.eol {
			tcb.in_buf.push(ch);
			tip::send_input_block(tcb, pool, bip, nodes, BT_MSG);
			tcb.in_buf[OFF_DBC] = 0;

			if tcb.dbc_no_echoplex {
				tcb.dbc_no_echoplex = false;
				echo.clear();
			} else if !echo.is_empty() {
				queue_terminal_output(pool, tcb, conn_type, echo);
				echo.clear();
			}

			if tcb.dbc_no_cursor_pos {
				tcb.dbc_no_cursor_pos = false;
			} else if tcb.params.cursor_pos {
				match tcb.params.eol_cursor_pos {
					1 => echo.push(CHR_CR),
					2 => echo.push(CHR_LF),
					3 => echo.extend_from_slice(&[CHR_CR, CHR_LF]),
					_ => {}
				}
			}
			continue;
		}

		if tcb.params.echoplex {
			echo.push(ch);
		}

		tcb.in_buf.push(ch);

		if tcb.input_len() >= tcb.params.block_factor as usize * MAX_IVT_DATA {
			tip::send_input_block(tcb, pool, bip, nodes, BT_BLK);
			tcb.in_buf[OFF_DBC] = 0;
		}
	}
}

/// Echo the "*DEL*" cancel-line indication, erasing the echoed input.
fn echo_cancel(tcb: &Tcb, out: &mut Vec<u8>) {
	let cnt = tcb.input_len();
	out.clear();
	for _ in 0..cnt {
		out.push(CHR_BS);
	}
	for _ in 0..cnt {
		out.push(b' ');
	}
	for _ in 0..cnt {
		out.push(CHR_BS);
	}
	out.extend_from_slice(b"*DEL*\r\n");
}

fn upline_special(
	tcb: &mut Tcb,
	pool: &mut Pool,
	bip: &mut crate::bip::Bip,
	nodes: crate::Nodes,
	conn_type: ConnType,
	data: &[u8],
	echo: &mut Vec<u8>,
) {
	tcb.in_buf[OFF_DBC] = 0;

	for &raw in data {
		let ch = raw & 0x7F;

		if matches!(ch, CHR_NUL | CHR_DEL) {
			continue;
		}
		if tcb.input_len() == 0 && ch == CHR_STX {
			continue;
		}

		if matches!(ch, CHR_DC1 | CHR_DC3) && tcb.params.out_flow_control {
			tcb.xoff = ch == CHR_DC3;
			continue;
		}

		if ch == tcb.params.cancel {
			let mut erase = Vec::new();
			echo_cancel(tcb, &mut erase);
			queue_terminal_output(pool, tcb, conn_type, &erase);

			tcb.in_buf[OFF_DBC] = DBC_CANCEL;
			tip::send_input_block(tcb, pool, bip, nodes, BT_MSG);
			tcb.in_buf[OFF_DBC] = 0;
			echo.clear();
			continue;
		}

		if ch == tcb.params.user_break_1 {
			tip::send_user_break(tcb, pool, bip, nodes, 1);
			continue;
		}
		if ch == tcb.params.user_break_2 {
			tip::send_user_break(tcb, pool, bip, nodes, 2);
			continue;
		}

		if tcb.params.echoplex {
			echo.push(ch);
		}

		if ch == tcb.params.eol {
			tcb.in_buf.push(ch);
			tip::send_input_block(tcb, pool, bip, nodes, BT_MSG);
			tcb.in_buf[OFF_DBC] = 0;

			if tcb.dbc_no_echoplex {
				tcb.dbc_no_echoplex = false;
				echo.clear();
			} else if !echo.is_empty() {
				queue_terminal_output(pool, tcb, conn_type, echo);
				echo.clear();
			}

			if tcb.dbc_no_cursor_pos {
				tcb.dbc_no_cursor_pos = false;
			} else if tcb.params.cursor_pos {
				cursor_pos_out(tcb, pool, conn_type);
			}
			continue;
		}

		tcb.in_buf.push(ch);

		if tcb.input_len() >= tcb.params.block_factor as usize * MAX_IVT_DATA {
			tip::send_input_block(tcb, pool, bip, nodes, BT_BLK);
			tcb.in_buf[OFF_DBC] = 0;
		}
	}
}

fn cursor_pos_out(tcb: &mut Tcb, pool: &mut Pool, conn_type: ConnType) {
	let seq: &[u8] = match tcb.params.eol_cursor_pos {
		1 => &[CHR_CR],
		2 => &[CHR_LF],
		3 => &[CHR_CR, CHR_LF],
		_ => return,
	};
	queue_terminal_output(pool, tcb, conn_type, seq);
}

fn upline_normal(
	tcb: &mut Tcb,
	pool: &mut Pool,
	bip: &mut crate::bip::Bip,
	nodes: crate::Nodes,
	conn_type: ConnType,
	data: &[u8],
	echo: &mut Vec<u8>,
) {
	tcb.in_buf[OFF_DBC] = 0;

	for &raw in data {
		let ch = raw & 0x7F;

		if matches!(ch, CHR_NUL | CHR_LF | CHR_DEL) {
			continue;
		}

		if matches!(ch, CHR_DC1 | CHR_DC3) && tcb.params.out_flow_control {
			tcb.xoff = ch == CHR_DC3;
			continue;
		}

		if ch == tcb.params.cancel {
			let mut erase = Vec::new();
			echo_cancel(tcb, &mut erase);
			queue_terminal_output(pool, tcb, conn_type, &erase);

			tcb.in_buf[OFF_DBC] = DBC_CANCEL;
			tip::send_input_block(tcb, pool, bip, nodes, BT_MSG);
			tcb.in_buf[OFF_DBC] = 0;
			echo.clear();
			continue;
		}

		if ch == tcb.params.user_break_1 {
			tip::send_user_break(tcb, pool, bip, nodes, 1);
			continue;
		}
		if ch == tcb.params.user_break_2 {
			tip::send_user_break(tcb, pool, bip, nodes, 2);
			continue;
		}

		if tcb.params.echoplex {
			echo.push(ch);
		}

		if ch == tcb.params.eol {
			tcb.in_buf.push(ch);
			tip::send_input_block(tcb, pool, bip, nodes, BT_MSG);
			tcb.in_buf[OFF_DBC] = 0;
			tcb.last_op_was_input = true;

			if tcb.dbc_no_echoplex {
				tcb.dbc_no_echoplex = false;
				echo.clear();
			} else if !echo.is_empty() {
				queue_terminal_output(pool, tcb, conn_type, echo);
				echo.clear();
			}

			if tcb.dbc_no_cursor_pos {
				tcb.dbc_no_cursor_pos = false;
			} else if tcb.params.cursor_pos {
				cursor_pos_out(tcb, pool, conn_type);
			}
			continue;
		}

		if ch == tcb.params.bs {
			if tcb.input_len() > 0 {
				tcb.in_buf.pop();
				echo.push(b' ');
				echo.push(tcb.params.bs);
			} else {
				// Beep when backing past the start of the line.
				queue_terminal_output(pool, tcb, conn_type, &[CHR_BEL]);
			}
			continue;
		}

		tcb.in_buf.push(ch);

		if tcb.input_len() >= tcb.params.block_factor as usize * MAX_IVT_DATA {
			tip::send_input_block(tcb, pool, bip, nodes, BT_BLK);
			tcb.in_buf[OFF_DBC] = 0;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::block;
	use crate::tip::TcbTable;

	#[test]
	fn telnet_iac_is_doubled() {
		let mut pool = Pool::new();
		let mut tcbs = TcbTable::new();
		let tcb = &mut tcbs[1];

		telnet_escape_queue(&mut pool, tcb, &[0x41, 0xFF, 0x42, 0xFF]);

		let b = tcb.output_q.extract().unwrap();
		assert_eq!(b.bytes(), &[0x41, 0xFF, 0xFF, 0x42, 0xFF, 0xFF]);
		pool.release(b);
	}

	#[test]
	fn pterm_cr_gets_nul() {
		let mut pool = Pool::new();
		let mut tcbs = TcbTable::new();
		let tcb = &mut tcbs[1];

		pterm_escape_queue(&mut pool, tcb, b"A\rB");

		let b = tcb.output_q.extract().unwrap();
		assert_eq!(b.bytes(), b"A\r\0B");
		pool.release(b);
	}

	#[test]
	fn eol_sends_line_and_echoes() {
		let (mut npu, upline) = crate::test_npu();
		let port = npu.test_async_port(0x15);

		npu.async_process_upline_data(port, b"A B\r", Instant::now());

		// One upline MSG block carrying the line with its EOL.
		let blocks = upline.borrow();
		assert_eq!(blocks.len(), 1);
		let blk = &blocks[0];
		assert_eq!(blk[block::OFF_CN], 0x15);
		assert_eq!(block::bt(blk[block::OFF_BTBSN]), block::BT_MSG);
		assert_eq!(&blk[block::OFF_DATA..], b"A B\r");
		drop(blocks);

		// Echo plus CR/LF cursor positioning went to the terminal.
		let sent = npu.test_port_output(port);
		assert_eq!(sent, b"A B\r\n");
	}

	#[test]
	fn long_input_forces_block() {
		let (mut npu, upline) = crate::test_npu();
		let port = npu.test_async_port(0x15);

		let line = vec![b'X'; MAX_IVT_DATA];
		npu.async_process_upline_data(port, &line, Instant::now());

		let blocks = upline.borrow();
		assert_eq!(blocks.len(), 1);
		assert_eq!(block::bt(blocks[0][block::OFF_BTBSN]), block::BT_BLK);
		assert_eq!(blocks[0].len() - block::OFF_DATA, MAX_IVT_DATA);
	}

	#[test]
	fn transparent_timer_flushes() {
		let (mut npu, upline) = crate::test_npu();
		let port = npu.test_async_port(0x15);

		{
			let tcb = &mut npu.tcbs[0x15];
			tcb.params.x_input = true;
			tcb.params.x_timeout = true;
			tcb.params.x_cnt = 1000;
			tcb.params.echoplex = false;
		}

		let start = Instant::now();
		npu.async_process_upline_data(port, b"\x01\x02", start);
		assert!(upline.borrow().is_empty());
		assert!(npu.tcbs[0x15].x_timer.is_some());

		// 200 ms later the held bytes are forwarded as transparent input.
		npu.async_try_output(port, start + Duration::from_millis(250));
		let blocks = upline.borrow();
		assert_eq!(blocks.len(), 1);
		assert_eq!(blocks[0][block::OFF_DBC], DBC_TRANSPARENT);
		assert_eq!(&blocks[0][block::OFF_DATA..], &[1, 2]);
	}

	#[test]
	fn backspace_erases_and_bells() {
		let (mut npu, upline) = crate::test_npu();
		let port = npu.test_async_port(0x15);

		// Backspace at start of line just beeps.
		npu.async_process_upline_data(port, &[CHR_BS], Instant::now());
		assert!(upline.borrow().is_empty());
		assert_eq!(npu.test_port_output(port), &[CHR_BEL]);

		npu.async_process_upline_data(port, b"AB\x08C\r", Instant::now());
		let blocks = upline.borrow();
		assert_eq!(&blocks[0][block::OFF_DATA..], b"AC\r");
	}

	#[test]
	fn downline_format_effectors() {
		let (mut npu, _upline) = crate::test_npu();
		let port = npu.test_async_port(0x15);

		// " HELLO<US> WORLD<US>": each record single-spaced onto its own
		// line by the leading blank format effector.
		let mut blk = vec![1, 2, 0x15, block::BT_MSG | 1 << block::SHIFT_BSN, 0];
		blk.extend_from_slice(b" HELLO\x1F WORLD\x1F");
		let mut b = npu.pool.get();
		b.set(&blk);
		npu.async_process_downline(0x15, b, Instant::now());

		let sent = npu.test_port_output(port);
		assert_eq!(sent, b"\r\nHELLO\r\nWORLD");
	}

	#[test]
	fn transparent_downline_is_verbatim() {
		let (mut npu, _upline) = crate::test_npu();
		let port = npu.test_async_port(0x15);

		let mut blk = vec![1, 2, 0x15, block::BT_MSG, DBC_TRANSPARENT];
		blk.extend_from_slice(&[0x00, 0x1F, 0xFE]);
		let mut b = npu.pool.get();
		b.set(&blk);
		npu.async_process_downline(0x15, b, Instant::now());

		assert_eq!(npu.test_port_output(port), &[0x00, 0x1F, 0xFE]);
	}
}
