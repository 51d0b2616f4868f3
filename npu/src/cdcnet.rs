//! CDCNet TCP/IP gateway: virtualises the TCP gateway of a CDCNet MDI.
//! The host's gateway stack sends command blocks (`TCPOS`, `TCPAC`, ...)
//! over an A-A connection; this module translates them into socket
//! operations and answers with response and indication blocks, keeping
//! the gateway and TCP state machines of every connection end point.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use log::{info, warn};
use runtime::{Io, IoEvent, Listener};

use crate::block::*;
use crate::buf::{Buffer, Queue, MAX_BUFFER};
use crate::net::Link;
use crate::Npu;

/// Offset added to privileged (< 1024) passive ports.
pub const PRIVILEGED_PORT_OFFSET: u16 = 6600;

const PASSIVE_PORT_FIRST: u16 = 7600;
const PASSIVE_PORT_LIMIT: u16 = 10000;

const CONNECT_DEADLINE: Duration = Duration::from_secs(60);
const INIT_DEADLINE: Duration = Duration::from_secs(10);
const LISTEN_GRACE: Duration = Duration::from_secs(10);

/// Upline blocks allowed to be outstanding before reads are throttled.
const MAX_UNACKED_BLOCKS: u8 = 7;

/// Gateway header types.
const GW_HT_INDICATION: u8 = 0;
const GW_HT_RESPONSE: u8 = 1;

const GW_TCP_VERSION: u8 = 0x10;

// Offsets common to all gateway commands and responses.
const OFF_GW_CMD_NAME: usize = 5;
const OFF_GW_HEADER_TYPE: usize = 12;
const OFF_GW_HEADER_LEN: usize = 13;
const OFF_GW_STATUS: usize = 17;
const OFF_GW_TCP_VERSION: usize = 19;

// Open SAP command.
const OFF_GW_OS_USER_SAP: usize = 20;
const OFF_GW_OS_TCP_SAP: usize = 28;

// Close SAP command.
const OFF_GW_CS_TCP_SAP: usize = 20;

// Active and Passive Connect commands share their layout.
const OFF_GW_AC_TCP_SAP: usize = 20;
const OFF_GW_AC_USER_CEP: usize = 28;
const OFF_GW_AC_TCP_CEP: usize = 35;
const OFF_GW_AC_SRC_ADDR: usize = 50;
const OFF_GW_AC_DST_ADDR: usize = 80;

// Allocate command.
const OFF_GW_A_TCP_CEP: usize = 20;
const OFF_GW_A_SIZE: usize = 28;

// Disconnect / Abort commands.
const OFF_GW_D_TCP_CEP: usize = 20;

// Connection Indication.
const OFF_GW_CI_USER_CEP: usize = 20;
const OFF_GW_CI_SRC_ADDR: usize = 35;
const OFF_GW_CI_DST_ADDR: usize = 65;
const GW_CI_LENGTH: usize = 470 - OFF_GW_CMD_NAME;

// Short indications: Disconnect Indication/Confirmation, Error.
const OFF_GW_I_USER_CEP: usize = 20;
const GW_I_LENGTH: usize = 35 - OFF_GW_CMD_NAME;

// A-A connection request fields.
const OFF_UPL_BLK_SIZE: usize = 17;
const OFF_APP_NAME: usize = 29;

// Reason codes for A-A connection failure.
const ERR_APP_MAX_CONNS: u8 = 20;
const ERR_APP_NOT_AVAIL: u8 = 22;

// Relative offsets inside a gateway TCP address structure.
const REL_FIELDS_IN_USE: usize = 0;
const REL_IP_NETWORK: usize = 1;
const REL_IP_HOST: usize = 4;
const REL_PORT_IN_USE: usize = 15;
const REL_PORT: usize = 16;
pub const TCP_ADDRESS_LENGTH: usize = 30;

/// TCP gateway status codes, from the CDCNet source.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u16)]
pub enum GwStatus {
	Successful = 0,
	ConnectionInuse = 1,
	HostUnreachable = 3,
	InternalError = 5,
	NoResources = 9,
	RemoteAbort = 14,
	SapNotOpen = 16,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GwConnState {
	Idle,
	StartingInit,
	Initializing,
	Connected,
	InitiateTermination,
	Terminating,
	AwaitTermBlock,
	Error,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TcpConnState {
	Idle,
	Connecting,
	IndicatingConnection,
	Listening,
	Connected,
	Disconnecting,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TcpConnType {
	Active,
	Passive,
}

/// TCP gateway control block: one per gateway connection end point.
pub struct Gcb {
	pub ordinal: u16,
	pub gw_state: GwConnState,
	pub tcp_state: TcpConnState,
	pub conn_type: TcpConnType,
	init_status: u8,
	pub cn: u8,
	bsn: u8,
	pub unacked_blocks: u8,
	pub max_upline_block_size: usize,
	pub tcp_sap_id: u32,
	pub tcp_cep_id: u32,
	pub user_sap_id: u32,
	pub user_cep_id: u32,
	reason: GwStatus,
	src_address: [u8; TCP_ADDRESS_LENGTH],
	dst_address: [u8; TCP_ADDRESS_LENGTH],
	pub src_port: u16,
	pub dst_port: u16,
	pub link: Link,
	local_addr: u32,
	local_port: u16,
	peer_addr: u32,
	peer_port: u16,
	deadline: Option<Instant>,
	downline_q: Queue,
	output_q: Queue,
}

const INIT_UPLINE: u8 = 0x01;
const INIT_DOWNLINE: u8 = 0x02;

impl Gcb {
	fn new(ordinal: u16) -> Self {
		Self {
			ordinal,
			gw_state: GwConnState::Idle,
			tcp_state: TcpConnState::Idle,
			conn_type: TcpConnType::Passive,
			init_status: 0,
			cn: 0,
			bsn: 1,
			unacked_blocks: 0,
			max_upline_block_size: 1000,
			tcp_sap_id: 0,
			tcp_cep_id: 0,
			user_sap_id: 0,
			user_cep_id: 0,
			reason: GwStatus::Successful,
			src_address: [0; TCP_ADDRESS_LENGTH],
			dst_address: [0; TCP_ADDRESS_LENGTH],
			src_port: 0,
			dst_port: 0,
			link: Link::closed(),
			local_addr: 0,
			local_port: 0,
			peer_addr: 0,
			peer_port: 0,
			deadline: None,
			downline_q: Queue::default(),
			output_q: Queue::default(),
		}
	}
}

/// Passive connection control block: one per listening port.
pub struct Pccb {
	pub ordinal: u16,
	/// Ordinal of the GCB awaiting a connection; 0 when unassigned.
	pub gcb_ordinal: u16,
	pub src_port: u16,
	pub dst_port: u16,
	pub listener: Option<Listener>,
	#[cfg(test)]
	pub test_listen: bool,
	pub deadline: Option<Instant>,
}

impl Pccb {
	fn new(ordinal: u16) -> Self {
		Self {
			ordinal,
			gcb_ordinal: 0,
			src_port: 0,
			dst_port: 0,
			listener: None,
			#[cfg(test)]
			test_listen: false,
			deadline: None,
		}
	}

	fn is_listening(&self) -> bool {
		#[cfg(test)]
		if self.test_listen {
			return true;
		}
		self.listener.is_some()
	}

	fn close_listener(&mut self) {
		self.listener = None;
		#[cfg(test)]
		{
			self.test_listen = false;
		}
		self.dst_port = 0;
		self.src_port = 0;
	}
}

pub struct Gateway {
	pub gcbs: Vec<Gcb>,
	pub pccbs: Vec<Pccb>,
	passive_port: u16,
	pub privileged_port_offset: u16,
}

impl Gateway {
	pub fn new() -> Self {
		Self {
			gcbs: Vec::new(),
			pccbs: Vec::new(),
			passive_port: PASSIVE_PORT_FIRST,
			privileged_port_offset: PRIVILEGED_PORT_OFFSET,
		}
	}

	/// A free GCB, growing the table when none is idle.
	fn get_gcb(&mut self) -> u16 {
		match self.gcbs.iter().position(|g| g.gw_state == GwConnState::Idle) {
			Some(i) => self.gcbs[i].ordinal,
			None => {
				let ordinal = self.gcbs.len() as u16 + 1;
				self.gcbs.push(Gcb::new(ordinal));
				ordinal
			}
		}
	}

	fn gcb(&mut self, ordinal: u16) -> Option<&mut Gcb> {
		self.gcbs.get_mut(ordinal.checked_sub(1)? as usize)
	}

	fn find_gcb_by_cn(&mut self, cn: u8) -> Option<u16> {
		self.gcbs
			.iter()
			.find(|g| g.gw_state != GwConnState::Idle && g.cn == cn)
			.map(|g| g.ordinal)
	}

	/// A free PCCB, growing the table when none is free.
	fn get_pccb(&mut self) -> u16 {
		match self.pccbs.iter().position(|p| p.dst_port == 0) {
			Some(i) => self.pccbs[i].ordinal,
			None => {
				let ordinal = self.pccbs.len() as u16 + 1;
				self.pccbs.push(Pccb::new(ordinal));
				ordinal
			}
		}
	}

	fn pccb(&mut self, ordinal: u16) -> Option<&mut Pccb> {
		self.pccbs.get_mut(ordinal.checked_sub(1)? as usize)
	}

	fn find_pccb_by_port(&mut self, port: u16) -> Option<u16> {
		self.pccbs.iter().find(|p| p.dst_port == port).map(|p| p.ordinal)
	}

	fn next_passive_port(&mut self) -> u16 {
		self.passive_port += 1;
		if self.passive_port >= PASSIVE_PORT_LIMIT {
			self.passive_port = PASSIVE_PORT_FIRST;
		}
		self.passive_port
	}
}

/// Assemble an IP address from its class-aware gateway encoding.
pub fn get_ip_address(ap: &[u8]) -> u32 {
	let in_use = ap[REL_FIELDS_IN_USE];
	let mut ip: u32 = 0;

	if in_use & 0x40 != 0 {
		ip = (ap[REL_IP_NETWORK] as u32) << 24
			| (ap[REL_IP_NETWORK + 1] as u32) << 16
			| (ap[REL_IP_NETWORK + 2] as u32) << 8;
		if ip & 0xFFFF_0000 == 0 {
			// Class A network.
			ip <<= 16;
		} else if ip & 0xFF00_0000 == 0 {
			// Class B network.
			ip <<= 8;
		}
	}

	if ip & 0xC000_0000 == 0xC000_0000 {
		// Class C address.
		ip |= ap[REL_IP_HOST + 2] as u32;
	} else if ip & 0x8000_0000 != 0 {
		// Class B address.
		ip |= (ap[REL_IP_HOST + 1] as u32) << 8 | ap[REL_IP_HOST + 2] as u32;
	} else {
		// Class A address.
		ip |= (ap[REL_IP_HOST] as u32) << 16
			| (ap[REL_IP_HOST + 1] as u32) << 8
			| ap[REL_IP_HOST + 2] as u32;
	}

	ip
}

/// Store an IP address in its class-aware gateway encoding.
pub fn set_ip_address(ap: &mut [u8], ip: u32) {
	ap[REL_FIELDS_IN_USE] |= 0xC0;

	if ip & 0xC000_0000 == 0xC000_0000 {
		// Class C address.
		ap[REL_IP_NETWORK] = (ip >> 24) as u8;
		ap[REL_IP_NETWORK + 1] = (ip >> 16) as u8;
		ap[REL_IP_NETWORK + 2] = (ip >> 8) as u8;
		ap[REL_IP_HOST] = 0;
		ap[REL_IP_HOST + 1] = 0;
		ap[REL_IP_HOST + 2] = ip as u8;
	} else if ip & 0x8000_0000 != 0 {
		// Class B address.
		ap[REL_IP_NETWORK] = 0;
		ap[REL_IP_NETWORK + 1] = (ip >> 24) as u8;
		ap[REL_IP_NETWORK + 2] = (ip >> 16) as u8;
		ap[REL_IP_HOST] = 0;
		ap[REL_IP_HOST + 1] = (ip >> 8) as u8;
		ap[REL_IP_HOST + 2] = ip as u8;
	} else {
		// Class A address.
		ap[REL_IP_NETWORK] = 0;
		ap[REL_IP_NETWORK + 1] = 0;
		ap[REL_IP_NETWORK + 2] = (ip >> 24) as u8;
		ap[REL_IP_HOST] = (ip >> 16) as u8;
		ap[REL_IP_HOST + 1] = (ip >> 8) as u8;
		ap[REL_IP_HOST + 2] = ip as u8;
	}
}

pub fn get_tcp_port(ap: &[u8]) -> u16 {
	if ap[REL_PORT_IN_USE] & 0x80 != 0 {
		(ap[REL_PORT] as u16) << 8 | ap[REL_PORT + 1] as u16
	} else {
		0
	}
}

pub fn set_tcp_port(ap: &mut [u8], port: u16) {
	ap[REL_PORT_IN_USE] |= 0x80;
	ap[REL_PORT] = (port >> 8) as u8;
	ap[REL_PORT + 1] = port as u8;
}

fn get_id(msg: &[u8], off: usize) -> u32 {
	u32::from_be_bytes([msg[off], msg[off + 1], msg[off + 2], msg[off + 3]])
}

fn put_id(msg: &mut [u8], off: usize, id: u32) {
	msg[off..off + 4].copy_from_slice(&id.to_be_bytes());
}

fn put_u16(msg: &mut [u8], off: usize, v: u16) {
	msg[off] = (v >> 8) as u8;
	msg[off + 1] = v as u8;
}

fn endpoints(io: &Io) -> Option<(u32, u16, u32, u16)> {
	let local = match io.stream().local_addr() {
		Ok(std::net::SocketAddr::V4(a)) => a,
		_ => return None,
	};
	let peer = match io.stream().peer_addr() {
		Ok(std::net::SocketAddr::V4(a)) => a,
		_ => return None,
	};
	Some((
		u32::from(*local.ip()),
		local.port(),
		u32::from(*peer.ip()),
		peer.port(),
	))
}

impl Npu {
	/// Process a downline block addressed to the gateway pseudo-node.
	pub(crate) fn cdcnet_process_downline(&mut self, buf: Buffer, now: Instant) {
		let data = buf.bytes();
		if data.len() <= OFF_BTBSN {
			self.pool.release(buf);
			return;
		}

		let block_type = bt(data[OFF_BTBSN]);
		let bsn = bsn(data[OFF_BTBSN]);
		let cn = data[OFF_CN];

		match block_type {
			BT_BLK | BT_MSG | BT_QBLK | BT_QMSG => {
				let Some(ordinal) = self.gw.find_gcb_by_cn(cn) else {
					warn!("Gateway connection not found: {cn:02x}");
					self.pool.release(buf);
					return;
				};
				let mut buf = buf;
				buf.block_seq_no = bsn;
				self.gw.gcb(ordinal).expect("just found").downline_q.append(buf);
				self.cdcnet_check_status(now);
			}

			BT_BACK => {
				if let Some(ordinal) = self.gw.find_gcb_by_cn(cn) {
					let gcb = self.gw.gcb(ordinal).expect("just found");
					if gcb.unacked_blocks > 0 {
						gcb.unacked_blocks -= 1;
					}
					if gcb.unacked_blocks < MAX_UNACKED_BLOCKS {
						gcb.link.want_read(true);
					}
				}
				self.pool.release(buf);
			}

			BT_CMD => {
				let msg = data.to_vec();
				self.pool.release(buf);
				self.cdcnet_process_command(&msg);
			}

			BT_RINIT => {
				let Some(ordinal) = self.gw.find_gcb_by_cn(cn) else {
					warn!("Gateway connection not found: {cn:02x}");
					self.pool.release(buf);
					return;
				};
				self.pool.release(buf);
				// Answer the initialize request and track both directions.
				self.gw_upline_raw(ordinal, BT_NINIT, &[]);
				let gcb = self.gw.gcb(ordinal).expect("just found");
				gcb.init_status |= INIT_DOWNLINE;
				if gcb.init_status == INIT_DOWNLINE | INIT_UPLINE {
					gcb.gw_state = GwConnState::Connected;
					info!("Gateway connection established, CN={cn:02x}");
				}
			}

			BT_NINIT => {
				if let Some(ordinal) = self.gw.find_gcb_by_cn(cn) {
					let gcb = self.gw.gcb(ordinal).expect("just found");
					gcb.init_status |= INIT_UPLINE;
					if gcb.init_status == INIT_DOWNLINE | INIT_UPLINE {
						gcb.gw_state = GwConnState::Connected;
						info!("Gateway connection established, CN={cn:02x}");
					}
				}
				self.pool.release(buf);
			}

			BT_TERM => {
				self.pool.release(buf);
				let Some(ordinal) = self.gw.find_gcb_by_cn(cn) else {
					warn!("Gateway connection not found: {cn:02x}");
					return;
				};
				let state = self.gw.gcb(ordinal).expect("just found").gw_state;
				match state {
					GwConnState::AwaitTermBlock => {
						// Echo the TERM block to finish our termination.
						self.gw_upline_raw(ordinal, BT_TERM, &[]);
						self.gw.gcb(ordinal).expect("just found").gw_state = GwConnState::Idle;
					}
					GwConnState::Terminating => {
						self.gw_send_terminate_response(cn);
						self.cdcnet_close_connection(ordinal);
					}
					_ => warn!("Invalid gateway state {state:?} on TERM block, CN={cn:02x}"),
				}
			}

			_ => {
				warn!("Unexpected block type {block_type} for gateway, CN={cn:02x}");
				self.pool.release(buf);
			}
		}
	}

	/// A-A connection management commands.
	fn cdcnet_process_command(&mut self, msg: &[u8]) {
		if msg.len() <= OFF_SFC {
			return;
		}
		let pfc = msg[OFF_PFC];
		let sfc = msg[OFF_SFC];

		match (pfc, sfc) {
			// Initiate A-A connection.
			(0x02, 0x09) => {
				if msg.len() <= OFF_P3 {
					return;
				}
				let cn = msg[OFF_P3];
				let name_ok = msg.len() > OFF_APP_NAME + 9
					&& &msg[OFF_APP_NAME..OFF_APP_NAME + 9] == b"GW_TCPIP_";

				let rc = if !name_ok {
					warn!("Gateway application name does not match GW_TCPIP_");
					ERR_APP_NOT_AVAIL
				} else {
					let ordinal = self.gw.get_gcb();
					match self.gw.gcb(ordinal) {
						Some(gcb) => {
							gcb.cn = cn;
							gcb.unacked_blocks = 0;
							gcb.max_upline_block_size =
								msg.get(OFF_UPL_BLK_SIZE).copied().unwrap_or(10) as usize * 100;
							gcb.gw_state = GwConnState::StartingInit;
							gcb.init_status = 0;
							0
						}
						None => ERR_APP_MAX_CONNS,
					}
				};

				let sfc = if rc == 0 { crate::svm::SFC_RESP } else { crate::svm::SFC_ERR } | 0x09;
				let reply = [
					self.nodes.coupler,
					self.nodes.cdcnet,
					0,
					BT_CMD,
					0x02,
					sfc,
					cn,
					rc,
				];
				self.bip.request_upline_canned(&mut self.pool, &reply);
			}

			// Terminate A-A connection, request or response.
			(0x03, s) if s & !crate::svm::SFC_RESP == 0x08 => {
				if msg.len() <= OFF_P3 {
					return;
				}
				let cn = msg[OFF_P3];
				let Some(ordinal) = self.gw.find_gcb_by_cn(cn) else {
					warn!("Gateway connection not found: {cn:02x}");
					return;
				};
				if s == 0x08 {
					self.gw_upline_raw(ordinal, BT_TERM, &[]);
					self.gw.gcb(ordinal).expect("just found").gw_state = GwConnState::Terminating;
				} else {
					self.cdcnet_close_connection(ordinal);
				}
			}

			_ => warn!("Unexpected gateway command type {pfc:02x}/{sfc:02x}"),
		}
	}

	/// Periodic gateway service: initialization, deadlines, command
	/// processing and connection progress.
	pub(crate) fn cdcnet_check_status(&mut self, now: Instant) {
		// Unassigned listeners do not stay open forever.
		for i in 0..self.gw.pccbs.len() {
			let p = &mut self.gw.pccbs[i];
			if p.is_listening() && p.gcb_ordinal == 0 && p.deadline.is_some_and(|t| now >= t) {
				info!("Unassigned gateway listen port timeout, port={}", p.dst_port);
				p.close_listener();
			}
		}

		for ordinal in 1..=self.gw.gcbs.len() as u16 {
			let state = self.gw.gcb(ordinal).expect("in range").gw_state;
			match state {
				GwConnState::StartingInit => {
					self.gw_upline_raw(ordinal, BT_RINIT, &[]);
					let gcb = self.gw.gcb(ordinal).expect("in range");
					gcb.gw_state = GwConnState::Initializing;
					gcb.deadline = Some(now + INIT_DEADLINE);
				}

				GwConnState::Initializing => {
					let gcb = self.gw.gcb(ordinal).expect("in range");
					if gcb.deadline.is_some_and(|t| now >= t) {
						warn!("Gateway connection initialization timed out, CN={:02x}", gcb.cn);
						self.cdcnet_close_connection(ordinal);
					}
				}

				GwConnState::InitiateTermination => {
					let cn = self.gw.gcb(ordinal).expect("in range").cn;
					self.cdcnet_close_connection(ordinal);
					self.gw_send_terminate_request(cn);
					self.gw.gcb(ordinal).expect("in range").gw_state = GwConnState::AwaitTermBlock;
				}

				GwConnState::Connected => {
					self.cdcnet_drain_downline(ordinal, now);

					let gcb = self.gw.gcb(ordinal).expect("in range");
					match gcb.tcp_state {
						TcpConnState::Connecting => {
							if gcb.deadline.is_some_and(|t| now >= t) {
								warn!("Gateway connect timed out, CN={:02x}", gcb.cn);
								gcb.link.close();
								gcb.tcp_state = TcpConnState::Idle;
								gcb.reason = GwStatus::HostUnreachable;
								gcb.gw_state = GwConnState::Error;
							}
						}
						TcpConnState::IndicatingConnection => {
							self.gw_send_connection_indication(ordinal);
							self.gw.gcb(ordinal).expect("in range").tcp_state = TcpConnState::Connected;
						}
						TcpConnState::Connected => {
							self.cdcnet_drain_output(ordinal);
						}
						_ => {}
					}
				}

				GwConnState::Error => {
					let reason = self.gw.gcb(ordinal).expect("in range").reason;
					self.gw_send_error_indication(ordinal, reason);
					let gcb = self.gw.gcb(ordinal).expect("in range");
					gcb.reason = GwStatus::Successful;
					gcb.gw_state = GwConnState::Connected;
				}

				_ => {}
			}
		}
	}

	/// Pop queued downline blocks: data to the output queue, commands to
	/// their handlers.
	fn cdcnet_drain_downline(&mut self, ordinal: u16, now: Instant) {
		loop {
			let Some(gcb) = self.gw.gcb(ordinal) else { return };
			let Some(mut b) = gcb.downline_q.extract() else { return };

			let block_type = bt(b.data[OFF_BTBSN]);
			match block_type {
				BT_BLK | BT_MSG => {
					b.offset = OFF_DBC + 1;
					gcb.output_q.append(b);
				}

				BT_QBLK | BT_QMSG => {
					if b.block_seq_no != 0 {
						let bsn = b.block_seq_no;
						b.block_seq_no = 0;
						let cn = gcb.cn;
						self.gw_send_back(cn, bsn);
					}
					let msg = b.bytes().to_vec();
					self.pool.release(b);
					self.cdcnet_dispatch_gw_command(ordinal, &msg, now);
				}

				_ => {
					warn!("Unexpected block type {block_type} queued for gateway");
					self.pool.release(b);
				}
			}
		}
	}

	/// Dispatch a gateway command block by its 7-character name.
	fn cdcnet_dispatch_gw_command(&mut self, ordinal: u16, msg: &[u8], now: Instant) {
		// Every command carries at least the gateway header and an id.
		if msg.len() < GW_I_LENGTH + OFF_GW_CMD_NAME {
			warn!("Short gateway command block");
			return;
		}
		let name = &msg[OFF_GW_CMD_NAME..OFF_GW_CMD_NAME + 7];

		match name {
			b"TCPA   " => self.gw_allocate(ordinal, msg),
			b"TCPAC  " => self.gw_active_connect(ordinal, msg, now),
			b"TCPACC " => self.gw_abort_current(ordinal, msg),
			b"TCPCS  " => self.gw_close_sap(ordinal, msg),
			b"TCPD   " => self.gw_disconnect(ordinal, msg),
			b"TCPOS  " => self.gw_open_sap(ordinal, msg),
			b"TCPPC  " => self.gw_passive_connect(ordinal, msg, now),
			b"TCPSD  " => self.gw_send_data(ordinal, msg),
			_ => {
				warn!(
					"Unrecognized TCP gateway command: {}",
					String::from_utf8_lossy(name)
				);
			}
		}
	}

	fn gw_open_sap(&mut self, ordinal: u16, msg: &[u8]) {
		let mut reply = msg.to_vec();
		let Some(gcb) = self.gw.gcb(ordinal) else { return };

		gcb.user_sap_id = get_id(msg, OFF_GW_OS_USER_SAP);
		gcb.tcp_sap_id = gcb.ordinal as u32;
		info!(
			"Open SAP request, tcpSapId={}, userSapId={}, CN={:02x}",
			gcb.tcp_sap_id, gcb.user_sap_id, gcb.cn
		);
		put_id(&mut reply, OFF_GW_OS_TCP_SAP, gcb.tcp_sap_id);

		self.gw_upline_qmsg(ordinal, reply, GW_HT_RESPONSE, GwStatus::Successful);
	}

	fn gw_close_sap(&mut self, ordinal: u16, msg: &[u8]) {
		let sap = get_id(msg, OFF_GW_CS_TCP_SAP);
		info!("Close SAP request, tcpSapId={sap}");

		for other in 1..=self.gw.gcbs.len() as u16 {
			let close = self
				.gw
				.gcb(other)
				.is_some_and(|g| g.tcp_sap_id == sap && g.tcp_state != TcpConnState::Idle);
			if close {
				self.cdcnet_close_connection(other);
			}
		}

		self.gw_upline_qmsg(ordinal, msg.to_vec(), GW_HT_RESPONSE, GwStatus::Successful);
	}

	fn gw_allocate(&mut self, ordinal: u16, msg: &[u8]) {
		info!(
			"Allocate request, tcpCepId={}, size={:08x}",
			get_id(msg, OFF_GW_A_TCP_CEP),
			get_id(msg, OFF_GW_A_SIZE)
		);
		self.gw_upline_qmsg(ordinal, msg.to_vec(), GW_HT_RESPONSE, GwStatus::Successful);
	}

	fn gw_abort_current(&mut self, ordinal: u16, msg: &[u8]) {
		info!("Abort current connection request, tcpCepId={}", get_id(msg, OFF_GW_D_TCP_CEP));
		if let Some(gcb) = self.gw.gcb(ordinal) {
			gcb.link.close();
			gcb.tcp_state = TcpConnState::Idle;
		}
		self.gw_upline_qmsg(ordinal, msg.to_vec(), GW_HT_RESPONSE, GwStatus::Successful);
	}

	fn gw_active_connect(&mut self, ordinal: u16, msg: &[u8], now: Instant) {
		if msg.len() < OFF_GW_AC_DST_ADDR + TCP_ADDRESS_LENGTH {
			warn!("Short active connect command");
			return;
		}

		let mut status = GwStatus::Successful;

		{
			let Some(gcb) = self.gw.gcb(ordinal) else { return };
			gcb.conn_type = TcpConnType::Active;
			gcb.tcp_sap_id = get_id(msg, OFF_GW_AC_TCP_SAP);
			gcb.user_cep_id = get_id(msg, OFF_GW_AC_USER_CEP);
			gcb.tcp_cep_id = 0;
			gcb.src_address
				.copy_from_slice(&msg[OFF_GW_AC_SRC_ADDR..OFF_GW_AC_SRC_ADDR + TCP_ADDRESS_LENGTH]);
			gcb.dst_address
				.copy_from_slice(&msg[OFF_GW_AC_DST_ADDR..OFF_GW_AC_DST_ADDR + TCP_ADDRESS_LENGTH]);
			gcb.src_port = get_tcp_port(&gcb.src_address);
			gcb.dst_port = get_tcp_port(&gcb.dst_address);
		}

		let dst_addr = get_ip_address(&msg[OFF_GW_AC_DST_ADDR..]);
		let (cn, dst_port, idle) = {
			let gcb = self.gw.gcb(ordinal).expect("present");
			(gcb.cn, gcb.dst_port, gcb.tcp_state == TcpConnState::Idle)
		};
		info!("Active connect request to {dst_addr:08x}:{dst_port}, CN={cn:02x}");

		if idle {
			let addr = SocketAddrV4::new(dst_addr.into(), dst_port);
			let connected = match &self.fwds {
				Some(fwds) => match runtime::connect(addr) {
					Ok(stream) => {
						let io = Io::connecting(stream, ordinal as u32, fwds.gw.clone());
						let gcb = self.gw.gcb(ordinal).expect("present");
						gcb.link = Link::open(io);
						gcb.tcp_state = TcpConnState::Connecting;
						gcb.deadline = Some(now + CONNECT_DEADLINE);
						true
					}
					Err(err) => {
						warn!("Failed to connect to {addr}: {err}");
						false
					}
				},
				None => false,
			};

			if !connected {
				status = GwStatus::HostUnreachable;
			}
		}

		self.gw_upline_qmsg(ordinal, msg.to_vec(), GW_HT_RESPONSE, status);
	}

	fn gw_passive_connect(&mut self, ordinal: u16, msg: &[u8], now: Instant) {
		if msg.len() < OFF_GW_AC_DST_ADDR + TCP_ADDRESS_LENGTH {
			warn!("Short passive connect command");
			return;
		}

		let mut reply = msg.to_vec();

		let requested = {
			let Some(gcb) = self.gw.gcb(ordinal) else { return };
			gcb.conn_type = TcpConnType::Passive;
			gcb.tcp_sap_id = get_id(msg, OFF_GW_AC_TCP_SAP);
			gcb.user_cep_id = get_id(msg, OFF_GW_AC_USER_CEP);
			gcb.tcp_cep_id = gcb.ordinal as u32;
			// Source and destination swap for a passive end point.
			gcb.dst_address
				.copy_from_slice(&msg[OFF_GW_AC_SRC_ADDR..OFF_GW_AC_SRC_ADDR + TCP_ADDRESS_LENGTH]);
			gcb.src_address
				.copy_from_slice(&msg[OFF_GW_AC_DST_ADDR..OFF_GW_AC_DST_ADDR + TCP_ADDRESS_LENGTH]);
			gcb.src_port = get_tcp_port(&gcb.src_address);
			get_tcp_port(&gcb.dst_address)
		};

		// Requested port 0 asks for an ephemeral port; privileged ports
		// shift into unprivileged space.
		let dst_port = if requested == 0 {
			self.gw.next_passive_port()
		} else if requested < 1024 {
			requested + self.gw.privileged_port_offset
		} else {
			requested
		};

		let not_idle = self.gw.gcb(ordinal).is_some_and(|g| g.tcp_state != TcpConnState::Idle);
		if not_idle {
			warn!("Passive connect on a non-idle gateway connection");
			self.gw_upline_qmsg(ordinal, reply, GW_HT_RESPONSE, GwStatus::ConnectionInuse);
			return;
		}

		if let Some(gcb) = self.gw.gcb(ordinal) {
			gcb.dst_port = dst_port;
		}

		// Re-use an already listening port when it is free.
		if let Some(p_ord) = self.gw.find_pccb_by_port(dst_port) {
			let src_port = self.gw.gcb(ordinal).map(|g| g.src_port).unwrap_or(0);
			let p = self.gw.pccb(p_ord).expect("just found");
			let status = if p.gcb_ordinal == 0 {
				info!("Listening for gateway connections (re-use) on port {dst_port}");
				p.src_port = src_port;
				p.gcb_ordinal = ordinal;
				if let Some(gcb) = self.gw.gcb(ordinal) {
					gcb.tcp_state = TcpConnState::Listening;
				}
				GwStatus::Successful
			} else {
				warn!("Gateway port {dst_port} in use by another connection");
				GwStatus::ConnectionInuse
			};
			self.gw_upline_qmsg(ordinal, reply, GW_HT_RESPONSE, status);
			return;
		}

		let p_ord = self.gw.get_pccb();
		let src_port = self.gw.gcb(ordinal).map(|g| g.src_port).unwrap_or(0);

		let listening = match &self.fwds {
			Some(fwds) => match runtime::listen(dst_port) {
				Ok(sock) => {
					let lstn = Listener::new(sock, p_ord as u32, fwds.gw_lstn.clone());
					let p = self.gw.pccb(p_ord).expect("present");
					p.listener = Some(lstn);
					true
				}
				Err(err) => {
					warn!("Can't listen on gateway port {dst_port}: {err}");
					false
				}
			},
			None => {
				#[cfg(test)]
				{
					self.gw.pccb(p_ord).expect("present").test_listen = true;
				}
				cfg!(test)
			}
		};

		if !listening {
			self.gw_upline_qmsg(ordinal, reply, GW_HT_RESPONSE, GwStatus::InternalError);
			return;
		}

		{
			let p = self.gw.pccb(p_ord).expect("present");
			p.src_port = src_port;
			p.dst_port = dst_port;
			p.gcb_ordinal = ordinal;
			p.deadline = Some(now + LISTEN_GRACE);
		}

		info!("Listening for gateway connections on port {dst_port}");

		let cep = ordinal as u32;
		if let Some(gcb) = self.gw.gcb(ordinal) {
			gcb.tcp_state = TcpConnState::Listening;
		}
		set_tcp_port(&mut reply[OFF_GW_AC_SRC_ADDR..], dst_port);
		put_id(&mut reply, OFF_GW_AC_TCP_CEP, cep);

		self.gw_upline_qmsg(ordinal, reply, GW_HT_RESPONSE, GwStatus::Successful);
	}

	fn gw_disconnect(&mut self, ordinal: u16, msg: &[u8]) {
		info!("Disconnect request, tcpCepId={}", get_id(msg, OFF_GW_D_TCP_CEP));

		// Answer with a disconnect confirmation indication.
		let mut reply = msg.to_vec();
		reply.resize((GW_I_LENGTH + OFF_GW_CMD_NAME).max(reply.len()), 0);
		reply.truncate(GW_I_LENGTH + OFF_GW_CMD_NAME);
		reply[OFF_GW_CMD_NAME..OFF_GW_CMD_NAME + 7].copy_from_slice(b"TCPDC  ");
		put_u16(&mut reply, OFF_GW_HEADER_LEN, GW_I_LENGTH as u16);
		reply[OFF_GW_TCP_VERSION] = GW_TCP_VERSION;
		let user_cep = self.gw.gcb(ordinal).map(|g| g.user_cep_id).unwrap_or(0);
		put_id(&mut reply, OFF_GW_I_USER_CEP, user_cep);
		self.gw_upline_qmsg(ordinal, reply, GW_HT_INDICATION, GwStatus::Successful);

		let Some(gcb) = self.gw.gcb(ordinal) else { return };
		if gcb.tcp_state == TcpConnState::Listening {
			let dst_port = gcb.dst_port;
			if let Some(p_ord) = self.gw.find_pccb_by_port(dst_port) {
				let p = self.gw.pccb(p_ord).expect("just found");
				if p.gcb_ordinal == ordinal {
					if p.src_port != 0 {
						info!("Close gateway listening socket, port={dst_port}");
						p.close_listener();
					}
					p.gcb_ordinal = 0;
				}
			}
		} else {
			gcb.link.close();
		}

		if let Some(gcb) = self.gw.gcb(ordinal) {
			gcb.tcp_state = TcpConnState::Idle;
		}
	}

	/// Queue TCPSD payload for transmission on the connection's socket.
	fn gw_send_data(&mut self, ordinal: u16, msg: &[u8]) {
		let header_len = (msg[OFF_GW_HEADER_LEN] as usize) << 8 | msg[OFF_GW_HEADER_LEN + 1] as usize;
		let data_at = (OFF_GW_CMD_NAME + header_len).min(msg.len());

		let Npu { gw, pool, .. } = self;
		let Some(gcb) = gw.gcb(ordinal) else { return };

		let mut b = pool.get();
		b.set(&msg[data_at..]);
		gcb.output_q.append(b);

		self.cdcnet_drain_output(ordinal);
	}

	/// Socket readiness for a gateway connection.
	pub(crate) fn cdcnet_gw_event(&mut self, ordinal: u32, ev: IoEvent, _now: Instant) {
		let ordinal = ordinal as u16;
		let Some(gcb) = self.gw.gcb(ordinal) else { return };

		match ev {
			IoEvent::Writable if gcb.tcp_state == TcpConnState::Connecting => {
				let failed = match gcb.link.io().map(|io| io.take_error()) {
					Some(Ok(None)) => false,
					_ => true,
				};

				if failed {
					warn!("Gateway connect failed, CN={:02x}", gcb.cn);
					gcb.link.close();
					gcb.tcp_state = TcpConnState::Idle;
					gcb.reason = GwStatus::HostUnreachable;
					gcb.gw_state = GwConnState::Error;
					return;
				}

				if let Some(io) = gcb.link.io() {
					io.set_connected();
					if let Some((la, lp, pa, pp)) = endpoints(io) {
						gcb.local_addr = la;
						gcb.local_port = lp;
						gcb.peer_addr = pa;
						gcb.peer_port = pp;
					}
				}
				info!("Gateway connected, CN={:02x}", gcb.cn);
				gcb.tcp_state = TcpConnState::Connected;
				self.gw_send_connection_indication(ordinal);
			}

			IoEvent::Writable => self.cdcnet_drain_output(ordinal),

			IoEvent::Data(data) => self.gw_send_data_indication(ordinal, &data),

			IoEvent::Closed => {
				if gcb.tcp_state == TcpConnState::Connecting {
					gcb.link.close();
					gcb.tcp_state = TcpConnState::Idle;
					gcb.reason = GwStatus::HostUnreachable;
					gcb.gw_state = GwConnState::Error;
					return;
				}

				info!("Gateway stream closed, CN={:02x}", gcb.cn);
				gcb.tcp_state = TcpConnState::Disconnecting;
				gcb.link.close();
				self.gw_send_disconnect_indication(ordinal);
			}

			_ => {}
		}
	}

	/// A gateway listener accepted a connection.
	pub(crate) fn cdcnet_gw_accept(&mut self, p_ord: u32, stream: std::net::TcpStream, now: Instant) {
		let p_ord = p_ord as u16;
		let Some(p) = self.gw.pccb(p_ord) else { return };

		if p.gcb_ordinal == 0 {
			// Nobody is waiting on this port.
			return;
		}
		let ordinal = p.gcb_ordinal;

		// A listener bound for a specific client port serves exactly one
		// connection; general listeners stay open for a grace period.
		if p.src_port != 0 {
			info!("Close gateway listening socket, port={}", p.dst_port);
			p.close_listener();
		} else {
			p.deadline = Some(now + LISTEN_GRACE);
		}
		p.gcb_ordinal = 0;

		let Some(fwds) = &self.fwds else { return };
		let io = Io::new(stream, ordinal as u32, fwds.gw.clone());
		let eps = endpoints(&io);

		let Some(gcb) = self.gw.gcb(ordinal) else { return };
		gcb.link = Link::open(io);
		if let Some((la, lp, pa, pp)) = eps {
			gcb.local_addr = la;
			gcb.local_port = lp;
			gcb.peer_addr = pa;
			gcb.peer_port = pp;
		}
		info!("Accepted gateway connection, CN={:02x}", gcb.cn);
		gcb.tcp_state = TcpConnState::Connected;

		self.gw_send_connection_indication(ordinal);
	}

	/// Send queued output to the socket, acknowledging blocks with BACK
	/// as their last byte leaves.
	fn cdcnet_drain_output(&mut self, ordinal: u16) {
		loop {
			let Some(gcb) = self.gw.gcb(ordinal) else { return };
			let Some(mut b) = gcb.output_q.extract() else { return };

			match gcb.link.send(b.unsent()) {
				Ok(n) => {
					b.offset += n;
					if b.offset >= b.num_bytes {
						let bsn = b.block_seq_no;
						let cn = gcb.cn;
						self.pool.release(b);
						if bsn != 0 {
							self.gw_send_back(cn, bsn);
						}
					} else {
						gcb.output_q.prepend(b);
						gcb.link.want_write(true);
						return;
					}
				}
				Err(()) => {
					warn!("Gateway write failed, CN={:02x}", gcb.cn);
					self.pool.release(b);
					let Some(gcb) = self.gw.gcb(ordinal) else { return };
					gcb.output_q.release_all(&mut self.pool);
					gcb.reason = GwStatus::RemoteAbort;
					gcb.gw_state = GwConnState::Error;
					return;
				}
			}
		}
	}

	fn cdcnet_close_connection(&mut self, ordinal: u16) {
		let Some(gcb) = self.gw.gcb(ordinal) else { return };
		gcb.link.close();
		let dst_port = gcb.dst_port;

		if let Some(p_ord) = self.gw.find_pccb_by_port(dst_port) {
			let p = self.gw.pccb(p_ord).expect("just found");
			if p.gcb_ordinal == ordinal {
				if p.src_port != 0 {
					info!("Close gateway listening socket, port={}", p.dst_port);
					p.close_listener();
				} else if p.is_listening() {
					p.deadline = Some(Instant::now() + LISTEN_GRACE);
				}
				p.gcb_ordinal = 0;
			}
		}

		let Npu { gw, pool, .. } = self;
		let Some(gcb) = gw.gcb(ordinal) else { return };
		gcb.gw_state = GwConnState::Idle;
		gcb.tcp_state = TcpConnState::Idle;
		gcb.init_status = 0;
		gcb.tcp_sap_id = 0;
		gcb.downline_q.release_all(pool);
		gcb.output_q.release_all(pool);
	}

	/// Reset the whole gateway (network going down).
	pub(crate) fn cdcnet_reset(&mut self) {
		if self.gw.gcbs.is_empty() {
			return;
		}
		info!("Reset gateway");

		for ordinal in 1..=self.gw.gcbs.len() as u16 {
			if self.gw.gcb(ordinal).is_some_and(|g| g.gw_state != GwConnState::Idle) {
				self.cdcnet_close_connection(ordinal);
			}
		}
		for p in &mut self.gw.pccbs {
			p.close_listener();
			p.gcb_ordinal = 0;
		}
	}

	/// Send a short header-only block upline for a gateway connection.
	fn gw_upline_raw(&mut self, ordinal: u16, block_type: u8, payload: &[u8]) {
		let cn = match self.gw.gcb(ordinal) {
			Some(gcb) => gcb.cn,
			None => return,
		};
		let mut msg = vec![self.nodes.coupler, self.nodes.cdcnet, cn, block_type];
		msg.extend_from_slice(payload);
		self.bip.request_upline_canned(&mut self.pool, &msg);
	}

	/// Send a QMSG (or data MSG) block upline, stamping the header, the
	/// gateway status and the response/indication marker.
	fn gw_upline_qmsg(&mut self, ordinal: u16, mut msg: Vec<u8>, header_type: u8, status: GwStatus) {
		let Some(gcb) = self.gw.gcb(ordinal) else { return };

		msg[OFF_DN] = self.nodes.coupler;
		msg[OFF_SN] = self.nodes.cdcnet;
		msg[OFF_CN] = gcb.cn;
		msg[OFF_BTBSN] = btbsn(BT_QMSG, gcb.bsn);
		msg[OFF_DBC] = 0;
		put_u16(&mut msg, OFF_GW_STATUS, status as u16);
		msg[OFF_GW_HEADER_TYPE] = header_type;

		gcb.bsn = if gcb.bsn >= 7 { 1 } else { gcb.bsn + 1 };
		gcb.unacked_blocks += 1;
		if gcb.unacked_blocks >= MAX_UNACKED_BLOCKS {
			gcb.link.want_read(false);
		}

		self.bip.request_upline_canned(&mut self.pool, &msg);
	}

	/// Send received socket data upline as MSG blocks bounded by the
	/// connection's maximum upline block size.
	fn gw_send_data_indication(&mut self, ordinal: u16, data: &[u8]) {
		let Some(gcb) = self.gw.gcb(ordinal) else { return };
		let max = gcb.max_upline_block_size.min(MAX_BUFFER - (OFF_DBC + 1));
		let cn = gcb.cn;

		for chunk in data.chunks(max.max(1)) {
			let Some(gcb) = self.gw.gcb(ordinal) else { return };
			let mut msg = vec![
				self.nodes.coupler,
				self.nodes.cdcnet,
				cn,
				btbsn(BT_MSG, gcb.bsn),
				0,
			];
			msg.extend_from_slice(chunk);

			gcb.bsn = if gcb.bsn >= 7 { 1 } else { gcb.bsn + 1 };
			gcb.unacked_blocks += 1;
			if gcb.unacked_blocks >= MAX_UNACKED_BLOCKS {
				gcb.link.want_read(false);
			}

			self.bip.request_upline_canned(&mut self.pool, &msg);
		}
	}

	/// Build a TCPCI indication announcing an established connection.
	fn gw_send_connection_indication(&mut self, ordinal: u16) {
		let off = self.gw.privileged_port_offset;
		let Some(gcb) = self.gw.gcb(ordinal) else { return };

		info!("Send connection indication, userCepId={}, CN={:02x}", gcb.user_cep_id, gcb.cn);

		let mut msg = vec![0; GW_CI_LENGTH + OFF_GW_CMD_NAME];
		msg[OFF_GW_CMD_NAME..OFF_GW_CMD_NAME + 7].copy_from_slice(b"TCPCI  ");
		put_u16(&mut msg, OFF_GW_HEADER_LEN, GW_CI_LENGTH as u16);
		msg[OFF_GW_TCP_VERSION] = GW_TCP_VERSION;
		put_id(&mut msg, OFF_GW_CI_USER_CEP, gcb.user_cep_id);

		if gcb.conn_type == TcpConnType::Active {
			set_ip_address(&mut gcb.src_address, gcb.local_addr);
			gcb.src_port = gcb.local_port;
			set_tcp_port(&mut gcb.src_address, gcb.local_port);
			set_ip_address(&mut gcb.dst_address, gcb.peer_addr);
			gcb.dst_port = gcb.peer_port;
			set_tcp_port(&mut gcb.dst_address, gcb.peer_port);
			gcb.tcp_cep_id = gcb.ordinal as u32;
		} else {
			set_ip_address(&mut gcb.src_address, gcb.peer_addr);
			gcb.src_port = gcb.peer_port;
			set_tcp_port(&mut gcb.src_address, gcb.peer_port);
			set_ip_address(&mut gcb.dst_address, gcb.local_addr);
			if gcb.local_port >= off && gcb.local_port < off + 1024 {
				set_tcp_port(&mut gcb.dst_address, gcb.local_port - off);
			} else {
				set_tcp_port(&mut gcb.dst_address, gcb.local_port);
			}
		}

		msg[OFF_GW_CI_SRC_ADDR..OFF_GW_CI_SRC_ADDR + TCP_ADDRESS_LENGTH]
			.copy_from_slice(&gcb.src_address);
		msg[OFF_GW_CI_DST_ADDR..OFF_GW_CI_DST_ADDR + TCP_ADDRESS_LENGTH]
			.copy_from_slice(&gcb.dst_address);

		self.gw_upline_qmsg(ordinal, msg, GW_HT_INDICATION, GwStatus::Successful);
	}

	fn gw_send_short_indication(&mut self, ordinal: u16, name: &[u8; 7], status: GwStatus) {
		let user_cep = match self.gw.gcb(ordinal) {
			Some(gcb) => gcb.user_cep_id,
			None => return,
		};

		let mut msg = vec![0; GW_I_LENGTH + OFF_GW_CMD_NAME];
		msg[OFF_GW_CMD_NAME..OFF_GW_CMD_NAME + 7].copy_from_slice(name);
		put_u16(&mut msg, OFF_GW_HEADER_LEN, GW_I_LENGTH as u16);
		msg[OFF_GW_TCP_VERSION] = GW_TCP_VERSION;
		put_id(&mut msg, OFF_GW_I_USER_CEP, user_cep);

		self.gw_upline_qmsg(ordinal, msg, GW_HT_INDICATION, status);
	}

	fn gw_send_disconnect_indication(&mut self, ordinal: u16) {
		self.gw_send_short_indication(ordinal, b"TCPDI  ", GwStatus::Successful);
	}

	fn gw_send_error_indication(&mut self, ordinal: u16, reason: GwStatus) {
		let user_cep = self.gw.gcb(ordinal).map(|g| g.user_cep_id).unwrap_or(0);
		info!("Send error indication, userCepId={user_cep}, error={reason:?}");
		self.gw_send_short_indication(ordinal, b"TCPEI  ", reason);
	}

	/// Acknowledge a downline data block.
	fn gw_send_back(&mut self, cn: u8, bsn: u8) {
		let back = [
			self.nodes.coupler,
			self.nodes.cdcnet,
			cn,
			BT_BACK | bsn << SHIFT_BSN,
		];
		self.bip.request_upline_canned(&mut self.pool, &back);
	}

	fn gw_send_terminate_request(&mut self, cn: u8) {
		let msg = [
			self.nodes.coupler,
			self.nodes.cdcnet,
			0,
			BT_CMD,
			0x03, // PFC: terminate connection
			0x08, // SFC: terminate connection
			cn,
		];
		self.bip.request_upline_canned(&mut self.pool, &msg);
	}

	fn gw_send_terminate_response(&mut self, cn: u8) {
		let msg = [
			self.nodes.coupler,
			self.nodes.cdcnet,
			0,
			BT_CMD,
			0x03,
			crate::svm::SFC_RESP | 0x08,
			cn,
		];
		self.bip.request_upline_canned(&mut self.pool, &msg);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ip_round_trips_by_class() {
		// Class A, B and C addresses survive the gateway encoding.
		for &addr in &[0x0A00_0001u32, 0x8001_0203u32, 0xC0A8_0105u32] {
			let mut ap = [0u8; TCP_ADDRESS_LENGTH];
			set_ip_address(&mut ap, addr);
			assert_eq!(get_ip_address(&ap), addr, "address {addr:08x}");
		}
	}

	#[test]
	fn port_round_trips() {
		let mut ap = [0u8; TCP_ADDRESS_LENGTH];
		assert_eq!(get_tcp_port(&ap), 0, "unset port reads as zero");
		set_tcp_port(&mut ap, 6023);
		assert_eq!(get_tcp_port(&ap), 6023);
	}

	fn gw_npu() -> (crate::Npu, std::rc::Rc<std::cell::RefCell<Vec<Vec<u8>>>>, u16) {
		let (mut npu, upline) = crate::test_npu();

		// A-A connection request for the gateway application.
		let mut icn = vec![1, 255, 0, BT_CMD, 0x02, 0x09, 0x41];
		icn.resize(OFF_APP_NAME, 0);
		icn[OFF_UPL_BLK_SIZE] = 10;
		icn.extend_from_slice(b"GW_TCPIP_T01");
		let mut b = npu.pool.get();
		b.set(&icn);
		npu.cdcnet_process_downline(b, Instant::now());

		// The initiate-connection response went upline.
		{
			let blocks = upline.borrow();
			let resp = blocks.last().unwrap();
			assert_eq!(resp[OFF_PFC], 0x02);
			assert_eq!(resp[OFF_SFC], crate::svm::SFC_RESP | 0x09);
			assert_eq!(resp[OFF_P3], 0x41);
			assert_eq!(resp[7], 0, "reason code");
		}

		// Run the RINIT/NINIT handshake.
		npu.cdcnet_check_status(Instant::now());
		let mut b = npu.pool.get();
		b.set(&[1, 255, 0x41, BT_RINIT]);
		npu.cdcnet_process_downline(b, Instant::now());
		let mut b = npu.pool.get();
		b.set(&[1, 255, 0x41, BT_NINIT]);
		npu.cdcnet_process_downline(b, Instant::now());

		let ordinal = npu.gw.find_gcb_by_cn(0x41).unwrap();
		assert_eq!(npu.gw.gcb(ordinal).unwrap().gw_state, GwConnState::Connected);

		(npu, upline, ordinal)
	}

	fn qmsg(cn: u8, name: &[u8; 7], len: usize, bsn: u8) -> Vec<u8> {
		let mut msg = vec![0; len.max(OFF_GW_CMD_NAME + 30)];
		msg[OFF_DN] = 1;
		msg[OFF_SN] = 255;
		msg[OFF_CN] = cn;
		msg[OFF_BTBSN] = btbsn(BT_QMSG, bsn);
		msg[OFF_GW_CMD_NAME..OFF_GW_CMD_NAME + 7].copy_from_slice(name);
		msg
	}

	#[test]
	fn open_sap_assigns_ordinal_id() {
		let (mut npu, upline, ordinal) = gw_npu();

		let mut cmd = qmsg(0x41, b"TCPOS  ", 40, 2);
		put_id(&mut cmd, OFF_GW_OS_USER_SAP, 77);
		let mut b = npu.pool.get();
		b.set(&cmd);
		npu.cdcnet_process_downline(b, Instant::now());

		let blocks = upline.borrow();
		// First a BACK for the QMSG, then the response.
		let back = &blocks[blocks.len() - 2];
		assert_eq!(bt(back[OFF_BTBSN]), BT_BACK);
		assert_eq!(bsn(back[OFF_BTBSN]), 2);

		let resp = blocks.last().unwrap();
		assert_eq!(bt(resp[OFF_BTBSN]), BT_QMSG);
		assert_eq!(&resp[OFF_GW_CMD_NAME..OFF_GW_CMD_NAME + 7], b"TCPOS  ");
		assert_eq!(resp[OFF_GW_HEADER_TYPE], GW_HT_RESPONSE);
		// The SAP id preserves the ordinal for wire compatibility.
		assert_eq!(get_id(resp, OFF_GW_OS_TCP_SAP), ordinal as u32);
	}

	#[test]
	fn passive_connect_offsets_privileged_ports() {
		let (mut npu, upline, ordinal) = gw_npu();

		let mut cmd = qmsg(0x41, b"TCPPC  ", 520, 3);
		// Destination address requests privileged port 21.
		set_tcp_port(&mut cmd[OFF_GW_AC_SRC_ADDR..], 21);
		let mut b = npu.pool.get();
		b.set(&cmd);
		npu.cdcnet_process_downline(b, Instant::now());

		let blocks = upline.borrow();
		let resp = blocks.last().unwrap();
		assert_eq!(resp[OFF_GW_HEADER_TYPE], GW_HT_RESPONSE);
		let status = (resp[OFF_GW_STATUS] as u16) << 8 | resp[OFF_GW_STATUS + 1] as u16;
		assert_eq!(status, GwStatus::Successful as u16);
		// The granted port moved out of privileged space.
		assert_eq!(get_tcp_port(&resp[OFF_GW_AC_SRC_ADDR..]), 21 + PRIVILEGED_PORT_OFFSET);
		assert_eq!(get_id(resp, OFF_GW_AC_TCP_CEP), ordinal as u32);
		drop(blocks);

		assert_eq!(npu.gw.gcb(ordinal).unwrap().tcp_state, TcpConnState::Listening);
	}

	#[test]
	fn received_data_respects_credit_window() {
		let (mut npu, upline, ordinal) = gw_npu();

		{
			let gcb = npu.gw.gcb(ordinal).unwrap();
			gcb.tcp_state = TcpConnState::Connected;
			gcb.link = Link::test();
			gcb.max_upline_block_size = 4;
			gcb.unacked_blocks = 0;
		}

		let before = upline.borrow().len();
		npu.cdcnet_gw_event(ordinal as u32, IoEvent::Data(b"ABCDEFGHIJ".to_vec()), Instant::now());

		let blocks = upline.borrow();
		// 10 bytes in chunks of 4: three MSG blocks.
		assert_eq!(blocks.len() - before, 3);
		assert_eq!(&blocks[before][OFF_DATA..], b"ABCD");
		assert_eq!(bt(blocks[before][OFF_BTBSN]), BT_MSG);
		drop(blocks);

		assert_eq!(npu.gw.gcb(ordinal).unwrap().unacked_blocks, 3);

		// A BACK block returns credit.
		let mut b = npu.pool.get();
		b.set(&[1, 255, 0x41, BT_BACK | 1 << SHIFT_BSN]);
		npu.cdcnet_process_downline(b, Instant::now());
		assert_eq!(npu.gw.gcb(ordinal).unwrap().unacked_blocks, 2);
	}

	#[test]
	fn eof_produces_disconnect_indication() {
		let (mut npu, upline, ordinal) = gw_npu();

		{
			let gcb = npu.gw.gcb(ordinal).unwrap();
			gcb.tcp_state = TcpConnState::Connected;
			gcb.link = Link::test();
			gcb.user_cep_id = 55;
		}

		npu.cdcnet_gw_event(ordinal as u32, IoEvent::Closed, Instant::now());

		let blocks = upline.borrow();
		let di = blocks.last().unwrap();
		assert_eq!(bt(di[OFF_BTBSN]), BT_QMSG);
		assert_eq!(&di[OFF_GW_CMD_NAME..OFF_GW_CMD_NAME + 7], b"TCPDI  ");
		assert_eq!(get_id(di, OFF_GW_I_USER_CEP), 55);
		drop(blocks);

		assert_eq!(npu.gw.gcb(ordinal).unwrap().tcp_state, TcpConnState::Disconnecting);
	}

	#[test]
	fn downline_data_blocks_flow_to_socket() {
		let (mut npu, upline, ordinal) = gw_npu();

		{
			let gcb = npu.gw.gcb(ordinal).unwrap();
			gcb.tcp_state = TcpConnState::Connected;
			gcb.link = Link::test();
		}

		let mut blk = vec![1, 255, 0x41, BT_MSG | 2 << SHIFT_BSN, 0];
		blk.extend_from_slice(b"PAYLOAD");
		let mut b = npu.pool.get();
		b.set(&blk);
		npu.cdcnet_process_downline(b, Instant::now());

		let sent = npu.gw.gcb(ordinal).unwrap().link.sent.clone().unwrap();
		assert_eq!(sent, b"PAYLOAD");

		// The block was acknowledged once fully sent.
		let blocks = upline.borrow();
		let back = blocks.last().unwrap();
		assert_eq!(bt(back[OFF_BTBSN]), BT_BACK);
		assert_eq!(bsn(back[OFF_BTBSN]), 2);
	}
}
