//! Network multiplexer: owns every socket, the NCB and PCB tables, the
//! listeners, and the outbound connect state machine. Inbound bytes and
//! writability are dispatched to the protocol module selected by the
//! connection type configured on the owning NCB.

use core::mem;
use std::io::Write;
use std::net::{SocketAddrV4, TcpStream};
use std::time::{Duration, Instant};

use log::{error, info, warn};
use runtime::{Io, IoEvent, Listener};
use utils::error::*;

use crate::async_tip::AsyncPcb;
use crate::buf::Pool;
use crate::hasp::HaspPcb;
use crate::lip::LipPcb;
use crate::nje::NjePcb;
use crate::tip::{DeviceType, Tcb, TermState, TipType};
use crate::Npu;

pub const MAX_CLA_PORTS: usize = 128;
pub const MAX_TERM_DEFS: usize = 64;

/// Grace period before the first outbound connection attempts, giving
/// NAM time to come up after deadstart.
pub const NAM_STARTUP_TIME: Duration = Duration::from_secs(30);
pub const CONNECTION_RETRY_INTERVAL: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

const CONNECTING_MSG: &str = "\r\nConnecting to host - please wait ...";
const CONNECTED_MSG: &str = "\r\nConnected\r\n";
const ABORT_MSG: &str = "\r\nConnection aborted\r\n";
const NETWORK_DOWN_MSG: &str = "\r\nNetwork going down - connection aborted\r\n";
const NOT_READY_MSG: &str = "\r\nHost not ready to accept connections - please try again later.\r\n";
const NO_PORTS_MSG: &str = "\r\nNo free ports available - please try again later.\r\n";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnType {
	Raw,
	Pterm,
	Rs232,
	Telnet,
	Hasp,
	RevHasp,
	Nje,
	Trunk,
}

impl ConnType {
	/// Types carrying interactive terminal text, eligible for console
	/// courtesy messages.
	pub fn is_async(self) -> bool {
		matches!(self, ConnType::Raw | ConnType::Pterm | ConnType::Rs232 | ConnType::Telnet)
	}

	/// Types that initiate outbound connections.
	pub fn is_client(self) -> bool {
		matches!(self, ConnType::RevHasp | ConnType::Nje | ConnType::Trunk)
	}

	/// Types that accept inbound connections.
	pub fn is_server(self) -> bool {
		!matches!(self, ConnType::RevHasp)
	}

	/// Types whose definitions may share one listening TCP port.
	pub fn may_share_port(self) -> bool {
		matches!(self, ConnType::Nje | ConnType::Trunk)
	}

	/// The TIP servicing terminals of this connection type.
	pub fn tip_type(self) -> Option<TipType> {
		match self {
			ConnType::Raw | ConnType::Pterm | ConnType::Rs232 | ConnType::Telnet => Some(TipType::Async),
			ConnType::Hasp => Some(TipType::Hasp),
			ConnType::RevHasp => Some(TipType::RevHasp),
			ConnType::Nje => Some(TipType::Nje),
			ConnType::Trunk => None,
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NcbState {
	Init,
	Connecting,
	Connected,
	Busy,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegError {
	/// Too many connection types, or a CLA port out of range.
	Ovfl,
	/// Duplicate TCP port.
	DupTcp,
	/// Overlapping CLA port span.
	DupCla,
	/// Resources exhausted.
	NoMem,
}

/// One connection-type definition, as the embedder's configuration
/// delivers it to [`Net::register_conn_type`].
pub struct ConnDef {
	pub tcp_port: u16,
	pub cla_port: u8,
	pub num_ports: u8,
	pub conn_type: ConnType,
	/// Peer host name (outbound definitions and NJE/LIP matching).
	pub host_name: String,
	/// Resolved peer address for outbound definitions.
	pub host_addr: Option<SocketAddrV4>,
	/// NJE maximum block size.
	pub block_size: u16,
	/// NJE keep-alive interval in seconds; 0 disables pings.
	pub ping_interval: u32,
	pub local_ip: u32,
	pub remote_ip: u32,
	/// Coupler node number of the LIP trunk peer.
	pub remote_node: u8,
}

impl ConnDef {
	pub fn new(tcp_port: u16, cla_port: u8, num_ports: u8, conn_type: ConnType) -> Self {
		Self {
			tcp_port,
			cla_port,
			num_ports,
			conn_type,
			host_name: String::new(),
			host_addr: None,
			block_size: 8192,
			ping_interval: 120,
			local_ip: 0,
			remote_ip: 0,
			remote_node: 0,
		}
	}
}

/// Network connection control block: one per listener or outbound trunk.
pub struct Ncb {
	pub state: NcbState,
	pub tcp_port: u16,
	pub cla_port: u8,
	pub num_ports: u8,
	pub conn_type: ConnType,
	pub host_name: String,
	pub host_addr: Option<SocketAddrV4>,
	pub listener: Option<Listener>,
	/// Outbound connect in progress.
	pub pending: Option<Io>,
	pub next_attempt: Option<Instant>,
	pub deadline: Option<Instant>,
	pub block_size: u16,
	pub ping_interval: u32,
	pub local_ip: u32,
	pub remote_ip: u32,
	pub remote_node: u8,
}

/// The per-protocol sub-state stored in a PCB.
pub enum PortControls {
	None,
	Async(AsyncPcb),
	Hasp(HaspPcb),
	Nje(NjePcb),
	Lip(LipPcb),
}

/// The TCP connection owned by a PCB. In unit tests a link can be a
/// plain byte sink instead of a socket.
pub struct Link {
	io: Option<Io>,
	#[cfg(test)]
	pub sent: Option<Vec<u8>>,
}

impl Link {
	pub fn closed() -> Self {
		Self {
			io: None,
			#[cfg(test)]
			sent: None,
		}
	}

	pub fn open(io: Io) -> Self {
		Self {
			io: Some(io),
			#[cfg(test)]
			sent: None,
		}
	}

	#[cfg(test)]
	pub fn test() -> Self {
		Self { io: None, sent: Some(Vec::new()) }
	}

	pub fn is_open(&self) -> bool {
		#[cfg(test)]
		if self.sent.is_some() {
			return true;
		}

		self.io.is_some()
	}

	/// Non-blocking send; returns the number of bytes taken.
	pub fn send(&mut self, data: &[u8]) -> Result<usize> {
		#[cfg(test)]
		if let Some(sent) = &mut self.sent {
			sent.extend_from_slice(data);
			return Ok(data.len());
		}

		match &self.io {
			Some(io) => io.send(data),
			None => Ok(0),
		}
	}

	pub fn want_write(&self, on: bool) {
		if let Some(io) = &self.io {
			io.want_write(on);
		}
	}

	pub fn want_read(&self, on: bool) {
		if let Some(io) = &self.io {
			io.want_read(on);
		}
	}

	pub fn io(&self) -> Option<&Io> {
		self.io.as_ref()
	}

	pub fn close(&mut self) {
		self.io = None;
		#[cfg(test)]
		{
			self.sent = None;
		}
	}

	/// Move the link out, leaving this one closed.
	pub fn take(&mut self) -> Link {
		mem::replace(self, Link::closed())
	}
}

/// Port control block: one per configured CLA port, the canonical owner
/// of the port's socket.
pub struct Pcb {
	pub cla_port: u8,
	/// Index of the owning NCB.
	pub ncb: Option<usize>,
	pub link: Link,
	pub controls: PortControls,
}

pub struct Net {
	pub host_id: String,
	pub pcbs: Vec<Pcb>,
	pub ncbs: Vec<Ncb>,
	pub max_cla_port: u8,
}

impl Net {
	pub fn new(host_id: String) -> Self {
		Self {
			host_id,
			pcbs: (0..MAX_CLA_PORTS as u8)
				.map(|p| Pcb {
					cla_port: p,
					ncb: None,
					link: Link::closed(),
					controls: PortControls::None,
				})
				.collect(),
			ncbs: Vec::new(),
			max_cla_port: 0,
		}
	}

	/// Register a connection type: a TCP port, a span of CLA ports and the
	/// protocol spoken on them. Only NJE and Trunk definitions may share a
	/// TCP port; CLA port spans must never overlap.
	pub fn register_conn_type(&mut self, def: ConnDef, now: Instant) -> core::result::Result<usize, RegError> {
		if self.ncbs.len() >= MAX_TERM_DEFS {
			return Err(RegError::Ovfl);
		}

		if def.tcp_port != 0 {
			for ncb in &self.ncbs {
				if ncb.tcp_port == def.tcp_port
					&& (ncb.conn_type != def.conn_type || !def.conn_type.may_share_port())
				{
					return Err(RegError::DupTcp);
				}
			}
		}

		let limit = def.cla_port as usize + def.num_ports as usize;
		if def.cla_port < 1 || limit > MAX_CLA_PORTS {
			return Err(RegError::Ovfl);
		}

		for port in def.cla_port as usize..limit {
			if self.pcbs[port].ncb.is_some() {
				return Err(RegError::DupCla);
			}
		}

		let idx = self.ncbs.len();
		let ncb = Ncb {
			state: NcbState::Init,
			tcp_port: def.tcp_port,
			cla_port: def.cla_port,
			num_ports: def.num_ports,
			conn_type: def.conn_type,
			host_name: def.host_name,
			host_addr: def.host_addr,
			listener: None,
			pending: None,
			next_attempt: Some(now + NAM_STARTUP_TIME),
			deadline: None,
			block_size: def.block_size,
			ping_interval: def.ping_interval,
			local_ip: def.local_ip,
			remote_ip: def.remote_ip,
			remote_node: def.remote_node,
		};

		for port in def.cla_port as usize..limit {
			self.pcbs[port].ncb = Some(idx);
			self.pcbs[port].controls = preset_controls(&ncb);
		}

		if limit as u8 - 1 > self.max_cla_port {
			self.max_cla_port = limit as u8 - 1;
		}

		self.ncbs.push(ncb);

		Ok(idx)
	}

	/// The PCB of a CLA port.
	pub fn find_pcb(&mut self, cla_port: u8) -> Option<&mut Pcb> {
		self.pcbs.get_mut(cla_port as usize).filter(|p| p.ncb.is_some())
	}

	pub fn conn_type(&self, cla_port: u8) -> Option<ConnType> {
		let pcb = self.pcbs.get(cla_port as usize)?;
		Some(self.ncbs[pcb.ncb?].conn_type)
	}
}

/// Preset the per-protocol controls of a PCB from its NCB.
pub(crate) fn preset_controls(ncb: &Ncb) -> PortControls {
	match ncb.conn_type {
		ConnType::Raw | ConnType::Pterm | ConnType::Rs232 | ConnType::Telnet => {
			PortControls::Async(AsyncPcb::new())
		}
		ConnType::Hasp | ConnType::RevHasp => PortControls::Hasp(HaspPcb::new(ncb.block_size as usize)),
		ConnType::Nje => PortControls::Nje(NjePcb::new(
			ncb.block_size as usize,
			ncb.ping_interval,
			ncb.local_ip,
			ncb.remote_ip,
		)),
		ConnType::Trunk => PortControls::Lip(LipPcb::new(ncb.remote_node)),
	}
}

/// Append data to a terminal's output queue, reusing the tail buffer if
/// it does not already carry a sequence number to acknowledge.
pub(crate) fn queue_output(pool: &mut Pool, tcb: &mut Tcb, mut data: &[u8]) {
	let need_new = match tcb.output_q.last_mut() {
		Some(b) => b.block_seq_no != 0,
		None => true,
	};
	if need_new {
		tcb.output_q.append(pool.get());
	}

	while !data.is_empty() {
		let b = tcb.output_q.last_mut().expect("queue tail just ensured");
		let n = b.append(data);
		data = &data[n..];

		if !data.is_empty() {
			tcb.output_q.append(pool.get());
		}
	}
}

/// Record a block sequence number to acknowledge once the queued output
/// ahead of it has been sent.
pub(crate) fn queue_ack(pool: &mut Pool, tcb: &mut Tcb, bsn_bits: u8) {
	let need_new = match tcb.output_q.last_mut() {
		Some(b) => b.block_seq_no != 0,
		None => true,
	};
	if need_new {
		tcb.output_q.append(pool.get());
	}

	tcb.output_q.last_mut().expect("queue tail just ensured").block_seq_no = bsn_bits;
}

/// Best-effort console courtesy message on a raw, not yet linked socket.
fn console_msg_stream(stream: &TcpStream, conn_type: ConnType, msg: &str) {
	if conn_type.is_async() {
		let _ = (&*stream).write(msg.as_bytes());
	}
}

impl Npu {
	/// Create the listening sockets once all connection types have been
	/// registered. NJE and Trunk definitions sharing a TCP port listen
	/// once, on the first definition.
	pub(crate) fn start_network(&mut self) {
		let Some(fwds) = &self.fwds else { return };

		for idx in 0..self.net.ncbs.len() {
			let ncb = &self.net.ncbs[idx];
			if !ncb.conn_type.is_server() || ncb.tcp_port == 0 {
				continue;
			}
			if self.net.ncbs[..idx].iter().any(|n| n.tcp_port == self.net.ncbs[idx].tcp_port) {
				// Another definition already listens on this port.
				continue;
			}

			match runtime::listen(self.net.ncbs[idx].tcp_port) {
				Ok(sock) => {
					let lstn = Listener::new(sock, idx as u32, fwds.lstn.clone());
					self.net.ncbs[idx].listener = Some(lstn);
				}
				Err(err) => {
					error!("Can't listen on port {}: {err}", self.net.ncbs[idx].tcp_port);
				}
			}
		}
	}

	/// A listener accepted a connection.
	pub(crate) fn net_accept(&mut self, ncb_idx: u32, stream: TcpStream, now: Instant) {
		let idx = ncb_idx as usize;
		let conn_type = self.net.ncbs[idx].conn_type;

		if !self.svm.is_ready() {
			console_msg_stream(&stream, conn_type, NOT_READY_MSG);
			self.net.ncbs[idx].state = NcbState::Init;
			return;
		}

		// Find a free PCB in the NCB's CLA port span; NJE and Trunk may
		// also borrow a free PCB of a definition sharing the TCP port.
		let ncb = &self.net.ncbs[idx];
		let span = ncb.cla_port..ncb.cla_port + ncb.num_ports;
		let mut port = span.clone().find(|&p| !self.net.pcbs[p as usize].link.is_open());

		if port.is_none() && conn_type.may_share_port() {
			let tcp_port = ncb.tcp_port;
			port = (0..=self.net.max_cla_port).find(|&p| {
				let pcb = &self.net.pcbs[p as usize];
				!pcb.link.is_open()
					&& pcb.ncb.is_some_and(|n| {
						let other = &self.net.ncbs[n];
						other.conn_type == conn_type && other.tcp_port == tcp_port
					})
			});
		}

		let Some(port) = port else {
			console_msg_stream(&stream, conn_type, NO_PORTS_MSG);
			self.net.ncbs[idx].state = NcbState::Init;
			return;
		};

		let Some(fwds) = &self.fwds else { return };
		let io = Io::new(stream, port as u32, fwds.pcb.clone());
		self.net.pcbs[port as usize].link = Link::open(io);

		if self.notify_net_connect(port, true, now) {
			self.console_msg_pcb(port, CONNECTING_MSG);
			self.net.ncbs[idx].state = NcbState::Connected;
		} else {
			self.console_msg_pcb(port, ABORT_MSG);
			self.net.pcbs[port as usize].link.close();
			self.net.ncbs[idx].state = NcbState::Init;
		}
	}

	/// Progress on an outbound connect.
	pub(crate) fn ncb_conn_event(&mut self, ncb_idx: u32, ev: IoEvent, now: Instant) {
		let idx = ncb_idx as usize;
		let ncb = &mut self.net.ncbs[idx];

		let Some(io) = ncb.pending.take() else { return };

		let failed = match ev {
			IoEvent::Writable => match io.take_error() {
				Ok(None) => false,
				Ok(Some(err)) | Err(err) => {
					warn!("Failed to connect to host {}:{}: {err}", ncb.host_name, ncb.tcp_port);
					true
				}
			},
			_ => true,
		};

		if failed {
			ncb.state = NcbState::Init;
			ncb.next_attempt = Some(now + CONNECTION_RETRY_INTERVAL);
			return;
		}

		info!("Connected to host {}:{}", ncb.host_name, ncb.tcp_port);
		io.set_connected();

		// Attach the socket to a free PCB in the span.
		let span = ncb.cla_port..ncb.cla_port + ncb.num_ports;
		let port = span.clone().find(|&p| !self.net.pcbs[p as usize].link.is_open());

		let Some(port) = port else {
			warn!("Free PCB not found for active connection to {}", self.net.ncbs[idx].host_name);
			self.net.ncbs[idx].state = NcbState::Busy;
			return;
		};

		let Some(fwds) = &self.fwds else { return };
		io.set_route(port as u32, fwds.pcb.clone());
		self.net.pcbs[port as usize].link = Link::open(io);

		if self.notify_net_connect(port, false, now) {
			self.net.ncbs[idx].state = NcbState::Connected;
		} else {
			self.net.pcbs[port as usize].link.close();
			self.net.ncbs[idx].state = NcbState::Init;
			self.net.ncbs[idx].next_attempt = Some(now + CONNECTION_RETRY_INTERVAL);
		}
	}

	/// Readiness event on a PCB's socket.
	pub(crate) fn pcb_event(&mut self, port: u8, ev: IoEvent, now: Instant) {
		if self.net.find_pcb(port).is_none_or(|p| !p.link.is_open()) {
			return;
		}

		match ev {
			IoEvent::Data(data) => self.process_upline(port, &data, now),
			IoEvent::Writable => self.try_output(port, now),
			IoEvent::Closed => self.notify_net_disconnect(port, now),
		}
	}

	fn process_upline(&mut self, port: u8, data: &[u8], now: Instant) {
		match self.net.conn_type(port) {
			Some(ConnType::Telnet) => self.async_process_telnet_data(port, data, now),
			Some(ConnType::Raw | ConnType::Pterm | ConnType::Rs232) => {
				self.async_process_upline_data(port, data, now)
			}
			Some(ConnType::Hasp | ConnType::RevHasp) => self.hasp_process_upline(port, data, now),
			Some(ConnType::Nje) => self.nje_process_upline(port, data, now),
			Some(ConnType::Trunk) => self.lip_process_upline(port, data, now),
			None => {}
		}
	}

	/// Attempt to drain the output queues of a port, and run its
	/// per-protocol timeout bookkeeping.
	pub(crate) fn try_output(&mut self, port: u8, now: Instant) {
		match self.net.conn_type(port) {
			Some(ct) if ct.is_async() => self.async_try_output(port, now),
			Some(ConnType::Hasp | ConnType::RevHasp) => self.hasp_try_output(port, now),
			Some(ConnType::Nje) => self.nje_try_output(port, now),
			Some(ConnType::Trunk) => self.lip_try_output(port, now),
			_ => {}
		}
	}

	fn notify_net_connect(&mut self, port: u8, passive: bool, now: Instant) -> bool {
		match self.net.conn_type(port) {
			Some(ct) if ct.is_async() => self.async_notify_net_connect(port, passive),
			Some(ConnType::Hasp | ConnType::RevHasp) => self.hasp_notify_net_connect(port, passive, now),
			Some(ConnType::Nje) => self.nje_notify_net_connect(port, passive, now),
			Some(ConnType::Trunk) => self.lip_notify_net_connect(port, passive, now),
			_ => false,
		}
	}

	pub(crate) fn notify_net_disconnect(&mut self, port: u8, now: Instant) {
		match self.net.conn_type(port) {
			Some(ct) if ct.is_async() => self.async_notify_net_disconnect(port, now),
			Some(ConnType::Hasp | ConnType::RevHasp) => self.hasp_notify_net_disconnect(port, now),
			Some(ConnType::Nje) => self.nje_notify_net_disconnect(port, now),
			Some(ConnType::Trunk) => self.lip_notify_net_disconnect(port, now),
			_ => {}
		}
	}

	/// Close the connection owned by a PCB and reset its protocol state.
	pub(crate) fn close_pcb(&mut self, port: u8, now: Instant) {
		let Some(pcb) = self.net.find_pcb(port) else { return };

		if pcb.link.is_open() {
			pcb.link.close();

			if let Some(idx) = pcb.ncb {
				let ncb = &mut self.net.ncbs[idx];
				if ncb.conn_type.is_client() || ncb.state == NcbState::Busy {
					ncb.state = NcbState::Init;
					ncb.next_attempt = Some(now + CONNECTION_RETRY_INTERVAL);
				}
			}

			self.reset_pcb_controls(port);
		}
	}

	pub(crate) fn reset_pcb_controls(&mut self, port: u8) {
		match self.net.conn_type(port) {
			Some(ct) if ct.is_async() => self.async_reset_pcb(port),
			Some(ConnType::Hasp | ConnType::RevHasp) => self.hasp_reset_pcb(port),
			Some(ConnType::Nje) => self.nje_reset_pcb(port),
			Some(ConnType::Trunk) => self.lip_reset_pcb(port),
			_ => {}
		}
	}

	/// Best-effort console courtesy message on an established link.
	pub(crate) fn console_msg_pcb(&mut self, port: u8, msg: &str) {
		let is_async = self.net.conn_type(port).is_some_and(|ct| ct.is_async());
		if is_async {
			if let Some(pcb) = self.net.find_pcb(port) {
				let _ = pcb.link.send(msg.as_bytes());
			}
		}
	}

	/// The host reported the terminal connected.
	pub(crate) fn net_connected(&mut self, cn: u8) {
		let tcb = &self.tcbs[cn];
		if tcb.device_type == DeviceType::Console {
			let port = tcb.port;
			self.console_msg_pcb(port, CONNECTED_MSG);
		}
	}

	/// The host reported the terminal disconnected, or rejected it.
	pub(crate) fn net_disconnected(&mut self, cn: u8, now: Instant) {
		let tcb = &self.tcbs[cn];
		let port = tcb.port;
		if tcb.device_type == DeviceType::Console {
			self.close_pcb(port, now);
		}
		self.tcbs.set_max_cn(cn);
		info!("Connection dropped on port {port}");
	}

	/// Per-tick network service: initiate and time out outbound connects.
	pub(crate) fn net_check(&mut self, now: Instant) {
		for idx in 0..self.net.ncbs.len() {
			let ncb = &mut self.net.ncbs[idx];
			if !ncb.conn_type.is_client() {
				continue;
			}

			match ncb.state {
				NcbState::Init => {
					if !self.svm.is_ready() {
						continue;
					}
					if ncb.next_attempt.is_some_and(|t| now < t) {
						continue;
					}
					ncb.next_attempt = Some(now + CONNECTION_RETRY_INTERVAL);

					let Some(addr) = ncb.host_addr else { continue };
					let Some(fwds) = &self.fwds else { continue };

					match runtime::connect(addr) {
						Ok(stream) => {
							info!("Initiated connection to host {}:{}", ncb.host_name, ncb.tcp_port);
							ncb.pending = Some(Io::connecting(stream, idx as u32, fwds.conn.clone()));
							ncb.state = NcbState::Connecting;
							ncb.deadline = Some(now + CONNECT_TIMEOUT);
						}
						Err(err) => {
							warn!("Failed to connect to host {}:{}: {err}", ncb.host_name, ncb.tcp_port);
						}
					}
				}
				NcbState::Connecting => {
					if ncb.deadline.is_some_and(|t| now >= t) {
						warn!("Connection timeout to host {}:{}", ncb.host_name, ncb.tcp_port);
						ncb.pending = None;
						ncb.state = NcbState::Init;
						ncb.next_attempt = Some(now + CONNECTION_RETRY_INTERVAL);
					}
				}
				_ => {}
			}
		}
	}

	/// Network reset: the host is going down. Notify interactive users,
	/// close every connection, release every TCB.
	pub(crate) fn net_reset(&mut self, now: Instant) {
		for cn in (1..=self.tcbs.max_cn).rev() {
			if self.tcbs[cn].state == TermState::Idle {
				continue;
			}
			let port = self.tcbs[cn].port;
			let is_console = self.tcbs[cn].device_type == DeviceType::Console;
			let is_pterm = self.net.conn_type(port) == Some(ConnType::Pterm);

			if is_console && !is_pterm {
				self.console_msg_pcb(port, NETWORK_DOWN_MSG);
			}
			self.close_pcb(port, now);
			let tcb = &mut self.tcbs[cn];
			tcb.state = TermState::Idle;
			tcb.output_q.release_all(&mut self.pool);
			self.tcbs.set_max_cn(cn);
		}

		for port in 0..=self.net.max_cla_port {
			self.close_pcb(port, now);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn now() -> Instant {
		Instant::now()
	}

	#[test]
	fn duplicate_tcp_ports() {
		let mut net = Net::new("CYBER1".into());

		net.register_conn_type(ConnDef::new(6610, 1, 4, ConnType::Telnet), now()).unwrap();

		// Another type on the same TCP port is rejected.
		let err = net
			.register_conn_type(ConnDef::new(6610, 10, 2, ConnType::Hasp), now())
			.unwrap_err();
		assert_eq!(err, RegError::DupTcp);

		// Multiple NJE definitions may share a listening port.
		net.register_conn_type(ConnDef::new(175, 20, 1, ConnType::Nje), now()).unwrap();
		net.register_conn_type(ConnDef::new(175, 21, 1, ConnType::Nje), now()).unwrap();
	}

	#[test]
	fn overlapping_cla_spans() {
		let mut net = Net::new("CYBER1".into());

		net.register_conn_type(ConnDef::new(6610, 1, 4, ConnType::Telnet), now()).unwrap();
		let err = net
			.register_conn_type(ConnDef::new(6611, 3, 4, ConnType::Raw), now())
			.unwrap_err();
		assert_eq!(err, RegError::DupCla);

		// CLA port 0 is reserved.
		let err = net
			.register_conn_type(ConnDef::new(6612, 0, 1, ConnType::Raw), now())
			.unwrap_err();
		assert_eq!(err, RegError::Ovfl);
	}

	#[test]
	fn queue_output_reuses_tail() {
		let mut pool = Pool::new();
		let mut tcbs = crate::tip::TcbTable::new();
		let tcb = &mut tcbs[1];

		queue_output(&mut pool, tcb, b"abc");
		queue_output(&mut pool, tcb, b"def");
		let b = tcb.output_q.extract().unwrap();
		assert_eq!(b.bytes(), b"abcdef");
		pool.release(b);

		// A tail carrying an ack is not appended to.
		queue_output(&mut pool, tcb, b"abc");
		queue_ack(&mut pool, tcb, 2 << crate::block::SHIFT_BSN);
		queue_output(&mut pool, tcb, b"def");
		let first = tcb.output_q.extract().unwrap();
		let second = tcb.output_q.extract().unwrap();
		assert_eq!(first.bytes(), b"abc");
		assert_ne!(first.block_seq_no, 0);
		assert_eq!(second.bytes(), b"def");
		pool.release(first);
		pool.release(second);
	}
}
