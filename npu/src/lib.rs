//! Emulation of a CDC 2550 NPU front end running CCP: the block
//! interface to the channel peer, the service message dialogue with the
//! host, and the terminal, trunk and gateway protocol modules bridging
//! NAM traffic onto TCP/IP.
//!
//! All protocol state lives in one [`Npu`] value. Run as a `stakker`
//! actor ([`Npu::init`]) it owns its sockets through the `runtime`
//! reactor; the channel peer drives it through the order-word entry
//! points and receives upline blocks through the handler given at
//! construction.

use std::net::TcpStream;
use std::time::{Duration, Instant};

use log::warn;
use runtime::IoEvent;
use stakker::{fwd_to, Fwd, CX};

pub mod async_tip;
pub mod bip;
pub mod block;
pub mod buf;
pub mod cdcnet;
pub mod dsa311;
pub mod hasp;
pub mod lip;
pub mod net;
pub mod nje;
pub mod svm;
pub mod tip;

use bip::{Bip, Staged, UplineHandler};
use block::*;
use buf::{Buffer, Pool, MAX_BUFFER};
use cdcnet::Gateway;
use net::{ConnDef, Net};
use svm::Svm;
use tip::TcbTable;

/// Node numbers of the emulated configuration: the coupler (host side),
/// this NPU, and the CDCNet gateway pseudo-node.
#[derive(Clone, Copy)]
pub struct Nodes {
	pub coupler: u8,
	pub npu: u8,
	pub cdcnet: u8,
}

impl Default for Nodes {
	fn default() -> Self {
		Self { coupler: 1, npu: 2, cdcnet: 255 }
	}
}

/// Everything the embedder configures before the NPU starts.
pub struct NpuConfig {
	/// This host's name, used in LIP and NJE handshakes.
	pub host_id: String,
	pub nodes: Nodes,
	pub conn_types: Vec<ConnDef>,
}

/// Forwarders routing reactor events back into the actor.
pub(crate) struct NetFwds {
	pub pcb: Fwd<(u32, IoEvent)>,
	pub lstn: Fwd<(u32, TcpStream)>,
	pub conn: Fwd<(u32, IoEvent)>,
	pub gw: Fwd<(u32, IoEvent)>,
	pub gw_lstn: Fwd<(u32, TcpStream)>,
}

pub struct Npu {
	pub(crate) nodes: Nodes,
	pub(crate) pool: Pool,
	pub(crate) bip: Bip,
	pub(crate) svm: Svm,
	pub(crate) tcbs: TcbTable,
	pub(crate) net: Net,
	pub(crate) gw: Gateway,
	pub(crate) fwds: Option<NetFwds>,
}

impl Npu {
	/// Build an NPU with its connection types registered but no sockets;
	/// [`Npu::init`] wires the network side up.
	pub fn new(cfg: NpuConfig, peer: UplineHandler) -> Self {
		let mut npu = Self {
			nodes: cfg.nodes,
			pool: Pool::new(),
			bip: Bip::new(peer),
			svm: Svm::new(),
			tcbs: TcbTable::new(),
			net: Net::new(cfg.host_id),
			gw: Gateway::new(),
			fwds: None,
		};

		let now = Instant::now();
		for def in cfg.conn_types {
			let port = def.cla_port;
			if let Err(err) = npu.net.register_conn_type(def, now) {
				warn!("Registration of connection type at CLA port {port} failed: {err:?}");
			}
		}

		npu
	}

	/// Actor entry point: registers listeners and starts the service
	/// tick.
	pub fn init(cx: CX![], cfg: NpuConfig, peer: UplineHandler) -> Option<Self> {
		let mut this = Self::new(cfg, peer);

		this.fwds = Some(NetFwds {
			pcb: fwd_to!([cx], pcb_io() as (u32, IoEvent)),
			lstn: fwd_to!([cx], lstn_accept() as (u32, TcpStream)),
			conn: fwd_to!([cx], conn_io() as (u32, IoEvent)),
			gw: fwd_to!([cx], gw_io() as (u32, IoEvent)),
			gw_lstn: fwd_to!([cx], gw_accept() as (u32, TcpStream)),
		});

		this.start_network();
		this.schedule(cx);

		Some(this)
	}

	fn schedule(&mut self, cx: CX![]) {
		let actor = cx.access_actor().clone();
		cx.after(Duration::from_millis(100), move |s| {
			actor.apply(s, |this, cx| {
				this.check_status(cx.now());
				this.schedule(cx);
			})
		});
	}

	fn pcb_io(&mut self, cx: CX![], token: u32, ev: IoEvent) {
		self.pcb_event(token as u8, ev, cx.now());
	}

	fn lstn_accept(&mut self, cx: CX![], token: u32, stream: TcpStream) {
		self.net_accept(token, stream, cx.now());
	}

	fn conn_io(&mut self, cx: CX![], token: u32, ev: IoEvent) {
		self.ncb_conn_event(token, ev, cx.now());
	}

	fn gw_io(&mut self, cx: CX![], token: u32, ev: IoEvent) {
		self.cdcnet_gw_event(token, ev, cx.now());
	}

	fn gw_accept(&mut self, cx: CX![], token: u32, stream: TcpStream) {
		self.cdcnet_gw_accept(token, stream, cx.now());
	}

	/// Whether the host has taken up supervision.
	pub fn is_ready(&self) -> bool {
		self.svm.is_ready()
	}

	/// Full reset: the host network is going down.
	pub fn reset(&mut self) {
		let now = Instant::now();
		self.net_reset(now);
		self.cdcnet_reset();
		self.bip.reset(&mut self.pool);
		self.svm.reset();
	}

	/// Order word: the peer has a service message to transfer.
	pub fn notify_service_message(&mut self) {
		self.bip.notify_service_message(&mut self.pool);
	}

	/// Order word: the peer has a data block of the given priority.
	pub fn notify_data(&mut self, priority: u8) {
		self.bip.notify_data(&mut self.pool, priority);
	}

	/// The staged downline buffer, for the peer to fill before
	/// `notify_downline_received`.
	pub fn request_downline_block(&mut self) -> Option<&mut Buffer> {
		self.bip.request_downline()
	}

	/// Order word: the downline transfer completed; dispatch the block
	/// by its destination node.
	pub fn notify_downline_received(&mut self) {
		let now = Instant::now();

		if let Some((staged, buf)) = self.bip.finish_downline() {
			let dn = buf.data[OFF_DN];

			if dn == self.nodes.coupler {
				match staged {
					Staged::Svm => self.svm_process_buffer(buf, now),
					Staged::Data(priority) => self.tip_process_buffer(buf, priority, now),
				}
			} else if dn == self.nodes.cdcnet {
				self.cdcnet_process_downline(buf, now);
			} else {
				self.lip_process_downline(buf, now);
			}
		}

		self.bip.kick_upline();
	}

	/// Deliver a complete downline block in one call: fill the staged
	/// buffer and dispatch it.
	pub fn process_downline_block(&mut self, data: &[u8]) {
		if data.len() > MAX_BUFFER {
			warn!("Downline block of {} bytes exceeds the buffer size", data.len());
			self.abort_downline_received();
			return;
		}

		match self.bip.request_downline() {
			Some(buf) => buf.set(data),
			None => {
				warn!("Downline block delivered without an order word");
				return;
			}
		}

		self.notify_downline_received();
	}

	/// Order word: the downline transfer was aborted.
	pub fn abort_downline_received(&mut self) {
		self.bip.abort_downline(&mut self.pool);
	}

	/// Order word: the peer consumed the in-flight upline block.
	pub fn notify_upline_sent(&mut self) {
		self.bip.notify_upline_sent(&mut self.pool);
	}

	/// Order word: re-present the in-flight upline block.
	pub fn retry_input(&mut self) {
		self.bip.retry_input();
	}

	/// Periodic service: connect progress, per-port output and timeout
	/// bookkeeping, gateway state machines. The actor tick calls this;
	/// an embedder driving the NPU directly calls it once per cycle.
	pub fn check_status(&mut self, now: Instant) {
		self.net_check(now);

		for port in 0..=self.net.max_cla_port {
			if self.net.pcbs[port as usize].link.is_open() {
				self.try_output(port, now);
			}
		}

		self.cdcnet_check_status(now);
	}
}

#[cfg(test)]
pub(crate) fn test_npu() -> (
	Npu,
	std::rc::Rc<std::cell::RefCell<Vec<Vec<u8>>>>,
) {
	use std::cell::RefCell;
	use std::rc::Rc;

	let seen = Rc::new(RefCell::new(Vec::new()));
	let sink = seen.clone();
	let peer: UplineHandler = Box::new(move |b: &[u8]| sink.borrow_mut().push(b.to_vec()));

	let cfg = NpuConfig {
		host_id: "CYBER1".into(),
		nodes: Nodes::default(),
		conn_types: Vec::new(),
	};

	let mut npu = Npu::new(cfg, peer);
	npu.bip.auto_ack = true;

	(npu, seen)
}

#[cfg(test)]
impl Npu {
	/// Register a raw async port, open a test link on it, and attach a
	/// connected console terminal with CN `cn`. The CLA port equals `cn`.
	pub(crate) fn test_async_port(&mut self, cn: u8) -> u8 {
		let def = ConnDef::new(6000 + cn as u16, cn, 1, net::ConnType::Raw);
		self.net.register_conn_type(def, Instant::now()).unwrap();
		self.net.pcbs[cn as usize].link = net::Link::test();
		self.test_attach_tcb(cn, cn, tip::TipType::Async);
		cn
	}

	/// Attach a connected terminal to a registered port.
	pub(crate) fn test_attach_tcb(&mut self, cn: u8, port: u8, tip_type: tip::TipType) {
		let nodes = self.nodes;
		let tcb = self.tcbs.reset_slot(cn);
		tcb.port = port;
		tcb.tip_type = tip_type;
		tcb.owning_console = cn;
		tcb.state = tip::TermState::HostConnected;
		tcb.term_name.copy_from_slice(b"TERM01 ");
		tip::input_reset(tcb, nodes);
		self.tcbs.set_max_cn(cn);
	}

	/// Bytes written to a test link so far.
	pub(crate) fn test_port_output(&mut self, port: u8) -> Vec<u8> {
		self.net.pcbs[port as usize].link.sent.clone().unwrap_or_default()
	}

	pub(crate) fn test_clear_port_output(&mut self, port: u8) {
		if let Some(sent) = &mut self.net.pcbs[port as usize].link.sent {
			sent.clear();
		}
	}

	pub(crate) fn test_lip_state(&mut self, port: u8) -> lip::LipState {
		match &self.net.pcbs[port as usize].controls {
			net::PortControls::Lip(l) => l.state,
			_ => panic!("not a trunk port"),
		}
	}

	pub(crate) fn test_nje_state(&mut self, port: u8) -> nje::NjeState {
		match &self.net.pcbs[port as usize].controls {
			net::PortControls::Nje(n) => n.state,
			_ => panic!("not an NJE port"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn downline_dispatch_releases_unroutable_blocks() {
		let (mut npu, _upline) = test_npu();
		let count = npu.pool.count();

		// A data block for an unknown trunk node is dropped and its
		// buffer returns to the pool.
		npu.notify_data(0);
		npu.process_downline_block(&[9, 2, 0, block::BT_MSG, 0, 1, 2, 3]);
		assert_eq!(npu.pool.count(), count);

		// Same for a gateway block with an unknown connection number.
		npu.notify_service_message();
		npu.process_downline_block(&[255, 2, 0x55, block::BT_MSG, 0, 1, 2]);
		assert_eq!(npu.pool.count(), count);

		// And for a terminal block with an unknown CN.
		npu.notify_data(1);
		npu.process_downline_block(&[1, 2, 0x40, block::BT_MSG, 0, 1, 2]);
		assert_eq!(npu.pool.count(), count);
	}

	#[test]
	fn downline_without_order_word_is_refused() {
		let (mut npu, upline) = test_npu();

		npu.process_downline_block(&[1, 2, 0, block::BT_CMD, 0x0E, 0x8A]);
		assert!(upline.borrow().is_empty());
		assert!(!npu.is_ready());
	}

	#[test]
	fn reset_returns_to_idle() {
		let (mut npu, _upline) = test_npu();
		npu.svm.set_ready();
		let port = npu.test_async_port(0x15);

		npu.reset();

		assert!(!npu.is_ready());
		assert_eq!(npu.tcbs.max_cn, 0);
		assert!(!npu.net.pcbs[port as usize].link.is_open());
		assert_eq!(npu.pool.count(), buf::NUM_BUFFERS);
	}
}
