//! LIP trunk: host-to-host links relaying whole NAM blocks between two
//! front ends. A line-oriented CONNECT handshake establishes the link;
//! after that, blocks travel with a 2-byte big-endian length prefix, and
//! zero-length blocks serve as pings.

use std::time::{Duration, Instant};

use log::warn;

use crate::buf::{Buffer, Queue, MAX_BUFFER};
use crate::net::{ConnType, NcbState};
use crate::Npu;

/// A trunk with no exchange for longer than this gets pinged; a peer that
/// stays silent during connection establishment is dropped.
pub const MAX_IDLE_TIME: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LipState {
	Disconnected,
	RcvConnReq,
	SndConnReq,
	RcvConnResp,
	RcvBlockLengthHi,
	RcvBlockLengthLo,
	RcvBlockContent,
}

/// LIP sub-state of a trunk PCB.
pub struct LipPcb {
	pub state: LipState,
	/// Coupler node number of the peer front end.
	pub remote_node: u8,
	pub last_exchange: Option<Instant>,
	/// Declared length of the block being collected.
	pub block_length: usize,
	/// Handshake line / block content staging.
	pub staging: Vec<u8>,
	/// Frame currently being written to the socket.
	pub wire: Vec<u8>,
	pub wire_off: usize,
	pub output_q: Queue,
}

impl LipPcb {
	pub fn new(remote_node: u8) -> Self {
		Self {
			state: LipState::Disconnected,
			remote_node,
			last_exchange: None,
			block_length: 0,
			staging: Vec::new(),
			wire: Vec::new(),
			wire_off: 0,
			output_q: Queue::default(),
		}
	}

	fn is_active(&self) -> bool {
		matches!(
			self.state,
			LipState::RcvConnResp
				| LipState::RcvBlockLengthHi
				| LipState::RcvBlockLengthLo
				| LipState::RcvBlockContent
		)
	}
}

fn lip_controls(npu: &mut Npu, port: u8) -> Option<&mut LipPcb> {
	match &mut npu.net.pcbs[port as usize].controls {
		crate::net::PortControls::Lip(l) => Some(l),
		_ => None,
	}
}

impl Npu {
	pub(crate) fn lip_notify_net_connect(&mut self, port: u8, passive: bool, now: Instant) -> bool {
		self.lip_reset_pcb(port);

		let Some(ctl) = lip_controls(self, port) else { return false };
		ctl.last_exchange = Some(now);
		ctl.state = if passive { LipState::RcvConnReq } else { LipState::SndConnReq };

		true
	}

	pub(crate) fn lip_notify_net_disconnect(&mut self, port: u8, now: Instant) {
		let active = lip_controls(self, port).is_some_and(|c| c.is_active());
		if active {
			self.lip_deactivate_trunk(port);
		}
		self.close_pcb(port, now);
		if let Some(ctl) = lip_controls(self, port) {
			ctl.state = LipState::Disconnected;
		}
	}

	pub(crate) fn lip_reset_pcb(&mut self, port: u8) {
		let Npu { net, pool, .. } = self;
		if let crate::net::PortControls::Lip(ctl) = &mut net.pcbs[port as usize].controls {
			ctl.state = LipState::Disconnected;
			ctl.last_exchange = None;
			ctl.block_length = 0;
			ctl.staging.clear();
			ctl.wire.clear();
			ctl.wire_off = 0;
			ctl.output_q.release_all(pool);
		}
	}

	/// Consume bytes arriving on a trunk.
	pub(crate) fn lip_process_upline(&mut self, port: u8, data: &[u8], now: Instant) {
		{
			let Some(ctl) = lip_controls(self, port) else { return };
			ctl.last_exchange = Some(now);
		}

		let mut i = 0;
		loop {
			let Some(ctl) = lip_controls(self, port) else { return };

			match ctl.state {
				LipState::Disconnected => return,

				LipState::RcvConnReq | LipState::RcvConnResp => {
					let receiving_request = ctl.state == LipState::RcvConnReq;

					if ctl.staging.len() + data.len() - i >= MAX_BUFFER {
						warn!("Staging overflow during trunk connection establishment");
						ctl.state = LipState::Disconnected;
						return;
					}
					ctl.staging.extend_from_slice(&data[i..]);

					if ctl.staging.last() == Some(&b'\n') {
						let ok = if receiving_request {
							self.lip_process_connect_request(port, now)
						} else {
							match self.lip_process_connect_response(port) {
								true => {
									if let Some(ctl) = lip_controls(self, port) {
										ctl.state = LipState::RcvBlockLengthHi;
										ctl.staging.clear();
									}
									true
								}
								false => false,
							}
						};

						if !ok {
							self.close_pcb(port, now);
							if let Some(ctl) = lip_controls(self, port) {
								ctl.state = LipState::Disconnected;
							}
						}
					}
					return;
				}

				LipState::SndConnReq => {
					// Output side sends the CONNECT line; discard input.
					return;
				}

				LipState::RcvBlockLengthHi => {
					if i >= data.len() {
						return;
					}
					ctl.block_length = (data[i] as usize) << 8;
					i += 1;
					ctl.state = LipState::RcvBlockLengthLo;
				}

				LipState::RcvBlockLengthLo => {
					if i >= data.len() {
						return;
					}
					ctl.block_length |= data[i] as usize;
					i += 1;

					if ctl.block_length > MAX_BUFFER {
						warn!("Invalid block length {} received on trunk port {port}", ctl.block_length);
						self.lip_notify_net_disconnect(port, now);
						return;
					} else if ctl.block_length < 1 {
						// Zero-length block: keep-alive ping.
						ctl.state = LipState::RcvBlockLengthHi;
					} else {
						ctl.staging.clear();
						ctl.state = LipState::RcvBlockContent;
					}
				}

				LipState::RcvBlockContent => {
					if i >= data.len() {
						return;
					}
					let need = ctl.block_length - ctl.staging.len();
					let take = need.min(data.len() - i);
					ctl.staging.extend_from_slice(&data[i..i + take]);
					i += take;

					if ctl.staging.len() >= ctl.block_length {
						let block = std::mem::take(&mut ctl.staging);
						ctl.state = LipState::RcvBlockLengthHi;
						self.bip.request_upline_canned(&mut self.pool, &block);
					}
				}
			}
		}
	}

	/// Route a downline block to the trunk serving its destination node,
	/// or turn blocks addressed to the local coupler around.
	pub(crate) fn lip_process_downline(&mut self, buf: Buffer, now: Instant) {
		let dn = buf.data[crate::block::OFF_DN];

		if dn == self.nodes.coupler {
			self.bip.request_upline(buf);
			return;
		}

		let found = (0..=self.net.max_cla_port).find(|&p| {
			let pcb = &self.net.pcbs[p as usize];
			pcb.link.is_open()
				&& pcb.ncb.is_some_and(|n| self.net.ncbs[n].conn_type == ConnType::Trunk)
				&& matches!(&pcb.controls, crate::net::PortControls::Lip(l) if l.remote_node == dn)
		});

		match found {
			Some(port) => {
				if let Some(ctl) = lip_controls(self, port) {
					ctl.output_q.append(buf);
				}
				self.lip_try_output(port, now);
			}
			None => {
				warn!("Block received for unknown or disconnected node {dn:02x}");
				self.pool.release(buf);
			}
		}
	}

	/// Parse a CONNECT request and answer it. On success the socket may
	/// be reassigned to the PCB owning the matching trunk definition.
	fn lip_process_connect_request(&mut self, port: u8, now: Instant) -> bool {
		let staging = match lip_controls(self, port) {
			Some(ctl) => std::mem::take(&mut ctl.staging),
			None => return false,
		};
		let text = String::from_utf8_lossy(&staging).into_owned();
		let mut tokens = text.split_whitespace();

		if !tokens.next().is_some_and(|t| t.eq_ignore_ascii_case("CONNECT")) {
			return false;
		}
		let Some(peer_name) = tokens.next() else { return false };
		let Some(peer_node) = tokens.next().and_then(|t| t.parse::<u8>().ok()).filter(|&n| n >= 1)
		else {
			return false;
		};
		let Some(local_node) = tokens.next().and_then(|t| t.parse::<u8>().ok()).filter(|&n| n >= 1)
		else {
			return false;
		};

		// Find the trunk definition matching the peer.
		let target = (0..=self.net.max_cla_port).find(|&p| {
			let pcb = &self.net.pcbs[p as usize];
			pcb.ncb.is_some_and(|n| {
				let ncb = &self.net.ncbs[n];
				ncb.conn_type == ConnType::Trunk && ncb.host_name.eq_ignore_ascii_case(peer_name)
			}) && matches!(&pcb.controls, crate::net::PortControls::Lip(l) if l.remote_node == peer_node)
		});

		let host_id = self.net.host_id.clone();
		let coupler = self.nodes.coupler;

		let (status, response) = match target {
			None => (401, format!("401 {peer_name} {peer_node} unknown peer\n")),
			Some(target) => {
				if coupler != local_node {
					(402, format!("402 {host_id} {local_node} {peer_node} unrecognized trunk\n"))
				} else if target != port && self.net.pcbs[target as usize].link.is_open() {
					(301, format!("301 {host_id} {coupler} {peer_node} already connected\n"))
				} else if !self.svm.is_ready() {
					(302, format!("302 {host_id} {coupler} {peer_node} not ready\n"))
				} else {
					(200, format!("200 {host_id} {coupler} {peer_node} connected\n"))
				}
			}
		};

		let sent = self.net.pcbs[port as usize].link.send(response.as_bytes());
		if sent != Ok(response.len()) {
			warn!("Failed to send trunk connect response on port {port}");
			return false;
		}

		if status != 200 {
			return false;
		}

		let target = target.expect("status 200 implies a matching trunk");

		if target != port {
			// Hand the socket over to the port owning the definition.
			self.lip_reset_pcb(target);
			let link = self.net.pcbs[port as usize].link.take();
			if let (Some(io), Some(fwds)) = (link.io(), &self.fwds) {
				io.set_route(target as u32, fwds.pcb.clone());
			}
			self.net.pcbs[target as usize].link = link;
		}

		if let Some(ctl) = lip_controls(self, target) {
			ctl.state = LipState::RcvBlockLengthHi;
			ctl.last_exchange = Some(now);
		}
		if let Some(n) = self.net.pcbs[target as usize].ncb {
			self.net.ncbs[n].state = NcbState::Connected;
		}

		self.lip_activate_trunk(target);

		true
	}

	/// Validate the CONNECT response received from a peer we dialled.
	fn lip_process_connect_response(&mut self, port: u8) -> bool {
		let (staging, remote_node) = match lip_controls(self, port) {
			Some(ctl) => (std::mem::take(&mut ctl.staging), ctl.remote_node),
			None => return false,
		};
		let text = String::from_utf8_lossy(&staging).into_owned();
		let mut tokens = text.split_whitespace();

		if tokens.next().and_then(|t| t.parse::<u16>().ok()) != Some(200) {
			return false;
		}

		let host_name = self.net.pcbs[port as usize]
			.ncb
			.map(|n| self.net.ncbs[n].host_name.clone())
			.unwrap_or_default();

		if !tokens.next().is_some_and(|t| t.eq_ignore_ascii_case(&host_name)) {
			warn!("Incorrect host ID in trunk connect response on port {port}");
			return false;
		}
		if tokens.next().and_then(|t| t.parse::<u8>().ok()) != Some(remote_node) {
			warn!("Incorrect remote node number in trunk connect response on port {port}");
			return false;
		}
		if tokens.next().and_then(|t| t.parse::<u8>().ok()) != Some(self.nodes.coupler) {
			warn!("Incorrect local node number in trunk connect response on port {port}");
			return false;
		}

		self.lip_activate_trunk(port);

		true
	}

	/// Announce an available host-to-host logical link to the host.
	fn lip_activate_trunk(&mut self, port: u8) {
		self.lip_regulation(port, 0x0F);
	}

	/// Announce a failed host-to-host logical link to the host.
	fn lip_deactivate_trunk(&mut self, port: u8) {
		self.lip_regulation(port, 0x0C);
	}

	fn lip_regulation(&mut self, port: u8, level: u8) {
		let coupler = self.nodes.coupler;
		let Some(ctl) = lip_controls(self, port) else { return };
		let msg = [
			coupler,
			ctl.remote_node,
			0,
			crate::block::BT_CMD,
			0x01, // PFC: regulation level
			0x01, // SFC: logical link
			level,
		];
		self.bip.request_upline_canned(&mut self.pool, &msg);
	}

	/// Send queued blocks, progress the handshake, and keep the link
	/// alive with pings.
	pub(crate) fn lip_try_output(&mut self, port: u8, now: Instant) {
		let state = match lip_controls(self, port) {
			Some(ctl) => ctl.state,
			None => return,
		};

		match state {
			LipState::Disconnected => {}

			LipState::RcvConnReq | LipState::RcvConnResp => {
				let stale = lip_controls(self, port).and_then(|c| c.last_exchange).is_some_and(|t| {
					now.duration_since(t) > MAX_IDLE_TIME
				});
				if stale {
					warn!("Timeout establishing trunk connection on port {port}");
					self.close_pcb(port, now);
					if let Some(ctl) = lip_controls(self, port) {
						ctl.state = LipState::Disconnected;
					}
				}
			}

			LipState::SndConnReq => {
				let request = {
					let host_id = self.net.host_id.clone();
					let coupler = self.nodes.coupler;
					let Some(ctl) = lip_controls(self, port) else { return };
					format!("CONNECT {host_id} {coupler} {}\n", ctl.remote_node)
				};
				let sent = self.net.pcbs[port as usize].link.send(request.as_bytes());
				if sent == Ok(request.len()) {
					if let Some(ctl) = lip_controls(self, port) {
						ctl.state = LipState::RcvConnResp;
					}
				} else {
					self.close_pcb(port, now);
					if let Some(ctl) = lip_controls(self, port) {
						ctl.state = LipState::Disconnected;
					}
				}
			}

			_ => self.lip_send_queued(port, now),
		}
	}

	fn lip_send_queued(&mut self, port: u8, now: Instant) {
		let (pending, idle) = match lip_controls(self, port) {
			Some(ctl) => (
				ctl.output_q.not_empty() || !ctl.wire.is_empty(),
				ctl.last_exchange.is_some_and(|t| now.duration_since(t) > MAX_IDLE_TIME),
			),
			None => return,
		};

		if !pending {
			if idle {
				// Ping the peer to prove the trunk is still alive.
				let sent = self.net.pcbs[port as usize].link.send(&[0, 0]);
				if sent == Ok(2) {
					if let Some(ctl) = lip_controls(self, port) {
						ctl.last_exchange = Some(now);
					}
				} else {
					self.lip_notify_net_disconnect(port, now);
				}
			}
			return;
		}

		if let Some(ctl) = lip_controls(self, port) {
			ctl.last_exchange = Some(now);
		}

		loop {
			// Frame the next queued block behind its 2-byte length prefix.
			{
				let Npu { net, pool, .. } = self;
				let crate::net::PortControls::Lip(ctl) = &mut net.pcbs[port as usize].controls
				else {
					return;
				};

				if ctl.wire.is_empty() {
					let Some(b) = ctl.output_q.extract() else { return };
					ctl.wire.push((b.num_bytes >> 8) as u8);
					ctl.wire.push(b.num_bytes as u8);
					ctl.wire.extend_from_slice(b.bytes());
					ctl.wire_off = 0;
					pool.release(b);
				}
			}

			let chunk = match lip_controls(self, port) {
				Some(ctl) => ctl.wire[ctl.wire_off..].to_vec(),
				None => return,
			};

			match self.net.pcbs[port as usize].link.send(&chunk) {
				Ok(n) => {
					self.net.pcbs[port as usize].link.want_write(n < chunk.len());
					let Some(ctl) = lip_controls(self, port) else { return };
					ctl.wire_off += n;
					if ctl.wire_off >= ctl.wire.len() {
						ctl.wire.clear();
						ctl.wire_off = 0;
					} else {
						return;
					}
				}
				Err(()) => return,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Instant;

	use super::*;
	use crate::block::{BT_CMD, OFF_DN, OFF_PFC, OFF_SN};
	use crate::net::{ConnDef, ConnType, Link};

	fn trunk_npu() -> (crate::Npu, std::rc::Rc<std::cell::RefCell<Vec<Vec<u8>>>>, u8) {
		let (mut npu, upline) = crate::test_npu();
		npu.svm.set_ready();

		let mut def = ConnDef::new(2550, 9, 1, ConnType::Trunk);
		def.host_name = "CYBER2".into();
		def.remote_node = 2;
		npu.net.register_conn_type(def, Instant::now()).unwrap();
		npu.net.pcbs[9].link = Link::test();

		assert!(npu.lip_notify_net_connect(9, true, Instant::now()));
		(npu, upline, 9)
	}

	#[test]
	fn connect_handshake_and_relay() {
		let (mut npu, upline, port) = trunk_npu();

		npu.lip_process_upline(port, b"CONNECT CYBER2 2 1\n", Instant::now());

		let sent = npu.test_port_output(port);
		assert_eq!(sent, b"200 CYBER1 1 2 connected\n");

		// Trunk activation raised the logical link regulation level.
		{
			let blocks = upline.borrow();
			let reg = blocks.last().unwrap();
			assert_eq!(reg[OFF_DN], 1);
			assert_eq!(reg[OFF_SN], 2, "from the remote trunk node");
			assert_eq!(reg[3], BT_CMD);
			assert_eq!(reg[OFF_PFC], 0x01);
			assert_eq!(reg[6], 0x0F);
		}

		// A framed block is forwarded upline as-is.
		npu.lip_process_upline(port, b"\x00\x05HELLO", Instant::now());
		let blocks = upline.borrow();
		assert_eq!(blocks.last().unwrap(), b"HELLO");
	}

	#[test]
	fn bad_connect_is_refused() {
		let (mut npu, _upline, port) = trunk_npu();

		npu.lip_process_upline(port, b"CONNECT NOBODY 3 1\n", Instant::now());

		let sent = npu.test_port_output(port);
		assert!(sent.starts_with(b"401 "));
	}

	#[test]
	fn oversized_block_disconnects() {
		let (mut npu, _upline, port) = trunk_npu();
		npu.lip_process_upline(port, b"CONNECT CYBER2 2 1\n", Instant::now());
		npu.test_clear_port_output(port);

		// A length of exactly MAX_BUFFER is fine; one more is fatal.
		let hi = (MAX_BUFFER >> 8) as u8;
		let lo = MAX_BUFFER as u8;
		npu.lip_process_upline(port, &[hi, lo], Instant::now());
		assert!(matches!(
			npu.test_lip_state(port),
			LipState::RcvBlockContent
		));

		let (mut npu, _upline, port) = trunk_npu();
		npu.lip_process_upline(port, b"CONNECT CYBER2 2 1\n", Instant::now());
		let over = MAX_BUFFER + 1;
		npu.lip_process_upline(port, &[(over >> 8) as u8, over as u8], Instant::now());
		assert!(matches!(npu.test_lip_state(port), LipState::Disconnected));
	}

	#[test]
	fn idle_trunk_pings() {
		let (mut npu, _upline, port) = trunk_npu();
		let start = Instant::now();
		npu.lip_process_upline(port, b"CONNECT CYBER2 2 1\n", start);
		npu.test_clear_port_output(port);

		npu.lip_try_output(port, start + Duration::from_secs(20));
		assert_eq!(npu.test_port_output(port), &[0, 0]);
	}

	#[test]
	fn downline_blocks_are_framed() {
		let (mut npu, _upline, port) = trunk_npu();
		npu.lip_process_upline(port, b"CONNECT CYBER2 2 1\n", Instant::now());
		npu.test_clear_port_output(port);

		let mut b = npu.pool.get();
		b.set(&[2, 1, 0x20, 6, 0, b'H', b'I']);
		npu.lip_process_downline(b, Instant::now());

		let sent = npu.test_port_output(port);
		assert_eq!(sent, &[0, 7, 2, 1, 0x20, 6, 0, b'H', b'I']);
	}
}
