//! Gossip-based membership and failure detector. A sender
//! task and a receiver task share one membership table behind a mutex; the
//! leader is a pure function of that table's current contents.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::net::{GossipDigest, KnownRecord, Peer};

const GOSSIP_PERIOD: Duration = Duration::from_millis(500);
const SUSPECT_AFTER: Duration = Duration::from_secs(2);
const DEAD_AFTER: Duration = Duration::from_secs(5);
const FANOUT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipState {
    #[serde(rename = "ALIVE")]
    Alive,
    #[serde(rename = "SUSPECT")]
    Suspect,
    #[serde(rename = "DEAD")]
    Dead,
}

#[derive(Debug, Clone)]
struct Record {
    state: MembershipState,
    heartbeat: u64,
    last_seen: Instant,
    addr: Option<SocketAddr>,
}

pub struct Gossip {
    self_id: u8,
    peers: Vec<Peer>,
    table: Mutex<HashMap<u8, Record>>,
    socket: UdpSocket,
}

impl Gossip {
    pub async fn bind(self_id: u8, bind_addr: SocketAddr, peers: Vec<Peer>) -> anyhow::Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let now = Instant::now();
        let mut table = HashMap::new();
        for peer in &peers {
            let state = if peer.id == self_id { MembershipState::Alive } else { MembershipState::Suspect };
            table.insert(
                peer.id,
                Record { state, heartbeat: 0, last_seen: now, addr: Some(peer.stream_addr) },
            );
        }
        Ok(Arc::new(Self { self_id, peers, table: Mutex::new(table), socket }))
    }

    /// max(id) over records currently ALIVE, or `None` if the alive set is
    /// empty. A pure function of the table snapshot; callers must
    /// tolerate the value changing between calls.
    pub fn leader(&self) -> Option<u8> {
        self.table
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, rec)| rec.state == MembershipState::Alive)
            .map(|(id, _)| *id)
            .max()
    }

    pub fn state_of(&self, id: u8) -> Option<MembershipState> {
        self.table.lock().unwrap().get(&id).map(|r| r.state)
    }

    /// The stream address to dial for a given node id, resolved once at
    /// startup -- not the gossiped address, since gossip only ever
    /// carries the datagram side.
    pub fn stream_addr_of(&self, id: u8) -> Option<SocketAddr> {
        self.peers.iter().find(|p| p.id == id).map(|p| p.stream_addr)
    }

    /// Every 500ms: bump self heartbeat and last-seen *before* scanning
    /// other records' ages, so the self record can never age itself out.
    /// Then fan out a digest to up to `FANOUT` random peers.
    pub async fn run_sender(self: Arc<Self>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(GOSSIP_PERIOD);
        loop {
            ticker.tick().await;
            let digest = self.tick_and_build_digest();
            let targets = self.pick_fanout_targets();
            for target in targets {
                let buf = digest.encode();
                if let Err(err) = self.socket.send_to(&buf, target).await {
                    debug!(%err, ?target, "gossip send failed");
                }
            }
        }
    }

    fn tick_and_build_digest(&self) -> GossipDigest {
        let now = Instant::now();
        let mut table = self.table.lock().unwrap();

        let self_record = table.get_mut(&self.self_id).expect("self always present");
        self_record.heartbeat += 1;
        self_record.last_seen = now;
        self_record.state = MembershipState::Alive;

        for (id, rec) in table.iter_mut() {
            if *id == self.self_id {
                continue;
            }
            let age = now.duration_since(rec.last_seen);
            if age > DEAD_AFTER {
                rec.state = MembershipState::Dead;
            } else if age > SUSPECT_AFTER && rec.state == MembershipState::Alive {
                rec.state = MembershipState::Suspect;
            }
        }

        let known = table
            .iter()
            .map(|(id, rec)| {
                (
                    id.to_string(),
                    KnownRecord {
                        state: rec.state,
                        hb: rec.heartbeat,
                        addr: rec.addr.map(|a| (a.ip().to_string(), a.port())),
                    },
                )
            })
            .collect();
        GossipDigest {
            kind: GossipDigest::KIND.to_string(),
            from: self.self_id,
            heartbeat: table[&self.self_id].heartbeat,
            known,
        }
    }

    fn pick_fanout_targets(&self) -> Vec<SocketAddr> {
        let mut rng = rand::thread_rng();
        self.peers
            .iter()
            .filter(|p| p.id != self.self_id)
            .map(|p| p.datagram_addr)
            .collect::<Vec<_>>()
            .choose_multiple(&mut rng, FANOUT.min(self.peers.len().saturating_sub(1)))
            .copied()
            .collect()
    }

    /// Receives digests forever, best-effort -- there's no
    /// retransmission at this layer.
    pub async fn run_receiver(self: Arc<Self>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 1 << 16];
        loop {
            let (len, _from) = self.socket.recv_from(&mut buf).await?;
            let Some(digest) = GossipDigest::decode(&buf[..len]) else {
                continue;
            };
            self.merge_digest(digest);
        }
    }

    fn merge_digest(&self, digest: GossipDigest) {
        let now = Instant::now();
        let mut table = self.table.lock().unwrap();

        let sender = table.entry(digest.from).or_insert_with(|| Record {
            state: MembershipState::Suspect,
            heartbeat: 0,
            last_seen: now,
            addr: None,
        });
        sender.state = MembershipState::Alive;
        sender.heartbeat = sender.heartbeat.max(digest.heartbeat);
        sender.last_seen = now;

        for (id_str, known) in digest.known {
            let Ok(id) = id_str.parse::<u8>() else { continue };
            if id == self.self_id {
                continue;
            }
            let rec = table.entry(id).or_insert_with(|| Record {
                state: MembershipState::Suspect,
                heartbeat: 0,
                last_seen: now,
                addr: None,
            });
            rec.heartbeat = rec.heartbeat.max(known.hb);
            match known.state {
                MembershipState::Dead => rec.state = MembershipState::Dead,
                MembershipState::Alive if rec.state != MembershipState::Dead => {
                    rec.state = MembershipState::Alive
                }
                _ => {}
            }
            if let Some((host, port)) = known.addr {
                if let Ok(ip) = host.parse() {
                    rec.addr = Some(SocketAddr::new(ip, port));
                } else {
                    warn!(%host, "unparseable gossiped address");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> Vec<Peer> {
        (1..=3u8)
            .map(|id| Peer {
                id,
                stream_addr: format!("127.0.0.1:{}", 8000 + id as u16).parse().unwrap(),
                datagram_addr: format!("127.0.0.1:{}", 9000 + id as u16).parse().unwrap(),
            })
            .collect()
    }

    #[tokio::test]
    async fn leader_is_max_alive_id() {
        let gossip = Gossip::bind(1, "127.0.0.1:0".parse().unwrap(), peers()).await.unwrap();
        gossip.tick_and_build_digest();
        {
            let mut table = gossip.table.lock().unwrap();
            table.get_mut(&2).unwrap().state = MembershipState::Alive;
            table.get_mut(&3).unwrap().state = MembershipState::Dead;
        }
        assert_eq!(gossip.leader(), Some(2));
    }

    #[tokio::test]
    async fn leader_is_none_when_nobody_alive() {
        let gossip = Gossip::bind(1, "127.0.0.1:0".parse().unwrap(), peers()).await.unwrap();
        let mut table = gossip.table.lock().unwrap();
        for rec in table.values_mut() {
            rec.state = MembershipState::Dead;
        }
        drop(table);
        assert_eq!(gossip.leader(), None);
    }

    #[tokio::test]
    async fn dead_is_sticky_against_an_alive_update() {
        let gossip = Gossip::bind(1, "127.0.0.1:0".parse().unwrap(), peers()).await.unwrap();
        gossip.table.lock().unwrap().get_mut(&2).unwrap().state = MembershipState::Dead;
        let mut known = HashMap::new();
        known.insert("2".to_string(), KnownRecord { state: MembershipState::Alive, hb: 9, addr: None });
        gossip.merge_digest(GossipDigest { kind: GossipDigest::KIND.into(), from: 3, heartbeat: 1, known });
        assert_eq!(gossip.state_of(2), Some(MembershipState::Dead));
    }

    #[tokio::test]
    async fn self_tick_cannot_age_self_out() {
        let gossip = Gossip::bind(1, "127.0.0.1:0".parse().unwrap(), peers()).await.unwrap();
        gossip.tick_and_build_digest();
        assert_eq!(gossip.state_of(1), Some(MembershipState::Alive));
    }
}
