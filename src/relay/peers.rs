use std::collections::HashMap;
use std::net::SocketAddr;

/// 接続ごとの識別子（自分への送り返し防止にだけ使う、再接続で変わる）
pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Unclassified,
    Driver,
    Poser,
}

impl Role {
    /// `self` から送られたメッセージを `to` に配送するか
    pub fn routes_to(self, to: Role) -> bool {
        match self {
            Role::Driver => matches!(to, Role::Poser | Role::Unclassified),
            Role::Poser => to == Role::Driver,
            Role::Unclassified => true,
        }
    }
}

/// 最初の1行（idトークン）から役割を決める
#[derive(Debug, Clone)]
pub struct Classifier {
    driver_tokens: Vec<Vec<u8>>,
    poser_tokens: Vec<Vec<u8>>,
}

impl Classifier {
    pub fn new<S: AsRef<str>>(driver_tokens: &[S], poser_tokens: &[S]) -> Self {
        let bytes = |v: &[S]| v.iter().map(|s| s.as_ref().as_bytes().to_vec()).collect();
        Self {
            driver_tokens: bytes(driver_tokens),
            poser_tokens: bytes(poser_tokens),
        }
    }

    pub fn classify(&self, token: &[u8]) -> Role {
        let token = token.trim_ascii();
        if self.driver_tokens.iter().any(|t| t.as_slice() == token) {
            Role::Driver
        } else if self.poser_tokens.iter().any(|t| t.as_slice() == token) {
            Role::Poser
        } else {
            Role::Unclassified
        }
    }
}

#[derive(Debug)]
pub struct Peer<T> {
    pub addr: SocketAddr,
    pub role: Role,
    pub outbox: T,
}

/// 役割ごとの接続一覧（アドレス順）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    pub drivers: Vec<SocketAddr>,
    pub posers: Vec<SocketAddr>,
    pub unclassified: Vec<SocketAddr>,
}

impl Membership {
    pub fn role_of(&self, addr: SocketAddr) -> Option<Role> {
        if self.drivers.contains(&addr) {
            Some(Role::Driver)
        } else if self.posers.contains(&addr) {
            Some(Role::Poser)
        } else if self.unclassified.contains(&addr) {
            Some(Role::Unclassified)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.drivers.len() + self.posers.len() + self.unclassified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 接続の集合。各接続はちょうど1つの役割に属する。
#[derive(Debug)]
pub struct Peers<T> {
    peers: HashMap<ConnId, Peer<T>>,
}

impl<T> Default for Peers<T> {
    fn default() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }
}

impl<T> Peers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同じidが既にあれば置き換える
    pub fn insert(&mut self, id: ConnId, addr: SocketAddr, role: Role, outbox: T) {
        self.peers.insert(id, Peer { addr, role, outbox });
    }

    /// 既に居なければ何もしない
    pub fn remove(&mut self, id: ConnId) -> Option<Peer<T>> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: ConnId) -> Option<&Peer<T>> {
        self.peers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// `from` のメッセージを受け取る接続（送信者自身は含まない）
    pub fn recipients(&self, from: ConnId) -> impl Iterator<Item = (ConnId, &Peer<T>)> + '_ {
        let sender = self.peers.get(&from).map(|p| p.role);
        self.peers.iter().filter_map(move |(&id, peer)| {
            let role = sender?;
            (id != from && role.routes_to(peer.role)).then_some((id, peer))
        })
    }

    pub fn membership(&self) -> Membership {
        let mut m = Membership::default();
        for peer in self.peers.values() {
            match peer.role {
                Role::Driver => m.drivers.push(peer.addr),
                Role::Poser => m.posers.push(peer.addr),
                Role::Unclassified => m.unclassified.push(peer.addr),
            }
        }
        m.drivers.sort();
        m.posers.sort();
        m.unclassified.sort();
        m
    }
}
