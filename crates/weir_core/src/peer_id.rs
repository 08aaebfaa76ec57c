use crate::hash_id::Id20;

/// Client name and version read out of an azureus-style peer id:
/// `-XXnnnn-` followed by twelve random bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTag {
    pub client: [char; 2],
    pub version: [char; 4],
}

impl ClientTag {
    /// Human name for the well-known client codes we care to label.
    pub fn name(&self) -> Option<&'static str> {
        match self.client {
            ['W', 'R'] => Some("weir"),
            ['D', 'E'] => Some("Deluge"),
            ['l', 't'] | ['L', 'T'] => Some("libtorrent"),
            ['q', 'B'] => Some("qBittorrent"),
            ['T', 'R'] => Some("Transmission"),
            ['U', 'T'] => Some("uTorrent"),
            _ => None,
        }
    }
}

/// Best-effort decode of the azureus-style convention, for logging who
/// we're talking to. Ids that don't follow it yield None.
pub fn try_decode_peer_id(id: Id20) -> Option<ClientTag> {
    let b = id.0;
    if b[0] != b'-' || b[7] != b'-' {
        return None;
    }
    let mut version = ['0'; 4];
    for (dst, src) in version.iter_mut().zip(&b[3..7]) {
        *dst = *src as char;
    }
    Some(ClientTag {
        client: [b[1] as char, b[2] as char],
        version,
    })
}

/// Our own azureus-style id: the weir client tag, then a random tail.
pub fn generate_peer_id() -> Id20 {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-WR0001-");
    let tail = uuid::Uuid::new_v4();
    id[8..].copy_from_slice(&tail.as_bytes()[..12]);
    Id20::new(id)
}
