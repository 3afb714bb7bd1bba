use std::{collections::HashMap, net::SocketAddr};

/// Identity of a connection: its remote endpoint.
pub type PeerId = SocketAddr;

/// Table of live connections and their pairings.
///
/// Partners refer to each other by [`PeerId`], never by handle, so the table
/// alone decides when a connection stops being reachable. The table does no
/// locking of its own; callers serialize access.
#[derive(Debug)]
pub struct Registry<H> {
    entries: HashMap<PeerId, Entry<H>>,
    next_admission: u64,
}

#[derive(Debug)]
struct Entry<H> {
    handle: H,
    partner: Option<PeerId>,
    admitted: u64,
}

/// Where a registered connection stands.
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup<'a, H> {
    Missing,
    Unpaired,
    Paired { partner: PeerId, handle: &'a H },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member<H> {
    pub id: PeerId,
    pub handle: H,
}

/// Two connections that were just paired, ordered by admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session<H> {
    pub earlier: Member<H>,
    pub later: Member<H>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next_admission: 0,
        }
    }
}

impl<H> Registry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.entries.contains_key(id)
    }

    /// Inserts an unpaired connection. Returns `false` if `id` is already live.
    pub fn insert(&mut self, id: PeerId, handle: H) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        let admitted = self.next_admission;
        self.next_admission += 1;
        self.entries.insert(
            id,
            Entry {
                handle,
                partner: None,
                admitted,
            },
        );
        true
    }

    pub fn partner_of(&self, id: &PeerId) -> Option<PeerId> {
        self.entries.get(id).and_then(|entry| entry.partner)
    }

    pub fn lookup(&self, id: &PeerId) -> Lookup<'_, H> {
        let Some(entry) = self.entries.get(id) else {
            return Lookup::Missing;
        };
        match entry.partner.and_then(|p| self.entries.get_key_value(&p)) {
            Some((partner, other)) => Lookup::Paired {
                partner: *partner,
                handle: &other.handle,
            },
            None => Lookup::Unpaired,
        }
    }

    /// Number of sessions currently formed.
    pub fn session_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.partner.is_some())
            .count()
            / 2
    }

    /// Removes `id` together with its partner, returning the removed handles.
    ///
    /// Removing an id that is no longer present is a no-op, so a session can be
    /// torn down from both sides without releasing anything twice.
    pub fn remove_session(&mut self, id: &PeerId) -> Vec<H> {
        let mut removed = Vec::with_capacity(2);
        if let Some(entry) = self.entries.remove(id) {
            if let Some(partner) = entry.partner.and_then(|p| self.entries.remove(&p)) {
                removed.push(partner.handle);
            }
            removed.insert(0, entry.handle);
        }
        removed
    }

    /// Empties the table, returning every handle it held.
    pub fn drain(&mut self) -> Vec<H> {
        self.entries.drain().map(|(_, entry)| entry.handle).collect()
    }
}

impl<H: Clone> Registry<H> {
    /// Pairs `id` with the first other unpaired connection found.
    ///
    /// Returns `None` when `id` is missing, already paired, or no partner is
    /// waiting. There is no ordering guarantee among waiting connections.
    pub fn pair_first_unpaired(&mut self, id: &PeerId) -> Option<Session<H>> {
        match self.entries.get(id) {
            Some(entry) if entry.partner.is_none() => {}
            _ => return None,
        }

        let other = self
            .entries
            .iter()
            .find(|(key, entry)| *key != id && entry.partner.is_none())
            .map(|(key, _)| *key)?;

        self.link(*id, other)
    }

    fn link(&mut self, a: PeerId, b: PeerId) -> Option<Session<H>> {
        let member_a = self.entries.get_mut(&a)?;
        member_a.partner = Some(b);
        let (handle_a, admitted_a) = (member_a.handle.clone(), member_a.admitted);

        let member_b = self.entries.get_mut(&b)?;
        member_b.partner = Some(a);
        let (handle_b, admitted_b) = (member_b.handle.clone(), member_b.admitted);

        let a = Member {
            id: a,
            handle: handle_a,
        };
        let b = Member {
            id: b,
            handle: handle_b,
        };

        Some(if admitted_a <= admitted_b {
            Session { earlier: a, later: b }
        } else {
            Session { earlier: b, later: a }
        })
    }
}
