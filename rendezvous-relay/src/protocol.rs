use std::{cmp::Ordering, net::SocketAddr};

/// Size of a connection's receive buffer; one read is one message.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Ends the session for both peers.
pub const END_SENTINEL: &str = "end";
/// Reply to any payload sent while still waiting for a partner.
pub const PLACEHOLDER_ACK: &str = "any";
/// Optional notice sent to a partner whose peer vanished.
pub const DISCONNECT_NOTICE: &str = "user_disconnected";

const FIRST_LABEL: &str = "white";
const SECOND_LABEL: &str = "black";

/// Side of a session announced to each peer right after pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    First,
    Second,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::First => FIRST_LABEL,
            Role::Second => SECOND_LABEL,
        }
    }
}

/// Whether the receiver keeps reading after a send completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Continue,
    /// The session is ending; no further receive is armed for the target.
    Final,
}

/// What a connection does with one inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Reply to the sender with the placeholder acknowledgment.
    Acknowledge,
    /// Forward to the partner; the sender keeps reading.
    Forward(String),
    /// Forward the sentinel, echo it back, then tear the session down.
    Terminate,
}

/// Decides how to handle `text` given whether the sender has a partner.
pub fn dispatch(paired: bool, text: String) -> Action {
    if !paired {
        Action::Acknowledge
    } else if text == END_SENTINEL {
        Action::Terminate
    } else {
        Action::Forward(text)
    }
}

/// Decodes a read as ASCII, replacing anything outside 7-bit range with `?`.
pub fn decode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&byte| if byte.is_ascii() { byte as char } else { '?' })
        .collect()
}

/// Sum of the character codes of the address' textual form.
pub fn address_weight(addr: &SocketAddr) -> u64 {
    addr.to_string().chars().map(|c| u64::from(u32::from(c))).sum()
}

/// Assigns roles to the two members of a new session.
///
/// The address with the strictly larger [`address_weight`] plays first. On a
/// tie the connection admitted earlier (`earlier`) plays first, so the result
/// only depends on the two addresses and their admission order.
pub fn assign_roles(earlier: &SocketAddr, later: &SocketAddr) -> (Role, Role) {
    match address_weight(earlier).cmp(&address_weight(later)) {
        Ordering::Less => (Role::Second, Role::First),
        Ordering::Equal | Ordering::Greater => (Role::First, Role::Second),
    }
}

/// Delivery used when announcing `role`.
///
/// With `legacy_second_role` the second label is a terminal send, which stops
/// that peer from reading any further.
pub fn announcement_delivery(role: Role, legacy_second_role: bool) -> Delivery {
    match role {
        Role::Second if legacy_second_role => Delivery::Final,
        _ => Delivery::Continue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().expect("valid socket address")
    }

    #[test]
    fn unpaired_sender_is_acknowledged() {
        assert_eq!(dispatch(false, "end".into()), Action::Acknowledge);
        assert_eq!(dispatch(false, "move:a2a3".into()), Action::Acknowledge);
    }

    #[test]
    fn paired_sender_forwards_or_terminates() {
        assert_eq!(
            dispatch(true, "move:a2a3".into()),
            Action::Forward("move:a2a3".into())
        );
        assert_eq!(dispatch(true, "end".into()), Action::Terminate);
        // Only the exact literal ends the session.
        assert_eq!(
            dispatch(true, "end\n".into()),
            Action::Forward("end\n".into())
        );
    }

    #[test]
    fn decode_replaces_non_ascii() {
        assert_eq!(decode(b"move:a2a3"), "move:a2a3");
        assert_eq!(decode(&[b'o', 0xC3, 0xA9, b'k']), "o??k");
    }

    #[test]
    fn weight_sums_character_codes() {
        // "1.2.3.4:5"
        let expected: u64 = "1.2.3.4:5".bytes().map(u64::from).sum();
        assert_eq!(address_weight(&addr("1.2.3.4:5")), expected);
    }

    #[test]
    fn heavier_address_plays_first() {
        let light = addr("10.0.0.1:1000");
        let heavy = addr("10.0.0.9:9999");

        assert_eq!(assign_roles(&light, &heavy), (Role::Second, Role::First));
        assert_eq!(assign_roles(&heavy, &light), (Role::First, Role::Second));
    }

    #[test]
    fn role_assignment_is_deterministic() {
        let a = addr("192.168.1.20:50412");
        let b = addr("192.168.1.31:50977");
        let first = assign_roles(&a, &b);
        for _ in 0..10 {
            assert_eq!(assign_roles(&a, &b), first);
        }
        assert_ne!(first.0, first.1);
    }

    #[test]
    fn ties_favor_earlier_admission() {
        // Same digits, different order: equal weights.
        let a = addr("127.0.0.1:4512");
        let b = addr("127.0.0.1:2154");
        assert_eq!(address_weight(&a), address_weight(&b));

        assert_eq!(assign_roles(&a, &b), (Role::First, Role::Second));
        assert_eq!(assign_roles(&b, &a), (Role::First, Role::Second));
    }

    #[test]
    fn legacy_mode_only_affects_second_label() {
        assert_eq!(announcement_delivery(Role::First, true), Delivery::Continue);
        assert_eq!(announcement_delivery(Role::Second, true), Delivery::Final);
        assert_eq!(
            announcement_delivery(Role::Second, false),
            Delivery::Continue
        );
        assert_eq!(Role::First.label(), "white");
        assert_eq!(Role::Second.label(), "black");
    }
}
