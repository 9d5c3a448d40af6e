//! Member-event coalescing.

use std::collections::HashMap;

use murmur_types::Member;

use crate::event::{Event, MemberEvent, MemberEventType};

use super::Coalescer;

/// Coalesces member events per node name, emitting only net
/// transitions.
///
/// A node that joins, fails, and rejoins within one window produces a
/// single Join; a node that ends the window in the same state it was
/// last reported in produces nothing at all.
pub(crate) struct MemberEventCoalescer {
    /// Last event type actually emitted per member.
    last_events: HashMap<String, MemberEventType>,

    /// Latest buffered event per member this window.
    latest: HashMap<String, (MemberEventType, Member)>,
}

impl MemberEventCoalescer {
    pub(crate) fn new() -> Self {
        Self {
            last_events: HashMap::new(),
            latest: HashMap::new(),
        }
    }
}

impl Coalescer for MemberEventCoalescer {
    fn handles(&self, event: &Event) -> bool {
        matches!(event, Event::Member(_))
    }

    fn coalesce(&mut self, event: Event) {
        let Event::Member(ev) = event else {
            return;
        };
        for member in ev.members {
            self.latest.insert(member.name.clone(), (ev.ty, member));
        }
    }

    fn flush(&mut self, out: &mut Vec<Event>) {
        let mut grouped: HashMap<MemberEventType, Vec<Member>> = HashMap::new();

        for (name, (ty, member)) in self.latest.drain() {
            // Suppress events that do not change the member's last
            // reported state.
            if self.last_events.get(&name) == Some(&ty) {
                continue;
            }
            self.last_events.insert(name, ty);
            grouped.entry(ty).or_default().push(member);
        }

        for (ty, members) in grouped {
            out.push(Event::Member(MemberEvent { ty, members }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;

    use murmur_types::{MemberStatus, Tags, VersionRange};

    fn member(name: &str) -> Member {
        Member {
            name: name.to_string(),
            addr: "127.0.0.1:7946".parse::<SocketAddr>().unwrap(),
            tags: Tags::new(),
            status: MemberStatus::Alive,
            protocol: VersionRange::new(1, 1, 1),
            delegate: VersionRange::new(1, 1, 1),
        }
    }

    fn ev(ty: MemberEventType, name: &str) -> Event {
        Event::Member(MemberEvent {
            ty,
            members: vec![member(name)],
        })
    }

    fn flushed(c: &mut MemberEventCoalescer) -> Vec<MemberEvent> {
        let mut out = Vec::new();
        c.flush(&mut out);
        out.into_iter()
            .map(|e| match e {
                Event::Member(m) => m,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn flap_nets_to_final_transition() {
        let mut c = MemberEventCoalescer::new();
        c.coalesce(ev(MemberEventType::Join, "x"));
        c.coalesce(ev(MemberEventType::Failed, "x"));
        c.coalesce(ev(MemberEventType::Join, "x"));

        let events = flushed(&mut c);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].ty, MemberEventType::Join);
    }

    #[test]
    fn unchanged_state_emits_nothing() {
        let mut c = MemberEventCoalescer::new();
        c.coalesce(ev(MemberEventType::Join, "x"));
        assert_eq!(flushed(&mut c).len(), 1);

        // Another join for the same member in the next window is not a
        // transition.
        c.coalesce(ev(MemberEventType::Join, "x"));
        assert!(flushed(&mut c).is_empty());

        // A failure is.
        c.coalesce(ev(MemberEventType::Failed, "x"));
        let events = flushed(&mut c);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].ty, MemberEventType::Failed);
    }

    #[test]
    fn distinct_members_grouped_by_type() {
        let mut c = MemberEventCoalescer::new();
        c.coalesce(ev(MemberEventType::Join, "a"));
        c.coalesce(ev(MemberEventType::Join, "b"));
        c.coalesce(ev(MemberEventType::Failed, "c"));

        let events = flushed(&mut c);
        assert_eq!(events.len(), 2);
        let joins = events
            .iter()
            .find(|e| e.ty == MemberEventType::Join)
            .unwrap();
        assert_eq!(joins.members.len(), 2);
    }
}
