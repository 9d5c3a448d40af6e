//! User-event coalescing.

use std::collections::HashMap;

use murmur_types::LamportTime;

use crate::event::{Event, UserEventData};

use super::Coalescer;

/// Coalesces user events per event name.
///
/// Within a window, a strictly newer Lamport time replaces older
/// buffered emissions of the same name; events sharing the newest time
/// are all kept (distinct payloads at one time are distinct events).
pub(crate) struct UserEventCoalescer {
    events: HashMap<String, LatestUserEvents>,
}

struct LatestUserEvents {
    ltime: LamportTime,
    events: Vec<UserEventData>,
}

impl UserEventCoalescer {
    pub(crate) fn new() -> Self {
        Self {
            events: HashMap::new(),
        }
    }
}

impl Coalescer for UserEventCoalescer {
    fn handles(&self, event: &Event) -> bool {
        matches!(event, Event::User(u) if u.coalesce)
    }

    fn coalesce(&mut self, event: Event) {
        let Event::User(user) = event else {
            return;
        };

        match self.events.get_mut(&user.name) {
            Some(latest) if user.ltime > latest.ltime => {
                latest.ltime = user.ltime;
                latest.events = vec![user];
            }
            Some(latest) if user.ltime == latest.ltime => {
                latest.events.push(user);
            }
            Some(_) => {
                // Older than what we already hold; superseded.
            }
            None => {
                self.events.insert(
                    user.name.clone(),
                    LatestUserEvents {
                        ltime: user.ltime,
                        events: vec![user],
                    },
                );
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<Event>) {
        for (_, latest) in self.events.drain() {
            for event in latest.events {
                out.push(Event::User(event));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, ltime: u64, payload: &[u8]) -> Event {
        Event::User(UserEventData {
            ltime: LamportTime::new(ltime),
            name: name.to_string(),
            payload: payload.to_vec(),
            coalesce: true,
        })
    }

    fn flushed(c: &mut UserEventCoalescer) -> Vec<UserEventData> {
        let mut out = Vec::new();
        c.flush(&mut out);
        out.into_iter()
            .map(|e| match e {
                Event::User(u) => u,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn newer_ltime_supersedes() {
        let mut c = UserEventCoalescer::new();
        c.coalesce(user("deploy", 1, b"v1"));
        c.coalesce(user("deploy", 3, b"v2"));
        c.coalesce(user("deploy", 2, b"stale"));

        let events = flushed(&mut c);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, b"v2");
        assert_eq!(events[0].ltime, LamportTime::new(3));
    }

    #[test]
    fn equal_ltime_keeps_all() {
        let mut c = UserEventCoalescer::new();
        c.coalesce(user("deploy", 2, b"a"));
        c.coalesce(user("deploy", 2, b"b"));

        let events = flushed(&mut c);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn names_coalesce_independently() {
        let mut c = UserEventCoalescer::new();
        c.coalesce(user("deploy", 1, b""));
        c.coalesce(user("restart", 1, b""));

        assert_eq!(flushed(&mut c).len(), 2);
    }

    #[test]
    fn only_coalescible_events_handled() {
        let c = UserEventCoalescer::new();
        let mut no_coalesce = user("deploy", 1, b"");
        if let Event::User(u) = &mut no_coalesce {
            u.coalesce = false;
        }
        assert!(!c.handles(&no_coalesce));
        assert!(c.handles(&user("deploy", 1, b"")));
    }
}
