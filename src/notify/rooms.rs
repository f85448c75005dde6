//! Chat room addressing. Room ids are pure functions of entity ids, so
//! nothing is allocated or stored.
use crate::model::{Actor, Application, ApplicationState, Role};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static ROOM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:application-(\d+)|commercial-agent-(\d+)-app-(\d+))$").expect("valid room regex")
});

/// Customer <-> agent room.
pub fn application_room(application_id: i64) -> String {
    format!("application-{application_id}")
}

/// Commercial <-> agent room for one application.
pub fn commercial_agent_room(agent_id: i64, application_id: i64) -> String {
    format!("commercial-agent-{agent_id}-app-{application_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    Application { application_id: i64 },
    CommercialAgent { agent_id: i64, application_id: i64 },
}

impl Room {
    pub fn parse(s: &str) -> Option<Room> {
        let caps = ROOM_RE.captures(s)?;
        if let Some(app) = caps.get(1) {
            return Some(Room::Application {
                application_id: app.as_str().parse().ok()?,
            });
        }
        Some(Room::CommercialAgent {
            agent_id: caps.get(2)?.as_str().parse().ok()?,
            application_id: caps.get(3)?.as_str().parse().ok()?,
        })
    }

    pub fn application_id(&self) -> i64 {
        match *self {
            Room::Application { application_id } | Room::CommercialAgent { application_id, .. } => {
                application_id
            }
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Room::Application { application_id } => f.write_str(&application_room(application_id)),
            Room::CommercialAgent {
                agent_id,
                application_id,
            } => f.write_str(&commercial_agent_room(agent_id, application_id)),
        }
    }
}

/// Rooms that exist for the application in its current state.
pub fn rooms_for(app: &Application) -> Vec<Room> {
    let mut rooms = vec![Room::Application {
        application_id: app.id,
    }];
    if let (Some(agent_id), Some(_)) = (app.state.agent_id(), app.state.commercial_id()) {
        rooms.push(Room::CommercialAgent {
            agent_id,
            application_id: app.id,
        });
    }
    if let ApplicationState::SentToCommercial {
        agent_id,
        commercial_id: None,
    } = app.state
    {
        rooms.push(Room::CommercialAgent {
            agent_id,
            application_id: app.id,
        });
    }
    rooms
}

/// Whether `actor` may join `room` for `app`.
pub fn can_join(actor: Actor, app: &Application, room: &Room) -> bool {
    if room.application_id() != app.id {
        return false;
    }
    match *room {
        Room::Application { .. } => match actor.role {
            Role::Customer => app.customer_id == actor.user_id,
            Role::Agent => app.state.agent_id() == Some(actor.user_id),
            _ => false,
        },
        Room::CommercialAgent { agent_id, .. } => {
            if app.state.agent_id() != Some(agent_id) {
                return false;
            }
            match actor.role {
                Role::Agent => actor.user_id == agent_id,
                Role::Commercial => match app.state.commercial_id() {
                    Some(owner) => owner == actor.user_id,
                    // Unowned hand-off: any commercial may open the room to pick it up.
                    None => matches!(app.state, ApplicationState::SentToCommercial { .. }),
                },
                _ => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn app(state: ApplicationState) -> Application {
        Application {
            id: 12,
            customer_id: 1,
            broadcast_id: 3,
            state,
            duration_secs: 30,
            cost_cents: 1000,
            contact_phone: "+15550100".into(),
            description: "spot".into(),
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn room_ids_are_deterministic_and_parse_back() {
        assert_eq!(application_room(12), "application-12");
        assert_eq!(commercial_agent_room(4, 12), "commercial-agent-4-app-12");
        assert_eq!(
            Room::parse("application-12"),
            Some(Room::Application { application_id: 12 })
        );
        let room = Room::parse("commercial-agent-4-app-12").unwrap();
        assert_eq!(room.to_string(), "commercial-agent-4-app-12");
        assert_eq!(room.application_id(), 12);
        assert_eq!(Room::parse("application-"), None);
        assert_eq!(Room::parse("lobby"), None);
    }

    #[test]
    fn membership_follows_claims() {
        let pending = app(ApplicationState::Pending);
        let room = Room::Application { application_id: 12 };
        assert!(can_join(Actor::new(1, Role::Customer), &pending, &room));
        assert!(!can_join(Actor::new(2, Role::Customer), &pending, &room));
        assert!(!can_join(Actor::new(4, Role::Agent), &pending, &room));
        assert_eq!(rooms_for(&pending).len(), 1);

        let claimed = app(ApplicationState::InProgress { agent_id: 4 });
        assert!(can_join(Actor::new(4, Role::Agent), &claimed, &room));
        assert!(!can_join(Actor::new(5, Role::Agent), &claimed, &room));

        let handed = app(ApplicationState::SentToCommercial {
            agent_id: 4,
            commercial_id: Some(9),
        });
        let desk = Room::CommercialAgent {
            agent_id: 4,
            application_id: 12,
        };
        assert_eq!(rooms_for(&handed), vec![room, desk]);
        assert!(can_join(Actor::new(9, Role::Commercial), &handed, &desk));
        assert!(!can_join(Actor::new(8, Role::Commercial), &handed, &desk));
        assert!(can_join(Actor::new(4, Role::Agent), &handed, &desk));
        assert!(!can_join(Actor::new(1, Role::Customer), &handed, &desk));

        let wrong_agent = Room::CommercialAgent {
            agent_id: 5,
            application_id: 12,
        };
        assert!(!can_join(Actor::new(5, Role::Agent), &handed, &wrong_agent));
    }
}
