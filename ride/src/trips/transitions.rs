//! The trip transition table.

use common::trip::TripStatus;

/// Who is asking for a transition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Actor {
    Driver,
    Passenger,
    System,
}

/// Whether `actor` may move a trip from `from` to `to`.
///
/// Terminal states never transition; either party may abandon a trip only
/// before the ride starts (up through `DRIVER_ARRIVED`). Once in progress
/// the only way out is `COMPLETED`.
pub fn is_allowed(from: TripStatus, to: TripStatus, actor: Actor) -> bool {
    use TripStatus::*;
    match (from, to, actor) {
        (Searching, Matched, Actor::System) => true,
        (Searching, Canceled, Actor::Passenger) => true,
        (Searching, NoDrivers, Actor::System) => true,

        (Matched, DriverEnRoute, Actor::Driver) => true,
        // Tolerated: a driver who was already next door skips en-route.
        (Matched | DriverAssigned | DriverEnRoute, DriverArrived, Actor::Driver) =>
            true,

        (DriverArrived, InProgress, Actor::Driver) => true,
        (DriverArrived, NoShow, Actor::Driver) => true,
        (InProgress, Completed, Actor::Driver) => true,

        (
            Matched | DriverEnRoute | DriverArrived,
            Canceled,
            Actor::Driver | Actor::Passenger,
        ) => true,

        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use TripStatus::*;

    const ALL: [TripStatus; 11] = [
        Draft,
        Searching,
        Matched,
        DriverAssigned,
        DriverEnRoute,
        DriverArrived,
        InProgress,
        Completed,
        Canceled,
        NoShow,
        NoDrivers,
    ];

    #[test]
    fn terminal_states_never_transition() {
        for from in [Completed, Canceled, NoShow, NoDrivers] {
            for to in ALL {
                for actor in [Actor::Driver, Actor::Passenger, Actor::System]
                {
                    assert!(
                        !is_allowed(from, to, actor),
                        "{from} -> {to} by {actor:?} must be rejected",
                    );
                }
            }
        }
    }

    #[test]
    fn happy_path_is_allowed() {
        assert!(is_allowed(Matched, DriverEnRoute, Actor::Driver));
        assert!(is_allowed(DriverEnRoute, DriverArrived, Actor::Driver));
        assert!(is_allowed(DriverArrived, InProgress, Actor::Driver));
        assert!(is_allowed(InProgress, Completed, Actor::Driver));
    }

    #[test]
    fn matched_tolerates_direct_arrival() {
        assert!(is_allowed(Matched, DriverArrived, Actor::Driver));
        assert!(is_allowed(DriverAssigned, DriverArrived, Actor::Driver));
    }

    #[test]
    fn cancel_window_closes_when_the_ride_starts() {
        for actor in [Actor::Driver, Actor::Passenger] {
            assert!(is_allowed(Matched, Canceled, actor));
            assert!(is_allowed(DriverEnRoute, Canceled, actor));
            assert!(is_allowed(DriverArrived, Canceled, actor));
            assert!(!is_allowed(InProgress, Canceled, actor));
        }
    }

    #[test]
    fn wrong_actor_is_rejected() {
        assert!(!is_allowed(InProgress, Completed, Actor::Passenger));
        assert!(!is_allowed(Matched, DriverEnRoute, Actor::Passenger));
        assert!(!is_allowed(Searching, Matched, Actor::Driver));
        assert!(!is_allowed(DriverArrived, NoShow, Actor::Passenger));
    }

    #[test]
    fn cannot_skip_to_completed() {
        assert!(!is_allowed(Matched, Completed, Actor::Driver));
        assert!(!is_allowed(DriverArrived, Completed, Actor::Driver));
    }
}
