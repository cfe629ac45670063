use crate::models::step::WorkflowStep;

enum Pattern {
    Exact(&'static str),
    Prefix(&'static str),
}

impl Pattern {
    fn matches(&self, raw: &str) -> bool {
        match self {
            Pattern::Exact(value) => raw == *value,
            Pattern::Prefix(prefix) => raw.starts_with(prefix),
        }
    }
}

// Every raw status the client understands. Backend sub-states that are new
// to the client belong here and nowhere else.
const STATUS_TABLE: &[(Pattern, WorkflowStep)] = &[
    (Pattern::Exact("unassigned"), WorkflowStep::None),
    (Pattern::Exact("assigned"), WorkflowStep::None),
    (Pattern::Exact("accepted"), WorkflowStep::None),
    (Pattern::Exact("toShop"), WorkflowStep::ToShop),
    (Pattern::Exact("dasher_arrived"), WorkflowStep::Preparing),
    (Pattern::Exact("preparing"), WorkflowStep::Preparing),
    (Pattern::Exact("ready_for_pickup"), WorkflowStep::Preparing),
    (Pattern::Exact("shop_confirmed"), WorkflowStep::Preparing),
    (Pattern::Exact("pickedUp"), WorkflowStep::PickedUp),
    (Pattern::Exact("onTheWay"), WorkflowStep::OnTheWay),
    (Pattern::Exact("waiting_for_confirmation"), WorkflowStep::Delivered),
    (Pattern::Exact("completed"), WorkflowStep::Completed),
    (Pattern::Prefix("cancelled"), WorkflowStep::Cancelled),
    (Pattern::Exact("no_show"), WorkflowStep::NoShow),
    (Pattern::Exact("dasher_no_show"), WorkflowStep::NoShow),
    (
        Pattern::Exact("waiting_for_no_show_confirmation"),
        WorkflowStep::DisputedNoShow,
    ),
];

pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_WAITING_FOR_CONFIRMATION: &str = "waiting_for_confirmation";

/// Total mapping from a server status to the courier's workflow step.
/// Unrecognized statuses land on [`WorkflowStep::None`].
pub fn map_to_step(raw_status: &str) -> WorkflowStep {
    let raw = raw_status.trim();
    STATUS_TABLE
        .iter()
        .find(|(pattern, _)| pattern.matches(raw))
        .map(|(_, step)| *step)
        .unwrap_or(WorkflowStep::None)
}

/// Raw status the client writes when it asks the server for `step`.
///
/// Off-line terminals and `None` are never requested by the courier.
pub fn command_status(step: WorkflowStep) -> Option<&'static str> {
    match step {
        WorkflowStep::ToShop => Some("toShop"),
        WorkflowStep::Preparing => Some("dasher_arrived"),
        WorkflowStep::PickedUp => Some("pickedUp"),
        WorkflowStep::OnTheWay => Some("onTheWay"),
        WorkflowStep::Delivered => Some(STATUS_WAITING_FOR_CONFIRMATION),
        WorkflowStep::Completed => Some(STATUS_COMPLETED),
        WorkflowStep::None
        | WorkflowStep::Cancelled
        | WorkflowStep::NoShow
        | WorkflowStep::DisputedNoShow => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{command_status, map_to_step};
    use crate::models::step::WorkflowStep;

    #[test]
    fn shop_side_sub_states_collapse_onto_preparing() {
        for raw in ["dasher_arrived", "preparing", "ready_for_pickup", "shop_confirmed"] {
            assert_eq!(map_to_step(raw), WorkflowStep::Preparing, "{raw}");
        }
    }

    #[test]
    fn unknown_statuses_map_to_none() {
        for raw in ["", "   ", "brand_new_backend_state", "COMPLETED", "toshop"] {
            assert_eq!(map_to_step(raw), WorkflowStep::None, "{raw:?}");
        }
    }

    #[test]
    fn cancelled_variants_match_by_prefix() {
        assert_eq!(map_to_step("cancelled"), WorkflowStep::Cancelled);
        assert_eq!(map_to_step("cancelled_by_customer"), WorkflowStep::Cancelled);
        assert_eq!(map_to_step("cancelled_by_shop"), WorkflowStep::Cancelled);
    }

    #[test]
    fn no_show_family() {
        assert_eq!(map_to_step("no_show"), WorkflowStep::NoShow);
        assert_eq!(map_to_step("dasher_no_show"), WorkflowStep::NoShow);
        assert_eq!(
            map_to_step("waiting_for_no_show_confirmation"),
            WorkflowStep::DisputedNoShow
        );
    }

    #[test]
    fn command_statuses_map_back_onto_their_step() {
        let mut step = WorkflowStep::None;
        while let Some(next) = step.successor() {
            let raw = command_status(next).unwrap();
            assert_eq!(map_to_step(raw), next);
            step = next;
        }
        assert!(command_status(WorkflowStep::None).is_none());
        assert!(command_status(WorkflowStep::Cancelled).is_none());
    }
}
