use std::fmt;

use serde::{Deserialize, Serialize};

/// Courier-facing position in the delivery workflow.
///
/// Derived from the server's raw status, never stored on its own. The
/// first seven variants form the forward line in declaration order; the
/// remaining three are terminal values outside it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkflowStep {
    None,
    ToShop,
    Preparing,
    PickedUp,
    OnTheWay,
    Delivered,
    Completed,
    Cancelled,
    NoShow,
    DisputedNoShow,
}

const FORWARD_LINE: [WorkflowStep; 7] = [
    WorkflowStep::None,
    WorkflowStep::ToShop,
    WorkflowStep::Preparing,
    WorkflowStep::PickedUp,
    WorkflowStep::OnTheWay,
    WorkflowStep::Delivered,
    WorkflowStep::Completed,
];

impl WorkflowStep {
    /// Position on the forward line, `None` for the off-line terminal values.
    pub fn forward_index(self) -> Option<usize> {
        FORWARD_LINE.iter().position(|step| *step == self)
    }

    /// The only step an operator may request from `self`.
    pub fn successor(self) -> Option<WorkflowStep> {
        let index = self.forward_index()?;
        FORWARD_LINE.get(index + 1).copied()
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStep::Completed
                | WorkflowStep::Cancelled
                | WorkflowStep::NoShow
                | WorkflowStep::DisputedNoShow
        )
    }

    /// Terminal and final. A disputed no-show still waits for the server
    /// to settle it, so it is terminal but not settled.
    pub fn is_settled(self) -> bool {
        self.is_terminal() && self != WorkflowStep::DisputedNoShow
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::WorkflowStep;

    #[test]
    fn successor_walks_the_forward_line() {
        let mut step = WorkflowStep::None;
        let mut visited = vec![step];
        while let Some(next) = step.successor() {
            visited.push(next);
            step = next;
        }

        assert_eq!(
            visited,
            vec![
                WorkflowStep::None,
                WorkflowStep::ToShop,
                WorkflowStep::Preparing,
                WorkflowStep::PickedUp,
                WorkflowStep::OnTheWay,
                WorkflowStep::Delivered,
                WorkflowStep::Completed,
            ]
        );
    }

    #[test]
    fn off_line_terminals_have_no_successor() {
        for step in [
            WorkflowStep::Cancelled,
            WorkflowStep::NoShow,
            WorkflowStep::DisputedNoShow,
        ] {
            assert!(step.successor().is_none());
            assert!(step.forward_index().is_none());
            assert!(step.is_terminal());
        }
    }

    #[test]
    fn disputed_no_show_is_not_settled() {
        assert!(!WorkflowStep::DisputedNoShow.is_settled());
        assert!(WorkflowStep::NoShow.is_settled());
        assert!(WorkflowStep::Cancelled.is_settled());
        assert!(WorkflowStep::Completed.is_settled());
        assert!(!WorkflowStep::OnTheWay.is_settled());
    }

    #[test]
    fn only_completed_is_terminal_on_the_line() {
        assert!(WorkflowStep::Completed.is_terminal());
        assert!(!WorkflowStep::Delivered.is_terminal());
        assert!(!WorkflowStep::None.is_terminal());
    }
}
