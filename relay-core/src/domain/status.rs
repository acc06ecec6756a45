//! Status domain types
//!
//! One status enum is shared by runs, stages and jobs. The persisted strings
//! are `Wait`, `Doing`, `OK`, `Error` and `Pause`.

use serde::{Deserialize, Serialize};

/// Execution status of a run, stage or job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Wait,
    Doing,
    #[serde(rename = "OK")]
    Ok,
    Error,
    Pause,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Wait => "Wait",
            Status::Doing => "Doing",
            Status::Ok => "OK",
            Status::Error => "Error",
            Status::Pause => "Pause",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive a stage's status from the statuses of its jobs.
///
/// Priority, independent of job order:
/// 1. any job `Doing` -> `Doing`
/// 2. any job `Error` -> `Error`
/// 3. any job `OK`: `Doing` if some job is still `Wait`, otherwise `OK`
/// 4. no signal at all (only `Wait`/`Pause` jobs, or no jobs) -> `previous`
pub fn derive_stage_status<I>(jobs: I, previous: Status) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let mut error = false;
    let mut ok = false;
    let mut waiting = false;

    for status in jobs {
        match status {
            Status::Doing => return Status::Doing,
            Status::Error => error = true,
            Status::Ok => ok = true,
            Status::Wait => waiting = true,
            Status::Pause => {}
        }
    }

    if error {
        Status::Error
    } else if ok && waiting {
        Status::Doing
    } else if ok {
        Status::Ok
    } else {
        previous
    }
}

/// Map a stage's new status onto its run.
///
/// A stage finishing `OK` keeps the run `Doing`; completing the run is decided
/// elsewhere. `None` leaves the run status untouched.
pub fn derive_run_status(stage_status: Status) -> Option<Status> {
    match stage_status {
        Status::Error => Some(Status::Error),
        Status::Doing | Status::Ok => Some(Status::Doing),
        Status::Pause => Some(Status::Pause),
        Status::Wait => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Status::*;

    fn permutations(items: &[Status]) -> Vec<Vec<Status>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_doing_wins_in_any_order() {
        for order in permutations(&[Doing, Error, Ok, Wait]) {
            assert_eq!(derive_stage_status(order.clone(), Wait), Doing, "{:?}", order);
        }
    }

    #[test]
    fn test_error_beats_ok_in_any_order() {
        for order in permutations(&[Error, Ok, Ok, Wait]) {
            assert_eq!(derive_stage_status(order.clone(), Ok), Error, "{:?}", order);
        }
        assert_eq!(derive_stage_status([Ok, Error], Wait), Error);
        assert_eq!(derive_stage_status([Error, Ok], Wait), Error);
    }

    #[test]
    fn test_all_ok() {
        assert_eq!(derive_stage_status([Ok, Ok], Wait), Ok);
    }

    #[test]
    fn test_partial_completion_is_doing() {
        assert_eq!(derive_stage_status([Ok, Wait], Wait), Doing);
        assert_eq!(derive_stage_status([Wait, Ok], Wait), Doing);
    }

    #[test]
    fn test_no_signal_keeps_previous() {
        assert_eq!(derive_stage_status([Wait, Wait], Wait), Wait);
        assert_eq!(derive_stage_status([Wait, Wait], Pause), Pause);
        assert_eq!(derive_stage_status([], Doing), Doing);
        assert_eq!(derive_stage_status([Pause], Error), Error);
    }

    #[test]
    fn test_paused_jobs_are_ignored() {
        assert_eq!(derive_stage_status([Ok, Pause], Wait), Ok);
    }

    #[test]
    fn test_run_status_mapping() {
        assert_eq!(derive_run_status(Error), Some(Error));
        assert_eq!(derive_run_status(Doing), Some(Doing));
        assert_eq!(derive_run_status(Ok), Some(Doing));
        assert_eq!(derive_run_status(Pause), Some(Pause));
        assert_eq!(derive_run_status(Wait), None);
    }

    #[test]
    fn test_status_wire_strings() {
        assert_eq!(serde_json::to_string(&Ok).unwrap(), "\"OK\"");
        assert_eq!(serde_json::to_string(&Doing).unwrap(), "\"Doing\"");
        let parsed: Status = serde_json::from_str("\"Pause\"").unwrap();
        assert_eq!(parsed, Pause);
        assert_eq!(Ok.to_string(), "OK");
    }
}
