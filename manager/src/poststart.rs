//! What to show the operator once `start` has returned.
//!
//! The flow is a small state machine:
//!
//! ```text
//! CheckingSync --stuck--> Done(DashboardHint)
//!      | synced
//! CheckingRegistration --error | validator--> Done(DashboardHint)
//!      | not a validator, interactive      --> PromptRegister
//!      | not a validator, non-interactive  --> Done(Steps)
//! PromptRegister --yes--> Registering --> Done(DashboardHint)
//!      | no | timeout --> Done(Steps)
//! ```
//!
//! [`decide`] is the registration branch as a pure function; [`step`]
//! drives the whole machine from observed [`Event`]s.

use std::error::Error;

use serde::Serialize;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStartDecision {
    ShowDashboard,
    PromptRegister,
    ShowSteps,
}

/// Pure on its inputs. A failed registration check never prompts.
pub fn decide(
    val_err: Option<&(dyn Error + '_)>,
    is_validator: bool,
    interactive: bool,
) -> PostStartDecision {
    match (val_err, is_validator, interactive) {
        (Some(_), _, _) => PostStartDecision::ShowDashboard,
        (None, true, _) => PostStartDecision::ShowDashboard,
        (None, false, true) => PostStartDecision::PromptRegister,
        (None, false, false) => PostStartDecision::ShowSteps,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PromptAnswer {
    Yes,
    No,
    TimedOut,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ending {
    DashboardHint,
    Steps,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    CheckingSync,
    CheckingRegistration,
    PromptRegister,
    Registering,
    Done(Ending),
}

#[derive(Debug)]
pub enum Event<'a> {
    Synced,
    SyncStuck,
    Registration {
        result: Result<bool, &'a (dyn Error + 'a)>,
        interactive: bool,
    },
    Answer(PromptAnswer),
    /// The register flow finished, successfully or not.
    Registered,
}

/// Advances the machine. Events that do not apply to the current stage
/// leave it unchanged.
pub fn step(stage: Stage, event: Event<'_>) -> Stage {
    match (stage, event) {
        (Stage::CheckingSync, Event::Synced) => Stage::CheckingRegistration,
        (Stage::CheckingSync, Event::SyncStuck) => Stage::Done(Ending::DashboardHint),
        (
            Stage::CheckingRegistration,
            Event::Registration {
                result,
                interactive,
            },
        ) => {
            let (err, is_validator) = match result {
                Ok(v) => (None, v),
                Err(e) => (Some(e), false),
            };
            match decide(err, is_validator, interactive) {
                PostStartDecision::ShowDashboard => Stage::Done(Ending::DashboardHint),
                PostStartDecision::PromptRegister => Stage::PromptRegister,
                PostStartDecision::ShowSteps => Stage::Done(Ending::Steps),
            }
        }
        (Stage::PromptRegister, Event::Answer(PromptAnswer::Yes)) => Stage::Registering,
        (Stage::PromptRegister, Event::Answer(_)) => Stage::Done(Ending::Steps),
        (Stage::Registering, Event::Registered) => Stage::Done(Ending::DashboardHint),
        (stage, _) => stage,
    }
}

/// Commands an operator runs to become a validator by hand.
pub fn registration_steps() -> &'static [&'static str] {
    &[
        "push-validator status            # wait until catching_up is false",
        "push-validator keys ensure       # create or show the validator key",
        "push-validator balance           # fund the key's account",
        "push-validator register          # submit create-validator",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("boom")
        }
    }

    impl Error for Boom {}

    #[test]
    fn decision_table_covers_all_inputs() {
        let boom = Boom;
        for is_validator in [true, false] {
            for interactive in [true, false] {
                let with_err = decide(Some(&boom), is_validator, interactive);
                assert_eq!(with_err, PostStartDecision::ShowDashboard);

                let expected = match (is_validator, interactive) {
                    (true, _) => PostStartDecision::ShowDashboard,
                    (false, true) => PostStartDecision::PromptRegister,
                    (false, false) => PostStartDecision::ShowSteps,
                };
                assert_eq!(decide(None, is_validator, interactive), expected);
            }
        }
    }

    #[test]
    fn stuck_sync_ends_at_dashboard_hint() {
        assert_eq!(
            step(Stage::CheckingSync, Event::SyncStuck),
            Stage::Done(Ending::DashboardHint)
        );
    }

    #[test]
    fn interactive_yes_registers_then_shows_dashboard() {
        let mut stage = step(Stage::CheckingSync, Event::Synced);
        stage = step(
            stage,
            Event::Registration {
                result: Ok(false),
                interactive: true,
            },
        );
        assert_eq!(stage, Stage::PromptRegister);
        stage = step(stage, Event::Answer(PromptAnswer::Yes));
        assert_eq!(stage, Stage::Registering);
        assert_eq!(step(stage, Event::Registered), Stage::Done(Ending::DashboardHint));
    }

    #[test]
    fn declined_or_timed_out_prompt_shows_steps() {
        for answer in [PromptAnswer::No, PromptAnswer::TimedOut] {
            assert_eq!(
                step(Stage::PromptRegister, Event::Answer(answer)),
                Stage::Done(Ending::Steps)
            );
        }
    }

    #[test]
    fn registration_error_never_prompts() {
        let boom = Boom;
        let stage = step(
            Stage::CheckingRegistration,
            Event::Registration {
                result: Err(&boom),
                interactive: true,
            },
        );
        assert_eq!(stage, Stage::Done(Ending::DashboardHint));
    }

    #[test]
    fn unrelated_events_are_ignored() {
        assert_eq!(step(Stage::CheckingSync, Event::Registered), Stage::CheckingSync);
        let done = Stage::Done(Ending::Steps);
        assert_eq!(step(done, Event::Synced), done);
    }
}
