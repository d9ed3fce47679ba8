//! Property tests for the hysteresis latch and the connectivity state graph.

use proptest::prelude::*;
use sporekeeper_domain::actuator::Actuator;
use sporekeeper_domain::connectivity::{ConnectivitySession, ConnectivityState};
use sporekeeper_domain::phase::ThresholdBand;
use sporekeeper_domain::reading::Metric;
use sporekeeper_domain::rule::{Rule, Trigger};
use sporekeeper_domain::time::now;

// ── No-chatter ────────────────────────────────────────────────

fn co2_band() -> ThresholdBand {
    ThresholdBand::new(300.0, 1000.0, 50.0)
}

proptest! {
    /// Values that never leave the dead-band never toggle the latch.
    #[test]
    fn latch_never_toggles_inside_dead_band(
        initial in any::<bool>(),
        values in proptest::collection::vec(950.0f64..=1000.0, 1..200),
    ) {
        let rule = Rule::new(Metric::Co2, Actuator::ExhaustFan, Trigger::Above);
        let band = co2_band();
        let mut latched = initial;
        for v in values {
            latched = rule.next_latch(&band, v, latched);
            prop_assert_eq!(latched, initial);
        }
    }

    /// Every on-toggle is caused by a value above max and every off-toggle by
    /// a value below max - h, so consecutive toggles need a full swing.
    #[test]
    fn toggles_require_crossing_the_full_band(
        values in proptest::collection::vec(800.0f64..1200.0, 1..300),
    ) {
        let rule = Rule::new(Metric::Co2, Actuator::ExhaustFan, Trigger::Above);
        let band = co2_band();
        let mut latched = false;
        for v in values {
            let next = rule.next_latch(&band, v, latched);
            if next && !latched {
                prop_assert!(v > band.max);
            }
            if !next && latched {
                prop_assert!(v < band.max - band.hysteresis);
            }
            latched = next;
        }
    }

    /// Mirror property for minimum-triggered rules.
    #[test]
    fn below_rule_toggles_require_crossing_the_full_band(
        values in proptest::collection::vec(80.0f64..100.0, 1..300),
    ) {
        let rule = Rule::new(Metric::Humidity, Actuator::Humidifier, Trigger::Below);
        let band = ThresholdBand::new(85.0, 95.0, 2.0);
        let mut latched = false;
        for v in values {
            let next = rule.next_latch(&band, v, latched);
            if next && !latched {
                prop_assert!(v < band.min);
            }
            if !next && latched {
                prop_assert!(v > band.min + band.hysteresis);
            }
            latched = next;
        }
    }
}

// ── Connectivity state graph ──────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Step {
    Go(ConnectivityState),
    Reset,
}

fn arb_state() -> impl Strategy<Value = ConnectivityState> {
    prop_oneof![
        Just(ConnectivityState::Unprovisioned),
        Just(ConnectivityState::Provisioning),
        Just(ConnectivityState::Associating),
        Just(ConnectivityState::Connected),
        Just(ConnectivityState::Degraded),
        Just(ConnectivityState::Fallback),
    ]
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        10 => arb_state().prop_map(Step::Go),
        1 => Just(Step::Reset),
    ]
}

proptest! {
    /// Starting unprovisioned, the session never reaches `Associating`
    /// without passing through `Provisioning` since the last reset.
    #[test]
    fn associating_is_never_reached_without_provisioning(
        steps in proptest::collection::vec(arb_step(), 1..200),
    ) {
        let mut session = ConnectivitySession::start(false, now());
        let mut provisioned_since_reset = false;

        for step in steps {
            match step {
                Step::Reset => {
                    session.reset(now());
                    provisioned_since_reset = false;
                }
                Step::Go(to) => {
                    let from = session.state();
                    match session.transition(to, now(), "prop") {
                        Ok(t) => {
                            prop_assert_eq!(t.from, from);
                            prop_assert!(from.can_transition_to(to));
                            if to == ConnectivityState::Provisioning {
                                provisioned_since_reset = true;
                            }
                            if to == ConnectivityState::Associating {
                                prop_assert!(provisioned_since_reset);
                            }
                        }
                        Err(_) => prop_assert_eq!(session.state(), from),
                    }
                }
            }
        }
    }

    /// Regular edges never lead back to `Unprovisioned`.
    #[test]
    fn only_reset_returns_to_unprovisioned(
        targets in proptest::collection::vec(arb_state(), 1..100),
    ) {
        let mut session = ConnectivitySession::start(true, now());
        for to in targets {
            let _ = session.transition(to, now(), "prop");
            prop_assert_ne!(session.state(), ConnectivityState::Unprovisioned);
        }
    }
}
