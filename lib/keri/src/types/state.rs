//! Key state projection

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::events::{Event, Ilk, WitnessConfig};
use super::outcome::RejectReason;

/// The current key state of one identifier, derived by replaying its log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyState {
    pub pre: String,
    /// Sequence number of the last applied event
    pub sn: u64,
    /// SAID of the last applied event
    pub said: String,
    pub ilk: Ilk,
    pub keys: Vec<String>,
    pub signing_threshold: usize,
    pub next_key_commitment: Option<String>,
    pub witnesses: Vec<String>,
    pub toad: usize,
    pub delegator: Option<String>,
    pub last_establishment_sn: u64,
}

impl KeyState {
    pub fn incept(event: &Event, witnesses: Vec<String>) -> Self {
        Self {
            pre: event.pre.clone(),
            sn: event.sn,
            said: event.said.clone(),
            ilk: event.ilk,
            keys: event.keys.clone(),
            signing_threshold: event.signing_threshold.unwrap_or(1),
            next_key_commitment: event.next_key_commitment.clone(),
            toad: event.witnesses.as_ref().map(|w| w.toad).unwrap_or(0),
            witnesses,
            delegator: event.delegator.clone(),
            last_establishment_sn: event.sn,
        }
    }

    /// The state after `event`. Interactions only advance the position.
    pub fn apply(&self, event: &Event, witnesses: Vec<String>) -> Self {
        let mut next = self.clone();
        next.sn = event.sn;
        next.said = event.said.clone();
        next.ilk = event.ilk;
        next.witnesses = witnesses;
        if let Some(ref config) = event.witnesses {
            next.toad = config.toad;
        }
        if event.is_establishment() {
            next.keys = event.keys.clone();
            next.signing_threshold = event.signing_threshold.unwrap_or(1);
            next.next_key_commitment = event.next_key_commitment.clone();
            next.last_establishment_sn = event.sn;
        }
        next
    }

    /// Projects `event` onto `prior`, resolving the witness transition.
    ///
    /// Does not check signatures, chaining or commitments.
    pub fn project(prior: Option<&KeyState>, event: &Event) -> Result<KeyState, RejectReason> {
        let current = prior.map(|s| s.witnesses.as_slice()).unwrap_or(&[]);
        let witnesses = match event.witnesses {
            Some(ref config) => next_witnesses(current, config).map_err(RejectReason::Malformed)?,
            None => current.to_vec(),
        };

        let next = match prior {
            Some(state) if !event.is_inception() => state.apply(event, witnesses),
            None if event.is_inception() => KeyState::incept(event, witnesses),
            _ => {
                return Err(RejectReason::Malformed(format!(
                    "{} cannot be applied at this position",
                    event.ilk
                )));
            }
        };

        if !toad_is_valid(next.witnesses.len(), next.toad) {
            return Err(RejectReason::InvalidToad);
        }
        Ok(next)
    }

    pub fn is_transferable(&self) -> bool {
        self.next_key_commitment.is_some()
    }

    pub fn is_delegated(&self) -> bool {
        self.delegator.is_some()
    }
}

/// The witness set after applying `change` to `current`.
pub fn next_witnesses(current: &[String], change: &WitnessConfig) -> Result<Vec<String>, String> {
    let mut seen = HashSet::new();
    for cut in &change.cut {
        if !seen.insert(cut) {
            return Err(format!("duplicate witness cut {}", cut));
        }
        if !current.contains(cut) {
            return Err(format!("cut witness {} is not a current witness", cut));
        }
    }

    let mut next: Vec<String> = current
        .iter()
        .filter(|w| !change.cut.contains(w))
        .cloned()
        .collect();

    for add in &change.add {
        if change.cut.contains(add) {
            return Err(format!("witness {} both cut and added", add));
        }
        if next.contains(add) {
            return Err(format!("witness {} already present", add));
        }
        next.push(add.clone());
    }

    Ok(next)
}

/// `toad <= n`, and a simple majority of a non-empty witness set.
pub fn toad_is_valid(witness_count: usize, toad: usize) -> bool {
    if witness_count == 0 {
        return toad == 0;
    }
    toad <= witness_count && toad > witness_count / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wits(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn icp(witnesses: &[&str], toad: usize) -> Event {
        Event::inception(
            vec!["k0".to_string()],
            1,
            Some("c0".to_string()),
            WitnessConfig::initial(wits(witnesses), toad),
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn test_toad_bounds() {
        assert!(toad_is_valid(0, 0));
        assert!(!toad_is_valid(0, 1));
        assert!(toad_is_valid(1, 1));
        assert!(toad_is_valid(3, 2));
        assert!(toad_is_valid(3, 3));
        assert!(!toad_is_valid(3, 1));
        assert!(!toad_is_valid(3, 5));
        assert!(toad_is_valid(4, 3));
        assert!(!toad_is_valid(4, 2));
    }

    #[test]
    fn test_next_witnesses_cut_and_add() {
        let current = wits(&["w1", "w2", "w3"]);
        let change = WitnessConfig {
            add: wits(&["w4"]),
            cut: wits(&["w2"]),
            toad: 2,
        };
        assert_eq!(
            next_witnesses(&current, &change).unwrap(),
            wits(&["w1", "w3", "w4"])
        );
    }

    #[test]
    fn test_next_witnesses_rejects_impossible_changes() {
        let current = wits(&["w1"]);
        let cut_missing = WitnessConfig {
            add: vec![],
            cut: wits(&["w9"]),
            toad: 0,
        };
        assert!(next_witnesses(&current, &cut_missing).is_err());

        let add_present = WitnessConfig {
            add: wits(&["w1"]),
            cut: vec![],
            toad: 1,
        };
        assert!(next_witnesses(&current, &add_present).is_err());

        let duplicate_add = WitnessConfig::initial(wits(&["w2", "w2"]), 1);
        assert!(next_witnesses(&[], &duplicate_add).is_err());
    }

    #[test]
    fn test_project_inception() {
        let event = icp(&["w1", "w2", "w3"], 2);
        let state = KeyState::project(None, &event).unwrap();
        assert_eq!(state.pre, event.pre);
        assert_eq!(state.sn, 0);
        assert_eq!(state.witnesses.len(), 3);
        assert_eq!(state.toad, 2);
        assert!(state.is_transferable());
        assert!(!state.is_delegated());
    }

    #[test]
    fn test_project_rejects_invalid_toad() {
        let event = icp(&["w1", "w2", "w3"], 5);
        assert_eq!(
            KeyState::project(None, &event),
            Err(RejectReason::InvalidToad)
        );
    }

    #[test]
    fn test_interaction_keeps_keys() {
        let event = icp(&[], 0);
        let state = KeyState::project(None, &event).unwrap();
        let ixn = Event::interaction(&state, vec![]).unwrap();
        let next = KeyState::project(Some(&state), &ixn).unwrap();
        assert_eq!(next.sn, 1);
        assert_eq!(next.said, ixn.said);
        assert_eq!(next.keys, state.keys);
        assert_eq!(next.next_key_commitment, state.next_key_commitment);
        assert_eq!(next.last_establishment_sn, 0);
    }

    #[test]
    fn test_inception_over_existing_state_is_malformed() {
        let event = icp(&[], 0);
        let state = KeyState::project(None, &event).unwrap();
        assert!(matches!(
            KeyState::project(Some(&state), &event),
            Err(RejectReason::Malformed(_))
        ));
    }
}
