/// Split helpers: member selection and fitness criteria.
use std::collections::HashSet;

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::descriptor::FitnessFunctions;
use crate::error::CohortError;
use crate::group::view::GroupView;
use crate::types::Address;

/// Which members move to the subgroup in a fitness-driven split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitCriterion {
    /// Members whose boolean split fitness is `true`.
    Boolean,
    /// Members whose integer split fitness is at least this value.
    AtLeast(i64),
}

impl SplitCriterion {
    /// Evaluate this criterion against a member's own fitness callbacks.
    pub fn selects(&self, fitness: &dyn FitnessFunctions) -> Result<bool, CohortError> {
        match self {
            SplitCriterion::Boolean => fitness.boolean_split_fitness(),
            SplitCriterion::AtLeast(threshold) => {
                Ok(fitness.integer_split_fitness()? >= *threshold)
            }
        }
    }
}

/// Pick `count` distinct members at random, never the supervisor and never
/// a link.
///
/// Returns `None` when the split would be a no-op: `count` is zero or
/// exceeds the members eligible to move. Without links that is the same as
/// `count` being at least the membership size.
pub fn select_members(
    view: &GroupView,
    supervisor: &Address,
    links: &HashSet<Address>,
    count: usize,
) -> Option<Vec<Address>> {
    let candidates: Vec<Address> = view
        .members()
        .iter()
        .filter(|addr| *addr != supervisor && !links.contains(*addr))
        .cloned()
        .collect();
    if count == 0 || count > candidates.len() {
        return None;
    }
    let mut rng = rand::rng();
    Some(candidates.choose_multiple(&mut rng, count).cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_of(names: &[&str]) -> GroupView {
        let mut view = GroupView::new();
        for name in names {
            view.add_member(Address::from(*name));
        }
        view
    }

    struct Fixed {
        int: Option<i64>,
        flag: Option<bool>,
    }

    impl FitnessFunctions for Fixed {
        fn supervisor_fitness(&self) -> f64 {
            0.0
        }
        fn integer_split_fitness(&self) -> Result<i64, CohortError> {
            self.int.ok_or(CohortError::NotImplemented {
                callback: "integer_split_fitness",
            })
        }
        fn boolean_split_fitness(&self) -> Result<bool, CohortError> {
            self.flag.ok_or(CohortError::NotImplemented {
                callback: "boolean_split_fitness",
            })
        }
    }

    #[test]
    fn never_selects_supervisor() {
        let view = view_of(&["s", "a", "b", "c"]);
        let supervisor = Address::from("s");
        for _ in 0..50 {
            let picked = select_members(&view, &supervisor, &HashSet::new(), 3).unwrap();
            assert_eq!(picked.len(), 3);
            assert!(!picked.contains(&supervisor));
            let distinct: HashSet<_> = picked.iter().collect();
            assert_eq!(distinct.len(), 3);
        }
    }

    #[test]
    fn count_at_or_above_size_is_noop() {
        let view = view_of(&["s", "a"]);
        let supervisor = Address::from("s");
        assert!(select_members(&view, &supervisor, &HashSet::new(), 2).is_none());
        assert!(select_members(&view, &supervisor, &HashSet::new(), 7).is_none());
        assert!(select_members(&view, &supervisor, &HashSet::new(), 0).is_none());
        assert_eq!(
            select_members(&view, &supervisor, &HashSet::new(), 1).unwrap(),
            vec![Address::from("a")]
        );
    }

    #[test]
    fn links_are_never_selected() {
        let view = view_of(&["s", "a", "link"]);
        let supervisor = Address::from("s");
        let links = HashSet::from([Address::from("link")]);
        for _ in 0..20 {
            assert_eq!(
                select_members(&view, &supervisor, &links, 1).unwrap(),
                vec![Address::from("a")]
            );
        }
        // only one member may move, even though the view holds three
        assert!(select_members(&view, &supervisor, &links, 2).is_none());
    }

    #[test]
    fn criteria_evaluate_callbacks() {
        let yes = Fixed {
            int: Some(10),
            flag: Some(true),
        };
        assert!(SplitCriterion::Boolean.selects(&yes).unwrap());
        assert!(SplitCriterion::AtLeast(10).selects(&yes).unwrap());
        assert!(!SplitCriterion::AtLeast(11).selects(&yes).unwrap());
    }

    #[test]
    fn missing_callback_fails_fast() {
        let none = Fixed {
            int: None,
            flag: None,
        };
        assert!(matches!(
            SplitCriterion::Boolean.selects(&none),
            Err(CohortError::NotImplemented {
                callback: "boolean_split_fitness"
            })
        ));
        assert!(matches!(
            SplitCriterion::AtLeast(0).selects(&none),
            Err(CohortError::NotImplemented { .. })
        ));
    }
}
