//! Unit directory.
//!
//! Every SEI call is made on behalf of a unit. Work items carry a unit
//! label (`SEAD-PI/GAB/ASSESSORIA`), the API wants the numeric unit id, and
//! a process is often visible to more units than the one that created it.

use serde::{Deserialize, Serialize};

/// A unit the logged-in user may act as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    /// Unit label (`Sigla`), segments separated by `/`.
    pub label: String,
}

impl Unit {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }

    fn organ(&self) -> &str {
        organ_of(&self.label)
    }

    fn depth(&self) -> usize {
        self.label.split('/').count()
    }
}

fn organ_of(label: &str) -> &str {
    label.split('/').next().unwrap_or(label)
}

/// Units returned by the login call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitDirectory {
    units: Vec<Unit>,
}

impl UnitDirectory {
    pub fn new(units: Vec<Unit>) -> Self {
        Self { units }
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// The unit for a scope label: exact match first, then the longest
    /// `/`-segment prefix of the label that names a unit.
    pub fn resolve(&self, scope: &str) -> Option<&Unit> {
        let segments: Vec<&str> = scope.split('/').collect();
        (1..=segments.len()).rev().find_map(|n| {
            let prefix = segments[..n].join("/");
            self.units
                .iter()
                .find(|u| u.label.eq_ignore_ascii_case(&prefix))
        })
    }

    /// Unit ids to try for a scope, in order: the resolved unit, the
    /// other units of the same organ (most specific first), then the
    /// fallback unit. No duplicates.
    pub fn candidates(&self, scope: &str, fallback: Option<&str>) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        let mut push = |id: &str| {
            if !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        };

        if let Some(unit) = self.resolve(scope) {
            push(&unit.id);
        }

        let organ = organ_of(scope);
        let mut siblings: Vec<&Unit> = self
            .units
            .iter()
            .filter(|u| u.organ().eq_ignore_ascii_case(organ))
            .collect();
        siblings.sort_by(|a, b| b.depth().cmp(&a.depth()).then_with(|| a.label.cmp(&b.label)));
        for unit in siblings {
            push(&unit.id);
        }

        if let Some(fallback) = fallback {
            push(fallback);
        }
        ids
    }
}
