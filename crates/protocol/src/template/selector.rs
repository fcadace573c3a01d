//! Weighted random template selection

use serde::{Deserialize, Serialize};

use super::{TEMPLATE_IDS, TemplateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateWeight {
    pub id: u8,
    pub weight: u32,
}

/// Default distribution, biased toward KCP, PUBG and MOBA
const DEFAULT_WEIGHTS: [(u8, u32); 12] = [
    (1, 10),
    (2, 12),
    (3, 5),
    (4, 7),
    (5, 8),
    (6, 5),
    (7, 12),
    (8, 12),
    (9, 7),
    (10, 6),
    (11, 10),
    (12, 10),
];

pub fn default_weights() -> Vec<TemplateWeight> {
    DEFAULT_WEIGHTS
        .iter()
        .map(|&(id, weight)| TemplateWeight { id, weight })
        .collect()
}

#[derive(Debug, Clone)]
pub struct TemplateSelector {
    weights: Vec<TemplateWeight>,
    total: u64,
}

impl TemplateSelector {
    /// Build a selector; zero-weight entries are dropped
    pub fn new(weights: Vec<TemplateWeight>) -> Result<Self, TemplateError> {
        if let Some(bad) = weights.iter().find(|w| !TEMPLATE_IDS.contains(&w.id)) {
            return Err(TemplateError::UnknownTemplate(bad.id));
        }

        let weights: Vec<_> = weights.into_iter().filter(|w| w.weight > 0).collect();
        let total = weights.iter().map(|w| u64::from(w.weight)).sum::<u64>();
        if total == 0 {
            return Err(TemplateError::NoSelectableTemplate);
        }

        Ok(Self { weights, total })
    }

    /// Draw a template ID
    pub fn select(&self) -> u8 {
        let mut roll = fastrand::u64(0..self.total);
        for w in &self.weights {
            let weight = u64::from(w.weight);
            if roll < weight {
                return w.id;
            }
            roll -= weight;
        }
        // total is the sum of all weights, so the loop always returns
        self.weights[self.weights.len() - 1].id
    }
}

impl TemplateSelector {
    /// Whether `id` can be drawn, i.e. is listed with a non-zero weight
    pub fn allows(&self, id: u8) -> bool {
        self.weights.iter().any(|w| w.id == id)
    }
}

impl Default for TemplateSelector {
    fn default() -> Self {
        let weights = default_weights();
        let total = weights.iter().map(|w| u64::from(w.weight)).sum();
        Self { weights, total }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_zero_weights_never_chosen() {
        let selector = TemplateSelector::new(vec![
            TemplateWeight { id: 2, weight: 1 },
            TemplateWeight { id: 7, weight: 0 },
            TemplateWeight { id: 8, weight: 3 },
        ])
        .unwrap();

        for _ in 0..1000 {
            let id = selector.select();
            assert!(id == 2 || id == 8);
        }
    }

    #[test]
    fn test_all_zero_rejected() {
        let err = TemplateSelector::new(vec![TemplateWeight { id: 1, weight: 0 }]).unwrap_err();
        assert_eq!(err, TemplateError::NoSelectableTemplate);
        assert_eq!(
            TemplateSelector::new(vec![]).unwrap_err(),
            TemplateError::NoSelectableTemplate
        );
    }

    #[test]
    fn test_large_weights_do_not_overflow() {
        let selector = TemplateSelector::new(vec![
            TemplateWeight { id: 1, weight: u32::MAX },
            TemplateWeight { id: 2, weight: u32::MAX },
            TemplateWeight { id: 3, weight: 1 },
        ])
        .unwrap();

        for _ in 0..1000 {
            assert!([1, 2, 3].contains(&selector.select()));
        }
    }

    #[test]
    fn test_allows_only_weighted_ids() {
        let selector = TemplateSelector::new(vec![
            TemplateWeight { id: 2, weight: 4 },
            TemplateWeight { id: 5, weight: 0 },
        ])
        .unwrap();

        assert!(selector.allows(2));
        assert!(!selector.allows(5));
        assert!(!selector.allows(7));
        assert!(TEMPLATE_IDS.all(|id| TemplateSelector::default().allows(id)));
    }

    #[test]
    fn test_unknown_id_rejected() {
        let err = TemplateSelector::new(vec![TemplateWeight { id: 13, weight: 5 }]).unwrap_err();
        assert_eq!(err, TemplateError::UnknownTemplate(13));
    }

    #[test]
    fn test_default_distribution_covers_all() {
        fastrand::seed(7);
        let selector = TemplateSelector::default();
        let mut counts: HashMap<u8, u32> = HashMap::new();
        for _ in 0..20_000 {
            *counts.entry(selector.select()).or_default() += 1;
        }

        assert_eq!(counts.len(), 12);
        // KCP (12) is drawn more often than Generic Gaming (5)
        assert!(counts[&2] > counts[&3]);
    }
}
