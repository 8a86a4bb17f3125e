//! Property reconciliation across merge-group members.
//!
//! Numeric, boolean and categorical values are decided by quality-weighted
//! voting; everything else by the configured [`ConflictStrategy`].

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{Entity, EntityId, PropertyValue};

use super::config::{ConflictStrategy, FusionConfig};

/// One member's value for a property.
#[derive(Debug, Clone)]
pub struct Contribution<'a> {
    /// Contributing entity.
    pub entity_id: &'a EntityId,
    /// Its value.
    pub value: &'a PropertyValue,
    /// Vote weight (source quality).
    pub weight: f64,
    /// Member's last update.
    pub updated_at: DateTime<Utc>,
    /// Member's extraction confidence.
    pub confidence: f32,
    /// Member's non-empty property count.
    pub completeness: usize,
}

impl<'a> Contribution<'a> {
    /// Contribution of `entity` for `key`, if it has a non-empty value.
    pub fn of(entity: &'a Entity, key: &str, config: &FusionConfig) -> Option<Self> {
        let value = entity.properties.get(key)?;
        if value.is_empty() {
            return None;
        }
        Some(Self {
            entity_id: &entity.id,
            value,
            weight: source_weight(entity, config),
            updated_at: entity.metadata.updated_at,
            confidence: entity.metadata.confidence,
            completeness: entity.properties.values().map(PropertyValue::completeness).sum(),
        })
    }
}

/// Quality weight of an entity's source: configured map, then the entity's
/// own `source_quality`, then the default.
pub fn source_weight(entity: &Entity, config: &FusionConfig) -> f64 {
    entity
        .metadata
        .source
        .as_ref()
        .and_then(|s| config.source_quality.get(s).copied())
        .or(entity.metadata.source_quality.map(f64::from))
        .unwrap_or(config.default_source_quality)
        .max(0.0)
}

/// Outcome for one property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Resolution {
    /// A single value was chosen.
    Accepted {
        /// Chosen value.
        value: PropertyValue,
        /// Weighted agreement (1.0 for strategy-resolved values).
        agreement: f64,
    },
    /// Voting fell short of the agreement threshold.
    Conflict {
        /// Distinct candidate values, strongest first.
        values: Vec<PropertyValue>,
        /// Best weighted agreement.
        agreement: f64,
    },
}

/// Whether `key` is resolved by voting.
pub fn is_voted(key: &str, contributions: &[Contribution<'_>], config: &FusionConfig) -> bool {
    if config.property_strategies.contains_key(key) {
        return false;
    }
    if config.categorical_properties.iter().any(|p| p == key) {
        return contributions.iter().all(|c| matches!(c.value, PropertyValue::String(_)));
    }
    contributions.iter().all(|c| c.value.is_numeric()) || contributions.iter().all(|c| c.value.as_bool().is_some())
}

/// Resolve a property from its contributions (non-empty, sorted by entity id).
pub fn resolve(key: &str, contributions: &[Contribution<'_>], config: &FusionConfig) -> Option<Resolution> {
    let first = contributions.first()?;
    if contributions.iter().all(|c| c.value == first.value) {
        return Some(Resolution::Accepted {
            value: first.value.clone(),
            agreement: 1.0,
        });
    }
    if is_voted(key, contributions, config) {
        return Some(vote(contributions, config));
    }
    Some(Resolution::Accepted {
        value: apply_strategy(config.strategy_for(key), contributions),
        agreement: 1.0,
    })
}

fn same_vote(a: &PropertyValue, b: &PropertyValue, tolerance: f64) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() <= tolerance * x.abs().max(y.abs()).max(1.0),
        _ => a == b,
    }
}

/// Quality-weighted vote. Numeric values within the relative tolerance of a
/// bucket's first value join that bucket.
pub fn vote(contributions: &[Contribution<'_>], config: &FusionConfig) -> Resolution {
    let mut buckets: Vec<(&PropertyValue, f64)> = Vec::new();
    let mut total = 0.0;
    for c in contributions {
        total += c.weight;
        match buckets
            .iter_mut()
            .find(|(v, _)| same_vote(v, c.value, config.numeric_tolerance))
        {
            Some(bucket) => bucket.1 += c.weight,
            None => buckets.push((c.value, c.weight)),
        }
    }
    // Stable: equal weights keep first-seen (lowest entity id) order.
    buckets.sort_by(|a, b| b.1.total_cmp(&a.1));

    let agreement = match (buckets.first(), total > 0.0) {
        (Some((_, w)), true) => w / total,
        _ => 0.0,
    };
    // Agreement must exceed the threshold; a single bucket has nothing to contest.
    if buckets.len() == 1 || agreement > config.agreement_threshold {
        Resolution::Accepted {
            value: buckets[0].0.clone(),
            agreement,
        }
    } else {
        Resolution::Conflict {
            values: buckets.into_iter().map(|(v, _)| v.clone()).collect(),
            agreement,
        }
    }
}

/// Pick a value by strategy. Ties go to the lowest entity id.
pub fn apply_strategy(strategy: ConflictStrategy, contributions: &[Contribution<'_>]) -> PropertyValue {
    match strategy {
        ConflictStrategy::MostComplete => pick_by(contributions, |a, b| {
            a.completeness
                .cmp(&b.completeness)
                .then(a.value.completeness().cmp(&b.value.completeness()))
        }),
        ConflictStrategy::MostRecent => pick_by(contributions, |a, b| a.updated_at.cmp(&b.updated_at)),
        ConflictStrategy::MostConfident => pick_by(contributions, |a, b| a.confidence.total_cmp(&b.confidence)),
        ConflictStrategy::Longest => {
            pick_by(contributions, |a, b| a.value.display_len().cmp(&b.value.display_len()))
        }
        ConflictStrategy::KeepAll => {
            let mut distinct: Vec<PropertyValue> = Vec::new();
            for c in contributions {
                if !distinct.contains(c.value) {
                    distinct.push(c.value.clone());
                }
            }
            PropertyValue::List(distinct)
        }
    }
}

/// First contribution not beaten by any later one.
fn pick_by<'a, F>(contributions: &[Contribution<'a>], better: F) -> PropertyValue
where
    F: Fn(&Contribution<'a>, &Contribution<'a>) -> Ordering,
{
    let mut best: Option<&Contribution<'a>> = None;
    for c in contributions {
        match best {
            Some(b) if better(c, b) != Ordering::Greater => {}
            _ => best = Some(c),
        }
    }
    best.map(|c| c.value.clone()).unwrap_or(PropertyValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn member(id: &str, source: &str, value: PropertyValue) -> Entity {
        Entity::new(id, "Person", id)
            .with_property("v", value)
            .with_source(source, 0.9)
    }

    fn contributions<'a>(entities: &'a [Entity], config: &FusionConfig) -> Vec<Contribution<'a>> {
        entities.iter().filter_map(|e| Contribution::of(e, "v", config)).collect()
    }

    #[test]
    fn test_quality_weighted_vote_accepts_trusted_value() {
        let config = FusionConfig::default()
            .with_source_quality("registry", 0.9)
            .with_source_quality("forum", 0.2);
        let members = vec![
            member("a", "registry", 42i64.into()),
            member("b", "forum", 41i64.into()),
            member("c", "forum", 40i64.into()),
        ];
        match resolve("v", &contributions(&members, &config), &config).unwrap() {
            Resolution::Accepted { value, agreement } => {
                assert_eq!(value, PropertyValue::Int(42));
                assert!(agreement > 0.6);
            }
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[test]
    fn test_numeric_tolerance_groups_votes() {
        let config = FusionConfig::default();
        let members = vec![
            member("a", "s", 100.0f64.into()),
            member("b", "s", 100.5f64.into()),
            member("c", "s", 250.0f64.into()),
        ];
        match resolve("v", &contributions(&members, &config), &config).unwrap() {
            Resolution::Accepted { value, .. } => assert_eq!(value, PropertyValue::Float(100.0)),
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[test]
    fn test_split_vote_is_a_conflict() {
        let config = FusionConfig::default();
        let members = vec![member("a", "s", true.into()), member("b", "s", false.into())];
        match resolve("v", &contributions(&members, &config), &config).unwrap() {
            Resolution::Conflict { values, agreement } => {
                assert_eq!(values, vec![PropertyValue::Bool(true), PropertyValue::Bool(false)]);
                assert!((agreement - 0.5).abs() < 1e-9);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_agreement_at_threshold_is_a_conflict() {
        let config = FusionConfig {
            agreement_threshold: 0.5,
            ..FusionConfig::default()
        };
        let members = vec![member("a", "s", true.into()), member("b", "s", false.into())];
        match resolve("v", &contributions(&members, &config), &config).unwrap() {
            Resolution::Conflict { agreement, .. } => assert!((agreement - 0.5).abs() < 1e-9),
            other => panic!("expected conflict, got {:?}", other),
        }

        let members = vec![
            member("a", "s", 7i64.into()),
            member("b", "s", 7i64.into()),
            member("c", "s", 9i64.into()),
        ];
        match resolve("v", &contributions(&members, &config), &config).unwrap() {
            Resolution::Accepted { value, .. } => assert_eq!(value, PropertyValue::Int(7)),
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[test]
    fn test_strategies() {
        let config = FusionConfig::default();
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let members = vec![
            member("a", "s", "Springfield".into())
                .with_property("extra", "x")
                .with_updated_at(old),
            Entity::new("b", "Person", "b")
                .with_property("v", "Springfield, IL")
                .with_source("s", 0.99)
                .with_updated_at(new),
        ];
        let c = contributions(&members, &config);
        assert_eq!(apply_strategy(ConflictStrategy::MostComplete, &c), "Springfield".into());
        assert_eq!(apply_strategy(ConflictStrategy::MostRecent, &c), "Springfield, IL".into());
        assert_eq!(apply_strategy(ConflictStrategy::MostConfident, &c), "Springfield, IL".into());
        assert_eq!(apply_strategy(ConflictStrategy::Longest, &c), "Springfield, IL".into());
        assert_eq!(
            apply_strategy(ConflictStrategy::KeepAll, &c),
            PropertyValue::List(vec!["Springfield".into(), "Springfield, IL".into()])
        );
    }
}
